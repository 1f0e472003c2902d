//! Dependency resolution
//!
//! Depth-first topological sort over declared prerequisite edges. Required
//! edges are hard constraints; soft edges only order hooks that are resolved
//! together and are dropped when they would close a cycle.

use std::collections::{HashMap, HashSet};

use super::error::DependencyError;
use super::table::{HookKey, HookTable};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

struct Walk<'t> {
    table: &'t HookTable,
    nodes: &'t HashSet<HookKey>,
    marks: HashMap<HookKey, Mark>,
    stack: Vec<HookKey>,
    order: Vec<HookKey>,
}

impl Walk<'_> {
    /// Prerequisites of `key` inside the node set, in chain order, tagged required/soft
    fn edges(&self, key: HookKey) -> Vec<(HookKey, bool)> {
        let Some(entry) = self.table.get(key) else {
            return Vec::new();
        };
        let record = &entry.record;

        let required = record
            .requires
            .iter()
            .filter_map(|id| self.table.key_of(id.as_str()))
            .map(|k| (k, true));
        let soft = record
            .prefers
            .iter()
            .filter_map(|id| self.table.key_of(id.as_str()))
            .filter(|k| self.nodes.contains(k))
            .map(|k| (k, false));

        let mut edges: Vec<(HookKey, bool)> = required.chain(soft).collect();
        edges.sort_by_key(|(k, required)| (self.table.get(*k).map(|e| e.order_key()), !*required));
        edges.dedup_by_key(|(k, _)| *k);
        edges
    }

    fn visit(&mut self, key: HookKey) -> Result<(), DependencyError> {
        // Visiting nodes are handled by the caller before recursing
        if self.marks.contains_key(&key) {
            return Ok(());
        }

        self.marks.insert(key, Mark::Visiting);
        self.stack.push(key);

        for (dep, required) in self.edges(key) {
            match self.marks.get(&dep) {
                Some(Mark::Done) => continue,
                Some(Mark::Visiting) if required => return Err(self.cycle_through(dep)),
                Some(Mark::Visiting) => continue,
                None => self.visit(dep)?,
            }
        }

        self.stack.pop();
        self.marks.insert(key, Mark::Done);
        self.order.push(key);
        Ok(())
    }

    fn cycle_through(&self, dep: HookKey) -> DependencyError {
        let start = self.stack.iter().position(|k| *k == dep).unwrap_or(0);
        let mut cycle: Vec<_> = self.stack[start..]
            .iter()
            .filter_map(|k| self.table.get(*k).map(|e| e.id().clone()))
            .collect();
        if let Some(first) = cycle.first().cloned() {
            cycle.push(first);
        }
        DependencyError::CyclicDependency { cycle }
    }
}

/// Requested hooks plus the transitive closure of their required prerequisites
fn closure(table: &HookTable, requested: &[HookKey]) -> Result<HashSet<HookKey>, DependencyError> {
    let mut nodes = HashSet::new();
    let mut pending: Vec<HookKey> = requested.to_vec();

    while let Some(key) = pending.pop() {
        if !nodes.insert(key) {
            continue;
        }
        let Some(entry) = table.get(key) else {
            continue;
        };
        for dep in &entry.record.requires {
            match table.key_of(dep.as_str()) {
                Some(dep_key) => pending.push(dep_key),
                None => {
                    return Err(DependencyError::MissingDependency {
                        hook: entry.id().clone(),
                        dependency: dep.clone(),
                    })
                }
            }
        }
    }

    Ok(nodes)
}

/// Order `requested` and their prerequisites so every prerequisite comes first
///
/// Independent hooks are ordered by descending priority, then registration
/// order. Nothing in the table is modified.
pub(crate) fn resolve(
    table: &HookTable,
    requested: &[HookKey],
) -> Result<Vec<HookKey>, DependencyError> {
    let nodes = closure(table, requested)?;

    let mut walk = Walk {
        table,
        nodes: &nodes,
        marks: HashMap::new(),
        stack: Vec::new(),
        order: Vec::with_capacity(nodes.len()),
    };

    for key in table.sorted(nodes.iter().copied()) {
        if walk.marks.contains_key(&key) {
            continue;
        }
        walk.visit(key)?;
    }

    tracing::debug!("Resolved {} hook(s) into install order", walk.order.len());
    Ok(walk.order)
}

/// Resolve a batch, separating hooks whose dependencies cannot be resolved
///
/// Returns the install order of every resolvable hook (with prerequisites)
/// and the failure for each requested hook that could not be resolved.
pub(crate) fn resolve_batch(
    table: &HookTable,
    requested: &[HookKey],
) -> (Vec<HookKey>, Vec<(HookKey, DependencyError)>) {
    let mut accepted = Vec::new();
    let mut failures = Vec::new();

    for key in table.sorted(requested.iter().copied()) {
        match resolve(table, &[key]) {
            Ok(_) => accepted.push(key),
            Err(err) => failures.push((key, err)),
        }
    }

    match resolve(table, &accepted) {
        Ok(order) => (order, failures),
        // Unreachable in practice: a union of acyclic closures over a fixed graph is acyclic
        Err(err) => {
            failures.extend(accepted.into_iter().map(|key| (key, err.clone())));
            (Vec::new(), failures)
        }
    }
}

/// Hooks in `active` that require `key`, directly or transitively
///
/// Returned in removal order: a hook always precedes the hooks it requires.
pub(crate) fn dependents_of(
    table: &HookTable,
    key: HookKey,
    active: impl Fn(HookKey) -> bool,
) -> Vec<HookKey> {
    let mut found: HashSet<HookKey> = HashSet::new();
    let mut pending = vec![key];

    while let Some(current) = pending.pop() {
        let Some(current_id) = table.get(current).map(|e| e.id().clone()) else {
            continue;
        };
        for (candidate, entry) in table.iter() {
            if candidate == key || found.contains(&candidate) || !active(candidate) {
                continue;
            }
            if entry.record.requires.contains(&current_id) {
                found.insert(candidate);
                pending.push(candidate);
            }
        }
    }

    let requested: Vec<HookKey> = found.iter().copied().collect();
    let mut order = match resolve(table, &requested) {
        Ok(order) => order,
        Err(_) => table.sorted(requested),
    };
    order.retain(|k| found.contains(k));
    order.reverse();
    order
}

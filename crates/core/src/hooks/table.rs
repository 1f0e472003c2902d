//! Hook table: primary storage plus secondary indices
//!
//! The table itself is not synchronized; the orchestrator wraps it in a
//! `RwLock` and only writes while holding the management lock.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

use slotmap::{new_key_type, SlotMap};

use super::error::RegistrationError;
use super::record::{HookEntry, HookInfo, HookRecord};
use super::types::{HookCategory, HookId, HookPriority, HookState, TargetDescriptor};

new_key_type! {
    /// Handle for a table entry
    pub struct HookKey;
}

fn index_insert<K: Hash + Eq>(index: &mut HashMap<K, HashSet<HookKey>>, k: K, key: HookKey) {
    index.entry(k).or_default().insert(key);
}

fn index_remove<K: Hash + Eq>(index: &mut HashMap<K, HashSet<HookKey>>, k: &K, key: HookKey) {
    if let Some(set) = index.get_mut(k) {
        set.remove(&key);
        if set.is_empty() {
            index.remove(k);
        }
    }
}

#[derive(Default)]
pub(crate) struct HookTable {
    entries: SlotMap<HookKey, HookEntry>,
    by_id: HashMap<HookId, HookKey>,
    by_category: HashMap<HookCategory, HashSet<HookKey>>,
    by_priority: HashMap<HookPriority, HashSet<HookKey>>,
    by_state: HashMap<HookState, HashSet<HookKey>>,
    by_target: HashMap<TargetDescriptor, HashSet<HookKey>>,
    next_sequence: u64,
}

impl HookTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Insert a validated record
    ///
    /// Fails with `DuplicateId` or `CapacityExceeded`; target validation and
    /// exclusions are checked by the caller before this point.
    pub fn insert(
        &mut self,
        record: HookRecord,
        max_hooks: usize,
        now_ns: u64,
    ) -> Result<HookKey, RegistrationError> {
        if self.by_id.contains_key(&record.id) {
            return Err(RegistrationError::DuplicateId(record.id));
        }
        if self.entries.len() >= max_hooks {
            return Err(RegistrationError::CapacityExceeded { max: max_hooks });
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;

        let id = record.id.clone();
        let category = record.category;
        let priority = record.priority;
        let target = record.target.clone();

        let key = self
            .entries
            .insert(HookEntry::new(record, sequence, now_ns));

        self.by_id.insert(id, key);
        index_insert(&mut self.by_category, category, key);
        index_insert(&mut self.by_priority, priority, key);
        index_insert(&mut self.by_state, HookState::Uninstalled, key);
        index_insert(&mut self.by_target, target, key);

        Ok(key)
    }

    /// Erase an UNINSTALLED entry
    pub fn remove(&mut self, id: &str) -> Result<HookEntry, RegistrationError> {
        let key = *self
            .by_id
            .get(id)
            .ok_or_else(|| RegistrationError::NotFound(HookId::new(id)))?;

        let state = self.entries[key].state;
        if state != HookState::Uninstalled {
            return Err(RegistrationError::InUse {
                id: HookId::new(id),
                state,
            });
        }

        let entry = self
            .entries
            .remove(key)
            .ok_or_else(|| RegistrationError::NotFound(HookId::new(id)))?;

        self.by_id.remove(id);
        index_remove(&mut self.by_category, &entry.record.category, key);
        index_remove(&mut self.by_priority, &entry.record.priority, key);
        index_remove(&mut self.by_state, &entry.state, key);
        index_remove(&mut self.by_target, &entry.record.target, key);

        Ok(entry)
    }

    pub fn key_of(&self, id: &str) -> Option<HookKey> {
        self.by_id.get(id).copied()
    }

    pub fn get(&self, key: HookKey) -> Option<&HookEntry> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: HookKey) -> Option<&mut HookEntry> {
        self.entries.get_mut(key)
    }

    pub fn get_by_id(&self, id: &str) -> Option<&HookEntry> {
        self.key_of(id).and_then(|key| self.entries.get(key))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (HookKey, &HookEntry)> {
        self.entries.iter()
    }

    /// Move an entry along a state machine edge
    ///
    /// Returns the current state as the error if the edge does not exist.
    pub fn transition(&mut self, key: HookKey, next: HookState) -> Result<HookState, HookState> {
        let Some(entry) = self.entries.get_mut(key) else {
            return Err(HookState::Uninstalled);
        };

        let previous = entry.state;
        if !previous.can_transition_to(next) {
            return Err(previous);
        }

        entry.state = next;
        index_remove(&mut self.by_state, &previous, key);
        index_insert(&mut self.by_state, next, key);

        tracing::trace!("Hook '{}': {} -> {}", entry.record.id, previous, next);
        Ok(previous)
    }

    /// Keys sorted by chain order (priority descending, registration ascending)
    pub fn sorted(&self, keys: impl IntoIterator<Item = HookKey>) -> Vec<HookKey> {
        let mut keys: Vec<HookKey> = keys
            .into_iter()
            .filter(|key| self.entries.contains_key(*key))
            .collect();
        keys.sort_by_key(|key| self.entries[*key].order_key());
        keys.dedup();
        keys
    }

    fn infos(&self, keys: Option<&HashSet<HookKey>>) -> Vec<HookInfo> {
        match keys {
            Some(keys) => self
                .sorted(keys.iter().copied())
                .into_iter()
                .map(|key| self.entries[key].info())
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn keys_by_category(&self, category: HookCategory) -> Vec<HookKey> {
        self.sorted(self.by_category.get(&category).into_iter().flatten().copied())
    }

    pub fn keys_by_priority(&self, priority: HookPriority) -> Vec<HookKey> {
        self.sorted(self.by_priority.get(&priority).into_iter().flatten().copied())
    }

    pub fn all_keys(&self) -> Vec<HookKey> {
        self.sorted(self.entries.keys())
    }

    pub fn by_category(&self, category: HookCategory) -> Vec<HookInfo> {
        self.infos(self.by_category.get(&category))
    }

    pub fn by_priority(&self, priority: HookPriority) -> Vec<HookInfo> {
        self.infos(self.by_priority.get(&priority))
    }

    pub fn by_state(&self, state: HookState) -> Vec<HookInfo> {
        self.infos(self.by_state.get(&state))
    }

    pub fn by_target(&self, target: &TargetDescriptor) -> Vec<HookInfo> {
        self.infos(self.by_target.get(target))
    }

    pub fn by_module(&self, module: &str) -> Vec<HookInfo> {
        self.filtered(|entry| {
            entry
                .record
                .target
                .module()
                .is_some_and(|m| m.eq_ignore_ascii_case(module))
        })
    }

    pub fn by_function(&self, function: &str) -> Vec<HookInfo> {
        self.filtered(|entry| entry.record.target.function() == Some(function))
    }

    pub fn all(&self) -> Vec<HookInfo> {
        self.filtered(|_| true)
    }

    fn filtered(&self, pred: impl Fn(&HookEntry) -> bool) -> Vec<HookInfo> {
        self.all_keys()
            .into_iter()
            .map(|key| &self.entries[key])
            .filter(|entry| pred(entry))
            .map(HookEntry::info)
            .collect()
    }

    pub fn count_by_category(&self, category: HookCategory) -> usize {
        self.by_category.get(&category).map_or(0, HashSet::len)
    }

    pub fn count_by_priority(&self, priority: HookPriority) -> usize {
        self.by_priority.get(&priority).map_or(0, HashSet::len)
    }
}

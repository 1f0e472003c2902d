//! Conflict detection between hooks competing for a call site

use serde::{Deserialize, Serialize};

use super::error::ConflictError;
use super::table::{HookKey, HookTable};
use super::types::HookId;

/// How hooks sharing an identical target are reconciled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SameTargetPolicy {
    /// Coexist in one priority-ordered chain
    #[default]
    Chain,

    /// The later install fails
    Reject,

    /// Lower-priority installed hooks are removed to make room
    Preempt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    SameTarget,
    Explicit,
    Capacity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    Chained,
    Rejected,
    Preempted,
}

/// One detected conflict, kept for observability
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRecord {
    /// Hook being installed
    pub hook_id: HookId,
    /// Installed hook it collided with
    pub other_id: HookId,
    pub kind: ConflictKind,
    pub resolution: ConflictResolution,
    pub detected_at_ns: u64,
    pub resolved_at_ns: u64,
}

impl ConflictRecord {
    pub fn involves(&self, id: &str) -> bool {
        self.hook_id.as_str() == id || self.other_id.as_str() == id
    }
}

/// What the installer must do after detection
#[derive(Debug)]
pub(crate) enum Outcome {
    Proceed,
    /// Remove these installed hooks first
    Preempt(Vec<HookKey>),
    Reject(ConflictError),
}

#[derive(Debug)]
pub(crate) struct Detection {
    pub records: Vec<ConflictRecord>,
    pub outcome: Outcome,
}

/// Detect conflicts for installing `key` against every active hook
pub(crate) fn detect(
    table: &HookTable,
    key: HookKey,
    policy: SameTargetPolicy,
    max_chain_length: usize,
    now_ns: u64,
) -> Detection {
    let mut records = Vec::new();
    let mut rejection: Option<ConflictError> = None;
    let mut victims = Vec::new();
    let mut chain_len = 0usize;

    let Some(entry) = table.get(key) else {
        return Detection {
            records,
            outcome: Outcome::Proceed,
        };
    };
    let id = entry.id();
    let record = &entry.record;

    let mut note = |other: &HookId, kind, resolution| {
        records.push(ConflictRecord {
            hook_id: id.clone(),
            other_id: other.clone(),
            kind,
            resolution,
            detected_at_ns: now_ns,
            resolved_at_ns: now_ns,
        });
    };

    for other_key in table.all_keys() {
        if other_key == key {
            continue;
        }
        let Some(other) = table.get(other_key) else {
            continue;
        };
        if !other.state.is_active() {
            continue;
        }

        let explicit =
            record.conflicts.contains(other.id()) || other.record.conflicts.contains(id);
        if explicit {
            note(other.id(), ConflictKind::Explicit, ConflictResolution::Rejected);
            rejection.get_or_insert_with(|| ConflictError::RejectedConflict {
                hook: id.clone(),
                existing: other.id().clone(),
            });
            continue;
        }

        if !record.target.overlaps(&other.record.target) {
            continue;
        }

        // Overlapping but distinct ranges cannot share one trampoline
        let identical = record.target == other.record.target;
        let resolution = match policy {
            SameTargetPolicy::Chain if identical => ConflictResolution::Chained,
            SameTargetPolicy::Preempt if identical && other.record.priority < record.priority => {
                ConflictResolution::Preempted
            }
            _ => ConflictResolution::Rejected,
        };

        note(other.id(), ConflictKind::SameTarget, resolution);
        match resolution {
            ConflictResolution::Chained => chain_len += 1,
            ConflictResolution::Preempted => victims.push(other_key),
            ConflictResolution::Rejected => {
                rejection.get_or_insert_with(|| ConflictError::RejectedConflict {
                    hook: id.clone(),
                    existing: other.id().clone(),
                });
            }
        }
    }

    if rejection.is_none() && chain_len >= max_chain_length {
        // Report against the lowest-priority member of the full chain
        let last = table
            .all_keys()
            .into_iter()
            .filter(|k| *k != key)
            .filter_map(|k| table.get(k))
            .filter(|e| e.state.is_active() && e.record.target == record.target)
            .last()
            .map(|e| e.id().clone());
        if let Some(last) = last {
            note(&last, ConflictKind::Capacity, ConflictResolution::Rejected);
        }
        rejection = Some(ConflictError::ChainFull {
            hook: id.clone(),
            target: record.target.clone(),
            max: max_chain_length,
        });
    }

    let outcome = match rejection {
        Some(err) => Outcome::Reject(err),
        None if !victims.is_empty() => Outcome::Preempt(victims),
        None => Outcome::Proceed,
    };

    if !records.is_empty() {
        tracing::debug!("Hook '{}': {} conflict(s) detected", id, records.len());
    }

    Detection { records, outcome }
}

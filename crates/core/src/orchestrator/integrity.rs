//! Trampoline integrity checks
//!
//! A mismatch means something else rewrote a patched call site. It is
//! counted, logged and recorded in the error history; nothing is repaired.

use crate::hooks::error::{HookError, ManageResult, RemovalError};
use crate::hooks::stats::GlobalCounter;
use crate::hooks::{HookId, TargetDescriptor};

use super::Orchestrator;

impl Orchestrator {
    /// Whether the patch under `id` is still the one this orchestrator installed
    pub fn check_integrity(&self, id: &str) -> ManageResult<bool> {
        let target = {
            let table = self.table.read();
            let entry = table
                .get_by_id(id)
                .ok_or_else(|| HookError::NotFound(HookId::new(id)))?;
            if !entry.state.is_active() {
                return Err(RemovalError::NotInstalled(entry.id().clone()).into());
            }
            entry.record.target.clone()
        };

        let intact = self.verify_target(&target);
        if !intact {
            self.note_error(Some(id), format!("Integrity mismatch on {}", target));
        }
        Ok(intact)
    }

    /// Verify every patched target, returning the hooks on mismatched ones
    pub fn check_all_integrity(&self) -> Vec<HookId> {
        let targets: Vec<TargetDescriptor> =
            self.slots.iter().map(|slot| slot.key().clone()).collect();

        let mut mismatched = Vec::new();
        for target in targets {
            if self.verify_target(&target) {
                continue;
            }
            let hooks: Vec<HookId> = self
                .hooks_by_target(&target)
                .into_iter()
                .filter(|info| info.state.is_active())
                .map(|info| info.id)
                .collect();
            for id in &hooks {
                self.note_error(Some(id.as_str()), format!("Integrity mismatch on {}", target));
            }
            mismatched.extend(hooks);
        }

        if mismatched.is_empty() {
            tracing::debug!("Integrity check passed for all patched targets");
        }
        mismatched
    }

    fn verify_target(&self, target: &TargetDescriptor) -> bool {
        self.shared.stats.bump(GlobalCounter::IntegrityCheck);
        let intact = match self.port.verify(target) {
            Ok(intact) => intact,
            Err(err) => {
                tracing::warn!("Could not verify {}: {}", target, err);
                false
            }
        };
        if !intact {
            self.shared.stats.bump(GlobalCounter::IntegrityMismatch);
            tracing::warn!("Integrity mismatch on {}", target);
        }
        intact
    }
}

//! Batch operations
//!
//! A batch install is a scoped transaction: hooks are installed in resolved
//! order and failures are collected, except that a critical hook's failure
//! rolls back what the batch installed and skips the remainder.

use crate::hooks::error::{BatchError, HookError};
use crate::hooks::resolver;
use crate::hooks::stats::GlobalCounter;
use crate::hooks::table::{HookKey, HookTable};
use crate::hooks::{HookCategory, HookId, HookPriority};

use super::{Orchestrator, PendingCleanups, RemoveFlags};

type BatchResult = Result<Vec<HookId>, BatchError>;

impl BatchError {
    fn empty() -> Self {
        Self {
            failures: Vec::new(),
            completed: Vec::new(),
            aborted_by: None,
        }
    }
}

impl Orchestrator {
    /// Install every registered hook that is not installed
    pub fn install_all(&self) -> BatchResult {
        self.install_batch(HookTable::all_keys)
    }

    pub fn install_by_category(&self, category: HookCategory) -> BatchResult {
        self.install_batch(|table| table.keys_by_category(category))
    }

    pub fn install_by_priority(&self, priority: HookPriority) -> BatchResult {
        self.install_batch(|table| table.keys_by_priority(priority))
    }

    /// Remove every installed hook
    pub fn remove_all(&self, flags: RemoveFlags) -> BatchResult {
        self.remove_batch(HookTable::all_keys, flags)
    }

    pub fn remove_by_category(&self, category: HookCategory, flags: RemoveFlags) -> BatchResult {
        self.remove_batch(|table| table.keys_by_category(category), flags)
    }

    pub fn remove_by_priority(&self, priority: HookPriority, flags: RemoveFlags) -> BatchResult {
        self.remove_batch(|table| table.keys_by_priority(priority), flags)
    }

    /// Enable every hook, returning how many flags changed
    pub fn enable_all(&self) -> usize {
        self.set_all_enabled(true)
    }

    /// Disable every hook, returning how many flags changed
    pub fn disable_all(&self) -> usize {
        self.set_all_enabled(false)
    }

    /// Remove every installed hook in reverse dependency order
    #[tracing::instrument(skip(self))]
    pub fn shutdown(&self) -> Result<(), BatchError> {
        tracing::info!("Shutting down hook orchestrator");
        let removed = self.remove_all(RemoveFlags::CASCADE)?;
        tracing::info!("Hook orchestrator shut down ({} hook(s) removed)", removed.len());
        Ok(())
    }

    fn set_all_enabled(&self, enabled: bool) -> usize {
        let _op = self.op_lock.lock();
        let ids: Vec<HookId> = {
            let table = self.table.read();
            table
                .all_keys()
                .into_iter()
                .filter_map(|k| table.get(k).map(|e| e.id().clone()))
                .collect()
        };
        ids.iter()
            .filter(|id| matches!(self.set_enabled(id, enabled), Ok(true)))
            .count()
    }

    fn install_batch(&self, select: impl FnOnce(&HookTable) -> Vec<HookKey>) -> BatchResult {
        let mut cleanups = PendingCleanups::default();
        let result = {
            let _op = self.op_lock.lock();
            self.drain_faults();
            self.install_batch_locked(select, &mut cleanups)
        };
        cleanups.run(self);
        self.finish_batch(result)
    }

    fn install_batch_locked(
        &self,
        select: impl FnOnce(&HookTable) -> Vec<HookKey>,
        cleanups: &mut PendingCleanups,
    ) -> BatchResult {
        let (order, unresolved) = {
            let table = self.table.read();
            let requested: Vec<HookKey> = select(&table)
                .into_iter()
                .filter(|k| table.get(*k).is_some_and(|e| e.state.is_installable()))
                .collect();

            let (order, failures) = resolver::resolve_batch(&table, &requested);
            let order: Vec<(HookId, bool)> = order
                .into_iter()
                .filter_map(|k| table.get(k).map(|e| (e.id().clone(), e.record.critical)))
                .collect();
            let unresolved: Vec<(HookId, bool, HookError)> = failures
                .into_iter()
                .filter_map(|(k, err)| {
                    table
                        .get(k)
                        .map(|e| (e.id().clone(), e.record.critical, HookError::from(err)))
                })
                .collect();
            (order, unresolved)
        };
        self.shared.stats.bump(GlobalCounter::DependencyResolution);

        let mut batch = BatchError::empty();
        for (id, critical, err) in unresolved {
            if critical && batch.aborted_by.is_none() {
                batch.aborted_by = Some(id.clone());
            }
            batch.failures.push((id, err));
        }
        if let Some(critical) = &batch.aborted_by {
            // Nothing has been patched yet; the whole batch is refused
            tracing::warn!(
                "Batch install aborted: critical hook '{}' has unresolved dependencies",
                critical
            );
            return Err(batch);
        }

        tracing::debug!("Batch install of {} hook(s)", order.len());
        for (id, critical) in order {
            // Shared prerequisites may already have been installed outside the batch
            if self.is_installed(id.as_str()) {
                continue;
            }
            match self.install_one(&id, cleanups) {
                Ok(()) => batch.completed.push(id),
                Err(err) => {
                    tracing::warn!("Batch install of '{}' failed: {}", id, err);
                    batch.failures.push((id.clone(), err));
                    if critical {
                        batch.aborted_by = Some(id);
                        break;
                    }
                }
            }
        }

        if let Some(critical) = batch.aborted_by.clone() {
            tracing::warn!(
                "Critical hook '{}' failed, rolling back {} install(s)",
                critical,
                batch.completed.len()
            );
            let installed = std::mem::take(&mut batch.completed);
            let failures = self.roll_back(installed, cleanups);
            batch.failures.extend(failures);
        }

        if batch.failures.is_empty() {
            Ok(batch.completed)
        } else {
            Err(batch)
        }
    }

    /// Undo `installed` in reverse install order, returning what could not be removed
    pub(super) fn roll_back(
        &self,
        installed: Vec<HookId>,
        cleanups: &mut PendingCleanups,
    ) -> Vec<(HookId, HookError)> {
        installed
            .into_iter()
            .rev()
            .filter_map(|id| {
                self.remove_one(&id, RemoveFlags::empty(), cleanups)
                    .err()
                    .map(|err| (id, err))
            })
            .collect()
    }

    fn remove_batch(
        &self,
        select: impl FnOnce(&HookTable) -> Vec<HookKey>,
        flags: RemoveFlags,
    ) -> BatchResult {
        let mut cleanups = PendingCleanups::default();
        let result = {
            let _op = self.op_lock.lock();
            self.drain_faults();
            self.remove_batch_locked(select, flags, &mut cleanups)
        };
        cleanups.run(self);
        self.finish_batch(result)
    }

    fn remove_batch_locked(
        &self,
        select: impl FnOnce(&HookTable) -> Vec<HookKey>,
        flags: RemoveFlags,
        cleanups: &mut PendingCleanups,
    ) -> BatchResult {
        let ids: Vec<HookId> = {
            let table = self.table.read();
            let active: Vec<HookKey> = select(&table)
                .into_iter()
                .filter(|k| table.get(*k).is_some_and(|e| e.state.is_active()))
                .collect();

            // Dependents before their prerequisites
            let mut order = resolver::resolve(&table, &active)
                .unwrap_or_else(|_| table.sorted(active.clone()));
            order.retain(|k| active.contains(k));
            order.reverse();
            order
                .into_iter()
                .filter_map(|k| table.get(k).map(|e| e.id().clone()))
                .collect()
        };

        let mut batch = BatchError::empty();
        for id in ids {
            // Already taken out by an earlier cascade
            if !self.is_installed(id.as_str()) {
                continue;
            }
            match self.remove_locked(&id, flags, cleanups) {
                Ok(removed) => batch.completed.extend(removed),
                Err(err) => batch.failures.push((id, err)),
            }
        }

        if batch.failures.is_empty() {
            Ok(batch.completed)
        } else {
            Err(batch)
        }
    }

    fn finish_batch(&self, result: BatchResult) -> BatchResult {
        if let Err(batch) = &result {
            for (id, err) in &batch.failures {
                self.note_error(Some(id.as_str()), err.to_string());
            }
        }
        result
    }
}

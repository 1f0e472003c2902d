//! Single-hook state machine transitions

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use crate::hooks::conflict::{self, ConflictKind, ConflictRecord, ConflictResolution, Outcome};
use crate::hooks::dispatch::{ChainLink, TargetSlot};
use crate::hooks::error::{
    ConflictError, DependencyError, HookError, InstallError, ManageResult, RemovalError,
};
use crate::hooks::resolver;
use crate::hooks::stats::GlobalCounter;
use crate::hooks::table::{HookKey, HookTable};
use crate::hooks::{HookId, HookState};

use super::{Orchestrator, PendingCleanups, RemoveFlags};

fn key_of(table: &HookTable, id: &HookId) -> ManageResult<HookKey> {
    table
        .key_of(id.as_str())
        .ok_or_else(|| HookError::NotFound(id.clone()))
}

fn transition(
    table: &mut HookTable,
    key: HookKey,
    id: &HookId,
    next: HookState,
) -> ManageResult<()> {
    table
        .transition(key, next)
        .map(|_| ())
        .map_err(|state| {
            InstallError::InvalidState {
                id: id.clone(),
                state,
            }
            .into()
        })
}

impl Orchestrator {
    /// Install a hook and any required prerequisites not yet installed
    #[tracing::instrument(skip(self))]
    pub fn install(&self, id: &str) -> ManageResult<()> {
        let mut cleanups = PendingCleanups::default();
        let result = {
            let _op = self.op_lock.lock();
            self.drain_faults();
            self.install_locked(&HookId::new(id), &mut cleanups)
        };
        cleanups.run(self);
        self.finish(id, result)
    }

    fn install_locked(&self, id: &HookId, cleanups: &mut PendingCleanups) -> ManageResult<()> {
        let (key, order) = {
            let table = self.table.read();
            let key = key_of(&table, id)?;
            let state = table.get(key).map_or(HookState::Uninstalled, |e| e.state);
            if state.is_active() {
                return Err(InstallError::AlreadyInstalled(id.clone()).into());
            }
            if !state.is_installable() {
                return Err(InstallError::InvalidState {
                    id: id.clone(),
                    state,
                }
                .into());
            }
            (key, resolver::resolve(&table, &[key]))
        };
        self.shared.stats.bump(GlobalCounter::DependencyResolution);
        let order = order?;

        // Prerequisites installed by this call, undone if the hook itself fails
        let mut installed = Vec::new();
        for dep in order {
            if dep == key {
                continue;
            }
            let (dep_id, active) = {
                let table = self.table.read();
                match table.get(dep) {
                    Some(entry) => (entry.id().clone(), entry.state.is_active()),
                    None => continue,
                }
            };
            if active {
                continue;
            }
            tracing::debug!("Installing prerequisite '{}' for '{}'", dep_id, id);
            if let Err(err) = self.install_one(&dep_id, cleanups) {
                self.note_error(Some(dep_id.as_str()), err.to_string());
                self.roll_back_prerequisites(id, installed, cleanups);
                return Err(DependencyError::PrerequisiteFailed {
                    hook: id.clone(),
                    prerequisite: dep_id,
                    reason: err.to_string(),
                }
                .into());
            }
            installed.push(dep_id);
        }

        let result = self.install_one(id, cleanups);
        if result.is_err() {
            self.roll_back_prerequisites(id, installed, cleanups);
        }
        result
    }

    fn roll_back_prerequisites(
        &self,
        id: &HookId,
        installed: Vec<HookId>,
        cleanups: &mut PendingCleanups,
    ) {
        if installed.is_empty() {
            return;
        }
        tracing::warn!(
            "Install of '{}' failed, rolling back {} prerequisite(s)",
            id,
            installed.len()
        );
        for (dep, err) in self.roll_back(installed, cleanups) {
            self.note_error(Some(dep.as_str()), err.to_string());
        }
    }

    /// Install exactly one hook whose prerequisites are already installed
    pub(super) fn install_one(
        &self,
        id: &HookId,
        cleanups: &mut PendingCleanups,
    ) -> ManageResult<()> {
        let (policy, max_chain_length) = {
            let config = self.config.read();
            (config.same_target_policy, config.max_chain_length)
        };
        let now = self.now_ns();

        let (key, link, target, detection) = {
            let table = self.table.read();
            let key = key_of(&table, id)?;
            let Some(entry) = table.get(key) else {
                return Err(HookError::NotFound(id.clone()));
            };
            if entry.state.is_active() {
                return Err(InstallError::AlreadyInstalled(id.clone()).into());
            }
            if !entry.state.is_installable() {
                return Err(InstallError::InvalidState {
                    id: id.clone(),
                    state: entry.state,
                }
                .into());
            }

            for dep in &entry.record.requires {
                let installed = table
                    .get_by_id(dep.as_str())
                    .is_some_and(|d| d.state.is_active());
                if !installed {
                    return Err(DependencyError::PrerequisiteFailed {
                        hook: id.clone(),
                        prerequisite: dep.clone(),
                        reason: "prerequisite is not installed".to_string(),
                    }
                    .into());
                }
            }

            let detection = conflict::detect(&table, key, policy, max_chain_length, now);
            let link = ChainLink {
                key,
                id: id.clone(),
                priority: entry.record.priority,
                sequence: entry.sequence,
                enabled: Arc::clone(&entry.enabled),
                callback: Arc::clone(&entry.record.callback),
                stats: Arc::clone(&entry.stats),
            };
            (key, link, entry.record.target.clone(), detection)
        };

        self.log_conflicts(detection.records);
        match detection.outcome {
            Outcome::Proceed => {}
            Outcome::Reject(err) => return Err(err.into()),
            Outcome::Preempt(victims) => {
                for victim in victims {
                    let (victim_id, has_dependents) = {
                        let table = self.table.read();
                        let Some(entry) = table.get(victim) else {
                            continue;
                        };
                        let dependents = resolver::dependents_of(&table, victim, |k| {
                            table.get(k).is_some_and(|e| e.state.is_active())
                        });
                        (entry.id().clone(), !dependents.is_empty())
                    };
                    if has_dependents {
                        return Err(ConflictError::RejectedConflict {
                            hook: id.clone(),
                            existing: victim_id,
                        }
                        .into());
                    }
                    self.remove_one(&victim_id, RemoveFlags::empty(), cleanups)?;
                    tracing::info!("Hook '{}' preempted lower-priority hook '{}'", id, victim_id);
                }
            }
        }

        transition(&mut self.table.write(), key, id, HookState::Installing)?;
        let started = Instant::now();

        let existing = self.slots.get(&target).map(|slot| Arc::clone(slot.value()));
        let patched = match existing {
            Some(slot) => {
                slot.insert(link);
                Ok(())
            }
            None => {
                let slot = TargetSlot::new(target.clone(), Arc::clone(&self.shared));
                slot.insert(link);
                match self.port.install(&target, slot.entry()) {
                    Ok(original) => {
                        slot.set_original(Some(original));
                        self.slots.insert(target.clone(), slot);
                        Ok(())
                    }
                    Err(err) => Err(err),
                }
            }
        };

        let mut table = self.table.write();
        match patched {
            Ok(()) => {
                self.shared
                    .stats
                    .add_install_time(started.elapsed().as_nanos() as u64);
                transition(&mut table, key, id, HookState::Installed)?;

                let enabled = match table.get_mut(key) {
                    Some(entry) => {
                        entry.installed_at_ns = Some(self.now_ns());
                        entry.install_sequence =
                            Some(self.install_sequence.fetch_add(1, Ordering::Relaxed));
                        entry.last_error = None;
                        entry.is_enabled()
                    }
                    None => true,
                };
                if !enabled {
                    transition(&mut table, key, id, HookState::Disabled)?;
                }

                self.shared.stats.bump(GlobalCounter::Installed);
                tracing::info!("Installed hook '{}' on {}", id, target);
                Ok(())
            }
            Err(source) => {
                transition(&mut table, key, id, HookState::Failed)?;
                if let Some(entry) = table.get_mut(key) {
                    entry.last_error = Some(source.to_string());
                }
                self.shared.stats.bump(GlobalCounter::Failed);
                tracing::error!("Failed to install hook '{}' on {}: {}", id, target, source);
                Err(InstallError::TrampolineFailure { target, source }.into())
            }
        }
    }

    /// Settle a rejected conflict in favour of `hook`
    ///
    /// `existing` is removed if still installed (its dependents must already
    /// be gone) and `hook` installed in its place. If `hook` still cannot
    /// install, `existing` is put back. Capacity conflicts cannot be resolved
    /// this way.
    #[tracing::instrument(skip(self))]
    pub fn resolve_conflict(&self, hook: &str, existing: &str) -> ManageResult<()> {
        let mut cleanups = PendingCleanups::default();
        let result = {
            let _op = self.op_lock.lock();
            self.drain_faults();
            self.resolve_conflict_locked(&HookId::new(hook), &HookId::new(existing), &mut cleanups)
        };
        cleanups.run(self);
        self.finish(hook, result)
    }

    fn resolve_conflict_locked(
        &self,
        hook: &HookId,
        existing: &HookId,
        cleanups: &mut PendingCleanups,
    ) -> ManageResult<()> {
        let rejected = self
            .conflicts
            .lock()
            .iter()
            .rev()
            .find(|r| {
                r.hook_id == *hook
                    && r.other_id == *existing
                    && r.resolution == ConflictResolution::Rejected
                    && r.kind != ConflictKind::Capacity
            })
            .map(|r| (r.kind, r.detected_at_ns));
        let Some((kind, detected_at_ns)) = rejected else {
            return Err(ConflictError::NoSuchConflict {
                hook: hook.clone(),
                existing: existing.clone(),
            }
            .into());
        };

        let blocking = self.is_installed(existing.as_str());
        if blocking {
            self.remove_locked(existing, RemoveFlags::empty(), cleanups)?;
        }

        match self.install_locked(hook, cleanups) {
            Ok(()) => {
                self.log_conflicts(vec![ConflictRecord {
                    hook_id: hook.clone(),
                    other_id: existing.clone(),
                    kind,
                    resolution: ConflictResolution::Preempted,
                    detected_at_ns,
                    resolved_at_ns: self.now_ns(),
                }]);
                tracing::info!("Conflict resolved: '{}' replaces '{}'", hook, existing);
                Ok(())
            }
            Err(err) => {
                if blocking {
                    if let Err(restore) = self.install_locked(existing, cleanups) {
                        self.note_error(Some(existing.as_str()), restore.to_string());
                    }
                }
                Err(err)
            }
        }
    }

    /// Remove an installed hook
    pub fn remove(&self, id: &str) -> ManageResult<()> {
        self.remove_with(id, RemoveFlags::empty())
    }

    /// Remove an installed hook with explicit flags
    #[tracing::instrument(skip(self))]
    pub fn remove_with(&self, id: &str, flags: RemoveFlags) -> ManageResult<()> {
        let mut cleanups = PendingCleanups::default();
        let result = {
            let _op = self.op_lock.lock();
            self.drain_faults();
            self.remove_locked(&HookId::new(id), flags, &mut cleanups)
                .map(|_| ())
        };
        cleanups.run(self);
        self.finish(id, result)
    }

    /// Remove `id`, cascading to dependents if `flags` allow
    ///
    /// Returns every removed hook, dependents first.
    pub(super) fn remove_locked(
        &self,
        id: &HookId,
        flags: RemoveFlags,
        cleanups: &mut PendingCleanups,
    ) -> ManageResult<Vec<HookId>> {
        let dependents = {
            let table = self.table.read();
            let key = key_of(&table, id)?;
            let active = table.get(key).is_some_and(|e| e.state.is_active());
            if !active {
                return Err(RemovalError::NotInstalled(id.clone()).into());
            }
            resolver::dependents_of(&table, key, |k| {
                table.get(k).is_some_and(|e| e.state.is_active())
            })
            .into_iter()
            .filter_map(|k| table.get(k).map(|e| e.id().clone()))
            .collect::<Vec<_>>()
        };

        let mut removed = Vec::with_capacity(dependents.len() + 1);
        if !dependents.is_empty() {
            if !flags.contains(RemoveFlags::CASCADE) {
                return Err(RemovalError::DependentsStillInstalled {
                    hook: id.clone(),
                    dependents,
                }
                .into());
            }
            for dependent in dependents {
                tracing::debug!("Cascading removal of '{}' before '{}'", dependent, id);
                self.remove_one(&dependent, flags, cleanups)?;
                removed.push(dependent);
            }
        }

        self.remove_one(id, flags, cleanups)?;
        removed.push(id.clone());
        Ok(removed)
    }

    /// Take one installed hook out of its chain, unpatching the target if it was the last
    pub(super) fn remove_one(
        &self,
        id: &HookId,
        flags: RemoveFlags,
        cleanups: &mut PendingCleanups,
    ) -> ManageResult<()> {
        let started = Instant::now();

        let (key, target, cleanup) = {
            let mut table = self.table.write();
            let key = key_of(&table, id)?;
            let state = table.get(key).map_or(HookState::Uninstalled, |e| e.state);
            match state {
                HookState::Installed => {}
                HookState::Disabled => transition(&mut table, key, id, HookState::Installed)?,
                _ => return Err(RemovalError::NotInstalled(id.clone()).into()),
            }
            transition(&mut table, key, id, HookState::Removing)?;

            let Some(entry) = table.get(key) else {
                return Err(HookError::NotFound(id.clone()));
            };
            (key, entry.record.target.clone(), entry.record.cleanup.clone())
        };

        let mut port_error = None;
        let slot = self.slots.get(&target).map(|slot| Arc::clone(slot.value()));
        if let Some(slot) = slot {
            slot.remove(key);
            if slot.is_empty() {
                match self.port.remove(&target) {
                    Ok(()) => {
                        self.slots.remove(&target);
                    }
                    Err(err) => {
                        // The slot stays patched with an empty chain and passes calls through
                        tracing::error!(
                            "Failed to restore {} after removing '{}': {}",
                            target,
                            id,
                            err
                        );
                        port_error = Some(err);
                    }
                }
            }
        }

        {
            let mut table = self.table.write();
            transition(&mut table, key, id, HookState::Uninstalled)?;
            if let Some(entry) = table.get_mut(key) {
                entry.installed_at_ns = None;
                entry.install_sequence = None;
                entry.last_error = port_error.as_ref().map(ToString::to_string);
            }
        }

        self.shared
            .stats
            .add_removal_time(started.elapsed().as_nanos() as u64);
        self.shared.stats.bump(GlobalCounter::Removed);

        if !flags.contains(RemoveFlags::SKIP_CLEANUP) {
            if let Some(cleanup) = cleanup {
                cleanups.push(id.clone(), cleanup);
            }
        }

        match port_error {
            Some(source) => Err(RemovalError::TrampolineFailure { target, source }.into()),
            None => {
                tracing::info!("Removed hook '{}' from {}", id, target);
                Ok(())
            }
        }
    }

    /// Let the dispatcher run this hook's callback again
    ///
    /// Never touches the trampoline. A hook that is not installed just gets
    /// its flag set and comes up enabled on install.
    #[tracing::instrument(skip(self))]
    pub fn enable(&self, id: &str) -> ManageResult<()> {
        let result = {
            let _op = self.op_lock.lock();
            self.set_enabled(&HookId::new(id), true).map(|_| ())
        };
        self.finish(id, result)
    }

    /// Skip this hook's callback from the next call on
    #[tracing::instrument(skip(self))]
    pub fn disable(&self, id: &str) -> ManageResult<()> {
        let result = {
            let _op = self.op_lock.lock();
            self.set_enabled(&HookId::new(id), false).map(|_| ())
        };
        self.finish(id, result)
    }

    /// Returns whether the flag changed
    pub(super) fn set_enabled(&self, id: &HookId, enabled: bool) -> ManageResult<bool> {
        let mut table = self.table.write();
        let key = key_of(&table, id)?;
        let Some(entry) = table.get(key) else {
            return Err(HookError::NotFound(id.clone()));
        };

        let changed = entry.enabled.swap(enabled, Ordering::AcqRel) != enabled;
        match (enabled, entry.state) {
            (false, HookState::Installed) => transition(&mut table, key, id, HookState::Disabled)?,
            (true, HookState::Disabled) => transition(&mut table, key, id, HookState::Installed)?,
            _ => {}
        }

        if changed {
            tracing::debug!(
                "Hook '{}' {}",
                id,
                if enabled { "enabled" } else { "disabled" }
            );
        }
        Ok(changed)
    }
}

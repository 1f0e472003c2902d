//! Hook orchestrator
//!
//! The public façade over the hook table, resolver, conflict detector and
//! dispatcher. One orchestrator is constructed explicitly with its trampoline
//! port and shared by `Arc`; there is no global instance.
//!
//! # Locking
//!
//! Management operations serialize on one re-entrant operation lock, held for
//! the table mutation plus the port call. The table itself sits behind a
//! `RwLock` that is only ever held briefly, so queries never wait on a patch.
//! Neither lock is held while user code runs: callbacks run on the dispatch
//! path, which never locks, and cleanups are deferred until the operation
//! lock is released.

mod batch;
mod integrity;
mod lifecycle;
mod report;


use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use crossbeam_channel::{bounded, Receiver};
use dashmap::DashMap;
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::config::{ConfigResult, ExclusionSet, OrchestratorConfig};
use crate::hooks::dispatch::{DispatchShared, TargetSlot};
use crate::hooks::error::{HookError, ManageResult, RegistrationError};
use crate::hooks::stats::GlobalCounter;
use crate::hooks::table::HookTable;
use crate::hooks::{
    CleanupCallback, ConflictRecord, DependencyEdge, HookCategory, HookId, HookInfo, HookPriority,
    HookRecord, HookState, InvocationFault, TargetDescriptor, TrampolinePort,
};

pub use report::{ExportError, HookStatsEntry, StatisticsReport};

/// Capacity of the call-time fault queue
const FAULT_QUEUE_CAPACITY: usize = 1024;

/// Conflict records retained for queries
const CONFLICT_LOG_CAPACITY: usize = 512;

bitflags! {
    /// Options for removal operations
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RemoveFlags: u32 {
        /// Remove installed dependents first instead of failing
        const CASCADE = 1 << 0;
        /// Do not run the hook's cleanup callback
        const SKIP_CLEANUP = 1 << 1;
    }
}

/// One entry of the error history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Nanoseconds since the orchestrator was created
    pub at_ns: u64,
    pub hook_id: Option<HookId>,
    pub message: String,
}

struct ErrorLog {
    entries: VecDeque<ErrorRecord>,
    last: Option<String>,
    capacity: usize,
}

impl ErrorLog {
    fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            last: None,
            capacity,
        }
    }

    fn push(&mut self, record: ErrorRecord) {
        self.last = Some(record.message.clone());
        self.entries.push_back(record);
        self.trim();
    }

    fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
        self.trim();
    }

    fn trim(&mut self) {
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }
}

/// Cleanup callbacks collected under the lock and run after it is released
#[derive(Default)]
pub(crate) struct PendingCleanups(Vec<(HookId, CleanupCallback)>);

impl PendingCleanups {
    fn push(&mut self, id: HookId, cleanup: CleanupCallback) {
        self.0.push((id, cleanup));
    }

    fn run(self, orchestrator: &Orchestrator) {
        for (id, cleanup) in self.0 {
            if catch_unwind(AssertUnwindSafe(|| cleanup())).is_err() {
                tracing::warn!("Cleanup for hook '{}' panicked", id);
                orchestrator.note_error(Some(id.as_str()), "cleanup callback panicked");
            }
        }
    }
}

/// Runtime hook orchestrator
pub struct Orchestrator {
    port: Arc<dyn TrampolinePort>,
    config: RwLock<OrchestratorConfig>,
    exclusions: RwLock<ExclusionSet>,
    table: RwLock<HookTable>,
    /// Serializes management operations with each other and with patching
    op_lock: ReentrantMutex<()>,
    /// Patched targets; each slot is also captured by its dispatch entry
    slots: DashMap<TargetDescriptor, Arc<TargetSlot>>,
    conflicts: Mutex<VecDeque<ConflictRecord>>,
    errors: Mutex<ErrorLog>,
    faults: Receiver<InvocationFault>,
    shared: Arc<DispatchShared>,
    install_sequence: AtomicU64,
}

impl Orchestrator {
    /// Build an orchestrator that patches through `port`
    pub fn new(port: Arc<dyn TrampolinePort>, config: OrchestratorConfig) -> ConfigResult<Self> {
        config.validate()?;
        let exclusions = ExclusionSet::from_config(&config)?;
        let (tx, rx) = bounded(FAULT_QUEUE_CAPACITY);
        let shared = Arc::new(DispatchShared::new(
            tx,
            config.hook_timeout_ns(),
            config.performance_monitoring,
        ));

        tracing::info!(
            "Hook orchestrator created (policy {:?}, max {} hooks)",
            config.same_target_policy,
            config.max_hook_count
        );

        Ok(Self {
            port,
            errors: Mutex::new(ErrorLog::new(config.max_error_history)),
            config: RwLock::new(config),
            exclusions: RwLock::new(exclusions),
            table: RwLock::new(HookTable::new()),
            op_lock: ReentrantMutex::new(()),
            slots: DashMap::new(),
            conflicts: Mutex::new(VecDeque::new()),
            faults: rx,
            shared,
            install_sequence: AtomicU64::new(0),
        })
    }

    /// Build an orchestrator with the default configuration
    pub fn with_defaults(port: Arc<dyn TrampolinePort>) -> ConfigResult<Self> {
        Self::new(port, OrchestratorConfig::default())
    }

    /// Nanoseconds since this orchestrator was created
    pub fn now_ns(&self) -> u64 {
        self.shared.now_ns()
    }

    // ---------------------------------------------------------------------
    // Registration
    // ---------------------------------------------------------------------

    /// Add a hook to the table in the UNINSTALLED state
    #[tracing::instrument(skip_all, fields(id = %record.id))]
    pub fn register(&self, record: HookRecord) -> ManageResult<()> {
        let id = record.id.clone();
        let result = {
            let _op = self.op_lock.lock();
            self.register_locked(record)
        };
        // A rejected record never entered the table; keep any existing entry's error intact
        if let Err(err) = &result {
            tracing::debug!("Registration of '{}' failed: {}", id, err);
            self.note_error(None, err.to_string());
        }
        result
    }

    fn register_locked(&self, record: HookRecord) -> ManageResult<()> {
        if !record.id.is_valid() || !record.target.is_valid() {
            return Err(RegistrationError::InvalidTarget {
                id: record.id,
                target: record.target,
            }
            .into());
        }
        if self.exclusions.read().excludes(&record.target) {
            return Err(RegistrationError::ExcludedTarget {
                id: record.id,
                target: record.target,
            }
            .into());
        }

        let max = self.config.read().max_hook_count;
        let id = record.id.clone();
        let target = record.target.clone();
        self.table.write().insert(record, max, self.now_ns())?;

        self.shared.stats.bump(GlobalCounter::Registered);
        tracing::info!("Registered hook '{}' on {}", id, target);
        Ok(())
    }

    /// Erase an UNINSTALLED hook from the table
    #[tracing::instrument(skip(self))]
    pub fn unregister(&self, id: &str) -> ManageResult<()> {
        let result = {
            let _op = self.op_lock.lock();
            self.table
                .write()
                .remove(id)
                .map(|_| ())
                .map_err(HookError::from)
        };
        if result.is_ok() {
            tracing::info!("Unregistered hook '{}'", id);
        }
        self.finish(id, result)
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    pub fn hook_info(&self, id: &str) -> Option<HookInfo> {
        self.table.read().get_by_id(id).map(|entry| entry.info())
    }

    pub fn hooks(&self) -> Vec<HookInfo> {
        self.table.read().all()
    }

    pub fn hooks_by_category(&self, category: HookCategory) -> Vec<HookInfo> {
        self.table.read().by_category(category)
    }

    pub fn hooks_by_priority(&self, priority: HookPriority) -> Vec<HookInfo> {
        self.table.read().by_priority(priority)
    }

    pub fn hooks_by_state(&self, state: HookState) -> Vec<HookInfo> {
        self.table.read().by_state(state)
    }

    pub fn hooks_by_target(&self, target: &TargetDescriptor) -> Vec<HookInfo> {
        self.table.read().by_target(target)
    }

    pub fn hooks_by_module(&self, module: &str) -> Vec<HookInfo> {
        self.table.read().by_module(module)
    }

    pub fn hooks_by_function(&self, function: &str) -> Vec<HookInfo> {
        self.table.read().by_function(function)
    }

    pub fn hook_state(&self, id: &str) -> Option<HookState> {
        self.table.read().get_by_id(id).map(|entry| entry.state)
    }

    /// Installed, whether enabled or not
    pub fn is_installed(&self, id: &str) -> bool {
        self.hook_state(id).is_some_and(HookState::is_active)
    }

    pub fn is_enabled(&self, id: &str) -> bool {
        self.table
            .read()
            .get_by_id(id)
            .is_some_and(|entry| entry.is_enabled())
    }

    pub fn has_hook(&self, id: &str) -> bool {
        self.table.read().contains(id)
    }

    pub fn hook_count(&self) -> usize {
        self.table.read().len()
    }

    pub fn hook_count_by_category(&self, category: HookCategory) -> usize {
        self.table.read().count_by_category(category)
    }

    pub fn hook_count_by_priority(&self, priority: HookPriority) -> usize {
        self.table.read().count_by_priority(priority)
    }

    /// Declared prerequisite edges of `id`, with their current resolution
    pub fn dependencies(&self, id: &str) -> Vec<DependencyEdge> {
        let table = self.table.read();
        let Some(entry) = table.get_by_id(id) else {
            return Vec::new();
        };

        let edge = |dependency: &HookId, required: bool| DependencyEdge {
            hook_id: entry.id().clone(),
            dependency_id: dependency.clone(),
            required,
            resolved: table
                .get_by_id(dependency.as_str())
                .is_some_and(|dep| dep.state.is_active()),
        };

        entry
            .record
            .requires
            .iter()
            .map(|dep| edge(dep, true))
            .chain(entry.record.prefers.iter().map(|dep| edge(dep, false)))
            .collect()
    }

    /// Hook ids in the order a call to `target` runs them
    pub fn chain_order(&self, target: &TargetDescriptor) -> Vec<HookId> {
        self.slots
            .get(target)
            .map(|slot| slot.ids())
            .unwrap_or_default()
    }

    /// Number of targets currently patched through the port
    pub fn patched_target_count(&self) -> usize {
        self.slots.len()
    }

    /// Conflicts recorded for `id`, oldest first
    pub fn conflicts(&self, id: &str) -> Vec<ConflictRecord> {
        self.conflicts
            .lock()
            .iter()
            .filter(|record| record.involves(id))
            .cloned()
            .collect()
    }

    pub fn all_conflicts(&self) -> Vec<ConflictRecord> {
        self.conflicts.lock().iter().cloned().collect()
    }

    fn log_conflicts(&self, records: Vec<ConflictRecord>) {
        if records.is_empty() {
            return;
        }
        let mut log = self.conflicts.lock();
        for record in records {
            self.shared.stats.bump(GlobalCounter::ConflictResolution);
            log.push_back(record);
        }
        while log.len() > CONFLICT_LOG_CAPACITY {
            log.pop_front();
        }
    }

    // ---------------------------------------------------------------------
    // Error history
    // ---------------------------------------------------------------------

    /// Message of the most recent error
    pub fn last_error(&self) -> Option<String> {
        self.drain_faults();
        self.errors.lock().last.clone()
    }

    pub fn clear_last_error(&self) {
        self.errors.lock().last = None;
    }

    /// Retained errors, oldest first
    pub fn error_history(&self) -> Vec<ErrorRecord> {
        self.drain_faults();
        self.errors.lock().entries.iter().cloned().collect()
    }

    pub fn clear_error_history(&self) {
        let mut errors = self.errors.lock();
        errors.entries.clear();
        errors.last = None;
    }

    /// Record an error against the history and, if it exists, the hook
    fn note_error(&self, hook: Option<&str>, message: impl Into<String>) {
        let message = message.into();
        if let Some(id) = hook {
            let mut table = self.table.write();
            if let Some(key) = table.key_of(id) {
                if let Some(entry) = table.get_mut(key) {
                    entry.last_error = Some(message.clone());
                }
            }
        }
        self.errors.lock().push(ErrorRecord {
            at_ns: self.now_ns(),
            hook_id: hook.map(HookId::new),
            message,
        });
    }

    /// Record the error of a finished public operation
    fn finish<T>(&self, id: &str, result: ManageResult<T>) -> ManageResult<T> {
        if let Err(err) = &result {
            tracing::debug!("Operation on hook '{}' failed: {}", id, err);
            self.note_error(Some(id), err.to_string());
        }
        result
    }

    /// Move call-time faults from the dispatcher queue into the history
    fn drain_faults(&self) {
        while let Ok(fault) = self.faults.try_recv() {
            self.note_error(Some(fault.hook_id.as_str()), fault.to_string());
        }
    }

    // ---------------------------------------------------------------------
    // Configuration
    // ---------------------------------------------------------------------

    pub fn config(&self) -> OrchestratorConfig {
        self.config.read().clone()
    }

    /// Replace the configuration
    ///
    /// Exclusions apply to later registrations only; the timeout and the
    /// monitoring switch take effect from the next dispatched call.
    pub fn update_config(&self, config: OrchestratorConfig) -> ConfigResult<()> {
        config.validate()?;
        let exclusions = ExclusionSet::from_config(&config)?;

        let _op = self.op_lock.lock();
        self.shared
            .timeout_ns
            .store(config.hook_timeout_ns(), Ordering::Relaxed);
        self.shared
            .monitoring
            .store(config.performance_monitoring, Ordering::Relaxed);
        self.errors.lock().set_capacity(config.max_error_history);
        *self.exclusions.write() = exclusions;
        *self.config.write() = config;

        tracing::info!("Orchestrator configuration updated");
        Ok(())
    }

    pub fn reset_config(&self) -> ConfigResult<()> {
        self.update_config(OrchestratorConfig::default())
    }
}

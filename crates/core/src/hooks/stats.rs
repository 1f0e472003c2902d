//! Lock-free statistics accumulators
//!
//! The dispatcher updates these on every call with relaxed atomics only.
//! Snapshots taken concurrently with updates may mix values from adjacent
//! calls; each counter on its own is exact. A reset racing a call can
//! likewise leave that one call partly counted, so derived values are
//! clamped when a snapshot is taken.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Per-hook counters, shared between the table entry and its chain link
#[derive(Debug)]
pub struct HookStats {
    call_count: AtomicU64,
    error_count: AtomicU64,
    slow_calls: AtomicU64,
    /// Calls that were timed; the divisor for the average
    timed_calls: AtomicU64,
    total_ns: AtomicU64,
    max_ns: AtomicU64,
    min_ns: AtomicU64,
    /// 0 means never called; otherwise nanoseconds since orchestrator creation + 1
    last_call: AtomicU64,
}

impl Default for HookStats {
    fn default() -> Self {
        Self::new()
    }
}

impl HookStats {
    pub fn new() -> Self {
        Self {
            call_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            slow_calls: AtomicU64::new(0),
            timed_calls: AtomicU64::new(0),
            total_ns: AtomicU64::new(0),
            max_ns: AtomicU64::new(0),
            min_ns: AtomicU64::new(u64::MAX),
            last_call: AtomicU64::new(0),
        }
    }

    /// Record one callback execution
    ///
    /// `elapsed_ns` is `None` when performance monitoring is off; the call is
    /// counted but the timing figures are left alone.
    pub fn record_call(&self, elapsed_ns: Option<u64>, now_ns: u64) {
        self.call_count.fetch_add(1, Ordering::Relaxed);
        if let Some(elapsed_ns) = elapsed_ns {
            self.timed_calls.fetch_add(1, Ordering::Relaxed);
            self.total_ns.fetch_add(elapsed_ns, Ordering::Relaxed);
            self.max_ns.fetch_max(elapsed_ns, Ordering::Relaxed);
            self.min_ns.fetch_min(elapsed_ns, Ordering::Relaxed);
        }
        self.last_call
            .store(now_ns.saturating_add(1), Ordering::Relaxed);
    }

    /// Record a callback that failed or panicked
    pub fn record_error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a call that exceeded the advisory timeout
    pub fn record_slow(&self) {
        self.slow_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn call_count(&self) -> u64 {
        self.call_count.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    /// Zero every counter
    ///
    /// The stores are independent, so a `record_call` running at the same
    /// time may survive in some counters and not others.
    pub fn reset(&self) {
        self.call_count.store(0, Ordering::Relaxed);
        self.error_count.store(0, Ordering::Relaxed);
        self.slow_calls.store(0, Ordering::Relaxed);
        self.timed_calls.store(0, Ordering::Relaxed);
        self.total_ns.store(0, Ordering::Relaxed);
        self.max_ns.store(0, Ordering::Relaxed);
        self.min_ns.store(u64::MAX, Ordering::Relaxed);
        self.last_call.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HookStatsSnapshot {
        let call_count = self.call_count.load(Ordering::Relaxed);
        let timed_calls = self.timed_calls.load(Ordering::Relaxed);
        let total_ns = self.total_ns.load(Ordering::Relaxed);
        let max_ns = self.max_ns.load(Ordering::Relaxed);
        let min_ns = self.min_ns.load(Ordering::Relaxed);
        let last_call = self.last_call.load(Ordering::Relaxed);

        let timed = call_count > 0 && timed_calls > 0;
        HookStatsSnapshot {
            call_count,
            error_count: self.error_count.load(Ordering::Relaxed),
            slow_calls: self.slow_calls.load(Ordering::Relaxed),
            total_ns: if timed { total_ns } else { 0 },
            average_ns: if timed { (total_ns / timed_calls).min(max_ns) } else { 0 },
            max_ns: if timed { max_ns } else { 0 },
            min_ns: if timed && min_ns != u64::MAX { min_ns } else { 0 },
            last_call_ns: last_call.checked_sub(1),
        }
    }
}

/// Point-in-time copy of [`HookStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookStatsSnapshot {
    pub call_count: u64,
    pub error_count: u64,
    pub slow_calls: u64,
    pub total_ns: u64,
    pub average_ns: u64,
    pub max_ns: u64,
    pub min_ns: u64,
    pub last_call_ns: Option<u64>,
}

/// Orchestrator-wide counters
#[derive(Debug, Default)]
pub struct GlobalStats {
    hooks_registered: AtomicU64,
    hooks_installed: AtomicU64,
    hooks_removed: AtomicU64,
    hooks_failed: AtomicU64,
    total_calls: AtomicU64,
    total_errors: AtomicU64,
    missed_originals: AtomicU64,
    dependency_resolutions: AtomicU64,
    conflict_resolutions: AtomicU64,
    integrity_checks: AtomicU64,
    integrity_mismatches: AtomicU64,
    install_ns: AtomicU64,
    removal_ns: AtomicU64,
}

/// Global counters that can be bumped individually
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalCounter {
    Registered,
    Installed,
    Removed,
    Failed,
    Call,
    Error,
    MissedOriginal,
    DependencyResolution,
    ConflictResolution,
    IntegrityCheck,
    IntegrityMismatch,
}

impl GlobalStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, counter: GlobalCounter) -> &AtomicU64 {
        match counter {
            GlobalCounter::Registered => &self.hooks_registered,
            GlobalCounter::Installed => &self.hooks_installed,
            GlobalCounter::Removed => &self.hooks_removed,
            GlobalCounter::Failed => &self.hooks_failed,
            GlobalCounter::Call => &self.total_calls,
            GlobalCounter::Error => &self.total_errors,
            GlobalCounter::MissedOriginal => &self.missed_originals,
            GlobalCounter::DependencyResolution => &self.dependency_resolutions,
            GlobalCounter::ConflictResolution => &self.conflict_resolutions,
            GlobalCounter::IntegrityCheck => &self.integrity_checks,
            GlobalCounter::IntegrityMismatch => &self.integrity_mismatches,
        }
    }

    pub fn bump(&self, counter: GlobalCounter) {
        self.counter(counter).fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, counter: GlobalCounter) -> u64 {
        self.counter(counter).load(Ordering::Relaxed)
    }

    pub fn add_install_time(&self, ns: u64) {
        self.install_ns.fetch_add(ns, Ordering::Relaxed);
    }

    pub fn add_removal_time(&self, ns: u64) {
        self.removal_ns.fetch_add(ns, Ordering::Relaxed);
    }

    /// Zero the call-time counters, keeping lifecycle counts
    pub fn reset_performance(&self) {
        self.total_calls.store(0, Ordering::Relaxed);
        self.total_errors.store(0, Ordering::Relaxed);
        self.missed_originals.store(0, Ordering::Relaxed);
    }

    /// Zero every counter, lifecycle counts included
    pub fn reset(&self) {
        for counter in [
            &self.hooks_registered,
            &self.hooks_installed,
            &self.hooks_removed,
            &self.hooks_failed,
            &self.dependency_resolutions,
            &self.conflict_resolutions,
            &self.integrity_checks,
            &self.integrity_mismatches,
            &self.install_ns,
            &self.removal_ns,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.reset_performance();
    }

    pub fn snapshot(&self) -> GlobalTotals {
        let installed = self.get(GlobalCounter::Installed);
        let removed = self.get(GlobalCounter::Removed);
        let install_ns = self.install_ns.load(Ordering::Relaxed);
        let removal_ns = self.removal_ns.load(Ordering::Relaxed);

        GlobalTotals {
            hooks_registered: self.get(GlobalCounter::Registered),
            hooks_installed: installed,
            hooks_removed: removed,
            hooks_failed: self.get(GlobalCounter::Failed),
            total_calls: self.get(GlobalCounter::Call),
            total_errors: self.get(GlobalCounter::Error),
            missed_originals: self.get(GlobalCounter::MissedOriginal),
            dependency_resolutions: self.get(GlobalCounter::DependencyResolution),
            conflict_resolutions: self.get(GlobalCounter::ConflictResolution),
            integrity_checks: self.get(GlobalCounter::IntegrityCheck),
            integrity_mismatches: self.get(GlobalCounter::IntegrityMismatch),
            average_install_ns: if installed == 0 { 0 } else { install_ns / installed },
            average_removal_ns: if removed == 0 { 0 } else { removal_ns / removed },
        }
    }
}

/// Point-in-time copy of [`GlobalStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalTotals {
    pub hooks_registered: u64,
    pub hooks_installed: u64,
    pub hooks_removed: u64,
    pub hooks_failed: u64,
    pub total_calls: u64,
    pub total_errors: u64,
    pub missed_originals: u64,
    pub dependency_resolutions: u64,
    pub conflict_resolutions: u64,
    pub integrity_checks: u64,
    pub integrity_mismatches: u64,
    pub average_install_ns: u64,
    pub average_removal_ns: u64,
}

/// Aggregate of every hook in one category
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryTotals {
    pub hooks: u64,
    pub installed: u64,
    pub call_count: u64,
    pub error_count: u64,
    pub total_ns: u64,
}

impl CategoryTotals {
    pub(crate) fn add(&mut self, stats: &HookStatsSnapshot, active: bool) {
        self.hooks += 1;
        if active {
            self.installed += 1;
        }
        self.call_count += stats.call_count;
        self.error_count += stats.error_count;
        self.total_ns += stats.total_ns;
    }
}

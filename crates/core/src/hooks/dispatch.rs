//! Call-time dispatcher
//!
//! Each hooked target owns a [`TargetSlot`] holding an immutable, priority
//! sorted chain snapshot behind an `ArcSwap`. The dispatch entry handed to the
//! trampoline port captures the slot directly, so a call never touches the
//! hook table or the management lock, and its cost does not depend on how
//! many hooks are registered.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use arc_swap::{ArcSwap, ArcSwapOption};
use crossbeam_channel::{Sender, TrySendError};

use super::callback::{CallContext, HookCallback, HookResult, Payload};
use super::error::InvocationFault;
use super::port::{DispatchEntry, OriginalHandle};
use super::stats::{GlobalCounter, GlobalStats, HookStats};
use super::table::HookKey;
use super::types::{HookId, HookPriority, TargetDescriptor};

/// State shared by every dispatcher of one orchestrator
pub(crate) struct DispatchShared {
    epoch: Instant,
    pub stats: GlobalStats,
    /// Advisory per-callback timeout; 0 disables slow-call flagging
    pub timeout_ns: AtomicU64,
    pub monitoring: AtomicBool,
    faults: Sender<InvocationFault>,
}

impl DispatchShared {
    pub fn new(faults: Sender<InvocationFault>, timeout_ns: u64, monitoring: bool) -> Self {
        Self {
            epoch: Instant::now(),
            stats: GlobalStats::new(),
            timeout_ns: AtomicU64::new(timeout_ns),
            monitoring: AtomicBool::new(monitoring),
            faults,
        }
    }

    /// Nanoseconds since the orchestrator was created
    pub fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }
}

/// One callback in a target's chain
pub(crate) struct ChainLink {
    pub key: HookKey,
    pub id: HookId,
    pub priority: HookPriority,
    pub sequence: u64,
    pub enabled: Arc<AtomicBool>,
    pub callback: HookCallback,
    pub stats: Arc<HookStats>,
}

type Chain = Vec<Arc<ChainLink>>;

/// Dispatch state for one patched target
pub(crate) struct TargetSlot {
    target: TargetDescriptor,
    chain: ArcSwap<Chain>,
    original: ArcSwapOption<OriginalHandle>,
    shared: Arc<DispatchShared>,
}

impl TargetSlot {
    pub fn new(target: TargetDescriptor, shared: Arc<DispatchShared>) -> Arc<Self> {
        Arc::new(Self {
            target,
            chain: ArcSwap::from_pointee(Vec::new()),
            original: ArcSwapOption::empty(),
            shared,
        })
    }

    /// Entry point for the trampoline port
    pub fn entry(self: &Arc<Self>) -> DispatchEntry {
        let slot = Arc::clone(self);
        DispatchEntry::new(move |payload| slot.dispatch(payload))
    }

    pub fn set_original(&self, original: Option<OriginalHandle>) {
        self.original.store(original.map(Arc::new));
    }

    pub fn len(&self) -> usize {
        self.chain.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids in dispatch order
    pub fn ids(&self) -> Vec<HookId> {
        self.chain.load().iter().map(|l| l.id.clone()).collect()
    }

    /// Publish a new chain containing `link`
    ///
    /// Only called under the management lock, so there is a single writer.
    pub fn insert(&self, link: ChainLink) {
        let mut next: Chain = self.chain.load().iter().cloned().collect();
        next.retain(|l| l.key != link.key);
        next.push(Arc::new(link));
        next.sort_by_key(|l| (std::cmp::Reverse(l.priority), l.sequence));
        self.chain.store(Arc::new(next));
        tracing::debug!("Chain for {} is now {:?}", self.target, self.ids());
    }

    /// Publish a new chain without `key`
    pub fn remove(&self, key: HookKey) -> bool {
        let current = self.chain.load_full();
        if !current.iter().any(|l| l.key == key) {
            return false;
        }
        let next: Chain = current.iter().filter(|l| l.key != key).cloned().collect();
        self.chain.store(Arc::new(next));
        tracing::debug!("Chain for {} is now {:?}", self.target, self.ids());
        true
    }

    /// Run one intercepted call through the chain and the original
    pub fn dispatch(&self, payload: &mut Payload) {
        let chain = self.chain.load_full();
        let original = self.original.load_full();
        let shared = &*self.shared;

        shared.stats.bump(GlobalCounter::Call);
        let monitoring = shared.monitoring.load(Ordering::Relaxed);
        let timeout_ns = shared.timeout_ns.load(Ordering::Relaxed);
        let now_ns = shared.now_ns();

        let mut ctx = CallContext::new(&self.target, payload, original.as_deref());

        for link in chain.iter() {
            if !link.enabled.load(Ordering::Acquire) {
                continue;
            }
            ctx.set_hook(&link.id);

            let consumed_before = ctx.original_consumed();
            let start = monitoring.then(Instant::now);
            let outcome = catch_unwind(AssertUnwindSafe(|| (link.callback)(&mut ctx)));
            let elapsed_ns = start.map(|s| s.elapsed().as_nanos() as u64);

            link.stats.record_call(elapsed_ns, now_ns);
            if let Some(elapsed_ns) = elapsed_ns.filter(|ns| timeout_ns > 0 && *ns > timeout_ns) {
                link.stats.record_slow();
                tracing::warn!(
                    "Hook '{}' on {} took {}us (advisory limit {}us)",
                    link.id,
                    self.target,
                    elapsed_ns / 1_000,
                    timeout_ns / 1_000
                );
            }

            match outcome {
                Ok(Ok(HookResult::Continue)) => {}
                Ok(Ok(HookResult::Handled)) => ctx.suppress_original(),
                Ok(Ok(HookResult::Stop)) => {
                    ctx.suppress_original();
                    break;
                }
                Ok(Err(err)) => {
                    ctx.revert_suppression(consumed_before);
                    self.fault(link, err.to_string(), false, now_ns);
                }
                Err(panic) => {
                    ctx.revert_suppression(consumed_before);
                    self.fault(link, panic_message(panic.as_ref()), true, now_ns);
                }
            }
        }

        let consumed = ctx.original_consumed();
        let payload = ctx.into_payload();
        if consumed {
            return;
        }
        match original.as_deref() {
            Some(original) => original.call(payload),
            None => {
                // Call arrived before the port handed back the original
                shared.stats.bump(GlobalCounter::MissedOriginal);
                tracing::trace!("No original available for {}", self.target);
            }
        }
    }

    fn fault(&self, link: &ChainLink, message: String, panicked: bool, at_ns: u64) {
        link.stats.record_error();
        self.shared.stats.bump(GlobalCounter::Error);

        tracing::warn!(
            "Hook '{}' {} on {}: {}",
            link.id,
            if panicked { "panicked" } else { "failed" },
            self.target,
            message
        );

        let fault = InvocationFault {
            hook_id: link.id.clone(),
            target: self.target.clone(),
            message,
            panicked,
            at_ns,
        };
        match self.shared.faults.try_send(fault) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(_)) => {
                tracing::trace!("Fault queue full, dropping fault for '{}'", link.id);
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::callback::callback;
    use crossbeam_channel::bounded;
    use parking_lot::Mutex;
    use slotmap::SlotMap;

    type Log = Arc<Mutex<Vec<String>>>;

    fn shared() -> (Arc<DispatchShared>, crossbeam_channel::Receiver<InvocationFault>) {
        let (tx, rx) = bounded(16);
        (Arc::new(DispatchShared::new(tx, 0, true)), rx)
    }

    fn link(
        keys: &mut SlotMap<HookKey, ()>,
        id: &str,
        priority: HookPriority,
        sequence: u64,
        callback: HookCallback,
    ) -> ChainLink {
        ChainLink {
            key: keys.insert(()),
            id: HookId::new(id),
            priority,
            sequence,
            enabled: Arc::new(AtomicBool::new(true)),
            callback,
            stats: Arc::new(HookStats::new()),
        }
    }

    /// Link whose callback logs its id and returns `result`
    fn recorded(
        keys: &mut SlotMap<HookKey, ()>,
        log: &Log,
        id: &str,
        priority: HookPriority,
        sequence: u64,
        result: HookResult,
    ) -> ChainLink {
        let log = log.clone();
        let name = id.to_string();
        let logging = callback(move |_ctx| {
            log.lock().push(name.clone());
            Ok(result)
        });
        link(keys, id, priority, sequence, logging)
    }

    fn slot_logging_original(
        log: &Log,
    ) -> (Arc<TargetSlot>, crossbeam_channel::Receiver<InvocationFault>) {
        let (shared, faults) = shared();
        let slot = TargetSlot::new(TargetDescriptor::symbol("game.exe", "Tick"), shared);
        let log = log.clone();
        slot.set_original(Some(OriginalHandle::from_fn(move |_| {
            log.lock().push("original".to_string());
        })));
        (slot, faults)
    }

    #[test]
    fn test_chain_runs_in_priority_order_then_original() {
        let log = Log::default();
        let (slot, _faults) = slot_logging_original(&log);
        let mut keys = SlotMap::with_key();

        let go = HookResult::Continue;
        slot.insert(recorded(&mut keys, &log, "normal", HookPriority::Normal, 0, go));
        slot.insert(recorded(&mut keys, &log, "high", HookPriority::High, 1, go));
        slot.insert(recorded(&mut keys, &log, "normal2", HookPriority::Normal, 2, go));

        slot.entry().call(&mut ());
        assert_eq!(*log.lock(), vec!["high", "normal", "normal2", "original"]);
    }

    #[test]
    fn test_handled_and_stop() {
        let log = Log::default();
        let (slot, _faults) = slot_logging_original(&log);
        let mut keys = SlotMap::with_key();

        slot.insert(recorded(&mut keys, &log, "a", HookPriority::High, 0, HookResult::Handled));
        slot.insert(recorded(&mut keys, &log, "b", HookPriority::Normal, 1, HookResult::Continue));
        slot.dispatch(&mut ());
        assert_eq!(*log.lock(), vec!["a", "b"]);

        log.lock().clear();
        let (slot, _faults) = slot_logging_original(&log);
        slot.insert(recorded(&mut keys, &log, "a", HookPriority::High, 0, HookResult::Stop));
        slot.insert(recorded(&mut keys, &log, "b", HookPriority::Normal, 1, HookResult::Continue));
        slot.dispatch(&mut ());
        assert_eq!(*log.lock(), vec!["a"]);
    }

    #[test]
    fn test_faults_are_isolated() {
        let log = Log::default();
        let (slot, faults) = slot_logging_original(&log);
        let mut keys = SlotMap::with_key();

        let boom = callback(|_| panic!("boom"));
        let panicking = link(&mut keys, "panics", HookPriority::Highest, 0, boom);
        let panicking_stats = panicking.stats.clone();
        let bad_frame = callback(|_| Err("bad frame".into()));
        let failing = link(&mut keys, "fails", HookPriority::High, 1, bad_frame);
        let failing_stats = failing.stats.clone();
        slot.insert(panicking);
        slot.insert(failing);
        slot.insert(recorded(&mut keys, &log, "ok", HookPriority::Normal, 2, HookResult::Continue));

        slot.dispatch(&mut ());

        assert_eq!(*log.lock(), vec!["ok", "original"]);
        assert_eq!(panicking_stats.error_count(), 1);
        assert_eq!(failing_stats.error_count(), 1);

        let first = faults.try_recv().unwrap();
        assert!(first.panicked);
        assert_eq!(first.message, "boom");
        let second = faults.try_recv().unwrap();
        assert!(!second.panicked);
        assert_eq!(second.message, "bad frame");
    }

    #[test]
    fn test_suppression_by_faulting_callback_is_dropped() {
        let log = Log::default();
        let (slot, faults) = slot_logging_original(&log);
        let mut keys = SlotMap::with_key();

        let panics = callback(|ctx| {
            ctx.suppress_original();
            panic!("after suppress")
        });
        let fails = callback(|ctx| {
            ctx.suppress_original();
            Err("after suppress".into())
        });
        slot.insert(link(&mut keys, "panics", HookPriority::High, 0, panics));
        slot.insert(link(&mut keys, "fails", HookPriority::Normal, 1, fails));

        slot.dispatch(&mut ());
        assert_eq!(*log.lock(), vec!["original"]);
        assert_eq!(faults.len(), 2);
    }

    #[test]
    fn test_earlier_suppression_survives_later_fault() {
        let log = Log::default();
        let (slot, _faults) = slot_logging_original(&log);
        let mut keys = SlotMap::with_key();

        slot.insert(recorded(&mut keys, &log, "a", HookPriority::High, 0, HookResult::Handled));
        slot.insert(link(&mut keys, "b", HookPriority::Normal, 1, callback(|_| panic!("late"))));

        slot.dispatch(&mut ());
        assert_eq!(*log.lock(), vec!["a"]);
    }

    #[test]
    fn test_original_run_by_faulting_callback_is_not_repeated() {
        let log = Log::default();
        let (slot, _faults) = slot_logging_original(&log);
        let mut keys = SlotMap::with_key();

        let calls_then_fails = callback(|ctx| {
            ctx.call_original();
            Err("after original".into())
        });
        slot.insert(link(&mut keys, "a", HookPriority::Normal, 0, calls_then_fails));

        slot.dispatch(&mut ());
        assert_eq!(*log.lock(), vec!["original"]);
    }

    #[test]
    fn test_untimed_dispatch_when_monitoring_off() {
        let log = Log::default();
        let (slot, _faults) = slot_logging_original(&log);
        slot.shared.monitoring.store(false, Ordering::Relaxed);
        let mut keys = SlotMap::with_key();

        let a = recorded(&mut keys, &log, "a", HookPriority::Normal, 0, HookResult::Continue);
        let stats = a.stats.clone();
        slot.insert(a);

        slot.dispatch(&mut ());
        let snap = stats.snapshot();
        assert_eq!(snap.call_count, 1);
        assert_eq!((snap.total_ns, snap.min_ns, snap.max_ns), (0, 0, 0));
    }

    #[test]
    fn test_disabled_link_skipped() {
        let log = Log::default();
        let (slot, _faults) = slot_logging_original(&log);
        let mut keys = SlotMap::with_key();

        let a = recorded(&mut keys, &log, "a", HookPriority::Normal, 0, HookResult::Continue);
        let enabled = a.enabled.clone();
        let stats = a.stats.clone();
        slot.insert(a);

        enabled.store(false, Ordering::Release);
        slot.dispatch(&mut ());
        assert_eq!(*log.lock(), vec!["original"]);
        assert_eq!(stats.call_count(), 0);
    }

    #[test]
    fn test_missing_original_is_counted() {
        let (shared, _rx) = shared();
        let target = TargetDescriptor::symbol("game.exe", "Tick");
        let slot = TargetSlot::new(target, shared.clone());
        slot.dispatch(&mut ());
        assert_eq!(shared.stats.get(GlobalCounter::MissedOriginal), 1);
    }

    #[test]
    fn test_remove_link() {
        let log = Log::default();
        let (slot, _faults) = slot_logging_original(&log);
        let mut keys = SlotMap::with_key();

        let a = recorded(&mut keys, &log, "a", HookPriority::Normal, 0, HookResult::Continue);
        let key = a.key;
        slot.insert(a);
        assert_eq!(slot.len(), 1);
        assert!(slot.remove(key));
        assert!(!slot.remove(key));
        assert!(slot.is_empty());
    }
}

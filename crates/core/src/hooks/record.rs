//! Hook records: what adapters register, and what the table stores

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::callback::{CallContext, CallbackError, CleanupCallback, HookCallback, HookResult};
use super::stats::{HookStats, HookStatsSnapshot};
use super::types::{HookCategory, HookId, HookPriority, HookState, TargetDescriptor};

/// Registration request for one hook
///
/// # Example
/// ```ignore
/// let record = HookRecord::new(
///     "present.stereo",
///     TargetDescriptor::symbol("dxgi.dll", "Present"),
///     |ctx| {
///         if let Some(frame) = ctx.payload::<PresentArgs>() {
///             frame.sync_interval = 0;
///         }
///         Ok(HookResult::Continue)
///     },
/// )
/// .category(HookCategory::Rendering)
/// .priority(HookPriority::High)
/// .requires("device.capture");
/// ```
#[derive(Clone)]
pub struct HookRecord {
    pub(crate) id: HookId,
    pub(crate) target: TargetDescriptor,
    pub(crate) description: String,
    pub(crate) category: HookCategory,
    pub(crate) priority: HookPriority,
    pub(crate) callback: HookCallback,
    pub(crate) cleanup: Option<CleanupCallback>,
    pub(crate) enabled: bool,
    pub(crate) critical: bool,
    pub(crate) requires: Vec<HookId>,
    pub(crate) prefers: Vec<HookId>,
    pub(crate) conflicts: Vec<HookId>,
    pub(crate) metadata: BTreeMap<String, String>,
}

impl HookRecord {
    pub fn new<F>(id: impl Into<HookId>, target: TargetDescriptor, callback: F) -> Self
    where
        F: Fn(&mut CallContext<'_>) -> Result<HookResult, CallbackError> + Send + Sync + 'static,
    {
        Self::with_callback(id, target, Arc::new(callback))
    }

    /// Build a record around an already shared callback
    pub fn with_callback(
        id: impl Into<HookId>,
        target: TargetDescriptor,
        callback: HookCallback,
    ) -> Self {
        Self {
            id: id.into(),
            target,
            description: String::new(),
            category: HookCategory::default(),
            priority: HookPriority::default(),
            callback,
            cleanup: None,
            enabled: true,
            critical: false,
            requires: Vec::new(),
            prefers: Vec::new(),
            conflicts: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn category(mut self, category: HookCategory) -> Self {
        self.category = category;
        self
    }

    pub fn priority(mut self, priority: HookPriority) -> Self {
        self.priority = priority;
        self
    }

    /// A critical hook's failure aborts the batch it is installed in
    pub fn critical(mut self, critical: bool) -> Self {
        self.critical = critical;
        self
    }

    /// Initial value of the enabled flag
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Hard prerequisite: `id` must be installed before this hook
    pub fn requires(mut self, id: impl Into<HookId>) -> Self {
        self.requires.push(id.into());
        self
    }

    /// Soft prerequisite: ordered before this hook when both are installed together
    pub fn prefers(mut self, id: impl Into<HookId>) -> Self {
        self.prefers.push(id.into());
        self
    }

    /// Declare an explicit incompatibility with another hook
    pub fn conflicts_with(mut self, id: impl Into<HookId>) -> Self {
        self.conflicts.push(id.into());
        self
    }

    /// Run `cleanup` once each time the hook is removed from its target
    pub fn cleanup<F>(mut self, cleanup: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.cleanup = Some(Arc::new(cleanup));
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn id(&self) -> &HookId {
        &self.id
    }

    pub fn target(&self) -> &TargetDescriptor {
        &self.target
    }
}

impl fmt::Debug for HookRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRecord")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("category", &self.category)
            .field("priority", &self.priority)
            .field("critical", &self.critical)
            .field("requires", &self.requires)
            .field("prefers", &self.prefers)
            .field("conflicts", &self.conflicts)
            .finish_non_exhaustive()
    }
}

/// Declared ordering constraint between two hooks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub hook_id: HookId,
    pub dependency_id: HookId,
    pub required: bool,
    /// The dependency is registered and currently installed
    pub resolved: bool,
}

/// Serializable snapshot of a registered hook
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookInfo {
    pub id: HookId,
    pub description: String,
    pub target: TargetDescriptor,
    pub category: HookCategory,
    pub priority: HookPriority,
    pub state: HookState,
    pub enabled: bool,
    pub critical: bool,
    pub requires: Vec<HookId>,
    pub prefers: Vec<HookId>,
    pub conflicts: Vec<HookId>,
    pub metadata: BTreeMap<String, String>,
    /// Nanoseconds since orchestrator creation
    pub registered_at_ns: u64,
    pub installed_at_ns: Option<u64>,
    /// Position in the global install order, increasing with every install
    pub install_sequence: Option<u64>,
    pub last_error: Option<String>,
    pub stats: HookStatsSnapshot,
}

/// Table entry: the record plus everything the orchestrator tracks about it
pub(crate) struct HookEntry {
    pub record: HookRecord,
    pub state: HookState,
    /// Shared with the dispatch chain so enable/disable never republishes it
    pub enabled: Arc<AtomicBool>,
    pub stats: Arc<HookStats>,
    /// Registration order, used for deterministic tie-breaking
    pub sequence: u64,
    pub registered_at_ns: u64,
    pub installed_at_ns: Option<u64>,
    pub install_sequence: Option<u64>,
    pub last_error: Option<String>,
}

impl HookEntry {
    pub fn new(record: HookRecord, sequence: u64, registered_at_ns: u64) -> Self {
        let enabled = Arc::new(AtomicBool::new(record.enabled));
        Self {
            record,
            state: HookState::Uninstalled,
            enabled,
            stats: Arc::new(HookStats::new()),
            sequence,
            registered_at_ns,
            installed_at_ns: None,
            install_sequence: None,
            last_error: None,
        }
    }

    pub fn id(&self) -> &HookId {
        &self.record.id
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(std::sync::atomic::Ordering::Acquire)
    }

    /// Ordering key: higher priority first, then earlier registration
    pub fn order_key(&self) -> (std::cmp::Reverse<HookPriority>, u64) {
        (std::cmp::Reverse(self.record.priority), self.sequence)
    }

    pub fn info(&self) -> HookInfo {
        let record = &self.record;
        HookInfo {
            id: record.id.clone(),
            description: record.description.clone(),
            target: record.target.clone(),
            category: record.category,
            priority: record.priority,
            state: self.state,
            enabled: self.is_enabled(),
            critical: record.critical,
            requires: record.requires.clone(),
            prefers: record.prefers.clone(),
            conflicts: record.conflicts.clone(),
            metadata: record.metadata.clone(),
            registered_at_ns: self.registered_at_ns,
            installed_at_ns: self.installed_at_ns,
            install_sequence: self.install_sequence,
            last_error: self.last_error.clone(),
            stats: self.stats.snapshot(),
        }
    }
}

//! hookweave core - runtime hook orchestration
//!
//! This crate owns the registry of hooks into a host process, decides the
//! order they are installed and removed in, mediates hooks that compete for
//! the same target, and dispatches every intercepted call through the chain
//! of callbacks on that target.
//!
//! Code patching is delegated to a [`TrampolinePort`]. [`SlotPort`] is the
//! in-process implementation for call sites defined in Rust; native ports
//! live in the plugin crate.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use hookweave_core::{HookRecord, HookResult, Orchestrator, SlotPort, TargetDescriptor};
//!
//! let port = Arc::new(SlotPort::new());
//! let orchestrator = Orchestrator::with_defaults(port.clone())?;
//!
//! orchestrator.register(HookRecord::new(
//!     "tick.counter",
//!     TargetDescriptor::symbol("game.exe", "Tick"),
//!     |_| Ok(HookResult::Continue),
//! ))?;
//! orchestrator.install("tick.counter")?;
//! ```

pub mod config;
pub mod hooks;
pub mod orchestrator;

// Re-export the management façade
pub use orchestrator::{
    ErrorRecord, ExportError, HookStatsEntry, Orchestrator, RemoveFlags, StatisticsReport,
};

// Re-export config types
pub use config::{ConfigError, ConfigResult, ExclusionSet, OrchestratorConfig};

// Re-export hook vocabulary
pub use hooks::{
    callback, BatchError, CallContext, CallbackError, CategoryTotals, CleanupCallback,
    ConflictError, ConflictKind, ConflictRecord, ConflictResolution, DependencyEdge,
    DependencyError, DispatchEntry, GlobalTotals, HookCallback, HookCategory, HookError, HookId,
    HookInfo, HookPriority, HookRecord, HookResult, HookState, HookStatsSnapshot, InstallError,
    InvocationFault, ManageResult, OriginalHandle, Payload, PortError, RegistrationError,
    RemovalError, SameTargetPolicy, SlotPort, TargetDescriptor, TrampolinePort,
};

//! Hook system
//!
//! Provides the building blocks the orchestrator drives:
//! - Hook records, identifiers and target descriptors
//! - The trampoline port seam and an in-process slot port
//! - The hook table with its secondary indices
//! - Dependency resolution and conflict detection
//! - The call-time dispatcher and its lock-free statistics

pub mod callback;
pub mod conflict;
pub(crate) mod dispatch;
pub mod error;
pub mod port;
pub mod record;
pub(crate) mod resolver;
pub mod stats;
pub(crate) mod table;
pub mod types;

pub use callback::{
    callback, CallContext, CallbackError, CleanupCallback, HookCallback, HookResult, Payload,
};
pub use conflict::{ConflictKind, ConflictRecord, ConflictResolution, SameTargetPolicy};
pub use error::{
    BatchError, ConflictError, DependencyError, HookError, InstallError, InvocationFault,
    ManageResult, RegistrationError, RemovalError,
};
pub use port::{DispatchEntry, OriginalHandle, PortError, SlotPort, TrampolinePort};
pub use record::{DependencyEdge, HookInfo, HookRecord};
pub use stats::{CategoryTotals, GlobalTotals, HookStatsSnapshot};
pub use types::{HookCategory, HookId, HookPriority, HookState, ParseEnumError, TargetDescriptor};

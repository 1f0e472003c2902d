//! Error taxonomy for hook management
//!
//! Every error here is returned synchronously to management code. None of them
//! ever reaches a patched call site; faults raised by callbacks at call time
//! are captured as [`InvocationFault`] records instead.

use serde::{Deserialize, Serialize};

use super::port::PortError;
use super::types::{HookId, HookState, TargetDescriptor};

/// Registration-time failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistrationError {
    #[error("Hook '{0}' is already registered")]
    DuplicateId(HookId),

    #[error("Hook '{id}' has an invalid target or id: {target}")]
    InvalidTarget { id: HookId, target: TargetDescriptor },

    #[error("Hook '{id}' targets excluded resource {target}")]
    ExcludedTarget { id: HookId, target: TargetDescriptor },

    #[error("Hook capacity exceeded ({max} hooks)")]
    CapacityExceeded { max: usize },

    #[error("Hook '{0}' not found")]
    NotFound(HookId),

    #[error("Hook '{id}' is still in use (state {state})")]
    InUse { id: HookId, state: HookState },
}

/// Dependency resolution failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DependencyError {
    #[error("Hook '{hook}' requires unregistered hook '{dependency}'")]
    MissingDependency { hook: HookId, dependency: HookId },

    #[error("Cyclic dependency: {}", format_cycle(.cycle))]
    CyclicDependency { cycle: Vec<HookId> },

    #[error("Hook '{hook}' could not install prerequisite '{prerequisite}': {reason}")]
    PrerequisiteFailed {
        hook: HookId,
        prerequisite: HookId,
        reason: String,
    },
}

fn format_cycle(cycle: &[HookId]) -> String {
    cycle
        .iter()
        .map(HookId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Conflict resolution failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConflictError {
    #[error("Hook '{hook}' rejected: conflicts with installed hook '{existing}'")]
    RejectedConflict { hook: HookId, existing: HookId },

    #[error("No rejected conflict between '{hook}' and '{existing}' to resolve")]
    NoSuchConflict { hook: HookId, existing: HookId },

    #[error("Hook '{hook}' rejected: chain for {target} is full ({max} hooks)")]
    ChainFull {
        hook: HookId,
        target: TargetDescriptor,
        max: usize,
    },
}

/// Installation failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InstallError {
    #[error("Trampoline failure on {target}: {source}")]
    TrampolineFailure {
        target: TargetDescriptor,
        #[source]
        source: PortError,
    },

    #[error("Hook '{0}' is already installed")]
    AlreadyInstalled(HookId),

    #[error("Hook '{id}' cannot be installed from state {state}")]
    InvalidState { id: HookId, state: HookState },
}

/// Removal failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemovalError {
    #[error("Hook '{0}' is not installed")]
    NotInstalled(HookId),

    #[error("Hook '{hook}' is still required by installed hooks: {}", format_cycle(.dependents))]
    DependentsStillInstalled {
        hook: HookId,
        dependents: Vec<HookId>,
    },

    #[error("Trampoline failure while restoring {target}: {source}")]
    TrampolineFailure {
        target: TargetDescriptor,
        #[source]
        source: PortError,
    },
}

/// Umbrella error for every management operation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HookError {
    #[error(transparent)]
    Registration(#[from] RegistrationError),

    #[error(transparent)]
    Dependency(#[from] DependencyError),

    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error(transparent)]
    Install(#[from] InstallError),

    #[error(transparent)]
    Removal(#[from] RemovalError),

    #[error("Hook '{0}' not found")]
    NotFound(HookId),
}

/// Result type for hook management operations
pub type ManageResult<T> = Result<T, HookError>;

/// Collected failures of a batch operation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{} hook operation(s) failed{}", .failures.len(), aborted_suffix(.aborted_by))]
pub struct BatchError {
    /// Per-hook failures, in the order they occurred
    pub failures: Vec<(HookId, HookError)>,

    /// Hooks that completed before the batch ended (after any rollback)
    pub completed: Vec<HookId>,

    /// Critical hook whose failure aborted the batch
    pub aborted_by: Option<HookId>,
}

fn aborted_suffix(aborted_by: &Option<HookId>) -> String {
    match aborted_by {
        Some(id) => format!(", aborted by critical hook '{}'", id),
        None => String::new(),
    }
}

impl BatchError {
    /// Failure recorded for `id`, if any
    pub fn failure(&self, id: &str) -> Option<&HookError> {
        self.failures
            .iter()
            .find(|(hook, _)| hook.as_str() == id)
            .map(|(_, err)| err)
    }
}

/// A callback failed while a hooked target was being dispatched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationFault {
    pub hook_id: HookId,
    pub target: TargetDescriptor,
    pub message: String,
    /// True if the callback panicked rather than returning an error
    pub panicked: bool,
    /// Nanoseconds since the orchestrator was created
    pub at_ns: u64,
}

impl std::fmt::Display for InvocationFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Hook '{}' {} on {}: {}",
            self.hook_id,
            if self.panicked { "panicked" } else { "failed" },
            self.target,
            self.message
        )
    }
}

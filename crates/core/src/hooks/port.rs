//! Trampoline port: the seam to the code-patching collaborator
//!
//! The orchestrator never patches code itself. It hands a [`DispatchEntry`] to
//! a [`TrampolinePort`], which redirects the call site and returns an
//! [`OriginalHandle`] for calling through.
//!
//! [`SlotPort`] is the in-process port for software interception points: call
//! sites owned by Rust code that route through a replaceable slot, the same
//! way a vtable hook swaps one function pointer for another.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use super::callback::Payload;
use super::types::TargetDescriptor;

/// Error type for port operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PortError {
    #[error("Target not found: {0}")]
    TargetNotFound(TargetDescriptor),

    #[error("Target already patched: {0}")]
    AlreadyPatched(TargetDescriptor),

    #[error("Target not patched: {0}")]
    NotPatched(TargetDescriptor),

    #[error("Memory protection failed: {0}")]
    MemoryProtection(String),

    #[error("Native patcher error: {0}")]
    Native(String),
}

type RawFn = Arc<dyn Fn(&mut Payload) + Send + Sync>;

fn same_fn(a: &RawFn, b: &RawFn) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// Function the patched call site must invoke
///
/// Cloning is cheap; every clone runs the same dispatcher.
#[derive(Clone)]
pub struct DispatchEntry {
    inner: RawFn,
}

impl DispatchEntry {
    pub(crate) fn new<F>(f: F) -> Self
    where
        F: Fn(&mut Payload) + Send + Sync + 'static,
    {
        Self { inner: Arc::new(f) }
    }

    /// Run the dispatcher for one intercepted call
    pub fn call(&self, payload: &mut Payload) {
        (self.inner)(payload)
    }

    /// Whether both handles run the same dispatcher
    pub fn same_entry(&self, other: &DispatchEntry) -> bool {
        same_fn(&self.inner, &other.inner)
    }
}

impl fmt::Debug for DispatchEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DispatchEntry({:p})", Arc::as_ptr(&self.inner) as *const ())
    }
}

/// Callable handle to the code a hook replaced
#[derive(Clone)]
pub struct OriginalHandle {
    inner: RawFn,
    address: Option<usize>,
}

impl OriginalHandle {
    /// Wrap a Rust closure as the original
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&mut Payload) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(f),
            address: None,
        }
    }

    /// Attach the native trampoline address (for adapters that call it directly)
    pub fn with_address(mut self, address: usize) -> Self {
        self.address = Some(address);
        self
    }

    /// Native trampoline address, if the port supplied one
    pub fn address(&self) -> Option<usize> {
        self.address
    }

    /// Call through to the original code
    pub fn call(&self, payload: &mut Payload) {
        (self.inner)(payload)
    }
}

impl fmt::Debug for OriginalHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.address {
            Some(addr) => write!(f, "OriginalHandle({:#x})", addr),
            None => write!(f, "OriginalHandle({:p})", Arc::as_ptr(&self.inner) as *const ()),
        }
    }
}

/// Code-patching collaborator
///
/// Implementations must not call back into the orchestrator from `install`
/// or `remove`; both run while the management lock is held.
pub trait TrampolinePort: Send + Sync {
    /// Redirect `target` to `entry`, returning a handle to the original code
    fn install(
        &self,
        target: &TargetDescriptor,
        entry: DispatchEntry,
    ) -> Result<OriginalHandle, PortError>;

    /// Restore `target` to its original code
    fn remove(&self, target: &TargetDescriptor) -> Result<(), PortError>;

    /// Check the patch at `target` is still the one this port installed
    fn verify(&self, _target: &TargetDescriptor) -> Result<bool, PortError> {
        Ok(true)
    }
}

/// Storage for one software call site
struct Slot {
    /// The code that runs when nothing is patched in
    original: OriginalHandle,

    /// What the call site currently routes to (None means the original)
    current: Option<RawFn>,

    /// The entry installed through the port, used for integrity checks
    installed: Option<RawFn>,

    /// Number of successful installs, for diagnostics
    patch_count: u64,
}

/// In-process port for call sites defined by Rust code
#[derive(Default)]
pub struct SlotPort {
    slots: RwLock<HashMap<TargetDescriptor, Slot>>,
}

impl SlotPort {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a call site and the code it runs when unhooked
    ///
    /// Redefining an existing site replaces its original and clears any patch.
    pub fn define<F>(&self, target: TargetDescriptor, original: F)
    where
        F: Fn(&mut Payload) + Send + Sync + 'static,
    {
        tracing::debug!("Defining call site {}", target);
        self.slots.write().insert(
            target,
            Slot {
                original: OriginalHandle::from_fn(original),
                current: None,
                installed: None,
                patch_count: 0,
            },
        );
    }

    /// Run the call site for `target`
    ///
    /// Returns `false` if no call site was defined for it.
    pub fn invoke(&self, target: &TargetDescriptor, payload: &mut Payload) -> bool {
        // Clone the handle out so no lock is held while hooks run
        let func = {
            let slots = self.slots.read();
            match slots.get(target) {
                Some(slot) => slot
                    .current
                    .clone()
                    .unwrap_or_else(|| slot.original.inner.clone()),
                None => return false,
            }
        };
        func(payload);
        true
    }

    /// Whether `target` currently routes to a dispatcher
    pub fn is_patched(&self, target: &TargetDescriptor) -> bool {
        self.slots
            .read()
            .get(target)
            .map(|s| s.current.is_some())
            .unwrap_or(false)
    }

    /// Number of successful installs on `target`
    pub fn patch_count(&self, target: &TargetDescriptor) -> u64 {
        self.slots
            .read()
            .get(target)
            .map(|s| s.patch_count)
            .unwrap_or(0)
    }

    /// Route `target` straight to its original behind the orchestrator's back
    ///
    /// Simulates a foreign tool overwriting the patch.
    pub fn tamper(&self, target: &TargetDescriptor) {
        if let Some(slot) = self.slots.write().get_mut(target) {
            slot.current = None;
        }
    }
}

impl TrampolinePort for SlotPort {
    fn install(
        &self,
        target: &TargetDescriptor,
        entry: DispatchEntry,
    ) -> Result<OriginalHandle, PortError> {
        let mut slots = self.slots.write();
        let slot = slots
            .get_mut(target)
            .ok_or_else(|| PortError::TargetNotFound(target.clone()))?;

        if slot.installed.is_some() {
            return Err(PortError::AlreadyPatched(target.clone()));
        }

        slot.current = Some(entry.inner.clone());
        slot.installed = Some(entry.inner);
        slot.patch_count += 1;

        tracing::debug!("Patched call site {}", target);
        Ok(slot.original.clone())
    }

    fn remove(&self, target: &TargetDescriptor) -> Result<(), PortError> {
        let mut slots = self.slots.write();
        let slot = slots
            .get_mut(target)
            .ok_or_else(|| PortError::TargetNotFound(target.clone()))?;

        if slot.installed.take().is_none() {
            return Err(PortError::NotPatched(target.clone()));
        }
        slot.current = None;

        tracing::debug!("Restored call site {}", target);
        Ok(())
    }

    fn verify(&self, target: &TargetDescriptor) -> Result<bool, PortError> {
        let slots = self.slots.read();
        let slot = slots
            .get(target)
            .ok_or_else(|| PortError::TargetNotFound(target.clone()))?;

        Ok(match (&slot.installed, &slot.current) {
            (Some(installed), Some(current)) => same_fn(installed, current),
            (None, None) => true,
            _ => false,
        })
    }
}

//! Trampoline port backed by a native patcher's function table
//!
//! The patcher owns the actual code rewriting. For every install it receives
//! an opaque entry token and [`hookweave_dispatch`], and must route the
//! patched site to `hookweave_dispatch(token, args)`.

use std::collections::HashMap;
use std::ffi::{c_char, c_int, c_void, CString};

use parking_lot::Mutex;

use hookweave_core::{DispatchEntry, OriginalHandle, PortError, TargetDescriptor, TrampolinePort};

use crate::ffi::hookweave_dispatch;

/// Status code returned by native patcher functions
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortStatus {
    Ok = 0,
    TargetNotFound = 1,
    AlreadyPatched = 2,
    NotPatched = 3,
    MemoryProtection = 4,
    Failed = 5,
}

impl PortStatus {
    /// Decode a raw status; unknown codes count as `Failed`
    pub fn from_raw(code: c_int) -> Self {
        match code {
            0 => Self::Ok,
            1 => Self::TargetNotFound,
            2 => Self::AlreadyPatched,
            3 => Self::NotPatched,
            4 => Self::MemoryProtection,
            _ => Self::Failed,
        }
    }

    pub fn to_error_string(self) -> &'static str {
        match self {
            Self::Ok => "Success",
            Self::TargetNotFound => "Target not found",
            Self::AlreadyPatched => "Target already patched",
            Self::NotPatched => "Target not patched",
            Self::MemoryProtection => "Memory protection change failed",
            Self::Failed => "Native patcher failed",
        }
    }

    fn into_result(self, target: &TargetDescriptor) -> Result<(), PortError> {
        match self {
            Self::Ok => Ok(()),
            Self::TargetNotFound => Err(PortError::TargetNotFound(target.clone())),
            Self::AlreadyPatched => Err(PortError::AlreadyPatched(target.clone())),
            Self::NotPatched => Err(PortError::NotPatched(target.clone())),
            Self::MemoryProtection => Err(PortError::MemoryProtection(target.to_string())),
            Self::Failed => Err(PortError::Native(format!(
                "{} ({})",
                self.to_error_string(),
                target
            ))),
        }
    }
}

/// `TargetDescriptor::Symbol` in a [`NativeTarget`]
pub const TARGET_SYMBOL: c_int = 0;

/// `TargetDescriptor::Address` in a [`NativeTarget`]
pub const TARGET_ADDRESS: c_int = 1;

/// Target as handed to the native patcher
///
/// Strings are only valid for the duration of the call.
#[repr(C)]
#[derive(Debug)]
pub struct NativeTarget {
    pub kind: c_int,
    pub module: *const c_char,
    pub function: *const c_char,
    pub start: usize,
    pub len: usize,
}

/// Function the patched site must call with its entry token
pub type DispatchFn = unsafe extern "C" fn(entry: *const c_void, args: *mut c_void);

/// Native original code, taking the same argument block
pub type OriginalFn = unsafe extern "C" fn(args: *mut c_void);

pub type InstallFn = unsafe extern "C" fn(
    user: *mut c_void,
    target: *const NativeTarget,
    entry: *const c_void,
    dispatch: DispatchFn,
    original: *mut usize,
) -> c_int;

pub type RemoveFn = unsafe extern "C" fn(user: *mut c_void, target: *const NativeTarget) -> c_int;

pub type VerifyFn = unsafe extern "C" fn(
    user: *mut c_void,
    target: *const NativeTarget,
    intact: *mut bool,
) -> c_int;

/// Function table supplied by the native patcher
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PortVTable {
    /// Passed back as the first argument of every function
    pub user: *mut c_void,
    pub install: Option<InstallFn>,
    pub remove: Option<RemoveFn>,
    /// Optional; without it integrity checks only confirm the site is tracked
    pub verify: Option<VerifyFn>,
}

/// Payload of a native call: the raw argument block
#[derive(Debug)]
pub struct NativeFrame {
    pub args: *mut c_void,
}

// SAFETY: a frame is created and consumed on the calling thread within one dispatch
unsafe impl Send for NativeFrame {}

/// [`NativeTarget`] together with the strings it points into
struct OwnedTarget {
    _module: CString,
    _function: CString,
    raw: NativeTarget,
}

fn owned_target(target: &TargetDescriptor) -> Result<OwnedTarget, PortError> {
    let to_cstring = |s: &str| {
        CString::new(s).map_err(|_| PortError::Native(format!("Interior NUL in target {}", target)))
    };

    let (kind, module, function, start, len) = match target {
        TargetDescriptor::Symbol { module, function } => {
            (TARGET_SYMBOL, to_cstring(module)?, to_cstring(function)?, 0, 0)
        }
        TargetDescriptor::Address { start, len } => {
            (TARGET_ADDRESS, CString::default(), CString::default(), *start, *len)
        }
    };

    let raw = NativeTarget {
        kind,
        module: module.as_ptr(),
        function: function.as_ptr(),
        start,
        len,
    };
    Ok(OwnedTarget {
        _module: module,
        _function: function,
        raw,
    })
}

#[derive(Default)]
struct Entries {
    live: HashMap<TargetDescriptor, Box<DispatchEntry>>,
    /// Tokens of removed sites; a thread may still be inside one, so they live as long as the port
    retired: Vec<Box<DispatchEntry>>,
}

/// [`TrampolinePort`] that forwards to a [`PortVTable`]
pub struct NativePort {
    vtable: PortVTable,
    entries: Mutex<Entries>,
}

// SAFETY: `NativePort::new` requires the table to be callable from any thread
unsafe impl Send for NativePort {}
unsafe impl Sync for NativePort {}

impl NativePort {
    /// Wrap a patcher function table
    ///
    /// # Safety
    /// - Every function in `vtable` must stay valid for the port's lifetime
    /// - The functions must be callable from any thread with `vtable.user`
    pub unsafe fn new(vtable: PortVTable) -> Self {
        Self {
            vtable,
            entries: Mutex::new(Entries::default()),
        }
    }

    /// Number of targets currently routed through this port
    pub fn live_count(&self) -> usize {
        self.entries.lock().live.len()
    }
}

impl TrampolinePort for NativePort {
    fn install(
        &self,
        target: &TargetDescriptor,
        entry: DispatchEntry,
    ) -> Result<OriginalHandle, PortError> {
        let install = self
            .vtable
            .install
            .ok_or_else(|| PortError::Native("Patcher has no install function".to_string()))?;
        let owned = owned_target(target)?;

        let mut entries = self.entries.lock();
        if entries.live.contains_key(target) {
            return Err(PortError::AlreadyPatched(target.clone()));
        }

        let boxed = Box::new(entry);
        let token = &*boxed as *const DispatchEntry as *const c_void;
        let mut original: usize = 0;

        // SAFETY: guaranteed by `NativePort::new`; `owned` outlives the call
        let code = unsafe {
            install(
                self.vtable.user,
                &owned.raw,
                token,
                hookweave_dispatch,
                &mut original,
            )
        };
        PortStatus::from_raw(code).into_result(target)?;
        entries.live.insert(target.clone(), boxed);

        if original == 0 {
            tracing::warn!(
                "Patcher returned no original for {}; calls will not pass through",
                target
            );
            return Ok(OriginalHandle::from_fn(|_| {}));
        }

        // SAFETY: the patcher hands back the address of a function with the `OriginalFn` ABI
        let original_fn = unsafe { std::mem::transmute::<usize, OriginalFn>(original) };
        tracing::debug!("Native patch on {} (original {:#x})", target, original);
        Ok(OriginalHandle::from_fn(move |payload| {
            if let Some(frame) = payload.downcast_mut::<NativeFrame>() {
                // SAFETY: the frame carries the argument block the site was called with
                unsafe { original_fn(frame.args) }
            }
        })
        .with_address(original))
    }

    fn remove(&self, target: &TargetDescriptor) -> Result<(), PortError> {
        let remove = self
            .vtable
            .remove
            .ok_or_else(|| PortError::Native("Patcher has no remove function".to_string()))?;
        let owned = owned_target(target)?;

        let mut entries = self.entries.lock();
        if !entries.live.contains_key(target) {
            return Err(PortError::NotPatched(target.clone()));
        }

        // SAFETY: guaranteed by `NativePort::new`
        let code = unsafe { remove(self.vtable.user, &owned.raw) };
        PortStatus::from_raw(code).into_result(target)?;

        if let Some(entry) = entries.live.remove(target) {
            entries.retired.push(entry);
        }
        Ok(())
    }

    fn verify(&self, target: &TargetDescriptor) -> Result<bool, PortError> {
        let tracked = self.entries.lock().live.contains_key(target);
        let Some(verify) = self.vtable.verify else {
            return Ok(tracked);
        };
        if !tracked {
            return Ok(false);
        }

        let owned = owned_target(target)?;
        let mut intact = false;
        // SAFETY: guaranteed by `NativePort::new`
        let code = unsafe { verify(self.vtable.user, &owned.raw, &mut intact) };
        PortStatus::from_raw(code).into_result(target)?;
        Ok(intact)
    }
}

//! C-compatible exports called by the native loader and patcher
//!
//! Every export catches panics and reports a [`HookweaveStatus`]; nothing
//! unwinds across the boundary.

use std::ffi::{c_char, c_int, c_void, CStr};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;

use tracing::instrument;

use hookweave_core::{
    DispatchEntry, HookCategory, HookError, HookPriority, HookRecord, HookResult, Orchestrator,
    OrchestratorConfig, TargetDescriptor,
};

use crate::native::{NativeFrame, NativePort, PortVTable};

static VERSION: &[u8] = b"0.1.0\0";

/// Status returned by every export
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookweaveStatus {
    Ok = 0,
    InvalidArgument = -1,
    NotFound = -2,
    Registration = -3,
    Dependency = -4,
    Conflict = -5,
    Install = -6,
    Removal = -7,
    Batch = -8,
    Io = -9,
    Panic = -10,
}

impl From<&HookError> for HookweaveStatus {
    fn from(err: &HookError) -> Self {
        match err {
            HookError::Registration(_) => Self::Registration,
            HookError::Dependency(_) => Self::Dependency,
            HookError::Conflict(_) => Self::Conflict,
            HookError::Install(_) => Self::Install,
            HookError::Removal(_) => Self::Removal,
            HookError::NotFound(_) => Self::NotFound,
        }
    }
}

/// Native hook callback
///
/// Returns 0 to continue, 1 when handled (skip the original), 2 to stop the
/// chain. Any other value is recorded as a callback failure.
pub type NativeCallback = unsafe extern "C" fn(user: *mut c_void, args: *mut c_void) -> c_int;

/// Opaque orchestrator handle owned by the loader
pub struct HookweaveHandle {
    orchestrator: Orchestrator,
}

/// Run `f`, mapping a panic to [`HookweaveStatus::Panic`]
fn guard(name: &str, f: impl FnOnce() -> HookweaveStatus) -> c_int {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(status) => status as c_int,
        Err(_) => {
            tracing::error!("Panic in {}", name);
            HookweaveStatus::Panic as c_int
        }
    }
}

/// # Safety
/// `ptr` must be null or a valid null-terminated C string that outlives `'a`
unsafe fn c_str<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok()
}

/// # Safety
/// `handle` must be null or a pointer returned by [`hookweave_create`]
unsafe fn orchestrator<'a>(handle: *mut HookweaveHandle) -> Option<&'a Orchestrator> {
    handle.as_ref().map(|h| &h.orchestrator)
}

fn status_of<T>(result: Result<T, HookError>) -> HookweaveStatus {
    match result {
        Ok(_) => HookweaveStatus::Ok,
        Err(err) => HookweaveStatus::from(&err),
    }
}

/// Run a single-hook operation by id
///
/// # Safety
/// As for [`orchestrator`] and [`c_str`]
unsafe fn manage(
    name: &str,
    handle: *mut HookweaveHandle,
    id: *const c_char,
    op: impl FnOnce(&Orchestrator, &str) -> Result<(), HookError>,
) -> c_int {
    guard(name, || {
        let (Some(orch), Some(id)) = (orchestrator(handle), c_str(id)) else {
            return HookweaveStatus::InvalidArgument;
        };
        status_of(op(orch, id))
    })
}

/// Write `msg` into a caller-supplied buffer, truncating and null-terminating
unsafe fn write_error(error: *mut c_char, maxlen: usize, msg: &str) {
    if !error.is_null() && maxlen > 0 {
        let bytes = msg.as_bytes();
        let len = bytes.len().min(maxlen - 1);
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), error as *mut u8, len);
        *error.add(len) = 0;
    }
}

/// Create an orchestrator patching through the native `vtable`
///
/// Loads config from `config_path`, or from the standard location when it
/// is null. Returns null on failure.
///
/// # Safety
/// - `config_path` must be null or a valid null-terminated C string
/// - `vtable` must point to a valid [`PortVTable`] whose functions satisfy
///   the contract of [`NativePort::new`]
#[no_mangle]
#[instrument(skip_all)]
pub unsafe extern "C" fn hookweave_create(
    config_path: *const c_char,
    vtable: *const PortVTable,
) -> *mut HookweaveHandle {
    let created = catch_unwind(AssertUnwindSafe(|| {
        let loaded = match c_str(config_path) {
            Some(path) => OrchestratorConfig::load_from(Path::new(path)),
            None => OrchestratorConfig::load(),
        };
        // `debug = true` in the config raises the default log level
        crate::init_logging(loaded.as_ref().map_or("info", |c| c.log_filter()));

        let Some(vtable) = vtable.as_ref() else {
            tracing::error!("hookweave_create called without a port table");
            return None;
        };
        let config = loaded.unwrap_or_else(|e| {
            tracing::warn!("Failed to load config, using defaults: {}", e);
            OrchestratorConfig::default()
        });

        let port = Arc::new(NativePort::new(*vtable));
        match Orchestrator::new(port, config) {
            Ok(orchestrator) => Some(Box::new(HookweaveHandle { orchestrator })),
            Err(e) => {
                tracing::error!("Failed to create orchestrator: {}", e);
                None
            }
        }
    }));

    match created {
        Ok(Some(handle)) => {
            tracing::info!("hookweave {} loaded", env!("CARGO_PKG_VERSION"));
            Box::into_raw(handle)
        }
        Ok(None) => std::ptr::null_mut(),
        Err(_) => {
            tracing::error!("Panic in hookweave_create");
            std::ptr::null_mut()
        }
    }
}

/// Remove every hook and free the handle
///
/// # Safety
/// `handle` must be null or a pointer returned by [`hookweave_create`] that
/// has not been destroyed. It is invalid afterwards.
#[no_mangle]
#[instrument(skip_all)]
pub unsafe extern "C" fn hookweave_destroy(handle: *mut HookweaveHandle) -> c_int {
    if handle.is_null() {
        return HookweaveStatus::InvalidArgument as c_int;
    }
    let handle = Box::from_raw(handle);

    guard("hookweave_destroy", move || {
        let status = match handle.orchestrator.shutdown() {
            Ok(()) => HookweaveStatus::Ok,
            Err(e) => {
                tracing::error!("Shutdown incomplete: {}", e);
                HookweaveStatus::Batch
            }
        };
        drop(handle);
        status
    })
}

/// Entry point of every natively patched call site
///
/// # Safety
/// - `entry` must be a token handed to the patcher's install function
/// - `args` is forwarded untouched to callbacks and the original
#[no_mangle]
pub unsafe extern "C" fn hookweave_dispatch(entry: *const c_void, args: *mut c_void) {
    let Some(entry) = (entry as *const DispatchEntry).as_ref() else {
        return;
    };
    let mut frame = NativeFrame { args };
    // Callback panics are already isolated; this only guards the dispatcher itself
    if catch_unwind(AssertUnwindSafe(|| entry.call(&mut frame))).is_err() {
        tracing::error!("Panic while dispatching native call");
    }
}

/// Register a hook on `module!function` backed by a native callback
///
/// `category` may be null for `custom`; `priority` is 0 (lowest) to 5 (critical).
///
/// # Safety
/// - `handle` must be a live handle from [`hookweave_create`]
/// - `id`, `module`, `function` and `category` must be valid C strings (category may be null)
/// - `callback` must be callable from any thread with `user`
#[no_mangle]
#[instrument(skip_all)]
pub unsafe extern "C" fn hookweave_register_native(
    handle: *mut HookweaveHandle,
    id: *const c_char,
    module: *const c_char,
    function: *const c_char,
    priority: u8,
    category: *const c_char,
    callback: Option<NativeCallback>,
    user: *mut c_void,
) -> c_int {
    guard("hookweave_register_native", || {
        let (Some(orch), Some(id), Some(module), Some(function), Some(callback)) = (
            orchestrator(handle),
            c_str(id),
            c_str(module),
            c_str(function),
            callback,
        ) else {
            return HookweaveStatus::InvalidArgument;
        };
        let Some(priority) = HookPriority::from_u8(priority) else {
            return HookweaveStatus::InvalidArgument;
        };
        let category = match c_str(category) {
            Some(name) => match name.parse::<HookCategory>() {
                Ok(category) => category,
                Err(e) => {
                    tracing::warn!("{}", e);
                    return HookweaveStatus::InvalidArgument;
                }
            },
            None => HookCategory::Custom,
        };

        // Carried as an integer so the closure stays Send + Sync
        let user = user as usize;
        let record = HookRecord::new(
            id,
            TargetDescriptor::symbol(module, function),
            move |ctx| {
                let args = ctx
                    .payload::<NativeFrame>()
                    .map_or(std::ptr::null_mut(), |frame| frame.args);
                // SAFETY: guaranteed by the registration contract
                match unsafe { callback(user as *mut c_void, args) } {
                    0 => Ok(HookResult::Continue),
                    1 => Ok(HookResult::Handled),
                    2 => Ok(HookResult::Stop),
                    code => Err(format!("native callback returned {}", code).into()),
                }
            },
        )
        .category(category)
        .priority(priority);

        status_of(orch.register(record))
    })
}

/// # Safety
/// `handle` must be a live handle and `id` a valid C string
#[no_mangle]
pub unsafe extern "C" fn hookweave_install(
    handle: *mut HookweaveHandle,
    id: *const c_char,
) -> c_int {
    manage("hookweave_install", handle, id, |orch, id| orch.install(id))
}

/// # Safety
/// `handle` must be a live handle and `id` a valid C string
#[no_mangle]
pub unsafe extern "C" fn hookweave_remove(
    handle: *mut HookweaveHandle,
    id: *const c_char,
) -> c_int {
    manage("hookweave_remove", handle, id, |orch, id| orch.remove(id))
}

/// # Safety
/// `handle` must be a live handle and `id` a valid C string
#[no_mangle]
pub unsafe extern "C" fn hookweave_enable(
    handle: *mut HookweaveHandle,
    id: *const c_char,
) -> c_int {
    manage("hookweave_enable", handle, id, |orch, id| orch.enable(id))
}

/// # Safety
/// `handle` must be a live handle and `id` a valid C string
#[no_mangle]
pub unsafe extern "C" fn hookweave_disable(
    handle: *mut HookweaveHandle,
    id: *const c_char,
) -> c_int {
    manage("hookweave_disable", handle, id, |orch, id| orch.disable(id))
}

/// Install every registered hook
///
/// # Safety
/// `handle` must be a live handle
#[no_mangle]
#[instrument(skip_all)]
pub unsafe extern "C" fn hookweave_install_all(handle: *mut HookweaveHandle) -> c_int {
    guard("hookweave_install_all", || {
        let Some(orch) = orchestrator(handle) else {
            return HookweaveStatus::InvalidArgument;
        };
        match orch.install_all() {
            Ok(installed) => {
                tracing::info!("Installed {} hook(s)", installed.len());
                HookweaveStatus::Ok
            }
            Err(e) => {
                tracing::warn!("{}", e);
                HookweaveStatus::Batch
            }
        }
    })
}

/// # Safety
/// `handle` must be a live handle and `path` a valid C string
#[no_mangle]
pub unsafe extern "C" fn hookweave_export_statistics(
    handle: *mut HookweaveHandle,
    path: *const c_char,
) -> c_int {
    export("hookweave_export_statistics", handle, path, |orch, path| {
        orch.export_statistics(path)
    })
}

/// # Safety
/// `handle` must be a live handle and `path` a valid C string
#[no_mangle]
pub unsafe extern "C" fn hookweave_export_hook_list(
    handle: *mut HookweaveHandle,
    path: *const c_char,
) -> c_int {
    export("hookweave_export_hook_list", handle, path, |orch, path| {
        orch.export_hook_list(path)
    })
}

unsafe fn export(
    name: &str,
    handle: *mut HookweaveHandle,
    path: *const c_char,
    op: impl FnOnce(&Orchestrator, &Path) -> Result<(), hookweave_core::ExportError>,
) -> c_int {
    guard(name, || {
        let (Some(orch), Some(path)) = (orchestrator(handle), c_str(path)) else {
            return HookweaveStatus::InvalidArgument;
        };
        match op(orch, Path::new(path)) {
            Ok(()) => HookweaveStatus::Ok,
            Err(e) => {
                tracing::error!("{} failed: {}", name, e);
                HookweaveStatus::Io
            }
        }
    })
}

/// Copy the most recent error message into `buffer`
///
/// Returns false if there is no error to report.
///
/// # Safety
/// - `handle` must be a live handle
/// - `buffer` must be null or valid for `maxlen` bytes
#[no_mangle]
pub unsafe extern "C" fn hookweave_last_error(
    handle: *mut HookweaveHandle,
    buffer: *mut c_char,
    maxlen: usize,
) -> bool {
    let message = catch_unwind(AssertUnwindSafe(|| {
        orchestrator(handle).and_then(Orchestrator::last_error)
    }));
    match message {
        Ok(Some(message)) => {
            write_error(buffer, maxlen, &message);
            true
        }
        _ => false,
    }
}

#[no_mangle]
pub extern "C" fn hookweave_version() -> *const c_char {
    VERSION.as_ptr() as *const c_char
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::ffi::CString;

    use parking_lot::Mutex;

    use crate::native::{NativeTarget, OriginalFn, PortStatus};

    /// Argument block shared by the fake site, callbacks and original
    #[repr(C)]
    #[derive(Default)]
    struct Calls {
        callback: u32,
        original: u32,
    }

    /// Patcher that records entry tokens instead of rewriting code
    #[derive(Default)]
    struct FakePatcher {
        sites: Mutex<HashMap<String, usize>>,
    }

    impl FakePatcher {
        /// Call the site the way patched native code would
        unsafe fn call(&self, function: &str, calls: &mut Calls) {
            let token = self.sites.lock().get(function).copied();
            let args = calls as *mut Calls as *mut c_void;
            match token {
                Some(token) => hookweave_dispatch(token as *const c_void, args),
                None => fake_original(args),
            }
        }
    }

    unsafe fn function_of(target: *const NativeTarget) -> String {
        CStr::from_ptr((*target).function).to_string_lossy().into_owned()
    }

    unsafe extern "C" fn fake_install(
        user: *mut c_void,
        target: *const NativeTarget,
        entry: *const c_void,
        _dispatch: crate::native::DispatchFn,
        original: *mut usize,
    ) -> c_int {
        let patcher = &*(user as *const FakePatcher);
        let function = function_of(target);
        if function == "Missing" {
            return PortStatus::TargetNotFound as c_int;
        }
        patcher.sites.lock().insert(function, entry as usize);
        *original = fake_original as OriginalFn as usize;
        PortStatus::Ok as c_int
    }

    unsafe extern "C" fn fake_remove(user: *mut c_void, target: *const NativeTarget) -> c_int {
        let patcher = &*(user as *const FakePatcher);
        match patcher.sites.lock().remove(&function_of(target)) {
            Some(_) => PortStatus::Ok as c_int,
            None => PortStatus::NotPatched as c_int,
        }
    }

    unsafe extern "C" fn fake_original(args: *mut c_void) {
        (*(args as *mut Calls)).original += 1;
    }

    unsafe extern "C" fn counting_callback(_user: *mut c_void, args: *mut c_void) -> c_int {
        (*(args as *mut Calls)).callback += 1;
        0
    }

    unsafe extern "C" fn handling_callback(_user: *mut c_void, args: *mut c_void) -> c_int {
        (*(args as *mut Calls)).callback += 1;
        1
    }

    struct Harness {
        patcher: Box<FakePatcher>,
        handle: *mut HookweaveHandle,
        config: std::path::PathBuf,
    }

    impl Harness {
        fn new(name: &str) -> Self {
            let patcher = Box::new(FakePatcher::default());
            let vtable = PortVTable {
                user: &*patcher as *const FakePatcher as *mut c_void,
                install: Some(fake_install),
                remove: Some(fake_remove),
                verify: None,
            };
            let config = std::env::temp_dir().join(format!(
                "hookweave-ffi-{}-{}.toml",
                name,
                std::process::id()
            ));
            let path = CString::new(config.to_string_lossy().into_owned()).unwrap();
            let handle = unsafe { hookweave_create(path.as_ptr(), &vtable) };
            assert!(!handle.is_null());
            Self {
                patcher,
                handle,
                config,
            }
        }

        fn register(&self, id: &str, function: &str, callback: NativeCallback) -> c_int {
            let id = CString::new(id).unwrap();
            let module = CString::new("game.exe").unwrap();
            let function = CString::new(function).unwrap();
            unsafe {
                hookweave_register_native(
                    self.handle,
                    id.as_ptr(),
                    module.as_ptr(),
                    function.as_ptr(),
                    2,
                    std::ptr::null(),
                    Some(callback),
                    std::ptr::null_mut(),
                )
            }
        }

        fn install(&self, id: &str) -> c_int {
            let id = CString::new(id).unwrap();
            unsafe { hookweave_install(self.handle, id.as_ptr()) }
        }

        fn remove(&self, id: &str) -> c_int {
            let id = CString::new(id).unwrap();
            unsafe { hookweave_remove(self.handle, id.as_ptr()) }
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            unsafe { hookweave_destroy(self.handle) };
            let _ = std::fs::remove_file(&self.config);
        }
    }

    #[test]
    fn test_native_round_trip() {
        let h = Harness::new("round-trip");
        assert_eq!(h.register("tick", "Tick", counting_callback), 0);
        assert_eq!(h.install("tick"), 0);

        let mut calls = Calls::default();
        unsafe { h.patcher.call("Tick", &mut calls) };
        assert_eq!((calls.callback, calls.original), (1, 1));

        assert_eq!(h.remove("tick"), 0);
        unsafe { h.patcher.call("Tick", &mut calls) };
        assert_eq!((calls.callback, calls.original), (1, 2));
    }

    #[test]
    fn test_handled_skips_native_original() {
        let h = Harness::new("handled");
        assert_eq!(h.register("block", "Fire", handling_callback), 0);
        assert_eq!(h.install("block"), 0);

        let mut calls = Calls::default();
        unsafe { h.patcher.call("Fire", &mut calls) };
        assert_eq!((calls.callback, calls.original), (1, 0));
    }

    #[test]
    fn test_status_codes_and_last_error() {
        let h = Harness::new("status");
        assert_eq!(h.install("ghost"), HookweaveStatus::NotFound as c_int);
        assert_eq!(h.register("gone", "Missing", counting_callback), 0);
        assert_eq!(h.install("gone"), HookweaveStatus::Install as c_int);
        assert_eq!(
            h.register("gone", "Missing", counting_callback),
            HookweaveStatus::Registration as c_int
        );

        let mut buffer = [0 as c_char; 128];
        assert!(unsafe { hookweave_last_error(h.handle, buffer.as_mut_ptr(), buffer.len()) });
        let message = unsafe { CStr::from_ptr(buffer.as_ptr()) }.to_string_lossy();
        assert!(message.contains("already registered"));
    }

    #[test]
    fn test_invalid_arguments() {
        unsafe {
            assert_eq!(
                hookweave_install(std::ptr::null_mut(), std::ptr::null()),
                HookweaveStatus::InvalidArgument as c_int
            );
            assert_eq!(
                hookweave_destroy(std::ptr::null_mut()),
                HookweaveStatus::InvalidArgument as c_int
            );
            assert!(hookweave_create(std::ptr::null(), std::ptr::null()).is_null());
            hookweave_dispatch(std::ptr::null(), std::ptr::null_mut());
        }

        let h = Harness::new("invalid");
        let id = CString::new("x").unwrap();
        let status = unsafe {
            hookweave_register_native(
                h.handle,
                id.as_ptr(),
                id.as_ptr(),
                id.as_ptr(),
                9,
                std::ptr::null(),
                Some(counting_callback),
                std::ptr::null_mut(),
            )
        };
        assert_eq!(status, HookweaveStatus::InvalidArgument as c_int);
    }

    #[test]
    fn test_exports_write_files() {
        let h = Harness::new("exports");
        assert_eq!(h.register("tick", "Tick", counting_callback), 0);
        assert_eq!(unsafe { hookweave_install_all(h.handle) }, 0);

        let path = std::env::temp_dir()
            .join(format!("hookweave-ffi-hooks-{}.json", std::process::id()));
        let c_path = CString::new(path.to_string_lossy().into_owned()).unwrap();
        assert_eq!(unsafe { hookweave_export_hook_list(h.handle, c_path.as_ptr()) }, 0);
        assert!(std::fs::read_to_string(&path).unwrap().contains("\"tick\""));
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_version_string() {
        let version = unsafe { CStr::from_ptr(hookweave_version()) };
        assert_eq!(version.to_str().unwrap(), env!("CARGO_PKG_VERSION"));
    }
}

//! hookweave plugin - FFI layer
//!
//! This crate provides the C ABI through which a native patcher and an
//! injected loader drive the hookweave core. It compiles to a cdylib
//! (.so/.dll).

pub mod ffi;
pub mod native;

use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter
pub const LOG_ENV: &str = "HOOKWEAVE_LOG";

/// Initialize the tracing subscriber once per process
///
/// The filter comes from `HOOKWEAVE_LOG` (e.g. `hookweave_core=debug`),
/// falling back to `default_filter`.
pub fn init_logging(default_filter: &str) {
    let filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

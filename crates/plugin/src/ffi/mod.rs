//! C ABI surface

pub mod exports;

pub use exports::{hookweave_dispatch, HookweaveHandle, HookweaveStatus};

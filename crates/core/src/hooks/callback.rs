//! Typed callback boundary
//!
//! Callbacks receive a [`CallContext`] describing the intercepted call. The
//! call's arguments travel as a type-erased payload that callbacks downcast to
//! the concrete type their adapter documents.

use std::any::Any;
use std::sync::Arc;

use super::port::OriginalHandle;
use super::types::{HookId, TargetDescriptor};

/// Type-erased argument block of an intercepted call
pub type Payload = dyn Any + Send;

/// Error a callback may return to signal it failed
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// Handler invoked for every call to a hooked target
pub type HookCallback =
    Arc<dyn Fn(&mut CallContext<'_>) -> Result<HookResult, CallbackError> + Send + Sync>;

/// Invoked once after a hook has been removed from its target
pub type CleanupCallback = Arc<dyn Fn() + Send + Sync>;

/// Result from a hook callback determining how the chain proceeds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum HookResult {
    /// Pass through to the next callback and finally the original
    Continue = 0,

    /// Skip the original, but keep running the remaining callbacks
    Handled = 1,

    /// Skip the original AND the remaining callbacks
    Stop = 2,
}

impl Default for HookResult {
    fn default() -> Self {
        Self::Continue
    }
}

/// View of one intercepted call, handed to each callback in the chain
pub struct CallContext<'a> {
    target: &'a TargetDescriptor,
    hook_id: Option<&'a HookId>,
    payload: &'a mut Payload,
    original: Option<&'a OriginalHandle>,
    original_consumed: bool,
    /// The original actually ran through `call_original`
    original_called: bool,
}

impl<'a> CallContext<'a> {
    pub(crate) fn new(
        target: &'a TargetDescriptor,
        payload: &'a mut Payload,
        original: Option<&'a OriginalHandle>,
    ) -> Self {
        Self {
            target,
            hook_id: None,
            payload,
            original,
            original_consumed: false,
            original_called: false,
        }
    }

    pub(crate) fn set_hook(&mut self, id: &'a HookId) {
        self.hook_id = Some(id);
    }

    /// Target being intercepted
    pub fn target(&self) -> &TargetDescriptor {
        self.target
    }

    /// Id of the hook whose callback is currently running
    pub fn hook_id(&self) -> Option<&HookId> {
        self.hook_id
    }

    /// Borrow the call's arguments as `T`
    ///
    /// Returns `None` if the adapter passed a different payload type.
    pub fn payload<T: Any>(&mut self) -> Option<&mut T> {
        self.payload.downcast_mut::<T>()
    }

    /// Handle to the original code of the target
    pub fn original(&self) -> Option<&OriginalHandle> {
        self.original
    }

    /// Prevent the original from running as the terminal step of this call
    pub fn suppress_original(&mut self) {
        self.original_consumed = true;
    }

    /// Run the original now, from inside the callback
    ///
    /// The terminal step is skipped afterwards, so the original still runs
    /// once per call. Calling this twice is a no-op the second time.
    pub fn call_original(&mut self) -> bool {
        if self.original_consumed {
            return false;
        }
        self.original_consumed = true;
        match self.original {
            Some(original) => {
                self.original_called = true;
                original.call(self.payload);
                true
            }
            None => false,
        }
    }

    /// Whether the terminal original call has been suppressed or already made
    pub fn original_consumed(&self) -> bool {
        self.original_consumed
    }

    /// Undo a suppression made by a callback that then faulted
    ///
    /// A faulting callback counts as pass-through, so only an original it
    /// actually ran stays consumed.
    pub(crate) fn revert_suppression(&mut self, consumed_before: bool) {
        if !self.original_called {
            self.original_consumed = consumed_before;
        }
    }

    pub(crate) fn into_payload(self) -> &'a mut Payload {
        self.payload
    }
}

/// Wrap a closure as a [`HookCallback`]
pub fn callback<F>(f: F) -> HookCallback
where
    F: Fn(&mut CallContext<'_>) -> Result<HookResult, CallbackError> + Send + Sync + 'static,
{
    Arc::new(f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_payload_downcast() {
        let target = TargetDescriptor::symbol("game.exe", "Tick");
        let mut frame = 41u32;
        let mut ctx = CallContext::new(&target, &mut frame, None);

        *ctx.payload::<u32>().unwrap() += 1;
        assert!(ctx.payload::<String>().is_none());
        drop(ctx);
        assert_eq!(frame, 42);
    }

    #[test]
    fn test_call_original_runs_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let original = OriginalHandle::from_fn(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let target = TargetDescriptor::symbol("game.exe", "Tick");
        let mut frame = ();
        let mut ctx = CallContext::new(&target, &mut frame, Some(&original));

        assert!(ctx.call_original());
        assert!(!ctx.call_original());
        assert!(ctx.original_consumed());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_revert_suppression() {
        let original = OriginalHandle::from_fn(|_| {});
        let target = TargetDescriptor::symbol("game.exe", "Tick");
        let mut frame = ();
        let mut ctx = CallContext::new(&target, &mut frame, Some(&original));

        ctx.suppress_original();
        ctx.revert_suppression(false);
        assert!(!ctx.original_consumed());

        // An original that already ran stays consumed
        assert!(ctx.call_original());
        ctx.revert_suppression(false);
        assert!(ctx.original_consumed());
    }
}

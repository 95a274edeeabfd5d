//! Invocation dispatch and the thread-local current script.
//!
//! Runtime support called from kernel code (for example resolving a raw
//! buffer pointer back to its allocation) needs to know which instance is
//! running on the calling thread. Every entry into script code installs a
//! [`ScriptScope`] that publishes the instance and restores the previous one
//! when dropped, unwinding included.

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::Arc;

use kscript_device::Allocation;
use tracing::trace;

use crate::script::ScriptInstance;
use crate::sink::ErrorKind;

thread_local! {
    static CURRENT: Cell<*const ScriptInstance> = const { Cell::new(std::ptr::null()) };
}

/// Publishes a script as current on this thread until dropped.
#[must_use = "the script is only current while the scope is alive"]
pub struct ScriptScope<'a> {
    previous: *const ScriptInstance,
    // Bound to the installing thread.
    _marker: PhantomData<(&'a ScriptInstance, *const ())>,
}

impl<'a> ScriptScope<'a> {
    pub fn enter(script: &'a ScriptInstance) -> Self {
        let previous = CURRENT.with(|current| current.replace(script));
        Self { previous, _marker: PhantomData }
    }
}

impl Drop for ScriptScope<'_> {
    fn drop(&mut self) {
        CURRENT.with(|current| current.set(self.previous));
    }
}

/// Run `f` with the script current on this thread, if any.
pub fn with_current_script<R>(f: impl FnOnce(Option<&ScriptInstance>) -> R) -> R {
    let ptr = CURRENT.with(Cell::get);
    // SAFETY: a non-null pointer was installed by a live ScriptScope, whose
    // borrow keeps the instance alive until the scope restores the slot.
    f(unsafe { ptr.as_ref() })
}

/// Allocation bound to the current script whose storage starts at `ptr`.
pub fn current_allocation_for_pointer(ptr: *const u8) -> Option<Arc<Allocation>> {
    with_current_script(|script| script.and_then(|s| s.allocation_for_pointer(ptr)))
}

impl ScriptInstance {
    /// Call the plain `root` entry point. `None` when the script has none.
    pub fn invoke_root(&self) -> Option<i32> {
        let root = self.module().symbols().root?;
        let _scope = ScriptScope::enter(self);
        trace!(script.name = %self.name(), "invoking root");
        // SAFETY: resolved from the module with the root ABI.
        Some(unsafe { root() })
    }

    /// Run the script's initializer, if it exports one.
    pub fn invoke_init(&self) {
        if let Some(init) = self.module().symbols().init {
            let _scope = ScriptScope::enter(self);
            // SAFETY: resolved from the module with the init ABI.
            unsafe { init() };
        }
    }

    /// Run the script-side destructor that releases objects the script owns.
    pub fn invoke_free_children(&self) {
        if let Some(free_children) = self.module().symbols().free_children {
            let _scope = ScriptScope::enter(self);
            // SAFETY: resolved from the module with the destructor ABI.
            unsafe { free_children() };
        }
    }

    /// Call exported function `slot` with a packed argument block.
    ///
    /// A block longer than `u32::MAX` bytes is reported as `BadValue` and the
    /// call is skipped.
    ///
    /// # Panics
    ///
    /// If `slot` is not an exported function.
    ///
    /// # Safety
    ///
    /// `params` must have the layout the function expects.
    pub unsafe fn invoke_function(&self, slot: usize, params: &[u8]) {
        let function = self.module().symbols().functions[slot];
        let Ok(len) = u32::try_from(params.len()) else {
            self.report(ErrorKind::BadValue, &format!("argument block for function {slot} exceeds 32 bits"));
            return;
        };
        let _scope = ScriptScope::enter(self);
        trace!(script.name = %self.name(), function.slot = slot, params.len = len, "invoking function");
        unsafe { function(params.as_ptr().cast(), len) };
    }
}

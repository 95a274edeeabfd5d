//! Script instances.

use std::sync::Arc;

use kscript_device::{Allocation, Element, ObjectRef, ScriptObject};
use tracing::{debug, warn};

use crate::dispatcher::Dispatcher;
use crate::loader::{LoadedModule, Mapping};
use crate::sink::{ErrorKind, ErrorSink};
use crate::symbols::RootEntry;

/// Element layout last written into a variable slot.
#[derive(Debug, Clone)]
pub(crate) struct SlotLayout {
    pub(crate) element: Arc<Element>,
    pub(crate) count: usize,
}

/// Summary of what a script exports.
#[derive(Debug, Clone)]
pub struct ScriptInfo {
    pub exported_function_count: usize,
    pub exported_variable_count: usize,
    pub exported_kernel_count: usize,
    pub object_slot_count: usize,
    pub pragmas: Vec<(String, String)>,
    /// Expanded root when exported, else plain root.
    pub root: Option<RootEntry>,
    pub mapping: Mapping,
}

/// One logical instance of a loaded script, with its own globals.
pub struct ScriptInstance {
    module: LoadedModule,
    pub(crate) bound: Vec<Option<Arc<Allocation>>>,
    pub(crate) layouts: Vec<Option<SlotLayout>>,
    sink: Arc<dyn ErrorSink>,
    dispatcher: Arc<dyn Dispatcher>,
    threadable: bool,
}

impl std::fmt::Debug for ScriptInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptInstance")
            .field("name", &self.module.name())
            .field("mapping", &self.module.mapping())
            .field("threadable", &self.threadable)
            .finish()
    }
}

impl ScriptInstance {
    pub fn new(module: LoadedModule, sink: Arc<dyn ErrorSink>, dispatcher: Arc<dyn Dispatcher>) -> Self {
        let slots = module.symbols().variables.len();
        let threadable = module.threadable();
        Self { module, bound: vec![None; slots], layouts: vec![None; slots], sink, dispatcher, threadable }
    }

    pub fn name(&self) -> &str {
        self.module.name()
    }

    pub fn module(&self) -> &LoadedModule {
        &self.module
    }

    pub(crate) fn dispatcher(&self) -> &dyn Dispatcher {
        self.dispatcher.as_ref()
    }

    pub(crate) fn report(&self, kind: ErrorKind, message: &str) {
        self.sink.report_error(kind, &format!("{}: {message}", self.name()));
    }

    pub fn info(&self) -> ScriptInfo {
        let symbols = self.module.symbols();
        ScriptInfo {
            exported_function_count: symbols.functions.len(),
            exported_variable_count: symbols.variables.len(),
            exported_kernel_count: symbols.kernels.len(),
            object_slot_count: symbols.object_slots.iter().filter(|&&o| o).count(),
            pragmas: symbols.metadata.pragmas.clone(),
            root: symbols.preferred_root(),
            mapping: self.module.mapping(),
        }
    }

    pub fn is_threadable(&self) -> bool {
        self.threadable
    }

    /// Allow or forbid multi-threaded launches. A module that vetoes
    /// threading stays single-threaded.
    pub fn set_threadable(&mut self, threadable: bool) {
        self.threadable = threadable && self.module.threadable();
    }

    /// Address of variable `slot`, null when optimized away.
    ///
    /// # Panics
    ///
    /// If `slot` is not an exported variable.
    pub fn variable_address(&self, slot: usize) -> *mut u8 {
        let variables = &self.module.symbols().variables;
        assert!(
            slot < variables.len(),
            "variable slot {slot} out of range for '{}' ({} exported)",
            self.name(),
            variables.len()
        );
        variables[slot]
    }

    /// Bound allocation whose storage starts at `ptr`.
    pub fn allocation_for_pointer(&self, ptr: *const u8) -> Option<Arc<Allocation>> {
        if ptr.is_null() {
            return None;
        }
        let found = self.bound.iter().flatten().find(|a| std::ptr::eq(a.raw_ptr(), ptr)).cloned();
        if found.is_none() {
            warn!(script.name = %self.name(), ?ptr, "no bound allocation for pointer");
        }
        found
    }
}

impl Drop for ScriptInstance {
    fn drop(&mut self) {
        let symbols = self.module.symbols();
        for (slot, &addr) in symbols.variables.iter().enumerate() {
            if addr.is_null() {
                continue;
            }
            match &self.layouts[slot] {
                Some(layout) if layout.element.has_references() => {
                    let stride = layout.element.size_bytes();
                    for i in 0..layout.count {
                        // SAFETY: the slot holds `count` elements written by set_variable_with_element.
                        unsafe { layout.element.dec_refs(addr.add(i * stride)) };
                    }
                }
                _ if symbols.object_slots[slot] => {
                    // SAFETY: object slots hold a null or owned object pointer.
                    unsafe { ObjectRef::clear_raw(addr.cast::<*const ScriptObject>()) };
                }
                _ => {}
            }
        }
        debug!(script.name = %self.name(), "script instance destroyed");
    }
}

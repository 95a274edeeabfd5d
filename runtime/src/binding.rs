//! Global variable binding.
//!
//! Every operation addresses a variable by slot. Slots whose global was
//! optimized away are silently skipped; slots out of range panic.

use std::sync::Arc;

use kscript_device::{Allocation, Element, ObjectRef, ScriptObject};
use snafu::ensure;
use tracing::trace;

use crate::error::{Result, TransferSizeSnafu, UnsupportedDimensionalitySnafu};
use crate::script::{ScriptInstance, SlotLayout};
use crate::sink::ErrorKind;

impl ScriptInstance {
    /// Copy `bytes` over variable `slot`.
    ///
    /// # Safety
    ///
    /// `bytes` must not be longer than the variable.
    pub unsafe fn set_variable(&mut self, slot: usize, bytes: &[u8]) {
        let addr = self.variable_address(slot);
        if addr.is_null() {
            return;
        }
        trace!(script.name = %self.name(), variable.slot = slot, variable.bytes = bytes.len(), "set variable");
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), addr, bytes.len()) };
    }

    /// Copy variable `slot` into `out`.
    ///
    /// # Safety
    ///
    /// `out` must not be longer than the variable.
    pub unsafe fn get_variable(&self, slot: usize, out: &mut [u8]) {
        let addr = self.variable_address(slot);
        if addr.is_null() {
            return;
        }
        unsafe { std::ptr::copy_nonoverlapping(addr, out.as_mut_ptr(), out.len()) };
    }

    /// Overwrite an array of `dims[0]` elements, keeping object references balanced.
    ///
    /// Incoming references are taken before outgoing ones are released, so
    /// writing a slot's current contents back leaves every count unchanged.
    ///
    /// # Safety
    ///
    /// The variable must hold `dims[0]` values of `element`, and every object
    /// handle in `bytes` and in the slot must be null or live.
    pub unsafe fn set_variable_with_element(
        &mut self,
        slot: usize,
        bytes: &[u8],
        element: &Arc<Element>,
        dims: &[usize],
    ) -> Result<()> {
        ensure!(dims.len() == 1, UnsupportedDimensionalitySnafu { dims: dims.len() });
        let count = dims[0];
        let stride = element.size_bytes();
        let expected = stride * count;
        ensure!(bytes.len() >= expected, TransferSizeSnafu { expected, actual: bytes.len() });

        let addr = self.variable_address(slot);
        if addr.is_null() {
            return Ok(());
        }

        unsafe {
            for i in 0..count {
                element.inc_refs(bytes.as_ptr().add(i * stride));
            }
            for i in 0..count {
                element.dec_refs(addr.add(i * stride));
            }
            std::ptr::copy(bytes.as_ptr(), addr, expected);
        }

        self.layouts[slot] = Some(SlotLayout { element: Arc::clone(element), count });
        trace!(script.name = %self.name(), variable.slot = slot, variable.count = count, "set variable with element");
        Ok(())
    }

    /// Bind `allocation`'s storage pointer (or null) to variable `slot`.
    pub fn set_variable_bound_buffer(&mut self, slot: usize, allocation: Option<Arc<Allocation>>) {
        let addr = self.variable_address(slot);
        if addr.is_null() {
            return;
        }
        let ptr = allocation.as_ref().map_or(std::ptr::null_mut(), |a| a.raw_ptr());
        // SAFETY: bound-buffer globals are pointer sized.
        unsafe { addr.cast::<*mut u8>().write_unaligned(ptr) };
        self.bound[slot] = allocation;
    }

    /// Store an object handle in variable `slot`, transferring one reference.
    ///
    /// Slots the metadata does not declare as objects are rejected with `BadValue`.
    pub fn set_variable_object(&mut self, slot: usize, object: Option<&ObjectRef>) {
        let addr = self.variable_address(slot);
        if addr.is_null() {
            return;
        }
        if !self.module().symbols().object_slots[slot] {
            self.report(ErrorKind::BadValue, &format!("variable slot {slot} does not hold an object"));
            return;
        }
        // SAFETY: object globals hold a null or owned object pointer.
        unsafe { ObjectRef::store_raw(addr.cast::<*const ScriptObject>(), object) };
    }
}

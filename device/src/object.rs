//! Reference-counted script objects.
//!
//! Object-typed globals inside a loaded kernel module hold a raw pointer to a
//! [`ScriptObject`]. Each non-null pointer stored in such a slot owns one strong
//! reference. [`ObjectRef`] is the owned handle on the host side; the `*_raw`
//! helpers move references in and out of raw slots without ever letting the
//! count dip below the number of live holders.

use std::fmt;
use std::sync::Arc;

use crate::Allocation;

/// Kind of a script object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum ObjectKind {
    Element,
    Type,
    Allocation,
    Sampler,
    Script,
}

/// Host-side object that kernel code refers to by pointer.
pub struct ScriptObject {
    kind: ObjectKind,
    label: String,
    allocation: Option<Arc<Allocation>>,
}

impl fmt::Debug for ScriptObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptObject").field("kind", &self.kind).field("label", &self.label).finish()
    }
}

impl ScriptObject {
    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Allocation carried by an [`ObjectKind::Allocation`] object.
    pub fn allocation(&self) -> Option<&Arc<Allocation>> {
        self.allocation.as_ref()
    }
}

/// Owned strong reference to a [`ScriptObject`].
#[derive(Debug, Clone)]
pub struct ObjectRef(Arc<ScriptObject>);

impl ObjectRef {
    pub fn new(kind: ObjectKind, label: impl Into<String>) -> Self {
        Self(Arc::new(ScriptObject { kind, label: label.into(), allocation: None }))
    }

    /// Wrap an allocation so it can be stored in object-typed globals.
    pub fn from_allocation(allocation: Arc<Allocation>, label: impl Into<String>) -> Self {
        Self(Arc::new(ScriptObject { kind: ObjectKind::Allocation, label: label.into(), allocation: Some(allocation) }))
    }

    pub fn as_ptr(&self) -> *const ScriptObject {
        Arc::as_ptr(&self.0)
    }

    /// Number of strong references, including ones held by raw slots.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// Take an extra strong reference on behalf of a raw holder.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or point to a live object obtained from [`ObjectRef::as_ptr`].
    pub unsafe fn retain_raw(ptr: *const ScriptObject) {
        if !ptr.is_null() {
            unsafe { Arc::increment_strong_count(ptr) };
        }
    }

    /// Drop a strong reference previously taken by [`ObjectRef::retain_raw`].
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a pointer whose raw holder owns one strong reference.
    pub unsafe fn release_raw(ptr: *const ScriptObject) {
        if !ptr.is_null() {
            unsafe { Arc::decrement_strong_count(ptr) };
        }
    }

    /// Produce a new owned handle from a raw slot value without consuming the slot's reference.
    ///
    /// # Safety
    ///
    /// Same as [`ObjectRef::retain_raw`].
    pub unsafe fn from_raw_borrowed(ptr: *const ScriptObject) -> Option<Self> {
        if ptr.is_null() {
            return None;
        }
        unsafe {
            Arc::increment_strong_count(ptr);
            Some(Self(Arc::from_raw(ptr)))
        }
    }

    /// Store `value` into a raw object slot, transferring ownership.
    ///
    /// The new reference is taken before the old one is dropped, so assigning a
    /// slot its own current value never frees the object.
    ///
    /// # Safety
    ///
    /// `slot` must be valid for pointer-sized reads and writes (no alignment
    /// requirement) and its current value must satisfy [`ObjectRef::release_raw`].
    pub unsafe fn store_raw(slot: *mut *const ScriptObject, value: Option<&ObjectRef>) {
        let new = value.map_or(std::ptr::null(), ObjectRef::as_ptr);
        unsafe {
            Self::retain_raw(new);
            let old = slot.read_unaligned();
            Self::release_raw(old);
            slot.write_unaligned(new);
        }
    }

    /// Release whatever a raw slot holds and null it.
    ///
    /// # Safety
    ///
    /// Same as [`ObjectRef::store_raw`].
    pub unsafe fn clear_raw(slot: *mut *const ScriptObject) {
        unsafe { Self::store_raw(slot, None) }
    }
}

impl std::ops::Deref for ObjectRef {
    type Target = ScriptObject;

    fn deref(&self) -> &ScriptObject {
        &self.0
    }
}

impl PartialEq for ObjectRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for ObjectRef {}

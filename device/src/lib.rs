//! Element, object and allocation model for kscript kernels.
//!
//! The runtime crate consumes these types only through their raw views
//! (storage pointer, strides, extents, object pointers); everything else is
//! host-side convenience.

pub mod allocation;
pub mod element;
pub mod error;
pub mod object;


pub use allocation::{Allocation, Extent, STORAGE_ALIGN};
pub use element::{DataType, Element, Field, Scalar};
pub use error::*;
pub use object::{ObjectKind, ObjectRef, ScriptObject};

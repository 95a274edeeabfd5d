//! Element descriptors.
//!
//! An [`Element`] describes the layout of one cell of an allocation or one
//! entry of a global array: a primitive (optionally vectorized) or a struct of
//! named fields. Elements that contain object handles know how to walk a
//! packed value and retain/release every handle inside it.

use std::sync::Arc;

use snafu::ensure;

use crate::error::{InvalidVectorWidthSnafu, ObjectVectorSnafu, Result};
use crate::{ObjectKind, ObjectRef, ScriptObject};

/// Primitive data types understood by kernel code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum DataType {
    Bool,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float16,
    Float32,
    Float64,
    /// Pointer-sized handle to a [`ScriptObject`].
    Object(ObjectKind),
}

impl DataType {
    /// Size in bytes of one scalar of this type.
    pub const fn bytes(self) -> usize {
        match self {
            DataType::Bool | DataType::Int8 | DataType::UInt8 => 1,
            DataType::Int16 | DataType::UInt16 | DataType::Float16 => 2,
            DataType::Int32 | DataType::UInt32 | DataType::Float32 => 4,
            DataType::Int64 | DataType::UInt64 | DataType::Float64 => 8,
            DataType::Object(_) => size_of::<*const ScriptObject>(),
        }
    }

    pub const fn is_object(self) -> bool {
        matches!(self, DataType::Object(_))
    }
}

/// Host scalar types with a matching [`DataType`].
pub trait Scalar: Copy + Default + private::Sealed + 'static {
    const DATA_TYPE: DataType;
}

mod private {
    pub trait Sealed {}
}

macro_rules! impl_scalar {
    ($($ty:ty => $dt:ident),* $(,)?) => {
        $(
            impl private::Sealed for $ty {}
            impl Scalar for $ty {
                const DATA_TYPE: DataType = DataType::$dt;
            }
        )*
    };
}

impl_scalar! {
    i8 => Int8, u8 => UInt8, i16 => Int16, u16 => UInt16, i32 => Int32, u32 => UInt32,
    i64 => Int64, u64 => UInt64, f32 => Float32, f64 => Float64,
}

/// A named member of a struct element.
#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,
    pub element: Arc<Element>,
    /// Number of consecutive entries (1 for a plain member).
    pub array_size: usize,
    /// Byte offset from the start of the enclosing struct.
    pub offset: usize,
}

#[derive(Debug, Clone)]
enum Layout {
    Primitive { data_type: DataType, vector_size: usize },
    Struct { fields: Vec<Field> },
}

/// Layout descriptor for one element.
#[derive(Debug, Clone)]
pub struct Element {
    layout: Layout,
    size_bytes: usize,
    align: usize,
    has_references: bool,
}

impl Element {
    pub fn primitive(data_type: DataType) -> Arc<Self> {
        let size = data_type.bytes();
        Arc::new(Self {
            layout: Layout::Primitive { data_type, vector_size: 1 },
            size_bytes: size,
            align: size,
            has_references: data_type.is_object(),
        })
    }

    /// Vector of 2, 3 or 4 lanes. Three-lane vectors are padded to four.
    pub fn vector(data_type: DataType, vector_size: usize) -> Result<Arc<Self>> {
        ensure!((2..=4).contains(&vector_size), InvalidVectorWidthSnafu { width: vector_size });
        if let DataType::Object(kind) = data_type {
            return ObjectVectorSnafu { kind }.fail();
        }

        let size = data_type.bytes() * vector_size.next_power_of_two();
        Ok(Arc::new(Self {
            layout: Layout::Primitive { data_type, vector_size },
            size_bytes: size,
            align: size,
            has_references: false,
        }))
    }

    /// Struct element. Members are laid out in order with natural alignment.
    pub fn structure<S: Into<String>>(members: impl IntoIterator<Item = (S, Arc<Element>, usize)>) -> Arc<Self> {
        let mut offset = 0usize;
        let mut align = 1usize;
        let mut has_references = false;
        let mut fields = Vec::new();

        for (name, element, array_size) in members {
            let array_size = array_size.max(1);
            offset = offset.next_multiple_of(element.align);
            align = align.max(element.align);
            has_references |= element.has_references;
            fields.push(Field { name: name.into(), element: Arc::clone(&element), array_size, offset });
            offset += element.size_bytes * array_size;
        }

        Arc::new(Self {
            layout: Layout::Struct { fields },
            size_bytes: offset.next_multiple_of(align),
            align,
            has_references,
        })
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    pub fn align(&self) -> usize {
        self.align
    }

    /// Whether values of this element hold object handles.
    pub fn has_references(&self) -> bool {
        self.has_references
    }

    /// Primitive type, or `None` for structs.
    pub fn data_type(&self) -> Option<DataType> {
        match self.layout {
            Layout::Primitive { data_type, .. } => Some(data_type),
            Layout::Struct { .. } => None,
        }
    }

    pub fn vector_size(&self) -> usize {
        match self.layout {
            Layout::Primitive { vector_size, .. } => vector_size,
            Layout::Struct { .. } => 1,
        }
    }

    pub fn fields(&self) -> &[Field] {
        match &self.layout {
            Layout::Primitive { .. } => &[],
            Layout::Struct { fields } => fields,
        }
    }

    /// Retain every object handle inside the value at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must be readable for [`Element::size_bytes`] bytes and every handle
    /// inside must be null or a live object pointer.
    pub unsafe fn inc_refs(&self, ptr: *const u8) {
        unsafe { self.walk_refs(ptr, |obj| ObjectRef::retain_raw(obj)) }
    }

    /// Release every object handle inside the value at `ptr`.
    ///
    /// # Safety
    ///
    /// Same as [`Element::inc_refs`], and each handle must own a reference.
    pub unsafe fn dec_refs(&self, ptr: *const u8) {
        unsafe { self.walk_refs(ptr, |obj| ObjectRef::release_raw(obj)) }
    }

    unsafe fn walk_refs(&self, ptr: *const u8, mut visit: impl FnMut(*const ScriptObject)) {
        if !self.has_references {
            return;
        }
        unsafe { self.walk_refs_inner(ptr, &mut visit) }
    }

    unsafe fn walk_refs_inner(&self, ptr: *const u8, visit: &mut dyn FnMut(*const ScriptObject)) {
        match &self.layout {
            Layout::Primitive { data_type: DataType::Object(_), .. } => {
                let obj = unsafe { ptr.cast::<*const ScriptObject>().read_unaligned() };
                visit(obj);
            }
            Layout::Primitive { .. } => {}
            Layout::Struct { fields } => {
                for field in fields.iter().filter(|f| f.element.has_references) {
                    let stride = field.element.size_bytes;
                    for i in 0..field.array_size {
                        unsafe { field.element.walk_refs_inner(ptr.add(field.offset + i * stride), visit) };
                    }
                }
            }
        }
    }
}

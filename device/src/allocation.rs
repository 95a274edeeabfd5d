//! Strided 3D allocations with optionally deferred storage.

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::{Arc, OnceLock};

use snafu::{OptionExt, ensure};
use tracing::trace;

use crate::element::{Element, Scalar};
use crate::error::{InvalidLayoutSnafu, NotBackedSnafu, OutOfMemorySnafu, Result, SizeMismatchSnafu, TypeMismatchSnafu};

/// Storage alignment for every allocation.
pub const STORAGE_ALIGN: usize = 16;

/// Logical extent of an allocation. A zero axis is "not present" and still
/// covers one cell.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Extent {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Extent {
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    pub const fn d1(x: u32) -> Self {
        Self::new(x, 0, 0)
    }

    pub const fn d2(x: u32, y: u32) -> Self {
        Self::new(x, y, 0)
    }

    /// Extent clamped to at least one cell per axis.
    pub fn cells(&self) -> [usize; 3] {
        [self.x.max(1) as usize, self.y.max(1) as usize, self.z.max(1) as usize]
    }

    pub fn cell_count(&self) -> usize {
        self.cells().iter().product()
    }
}

/// Zeroed host memory released on drop.
#[derive(Debug)]
struct Storage {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl Storage {
    fn zeroed(size: usize) -> Result<Self> {
        let layout = Layout::from_size_align(size.max(1), STORAGE_ALIGN)
            .ok()
            .context(InvalidLayoutSnafu { size, align: STORAGE_ALIGN })?;
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).context(OutOfMemorySnafu { size })?;
        Ok(Self { ptr, layout })
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        // SAFETY: ptr was allocated with exactly this layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// Strided multi-dimensional buffer shared between the host and kernels.
///
/// Storage is either allocated up front or deferred until [`Allocation::ensure_backed`]
/// (for buffers whose contents are attached later). Kernels access the storage
/// through [`Allocation::raw_ptr`]; the host must not copy in or out while a
/// launch that uses the allocation is running.
#[derive(Debug)]
pub struct Allocation {
    element: Arc<Element>,
    extent: Extent,
    row_stride: usize,
    storage: OnceLock<Storage>,
}

// SAFETY: the storage pointer is owned and freed exactly once; concurrent access
// to the bytes is governed by the launch discipline described above.
unsafe impl Send for Allocation {}
unsafe impl Sync for Allocation {}

impl Allocation {
    /// Allocate zeroed storage with tightly packed rows.
    pub fn new(element: Arc<Element>, extent: Extent) -> Result<Arc<Self>> {
        Self::with_row_alignment(element, extent, 1)
    }

    /// Allocate zeroed storage with every row padded to `row_alignment` bytes.
    pub fn with_row_alignment(element: Arc<Element>, extent: Extent, row_alignment: usize) -> Result<Arc<Self>> {
        let allocation = Self::layout(element, extent, row_alignment);
        allocation.ensure_backed()?;
        Ok(Arc::new(allocation))
    }

    /// Allocation without storage. Kernels launched over it are rejected until it is backed.
    pub fn deferred(element: Arc<Element>, extent: Extent) -> Arc<Self> {
        Arc::new(Self::layout(element, extent, 1))
    }

    fn layout(element: Arc<Element>, extent: Extent, row_alignment: usize) -> Self {
        let row_stride = (extent.cells()[0] * element.size_bytes()).next_multiple_of(row_alignment.max(1));
        Self { element, extent, row_stride, storage: OnceLock::new() }
    }

    /// Attach storage if none exists yet.
    pub fn ensure_backed(&self) -> Result<()> {
        if self.storage.get().is_some() {
            return Ok(());
        }

        let storage = Storage::zeroed(self.size_bytes())?;
        // Another thread may have won; its storage stays and ours is dropped.
        if self.storage.set(storage).is_ok() {
            trace!(allocation.bytes = self.size_bytes(), allocation.extent = ?self.extent, "allocation backed");
        }
        Ok(())
    }

    pub fn is_backed(&self) -> bool {
        self.storage.get().is_some()
    }

    /// Start of storage, or null when unbacked.
    pub fn raw_ptr(&self) -> *mut u8 {
        self.storage.get().map_or(std::ptr::null_mut(), |s| s.ptr.as_ptr())
    }

    pub fn element(&self) -> &Arc<Element> {
        &self.element
    }

    pub fn element_size(&self) -> usize {
        self.element.size_bytes()
    }

    pub fn extent(&self) -> Extent {
        self.extent
    }

    /// Bytes between the starts of consecutive rows.
    pub fn row_stride(&self) -> usize {
        self.row_stride
    }

    /// Bytes between the starts of consecutive z-planes.
    pub fn plane_stride(&self) -> usize {
        self.row_stride * self.extent.cells()[1]
    }

    pub fn size_bytes(&self) -> usize {
        self.plane_stride() * self.extent.cells()[2]
    }

    /// Byte offset of cell `(x, y, z)`.
    pub fn offset_of(&self, x: u32, y: u32, z: u32) -> usize {
        z as usize * self.plane_stride() + y as usize * self.row_stride + x as usize * self.element_size()
    }

    /// Overwrite the whole storage, padding included.
    pub fn copy_in(&self, src: &[u8]) -> Result<()> {
        let storage = self.storage.get().context(NotBackedSnafu)?;
        let expected = self.size_bytes();
        ensure!(src.len() == expected, SizeMismatchSnafu { expected, actual: src.len() });
        // SAFETY: storage holds size_bytes() bytes and does not overlap `src`.
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), storage.ptr.as_ptr(), expected) };
        Ok(())
    }

    /// Snapshot of the whole storage, padding included.
    pub fn copy_out(&self) -> Result<Vec<u8>> {
        let storage = self.storage.get().context(NotBackedSnafu)?;
        let mut out = vec![0u8; self.size_bytes()];
        // SAFETY: storage holds size_bytes() bytes.
        unsafe { std::ptr::copy_nonoverlapping(storage.ptr.as_ptr(), out.as_mut_ptr(), out.len()) };
        Ok(out)
    }

    /// Write packed cells (row padding skipped) from a typed slice.
    pub fn write_cells<T: Scalar>(&self, values: &[T]) -> Result<()> {
        self.check_scalar::<T>()?;
        let storage = self.storage.get().context(NotBackedSnafu)?;
        let expected = self.extent.cell_count();
        ensure!(values.len() == expected, SizeMismatchSnafu { expected, actual: values.len() });

        for (i, value) in values.iter().enumerate() {
            let offset = self.cell_offset(i);
            // SAFETY: offset addresses a cell inside storage; unaligned write tolerates padding.
            unsafe { storage.ptr.as_ptr().add(offset).cast::<T>().write_unaligned(*value) };
        }
        Ok(())
    }

    /// Read packed cells (row padding skipped) into a typed vector.
    pub fn read_cells<T: Scalar>(&self) -> Result<Vec<T>> {
        self.check_scalar::<T>()?;
        let storage = self.storage.get().context(NotBackedSnafu)?;
        let count = self.extent.cell_count();
        // SAFETY: every offset addresses a cell inside storage.
        Ok((0..count)
            .map(|i| unsafe { storage.ptr.as_ptr().add(self.cell_offset(i)).cast::<T>().read_unaligned() })
            .collect())
    }

    fn cell_offset(&self, index: usize) -> usize {
        let [cx, cy, _] = self.extent.cells();
        let x = index % cx;
        let y = (index / cx) % cy;
        let z = index / (cx * cy);
        self.offset_of(x as u32, y as u32, z as u32)
    }

    fn check_scalar<T: Scalar>(&self) -> Result<()> {
        let matches = self.element.data_type() == Some(T::DATA_TYPE) && self.element.vector_size() == 1;
        ensure!(
            matches,
            TypeMismatchSnafu { expected: format!("{:?}", self.element.data_type()), actual: T::DATA_TYPE.to_string() }
        );
        Ok(())
    }
}

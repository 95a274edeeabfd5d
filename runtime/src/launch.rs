//! ForEach launch coordination.
//!
//! A launch goes through validation, domain computation and slicing before it
//! reaches the dispatcher:
//!
//! 1. At least one of input/output must be present and every present buffer
//!    must be backed. Otherwise `BadScript` is reported and nothing runs.
//! 2. The domain comes from the input's extent (else the output's), restricted
//!    per axis by the optional [`ScriptCall`]. An axis whose restriction ends
//!    at 0 is unrestricted. A restriction whose clamped start is not below its
//!    clamped end makes the launch empty.
//! 3. Each row (one `(y, z)` pair) is one slice.

use kscript_device::Allocation;
use tracing::debug;

use crate::dispatch::ScriptScope;
use crate::script::ScriptInstance;
use crate::sink::ErrorKind;
use crate::symbols::{ForEachFn, ForEachParams, KernelSignature};

/// Optional sub-region of a launch. An axis with `end == 0` is unrestricted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScriptCall {
    pub x_start: u32,
    pub x_end: u32,
    pub y_start: u32,
    pub y_end: u32,
    pub z_start: u32,
    pub z_end: u32,
}

impl ScriptCall {
    pub fn x(mut self, start: u32, end: u32) -> Self {
        (self.x_start, self.x_end) = (start, end);
        self
    }

    pub fn y(mut self, start: u32, end: u32) -> Self {
        (self.y_start, self.y_end) = (start, end);
        self
    }

    pub fn z(mut self, start: u32, end: u32) -> Self {
        (self.z_start, self.z_end) = (start, end);
        self
    }

    fn axis(&self, axis: usize) -> (u32, u32) {
        match axis {
            0 => (self.x_start, self.x_end),
            1 => (self.y_start, self.y_end),
            _ => (self.z_start, self.z_end),
        }
    }
}

/// Half-open 3D iteration domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Domain {
    pub start: [u32; 3],
    pub end: [u32; 3],
}

impl Domain {
    /// Domain for `dims`, restricted by `call`.
    pub fn compute(dims: [u32; 3], call: Option<&ScriptCall>) -> Self {
        let mut start = [0u32; 3];
        let mut end = [0u32; 3];
        for axis in 0..3 {
            match call.map(|c| c.axis(axis)) {
                Some((s, e)) if e != 0 => {
                    start[axis] = s.min(dims[axis]);
                    end[axis] = e.min(dims[axis]);
                    if start[axis] >= end[axis] {
                        return Self::empty();
                    }
                }
                _ => end[axis] = dims[axis],
            }
        }
        Self { start, end: end.map(|e| e.max(1)) }
    }

    pub fn empty() -> Self {
        Self { start: [0; 3], end: [0; 3] }
    }

    pub fn len(&self, axis: usize) -> u32 {
        self.end[axis].saturating_sub(self.start[axis])
    }

    pub fn is_empty(&self) -> bool {
        (0..3).any(|axis| self.len(axis) == 0)
    }

    /// Number of rows, i.e. `(y, z)` pairs. Can exceed `u32::MAX`.
    pub fn rows(&self) -> u64 {
        if self.is_empty() { 0 } else { u64::from(self.len(1)) * u64::from(self.len(2)) }
    }

    /// `(y, z)` of row `index`.
    pub fn row(&self, index: u64) -> (u32, u32) {
        let rows_y = u64::from(self.len(1));
        // Both quotient and remainder are bounded by an axis length.
        ((index % rows_y) as u32 + self.start[1], (index / rows_y) as u32 + self.start[2])
    }
}

/// Raw view of one bound buffer.
#[derive(Debug, Clone, Copy)]
pub struct BufferBinding {
    pub ptr: *mut u8,
    pub element_stride: u32,
    pub row_stride: u32,
    pub plane_stride: usize,
}

impl BufferBinding {
    pub fn none() -> Self {
        Self { ptr: std::ptr::null_mut(), element_stride: 0, row_stride: 0, plane_stride: 0 }
    }

    /// Binding for `allocation`, or `None` when its element or row stride
    /// does not fit the 32-bit kernel ABI.
    pub fn of(allocation: &Allocation) -> Option<Self> {
        Some(Self {
            ptr: allocation.raw_ptr(),
            element_stride: u32::try_from(allocation.element_size()).ok()?,
            row_stride: u32::try_from(allocation.row_stride()).ok()?,
            plane_stride: allocation.plane_stride(),
        })
    }

    /// Address of cell `(x, y, z)`, or null when nothing is bound.
    pub fn at(&self, x: u32, y: u32, z: u32) -> *mut u8 {
        if self.ptr.is_null() {
            return self.ptr;
        }
        let offset = z as usize * self.plane_stride + y as usize * self.row_stride as usize
            + x as usize * self.element_stride as usize;
        self.ptr.wrapping_add(offset)
    }
}

/// Everything needed to run one foreach launch. Read-only once prepared.
#[derive(Debug)]
pub struct LaunchDescriptor<'a> {
    /// Extent of the driving buffer, zero for absent axes.
    pub dims: [u32; 3],
    pub domain: Domain,
    /// Rows per slice.
    pub slice_size: u32,
    pub input: BufferBinding,
    pub output: BufferBinding,
    pub usr: &'a [u8],
    pub usr_len: u32,
    pub kernel: ForEachFn,
    pub signature: KernelSignature,
    pub slot: u32,
    pub threadable: bool,
}

// SAFETY: the raw buffer pointers are only written through by the kernel, one
// row per call, and rows never overlap.
unsafe impl Sync for LaunchDescriptor<'_> {}

impl LaunchDescriptor<'_> {
    pub fn slice_count(&self) -> u64 {
        self.domain.rows().div_ceil(u64::from(self.slice_size.max(1)))
    }

    /// Parameter block for row `index`.
    pub fn row_params(&self, index: u64) -> ForEachParams {
        let (y, z) = self.domain.row(index);
        let x = self.domain.start[0];
        ForEachParams {
            input: self.input.at(x, y, z),
            output: self.output.at(x, y, z),
            usr: if self.usr.is_empty() { std::ptr::null() } else { self.usr.as_ptr().cast() },
            usr_len: self.usr_len,
            x,
            y,
            z,
            dim_x: self.dims[0],
            dim_y: self.dims[1],
            dim_z: self.dims[2],
            ptr_in: self.input.ptr,
            ptr_out: self.output.ptr,
            e_stride_in: self.input.element_stride,
            e_stride_out: self.output.element_stride,
            y_stride_in: self.input.row_stride,
            y_stride_out: self.output.row_stride,
            slot: self.slot,
        }
    }

    /// Run the kernel over row `index`.
    pub fn run_row(&self, index: u64) {
        let params = self.row_params(index);
        let (x_start, x_end) = (self.domain.start[0], self.domain.end[0]);
        // SAFETY: the kernel was resolved with the expanded foreach ABI and the
        // row lies inside every bound buffer.
        unsafe { (self.kernel)(&params, x_start, x_end, self.input.element_stride, self.output.element_stride) };
    }
}

impl ScriptInstance {
    /// Validate a launch and build its descriptor.
    ///
    /// Returns `None` after reporting `BadScript` when the buffers cannot be
    /// launched over.
    ///
    /// # Panics
    ///
    /// If `slot` is not an exported kernel, or the kernel has no entry point.
    pub fn prepare_launch<'a>(
        &self,
        slot: usize,
        input: Option<&Allocation>,
        output: Option<&Allocation>,
        usr: &'a [u8],
        call: Option<&ScriptCall>,
    ) -> Option<LaunchDescriptor<'a>> {
        let symbols = self.module().symbols();
        let Some(kernel) = symbols.kernels[slot] else {
            panic!("kernel slot {slot} of '{}' has no entry point", self.name());
        };
        let signature = symbols.signature(slot);

        if input.is_some_and(|a| !a.is_backed()) {
            self.report(ErrorKind::BadScript, "foreach called with an unbacked input allocation");
            return None;
        }
        if output.is_some_and(|a| !a.is_backed()) {
            self.report(ErrorKind::BadScript, "foreach called with an unbacked output allocation");
            return None;
        }
        let Some(driving) = input.or(output) else {
            self.report(ErrorKind::BadScript, "foreach called without allocations");
            return None;
        };

        let bind = |a: Option<&Allocation>| a.map_or(Some(BufferBinding::none()), BufferBinding::of);
        let (Some(input_binding), Some(output_binding)) = (bind(input), bind(output)) else {
            self.report(ErrorKind::BadScript, "foreach allocation strides exceed 32 bits");
            return None;
        };
        let Ok(usr_len) = u32::try_from(usr.len()) else {
            self.report(ErrorKind::BadValue, "foreach user data exceeds 32 bits");
            return None;
        };

        let extent = driving.extent();
        let dims = [extent.x, extent.y, extent.z];
        let domain = Domain::compute(dims, call);

        Some(LaunchDescriptor {
            dims,
            domain,
            slice_size: 1,
            input: input_binding,
            output: output_binding,
            usr,
            usr_len,
            kernel,
            signature,
            slot: slot as u32,
            threadable: self.is_threadable(),
        })
    }

    /// Run kernel `slot` over `input` and/or `output`.
    ///
    /// Input errors are reported to the error sink and the launch is skipped.
    pub fn invoke_for_each(
        &self,
        slot: usize,
        input: Option<&Allocation>,
        output: Option<&Allocation>,
        usr: &[u8],
        call: Option<&ScriptCall>,
    ) {
        let Some(descriptor) = self.prepare_launch(slot, input, output, usr, call) else {
            return;
        };

        debug!(
            script.name = %self.name(),
            kernel.slot = slot,
            launch.domain = ?descriptor.domain,
            launch.rows = descriptor.domain.rows(),
            "foreach launch"
        );
        if descriptor.slice_count() == 0 {
            return;
        }

        let _scope = ScriptScope::enter(self);
        let run = |row: u64| {
            let _scope = ScriptScope::enter(self);
            descriptor.run_row(row);
        };
        self.dispatcher().launch(&descriptor, &run);
    }
}

//! Entry-point ABI and per-module symbol table.

use std::ffi::c_void;

use enumset::{EnumSet, EnumSetType};
use tracing::{debug, warn};

use crate::error::{FunctionSymbolMissingSnafu, KernelSymbolMissingSnafu, Result};
use crate::metadata::ScriptMetadata;

/// Parameters a kernel signature declares.
#[derive(Debug, EnumSetType, strum::Display)]
#[enumset(repr = "u32")]
pub enum SignatureFlag {
    /// Reads an input allocation.
    In,
    /// Writes an output allocation.
    Out,
    UserData,
    X,
    Y,
    /// Kernel-style entry point (returns its output instead of writing through a pointer).
    Kernel,
}

/// Bitmask of [`SignatureFlag`]s, stored in metadata as a decimal integer.
pub type KernelSignature = EnumSet<SignatureFlag>;

/// Plain `root`: graphics-style root returning a redraw hint.
pub type RootFn = unsafe extern "C" fn() -> i32;
/// `init` and `.ks.dtor`.
pub type InvokeFn = unsafe extern "C" fn();
/// Exported invokable taking a packed argument block.
pub type InvokableFn = unsafe extern "C" fn(*const c_void, u32);
/// Expanded foreach kernel: `(params, x_start, x_end, in_step, out_step)`.
pub type ForEachFn = unsafe extern "C" fn(*const ForEachParams, u32, u32, u32, u32);

/// Root entry point a script exposes to the host.
#[derive(Debug, Clone, Copy)]
pub enum RootEntry {
    Expanded(ForEachFn),
    Plain(RootFn),
}

/// Per-row parameter block handed to an expanded kernel.
///
/// `input` and `output` point at cell `(x_start, y, z)` of the row being run;
/// `ptr_in` and `ptr_out` are the buffer bases.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ForEachParams {
    pub input: *const u8,
    pub output: *mut u8,
    pub usr: *const c_void,
    pub usr_len: u32,
    pub x: u32,
    pub y: u32,
    pub z: u32,
    pub dim_x: u32,
    pub dim_y: u32,
    pub dim_z: u32,
    pub ptr_in: *const u8,
    pub ptr_out: *mut u8,
    pub e_stride_in: u32,
    pub e_stride_out: u32,
    pub y_stride_in: u32,
    pub y_stride_out: u32,
    pub slot: u32,
}

pub const ROOT_SYMBOL: &str = "root";
pub const ROOT_EXPANDED_SYMBOL: &str = "root.expand";
pub const INIT_SYMBOL: &str = "init";
pub const FREE_CHILDREN_SYMBOL: &str = ".ks.dtor";
pub const INFO_SYMBOL: &str = ".ks.info";
pub const EXPANDED_SUFFIX: &str = ".expand";

/// Anything symbols can be looked up in.
pub trait SymbolSource {
    /// Address of `name`, or null when not exported.
    fn address(&self, name: &str) -> *mut c_void;
}

impl SymbolSource for libloading::Library {
    fn address(&self, name: &str) -> *mut c_void {
        // SAFETY: the symbol is read as an untyped address and never called here.
        match unsafe { self.get::<*mut c_void>(name.as_bytes()) } {
            Ok(symbol) => *symbol,
            Err(_) => std::ptr::null_mut(),
        }
    }
}

/// Resolved entry points and globals of one loaded module.
///
/// Built once at load and read-only afterwards. Variable addresses may be null
/// when the compiler optimized the global away.
#[derive(Debug)]
pub struct SymbolTable {
    pub metadata: ScriptMetadata,
    pub variables: Vec<*mut u8>,
    pub functions: Vec<InvokableFn>,
    /// Expanded entry point per kernel slot. Only slot 0 may be `None`.
    pub kernels: Vec<Option<ForEachFn>>,
    pub object_slots: Vec<bool>,
    pub root: Option<RootFn>,
    pub root_expanded: Option<ForEachFn>,
    pub init: Option<InvokeFn>,
    pub free_children: Option<InvokeFn>,
}

// SAFETY: the table only holds addresses inside a mapping that outlives it; it
// never dereferences them itself.
unsafe impl Send for SymbolTable {}
unsafe impl Sync for SymbolTable {}

/// Reinterpret a non-null symbol address as a function pointer.
///
/// # Safety
///
/// `addr` must be the address of a function with ABI `F`.
unsafe fn as_fn<F: Copy>(addr: *mut c_void) -> Option<F> {
    debug_assert_eq!(size_of::<F>(), size_of::<*mut c_void>());
    if addr.is_null() { None } else { Some(unsafe { std::mem::transmute_copy::<*mut c_void, F>(&addr) }) }
}

impl SymbolTable {
    /// Resolve every symbol `metadata` declares.
    ///
    /// # Safety
    ///
    /// Every exported name in `source` must have the ABI this module assigns it
    /// (entry points, variables and kernels as typed above).
    pub unsafe fn resolve(source: &dyn SymbolSource, metadata: ScriptMetadata) -> Result<Self> {
        let root = unsafe { as_fn::<RootFn>(source.address(ROOT_SYMBOL)) };
        let root_expanded = unsafe { as_fn::<ForEachFn>(source.address(ROOT_EXPANDED_SYMBOL)) };
        let init = unsafe { as_fn::<InvokeFn>(source.address(INIT_SYMBOL)) };
        let free_children = unsafe { as_fn::<InvokeFn>(source.address(FREE_CHILDREN_SYMBOL)) };

        let variables: Vec<*mut u8> = metadata
            .variables
            .iter()
            .enumerate()
            .map(|(slot, name)| {
                let addr = source.address(name).cast::<u8>();
                if addr.is_null() {
                    warn!(variable.slot = slot, variable.name = %name, "variable not found, slot left unresolved");
                }
                addr
            })
            .collect();

        let mut functions = Vec::with_capacity(metadata.functions.len());
        for (slot, name) in metadata.functions.iter().enumerate() {
            let Some(f) = (unsafe { as_fn::<InvokableFn>(source.address(name)) }) else {
                return FunctionSymbolMissingSnafu { slot, name: name.clone() }.fail();
            };
            functions.push(f);
        }

        let mut kernels = Vec::with_capacity(metadata.kernels.len());
        for (slot, kernel) in metadata.kernels.iter().enumerate() {
            let expanded = format!("{}{EXPANDED_SUFFIX}", kernel.name);
            let f = unsafe { as_fn::<ForEachFn>(source.address(&expanded)) };
            // Slot 0 is the implicit root, which graphics-style scripts export unexpanded.
            if f.is_none() && slot != 0 {
                return KernelSymbolMissingSnafu { slot, name: kernel.name.clone() }.fail();
            }
            kernels.push(f);
        }

        let mut object_slots = vec![false; metadata.variables.len()];
        for &slot in &metadata.object_slots {
            object_slots[slot] = true;
        }

        debug!(
            module.variables = variables.len(),
            module.functions = functions.len(),
            module.kernels = kernels.len(),
            module.has_root = root.is_some(),
            "symbols resolved"
        );

        Ok(Self { metadata, variables, functions, kernels, object_slots, root, root_expanded, init, free_children })
    }

    /// Signature of kernel `slot`.
    pub fn signature(&self, slot: usize) -> KernelSignature {
        self.metadata.kernels[slot].signature
    }

    /// Preferred root: the expanded variant when exported, else plain `root`.
    pub fn preferred_root(&self) -> Option<RootEntry> {
        self.root_expanded.map(RootEntry::Expanded).or(self.root.map(RootEntry::Plain))
    }
}

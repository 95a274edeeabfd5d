//! CPU runtime for precompiled kscript kernels.
//!
//! A script is a native module exporting globals, invokable functions and
//! data-parallel foreach kernels, described by an embedded metadata block.
//! [`CpuDriver`] loads (and if needed compiles) scripts into
//! [`ScriptInstance`]s. Every instance owns a private copy of the module's
//! globals, even when several instances come from one artifact.
//!
//! # Launching
//!
//! [`ScriptInstance::invoke_for_each`] computes the iteration domain from the
//! bound allocations and hands one slice per row to a [`Dispatcher`]
//! (rayon-backed by default).

pub mod binding;
pub mod compiler;
pub mod config;
pub mod dispatch;
pub mod dispatcher;
pub mod driver;
pub mod error;
pub mod launch;
pub mod loader;
pub mod metadata;
pub mod registry;
pub mod script;
pub mod sink;
pub mod symbols;


pub use compiler::{ClangCompiler, NoCompiler, ScriptCompiler, Variant};
pub use config::{AliasStrategy, LoaderConfig, Precision, RuntimeConfig, RuntimePolicy};
pub use dispatch::{ScriptScope, current_allocation_for_pointer, with_current_script};
pub use dispatcher::{Dispatcher, RayonDispatcher, SerialDispatcher};
pub use driver::CpuDriver;
pub use error::*;
pub use launch::{BufferBinding, Domain, LaunchDescriptor, ScriptCall};
pub use loader::{LoadedModule, Mapping, ModuleHandle, ModuleImage, ModuleLoader};
pub use metadata::{KernelExport, ScriptMetadata};
pub use script::{ScriptInfo, ScriptInstance};
pub use sink::{ErrorKind, ErrorSink, RecordingSink, TracingSink};
pub use symbols::{ForEachFn, ForEachParams, KernelSignature, RootEntry, SignatureFlag, SymbolTable};

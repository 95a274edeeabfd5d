//! Kernel module loading.
//!
//! Loading resolves a script name to an artifact (compiling it when source is
//! supplied), maps it, parses its metadata and resolves every declared symbol.
//!
//! # Instancing
//!
//! Each script instance needs its own copy of the module's globals, but the
//! dynamic loader hands back the existing mapping when the same file is
//! opened again. The first load of an artifact maps it directly; every later
//! load maps a uniquely named alias instead and removes the alias right after
//! mapping. See [`crate::registry`].

use std::collections::HashMap;
use std::ffi::{CStr, c_char, c_void};
use std::io;
use std::path::{Path, PathBuf};

use snafu::ResultExt;
use tracing::{debug, warn};

use crate::compiler::{ScriptCompiler, Variant, artifact_file_name};
use crate::config::RuntimeConfig;
use crate::error::{AliasCreationFailedSnafu, ArtifactUnavailableSnafu, MalformedMetadataSnafu, MapFailedSnafu, Result};
use crate::metadata::ScriptMetadata;
use crate::registry::registry;
use crate::symbols::{
    EXPANDED_SUFFIX, FREE_CHILDREN_SYMBOL, ForEachFn, INFO_SYMBOL, INIT_SYMBOL, InvokableFn, InvokeFn, ROOT_SYMBOL,
    RootFn, SymbolSource, SymbolTable,
};

/// How a module's artifact was mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Mapping {
    /// The artifact path itself; first instance in the process.
    Shared,
    /// A private alias (or an in-memory image); never shares globals.
    Exclusive,
}

/// In-memory module: entry points registered from the host process and
/// variable storage owned by the image.
///
/// Every image owns its globals, so two images built from the same recipe are
/// independent instances.
pub struct ModuleImage {
    info: Vec<u8>,
    symbols: HashMap<String, *mut c_void>,
    storage: Vec<Box<[u128]>>,
}

// SAFETY: the symbol addresses are host functions or storage owned by the image.
unsafe impl Send for ModuleImage {}
unsafe impl Sync for ModuleImage {}

impl std::fmt::Debug for ModuleImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleImage")
            .field("symbols", &self.symbols.len())
            .field("variables", &self.storage.len())
            .finish()
    }
}

impl ModuleImage {
    /// Image described by `metadata` (the same text an artifact embeds as `.ks.info`).
    pub fn new(metadata: &str) -> Self {
        let mut info = metadata.split('\0').next().unwrap_or_default().as_bytes().to_vec();
        info.push(0);
        let mut image = Self { info, symbols: HashMap::new(), storage: Vec::new() };
        let info_ptr = image.info.as_mut_ptr().cast();
        image.symbols.insert(INFO_SYMBOL.to_string(), info_ptr);
        image
    }

    pub fn with_symbol(mut self, name: &str, addr: *mut c_void) -> Self {
        self.symbols.insert(name.to_string(), addr);
        self
    }

    /// Register the expanded entry point of kernel `name`.
    pub fn with_kernel(self, name: &str, kernel: ForEachFn) -> Self {
        self.with_symbol(&format!("{name}{EXPANDED_SUFFIX}"), kernel as *mut c_void)
    }

    pub fn with_function(self, name: &str, function: InvokableFn) -> Self {
        self.with_symbol(name, function as *mut c_void)
    }

    pub fn with_root(self, root: RootFn) -> Self {
        self.with_symbol(ROOT_SYMBOL, root as *mut c_void)
    }

    pub fn with_init(self, init: InvokeFn) -> Self {
        self.with_symbol(INIT_SYMBOL, init as *mut c_void)
    }

    pub fn with_free_children(self, dtor: InvokeFn) -> Self {
        self.with_symbol(FREE_CHILDREN_SYMBOL, dtor as *mut c_void)
    }

    /// Allocate zeroed, 16-byte aligned storage for global `name`.
    pub fn with_variable(mut self, name: &str, size: usize) -> Self {
        let mut cells = vec![0u128; size.div_ceil(size_of::<u128>()).max(1)].into_boxed_slice();
        let addr = cells.as_mut_ptr().cast();
        self.storage.push(cells);
        self.with_symbol(name, addr)
    }
}

impl SymbolSource for ModuleImage {
    fn address(&self, name: &str) -> *mut c_void {
        self.symbols.get(name).copied().unwrap_or(std::ptr::null_mut())
    }
}

/// Native handle keeping a module's code and globals alive.
#[derive(Debug)]
pub enum ModuleHandle {
    Library(libloading::Library),
    Image(ModuleImage),
}

impl ModuleHandle {
    fn source(&self) -> &dyn SymbolSource {
        match self {
            ModuleHandle::Library(library) => library,
            ModuleHandle::Image(image) => image,
        }
    }
}

/// A mapped module with its resolved symbols.
#[derive(Debug)]
pub struct LoadedModule {
    name: String,
    symbols: SymbolTable,
    mapping: Mapping,
    artifact: Option<PathBuf>,
    threadable: bool,
    // Dropped last: the symbol table points into it.
    handle: ModuleHandle,
}

impl LoadedModule {
    fn new(name: &str, handle: ModuleHandle, mapping: Mapping, artifact: Option<PathBuf>) -> Result<Self> {
        let metadata = read_metadata(handle.source(), artifact.as_deref())?;
        // SAFETY: artifacts and images export symbols with the kscript ABI.
        let symbols = unsafe { SymbolTable::resolve(handle.source(), metadata)? };
        let threadable = symbols.metadata.pragma("threadable") != Some("false");

        debug!(script.name = %name, %mapping, threadable, "module loaded");
        Ok(Self { name: name.to_string(), symbols, mapping, artifact, threadable, handle })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    pub fn mapping(&self) -> Mapping {
        self.mapping
    }

    /// Artifact path, or `None` for in-memory images.
    pub fn artifact(&self) -> Option<&Path> {
        self.artifact.as_deref()
    }

    /// Whether the module permits multi-threaded launches.
    pub fn threadable(&self) -> bool {
        self.threadable
    }

    pub fn handle(&self) -> &ModuleHandle {
        &self.handle
    }
}

fn read_metadata(source: &dyn SymbolSource, artifact: Option<&Path>) -> Result<ScriptMetadata> {
    let info = source.address(INFO_SYMBOL);
    if !info.is_null() {
        // SAFETY: `.ks.info` is a NUL-terminated string.
        let text = unsafe { CStr::from_ptr(info.cast::<c_char>()) };
        return ScriptMetadata::parse_bytes(text.to_bytes());
    }

    let Some(sidecar) = artifact.map(|a| a.with_extension("info")) else {
        return MalformedMetadataSnafu { line: 0usize, reason: "module has no .ks.info symbol" }.fail();
    };
    match std::fs::read(&sidecar) {
        Ok(bytes) => ScriptMetadata::parse_bytes(&bytes),
        Err(e) => MalformedMetadataSnafu {
            line: 0usize,
            reason: format!("no .ks.info symbol and no sidecar at {}: {e}", sidecar.display()),
        }
        .fail(),
    }
}

/// Private library directory for a cache directory: the text before the last
/// `cache` with `lib` appended.
pub fn private_lib_dir(cache_dir: &Path) -> PathBuf {
    let text = cache_dir.to_string_lossy();
    match text.rfind("cache") {
        Some(cut) => PathBuf::from(&text[..cut]).join("lib"),
        None => {
            warn!(cache.dir = %cache_dir.display(), "cache directory does not contain 'cache'");
            cache_dir.join("lib")
        }
    }
}

/// Loads artifacts under the process-wide registry lock.
pub struct ModuleLoader<'a> {
    config: &'a RuntimeConfig,
    compiler: &'a dyn ScriptCompiler,
}

impl<'a> ModuleLoader<'a> {
    pub fn new(config: &'a RuntimeConfig, compiler: &'a dyn ScriptCompiler) -> Self {
        Self { config, compiler }
    }

    /// Load script `name`, building it from `source` when given.
    ///
    /// # Safety
    ///
    /// Mapping runs the artifact's initializers, and its exports are trusted to
    /// follow the kscript ABI.
    pub unsafe fn load(&self, name: &str, cache_dir: &Path, source: Option<&[u8]>) -> Result<LoadedModule> {
        let mut registry = registry().lock();

        let artifact = match source {
            Some(source) => self.compile(name, cache_dir, source)?,
            None => self.locate(name, cache_dir)?,
        };
        let identity = artifact.canonicalize().unwrap_or_else(|_| artifact.clone());

        let (library, mapping) = if registry.contains(&identity) {
            (unsafe { self.map_alias(name, cache_dir, &identity)? }, Mapping::Exclusive)
        } else {
            (unsafe { open(&identity)? }, Mapping::Shared)
        };

        let module = LoadedModule::new(name, ModuleHandle::Library(library), mapping, Some(artifact))?;
        if mapping == Mapping::Shared {
            registry.record(identity);
        }
        Ok(module)
    }

    /// Wrap an in-memory image.
    pub fn load_image(&self, name: &str, image: ModuleImage) -> Result<LoadedModule> {
        LoadedModule::new(name, ModuleHandle::Image(image), Mapping::Exclusive, None)
    }

    fn compile(&self, name: &str, cache_dir: &Path, source: &[u8]) -> Result<PathBuf> {
        let policy = &self.config.policy;
        if !policy.requires_rebuild()
            && let Some(cached) = self.compiler.cached_artifact(name, cache_dir, source)
        {
            debug!(script.name = %name, artifact.path = %cached.display(), "using cached artifact");
            return Ok(cached);
        }
        self.compiler.build(name, cache_dir, source, Variant::select(policy, source))
    }

    /// Search locations in order: cache, private library, system library.
    pub fn search_paths(&self, name: &str, cache_dir: &Path) -> Vec<PathBuf> {
        let file = artifact_file_name(name);
        vec![
            cache_dir.join(&file),
            private_lib_dir(cache_dir).join(&file),
            self.config.loader.system_lib_dir.join(&file),
        ]
    }

    fn locate(&self, name: &str, cache_dir: &Path) -> Result<PathBuf> {
        let searched = self.search_paths(name, cache_dir);
        match searched.iter().find(|p| p.is_file()) {
            Some(found) => Ok(found.clone()),
            None => ArtifactUnavailableSnafu { name, searched }.fail(),
        }
    }

    unsafe fn map_alias(&self, name: &str, cache_dir: &Path, original: &Path) -> Result<libloading::Library> {
        let loader = &self.config.loader;
        let dir = cache_dir.join(&loader.alias_dir);
        ensure_alias_dir(&dir).context(AliasCreationFailedSnafu { artifact: original })?;

        let strategy = loader.alias_strategy;
        let alias = tempfile::Builder::new()
            .prefix(&format!("libks.{name}#"))
            .suffix(".so")
            .rand_bytes(loader.alias_suffix_len)
            .make_in(&dir, |path| strategy.create(original, path))
            .context(AliasCreationFailedSnafu { artifact: original })?;

        debug!(script.name = %name, alias.path = %alias.path().display(), %strategy, "mapping through alias");
        let library = unsafe { open(alias.path()) };

        let alias_path = alias.path().to_path_buf();
        if let Err(e) = alias.close() {
            warn!(alias.path = %alias_path.display(), error = %e, "failed to remove alias");
        }
        library
    }
}

fn ensure_alias_dir(dir: &Path) -> io::Result<()> {
    if dir.is_dir() {
        return Ok(());
    }
    let mut builder = std::fs::DirBuilder::new();
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    match builder.create(dir) {
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists && dir.is_dir() => Ok(()),
        other => other,
    }
}

#[cfg(unix)]
unsafe fn open(path: &Path) -> Result<libloading::Library> {
    use libloading::os::unix::{Library, RTLD_LOCAL, RTLD_NOW};
    let library = unsafe { Library::open(Some(path), RTLD_NOW | RTLD_LOCAL) };
    library.map(Into::into).context(MapFailedSnafu { path })
}

#[cfg(not(unix))]
unsafe fn open(path: &Path) -> Result<libloading::Library> {
    unsafe { libloading::Library::new(path) }.context(MapFailedSnafu { path })
}

//! Runtime policy and loader configuration.
//!
//! Every setting has a default, a `from_env` constructor and a builder.
//!
//! # Environment Variables
//!
//! * `KSCRIPT_FORCE_RECOMPILE` - Rebuild scripts even when a cached artifact matches (`1` or `true`)
//! * `KSCRIPT_PRECISION` - Floating-point precision override (`full`, `relaxed`, `imprecise`)
//! * `KSCRIPT_DEBUG` - Build the debug variant (set to any value)
//! * `KSCRIPT_SYSTEM_LIB_DIR` - System-wide fallback directory for prebuilt artifacts
//! * `KSCRIPT_ALIAS` - Instancing alias kind (`symlink` or `copy`)

use std::path::{Path, PathBuf};
use std::str::FromStr;

use bon::bon;

/// Floating-point precision a script is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Precision {
    #[default]
    Full,
    Relaxed,
    Imprecise,
}

impl Precision {
    /// Precision requested by a `#pragma ks_fp_*` line in script source.
    pub fn detect(source: &[u8]) -> Option<Self> {
        let text = String::from_utf8_lossy(source);
        text.lines().filter_map(|line| line.trim().strip_prefix("#pragma")).find_map(|rest| {
            match rest.trim() {
                "ks_fp_full" => Some(Precision::Full),
                "ks_fp_relaxed" => Some(Precision::Relaxed),
                "ks_fp_imprecise" => Some(Precision::Imprecise),
                _ => None,
            }
        })
    }
}

/// Process-wide signals that select which compiled variant gets loaded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimePolicy {
    /// Ignore cached artifacts and rebuild from source.
    pub force_recompile: bool,
    /// Precision override applied to every script.
    pub precision: Option<Precision>,
    /// Build the debug variant (unoptimized, with debug info).
    pub debug: bool,
}

impl RuntimePolicy {
    pub fn from_env() -> Self {
        let force_recompile =
            std::env::var("KSCRIPT_FORCE_RECOMPILE").is_ok_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));
        let precision = std::env::var("KSCRIPT_PRECISION").ok().and_then(|s| Precision::from_str(&s).ok());
        let debug = std::env::var("KSCRIPT_DEBUG").is_ok();

        Self { force_recompile, precision, debug }
    }

    /// Whether cached artifacts must be bypassed.
    ///
    /// A precision override or the debug variant invalidates whatever was cached.
    pub fn requires_rebuild(&self) -> bool {
        self.force_recompile || self.precision.is_some() || self.debug
    }
}

/// How an instancing alias refers to the original artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum AliasStrategy {
    /// Symbolic link. Only isolates globals on loaders that key mappings by path.
    Symlink,
    /// Byte copy. Required where the dynamic loader keys mappings by inode.
    Copy,
}

impl Default for AliasStrategy {
    fn default() -> Self {
        if cfg!(target_os = "android") { AliasStrategy::Symlink } else { AliasStrategy::Copy }
    }
}

impl AliasStrategy {
    /// Create `alias` referring to `original`. Fails with `AlreadyExists` if `alias` is taken.
    pub fn create(self, original: &Path, alias: &Path) -> std::io::Result<()> {
        match self {
            #[cfg(unix)]
            AliasStrategy::Symlink => std::os::unix::fs::symlink(original, alias),
            #[cfg(not(unix))]
            AliasStrategy::Symlink => copy_new(original, alias),
            AliasStrategy::Copy => copy_new(original, alias),
        }
    }
}

fn copy_new(original: &Path, alias: &Path) -> std::io::Result<()> {
    let mut src = std::fs::File::open(original)?;
    let mut dst = std::fs::OpenOptions::new().write(true).create_new(true).open(alias)?;
    std::io::copy(&mut src, &mut dst)?;
    Ok(())
}

/// Default system-wide fallback directory for prebuilt artifacts.
pub const DEFAULT_SYSTEM_LIB_DIR: &str = "/system/lib";

/// Directory (under the cache directory) that holds transient aliases.
pub const DEFAULT_ALIAS_DIR: &str = "kscript.cache";

/// Settings for locating and mapping artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderConfig {
    /// Last-resort search location for prebuilt artifacts.
    pub system_lib_dir: PathBuf,
    /// How instancing aliases are created.
    pub alias_strategy: AliasStrategy,
    /// Alias directory name, relative to the cache directory.
    pub alias_dir: String,
    /// Length of the random alias suffix over `[A-Za-z0-9]`.
    pub alias_suffix_len: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            system_lib_dir: PathBuf::from(DEFAULT_SYSTEM_LIB_DIR),
            alias_strategy: AliasStrategy::default(),
            alias_dir: DEFAULT_ALIAS_DIR.to_string(),
            alias_suffix_len: 6,
        }
    }
}

impl LoaderConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let system_lib_dir =
            std::env::var_os("KSCRIPT_SYSTEM_LIB_DIR").map(PathBuf::from).unwrap_or(defaults.system_lib_dir);
        let alias_strategy = std::env::var("KSCRIPT_ALIAS")
            .ok()
            .and_then(|s| AliasStrategy::from_str(&s).ok())
            .unwrap_or(defaults.alias_strategy);

        Self { system_lib_dir, alias_strategy, ..defaults }
    }
}

/// Complete runtime configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub policy: RuntimePolicy,
    pub loader: LoaderConfig,
}

#[bon]
impl RuntimeConfig {
    #[builder]
    pub fn new(
        #[builder(default)] force_recompile: bool,
        precision: Option<Precision>,
        #[builder(default)] debug: bool,
        #[builder(into, default = PathBuf::from(DEFAULT_SYSTEM_LIB_DIR))] system_lib_dir: PathBuf,
        #[builder(default)] alias_strategy: AliasStrategy,
        #[builder(into, default = DEFAULT_ALIAS_DIR.to_string())] alias_dir: String,
        #[builder(default = 6)] alias_suffix_len: usize,
    ) -> Self {
        Self {
            policy: RuntimePolicy { force_recompile, precision, debug },
            loader: LoaderConfig { system_lib_dir, alias_strategy, alias_dir, alias_suffix_len },
        }
    }

    pub fn from_env() -> Self {
        Self { policy: RuntimePolicy::from_env(), loader: LoaderConfig::from_env() }
    }
}

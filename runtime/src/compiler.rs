//! Script compilation.
//!
//! [`ScriptCompiler`] turns script source into a `libks.<name>.so` artifact in
//! a cache directory. [`ClangCompiler`] treats the source as C and builds it
//! with `clang -shared`, recording an xxh64 checksum of source and variant next
//! to the artifact so unchanged sources are not rebuilt.

use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::debug;
use xxhash_rust::xxh64::Xxh64;

use crate::config::{Precision, RuntimePolicy};
use crate::error::{CompilationSnafu, Result};

/// File name of the artifact built for script `name`.
pub fn artifact_file_name(name: &str) -> String {
    format!("libks.{name}.so")
}

/// Which flavor of artifact to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Variant {
    pub precision: Precision,
    /// Tune for the host CPU.
    pub arch_optimized: bool,
    /// Unoptimized build with debug info.
    pub debug: bool,
}

impl Variant {
    /// Variant the policy selects for `source`.
    ///
    /// A policy precision override wins over any `#pragma ks_fp_*` in the source.
    pub fn select(policy: &RuntimePolicy, source: &[u8]) -> Self {
        let precision = policy.precision.or_else(|| Precision::detect(source)).unwrap_or_default();
        Self { precision, arch_optimized: !policy.debug, debug: policy.debug }
    }

    fn tag(&self) -> String {
        format!("{}:{}:{}", self.precision, self.arch_optimized, self.debug)
    }
}

/// Produces native artifacts from script source.
pub trait ScriptCompiler: Send + Sync {
    /// Build `source` into `cache_dir`, returning the artifact path.
    fn build(&self, name: &str, cache_dir: &Path, source: &[u8], variant: Variant) -> Result<PathBuf>;

    /// A previously built artifact for exactly this source, if one is cached.
    fn cached_artifact(&self, name: &str, cache_dir: &Path, source: &[u8]) -> Option<PathBuf>;
}

/// Compiles C script source with clang.
#[derive(Debug, Clone)]
pub struct ClangCompiler {
    clang: PathBuf,
}

impl Default for ClangCompiler {
    fn default() -> Self {
        Self { clang: PathBuf::from("clang") }
    }
}

impl ClangCompiler {
    pub fn new(clang: impl Into<PathBuf>) -> Self {
        Self { clang: clang.into() }
    }

    fn checksum(source: &[u8], variant: &Variant) -> String {
        let mut hasher = Xxh64::new(0);
        hasher.update(source);
        hasher.update(variant.tag().as_bytes());
        format!("{:016x}", hasher.digest())
    }

    fn checksum_path(artifact: &Path) -> PathBuf {
        artifact.with_extension("so.xxh64")
    }

    fn flags(variant: &Variant) -> Vec<&'static str> {
        let mut flags = vec!["-shared", "-fPIC", "-fno-math-errno"];
        if variant.debug {
            flags.extend(["-O0", "-g"]);
        } else {
            flags.push("-O2");
            if variant.arch_optimized {
                flags.push("-march=native");
            }
        }
        match variant.precision {
            Precision::Full => flags.push("-ffp-contract=off"),
            Precision::Relaxed => flags.extend(["-ffp-contract=fast", "-fno-trapping-math"]),
            Precision::Imprecise => flags.push("-ffast-math"),
        }
        flags
    }
}

impl ScriptCompiler for ClangCompiler {
    fn build(&self, name: &str, cache_dir: &Path, source: &[u8], variant: Variant) -> Result<PathBuf> {
        let fail = |reason: String| CompilationSnafu { name: name.to_string(), reason };

        std::fs::create_dir_all(cache_dir).map_err(|e| fail(format!("cannot create cache dir: {e}")).build())?;

        // Build next to the final artifact and rename over it, so a mapped
        // previous build keeps its inode.
        let work = tempfile::Builder::new()
            .prefix(".ks-build")
            .tempdir_in(cache_dir)
            .map_err(|e| fail(format!("cannot create build dir: {e}")).build())?;
        let src_path = work.path().join(format!("{name}.c"));
        let so_path = work.path().join(artifact_file_name(name));
        std::fs::write(&src_path, source).map_err(|e| fail(format!("cannot write source: {e}")).build())?;

        let output = Command::new(&self.clang)
            .args(Self::flags(&variant))
            .arg("-o")
            .arg(&so_path)
            .arg(&src_path)
            .arg("-lm")
            .output()
            .map_err(|e| fail(format!("failed to run {}: {e}", self.clang.display())).build())?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return fail(format!("clang exited with {}:\n{stderr}", output.status)).fail();
        }

        let artifact = cache_dir.join(artifact_file_name(name));
        std::fs::rename(&so_path, &artifact).map_err(|e| fail(format!("cannot install artifact: {e}")).build())?;
        std::fs::write(Self::checksum_path(&artifact), Self::checksum(source, &variant))
            .map_err(|e| fail(format!("cannot write checksum: {e}")).build())?;

        debug!(script.name = %name, artifact.path = %artifact.display(), ?variant, "script compiled");
        Ok(artifact)
    }

    fn cached_artifact(&self, name: &str, cache_dir: &Path, source: &[u8]) -> Option<PathBuf> {
        let artifact = cache_dir.join(artifact_file_name(name));
        if !artifact.is_file() {
            return None;
        }
        let stored = std::fs::read_to_string(Self::checksum_path(&artifact)).ok()?;
        let variant = Variant::select(&RuntimePolicy::default(), source);
        (stored.trim() == Self::checksum(source, &variant)).then_some(artifact)
    }
}

/// Compiler for hosts that only ship prebuilt artifacts.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCompiler;

impl ScriptCompiler for NoCompiler {
    fn build(&self, name: &str, _cache_dir: &Path, _source: &[u8], _variant: Variant) -> Result<PathBuf> {
        CompilationSnafu { name, reason: "no compiler configured" }.fail()
    }

    fn cached_artifact(&self, _name: &str, _cache_dir: &Path, _source: &[u8]) -> Option<PathBuf> {
        None
    }
}


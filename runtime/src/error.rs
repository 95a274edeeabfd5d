//! Error types for loading and driving kernel scripts.

use std::path::PathBuf;

use snafu::Snafu;

/// Result type for runtime operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors that can occur while loading or binding a script.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// No artifact exists at any search location.
    #[snafu(display("artifact for '{name}' not found (searched {searched:?})"))]
    ArtifactUnavailable { name: String, searched: Vec<PathBuf> },

    /// The instancing alias (or its directory) could not be created.
    #[snafu(display("could not create alias for {}: {source}", artifact.display()))]
    AliasCreationFailed { artifact: PathBuf, source: std::io::Error },

    /// The dynamic loader rejected the artifact.
    #[snafu(display("failed to map {}: {source}", path.display()))]
    MapFailed { path: PathBuf, source: libloading::Error },

    /// Script metadata is missing or unparsable.
    #[snafu(display("malformed metadata at line {line}: {reason}"))]
    MalformedMetadata { line: usize, reason: String },

    /// A declared kernel has no expanded entry point.
    #[snafu(display("kernel '{name}' (slot {slot}) has no expanded entry point"))]
    KernelSymbolMissing { slot: usize, name: String },

    /// A declared invokable function is not exported.
    #[snafu(display("invokable '{name}' (slot {slot}) not found"))]
    FunctionSymbolMissing { slot: usize, name: String },

    /// The compiler could not produce an artifact.
    #[snafu(display("compilation of '{name}' failed: {reason}"))]
    Compilation { name: String, reason: String },

    /// Element-aware transfers only handle one dimension.
    #[snafu(display("only single-dimensional transfers are supported, got {dims} dimensions"))]
    UnsupportedDimensionality { dims: usize },

    /// Transfer data is shorter than the elements it claims to contain.
    #[snafu(display("transfer of {expected} bytes requested, {actual} supplied"))]
    TransferSize { expected: usize, actual: usize },
}

use snafu::Snafu;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("size mismatch: expected {expected} bytes, got {actual}"))]
    SizeMismatch { expected: usize, actual: usize },

    /// The allocation has no backing storage yet.
    #[snafu(display("allocation is not backed by storage"))]
    NotBacked,

    /// Storage layout could not be represented.
    #[snafu(display("invalid storage layout: {size} bytes aligned to {align}"))]
    InvalidLayout { size: usize, align: usize },

    /// The host allocator returned null.
    #[snafu(display("out of memory allocating {size} bytes"))]
    OutOfMemory { size: usize },

    /// Vector element widths are limited to 2, 3 and 4 lanes.
    #[snafu(display("unsupported vector width {width}"))]
    InvalidVectorWidth { width: usize },

    /// Object handles cannot be packed into vectors.
    #[snafu(display("object element of kind {kind} cannot be vectorized"))]
    ObjectVector { kind: crate::ObjectKind },

    /// Typed access with a scalar type that differs from the element.
    #[snafu(display("element type mismatch: allocation holds {expected}, accessed as {actual}"))]
    TypeMismatch { expected: String, actual: String },
}

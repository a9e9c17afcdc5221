use crate::shape::Shape;

/// All errors that can occur within Strand.
///
/// A single error type is shared by the apply engine and the autograd crate
/// so that failures from either layer surface unchanged to the caller of
/// `apply`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Shape mismatch between two tensors (e.g. a gradient of the wrong shape).
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    /// Apply participants differ in element count. Raised before any
    /// element is visited.
    #[error("inconsistent tensor size, expected {} to have the same number of elements, but got {} elements respectively", describe_names(.tensors), describe_counts(.tensors))]
    ApplySizeMismatch { tensors: Vec<(String, Shape, usize)> },

    /// Operation requires a specific rank (number of dimensions).
    #[error("rank mismatch: expected rank {expected}, got {got}")]
    RankMismatch { expected: usize, got: usize },

    /// DType mismatch between tensors.
    #[error("dtype mismatch: expected {expected:?}, got {got:?}")]
    DTypeMismatch {
        expected: crate::DType,
        got: crate::DType,
    },

    /// Dimension index out of range for the tensor's rank.
    #[error("dimension out of range: dim {dim} for tensor with {rank} dimensions")]
    DimOutOfRange { dim: usize, rank: usize },

    /// Narrow/slice operation out of bounds.
    #[error("narrow out of bounds: dim {dim}, start {start}, len {len}, dim_size {dim_size}")]
    NarrowOutOfBounds {
        dim: usize,
        start: usize,
        len: usize,
        dim_size: usize,
    },

    /// A view would reach outside its storage buffer.
    #[error("view out of bounds: reachable storage range [{min}, {max}] but storage holds {len} elements")]
    ViewOutOfBounds { min: isize, max: isize, len: usize },

    /// Element count mismatch when creating from a vec.
    #[error("element count mismatch: shape {shape} requires {expected} elements, got {got}")]
    ElementCountMismatch {
        shape: Shape,
        expected: usize,
        got: usize,
    },

    /// Cannot view because element counts differ.
    #[error(
        "cannot reshape: source has {src} elements, target shape {dst_shape} has {dst} elements"
    )]
    ReshapeElementMismatch {
        src: usize,
        dst: usize,
        dst_shape: Shape,
    },

    /// Invalid convolution arguments (negative padding, oversized output
    /// padding, channel counts not divisible by groups, ...).
    #[error("invalid convolution configuration: {0}")]
    InvalidConvConfig(String),

    /// An accelerated backend reported a failure status.
    #[error("{backend} backend failed with status {status}")]
    Backend { backend: String, status: i32 },

    /// No kernel is available for the device a tensor lives on.
    #[error("no {op} kernel for device {device}")]
    UnsupportedDevice { op: &'static str, device: String },

    /// A tensor saved for backward was modified in-place afterwards.
    #[error("variable {name} needed for gradient computation has been modified by an inplace operation: saved at version {saved}, now at version {current}")]
    SavedVariableModified {
        name: String,
        saved: u64,
        current: u64,
    },

    /// Saved tensors were already freed by an earlier backward pass.
    #[error("trying to backward through {node} a second time, but its saved variables have already been freed; pass retain_graph to the first backward call")]
    SavedVariableReleased { node: String },

    /// Scratch or storage allocation failed.
    #[error("allocation of {bytes} bytes failed")]
    AllocationFailed { bytes: usize },

    /// A traversal body touched a storage its own traversal has locked.
    #[error("storage is locked by an enclosing traversal on this thread")]
    StorageReentered,

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

fn describe_names(tensors: &[(String, Shape, usize)]) -> String {
    let parts: Vec<String> = tensors
        .iter()
        .map(|(name, shape, _)| format!("{name} {shape}"))
        .collect();
    join_with_and(&parts)
}

fn describe_counts(tensors: &[(String, Shape, usize)]) -> String {
    let parts: Vec<String> = tensors.iter().map(|(_, _, n)| n.to_string()).collect();
    join_with_and(&parts)
}

fn join_with_and(parts: &[String]) -> String {
    match parts {
        [] => String::new(),
        [one] => one.clone(),
        [init @ .., last] => format!("{} and {}", init.join(", "), last),
    }
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }
}

/// Convenience Result type used throughout Strand.
pub type Result<T> = std::result::Result<T, Error>;

/// Macro for early return with a formatted error message.
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}

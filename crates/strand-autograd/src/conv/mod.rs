//! Differentiable 1-D, 2-D and 3-D convolution.
//!
//! [`conv`] is the entry point; [`ConvParams`] describes stride, padding,
//! dilation, groups and transposition. Kernels are picked per call by
//! [`BackendState::select`] from the flags in a
//! [`BackendContext`](crate::BackendContext).

pub mod backend;
pub mod backward;
pub mod depthwise;
pub mod direct;
pub mod double_backward;
pub mod forward;
pub mod geometry;
pub mod host;
pub mod kernels;
pub mod params;
pub mod vendor;

pub use backend::{BackendState, ConvBackend};
pub use backward::ConvBackward;
pub use double_backward::ConvBackwardBackward;
pub use forward::{conv, conv_with_context, ConvForward};
pub use geometry::ConvGeometry;
pub use params::{ConvParams, NNPACK_MIN_BATCH};
pub use vendor::{
    AlgorithmCache, AlgorithmId, AlgorithmInfo, ConvAccelerator, ConvPass, Status,
    STATUS_NOT_SUPPORTED,
};

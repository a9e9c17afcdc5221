//! # strand-autograd
//!
//! Reverse-mode autograd over strand-core tensors, and a differentiable
//! convolution with pluggable kernels.
//!
//! - [`Variable`]: a tensor with its place in the graph
//! - [`Function`]: backward nodes, wired by [`Edge`]s
//! - [`SavedVariable`]: version-checked captures for backward
//! - [`backward`]: the engine, returning a [`GradStore`]
//! - [`conv`]: convolution forward, backward and double backward
//! - [`SymbolicContext`]: IR export of forward functions
// - grad_mode: thread-local recording switch
// - context: backend flags, accelerator registry, algorithm cache

pub mod context;
pub mod conv;
pub mod engine;
pub mod function;
pub mod grad_mode;
pub mod saved;
pub mod symbolic;
pub mod variable;

pub use context::BackendContext;
pub use conv::{conv, conv_with_context, ConvBackend, ConvForward, ConvParams};
pub use engine::{backward, BackwardOptions, GradStore};
pub use function::{AddBackward, Edge, Function, FunctionFlags, NodeId};
pub use grad_mode::{is_grad_enabled, no_grad, with_grad_mode};
pub use saved::SavedVariable;
pub use symbolic::{AttributeValue, IrNode, Symbolic, SymbolicContext, ValueId};
pub use variable::{Variable, VariableId};

pub use strand_core::{Error, Result};

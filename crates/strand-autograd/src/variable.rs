// Variable: a tensor plus its place in the autograd graph
//
// A Variable wraps a strand_core::Tensor with the bookkeeping the engine
// needs:
//
//   - id:            stable identity, used as the GradStore key for leaves
//   - requires_grad: leaves opt in; non-leaves inherit it from their grad_fn
//   - grad_fn:       the backward node that produced this variable, if any
//   - output_nr:     which output of grad_fn this variable is
//
// Variables are Arc-wrapped, so cloning is cheap and two clones share the
// same identity.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use strand_core::{FloatElement, Result, Shape, Tensor};

use crate::function::{Edge, Function};

/// Unique identifier for a variable. Used as keys in GradStore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VariableId(u64);

impl Default for VariableId {
    fn default() -> Self {
        Self::new()
    }
}

impl VariableId {
    /// Generate a new unique variable ID (uses a global atomic counter).
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        VariableId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

struct VariableInner<E: FloatElement> {
    id: VariableId,
    data: Tensor<E>,
    requires_grad: bool,
    grad_fn: Option<Arc<dyn Function<E>>>,
    output_nr: usize,
}

/// A tensor that may participate in gradient computation.
pub struct Variable<E: FloatElement> {
    inner: Arc<VariableInner<E>>,
}

impl<E: FloatElement> Clone for Variable<E> {
    fn clone(&self) -> Self {
        Variable {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: FloatElement> fmt::Debug for Variable<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Variable")
            .field("id", &self.inner.id)
            .field("shape", self.inner.data.shape())
            .field("requires_grad", &self.requires_grad())
            .field("grad_fn", &self.inner.grad_fn.as_ref().map(|g| g.name()))
            .field("output_nr", &self.inner.output_nr)
            .finish()
    }
}

impl<E: FloatElement> Variable<E> {
    /// A leaf variable. Gradients for it are collected by the engine when
    /// `requires_grad` is set.
    pub fn leaf(data: Tensor<E>, requires_grad: bool) -> Self {
        Self::rebuild(VariableId::new(), data, requires_grad, None, 0)
    }

    /// A leaf that never requires grad.
    pub fn constant(data: Tensor<E>) -> Self {
        Self::leaf(data, false)
    }

    /// The `output_nr`-th output of `grad_fn`.
    pub fn from_function(data: Tensor<E>, grad_fn: Arc<dyn Function<E>>, output_nr: usize) -> Self {
        Self::rebuild(VariableId::new(), data, true, Some(grad_fn), output_nr)
    }

    pub(crate) fn rebuild(
        id: VariableId,
        data: Tensor<E>,
        requires_grad: bool,
        grad_fn: Option<Arc<dyn Function<E>>>,
        output_nr: usize,
    ) -> Self {
        Variable {
            inner: Arc::new(VariableInner {
                id,
                data,
                requires_grad: requires_grad || grad_fn.is_some(),
                grad_fn,
                output_nr,
            }),
        }
    }

    pub fn id(&self) -> VariableId {
        self.inner.id
    }

    pub fn data(&self) -> &Tensor<E> {
        &self.inner.data
    }

    pub fn shape(&self) -> &Shape {
        self.inner.data.shape()
    }

    pub fn dims(&self) -> &[usize] {
        self.inner.data.dims()
    }

    pub fn requires_grad(&self) -> bool {
        self.inner.requires_grad
    }

    pub fn grad_fn(&self) -> Option<&Arc<dyn Function<E>>> {
        self.inner.grad_fn.as_ref()
    }

    pub fn output_nr(&self) -> usize {
        self.inner.output_nr
    }

    /// True when no backward node produced this variable.
    pub fn is_leaf(&self) -> bool {
        self.inner.grad_fn.is_none()
    }

    /// Version of the underlying storage; bumped by every in-place write.
    pub fn version(&self) -> u64 {
        self.inner.data.version()
    }

    /// A new leaf sharing this variable's data but cut from the graph.
    pub fn detach(&self) -> Self {
        Self::leaf(self.inner.data.clone(), false)
    }

    /// Where a gradient for this variable should be sent during backward.
    ///
    /// Non-leaves route to their grad_fn, leaves that require grad to the
    /// gradient store, everything else nowhere.
    pub fn gradient_edge(&self) -> Option<Edge<E>> {
        match &self.inner.grad_fn {
            Some(f) => Some(Edge::Node {
                function: Arc::clone(f),
                input_nr: self.inner.output_nr,
            }),
            None if self.inner.requires_grad => Some(Edge::Accumulate(self.inner.id)),
            None => None,
        }
    }

    /// Convenience: dense copy of the data.
    pub fn to_vec(&self) -> Result<Vec<E>> {
        self.inner.data.to_vec()
    }
}

// Function: a node in the backward graph
//
// Every differentiable operation produces a backward node implementing
// `Function`. The node knows where the gradients it computes must go
// (`next_functions`, one edge per forward input) and holds whatever it saved
// during forward.
//
//   forward:   y = f(a, b)          y.grad_fn = FBackward { next: [a.edge, b.edge] }
//   backward:  [ga, gb] = FBackward.apply([gy])
//
// Node ids come from a global counter, so a node created later always has a
// larger id than the nodes it depends on. The engine's ready queue uses this
// to prefer the most recently created node among those that are ready.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use strand_core::{ops, FloatElement, Result};

use crate::grad_mode::is_grad_enabled;
use crate::variable::{Variable, VariableId};

/// Unique, monotonically increasing node identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl Default for NodeId {
    fn default() -> Self {
        Self::next()
    }
}

impl NodeId {
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        NodeId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Destination of one gradient produced by a node.
pub enum Edge<E: FloatElement> {
    /// Feed `input_nr`-th gradient input of another node.
    Node {
        function: Arc<dyn Function<E>>,
        input_nr: usize,
    },
    /// Sum into the gradient of a leaf variable.
    Accumulate(VariableId),
}

impl<E: FloatElement> Clone for Edge<E> {
    fn clone(&self) -> Self {
        match self {
            Edge::Node { function, input_nr } => Edge::Node {
                function: Arc::clone(function),
                input_nr: *input_nr,
            },
            Edge::Accumulate(id) => Edge::Accumulate(*id),
        }
    }
}

impl<E: FloatElement> fmt::Debug for Edge<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Edge::Node { function, input_nr } => write!(
                f,
                "Node({}#{:?}, {})",
                function.name(),
                function.flags().id,
                input_nr
            ),
            Edge::Accumulate(id) => write!(f, "Accumulate({id:?})"),
        }
    }
}

/// Graph metadata shared by every node.
pub struct FunctionFlags<E: FloatElement> {
    pub id: NodeId,
    /// False when no input requires grad or grad mode was off; such nodes
    /// are never attached to outputs.
    pub is_executable: bool,
    pub next_functions: Vec<Option<Edge<E>>>,
}

impl<E: FloatElement> fmt::Debug for FunctionFlags<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionFlags")
            .field("id", &self.id)
            .field("is_executable", &self.is_executable)
            .field("next_functions", &self.next_functions)
            .finish()
    }
}

impl<E: FloatElement> FunctionFlags<E> {
    /// Flags for a node whose forward inputs are `inputs` (`None` for an
    /// absent optional input such as a missing bias).
    pub fn from_inputs(inputs: &[Option<&Variable<E>>]) -> Self {
        let is_executable =
            is_grad_enabled() && inputs.iter().flatten().any(|v| v.requires_grad());
        let next_functions = inputs
            .iter()
            .map(|v| v.and_then(|v| v.gradient_edge()))
            .collect();
        FunctionFlags {
            id: NodeId::next(),
            is_executable,
            next_functions,
        }
    }

    /// Flags for a node with no graph inputs.
    pub fn leafless() -> Self {
        FunctionFlags {
            id: NodeId::next(),
            is_executable: false,
            next_functions: Vec::new(),
        }
    }

    /// Which of the node's outputs somebody downstream will consume.
    pub fn output_mask(&self) -> Vec<bool> {
        self.next_functions.iter().map(Option::is_some).collect()
    }
}

/// A node of the autograd graph.
///
/// `apply` receives one (possibly absent) gradient per gradient input and
/// returns one (possibly absent) gradient per entry of `next_functions`.
pub trait Function<E: FloatElement>: Send + Sync {
    fn name(&self) -> &'static str;

    fn flags(&self) -> &FunctionFlags<E>;

    fn apply(&self, inputs: &[Option<Variable<E>>]) -> Result<Vec<Option<Variable<E>>>>;

    /// Number of gradients `apply` expects.
    fn num_inputs(&self) -> usize {
        1
    }

    /// Drop everything captured for backward.
    fn release_variables(&self) {}
}

// ADD BACKWARD
//
// Gradient accumulation under `create_graph` must itself be differentiable,
// so two gradients flowing into the same slot are summed through this node.

/// Backward of `a + b`: passes the incoming gradient to both operands.
pub struct AddBackward<E: FloatElement> {
    flags: FunctionFlags<E>,
}

impl<E: FloatElement> Function<E> for AddBackward<E> {
    fn name(&self) -> &'static str {
        "AddBackward"
    }

    fn flags(&self) -> &FunctionFlags<E> {
        &self.flags
    }

    fn apply(&self, inputs: &[Option<Variable<E>>]) -> Result<Vec<Option<Variable<E>>>> {
        let grad = inputs.first().cloned().flatten();
        Ok(self
            .flags
            .next_functions
            .iter()
            .map(|edge| edge.as_ref().and(grad.clone()))
            .collect())
    }
}

/// `a + b`, recording an `AddBackward` node when grad mode calls for it.
pub fn add<E: FloatElement>(a: &Variable<E>, b: &Variable<E>) -> Result<Variable<E>> {
    let data = ops::add(a.data(), b.data())?;
    let flags = FunctionFlags::from_inputs(&[Some(a), Some(b)]);
    if flags.is_executable {
        Ok(Variable::from_function(data, Arc::new(AddBackward { flags }), 0))
    } else {
        Ok(Variable::constant(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grad_mode::no_grad;
    use strand_core::Tensor;

    #[test]
    fn test_flags_follow_inputs() {
        let a = Variable::leaf(Tensor::<f64>::ones(2).unwrap(), true);
        let b = Variable::constant(Tensor::<f64>::ones(2).unwrap());
        let flags = FunctionFlags::from_inputs(&[Some(&a), Some(&b), None]);
        assert!(flags.is_executable);
        assert_eq!(flags.output_mask(), vec![true, false, false]);

        let flags = no_grad(|| FunctionFlags::from_inputs(&[Some(&a)]));
        assert!(!flags.is_executable);
    }

    #[test]
    fn test_node_ids_increase() {
        let a = NodeId::next();
        let b = NodeId::next();
        assert!(b > a);
    }

    #[test]
    fn test_add_records_node() {
        let a = Variable::leaf(Tensor::<f64>::from_vec(vec![1.0, 2.0], 2).unwrap(), true);
        let b = Variable::constant(Tensor::<f64>::from_vec(vec![3.0, 4.0], 2).unwrap());
        let c = add(&a, &b).unwrap();
        assert_eq!(c.to_vec().unwrap(), vec![4.0, 6.0]);
        assert_eq!(c.grad_fn().map(|f| f.name()), Some("AddBackward"));

        let d = add(&b, &b).unwrap();
        assert!(d.is_leaf());
    }
}

// Engine: reverse-mode execution of the backward graph
//
// HOW IT WORKS:
//
//   1. Discovery: walk next_functions from the roots and count, for every
//      reachable node, how many edges point at it (its dependencies).
//
//   2. Seeding: each root's gradient goes to the root's grad_fn input buffer
//      (or straight into the GradStore when the root is a leaf).
//
//   3. Execution: a node becomes ready once all its dependencies have
//      delivered. Ready nodes are popped highest NodeId first, applied, and
//      their outputs routed along next_functions: into other nodes' input
//      buffers, or into the GradStore for leaves.
//
// ACCUMULATION: a buffer slot or leaf that receives several gradients holds
// their sum. Under create_graph the sum is taken with a recorded
// AddBackward node so that it stays differentiable.
//
// RELEASE: unless the graph is retained, every node drops its saved
// variables right after it ran. A second backward through the same nodes
// then fails with Error::SavedVariableReleased.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::sync::Arc;

use log::{debug, trace};
use strand_core::{Error, FloatElement, Result, Tensor};

use crate::function::{self, Edge, Function, NodeId};
use crate::grad_mode::with_grad_mode;
use crate::variable::{Variable, VariableId};

/// Options for one backward pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct BackwardOptions {
    /// Keep saved variables alive so the graph can be walked again.
    pub retain_graph: bool,
    /// Record the backward computation itself, for higher-order gradients.
    /// Implies `retain_graph`.
    pub create_graph: bool,
}

impl BackwardOptions {
    pub fn with_retain_graph(mut self, retain: bool) -> Self {
        self.retain_graph = retain;
        self
    }

    pub fn with_create_graph(mut self, create: bool) -> Self {
        self.create_graph = create;
        self
    }

    fn retains(&self) -> bool {
        self.retain_graph || self.create_graph
    }
}

/// Gradients of the leaves reached by a backward pass.
///
/// Use `grads.get(&variable)` to retrieve the gradient of a leaf.
pub struct GradStore<E: FloatElement> {
    grads: HashMap<VariableId, Variable<E>>,
    order: Vec<NodeId>,
}

impl<E: FloatElement> fmt::Debug for GradStore<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GradStore")
            .field("grads", &self.grads.len())
            .field("order", &self.order)
            .finish()
    }
}

impl<E: FloatElement> Default for GradStore<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: FloatElement> GradStore<E> {
    pub fn new() -> Self {
        GradStore {
            grads: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Gradient of a leaf variable, if any flowed to it.
    pub fn get(&self, var: &Variable<E>) -> Option<&Variable<E>> {
        self.grads.get(&var.id())
    }

    pub fn get_by_id(&self, id: &VariableId) -> Option<&Variable<E>> {
        self.grads.get(id)
    }

    /// Gradient data of a leaf variable.
    pub fn tensor(&self, var: &Variable<E>) -> Option<&Tensor<E>> {
        self.get(var).map(Variable::data)
    }

    pub fn len(&self) -> usize {
        self.grads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grads.is_empty()
    }

    /// Nodes in the order the engine applied them.
    pub fn execution_order(&self) -> &[NodeId] {
        &self.order
    }

    /// Accumulate a gradient for a leaf.
    /// If a gradient already exists for this leaf, add the new one to it.
    pub fn accumulate(&mut self, id: VariableId, grad: Variable<E>) -> Result<()> {
        let next = match self.grads.remove(&id) {
            Some(existing) => function::add(&existing, &grad)?,
            None => grad,
        };
        self.grads.insert(id, next);
        Ok(())
    }
}

// READY QUEUE
//
// Max-heap keyed by NodeId: among ready nodes, the most recently created
// runs first.

#[derive(Debug, Clone, PartialEq, Eq)]
struct ReadyTask {
    node: NodeId,
}

impl Ord for ReadyTask {
    fn cmp(&self, other: &Self) -> Ordering {
        self.node.cmp(&other.node)
    }
}

impl PartialOrd for ReadyTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct ReadyQueue {
    heap: BinaryHeap<ReadyTask>,
    pushes: usize,
    pops: usize,
}

impl ReadyQueue {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(capacity),
            pushes: 0,
            pops: 0,
        }
    }

    fn push(&mut self, node: NodeId) {
        self.heap.push(ReadyTask { node });
        self.pushes += 1;
    }

    fn pop(&mut self) -> Option<NodeId> {
        let next = self.heap.pop().map(|task| task.node);
        if next.is_some() {
            self.pops += 1;
        }
        next
    }
}

/// Gradients waiting for one node, one slot per gradient input.
struct InputBuffer<E: FloatElement> {
    slots: Vec<Option<Variable<E>>>,
}

impl<E: FloatElement> InputBuffer<E> {
    fn new(len: usize) -> Self {
        InputBuffer {
            slots: vec![None; len],
        }
    }

    fn add(&mut self, index: usize, grad: Variable<E>) -> Result<()> {
        let len = self.slots.len();
        let slot = self.slots.get_mut(index).ok_or_else(|| {
            Error::msg(format!(
                "gradient routed to input {index} of a node with {len} gradient inputs"
            ))
        })?;
        *slot = Some(match slot.take() {
            Some(prev) => function::add(&prev, &grad)?,
            None => grad,
        });
        Ok(())
    }
}

struct GraphTask<E: FloatElement> {
    nodes: HashMap<NodeId, Arc<dyn Function<E>>>,
    dependencies: HashMap<NodeId, usize>,
    buffers: HashMap<NodeId, InputBuffer<E>>,
}

impl<E: FloatElement> GraphTask<E> {
    fn discover<'a>(roots: impl Iterator<Item = &'a Edge<E>>) -> Self {
        let mut nodes: HashMap<NodeId, Arc<dyn Function<E>>> = HashMap::new();
        let mut dependencies = HashMap::new();
        let mut stack = Vec::new();
        for edge in roots {
            if let Edge::Node { function, .. } = edge {
                let id = function.flags().id;
                if !nodes.contains_key(&id) {
                    nodes.insert(id, Arc::clone(function));
                    stack.push(Arc::clone(function));
                }
            }
        }
        while let Some(node) = stack.pop() {
            for edge in node.flags().next_functions.iter().flatten() {
                if let Edge::Node { function, .. } = edge {
                    let id = function.flags().id;
                    *dependencies.entry(id).or_insert(0usize) += 1;
                    if !nodes.contains_key(&id) {
                        nodes.insert(id, Arc::clone(function));
                        stack.push(Arc::clone(function));
                    }
                }
            }
        }
        GraphTask {
            nodes,
            dependencies,
            buffers: HashMap::new(),
        }
    }

    /// Deliver a gradient along `edge`.
    fn route(&mut self, edge: &Edge<E>, grad: Variable<E>, store: &mut GradStore<E>) -> Result<()> {
        match edge {
            Edge::Accumulate(id) => store.accumulate(*id, grad),
            Edge::Node { function, input_nr } => {
                let id = function.flags().id;
                self.buffers
                    .entry(id)
                    .or_insert_with(|| InputBuffer::new(function.num_inputs()))
                    .add(*input_nr, grad)
            }
        }
    }

    /// One fewer pending producer for `node`; true once it is ready.
    fn satisfy(&mut self, node: NodeId) -> bool {
        match self.dependencies.get_mut(&node) {
            Some(n) => {
                *n = n.saturating_sub(1);
                *n == 0
            }
            None => true,
        }
    }
}

/// Compute gradients of `roots` seeded with `grad_roots`.
///
/// Every root must require grad; each seed must match its root's shape.
pub fn backward<E: FloatElement>(
    roots: &[Variable<E>],
    grad_roots: &[Variable<E>],
    opts: BackwardOptions,
) -> Result<GradStore<E>> {
    if roots.len() != grad_roots.len() {
        return Err(Error::msg(format!(
            "backward got {} roots but {} root gradients",
            roots.len(),
            grad_roots.len()
        )));
    }
    let mut seeds = Vec::with_capacity(roots.len());
    for (i, (root, seed)) in roots.iter().zip(grad_roots).enumerate() {
        if root.shape() != seed.shape() {
            return Err(Error::ShapeMismatch {
                expected: root.shape().clone(),
                got: seed.shape().clone(),
            });
        }
        let edge = root.gradient_edge().ok_or_else(|| {
            Error::msg(format!(
                "element {i} of roots does not require grad and does not have a grad_fn"
            ))
        })?;
        seeds.push((edge, seed.clone()));
    }

    with_grad_mode(opts.create_graph, || execute(seeds, opts))
}

fn execute<E: FloatElement>(
    seeds: Vec<(Edge<E>, Variable<E>)>,
    opts: BackwardOptions,
) -> Result<GradStore<E>> {
    let mut task = GraphTask::discover(seeds.iter().map(|(edge, _)| edge));
    let mut store = GradStore::new();
    let mut queue = ReadyQueue::with_capacity(task.nodes.len());
    debug!(
        "backward: {} roots, {} nodes, retain_graph={}, create_graph={}",
        seeds.len(),
        task.nodes.len(),
        opts.retains(),
        opts.create_graph
    );

    for (edge, seed) in seeds {
        task.route(&edge, seed, &mut store)?;
    }
    let mut initial: Vec<NodeId> = task
        .nodes
        .keys()
        .filter(|id| !task.dependencies.contains_key(id))
        .copied()
        .collect();
    initial.sort();
    for id in initial {
        queue.push(id);
    }

    while let Some(id) = queue.pop() {
        let Some(function) = task.nodes.get(&id).cloned() else {
            continue;
        };
        let next = &function.flags().next_functions;
        let inputs = match task.buffers.remove(&id) {
            Some(buffer) => buffer.slots,
            None => vec![None; function.num_inputs()],
        };

        let outputs = if inputs.iter().all(Option::is_none) {
            vec![None; next.len()]
        } else {
            trace!("backward: applying {}#{:?}", function.name(), id);
            function.apply(&inputs)?
        };
        if outputs.len() != next.len() {
            return Err(Error::msg(format!(
                "{} returned {} gradients for {} inputs",
                function.name(),
                outputs.len(),
                next.len()
            )));
        }
        if !opts.retains() {
            function.release_variables();
        }
        store.order.push(id);

        for (edge, grad) in next.iter().zip(outputs) {
            let Some(edge) = edge else { continue };
            if let Some(grad) = grad {
                task.route(edge, grad, &mut store)?;
            }
            if let Edge::Node { function: child, .. } = edge {
                let child = child.flags().id;
                if task.satisfy(child) {
                    queue.push(child);
                }
            }
        }
    }
    trace!("backward: {} pushes, {} pops", queue.pushes, queue.pops);
    Ok(store)
}

impl<E: FloatElement> Variable<E> {
    /// Backward from this variable, seeded with `grad`.
    pub fn backward(&self, grad: &Tensor<E>, opts: BackwardOptions) -> Result<GradStore<E>> {
        backward(
            std::slice::from_ref(self),
            &[Variable::constant(grad.clone())],
            opts,
        )
    }
}

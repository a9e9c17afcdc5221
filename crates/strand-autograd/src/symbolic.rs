// Symbolic export: emit graph IR instead of computing
//
// Forward functions that implement `Symbolic` can describe themselves as IR
// nodes. A SymbolicContext owns the growing node list and hands out value
// ids; values may carry a shape so that nodes can derive attributes (kernel
// sizes) and output shapes from their inputs.

use strand_core::{Error, Result};

/// Identifier of one IR value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub usize);

/// Attribute payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeValue {
    Int(i64),
    Ints(Vec<i64>),
}

/// One operation in the exported graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrNode {
    pub kind: String,
    pub inputs: Vec<ValueId>,
    pub outputs: Vec<ValueId>,
    /// Ordered as emitted.
    pub attributes: Vec<(String, AttributeValue)>,
}

impl IrNode {
    pub fn attribute(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }
}

/// Accumulates IR nodes during export.
#[derive(Debug, Default)]
pub struct SymbolicContext {
    nodes: Vec<IrNode>,
    shapes: Vec<Option<Vec<usize>>>,
}

impl SymbolicContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// A graph input of known shape.
    pub fn input(&mut self, shape: &[usize]) -> ValueId {
        self.value(Some(shape.to_vec()))
    }

    /// A fresh value, shape optional.
    pub fn value(&mut self, shape: Option<Vec<usize>>) -> ValueId {
        self.shapes.push(shape);
        ValueId(self.shapes.len() - 1)
    }

    pub fn shape(&self, id: ValueId) -> Option<&[usize]> {
        self.shapes.get(id.0).and_then(|s| s.as_deref())
    }

    /// Shape of `id`, or an error naming what needed it.
    pub fn require_shape(&self, id: ValueId, what: &str) -> Result<&[usize]> {
        self.shape(id)
            .ok_or_else(|| Error::msg(format!("symbolic {what}: shape of value {} is unknown", id.0)))
    }

    pub fn push(&mut self, node: IrNode) {
        self.nodes.push(node);
    }

    pub fn nodes(&self) -> &[IrNode] {
        &self.nodes
    }
}

/// A forward function that can describe itself as IR.
pub trait Symbolic {
    fn symbolic(&self, ctx: &mut SymbolicContext, inputs: &[ValueId]) -> Result<Vec<ValueId>>;
}

// SavedVariable: a variable captured by a backward node
//
// A node saves the operands its backward needs. Two hazards come with that:
//
//   1. The caller may mutate the saved tensor in place after forward. The
//      storage version is recorded at capture and compared on unpack.
//
//   2. A node may need one of its own outputs. Holding that output's grad_fn
//      strongly would make the node own itself, so the link is weak in that
//      case and only identifies the owner.
//
// After `release` (the engine calls it once a node ran without
// retain_graph), unpacking fails instead of silently recomputing.

use std::sync::{Arc, Weak};

use strand_core::{Error, FloatElement, Result, Tensor};

use crate::function::Function;
use crate::variable::{Variable, VariableId};

enum GradFnLink<E: FloatElement> {
    None,
    Strong(Arc<dyn Function<E>>),
    Owner(Weak<dyn Function<E>>),
}

struct Capture<E: FloatElement> {
    id: VariableId,
    data: Tensor<E>,
    version: u64,
    requires_grad: bool,
    output_nr: usize,
    grad_fn: GradFnLink<E>,
}

/// A captured variable that can be reconstituted during backward.
pub struct SavedVariable<E: FloatElement> {
    owner: &'static str,
    slot: &'static str,
    capture: Option<Capture<E>>,
}

impl<E: FloatElement> SavedVariable<E> {
    /// Capture `var` for the node named `owner`. `is_output` marks a
    /// variable produced by that same node.
    pub fn new(var: &Variable<E>, owner: &'static str, slot: &'static str, is_output: bool) -> Self {
        let grad_fn = match var.grad_fn() {
            None => GradFnLink::None,
            Some(f) if is_output => GradFnLink::Owner(Arc::downgrade(f)),
            Some(f) => GradFnLink::Strong(Arc::clone(f)),
        };
        SavedVariable {
            owner,
            slot,
            capture: Some(Capture {
                id: var.id(),
                data: var.data().clone(),
                version: var.version(),
                requires_grad: var.requires_grad(),
                output_nr: var.output_nr(),
                grad_fn,
            }),
        }
    }

    /// Whether this capture holds its grad_fn only weakly.
    pub fn is_owner_output(&self) -> bool {
        matches!(
            self.capture.as_ref().map(|c| &c.grad_fn),
            Some(GradFnLink::Owner(_))
        )
    }

    pub fn is_released(&self) -> bool {
        self.capture.is_none()
    }

    /// Rebuild the captured variable, keeping its identity.
    pub fn unpack(&self) -> Result<Variable<E>> {
        let c = self.capture.as_ref().ok_or_else(|| Error::SavedVariableReleased {
            node: self.owner.to_string(),
        })?;
        let current = c.data.version();
        if current != c.version {
            return Err(Error::SavedVariableModified {
                name: format!("{} of {}", self.slot, self.owner),
                saved: c.version,
                current,
            });
        }
        let grad_fn = match &c.grad_fn {
            GradFnLink::None => None,
            GradFnLink::Strong(f) => Some(Arc::clone(f)),
            // The owner is running its own backward, so it is alive unless
            // the graph was torn down underneath us.
            GradFnLink::Owner(w) => Some(w.upgrade().ok_or_else(|| {
                Error::SavedVariableReleased {
                    node: self.owner.to_string(),
                }
            })?),
        };
        Ok(Variable::rebuild(
            c.id,
            c.data.clone(),
            c.requires_grad,
            grad_fn,
            c.output_nr,
        ))
    }

    /// Drop the capture.
    pub fn release(&mut self) {
        self.capture = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_core::ops;

    #[test]
    fn test_unpack_keeps_identity() {
        let v = Variable::leaf(Tensor::<f64>::ones(3).unwrap(), true);
        let saved = SavedVariable::new(&v, "TestBackward", "input", false);
        let u = saved.unpack().unwrap();
        assert_eq!(u.id(), v.id());
        assert!(u.requires_grad());
        assert!(u.data().storage().same_storage(v.data().storage()));
    }

    #[test]
    fn test_in_place_write_detected() {
        let v = Variable::leaf(Tensor::<f64>::ones(3).unwrap(), true);
        let saved = SavedVariable::new(&v, "TestBackward", "input", false);
        ops::fill_(v.data(), 2.0).unwrap();
        match saved.unpack() {
            Err(Error::SavedVariableModified { saved, current, name }) => {
                assert_eq!(current, saved + 1);
                assert_eq!(name, "input of TestBackward");
            }
            other => panic!("expected SavedVariableModified, got {other:?}"),
        }
    }

    #[test]
    fn test_release() {
        let v = Variable::leaf(Tensor::<f32>::ones(1).unwrap(), false);
        let mut saved = SavedVariable::new(&v, "TestBackward", "input", false);
        saved.release();
        assert!(saved.is_released());
        assert!(matches!(
            saved.unpack(),
            Err(Error::SavedVariableReleased { node }) if node == "TestBackward"
        ));
    }
}

use std::sync::{Arc, Mutex, MutexGuard};

use strand_core::{Error, FloatElement, Result, Shape, Tensor};

use crate::context::BackendContext;
use crate::function::{Function, FunctionFlags};
use crate::saved::SavedVariable;
use crate::variable::Variable;

use super::backend::{BackendState, ConvBackend};
use super::double_backward::ConvBackwardBackward;
use super::forward::Promotion;
use super::params::ConvParams;

// ConvBackward: gradients of a convolution
//
//   inputs:   [grad_output]
//   outputs:  [grad_input, grad_weight, grad_bias]   (one per forward input)
//
// Only the gradients somebody consumes are computed: an output whose
// next_functions slot is empty is skipped. The kernels are the ones the
// forward pass chose, with the scratch it left behind.
//
// When the engine runs with create_graph, the computed gradients are
// attached to a ConvBackwardBackward node so they can be differentiated
// again.

struct ConvSaved<E: FloatElement> {
    input: SavedVariable<E>,
    weight: SavedVariable<E>,
    bias: Option<SavedVariable<E>>,
    state: Option<BackendState<E>>,
}

/// Backward node of [`ConvForward`](super::forward::ConvForward).
pub struct ConvBackward<E: FloatElement> {
    flags: FunctionFlags<E>,
    params: ConvParams,
    ctx: BackendContext,
    output_shape: Shape,
    saved: Mutex<ConvSaved<E>>,
}

impl<E: FloatElement> ConvBackward<E> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        flags: FunctionFlags<E>,
        params: ConvParams,
        ctx: BackendContext,
        input: &Variable<E>,
        weight: &Variable<E>,
        bias: Option<&Variable<E>>,
        state: BackendState<E>,
        output_shape: Shape,
    ) -> Self {
        let name = "ConvBackward";
        ConvBackward {
            flags,
            params,
            ctx,
            output_shape,
            saved: Mutex::new(ConvSaved {
                input: SavedVariable::new(input, name, "input", false),
                weight: SavedVariable::new(weight, name, "weight", false),
                bias: bias.map(|b| SavedVariable::new(b, name, "bias", false)),
                state: Some(state),
            }),
        }
    }

    pub fn params(&self) -> &ConvParams {
        &self.params
    }

    /// Backend the forward pass ran on; None once released.
    pub fn backend(&self) -> Option<ConvBackend> {
        self.lock()
            .ok()
            .and_then(|s| s.state.as_ref().map(BackendState::backend))
    }

    fn lock(&self) -> Result<MutexGuard<'_, ConvSaved<E>>> {
        self.saved
            .lock()
            .map_err(|_| Error::msg("ConvBackward: saved state poisoned"))
    }
}

/// Wrap computed gradients as graph outputs of `node`, or as constants.
pub(crate) fn wrap_outputs<E: FloatElement>(
    grads: Vec<Option<Tensor<E>>>,
    node: Option<Arc<dyn Function<E>>>,
) -> Vec<Option<Variable<E>>> {
    grads
        .into_iter()
        .enumerate()
        .map(|(nr, g)| {
            g.map(|t| match &node {
                Some(node) => Variable::from_function(t, Arc::clone(node), nr),
                None => Variable::constant(t),
            })
        })
        .collect()
}

impl<E: FloatElement> Function<E> for ConvBackward<E> {
    fn name(&self) -> &'static str {
        "ConvBackward"
    }

    fn flags(&self) -> &FunctionFlags<E> {
        &self.flags
    }

    fn apply(&self, grads: &[Option<Variable<E>>]) -> Result<Vec<Option<Variable<E>>>> {
        let Some(grad_output) = grads.first().cloned().flatten() else {
            return Ok(vec![None; self.flags.next_functions.len()]);
        };
        if grad_output.shape() != &self.output_shape {
            return Err(Error::ShapeMismatch {
                expected: self.output_shape.clone(),
                got: grad_output.shape().clone(),
            });
        }

        let mask = self.flags.output_mask();
        let wants = |i: usize| mask.get(i).copied().unwrap_or(false);
        let prep = Promotion::new(&self.params);

        let (input, weight, bias, grads) = {
            let mut saved = self.lock()?;
            let input = saved.input.unpack()?;
            let weight = saved.weight.unpack()?;
            let bias = saved.bias.as_ref().map(SavedVariable::unpack).transpose()?;
            let state = saved.state.as_mut().ok_or_else(|| Error::SavedVariableReleased {
                node: "ConvBackward".to_string(),
            })?;
            let gy = grad_output.data();

            let gi = if wants(0) {
                Some(prep.grad_input(state, gy, weight.data(), input.dims())?)
            } else {
                None
            };
            let gw = if wants(1) {
                Some(prep.grad_weight(state, input.data(), gy, weight.dims())?)
            } else {
                None
            };
            let gb = if wants(2) && bias.is_some() {
                Some(state.grad_bias(gy)?)
            } else {
                None
            };
            (input, weight, bias, vec![gi, gw, gb])
        };

        let flags = FunctionFlags::from_inputs(&[Some(&input), Some(&weight), Some(&grad_output)]);
        let node: Option<Arc<dyn Function<E>>> = if flags.is_executable {
            Some(Arc::new(ConvBackwardBackward::new(
                flags,
                self.params.clone(),
                self.ctx.clone(),
                &input,
                &weight,
                bias.as_ref(),
                &grad_output,
            )))
        } else {
            None
        };
        let mut outputs = wrap_outputs(grads, node);
        outputs.truncate(self.flags.next_functions.len());
        Ok(outputs)
    }

    fn release_variables(&self) {
        if let Ok(mut saved) = self.saved.lock() {
            saved.input.release();
            saved.weight.release();
            if let Some(b) = saved.bias.as_mut() {
                b.release();
            }
            saved.state = None;
        }
    }
}

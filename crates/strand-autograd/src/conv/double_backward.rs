use std::sync::Mutex;

use strand_core::{ops, Error, FloatElement, Result, Tensor};

use crate::context::BackendContext;
use crate::function::{Function, FunctionFlags};
use crate::saved::SavedVariable;
use crate::variable::Variable;

use super::backward::wrap_outputs;
use super::forward::Promotion;
use super::params::ConvParams;

// ConvBackwardBackward: second-order gradients of a convolution
//
//   inputs:   [ggI, ggW, ggB]       gradients w.r.t. ConvBackward's outputs
//   outputs:  [gI, gW, ggO]         w.r.t. input, weight and grad_output
//
// The first-order gradients are bilinear in (gO, W) and (x, gO), so
//
//   ggO = F(ggI, W) + F(x, ggW) + ggB     (bias broadcast over channels)
//   gW  = GW(ggI, gO)
//   gI  = GI(gO, ggW)
//
// where F, GI and GW are the same convolution's output, input-gradient and
// weight-gradient maps. Transposed convolutions swap operand roles inside
// those maps, not here.
//
// The results are plain tensors: gradients beyond second order are not
// recorded.

struct DoubleSaved<E: FloatElement> {
    input: SavedVariable<E>,
    weight: SavedVariable<E>,
    grad_output: SavedVariable<E>,
    has_bias: bool,
}

/// Backward node of [`ConvBackward`](super::backward::ConvBackward).
pub struct ConvBackwardBackward<E: FloatElement> {
    flags: FunctionFlags<E>,
    params: ConvParams,
    ctx: BackendContext,
    saved: Mutex<DoubleSaved<E>>,
}

impl<E: FloatElement> ConvBackwardBackward<E> {
    pub(crate) fn new(
        flags: FunctionFlags<E>,
        params: ConvParams,
        ctx: BackendContext,
        input: &Variable<E>,
        weight: &Variable<E>,
        bias: Option<&Variable<E>>,
        grad_output: &Variable<E>,
    ) -> Self {
        let name = "ConvBackwardBackward";
        ConvBackwardBackward {
            flags,
            params,
            ctx,
            saved: Mutex::new(DoubleSaved {
                input: SavedVariable::new(input, name, "input", false),
                weight: SavedVariable::new(weight, name, "weight", false),
                grad_output: SavedVariable::new(grad_output, name, "grad_output", false),
                has_bias: bias.is_some(),
            }),
        }
    }
}

fn accumulate<E: FloatElement>(acc: Option<Tensor<E>>, t: Tensor<E>) -> Result<Option<Tensor<E>>> {
    Ok(Some(match acc {
        Some(a) => ops::add(&a, &t)?,
        None => t,
    }))
}

impl<E: FloatElement> Function<E> for ConvBackwardBackward<E> {
    fn name(&self) -> &'static str {
        "ConvBackwardBackward"
    }

    fn flags(&self) -> &FunctionFlags<E> {
        &self.flags
    }

    fn num_inputs(&self) -> usize {
        3
    }

    fn apply(&self, grads: &[Option<Variable<E>>]) -> Result<Vec<Option<Variable<E>>>> {
        let slot = |i: usize| grads.get(i).cloned().flatten();
        let (ggi, ggw, ggb) = (slot(0), slot(1), slot(2));

        let (input, weight, grad_output, has_bias) = {
            let saved = self
                .saved
                .lock()
                .map_err(|_| Error::msg("ConvBackwardBackward: saved state poisoned"))?;
            (
                saved.input.unpack()?,
                saved.weight.unpack()?,
                saved.grad_output.unpack()?,
                saved.has_bias,
            )
        };
        let (x, w, gy) = (input.data(), weight.data(), grad_output.data());

        let mask = self.flags.output_mask();
        let wants = |i: usize| mask.get(i).copied().unwrap_or(false);
        let prep = Promotion::new(&self.params);
        let mut state = prep.select(&self.ctx, x, w)?;

        let gg_out = if wants(2) {
            let mut acc = None;
            if let Some(ggi) = &ggi {
                acc = accumulate(acc, prep.output(&mut state, ggi.data(), w)?)?;
            }
            if let Some(ggw) = &ggw {
                acc = accumulate(acc, prep.output(&mut state, x, ggw.data())?)?;
            }
            if let (Some(ggb), true) = (&ggb, has_bias) {
                let out = match acc {
                    Some(a) => a,
                    None => Tensor::zeros_like(gy)?,
                };
                ops::add_channel_bias_(&out, ggb.data())?;
                acc = Some(out);
            }
            acc
        } else {
            None
        };

        let g_weight = match (&ggi, wants(1)) {
            (Some(ggi), true) => Some(prep.grad_weight(&mut state, ggi.data(), gy, weight.dims())?),
            _ => None,
        };
        let g_input = match (&ggw, wants(0)) {
            (Some(ggw), true) => Some(prep.grad_input(&mut state, gy, ggw.data(), input.dims())?),
            _ => None,
        };

        Ok(wrap_outputs(vec![g_input, g_weight, gg_out], None))
    }

    fn release_variables(&self) {
        if let Ok(mut saved) = self.saved.lock() {
            saved.input.release();
            saved.weight.release();
            saved.grad_output.release();
        }
    }
}

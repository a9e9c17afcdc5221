use std::sync::Arc;

use strand_core::{Error, FloatElement, Result, Tensor};

use crate::context::BackendContext;
use crate::function::{Function, FunctionFlags};
use crate::symbolic::{AttributeValue, IrNode, Symbolic, SymbolicContext, ValueId};
use crate::variable::Variable;

use super::backend::BackendState;
use super::backward::ConvBackward;
use super::params::ConvParams;

// ConvForward: the differentiable convolution entry point
//
//   inputs:  [input, weight, bias?]
//   output:  [conv(input, weight) + bias]
//
// Steps:
//   1. validate parameters and shapes
//   2. promote 1-D to 2-D (unit height) so kernels only see 2-D and 3-D
//   3. select a backend and run it, add the bias
//   4. demote the output back to 1-D if needed
//   5. when the graph is being recorded, attach a ConvBackward that keeps
//      the inputs and the backend state

/// Parameters after 1-D promotion, with helpers that promote operands on
/// the way into the kernels and demote results on the way out.
#[derive(Debug, Clone)]
pub(crate) struct Promotion {
    pub params: ConvParams,
    promoted: bool,
}

impl Promotion {
    pub fn new(params: &ConvParams) -> Self {
        let mut params = params.clone();
        let promoted = params.spatial_dims() == 1;
        params.view1d_as_2d();
        Promotion { params, promoted }
    }

    pub fn promote<E: FloatElement>(&self, t: &Tensor<E>) -> Result<Tensor<E>> {
        if self.promoted {
            t.unsqueeze(2)
        } else {
            Ok(t.clone())
        }
    }

    pub fn promote_shape(&self, dims: &[usize]) -> Vec<usize> {
        let mut dims = dims.to_vec();
        if self.promoted {
            dims.insert(2, 1);
        }
        dims
    }

    pub fn demote<E: FloatElement>(&self, t: Tensor<E>) -> Result<Tensor<E>> {
        if self.promoted {
            t.squeeze(2)
        } else {
            Ok(t)
        }
    }

    /// Backend for operands shaped like `x` and `w`.
    pub fn select<E: FloatElement>(
        &self,
        ctx: &BackendContext,
        x: &Tensor<E>,
        w: &Tensor<E>,
    ) -> Result<BackendState<E>> {
        BackendState::select(&self.params, ctx, &self.promote(x)?, &self.promote(w)?)
    }

    /// conv(x, w), no bias.
    pub fn output<E: FloatElement>(
        &self,
        state: &mut BackendState<E>,
        x: &Tensor<E>,
        w: &Tensor<E>,
    ) -> Result<Tensor<E>> {
        let y = state.output(&self.params, &self.promote(x)?, &self.promote(w)?)?;
        self.demote(y)
    }

    pub fn grad_input<E: FloatElement>(
        &self,
        state: &mut BackendState<E>,
        gy: &Tensor<E>,
        w: &Tensor<E>,
        input_shape: &[usize],
    ) -> Result<Tensor<E>> {
        let gx = state.grad_input(
            &self.params,
            &self.promote(gy)?,
            &self.promote(w)?,
            &self.promote_shape(input_shape),
        )?;
        self.demote(gx)
    }

    pub fn grad_weight<E: FloatElement>(
        &self,
        state: &mut BackendState<E>,
        x: &Tensor<E>,
        gy: &Tensor<E>,
        weight_shape: &[usize],
    ) -> Result<Tensor<E>> {
        let gw = state.grad_weight(
            &self.params,
            &self.promote(x)?,
            &self.promote(gy)?,
            &self.promote_shape(weight_shape),
        )?;
        self.demote(gw)
    }
}

/// Forward convolution as a graph function.
pub struct ConvForward<E: FloatElement> {
    params: ConvParams,
    ctx: BackendContext,
    flags: FunctionFlags<E>,
}

impl<E: FloatElement> ConvForward<E> {
    /// Uses the process-wide [`BackendContext`].
    pub fn new(params: ConvParams) -> Self {
        Self::with_context(params, BackendContext::global())
    }

    pub fn with_context(params: ConvParams, ctx: BackendContext) -> Self {
        ConvForward {
            params,
            ctx,
            flags: FunctionFlags::leafless(),
        }
    }

    pub fn params(&self) -> &ConvParams {
        &self.params
    }

    pub fn output_size(&self, input: &[usize], weight: &[usize]) -> Result<Vec<usize>> {
        self.params.output_size(input, weight)
    }
}

fn required<E: FloatElement>(inputs: &[Option<Variable<E>>], index: usize, what: &str) -> Result<Variable<E>> {
    inputs
        .get(index)
        .cloned()
        .flatten()
        .ok_or_else(|| Error::msg(format!("ConvForward: missing {what}")))
}

impl<E: FloatElement> Function<E> for ConvForward<E> {
    fn name(&self) -> &'static str {
        "ConvForward"
    }

    fn flags(&self) -> &FunctionFlags<E> {
        &self.flags
    }

    fn num_inputs(&self) -> usize {
        3
    }

    fn apply(&self, inputs: &[Option<Variable<E>>]) -> Result<Vec<Option<Variable<E>>>> {
        let input = required(inputs, 0, "input")?;
        let weight = required(inputs, 1, "weight")?;
        let bias = inputs.get(2).cloned().flatten();

        self.params.validate()?;
        self.params
            .check_input_shape(input.dims(), weight.dims(), bias.as_ref().map(|b| b.dims()))?;

        let prep = Promotion::new(&self.params);
        let mut state = prep.select(&self.ctx, input.data(), weight.data())?;
        let out = state.output(
            &prep.params,
            &prep.promote(input.data())?,
            &prep.promote(weight.data())?,
        )?;
        if let Some(b) = &bias {
            state.add_bias(&out, b.data())?;
        }
        let out = prep.demote(out)?;

        let flags = FunctionFlags::from_inputs(&[Some(&input), Some(&weight), bias.as_ref()]);
        let result = if flags.is_executable {
            let shape = out.shape().clone();
            let node: Arc<dyn Function<E>> = Arc::new(ConvBackward::new(
                flags,
                self.params.clone(),
                self.ctx.clone(),
                &input,
                &weight,
                bias.as_ref(),
                state,
                shape,
            ));
            Variable::from_function(out, node, 0)
        } else {
            Variable::constant(out)
        };
        Ok(vec![Some(result)])
    }
}

impl<E: FloatElement> Symbolic for ConvForward<E> {
    fn symbolic(&self, ctx: &mut SymbolicContext, inputs: &[ValueId]) -> Result<Vec<ValueId>> {
        if inputs.len() < 2 {
            return Err(Error::msg(format!(
                "symbolic Conv: expected input and weight, got {} values",
                inputs.len()
            )));
        }
        let weight = ctx.require_shape(inputs[1], "Conv")?.to_vec();
        let out_shape = ctx
            .shape(inputs[0])
            .and_then(|input| self.params.output_size(input, &weight).ok());

        let p = &self.params;
        let mut attributes = vec![
            (
                "kernel".to_string(),
                AttributeValue::Ints(weight[2..].iter().map(|&k| k as i64).collect()),
            ),
            ("stride".to_string(), AttributeValue::Ints(p.stride.clone())),
            ("padding".to_string(), AttributeValue::Ints(p.padding.clone())),
            ("dilation".to_string(), AttributeValue::Ints(p.dilation.clone())),
            ("groups".to_string(), AttributeValue::Int(p.groups)),
            ("transposed".to_string(), AttributeValue::Int(p.transposed as i64)),
        ];
        if p.transposed {
            attributes.push((
                "output_padding".to_string(),
                AttributeValue::Ints(p.output_padding.clone()),
            ));
        }

        let output = ctx.value(out_shape);
        ctx.push(IrNode {
            kind: if p.transposed { "ConvTranspose" } else { "Conv" }.to_string(),
            inputs: inputs.to_vec(),
            outputs: vec![output],
            attributes,
        });
        Ok(vec![output])
    }
}

/// Convolution of `input` with `weight` (plus `bias`), using the
/// process-wide [`BackendContext`].
pub fn conv<E: FloatElement>(
    input: &Variable<E>,
    weight: &Variable<E>,
    bias: Option<&Variable<E>>,
    params: &ConvParams,
) -> Result<Variable<E>> {
    conv_with_context(input, weight, bias, params, &BackendContext::global())
}

pub fn conv_with_context<E: FloatElement>(
    input: &Variable<E>,
    weight: &Variable<E>,
    bias: Option<&Variable<E>>,
    params: &ConvParams,
    ctx: &BackendContext,
) -> Result<Variable<E>> {
    let f = ConvForward::with_context(params.clone(), ctx.clone());
    let outputs = f.apply(&[Some(input.clone()), Some(weight.clone()), bias.cloned()])?;
    outputs
        .into_iter()
        .next()
        .flatten()
        .ok_or_else(|| Error::msg("ConvForward produced no output"))
}

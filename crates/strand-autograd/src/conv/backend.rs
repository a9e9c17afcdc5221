// Backend selection and dispatch
//
// A convolution picks its kernels once, in forward, and the backward node
// keeps the choice (with whatever state it carries: GEMM scratch, the
// vendor handle and its algorithm picks) so that every gradient is computed
// on the same path.
//
// Selection, first match wins:
//
//   use_cudnn     -> Vendor           registered accelerator, device input
//   is_depthwise  -> Depthwise        one filter per channel
//   use_mkldnn    -> HostAccelerated  batch-parallel unfolded GEMM
//   use_nnpack    -> Nnpack           direct spatial loops
//   otherwise     -> Gemm             vol2col + GEMM, bias through `ones`
//
// The tensor-level entry points take operands in regular or transposed
// convolution roles and map them onto the three primitives:
//
//                 regular                    transposed
//   output        forward(x, W)              backward_image(x, W)
//   grad input    backward_image(gy, W)      forward(gy, W)
//   grad weight   backward_weight(x, gy)     backward_weight(gy, x)

use std::fmt;
use std::sync::Arc;

use log::debug;
use strand_core::{ops, try_vec, DType, Error, FloatElement, Result, Tensor};

use crate::context::BackendContext;

use super::geometry::ConvGeometry;
use super::kernels::GemmBuffers;
use super::params::ConvParams;
use super::vendor::VendorState;
use super::{depthwise, direct, host};

/// Which family of kernels runs a convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConvBackend {
    Vendor,
    Depthwise,
    HostAccelerated,
    Nnpack,
    Gemm,
}

impl fmt::Display for ConvBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConvBackend::Vendor => "vendor",
            ConvBackend::Depthwise => "depthwise",
            ConvBackend::HostAccelerated => "host-accelerated",
            ConvBackend::Nnpack => "nnpack",
            ConvBackend::Gemm => "gemm",
        };
        f.write_str(name)
    }
}

/// Kernels chosen for one convolution, plus their scratch.
#[derive(Debug)]
pub enum BackendState<E: FloatElement> {
    Vendor(VendorState),
    Depthwise,
    HostAccelerated,
    Nnpack,
    Gemm(GemmBuffers<E>),
}

/// Geometry of the regular convolution behind `params` mapping a tensor of
/// shape `input` to one of shape `output`.
pub(crate) fn role_geometry(
    params: &ConvParams,
    input: &[usize],
    weight: &[usize],
    output: &[usize],
    dtype: DType,
) -> ConvGeometry {
    if params.transposed {
        ConvGeometry::new(params, output, weight, input, dtype)
    } else {
        ConvGeometry::new(params, input, weight, output, dtype)
    }
}

/// Zero-filled buffer for a tensor of shape `dims`, failing cleanly when the
/// element count overflows or the allocator refuses it.
fn zeros<E: FloatElement>(dims: &[usize]) -> Result<Vec<E>> {
    let len = dims
        .iter()
        .try_fold(1usize, |n, &d| n.checked_mul(d))
        .ok_or(Error::AllocationFailed { bytes: usize::MAX })?;
    try_vec(len, E::zero())
}

impl<E: FloatElement> BackendState<E> {
    /// Choose kernels for `params` applied to `input` and `weight`
    /// (spatial rank already promoted to 2 or 3).
    pub fn select(
        params: &ConvParams,
        ctx: &BackendContext,
        input: &Tensor<E>,
        weight: &Tensor<E>,
    ) -> Result<Self> {
        let device = input.device();
        if weight.device() != device {
            return Err(Error::msg(format!(
                "convolution input is on {device} but weight is on {}",
                weight.device()
            )));
        }
        let output = params.output_size(input.dims(), weight.dims())?;
        let geometry = role_geometry(params, input.dims(), weight.dims(), &output, E::DTYPE);

        let vendor = ctx
            .accelerator()
            .filter(|acc| params.use_cudnn(device, Some(Arc::as_ref(acc)), &geometry));
        let state = if let Some(acc) = vendor {
            BackendState::Vendor(VendorState::new(
                acc.clone(),
                ctx.algorithm_cache().clone(),
                params.benchmark,
                params.deterministic,
            ))
        } else if !device.is_cpu() {
            return Err(Error::UnsupportedDevice {
                op: "convolution",
                device: device.to_string(),
            });
        } else if params.is_depthwise(input.dims(), weight.dims()) {
            BackendState::Depthwise
        } else if params.use_mkldnn(ctx, E::DTYPE, device) {
            BackendState::HostAccelerated
        } else if params.use_nnpack(ctx, E::DTYPE, device, input.dims()) {
            BackendState::Nnpack
        } else {
            BackendState::Gemm(GemmBuffers::default())
        };
        debug!(
            "conv: {} for input {:?}, weight {:?}, transposed={}, groups={}",
            state.backend(),
            input.dims(),
            weight.dims(),
            params.transposed,
            params.groups
        );
        Ok(state)
    }

    pub fn backend(&self) -> ConvBackend {
        match self {
            BackendState::Vendor(_) => ConvBackend::Vendor,
            BackendState::Depthwise => ConvBackend::Depthwise,
            BackendState::HostAccelerated => ConvBackend::HostAccelerated,
            BackendState::Nnpack => ConvBackend::Nnpack,
            BackendState::Gemm(_) => ConvBackend::Gemm,
        }
    }

    fn forward(&mut self, g: &ConvGeometry, image: &[E], weight: &[E], out: &mut [E]) -> Result<()> {
        match self {
            BackendState::Vendor(v) => return v.forward(g, image, weight, out),
            BackendState::Depthwise => depthwise::forward(g, image, weight, out),
            BackendState::HostAccelerated => host::forward(g, image, weight, out)?,
            BackendState::Nnpack => direct::forward(g, image, weight, out),
            BackendState::Gemm(b) => b.forward(g, image, weight, out)?,
        }
        Ok(())
    }

    fn backward_image(&mut self, g: &ConvGeometry, grad_out: &[E], weight: &[E], grad_image: &mut [E]) -> Result<()> {
        match self {
            BackendState::Vendor(v) => return v.backward_input(g, grad_out, weight, grad_image),
            BackendState::Depthwise => depthwise::backward_image(g, grad_out, weight, grad_image),
            BackendState::HostAccelerated => host::backward_image(g, grad_out, weight, grad_image)?,
            BackendState::Nnpack => direct::backward_image(g, grad_out, weight, grad_image),
            BackendState::Gemm(b) => b.backward_image(g, grad_out, weight, grad_image)?,
        }
        Ok(())
    }

    fn backward_weight(&mut self, g: &ConvGeometry, image: &[E], grad_out: &[E], grad_weight: &mut [E]) -> Result<()> {
        match self {
            BackendState::Vendor(v) => return v.backward_weight(g, image, grad_out, grad_weight),
            BackendState::Depthwise => depthwise::backward_weight(g, image, grad_out, grad_weight),
            BackendState::HostAccelerated => host::backward_weight(g, image, grad_out, grad_weight)?,
            BackendState::Nnpack => direct::backward_weight(g, image, grad_out, grad_weight),
            BackendState::Gemm(b) => b.backward_weight(g, image, grad_out, grad_weight)?,
        }
        Ok(())
    }

    /// Convolution of `x` with `w`, without bias.
    pub fn output(&mut self, params: &ConvParams, x: &Tensor<E>, w: &Tensor<E>) -> Result<Tensor<E>> {
        let out_shape = params.output_size(x.dims(), w.dims())?;
        let g = role_geometry(params, x.dims(), w.dims(), &out_shape, E::DTYPE);
        let (xs, ws) = (x.to_vec()?, w.to_vec()?);
        let mut y = zeros(&out_shape)?;
        if params.transposed {
            self.backward_image(&g, &xs, &ws, &mut y)?;
        } else {
            self.forward(&g, &xs, &ws, &mut y)?;
        }
        Tensor::from_vec_on(y, out_shape, x.device())
    }

    /// Gradient w.r.t. an input of shape `input_shape`, given the output
    /// gradient `gy`.
    pub fn grad_input(
        &mut self,
        params: &ConvParams,
        gy: &Tensor<E>,
        w: &Tensor<E>,
        input_shape: &[usize],
    ) -> Result<Tensor<E>> {
        let g = role_geometry(params, input_shape, w.dims(), gy.dims(), E::DTYPE);
        let (gys, ws) = (gy.to_vec()?, w.to_vec()?);
        let mut gx = zeros(input_shape)?;
        if params.transposed {
            self.forward(&g, &gys, &ws, &mut gx)?;
        } else {
            self.backward_image(&g, &gys, &ws, &mut gx)?;
        }
        Tensor::from_vec_on(gx, input_shape, gy.device())
    }

    /// Gradient w.r.t. a weight of shape `weight_shape`.
    pub fn grad_weight(
        &mut self,
        params: &ConvParams,
        x: &Tensor<E>,
        gy: &Tensor<E>,
        weight_shape: &[usize],
    ) -> Result<Tensor<E>> {
        let g = role_geometry(params, x.dims(), weight_shape, gy.dims(), E::DTYPE);
        let (xs, gys) = (x.to_vec()?, gy.to_vec()?);
        let mut gw = zeros(weight_shape)?;
        if params.transposed {
            self.backward_weight(&g, &gys, &xs, &mut gw)?;
        } else {
            self.backward_weight(&g, &xs, &gys, &mut gw)?;
        }
        Tensor::from_vec_on(gw, weight_shape, gy.device())
    }

    /// out[n, c, ...] += bias[c]
    pub fn add_bias(&mut self, out: &Tensor<E>, bias: &Tensor<E>) -> Result<()> {
        match self {
            BackendState::Gemm(buffers) => {
                if out.rank() < 2 {
                    return Err(Error::RankMismatch {
                        expected: 2,
                        got: out.rank(),
                    });
                }
                let plane: usize = out.dims()[2..].iter().product();
                let data = buffers.bias_plane(&bias.to_vec()?, plane)?;
                let mut dims = out.dims().to_vec();
                dims[0] = 1;
                let plane = Tensor::from_vec_on(data, dims, out.device())?;
                ops::add_(out, &plane.expand(out.shape().clone())?, E::one())
            }
            _ => ops::add_channel_bias_(out, bias),
        }
    }

    /// Per-channel sums of `gy`.
    pub fn grad_bias(&mut self, gy: &Tensor<E>) -> Result<Tensor<E>> {
        let channels = gy.size(1)?;
        let data = match self {
            BackendState::Gemm(buffers) => {
                let plane: usize = gy.dims()[2..].iter().product();
                buffers.bias_grad(&gy.to_vec()?, gy.dims()[0], channels, plane)?
            }
            _ => ops::sum_except_dim(gy, 1)?,
        };
        Tensor::from_vec_on(data, channels, gy.device())
    }
}

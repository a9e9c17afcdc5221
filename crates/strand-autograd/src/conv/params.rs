use strand_core::{DType, Device, Error, Result};

use crate::context::BackendContext;

use super::geometry::ConvGeometry;
use super::vendor::ConvAccelerator;

// ConvParams: everything about a convolution except its tensors
//
// Parameters are kept as i64 so that negative values can be represented and
// rejected with a precise error rather than wrapping around.
//
// Spatial vectors (stride, padding, dilation, output_padding) all have one
// entry per spatial dimension: 1 (temporal), 2 (images) or 3 (volumes).
// One-dimensional convolutions are promoted to two dimensions with
// `view1d_as_2d` before any kernel runs.
//
// The backend predicates below are evaluated in a fixed order by
// `BackendState::select`; the first one that holds picks the kernel.

/// NNPACK-style direct kernels only pay off for reasonably large batches.
pub const NNPACK_MIN_BATCH: usize = 16;

/// Convolution parameters plus the backend flags captured at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvParams {
    pub stride: Vec<i64>,
    pub padding: Vec<i64>,
    pub dilation: Vec<i64>,
    pub transposed: bool,
    pub output_padding: Vec<i64>,
    pub groups: i64,
    pub benchmark: bool,
    pub deterministic: bool,
    pub cudnn_enabled: bool,
}

impl ConvParams {
    /// Unit stride and dilation, no padding, one group, flags taken from the
    /// process-wide [`BackendContext`].
    pub fn new(spatial_dims: usize) -> Self {
        Self::from_context(&BackendContext::global(), spatial_dims)
    }

    /// Defaults with flags snapshotted from `ctx`.
    pub fn from_context(ctx: &BackendContext, spatial_dims: usize) -> Self {
        ConvParams {
            stride: vec![1; spatial_dims],
            padding: vec![0; spatial_dims],
            dilation: vec![1; spatial_dims],
            transposed: false,
            output_padding: vec![0; spatial_dims],
            groups: 1,
            benchmark: ctx.benchmark,
            deterministic: ctx.deterministic,
            cudnn_enabled: ctx.cudnn_enabled,
        }
    }

    pub fn with_stride(mut self, stride: &[i64]) -> Self {
        self.stride = stride.to_vec();
        self
    }

    pub fn with_padding(mut self, padding: &[i64]) -> Self {
        self.padding = padding.to_vec();
        self
    }

    pub fn with_dilation(mut self, dilation: &[i64]) -> Self {
        self.dilation = dilation.to_vec();
        self
    }

    pub fn with_output_padding(mut self, output_padding: &[i64]) -> Self {
        self.output_padding = output_padding.to_vec();
        self
    }

    pub fn with_transposed(mut self, transposed: bool) -> Self {
        self.transposed = transposed;
        self
    }

    pub fn with_groups(mut self, groups: i64) -> Self {
        self.groups = groups;
        self
    }

    pub fn with_benchmark(mut self, benchmark: bool) -> Self {
        self.benchmark = benchmark;
        self
    }

    pub fn with_deterministic(mut self, deterministic: bool) -> Self {
        self.deterministic = deterministic;
        self
    }

    pub fn with_cudnn_enabled(mut self, enabled: bool) -> Self {
        self.cudnn_enabled = enabled;
        self
    }

    pub fn spatial_dims(&self) -> usize {
        self.stride.len()
    }

    pub fn is_strided(&self) -> bool {
        self.stride.iter().any(|&s| s != 1)
    }

    pub fn is_dilated(&self) -> bool {
        self.dilation.iter().any(|&d| d != 1)
    }

    pub fn is_padded(&self) -> bool {
        self.padding.iter().any(|&p| p != 0)
    }

    pub fn is_output_padding_neg(&self) -> bool {
        self.output_padding.iter().any(|&p| p < 0)
    }

    /// Output padding must stay below the stride.
    pub fn is_output_padding_big(&self) -> bool {
        self.output_padding
            .iter()
            .zip(&self.stride)
            .any(|(&p, &s)| p >= s)
    }

    pub fn is_padding_neg(&self) -> bool {
        self.padding.iter().any(|&p| p < 0)
    }

    /// Turn a 1-D convolution into a 2-D one over a unit height.
    pub fn view1d_as_2d(&mut self) {
        if self.stride.len() == 1 {
            self.stride.insert(0, 1);
            self.padding.insert(0, 0);
            self.dilation.insert(0, 1);
            self.output_padding.insert(0, 0);
        }
    }

    /// Reject parameter combinations no backend accepts.
    pub fn validate(&self) -> Result<()> {
        let k = self.spatial_dims();
        if !(1..=3).contains(&k) {
            return Err(Error::InvalidConvConfig(format!(
                "expected 1, 2 or 3 spatial dimensions, got {k}"
            )));
        }
        for (name, v) in [
            ("padding", &self.padding),
            ("dilation", &self.dilation),
            ("output_padding", &self.output_padding),
        ] {
            if v.len() != k {
                return Err(Error::InvalidConvConfig(format!(
                    "{name} has {} entries but stride has {k}",
                    v.len()
                )));
            }
        }
        if self.is_padding_neg() {
            return Err(Error::InvalidConvConfig(format!(
                "negative padding is not supported: {:?}",
                self.padding
            )));
        }
        if self.is_output_padding_neg() {
            return Err(Error::InvalidConvConfig(format!(
                "negative output_padding is not supported: {:?}",
                self.output_padding
            )));
        }
        if !self.transposed && self.is_output_padding_big() {
            return Err(Error::InvalidConvConfig(format!(
                "output_padding {:?} must be smaller than stride {:?}",
                self.output_padding, self.stride
            )));
        }
        if self.stride.iter().any(|&s| s < 1) {
            return Err(Error::InvalidConvConfig(format!(
                "non-positive stride is not supported: {:?}",
                self.stride
            )));
        }
        if self.dilation.iter().any(|&d| d < 1) {
            return Err(Error::InvalidConvConfig(format!(
                "non-positive dilation is not supported: {:?}",
                self.dilation
            )));
        }
        if self.groups < 1 {
            return Err(Error::InvalidConvConfig(format!(
                "non-positive groups is not supported: {}",
                self.groups
            )));
        }
        Ok(())
    }

    /// Output channel count for a weight of the given shape.
    fn out_channels(&self, weight: &[usize]) -> usize {
        if self.transposed {
            weight[1] * self.groups as usize
        } else {
            weight[0]
        }
    }

    /// Check tensor shapes against the parameters: ranks, channel counts,
    /// group divisibility, bias length and kernel extent.
    pub fn check_input_shape(
        &self,
        input: &[usize],
        weight: &[usize],
        bias: Option<&[usize]>,
    ) -> Result<()> {
        let rank = self.spatial_dims() + 2;
        if input.len() != rank {
            return Err(Error::RankMismatch {
                expected: rank,
                got: input.len(),
            });
        }
        if weight.len() != rank {
            return Err(Error::RankMismatch {
                expected: rank,
                got: weight.len(),
            });
        }
        if weight.contains(&0) {
            return Err(Error::InvalidConvConfig(format!(
                "weight of size {weight:?} has an empty dimension"
            )));
        }
        let groups = self.groups as usize;
        if weight[0] % groups != 0 {
            return Err(Error::InvalidConvConfig(format!(
                "weight size {} along dimension 0 is not divisible by groups {groups}",
                weight[0]
            )));
        }
        if self.transposed {
            if input[1] != weight[0] {
                return Err(Error::InvalidConvConfig(format!(
                    "expected input with {} channels for weight of size {weight:?}, got {}",
                    weight[0], input[1]
                )));
            }
        } else if input[1] != weight[1] * groups {
            return Err(Error::InvalidConvConfig(format!(
                "expected input with {} channels ({groups} groups) for weight of size {weight:?}, got {}",
                weight[1] * groups,
                input[1]
            )));
        }
        if let Some(bias) = bias {
            let out_channels = self.out_channels(weight);
            if bias != [out_channels] {
                return Err(Error::InvalidConvConfig(format!(
                    "expected bias of size [{out_channels}], got {bias:?}"
                )));
            }
        }
        self.output_size(input, weight).map(|_| ())
    }

    /// Shape of the convolution output: `[N, C_out, spatial...]`.
    pub fn output_size(&self, input: &[usize], weight: &[usize]) -> Result<Vec<usize>> {
        let k = self.spatial_dims();
        if input.len() != k + 2 || weight.len() != k + 2 {
            return Err(Error::RankMismatch {
                expected: k + 2,
                got: input.len().min(weight.len()),
            });
        }
        let mut out = Vec::with_capacity(k + 2);
        out.push(input[0]);
        out.push(self.out_channels(weight));
        for d in 0..k {
            if weight[d + 2] == 0 {
                return Err(Error::InvalidConvConfig(format!(
                    "kernel size along spatial dimension {d} is zero"
                )));
            }
            let size = input[d + 2] as i64;
            let kernel = self.dilation[d] * (weight[d + 2] as i64 - 1) + 1;
            let o = if self.transposed {
                (size - 1) * self.stride[d] - 2 * self.padding[d] + kernel + self.output_padding[d]
            } else {
                let padded = size + 2 * self.padding[d];
                if padded < kernel {
                    return Err(Error::InvalidConvConfig(format!(
                        "kernel extent {kernel} exceeds padded input size {padded} in spatial dimension {d}"
                    )));
                }
                (padded - kernel) / self.stride[d] + 1
            };
            if o < 1 {
                return Err(Error::InvalidConvConfig(format!(
                    "output size {o} is too small in spatial dimension {d}"
                )));
            }
            out.push(o as usize);
        }
        Ok(out)
    }

    /// Vendor kernels: enabled, registered, device-resident input and a
    /// geometry the accelerator accepts.
    pub fn use_cudnn(
        &self,
        device: Device,
        accelerator: Option<&dyn ConvAccelerator>,
        geometry: &ConvGeometry,
    ) -> bool {
        self.cudnn_enabled
            && !device.is_cpu()
            && accelerator.is_some_and(|a| a.supports(geometry))
    }

    /// Batch-parallel host kernels: f32 on the host, plain grouping.
    pub fn use_mkldnn(&self, ctx: &BackendContext, dtype: DType, device: Device) -> bool {
        ctx.mkldnn_enabled
            && device.is_cpu()
            && dtype == DType::F32
            && !self.transposed
            && !self.is_dilated()
            && self.groups == 1
    }

    /// Direct spatial kernels: 2-D, f32 on the host, unit stride and
    /// dilation, one group, large enough batch.
    pub fn use_nnpack(&self, ctx: &BackendContext, dtype: DType, device: Device, input: &[usize]) -> bool {
        ctx.nnpack_enabled
            && device.is_cpu()
            && dtype == DType::F32
            && !self.is_strided()
            && !self.is_dilated()
            && !self.transposed
            && input.len() == 4
            && self.groups == 1
            && input[0] >= NNPACK_MIN_BATCH
    }

    /// One filter per channel on 2-D inputs.
    pub fn is_depthwise(&self, input: &[usize], weight: &[usize]) -> bool {
        !self.transposed
            && input.len() == 4
            && self.groups > 1
            && input[1] == self.groups as usize
            && weight[0] == input[1]
    }
}

use strand_core::DType;

use super::params::ConvParams;

// ConvGeometry: a convolution reduced to plain sizes
//
// Kernels never see ConvParams or tensors. They see a geometry expressed in
// terms of an ordinary (non-transposed) convolution:
//
//   image [N, C_img, D, H, W]  --conv with weight [C_out, C_img/G, kD, kH, kW]-->  out [N, C_out, oD, oH, oW]
//
// A transposed convolution is the adjoint of that map, so it is described by
// the same geometry with the roles swapped: the transposed convolution's
// output is the image, its input is `out`.
//
// Fewer than three spatial dimensions are padded at the front with unit
// extent, unit kernel, unit stride, no padding and unit dilation.

/// Sizes of one convolution in regular-convolution terms.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConvGeometry {
    pub batch: usize,
    pub groups: usize,
    pub image_channels: usize,
    pub out_channels: usize,
    pub image: [usize; 3],
    pub out: [usize; 3],
    pub kernel: [usize; 3],
    pub stride: [usize; 3],
    pub padding: [usize; 3],
    pub dilation: [usize; 3],
    /// Spatial rank before padding to three.
    pub spatial_dims: usize,
    pub dtype: DType,
}

fn pad3(v: &[usize], fill: usize) -> [usize; 3] {
    let mut out = [fill; 3];
    let skip = 3 - v.len().min(3);
    for (o, &x) in out[skip..].iter_mut().zip(v) {
        *o = x;
    }
    out
}

fn pad3_i64(v: &[i64], fill: usize) -> [usize; 3] {
    let v: Vec<usize> = v.iter().map(|&x| x.max(0) as usize).collect();
    pad3(&v, fill)
}

impl ConvGeometry {
    /// Geometry from full `[N, C, spatial...]` shapes of the image and the
    /// output of the equivalent regular convolution.
    ///
    /// `params` must already be validated.
    pub fn new(params: &ConvParams, image: &[usize], weight: &[usize], out: &[usize], dtype: DType) -> Self {
        ConvGeometry {
            batch: image[0],
            groups: params.groups.max(1) as usize,
            image_channels: image[1],
            out_channels: out[1],
            image: pad3(&image[2..], 1),
            out: pad3(&out[2..], 1),
            kernel: pad3(&weight[2..], 1),
            stride: pad3_i64(&params.stride, 1),
            padding: pad3_i64(&params.padding, 0),
            dilation: pad3_i64(&params.dilation, 1),
            spatial_dims: image.len() - 2,
            dtype,
        }
    }

    pub fn image_plane(&self) -> usize {
        self.image.iter().product()
    }

    pub fn out_plane(&self) -> usize {
        self.out.iter().product()
    }

    pub fn kernel_volume(&self) -> usize {
        self.kernel.iter().product()
    }

    /// Image channels per group.
    pub fn group_in(&self) -> usize {
        self.image_channels / self.groups
    }

    /// Output channels per group.
    pub fn group_out(&self) -> usize {
        self.out_channels / self.groups
    }

    /// Rows of the unfolded image of one group.
    pub fn col_rows(&self) -> usize {
        self.group_in() * self.kernel_volume()
    }

    pub fn image_len(&self) -> usize {
        self.batch * self.image_channels * self.image_plane()
    }

    pub fn out_len(&self) -> usize {
        self.batch * self.out_channels * self.out_plane()
    }

    pub fn weight_len(&self) -> usize {
        self.out_channels * self.col_rows()
    }

    /// Image coordinate read by output position `o` through kernel tap `k`
    /// along spatial axis `axis`, or None when it falls in the padding.
    #[inline]
    pub fn source(&self, axis: usize, o: usize, k: usize) -> Option<usize> {
        let pos = (o * self.stride[axis] + k * self.dilation[axis]) as isize - self.padding[axis] as isize;
        if pos >= 0 && (pos as usize) < self.image[axis] {
            Some(pos as usize)
        } else {
            None
        }
    }
}

// Batch-parallel host kernels (MKLDNN-style)
//
// Same unfold-and-multiply scheme as the GEMM backend, but samples are
// spread over the rayon pool, each worker with its own columns buffer.
// The weight gradient is a sum over samples; per-sample partials are
// collected and then added in sample order so the result does not depend on
// how rayon split the work.

use rayon::prelude::*;
use strand_core::{try_vec, Error, FloatElement, Result};

use super::geometry::ConvGeometry;
use super::kernels::{backward_image_sample, backward_weight_sample, forward_sample};

fn columns_len(g: &ConvGeometry) -> usize {
    g.col_rows() * g.out_plane()
}

/// Per-worker columns buffer; `None` when the allocator refused it.
fn columns<E: FloatElement>(g: &ConvGeometry) -> Option<Vec<E>> {
    try_vec(columns_len(g), E::zero()).ok()
}

fn columns_of<'a, E: FloatElement>(
    g: &ConvGeometry,
    cols: &'a mut Option<Vec<E>>,
) -> Result<&'a mut [E]> {
    cols.as_deref_mut().ok_or_else(|| Error::AllocationFailed {
        bytes: columns_len(g).saturating_mul(std::mem::size_of::<E>()),
    })
}

pub(crate) fn forward<E: FloatElement>(
    g: &ConvGeometry,
    image: &[E],
    weight: &[E],
    out: &mut [E],
) -> Result<()> {
    let (img_n, out_n) = (g.image_channels * g.image_plane(), g.out_channels * g.out_plane());
    out.par_chunks_mut(out_n.max(1))
        .enumerate()
        .try_for_each_init(
            || columns(g),
            |cols, (n, o)| -> Result<()> {
                let cols = columns_of(g, cols)?;
                forward_sample(g, &image[n * img_n..(n + 1) * img_n], weight, o, cols);
                Ok(())
            },
        )
}

pub(crate) fn backward_image<E: FloatElement>(
    g: &ConvGeometry,
    grad_out: &[E],
    weight: &[E],
    grad_image: &mut [E],
) -> Result<()> {
    let (img_n, out_n) = (g.image_channels * g.image_plane(), g.out_channels * g.out_plane());
    grad_image
        .par_chunks_mut(img_n.max(1))
        .enumerate()
        .try_for_each_init(
            || columns(g),
            |cols, (n, gi)| -> Result<()> {
                let cols = columns_of(g, cols)?;
                backward_image_sample(g, &grad_out[n * out_n..(n + 1) * out_n], weight, gi, cols);
                Ok(())
            },
        )
}

pub(crate) fn backward_weight<E: FloatElement>(
    g: &ConvGeometry,
    image: &[E],
    grad_out: &[E],
    grad_weight: &mut [E],
) -> Result<()> {
    let (img_n, out_n) = (g.image_channels * g.image_plane(), g.out_channels * g.out_plane());
    let partials = (0..g.batch)
        .into_par_iter()
        .map_init(
            || columns(g),
            |cols, n| -> Result<Vec<E>> {
                let cols = columns_of(g, cols)?;
                let mut gw = try_vec(g.weight_len(), E::zero())?;
                backward_weight_sample(
                    g,
                    &image[n * img_n..(n + 1) * img_n],
                    &grad_out[n * out_n..(n + 1) * out_n],
                    &mut gw,
                    cols,
                );
                Ok(gw)
            },
        )
        .collect::<Result<Vec<Vec<E>>>>()?;
    for partial in partials {
        for (dst, v) in grad_weight.iter_mut().zip(partial) {
            *dst = *dst + v;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::BackendContext;
    use crate::conv::kernels::GemmBuffers;
    use crate::conv::params::ConvParams;
    use strand_core::DType;

    #[test]
    fn test_matches_gemm_and_is_repeatable() {
        let p = ConvParams::from_context(&BackendContext::default(), 2)
            .with_stride(&[2, 2])
            .with_padding(&[1, 1]);
        let (image, weight) = ([5usize, 3, 6, 6], [2usize, 3, 3, 3]);
        let out = p.output_size(&image, &weight).unwrap();
        let g = ConvGeometry::new(&p, &image, &weight, &out, DType::F32);

        let x: Vec<f32> = (0..g.image_len()).map(|i| (i as f32 * 0.7).sin()).collect();
        let w: Vec<f32> = (0..g.weight_len()).map(|i| (i as f32 * 0.3).cos()).collect();
        let gy: Vec<f32> = (0..g.out_len()).map(|i| (i as f32 * 0.5).sin()).collect();

        let mut gemm = GemmBuffers::default();
        let (mut y0, mut y1) = (vec![0.0; g.out_len()], vec![0.0; g.out_len()]);
        gemm.forward(&g, &x, &w, &mut y0).unwrap();
        forward(&g, &x, &w, &mut y1).unwrap();
        for (a, b) in y0.iter().zip(&y1) {
            assert!((a - b).abs() < 1e-5);
        }

        let (mut gx0, mut gx1) = (vec![0.0; g.image_len()], vec![0.0; g.image_len()]);
        gemm.backward_image(&g, &gy, &w, &mut gx0).unwrap();
        backward_image(&g, &gy, &w, &mut gx1).unwrap();
        for (a, b) in gx0.iter().zip(&gx1) {
            assert!((a - b).abs() < 1e-5);
        }

        let mut gw1 = vec![0.0; g.weight_len()];
        let mut gw2 = vec![0.0; g.weight_len()];
        backward_weight(&g, &x, &gy, &mut gw1).unwrap();
        backward_weight(&g, &x, &gy, &mut gw2).unwrap();
        assert_eq!(gw1, gw2);
        let mut gw0 = vec![0.0; g.weight_len()];
        gemm.backward_weight(&g, &x, &gy, &mut gw0).unwrap();
        for (a, b) in gw0.iter().zip(&gw1) {
            assert!((a - b).abs() < 1e-4);
        }
    }
}

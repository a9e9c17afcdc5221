// Unfolded convolution kernels (vol2col + GEMM)
//
// The generic host path turns a convolution into a matrix product:
//
//   vol2col unfolds one group of one sample into columns
//     [C_in/G * kD * kH * kW, oD * oH * oW]
//   where each row is one kernel tap of one input channel and each column one
//   output position. Then
//
//     forward:          out_g     += W_g        × columns
//     backward image:   columns    = W_gᵀ       × gO_g      then col2vol
//     backward weight:  gW_g      += gO_g       × columnsᵀ
//
// col2vol is the adjoint of vol2col: it scatters columns back into an
// image-shaped buffer, accumulating overlapping taps.
//
// Bias goes through the same GEMM with a `ones` vector:
//
//   plane[C, L] = bias[C, 1] × ones[1, L]        (added to every sample)
//   gB[C, 1]   += gO_n[C, L] × ones[L, 1]        (for every sample n)
//
// Every primitive accumulates into its output buffer.

use strand_core::{try_vec, FloatElement, Result};

use super::geometry::ConvGeometry;

/// Unfold the image of one group of one sample.
///
/// image: `[C_in/G, D, H, W]`, columns: `[col_rows, out_plane]`
pub(crate) fn vol2col<E: FloatElement>(g: &ConvGeometry, image: &[E], columns: &mut [E]) {
    let [id, ih, iw] = g.image;
    let [kd, kh, kw] = g.kernel;
    let [od, oh, ow] = g.out;
    let plane = g.out_plane();
    for c in 0..g.group_in() {
        for a in 0..kd {
            for b in 0..kh {
                for e in 0..kw {
                    let row = ((c * kd + a) * kh + b) * kw + e;
                    let dst = &mut columns[row * plane..(row + 1) * plane];
                    for z in 0..od {
                        let sz = g.source(0, z, a);
                        for y in 0..oh {
                            let sy = g.source(1, y, b);
                            for x in 0..ow {
                                let col = (z * oh + y) * ow + x;
                                dst[col] = match (sz, sy, g.source(2, x, e)) {
                                    (Some(pz), Some(py), Some(px)) => {
                                        image[((c * id + pz) * ih + py) * iw + px]
                                    }
                                    _ => E::zero(),
                                };
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Scatter columns back into the image of one group of one sample.
pub(crate) fn col2vol<E: FloatElement>(g: &ConvGeometry, columns: &[E], image: &mut [E]) {
    let [id, ih, iw] = g.image;
    let [kd, kh, kw] = g.kernel;
    let [od, oh, ow] = g.out;
    let plane = g.out_plane();
    for c in 0..g.group_in() {
        for a in 0..kd {
            for b in 0..kh {
                for e in 0..kw {
                    let row = ((c * kd + a) * kh + b) * kw + e;
                    let src = &columns[row * plane..(row + 1) * plane];
                    for z in 0..od {
                        let Some(pz) = g.source(0, z, a) else { continue };
                        for y in 0..oh {
                            let Some(py) = g.source(1, y, b) else { continue };
                            for x in 0..ow {
                                if let Some(px) = g.source(2, x, e) {
                                    let dst = &mut image[((c * id + pz) * ih + py) * iw + px];
                                    *dst = *dst + src[(z * oh + y) * ow + x];
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}

/// C += A × B
///
/// A: [m, k], B: [k, n], C: [m, n], all row-major.
#[inline]
pub(crate) fn gemm<E: FloatElement>(a: &[E], b: &[E], c: &mut [E], m: usize, n: usize, k: usize) {
    for i in 0..m {
        let a_row = i * k;
        let c_row = i * n;
        for p in 0..k {
            let a_val = a[a_row + p];
            let b_row = p * n;
            for j in 0..n {
                c[c_row + j] = c[c_row + j] + a_val * b[b_row + j];
            }
        }
    }
}

/// C += Aᵀ × B
///
/// A: [k, m], B: [k, n], C: [m, n]
#[inline]
pub(crate) fn gemm_at_b<E: FloatElement>(a: &[E], b: &[E], c: &mut [E], m: usize, n: usize, k: usize) {
    for i in 0..m {
        let c_row = i * n;
        for p in 0..k {
            let a_val = a[p * m + i];
            let b_row = p * n;
            for j in 0..n {
                c[c_row + j] = c[c_row + j] + a_val * b[b_row + j];
            }
        }
    }
}

/// C += A × Bᵀ
///
/// A: [m, k], B: [n, k], C: [m, n]
#[inline]
pub(crate) fn gemm_a_bt<E: FloatElement>(a: &[E], b: &[E], c: &mut [E], m: usize, n: usize, k: usize) {
    for i in 0..m {
        let a_row = i * k;
        let c_row = i * n;
        for j in 0..n {
            let b_row = j * k;
            let mut val = E::zero();
            for p in 0..k {
                val = val + a[a_row + p] * b[b_row + p];
            }
            c[c_row + j] = c[c_row + j] + val;
        }
    }
}

// SAMPLE-LEVEL PRIMITIVES
//
// One sample, all groups. The batch loop lives in the callers so the host
// backend can spread samples over threads while the GEMM backend reuses a
// single columns buffer.

/// out_n += conv(image_n, weight)
pub(crate) fn forward_sample<E: FloatElement>(
    g: &ConvGeometry,
    image: &[E],
    weight: &[E],
    out: &mut [E],
    columns: &mut [E],
) {
    let (gi, go, rows, plane) = (g.group_in(), g.group_out(), g.col_rows(), g.out_plane());
    let image_plane = g.image_plane();
    for grp in 0..g.groups {
        let img = &image[grp * gi * image_plane..(grp + 1) * gi * image_plane];
        vol2col(g, img, columns);
        let w = &weight[grp * go * rows..(grp + 1) * go * rows];
        let o = &mut out[grp * go * plane..(grp + 1) * go * plane];
        gemm(w, columns, o, go, plane, rows);
    }
}

/// grad_image_n += adjoint w.r.t. the image
pub(crate) fn backward_image_sample<E: FloatElement>(
    g: &ConvGeometry,
    grad_out: &[E],
    weight: &[E],
    grad_image: &mut [E],
    columns: &mut [E],
) {
    let (gi, go, rows, plane) = (g.group_in(), g.group_out(), g.col_rows(), g.out_plane());
    let image_plane = g.image_plane();
    for grp in 0..g.groups {
        columns.iter_mut().for_each(|c| *c = E::zero());
        let w = &weight[grp * go * rows..(grp + 1) * go * rows];
        let go_g = &grad_out[grp * go * plane..(grp + 1) * go * plane];
        gemm_at_b(w, go_g, columns, rows, plane, go);
        let img = &mut grad_image[grp * gi * image_plane..(grp + 1) * gi * image_plane];
        col2vol(g, columns, img);
    }
}

/// grad_weight += adjoint w.r.t. the weight, for one sample
pub(crate) fn backward_weight_sample<E: FloatElement>(
    g: &ConvGeometry,
    image: &[E],
    grad_out: &[E],
    grad_weight: &mut [E],
    columns: &mut [E],
) {
    let (gi, go, rows, plane) = (g.group_in(), g.group_out(), g.col_rows(), g.out_plane());
    let image_plane = g.image_plane();
    for grp in 0..g.groups {
        let img = &image[grp * gi * image_plane..(grp + 1) * gi * image_plane];
        vol2col(g, img, columns);
        let go_g = &grad_out[grp * go * plane..(grp + 1) * go * plane];
        let gw = &mut grad_weight[grp * go * rows..(grp + 1) * go * rows];
        gemm_a_bt(go_g, columns, gw, go, rows, plane);
    }
}

// GEMM BACKEND

/// Scratch kept between forward and backward by the GEMM backend.
#[derive(Debug)]
pub struct GemmBuffers<E: FloatElement> {
    columns: Vec<E>,
    ones: Vec<E>,
}

impl<E: FloatElement> Default for GemmBuffers<E> {
    fn default() -> Self {
        GemmBuffers {
            columns: Vec::new(),
            ones: Vec::new(),
        }
    }
}

impl<E: FloatElement> GemmBuffers<E> {
    fn columns_for(&mut self, g: &ConvGeometry) -> Result<&mut [E]> {
        let len = g.col_rows() * g.out_plane();
        if self.columns.len() != len {
            // release the old buffer before asking for the new one
            self.columns = Vec::new();
            self.columns = try_vec(len, E::zero())?;
        }
        Ok(&mut self.columns)
    }

    fn ones_for(&mut self, len: usize) -> Result<&[E]> {
        if self.ones.len() != len {
            self.ones = Vec::new();
            self.ones = try_vec(len, E::one())?;
        }
        Ok(&self.ones)
    }

    pub fn forward(&mut self, g: &ConvGeometry, image: &[E], weight: &[E], out: &mut [E]) -> Result<()> {
        let (img_n, out_n) = (g.image_channels * g.image_plane(), g.out_channels * g.out_plane());
        let columns = self.columns_for(g)?;
        for n in 0..g.batch {
            forward_sample(
                g,
                &image[n * img_n..(n + 1) * img_n],
                weight,
                &mut out[n * out_n..(n + 1) * out_n],
                columns,
            );
        }
        Ok(())
    }

    pub fn backward_image(
        &mut self,
        g: &ConvGeometry,
        grad_out: &[E],
        weight: &[E],
        grad_image: &mut [E],
    ) -> Result<()> {
        let (img_n, out_n) = (g.image_channels * g.image_plane(), g.out_channels * g.out_plane());
        let columns = self.columns_for(g)?;
        for n in 0..g.batch {
            backward_image_sample(
                g,
                &grad_out[n * out_n..(n + 1) * out_n],
                weight,
                &mut grad_image[n * img_n..(n + 1) * img_n],
                columns,
            );
        }
        Ok(())
    }

    pub fn backward_weight(
        &mut self,
        g: &ConvGeometry,
        image: &[E],
        grad_out: &[E],
        grad_weight: &mut [E],
    ) -> Result<()> {
        let (img_n, out_n) = (g.image_channels * g.image_plane(), g.out_channels * g.out_plane());
        let columns = self.columns_for(g)?;
        for n in 0..g.batch {
            backward_weight_sample(
                g,
                &image[n * img_n..(n + 1) * img_n],
                &grad_out[n * out_n..(n + 1) * out_n],
                grad_weight,
                columns,
            );
        }
        Ok(())
    }

    /// `[C, plane]` bias plane: bias × onesᵀ.
    pub fn bias_plane(&mut self, bias: &[E], plane: usize) -> Result<Vec<E>> {
        let mut out = try_vec(bias.len() * plane, E::zero())?;
        let ones = self.ones_for(plane)?;
        gemm(bias, ones, &mut out, bias.len(), plane, 1);
        Ok(out)
    }

    /// Per-channel sums of a dense `[N, C, plane]` gradient.
    pub fn bias_grad(
        &mut self,
        grad_out: &[E],
        batch: usize,
        channels: usize,
        plane: usize,
    ) -> Result<Vec<E>> {
        let mut gb = try_vec(channels, E::zero())?;
        let ones = self.ones_for(plane)?;
        for n in 0..batch {
            let go = &grad_out[n * channels * plane..(n + 1) * channels * plane];
            gemm(go, ones, &mut gb, channels, 1, plane);
        }
        Ok(gb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::BackendContext;
    use crate::conv::params::ConvParams;
    use strand_core::{DType, Error};

    fn geometry(image: &[usize], weight: &[usize], params: &ConvParams) -> ConvGeometry {
        let out = params.output_size(image, weight).unwrap();
        ConvGeometry::new(params, image, weight, &out, DType::F64)
    }

    #[test]
    fn test_vol2col_matches_im2col() {
        // one channel 3x3, kernel 2x2, stride 1, no padding
        let p = ConvParams::from_context(&BackendContext::default(), 2);
        let g = geometry(&[1, 1, 3, 3], &[1, 1, 2, 2], &p);
        let image: Vec<f64> = (1..=9).map(|v| v as f64).collect();
        let mut columns = vec![0.0; g.col_rows() * g.out_plane()];
        vol2col(&g, &image, &mut columns);
        assert_eq!(
            columns,
            vec![
                1.0, 2.0, 4.0, 5.0, // tap (0,0)
                2.0, 3.0, 5.0, 6.0, // tap (0,1)
                4.0, 5.0, 7.0, 8.0, // tap (1,0)
                5.0, 6.0, 8.0, 9.0, // tap (1,1)
            ]
        );
    }

    #[test]
    fn test_col2vol_is_adjoint() {
        // <vol2col(x), c> == <x, col2vol(c)> for a padded, strided, dilated 3-D case
        let p = ConvParams::from_context(&BackendContext::default(), 3)
            .with_stride(&[1, 2, 1])
            .with_padding(&[1, 0, 1])
            .with_dilation(&[1, 1, 2]);
        let g = geometry(&[1, 2, 3, 5, 4], &[1, 2, 2, 2, 2], &p);
        let x: Vec<f64> = (0..g.image_len()).map(|i| (i as f64 * 0.37).sin()).collect();
        let c: Vec<f64> = (0..g.col_rows() * g.out_plane())
            .map(|i| (i as f64 * 0.11).cos())
            .collect();
        let mut cols = vec![0.0; c.len()];
        vol2col(&g, &x, &mut cols);
        let lhs: f64 = cols.iter().zip(&c).map(|(a, b)| a * b).sum();
        let mut back = vec![0.0; x.len()];
        col2vol(&g, &c, &mut back);
        let rhs: f64 = x.iter().zip(&back).map(|(a, b)| a * b).sum();
        assert!((lhs - rhs).abs() < 1e-10, "{lhs} vs {rhs}");
    }

    #[test]
    fn test_gemm_variants() {
        // A = [[1,2],[3,4]], B = [[5,6],[7,8]]
        let a = [1.0, 2.0, 3.0, 4.0];
        let b = [5.0, 6.0, 7.0, 8.0];
        let mut c = [0.0; 4];
        gemm(&a, &b, &mut c, 2, 2, 2);
        assert_eq!(c, [19.0, 22.0, 43.0, 50.0]);
        let mut c = [0.0; 4];
        gemm_at_b(&a, &b, &mut c, 2, 2, 2);
        assert_eq!(c, [26.0, 30.0, 38.0, 44.0]);
        let mut c = [0.0; 4];
        gemm_a_bt(&a, &b, &mut c, 2, 2, 2);
        assert_eq!(c, [17.0, 23.0, 39.0, 53.0]);
    }

    #[test]
    fn test_bias_through_ones() {
        let mut buffers = GemmBuffers::<f64>::default();
        assert_eq!(
            buffers.bias_plane(&[1.0, 2.0], 3).unwrap(),
            vec![1.0, 1.0, 1.0, 2.0, 2.0, 2.0]
        );
        let grad = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 1.0, 1.0, 1.0, 2.0, 2.0, 2.0];
        assert_eq!(buffers.bias_grad(&grad, 2, 2, 3).unwrap(), vec![9.0, 21.0]);
    }

    #[test]
    fn test_oversized_columns_fail_cleanly() {
        // one voxel padded by 2^20 on each side: 2^63 column slots
        let p = ConvParams::from_context(&BackendContext::default(), 3)
            .with_padding(&[1 << 20, 1 << 20, 1 << 20]);
        let g = geometry(&[1, 1, 1, 1, 1], &[1, 1, 1, 1, 1], &p);
        let mut buffers = GemmBuffers::<f32>::default();
        let mut out = Vec::new();
        let err = buffers.forward(&g, &[1.0], &[1.0], &mut out).unwrap_err();
        assert!(matches!(err, Error::AllocationFailed { .. }), "{err}");
        assert!(buffers.columns.is_empty());
    }
}

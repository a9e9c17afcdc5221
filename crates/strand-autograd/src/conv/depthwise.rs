// Depthwise kernels: one filter per channel (groups == C_in == C_out)
//
// Unfolding buys nothing when every group has a single channel, so these
// loops read the image directly. Channels are independent and are processed
// on the rayon pool; each task owns one output (or gradient) plane.

use rayon::prelude::*;
use strand_core::FloatElement;

use super::geometry::ConvGeometry;

/// Visit every (output position, kernel tap, image position) triple of one
/// channel plane.
#[inline]
fn for_each_tap(g: &ConvGeometry, mut f: impl FnMut(usize, usize, usize)) {
    let [_, ih, iw] = g.image;
    let [kd, kh, kw] = g.kernel;
    let [od, oh, ow] = g.out;
    for z in 0..od {
        for y in 0..oh {
            for x in 0..ow {
                let o = (z * oh + y) * ow + x;
                for a in 0..kd {
                    let Some(pz) = g.source(0, z, a) else { continue };
                    for b in 0..kh {
                        let Some(py) = g.source(1, y, b) else { continue };
                        for e in 0..kw {
                            if let Some(px) = g.source(2, x, e) {
                                let k = (a * kh + b) * kw + e;
                                f(o, k, (pz * ih + py) * iw + px);
                            }
                        }
                    }
                }
            }
        }
    }
}

pub(crate) fn forward<E: FloatElement>(g: &ConvGeometry, image: &[E], weight: &[E], out: &mut [E]) {
    let (ip, op, kv, c) = (g.image_plane(), g.out_plane(), g.kernel_volume(), g.out_channels);
    out.par_chunks_mut(op.max(1)).enumerate().for_each(|(nc, plane)| {
        let ch = nc % c;
        let img = &image[nc * ip..(nc + 1) * ip];
        let w = &weight[ch * kv..(ch + 1) * kv];
        for_each_tap(g, |o, k, i| plane[o] = plane[o] + img[i] * w[k]);
    });
}

pub(crate) fn backward_image<E: FloatElement>(
    g: &ConvGeometry,
    grad_out: &[E],
    weight: &[E],
    grad_image: &mut [E],
) {
    let (ip, op, kv, c) = (g.image_plane(), g.out_plane(), g.kernel_volume(), g.out_channels);
    grad_image
        .par_chunks_mut(ip.max(1))
        .enumerate()
        .for_each(|(nc, plane)| {
            let ch = nc % c;
            let go = &grad_out[nc * op..(nc + 1) * op];
            let w = &weight[ch * kv..(ch + 1) * kv];
            for_each_tap(g, |o, k, i| plane[i] = plane[i] + go[o] * w[k]);
        });
}

pub(crate) fn backward_weight<E: FloatElement>(
    g: &ConvGeometry,
    image: &[E],
    grad_out: &[E],
    grad_weight: &mut [E],
) {
    let (ip, op, kv, c) = (g.image_plane(), g.out_plane(), g.kernel_volume(), g.out_channels);
    grad_weight
        .par_chunks_mut(kv.max(1))
        .enumerate()
        .for_each(|(ch, taps)| {
            for n in 0..g.batch {
                let nc = n * c + ch;
                let img = &image[nc * ip..(nc + 1) * ip];
                let go = &grad_out[nc * op..(nc + 1) * op];
                for_each_tap(g, |o, k, i| taps[k] = taps[k] + go[o] * img[i]);
            }
        });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::BackendContext;
    use crate::conv::kernels::GemmBuffers;
    use crate::conv::params::ConvParams;
    use strand_core::DType;

    #[test]
    fn test_matches_grouped_gemm() {
        let p = ConvParams::from_context(&BackendContext::default(), 2)
            .with_groups(3)
            .with_padding(&[1, 1])
            .with_stride(&[2, 1]);
        let (image, weight) = ([2usize, 3, 5, 4], [3usize, 1, 3, 2]);
        let out = p.output_size(&image, &weight).unwrap();
        let g = ConvGeometry::new(&p, &image, &weight, &out, DType::F64);

        let x: Vec<f64> = (0..g.image_len()).map(|i| (i as f64 * 0.7).sin()).collect();
        let w: Vec<f64> = (0..g.weight_len()).map(|i| (i as f64 * 0.3).cos()).collect();
        let gy: Vec<f64> = (0..g.out_len()).map(|i| (i as f64 * 0.5).sin()).collect();

        let mut gemm = GemmBuffers::default();
        let (mut y0, mut y1) = (vec![0.0; g.out_len()], vec![0.0; g.out_len()]);
        gemm.forward(&g, &x, &w, &mut y0).unwrap();
        forward(&g, &x, &w, &mut y1);

        let (mut gx0, mut gx1) = (vec![0.0; g.image_len()], vec![0.0; g.image_len()]);
        gemm.backward_image(&g, &gy, &w, &mut gx0).unwrap();
        backward_image(&g, &gy, &w, &mut gx1);

        let (mut gw0, mut gw1) = (vec![0.0; g.weight_len()], vec![0.0; g.weight_len()]);
        gemm.backward_weight(&g, &x, &gy, &mut gw0).unwrap();
        backward_weight(&g, &x, &gy, &mut gw1);

        for (a, b) in y0.iter().zip(&y1).chain(gx0.iter().zip(&gx1)).chain(gw0.iter().zip(&gw1)) {
            assert!((a - b).abs() < 1e-12, "{a} vs {b}");
        }
    }
}

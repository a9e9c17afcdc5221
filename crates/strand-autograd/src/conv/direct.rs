// Direct spatial kernels (NNPACK-style)
//
// No unfolding: every output plane is produced by sliding the filters over
// the image in place. Work is split on the rayon pool by the plane being
// written, so no two tasks touch the same memory and results do not depend
// on scheduling.
//
//   forward          one task per (sample, output channel) plane
//   backward image   one task per (sample, image channel) plane
//   backward weight  one task per output channel filter

use rayon::prelude::*;
use strand_core::FloatElement;

use super::geometry::ConvGeometry;

/// Accumulate one (output plane, image plane, filter) contribution.
#[inline]
fn correlate(g: &ConvGeometry, mut f: impl FnMut(usize, usize, usize)) {
    let [_, ih, iw] = g.image;
    let [kd, kh, kw] = g.kernel;
    let [od, oh, ow] = g.out;
    for a in 0..kd {
        for b in 0..kh {
            for e in 0..kw {
                let k = (a * kh + b) * kw + e;
                for z in 0..od {
                    let Some(pz) = g.source(0, z, a) else { continue };
                    for y in 0..oh {
                        let Some(py) = g.source(1, y, b) else { continue };
                        for x in 0..ow {
                            if let Some(px) = g.source(2, x, e) {
                                f((z * oh + y) * ow + x, k, (pz * ih + py) * iw + px);
                            }
                        }
                    }
                }
            }
        }
    }
}

pub(crate) fn forward<E: FloatElement>(g: &ConvGeometry, image: &[E], weight: &[E], out: &mut [E]) {
    let (ip, op, kv) = (g.image_plane(), g.out_plane(), g.kernel_volume());
    let (gi, go) = (g.group_in(), g.group_out());
    out.par_chunks_mut(op.max(1)).enumerate().for_each(|(idx, plane)| {
        let (n, co) = (idx / g.out_channels, idx % g.out_channels);
        let grp = co / go;
        for ci in 0..gi {
            let img_c = n * g.image_channels + grp * gi + ci;
            let img = &image[img_c * ip..(img_c + 1) * ip];
            let w = &weight[(co * gi + ci) * kv..(co * gi + ci + 1) * kv];
            correlate(g, |o, k, i| plane[o] = plane[o] + img[i] * w[k]);
        }
    });
}

pub(crate) fn backward_image<E: FloatElement>(
    g: &ConvGeometry,
    grad_out: &[E],
    weight: &[E],
    grad_image: &mut [E],
) {
    let (ip, op, kv) = (g.image_plane(), g.out_plane(), g.kernel_volume());
    let (gi, go) = (g.group_in(), g.group_out());
    grad_image
        .par_chunks_mut(ip.max(1))
        .enumerate()
        .for_each(|(idx, plane)| {
            let (n, c) = (idx / g.image_channels, idx % g.image_channels);
            let (grp, ci) = (c / gi, c % gi);
            for co in grp * go..(grp + 1) * go {
                let o_c = n * g.out_channels + co;
                let gy = &grad_out[o_c * op..(o_c + 1) * op];
                let w = &weight[(co * gi + ci) * kv..(co * gi + ci + 1) * kv];
                correlate(g, |o, k, i| plane[i] = plane[i] + gy[o] * w[k]);
            }
        });
}

pub(crate) fn backward_weight<E: FloatElement>(
    g: &ConvGeometry,
    image: &[E],
    grad_out: &[E],
    grad_weight: &mut [E],
) {
    let (ip, op, kv) = (g.image_plane(), g.out_plane(), g.kernel_volume());
    let (gi, go) = (g.group_in(), g.group_out());
    grad_weight
        .par_chunks_mut((gi * kv).max(1))
        .enumerate()
        .for_each(|(co, filter)| {
            let grp = co / go;
            for n in 0..g.batch {
                let o_c = n * g.out_channels + co;
                let gy = &grad_out[o_c * op..(o_c + 1) * op];
                for ci in 0..gi {
                    let img_c = n * g.image_channels + grp * gi + ci;
                    let img = &image[img_c * ip..(img_c + 1) * ip];
                    let taps = &mut filter[ci * kv..(ci + 1) * kv];
                    correlate(g, |o, k, i| taps[k] = taps[k] + gy[o] * img[i]);
                }
            }
        });
}

//! Raster resampling under fractional shift and scale.
//!
//! Vignettes, retinas and model rasters all live on pixel grids with
//! different sampling steps and sub-pixel offsets; this module moves data
//! between them with a Lanczos3 windowed-sinc interpolant, applied
//! separably along each axis. Destination pixels whose kernel support falls
//! entirely outside the source are zero.

use ndarray::{Array2, ArrayView2};

/// Interpolation kernel full width in source pixels (at unit stretch).
pub const INTERP_WIDTH: usize = 6;

/// Interpolation envelope factor (Lanczos window half-width).
pub const INTERP_FAC: f64 = 3.0;

/// Lanczos3 kernel: sinc(x) * sinc(x / 3) inside the envelope, 0 outside.
fn lanczos3(x: f64) -> f64 {
    if x == 0.0 {
        return 1.0;
    }
    if x.abs() >= INTERP_FAC {
        return 0.0;
    }
    let px = std::f64::consts::PI * x;
    (px.sin() * (px / INTERP_FAC).sin()) / (px * px / INTERP_FAC)
}

/// Precomputed kernel taps for one destination index along one axis.
struct AxisTaps {
    start: usize,
    weights: Vec<f64>,
}

/// Kernel taps for every destination index along an axis of length `n2`,
/// sampling a source axis of length `n1`.
///
/// The source coordinate of destination index `i` is
/// `n1/2 + shift + (i - n2/2) * step` (integer-division centers, matching
/// the vignette/model center convention used throughout the crate). The
/// kernel is stretched by `interp_step` and renormalized over its in-range
/// taps. Destination indices with no source support get an empty tap list.
fn axis_taps(n1: usize, n2: usize, shift: f64, step: f64, interp_step: f64) -> Vec<AxisTaps> {
    let c1 = (n1 / 2) as f64;
    let c2 = (n2 / 2) as f64;
    let hw = 0.5 * INTERP_WIDTH as f64 * interp_step;

    (0..n2)
        .map(|i| {
            let src = c1 + shift + (i as f64 - c2) * step;
            let lo = ((src - hw).ceil().max(0.0)) as i64;
            let hi = ((src + hw).floor()).min(n1 as f64 - 1.0) as i64;
            if lo > hi || src < -hw || src > n1 as f64 - 1.0 + hw {
                return AxisTaps {
                    start: 0,
                    weights: Vec::new(),
                };
            }
            let mut weights: Vec<f64> = (lo..=hi)
                .map(|p| lanczos3((p as f64 - src) / interp_step))
                .collect();
            let norm: f64 = weights.iter().sum();
            if norm > 0.0 {
                for w in &mut weights {
                    *w /= norm;
                }
            }
            AxisTaps {
                start: lo as usize,
                weights,
            }
        })
        .collect()
}

/// Resample `src` onto a `dst_shape` grid.
///
/// * `dx`, `dy` - sub-pixel shift of the destination grid center relative to
///   the source grid center, in source pixels.
/// * `step` - destination pixel size in source pixels.
/// * `interp_step` - kernel stretch factor; pass a value > 1 when the source
///   is coarser than the interpolant (undersampled data), otherwise 1.
pub fn resample(
    src: ArrayView2<f64>,
    dst_shape: (usize, usize),
    dx: f64,
    dy: f64,
    step: f64,
    interp_step: f64,
) -> Array2<f64> {
    let (h1, w1) = src.dim();
    let (h2, w2) = dst_shape;
    let interp_step = if interp_step > 0.0 { interp_step } else { 1.0 };

    let xtaps = axis_taps(w1, w2, dx, step, interp_step);
    let ytaps = axis_taps(h1, h2, dy, step, interp_step);

    // X pass: interpolate source rows onto destination columns.
    let mut mid = Array2::zeros((h1, w2));
    for y in 0..h1 {
        for (j, taps) in xtaps.iter().enumerate() {
            let mut val = 0.0;
            for (k, &w) in taps.weights.iter().enumerate() {
                val += w * src[[y, taps.start + k]];
            }
            mid[[y, j]] = val;
        }
    }

    // Y pass on the intermediate buffer.
    let mut dst = Array2::zeros((h2, w2));
    for (i, taps) in ytaps.iter().enumerate() {
        for j in 0..w2 {
            let mut val = 0.0;
            for (k, &w) in taps.weights.iter().enumerate() {
                val += w * mid[[taps.start + k, j]];
            }
            dst[[i, j]] = val;
        }
    }
    dst
}

/// Copy `src` into a raster of `dst_shape`, aligning grid centers.
///
/// Used to extract the centered sub-window for centroid refinement; crops or
/// zero-pads as needed.
pub fn copy_center(src: ArrayView2<f64>, dst_shape: (usize, usize)) -> Array2<f64> {
    let (h1, w1) = src.dim();
    let (h2, w2) = dst_shape;
    let oy = h1 as i64 / 2 - h2 as i64 / 2;
    let ox = w1 as i64 / 2 - w2 as i64 / 2;

    let mut dst = Array2::zeros(dst_shape);
    for y in 0..h2 {
        let sy = y as i64 + oy;
        if sy < 0 || sy >= h1 as i64 {
            continue;
        }
        for x in 0..w2 {
            let sx = x as i64 + ox;
            if sx < 0 || sx >= w1 as i64 {
                continue;
            }
            dst[[y, x]] = src[[sy as usize, sx as usize]];
        }
    }
    dst
}

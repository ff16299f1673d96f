//! Super-resolution refinement of the brightest model pixels.
//!
//! The model-building pass fits each model pixel independently, which leaves
//! interpolation aliasing in place wherever the model is undersampled. This
//! pass re-solves the brightest model pixels jointly: each selected pixel
//! contributes, per sample, the interpolated footprint of a unit impulse on
//! the vignette grid, and the block normal equations couple every selected
//! pixel with every polynomial coefficient. The solution is added to the
//! coefficient cube as a correction.

use nalgebra::{DMatrix, DVector};
use ndarray::Array2;

use crate::error::PsfError;
use crate::model::PsfModel;
use crate::resample::resample;
use crate::sample::SampleSet;
use crate::solve::cholesky_solve;
use crate::stats::kth_smallest;

/// Matrix entries below this magnitude are treated as zero.
const TINY: f64 = 1e-30;

/// Compressed row of one impulse footprint: (flat vignette index, value).
type SparseRow = Vec<(usize, f64)>;

/// Dot product of two index-sorted sparse rows.
fn sparse_dot(a: &SparseRow, b: &SparseRow) -> f64 {
    let mut acc = 0.0;
    let (mut ia, mut ib) = (0, 0);
    while ia < a.len() && ib < b.len() {
        match a[ia].0.cmp(&b[ib].0) {
            std::cmp::Ordering::Less => ia += 1,
            std::cmp::Ordering::Greater => ib += 1,
            std::cmp::Ordering::Equal => {
                acc += a[ia].1 * b[ib].1;
                ia += 1;
                ib += 1;
            }
        }
    }
    acc
}

/// Jointly re-fit the `npsf` brightest model pixels against all samples.
///
/// Pixel selection thresholds on the absolute value of the constant
/// coefficient plane. The unknowns are one correction per selected pixel and
/// polynomial coefficient; corrections are solved in a single weighted
/// least-squares system over every vignette pixel of every sample and added
/// to the cube. Returns the number of pixels actually refined.
pub fn refine(model: &mut PsfModel, set: &SampleSet, npsf: usize) -> Result<usize, PsfError> {
    if npsf == 0 || set.is_empty() {
        return Ok(0);
    }

    let (h, w) = (model.height, model.width);
    let npix = h * w;
    let npsf = npsf.min(npix);

    // Selection threshold: order statistic of the constant plane.
    let mut order: Vec<f64> = model
        .comp
        .index_axis(ndarray::Axis(0), 0)
        .iter()
        .map(|v| v.abs())
        .collect();
    let threshold = kth_smallest(&mut order, npix - npsf);

    let mask: Vec<usize> = model
        .comp
        .index_axis(ndarray::Axis(0), 0)
        .iter()
        .enumerate()
        .filter(|(_, v)| v.abs() >= threshold)
        .map(|(p, _)| p)
        .collect();
    let npsf = mask.len();
    log::info!("{npsf} model pixels retained for super-resolution");

    let ncoeff = model.ncoeff();
    let nunknown = ncoeff * npsf;
    let vigstep = 1.0 / model.pixstep;
    let (vh, vw) = set.vig_shape();

    let mut alpha = DMatrix::<f64>::zeros(nunknown, nunknown);
    let mut beta = DVector::<f64>::zeros(nunknown);
    let mut dirac = Array2::<f64>::zeros((h, w));
    let mut rows: Vec<SparseRow> = vec![Vec::new(); npsf];

    let positions: Vec<Vec<f64>> = set
        .samples()
        .iter()
        .map(|s| set.normalized_context(s))
        .collect();

    for (n, sample) in set.samples().iter().enumerate() {
        let basis = model.build(&positions[n]);
        let dx = -sample.dx * vigstep;
        let dy = -sample.dy * vigstep;
        let norm = sample.norm;

        // Residual vignette and 1/sigma map for this sample.
        let modelvig = resample(model.loc.view(), (vh, vw), dx, dy, vigstep, 1.0);
        let sigvig: Vec<f64> = sample.vigweight.iter().map(|&wv| wv.sqrt()).collect();
        let bvec: Vec<f64> = sample
            .vig
            .iter()
            .zip(modelvig.iter())
            .zip(&sigvig)
            .map(|((&d, &m), &sv)| (d - m * norm) * sv)
            .collect();

        // Impulse footprint of each selected pixel on the vignette grid.
        for (k, &p) in mask.iter().enumerate() {
            let (py, px) = (p / w, p % w);
            dirac[[py, px]] = norm;
            let dvig = resample(dirac.view(), (vh, vw), dx, dy, vigstep, 1.0);
            dirac[[py, px]] = 0.0;

            rows[k].clear();
            for (j, (&dv, &sv)) in dvig.iter().zip(&sigvig).enumerate() {
                let val = dv * sv;
                if val.abs() > TINY {
                    rows[k].push((j, val));
                }
            }
        }

        // Accumulate the block normal equations (upper blocks only).
        for k in 0..npsf {
            for j in k..npsf {
                let dval = sparse_dot(&rows[k], &rows[j]);
                if dval.abs() > TINY {
                    for l in 0..ncoeff {
                        for i in 0..ncoeff {
                            alpha[(k * ncoeff + l, j * ncoeff + i)] +=
                                dval * basis[l] * basis[i];
                        }
                    }
                }
            }
            let dval: f64 = rows[k].iter().map(|&(j, v)| v * bvec[j]).sum();
            for i in 0..ncoeff {
                beta[k * ncoeff + i] += dval * basis[i];
            }
        }
    }

    // Mirror into the lower triangle before factorizing.
    for r in 0..nunknown {
        for c in 0..r {
            alpha[(r, c)] = alpha[(c, r)];
        }
    }

    let delta = cholesky_solve(alpha, &beta)?;

    for (k, &p) in mask.iter().enumerate() {
        let (py, px) = (p / w, p % w);
        for c in 0..ncoeff {
            model.comp[[c, py, px]] += delta[k * ncoeff + c];
        }
    }
    Ok(npsf)
}

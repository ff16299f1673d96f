//! Residual computation, centroid refinement and outlier rejection.
//!
//! The residual pass evaluates the model at every sample's context, maps it
//! onto the sample's vignette grid, and records the model-subtracted
//! residual and its chi-square. Optionally each sample's sub-pixel centroid
//! is refined first by fitting shifted copies of the local model to the
//! vignette. The clean pass turns the per-sample chi distribution into
//! k-sigma-clipped statistics and drops samples beyond the upper cut.

use nalgebra::{DMatrix, DVector};
use ndarray::Array2;

use crate::error::PsfError;
use crate::model::PsfModel;
use crate::resample::{copy_center, resample};
use crate::sample::SampleSet;
use crate::solve::cholesky_solve;
use crate::stats::{kappa_sigma_clip, ClippedStats};

/// Maximum centroid refinement iterations per sample.
const CENTROID_NITER: usize = 40;

/// Shift update below which the centroid iteration has converged (pixels).
const MIN_SHIFT: f64 = 1e-3;

/// Total offset beyond which the centroid iteration has diverged (pixels).
const MAX_SHIFT: f64 = 3.0;

/// Statistics of one clean pass.
#[derive(Debug, Clone, Copy)]
pub struct CleanStats {
    /// Clipped statistics of the per-sample chi (sqrt of chi-square)
    /// distribution.
    pub chi: ClippedStats,
    /// Samples rejected by this pass (zero for diagnostic passes).
    pub rejected: usize,
}

/// Refine one sample's sub-pixel offset against the local model raster.
///
/// Fits amplitude and x/y gradient of the shifted model to the weighted
/// vignette data, converts the gradient into a shift through the model's
/// second moments, and steps half of it at a time. Returns the refined
/// offset once the step drops below [`MIN_SHIFT`], `None` when the offset
/// runs past [`MAX_SHIFT`] or the normal equations degenerate.
fn refine_centroid(
    loc: &Array2<f64>,
    cdata: &Array2<f64>,
    cweight: &Array2<f64>,
    vigstep: f64,
    dx0: f64,
    dy0: f64,
) -> Option<(f64, f64)> {
    let (ch, cw) = cdata.dim();
    let hcw = (cw / 2) as f64;
    let hch = (ch / 2) as f64;
    let radmin2 = MIN_SHIFT * MIN_SHIFT;
    let radmax2 = MAX_SHIFT * MAX_SHIFT;

    let mut dx = dx0;
    let mut dy = dy0;
    for _ in 0..CENTROID_NITER {
        let cbasis = resample(
            loc.view(),
            (ch, cw),
            -dx * vigstep,
            -dy * vigstep,
            vigstep,
            1.0,
        );

        let mut a = [0.0f64; 6];
        let mut b = [0.0f64; 3];
        let (mut mx2, mut my2, mut mxy) = (0.0, 0.0, 0.0);
        for y in 0..ch {
            let dvaly = y as f64 - hch - dy;
            for x in 0..cw {
                let dvalx = x as f64 - hcw - dx;
                let psi = cbasis[[y, x]];
                let dwval = psi * cdata[[y, x]];
                b[0] += dwval;
                b[1] += dwval * dvalx;
                b[2] += dwval * dvaly;
                mx2 += psi * dvalx * dvalx;
                my2 += psi * dvaly * dvaly;
                mxy += psi * dvalx * dvaly;
                let wpsi2 = psi * psi * cweight[[y, x]];
                a[0] += wpsi2;
                a[1] += wpsi2 * dvalx;
                a[2] += wpsi2 * dvaly;
                a[3] += wpsi2 * dvalx * dvalx;
                a[4] += wpsi2 * dvalx * dvaly;
                a[5] += wpsi2 * dvaly * dvaly;
            }
        }

        let amat = DMatrix::from_row_slice(
            3,
            3,
            &[a[0], a[1], a[2], a[1], a[3], a[4], a[2], a[4], a[5]],
        );
        let bvec = DVector::from_row_slice(&b);
        let sol = match cholesky_solve(amat, &bvec) {
            Ok(sol) => sol,
            Err(_) => return None,
        };

        let ddx = (sol[1] * mx2 + sol[2] * mxy) / sol[0];
        let ddy = (sol[2] * my2 + sol[1] * mxy) / sol[0];
        if !(ddx.is_finite() && ddy.is_finite()) {
            return None;
        }
        dx += 0.5 * ddx;
        dy += 0.5 * ddy;

        if ddx * ddx + ddy * ddy < radmin2 {
            return Some((dx, dy));
        }
        if dx * dx + dy * dy > radmax2 {
            return None;
        }
    }
    None
}

/// Compute per-sample residuals and chi-squares against the current model.
///
/// With `recenter` set, each sample's sub-pixel offset is refined on a
/// centered sub-window spanning roughly twice the population FWHM before the
/// residual is taken; samples whose refinement diverges keep their previous
/// offset. The weighted squared residuals are also accumulated across the
/// population into [`PsfModel::resi`] on the model grid.
pub fn make_residuals(model: &mut PsfModel, set: &mut SampleSet, recenter: bool) {
    let (vh, vw) = set.vig_shape();
    let npix = vh * vw;
    let vigstep = 1.0 / model.pixstep;
    let pixstep = model.pixstep;

    // Centering sub-window sized to contain most of the signal.
    let cw = ((2.0 * set.fwhm + 1.0) as usize).clamp(1, vw);
    let ch = ((2.0 * set.fwhm + 1.0) as usize).clamp(1, vh);

    let positions: Vec<Vec<f64>> = set
        .samples()
        .iter()
        .map(|s| set.normalized_context(s))
        .collect();

    let mut dresi = Array2::<f64>::zeros((vh, vw));
    let nsample = set.len();
    for (i, sample) in set.samples_mut().iter_mut().enumerate() {
        model.build(&positions[i]);

        let mut dx = sample.dx;
        let mut dy = sample.dy;
        if recenter {
            let mut cdata = copy_center(sample.vig.view(), (ch, cw));
            let cweight = copy_center(sample.vigweight.view(), (ch, cw));
            cdata.zip_mut_with(&cweight, |d, &w| *d *= w);

            match refine_centroid(&model.loc, &cdata, &cweight, vigstep, dx, dy) {
                Some((rx, ry)) => {
                    dx = rx;
                    dy = ry;
                    sample.dx = dx;
                    sample.dy = dy;
                }
                None => {
                    log::debug!(
                        "centroid refinement diverged for sample at ({:.1}, {:.1})",
                        sample.x,
                        sample.y
                    );
                }
            }
        }

        // Model on the vignette grid, residual and chi-square.
        sample.vigresi = resample(
            model.loc.view(),
            (vh, vw),
            -dx * vigstep,
            -dy * vigstep,
            vigstep,
            1.0,
        );
        let norm = sample.norm;
        let mut chi2 = 0.0;
        for ((r, &v), (&w, d)) in sample
            .vigresi
            .iter_mut()
            .zip(sample.vig.iter())
            .zip(sample.vigweight.iter().zip(dresi.iter_mut()))
        {
            *r = v - *r * norm;
            let wr2 = w * *r * *r;
            chi2 += wr2;
            *d += wr2;
        }
        sample.chi2 = if npix > 1 {
            chi2 / (npix - 1) as f64
        } else {
            chi2
        };
    }

    // Population residual map, resampled onto the model grid.
    let nm1 = if nsample > 1 { nsample - 1 } else { 1 } as f64;
    dresi.mapv_inplace(|v| (v / nm1).sqrt());
    model.resi = resample(
        dresi.view(),
        (model.height, model.width),
        0.0,
        0.0,
        pixstep,
        1.0,
    );
}

/// Run a residual pass and clip the chi distribution.
///
/// With `reject` set the clip iterates to convergence and samples whose
/// chi-square exceeds the squared upper cut are removed (unordered removal);
/// otherwise a single iteration produces plain population statistics and the
/// population is left intact.
pub fn clean(
    model: &mut PsfModel,
    set: &mut SampleSet,
    reject: bool,
    recenter: bool,
) -> Result<CleanStats, PsfError> {
    if set.is_empty() {
        return Err(PsfError::NoSamples);
    }
    make_residuals(model, set, recenter);

    let chis: Vec<f64> = set.samples().iter().map(|s| s.chi2.sqrt()).collect();
    let stats = kappa_sigma_clip(&chis, if reject { 100 } else { 1 });

    let mut rejected = 0;
    if reject {
        let cut2 = stats.hicut * stats.hicut;
        let mut i = 0;
        while i < set.len() {
            if set.samples()[i].chi2 > cut2 {
                set.remove(i);
                rejected += 1;
            } else {
                i += 1;
            }
        }
        if rejected > 0 {
            log::info!(
                "rejected {rejected} sample(s) with chi > {:.3} ({} left)",
                stats.hicut,
                set.len()
            );
        }
    }

    Ok(CleanStats {
        chi: stats,
        rejected,
    })
}

//! The full fitting run: build, clean, diagnose, refine.
//!
//! Ties the passes together in a fixed order. Each build pass re-fits the
//! coefficient cube on the surviving population; each clean pass recomputes
//! residuals (refining centroids when enabled) and rejects chi outliers.
//! A final diagnostic pass records population statistics without rejecting,
//! and the optional super-resolution pass runs last, on the cleaned
//! population.

use crate::clean::{clean, CleanStats};
use crate::config::FitConfig;
use crate::error::PsfError;
use crate::fit::fit_model;
use crate::model::PsfModel;
use crate::poly::PolySpec;
use crate::refine::refine;
use crate::resample::INTERP_FAC;
use crate::sample::SampleSet;

/// Gaussian FWHM per unit sigma.
const GAUSS_FWHM: f64 = 2.35;

/// Outcome summary of a fitting run.
#[derive(Debug, Clone)]
pub struct FitReport {
    /// Model sampling step actually used (detector pixels per model pixel).
    pub pixstep: f64,
    /// Population size before the first rejection pass.
    pub initial_samples: usize,
    /// Population size after all rejection passes.
    pub final_samples: usize,
    /// Clip statistics of each build + clean cycle.
    pub passes: Vec<CleanStats>,
    /// Statistics of the final, non-rejecting residual pass.
    pub diagnostic: CleanStats,
    /// Model pixels corrected by the super-resolution pass.
    pub refined_pixels: usize,
}

/// Sampling step that critically samples a PSF of the given FWHM with the
/// interpolant in use.
fn auto_pixstep(fwhm: f64) -> f64 {
    (fwhm / GAUSS_FWHM) * (1.0 - 1.0 / INTERP_FAC)
}

/// Run a complete PSF fitting pass over `set`.
///
/// The model raster takes the retina shape of the sample set. When no
/// sampling step is configured it is derived from the population FWHM,
/// measuring the FWHM from sample moments if the set does not carry one.
/// Fails up front when the population is empty or the vignettes cannot
/// cover the model footprint.
pub fn fit_psf(
    set: &mut SampleSet,
    spec: PolySpec,
    config: &FitConfig,
) -> Result<(PsfModel, FitReport), PsfError> {
    if set.is_empty() {
        return Err(PsfError::NoSamples);
    }

    if set.fwhm <= 0.0 {
        set.estimate_fwhm();
    }
    let pixstep = match config.psf_step {
        Some(step) if step > 0.0 => step,
        _ => {
            let step = auto_pixstep(set.fwhm);
            if step > 0.0 {
                step
            } else {
                log::warn!("no usable FWHM estimate, sampling the model at 1 detector pixel");
                1.0
            }
        }
    };
    log::info!("sampling the model every {pixstep:.2} detector pixel(s)");

    let (mh, mw) = set.retina_shape();
    let (vh, vw) = set.vig_shape();
    if mw as f64 * pixstep > vw as f64 || mh as f64 * pixstep > vh as f64 {
        return Err(PsfError::VignetteTooSmall {
            vig_w: vw,
            vig_h: vh,
            model_w: mw,
            model_h: mh,
            pixstep,
        });
    }

    set.compute_context_ranges();
    let mut model = PsfModel::new(mw, mh, pixstep, spec, set.len())?;

    let initial_samples = set.len();
    let mut passes = Vec::with_capacity(config.clean_passes);
    for pass in 0..config.clean_passes {
        fit_model(&mut model, set, config.prof_accuracy)?;
        let stats = clean(&mut model, set, true, config.recenter)?;
        log::info!(
            "pass {}: chi = {:.3} +/- {:.3}, {} sample(s) kept",
            pass + 1,
            stats.chi.median,
            stats.chi.sigma,
            set.len()
        );
        passes.push(stats);
        if set.is_empty() {
            return Err(PsfError::NoSamples);
        }
    }

    let diagnostic = clean(&mut model, set, false, config.recenter)?;
    log::info!(
        "final chi distribution: median {:.3}, sigma {:.3}",
        diagnostic.chi.median,
        diagnostic.chi.sigma
    );

    let refined_pixels = refine(&mut model, set, config.nsuper)?;

    let report = FitReport {
        pixstep,
        initial_samples,
        final_samples: set.len(),
        passes,
        diagnostic,
        refined_pixels,
    };
    Ok((model, report))
}

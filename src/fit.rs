//! The model-building pass: one weighted least-squares fit per model pixel.
//!
//! Every sample contributes one measurement of each model pixel through its
//! retina. The polynomial basis matrix over the sample contexts is shared by
//! all pixels, so a pass costs one basis evaluation per sample plus one
//! small Cholesky solve per model pixel. Pixels are independent and fitted
//! in parallel.

use nalgebra::DVector;
use rayon::prelude::*;

use crate::error::PsfError;
use crate::model::PsfModel;
use crate::sample::SampleSet;

/// Fit the coefficient cube to the current sample population.
///
/// Refreshes every sample's retina (the model sampling step may have changed
/// and centroid offsets shift between passes), adopts the population's
/// context normalization, then solves the per-pixel systems and scatters the
/// coefficients into the cube.
pub fn fit_model(
    model: &mut PsfModel,
    set: &mut SampleSet,
    prof_accuracy: f64,
) -> Result<(), PsfError> {
    if set.is_empty() {
        return Err(PsfError::NoSamples);
    }

    model.context_offset = set.context_offset.clone();
    model.context_scale = set.context_scale.clone();

    let pixstep = model.pixstep;
    for s in set.samples_mut() {
        s.update_retina(pixstep, prof_accuracy);
    }

    let positions: Vec<Vec<f64>> = set
        .samples()
        .iter()
        .map(|s| set.normalized_context(s))
        .collect();
    let basis = model.poly.basis_matrix(&positions);

    log::debug!(
        "fitting {} coefficients per pixel over {} samples",
        model.ncoeff(),
        set.len()
    );

    let (h, w) = (model.height, model.width);
    let results: Vec<Result<DVector<f64>, PsfError>> = {
        let poly = &model.poly;
        let samples = set.samples();
        (0..h * w)
            .into_par_iter()
            .map(|p| {
                let (y, x) = (p / w, p % w);
                let values: Vec<f64> = samples.iter().map(|s| s.retina[[y, x]]).collect();
                let weights: Vec<f64> = samples.iter().map(|s| s.retiweight[[y, x]]).collect();
                poly.fit(&basis, &values, &weights)
            })
            .collect()
    };

    let ncoeff = model.ncoeff();
    for (p, result) in results.into_iter().enumerate() {
        let coeffs = result?;
        let (y, x) = (p / w, p % w);
        for c in 0..ncoeff {
            model.comp[[c, y, x]] = coeffs[c];
        }
    }
    Ok(())
}

//! Error types for the PSF fitting engine.

use thiserror::Error;

/// Errors that can abort a PSF fitting run.
///
/// Fatal input conditions unwind the whole run immediately; numerical
/// failures are propagated up from the linear solvers. Recoverable
/// conditions (a context group degree being lowered, a centroid refinement
/// diverging for one sample) are logged as warnings instead and never
/// surface here.
#[derive(Error, Debug)]
pub enum PsfError {
    #[error("No samples left in the population")]
    NoSamples,

    #[error("Not enough samples to constrain the model: {needed} degrees of freedom requested, {available} samples available")]
    NotEnoughSamples { needed: usize, available: usize },

    #[error("Raster shape mismatch: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error(
        "Vignette ({vig_w}x{vig_h}) is smaller than the model footprint ({model_w}x{model_h} at step {pixstep})"
    )]
    VignetteTooSmall {
        vig_w: usize,
        vig_h: usize,
        model_w: usize,
        model_h: usize,
        pixstep: f64,
    },

    #[error("Normal-equations matrix is not positive definite")]
    SingularSystem,
}

//! Fitting run configuration.
//!
//! Every tunable of the engine lives here and is passed explicitly into the
//! pipeline, so there is no process-wide preference state.

/// Configuration for a full PSF fitting run.
#[derive(Debug, Clone)]
pub struct FitConfig {
    /// Model sampling step in detector pixels (model pixel size / detector
    /// pixel size). `None` derives the step from the population FWHM so the
    /// model critically samples the PSF.
    pub psf_step: Option<f64>,

    /// Expected relative accuracy of the PSF profile. Enters the per-pixel
    /// noise model as `(prof_accuracy * flux)^2`.
    pub prof_accuracy: f64,

    /// Refine each sample's sub-pixel centroid during the residual passes.
    pub recenter: bool,

    /// Number of model pixels to correct in the super-resolution pass.
    /// Zero disables the pass.
    pub nsuper: usize,

    /// Number of build + clean (with rejection) cycles before the final
    /// diagnostic residual pass.
    pub clean_passes: usize,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            psf_step: None,
            prof_accuracy: 0.01,
            recenter: true,
            nsuper: 0,
            clean_passes: 2,
        }
    }
}

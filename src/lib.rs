//! Spatially varying point-spread-function modeling.
//!
//! Builds a PSF model from a population of star cutouts. The model is a
//! raster of coefficient planes driven by a low-order polynomial of
//! "context" variables (typically focal-plane position), fitted pixel by
//! pixel with weighted least squares. Iterated residual passes refine each
//! star's sub-pixel centroid and reject outliers by k-sigma clipping of the
//! chi distribution, and an optional super-resolution pass re-solves the
//! brightest model pixels jointly to undo interpolation aliasing.
//!
//! [`pipeline::fit_psf`] runs the whole sequence; the individual passes are
//! exposed for callers that need finer control.
//!
//! ```no_run
//! use psfmodel::{fit_psf, FitConfig, PolySpec, SampleSet};
//!
//! # fn load(_: &mut SampleSet) {}
//! let mut set = SampleSet::new((35, 35), (25, 25), 2);
//! load(&mut set); // fill with star cutouts
//!
//! let spec = PolySpec::new(vec![0, 0], vec![2]);
//! let (model, report) = fit_psf(&mut set, spec, &FitConfig::default())?;
//! println!(
//!     "kept {} of {} samples, chi median {:.2}",
//!     report.final_samples, report.initial_samples, report.diagnostic.chi.median
//! );
//! # let _ = model;
//! # Ok::<(), psfmodel::PsfError>(())
//! ```

pub mod clean;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod fit;
pub mod model;
pub mod pipeline;
pub mod poly;
pub mod refine;
pub mod resample;
pub mod sample;
pub mod solve;
pub mod stats;

pub use clean::{clean, make_residuals, CleanStats};
pub use config::FitConfig;
pub use diagnostics::{render, DiagnosticKind};
pub use error::PsfError;
pub use fit::fit_model;
pub use model::PsfModel;
pub use pipeline::{fit_psf, FitReport};
pub use poly::{Poly, PolySpec, Reduction};
pub use refine::refine;
pub use sample::{Sample, SampleSet};

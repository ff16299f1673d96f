//! The spatially varying PSF model.
//!
//! The model is a cube of coefficient planes: one plane of model pixels per
//! polynomial basis term. Evaluating the model at a normalized context
//! position collapses the cube into a single raster, the "local PSF".

use ndarray::{Array2, Array3};

use crate::error::PsfError;
use crate::poly::{Poly, PolySpec, Reduction};

/// Fraction of model pixels treated as free parameters when sizing the
/// polynomial against the sample count.
const FREE_FRAC: f64 = 0.96;

/// Spatially varying PSF model: coefficient cube plus evaluation scratch.
#[derive(Debug, Clone)]
pub struct PsfModel {
    /// Model raster width in model pixels.
    pub width: usize,
    /// Model raster height in model pixels.
    pub height: usize,
    /// Model pixel size in detector pixels.
    pub pixstep: f64,
    /// Context polynomial, possibly reduced from the requested spec.
    pub poly: Poly,
    /// Context normalization copied from the sample population.
    pub context_offset: Vec<f64>,
    pub context_scale: Vec<f64>,
    /// Coefficient cube, one `(height, width)` plane per basis term.
    pub comp: Array3<f64>,
    /// Local PSF raster from the last [`PsfModel::build`] call.
    pub loc: Array2<f64>,
    /// Aggregate residual map from the last residual pass, on the model grid.
    pub resi: Array2<f64>,
}

impl PsfModel {
    /// Allocate a zeroed model, reducing the polynomial until the sample
    /// population can constrain it.
    ///
    /// The effective number of free parameters is
    /// `ncoeff / (pixstep^2 * FREE_FRAC)`: an oversampled model
    /// (`pixstep < 1`) costs more samples per coefficient because neighboring
    /// model pixels are correlated through the interpolant. While that count
    /// exceeds the sample population the last context group's degree drops by
    /// one, removing the group entirely when it reaches zero. Each reduction
    /// is logged; running out of groups is fatal.
    pub fn new(
        width: usize,
        height: usize,
        pixstep: f64,
        spec: PolySpec,
        nsamples: usize,
    ) -> Result<Self, PsfError> {
        if nsamples == 0 {
            return Err(PsfError::NoSamples);
        }

        let mut spec = spec;
        loop {
            let needed = (spec.ncoeff() as f64 / (pixstep * pixstep * FREE_FRAC) + 0.499) as usize;
            if needed <= nsamples {
                break;
            }
            match spec.lowered() {
                Some((next, Reduction::DegreeLowered(g))) => {
                    log::warn!(
                        "{nsamples} samples cannot constrain {} coefficients, \
                         lowering context group {g} to degree {}",
                        spec.ncoeff(),
                        next.degrees()[g]
                    );
                    spec = next;
                }
                Some((next, Reduction::GroupRemoved(g))) => {
                    log::warn!(
                        "{nsamples} samples cannot constrain {} coefficients, \
                         dropping context group {g}",
                        spec.ncoeff()
                    );
                    spec = next;
                }
                None => {
                    return Err(PsfError::NotEnoughSamples {
                        needed,
                        available: nsamples,
                    });
                }
            }
        }

        let poly = Poly::new(spec);
        let ncoeff = poly.ncoeff();
        let ndim = poly.ndim();
        Ok(Self {
            width,
            height,
            pixstep,
            poly,
            context_offset: vec![0.0; ndim],
            context_scale: vec![1.0; ndim],
            comp: Array3::zeros((ncoeff, height, width)),
            loc: Array2::zeros((height, width)),
            resi: Array2::zeros((height, width)),
        })
    }

    /// Number of basis coefficients (planes in the cube).
    pub fn ncoeff(&self) -> usize {
        self.poly.ncoeff()
    }

    /// Number of pixels in one model plane.
    pub fn npix(&self) -> usize {
        self.width * self.height
    }

    /// Normalize a raw context vector with the model's stored offset/scale.
    pub fn normalized_pos(&self, context: &[f64]) -> Vec<f64> {
        context
            .iter()
            .zip(self.context_offset.iter().zip(&self.context_scale))
            .map(|(&c, (&off, &scale))| (c - off) / scale)
            .collect()
    }

    /// Evaluate the model at a normalized context position.
    ///
    /// Collapses the coefficient cube into [`PsfModel::loc`] and returns the
    /// basis vector, which callers reuse for residual work.
    pub fn build(&mut self, pos: &[f64]) -> Vec<f64> {
        let basis = self.poly.basis(pos);
        self.loc.fill(0.0);
        for (c, &b) in basis.iter().enumerate() {
            let plane = self.comp.index_axis(ndarray::Axis(0), c);
            self.loc.zip_mut_with(&plane, |l, &p| *l += b * p);
        }
        basis
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use crate::poly::PolySpec;

    #[test]
    fn keeps_spec_when_samples_suffice() {
        let spec = PolySpec::new(vec![0, 0], vec![2]);
        let model = PsfModel::new(11, 11, 1.0, spec, 100).unwrap();
        assert_eq!(model.ncoeff(), 6);
    }

    #[test]
    fn reduces_degree_when_samples_are_scarce() {
        // Degree 2 over two dims needs 6 coefficients; 4 samples at unit
        // step only support degree 1 (3 coefficients).
        let spec = PolySpec::new(vec![0, 0], vec![2]);
        let model = PsfModel::new(11, 11, 1.0, spec, 4).unwrap();
        assert_eq!(model.ncoeff(), 3);
    }

    #[test]
    fn oversampling_raises_the_sample_requirement() {
        // At pixstep 0.5 each coefficient costs 4x the samples, so even the
        // constant-free degree-1 model must collapse to a constant.
        let spec = PolySpec::new(vec![0, 0], vec![1]);
        let model = PsfModel::new(11, 11, 0.5, spec, 5).unwrap();
        assert_eq!(model.ncoeff(), 1);
        assert_eq!(model.poly.ndim(), 0);
    }

    #[test]
    fn fails_when_even_constant_is_unconstrained() {
        let err = PsfModel::new(11, 11, 0.1, PolySpec::constant(), 3);
        assert!(matches!(err, Err(PsfError::NotEnoughSamples { .. })));
    }

    #[test]
    fn zero_samples_is_fatal() {
        let err = PsfModel::new(11, 11, 1.0, PolySpec::constant(), 0);
        assert!(matches!(err, Err(PsfError::NoSamples)));
    }

    #[test]
    fn build_combines_planes_linearly() {
        let spec = PolySpec::new(vec![0], vec![1]);
        let mut model = PsfModel::new(3, 3, 1.0, spec, 100).unwrap();
        // Plane 0 (constant term) all twos, plane 1 (linear term) all ones.
        model.comp.index_axis_mut(ndarray::Axis(0), 0).fill(2.0);
        model.comp.index_axis_mut(ndarray::Axis(0), 1).fill(1.0);

        model.build(&[0.5]);
        assert_relative_eq!(model.loc[[1, 1]], 2.5);

        model.build(&[-1.0]);
        assert_relative_eq!(model.loc[[0, 2]], 1.0);
    }
}

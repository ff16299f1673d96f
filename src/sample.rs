//! Star sample storage: vignettes, weight maps and resampled retinas.
//!
//! A [`Sample`] is one star cutout with everything the fitting passes need:
//! the raw vignette, its inverse-variance weight map, the model-grid
//! "retina" resampling, the context vector indexing the spatial polynomial,
//! and per-sample bookkeeping (sub-pixel offset, normalization, chi-square).
//! The [`SampleSet`] owns the population and keeps all raster shapes fixed
//! for the lifetime of a fitting run.

use ndarray::Array2;

use crate::error::PsfError;
use crate::resample::resample;

/// One star cutout and its derived rasters.
#[derive(Debug, Clone)]
pub struct Sample {
    /// Raw observed vignette (flux per pixel).
    pub vig: Array2<f64>,
    /// Inverse-variance weight per vignette pixel.
    pub vigweight: Array2<f64>,
    /// Model-subtracted residual vignette, filled by the residual pass.
    pub vigresi: Array2<f64>,
    /// Vignette resampled to the model grid and flux-normalized.
    pub retina: Array2<f64>,
    /// Inverse-variance weight per retina pixel.
    pub retiweight: Array2<f64>,
    /// Context values (e.g. focal-plane position) indexing the polynomial.
    pub context: Vec<f64>,
    /// Detector position of the source.
    pub x: f64,
    pub y: f64,
    /// Sub-pixel offset relative to the pixel-centered nominal position.
    pub dx: f64,
    pub dy: f64,
    /// Flux normalization (aperture flux).
    pub norm: f64,
    /// Background noise variance.
    pub backnoise2: f64,
    /// Detector gain (e- per ADU); non-positive disables the Poisson term.
    pub gain: f64,
    /// Residual chi-square per degree of freedom, filled by the residual pass.
    pub chi2: f64,
}

impl Sample {
    /// Rebuild the vignette weight map from the noise model:
    /// `noise^2 = backnoise^2 + (accuracy * flux)^2 [+ flux/gain]`.
    ///
    /// The Poisson term only applies to positive flux with positive gain.
    /// `backnoise2` must be positive so the variance never degenerates.
    pub fn make_weights(&mut self, accuracy: f64) {
        let profaccu2 = accuracy * accuracy;
        let gain = self.gain;
        let backnoise2 = self.backnoise2;
        for (v, w) in self.vig.iter().zip(self.vigweight.iter_mut()) {
            let pix = *v;
            let mut noise2 = backnoise2 + profaccu2 * pix * pix;
            if pix > 0.0 && gain > 0.0 {
                noise2 += pix / gain;
            }
            *w = 1.0 / noise2;
        }
    }

    /// Resample the vignette onto the model grid under the current
    /// sub-pixel offset, normalize by the sample flux, and derive the
    /// matching retina weight map.
    ///
    /// The retina noise model is the vignette one scaled by `norm^2`, so
    /// retina weights stay comparable across samples of different
    /// brightness.
    pub fn update_retina(&mut self, pixstep: f64, accuracy: f64) {
        let shape = self.retina.dim();
        let interp_step = if pixstep > 1.0 { pixstep } else { 1.0 };
        self.retina = resample(self.vig.view(), shape, self.dx, self.dy, pixstep, interp_step);

        let norm = self.norm;
        let norm2 = norm * norm;
        let profaccu2 = accuracy * accuracy * norm2;
        let gain = self.gain;
        let backnoise2 = self.backnoise2;
        for (r, w) in self.retina.iter_mut().zip(self.retiweight.iter_mut()) {
            *r /= norm;
            let pix = *r;
            let mut noise2 = backnoise2 + profaccu2 * pix * pix;
            if pix > 0.0 && gain > 0.0 {
                noise2 += pix / gain;
            }
            *w = norm2 / noise2;
        }
    }

    /// FWHM estimate from intensity-weighted second moments of the positive
    /// part of the vignette, assuming a roughly Gaussian core. `None` when
    /// the vignette holds no positive flux.
    pub fn moment_fwhm(&self) -> Option<f64> {
        let (mut m0, mut mx, mut my) = (0.0, 0.0, 0.0);
        for ((y, x), &v) in self.vig.indexed_iter() {
            if v > 0.0 {
                m0 += v;
                mx += v * x as f64;
                my += v * y as f64;
            }
        }
        if m0 <= 0.0 {
            return None;
        }
        let (cx, cy) = (mx / m0, my / m0);
        let (mut mx2, mut my2) = (0.0, 0.0);
        for ((y, x), &v) in self.vig.indexed_iter() {
            if v > 0.0 {
                let ddx = x as f64 - cx;
                let ddy = y as f64 - cy;
                mx2 += v * ddx * ddx;
                my2 += v * ddy * ddy;
            }
        }
        let sigma2 = 0.5 * (mx2 + my2) / m0;
        (sigma2 > 0.0).then(|| 2.355 * sigma2.sqrt())
    }
}

/// The sample population for one fitting run.
///
/// Vignette and retina shapes are fixed at construction and identical across
/// all samples. Removal does not preserve insertion order (swap-with-last);
/// nothing downstream depends on ordering.
#[derive(Debug, Clone)]
pub struct SampleSet {
    samples: Vec<Sample>,
    vig_shape: (usize, usize),
    retina_shape: (usize, usize),
    ncontext: usize,
    /// Per-dimension context offset used for normalization.
    pub context_offset: Vec<f64>,
    /// Per-dimension context scale used for normalization.
    pub context_scale: Vec<f64>,
    /// Population FWHM estimate in detector pixels.
    pub fwhm: f64,
}

impl SampleSet {
    pub fn new(vig_shape: (usize, usize), retina_shape: (usize, usize), ncontext: usize) -> Self {
        Self {
            samples: Vec::new(),
            vig_shape,
            retina_shape,
            ncontext,
            context_offset: vec![0.0; ncontext],
            context_scale: vec![1.0; ncontext],
            fwhm: 0.0,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn vig_shape(&self) -> (usize, usize) {
        self.vig_shape
    }

    pub fn retina_shape(&self) -> (usize, usize) {
        self.retina_shape
    }

    pub fn ncontext(&self) -> usize {
        self.ncontext
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn samples_mut(&mut self) -> &mut [Sample] {
        &mut self.samples
    }

    /// Reserve storage for `n` additional samples.
    pub fn reserve(&mut self, n: usize) {
        self.samples.reserve(n);
    }

    /// Add a sample from a raw vignette and catalog measurements.
    ///
    /// The sub-pixel offset is initialized from the fractional part of the
    /// detector position; the weight map is built immediately, the retina
    /// is left for the fitting pass (it depends on the model sampling step).
    pub fn add_sample(
        &mut self,
        vig: Array2<f64>,
        context: Vec<f64>,
        x: f64,
        y: f64,
        norm: f64,
        backnoise2: f64,
        gain: f64,
        accuracy: f64,
    ) -> Result<&Sample, PsfError> {
        if vig.dim() != self.vig_shape {
            return Err(PsfError::ShapeMismatch {
                expected: self.vig_shape,
                found: vig.dim(),
            });
        }
        debug_assert_eq!(context.len(), self.ncontext);

        let mut sample = Sample {
            vigweight: Array2::zeros(self.vig_shape),
            vigresi: Array2::zeros(self.vig_shape),
            retina: Array2::zeros(self.retina_shape),
            retiweight: Array2::zeros(self.retina_shape),
            vig,
            context,
            x,
            y,
            dx: x - (x + 0.49999).floor(),
            dy: y - (y + 0.49999).floor(),
            norm,
            backnoise2,
            gain,
            chi2: 0.0,
        };
        sample.make_weights(accuracy);
        self.samples.push(sample);
        let last = self.samples.len() - 1;
        Ok(&self.samples[last])
    }

    /// Unordered removal: the last sample takes slot `index` in O(1).
    /// Returns the sample now occupying that slot, if any remain there.
    pub fn remove(&mut self, index: usize) -> Option<&Sample> {
        self.samples.swap_remove(index);
        self.samples.get(index)
    }

    /// Recompute the per-dimension context offset and scale from the
    /// current population (midpoint and span of the observed values).
    /// Dimensions with no spread get unit scale.
    pub fn compute_context_ranges(&mut self) {
        for d in 0..self.ncontext {
            let mut min = f64::INFINITY;
            let mut max = f64::NEG_INFINITY;
            for s in &self.samples {
                min = min.min(s.context[d]);
                max = max.max(s.context[d]);
            }
            if min > max {
                continue;
            }
            self.context_offset[d] = 0.5 * (min + max);
            self.context_scale[d] = if max > min { max - min } else { 1.0 };
        }
    }

    /// Estimate the population FWHM from the mode of per-sample moment
    /// widths and store it in `fwhm`. Samples with no positive flux are
    /// skipped; the estimate is left untouched when nothing can be measured.
    pub fn estimate_fwhm(&mut self) {
        let widths: Vec<f64> = self
            .samples
            .iter()
            .filter_map(|s| s.moment_fwhm())
            .collect();
        if let Some(mode) = crate::stats::min_gap_mode(&widths) {
            self.fwhm = mode;
        }
    }

    /// Context vector of `sample` normalized by the population offset/scale.
    pub fn normalized_context(&self, sample: &Sample) -> Vec<f64> {
        (0..self.ncontext)
            .map(|d| (sample.context[d] - self.context_offset[d]) / self.context_scale[d])
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn flat_vignette(shape: (usize, usize), value: f64) -> Array2<f64> {
        Array2::from_elem(shape, value)
    }

    fn tiny_set() -> SampleSet {
        SampleSet::new((5, 5), (5, 5), 1)
    }

    #[test]
    fn add_sample_checks_shape() {
        let mut set = tiny_set();
        let err = set.add_sample(
            flat_vignette((4, 5), 1.0),
            vec![0.0],
            10.0,
            10.0,
            1.0,
            1.0,
            0.0,
            0.0,
        );
        assert!(matches!(err, Err(PsfError::ShapeMismatch { .. })));
    }

    #[test]
    fn subpixel_offset_from_position() {
        let mut set = tiny_set();
        let s = set
            .add_sample(
                flat_vignette((5, 5), 1.0),
                vec![0.0],
                100.3,
                200.8,
                1.0,
                1.0,
                0.0,
                0.0,
            )
            .unwrap();
        assert_relative_eq!(s.dx, 0.3, epsilon = 1e-6);
        assert_relative_eq!(s.dy, -0.2, epsilon = 1e-6);
    }

    #[test]
    fn weight_map_noise_model() {
        let mut set = tiny_set();
        let mut vig = flat_vignette((5, 5), 0.0);
        vig[[2, 2]] = 100.0;
        vig[[0, 0]] = -50.0;
        set.add_sample(vig, vec![0.0], 10.0, 10.0, 100.0, 4.0, 2.0, 0.1)
            .unwrap();
        let s = &set.samples()[0];

        // Background-only pixel: weight = 1 / backnoise2.
        assert_relative_eq!(s.vigweight[[1, 1]], 0.25, epsilon = 1e-12);
        // Bright pixel: backnoise2 + (0.1*100)^2 + 100/2 = 154.
        assert_relative_eq!(s.vigweight[[2, 2]], 1.0 / 154.0, epsilon = 1e-12);
        // Negative pixel: no Poisson term. 4 + (0.1*50)^2 = 29.
        assert_relative_eq!(s.vigweight[[0, 0]], 1.0 / 29.0, epsilon = 1e-12);
    }

    #[test]
    fn retina_is_flux_normalized() {
        let mut set = SampleSet::new((15, 15), (15, 15), 0);
        let mut vig = Array2::zeros((15, 15));
        for ((y, x), v) in vig.indexed_iter_mut() {
            let dx = x as f64 - 7.0;
            let dy = y as f64 - 7.0;
            *v = 200.0 * (-(dx * dx + dy * dy) / 4.0).exp();
        }
        set.add_sample(vig, vec![], 7.0, 7.0, 200.0, 1.0, 0.0, 0.01)
            .unwrap();
        set.samples_mut()[0].update_retina(1.0, 0.01);

        let s = &set.samples()[0];
        assert_relative_eq!(s.retina[[7, 7]], 1.0, epsilon = 1e-9);
        assert!(s.retiweight.iter().all(|&w| w > 0.0));
    }

    #[test]
    fn remove_is_swap_with_last() {
        let mut set = tiny_set();
        for i in 0..4 {
            set.add_sample(
                flat_vignette((5, 5), i as f64),
                vec![i as f64],
                10.0,
                10.0,
                1.0,
                1.0,
                0.0,
                0.0,
            )
            .unwrap();
        }

        let replacement = set.remove(1).unwrap();
        assert_relative_eq!(replacement.context[0], 3.0);
        assert_eq!(set.len(), 3);

        // Every other sample survives unchanged (multiset comparison).
        let mut contexts: Vec<f64> = set.samples().iter().map(|s| s.context[0]).collect();
        contexts.sort_by(|a, b| a.total_cmp(b));
        assert_eq!(contexts, vec![0.0, 2.0, 3.0]);
    }

    #[test]
    fn remove_last_leaves_no_replacement() {
        let mut set = tiny_set();
        set.add_sample(
            flat_vignette((5, 5), 1.0),
            vec![0.0],
            10.0,
            10.0,
            1.0,
            1.0,
            0.0,
            0.0,
        )
        .unwrap();
        assert!(set.remove(0).is_none());
        assert!(set.is_empty());
    }

    #[test]
    fn context_normalization_spans_unit_range() {
        let mut set = tiny_set();
        for &c in &[100.0, 300.0, 500.0] {
            set.add_sample(
                flat_vignette((5, 5), 1.0),
                vec![c],
                10.0,
                10.0,
                1.0,
                1.0,
                0.0,
                0.0,
            )
            .unwrap();
        }
        set.compute_context_ranges();
        assert_relative_eq!(set.context_offset[0], 300.0);
        assert_relative_eq!(set.context_scale[0], 400.0);

        let lo = set.normalized_context(&set.samples()[0]);
        let hi = set.normalized_context(&set.samples()[2]);
        assert_relative_eq!(lo[0], -0.5);
        assert_relative_eq!(hi[0], 0.5);
    }
}

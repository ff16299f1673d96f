//! End-to-end fitting runs on synthetic star populations.

use ndarray::Array2;
use rand::distr::Uniform;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use psfmodel::{fit_psf, FitConfig, PolySpec, SampleSet};

const VIG: (usize, usize) = (11, 11);

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Gaussian star vignette with the given center and amplitude.
fn star(shape: (usize, usize), cx: f64, cy: f64, sigma: f64, amp: f64) -> Array2<f64> {
    let mut img = Array2::zeros(shape);
    for ((y, x), v) in img.indexed_iter_mut() {
        let dx = x as f64 - cx;
        let dy = y as f64 - cy;
        *v = amp * (-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp();
    }
    img
}

fn add_noise(vig: &mut Array2<f64>, sigma: f64, rng: &mut StdRng) {
    let noise = Normal::new(0.0, sigma).unwrap();
    vig.mapv_inplace(|v| v + noise.sample(rng));
}

#[test]
fn constant_psf_is_reproduced_exactly() {
    init_logs();
    let mut set = SampleSet::new(VIG, VIG, 0);
    let truth = star(VIG, 5.0, 5.0, 1.5, 100.0);
    for _ in 0..8 {
        set.add_sample(truth.clone(), vec![], 30.0, 30.0, 100.0, 1.0, 0.0, 0.0)
            .unwrap();
    }

    let config = FitConfig {
        psf_step: Some(1.0),
        recenter: false,
        ..FitConfig::default()
    };
    let (mut model, report) = fit_psf(&mut set, PolySpec::constant(), &config).unwrap();

    assert_eq!(report.final_samples, 8);
    assert!(report.diagnostic.chi.median < 1e-6);

    // The model must match the flux-normalized input star.
    model.build(&[]);
    for (m, t) in model.loc.iter().zip(truth.iter()) {
        assert!((m - t / 100.0).abs() < 1e-6, "model {m} vs truth {}", t / 100.0);
    }
}

#[test]
fn constant_shape_collapses_onto_the_constant_plane() {
    // A population whose shape ignores the context entirely: at degree 2 the
    // constant plane carries the whole PSF and the higher-order planes are
    // numerically empty.
    let mut set = SampleSet::new(VIG, VIG, 1);
    let truth = star(VIG, 5.0, 5.0, 1.5, 100.0);
    for i in 0..100 {
        set.add_sample(
            truth.clone(),
            vec![i as f64],
            30.0,
            30.0,
            100.0,
            1.0,
            0.0,
            0.0,
        )
        .unwrap();
    }

    let config = FitConfig {
        psf_step: Some(1.0),
        recenter: false,
        ..FitConfig::default()
    };
    let spec = PolySpec::new(vec![0], vec![2]);
    let (model, report) = fit_psf(&mut set, spec, &config).unwrap();

    assert_eq!(model.ncoeff(), 3);
    assert!(report.final_samples >= 90, "kept {}", report.final_samples);
    for ((c, y, x), &v) in model.comp.indexed_iter() {
        let expected = if c == 0 { truth[[y, x]] / 100.0 } else { 0.0 };
        assert!(
            (v - expected).abs() < 1e-6,
            "plane {c} pixel ({y},{x}): {v} vs {expected}"
        );
    }
}

#[test]
fn quadratic_shape_variation_is_captured() {
    let mut rng = StdRng::seed_from_u64(11);
    let mut set = SampleSet::new(VIG, VIG, 1);

    // PSF width varies quadratically across the context range.
    let width = |c: f64| 1.3 + 0.1 * c + 0.05 * c * c;
    let contexts: Vec<f64> = (0..40).map(|i| -2.0 + 4.0 * i as f64 / 39.0).collect();
    for &c in &contexts {
        let mut vig = star(VIG, 5.0, 5.0, width(c), 100.0);
        add_noise(&mut vig, 1.0, &mut rng);
        set.add_sample(vig, vec![c], 50.0, 50.0, 100.0, 1.0, 0.0, 0.01)
            .unwrap();
    }

    let config = FitConfig {
        psf_step: Some(1.0),
        recenter: false,
        ..FitConfig::default()
    };
    let spec = PolySpec::new(vec![0], vec![2]);
    let (mut model, report) = fit_psf(&mut set, spec, &config).unwrap();

    assert_eq!(model.ncoeff(), 3);
    assert!(report.final_samples >= 36, "kept {}", report.final_samples);

    // Evaluate at the extremes of the context range and compare with the
    // noiseless truth; averaging over 40 samples leaves small pixel errors.
    for c in [-2.0, 0.0, 2.0] {
        let pos = model.normalized_pos(&[c]);
        model.build(&pos);
        let truth = star(VIG, 5.0, 5.0, width(c), 1.0);
        for (m, t) in model.loc.iter().zip(truth.iter()) {
            assert!((m - t).abs() < 0.05, "context {c}: model {m} vs truth {t}");
        }
    }
}

#[test]
fn polynomial_degree_yields_to_small_populations() {
    let mut set = SampleSet::new(VIG, VIG, 1);
    for i in 0..2 {
        set.add_sample(
            star(VIG, 5.0, 5.0, 1.5, 80.0),
            vec![i as f64],
            15.0,
            15.0,
            80.0,
            1.0,
            0.0,
            0.0,
        )
        .unwrap();
    }

    let config = FitConfig {
        psf_step: Some(1.0),
        recenter: false,
        ..FitConfig::default()
    };
    // Degree 2 needs 3 coefficients; 2 samples only support degree 1.
    let spec = PolySpec::new(vec![0], vec![2]);
    let (model, _) = fit_psf(&mut set, spec, &config).unwrap();
    assert_eq!(model.ncoeff(), 2);
}

#[test]
fn contaminated_samples_are_rejected() {
    init_logs();
    let mut rng = StdRng::seed_from_u64(23);
    let mut set = SampleSet::new(VIG, VIG, 0);

    for _ in 0..60 {
        let mut vig = star(VIG, 5.0, 5.0, 1.5, 100.0);
        add_noise(&mut vig, 1.0, &mut rng);
        set.add_sample(vig, vec![], 40.0, 40.0, 100.0, 1.0, 0.0, 0.01)
            .unwrap();
    }
    // Five samples with a bright unresolved companion.
    for _ in 0..5 {
        let mut vig = star(VIG, 5.0, 5.0, 1.5, 100.0);
        vig.zip_mut_with(&star(VIG, 7.5, 7.5, 1.0, 250.0), |v, &c| *v += c);
        add_noise(&mut vig, 1.0, &mut rng);
        set.add_sample(vig, vec![], 40.0, 40.0, 100.0, 1.0, 0.0, 0.01)
            .unwrap();
    }

    let config = FitConfig {
        psf_step: Some(1.0),
        recenter: false,
        ..FitConfig::default()
    };
    let (_, report) = fit_psf(&mut set, PolySpec::constant(), &config).unwrap();

    let rejected: usize = report.passes.iter().map(|p| p.rejected).sum();
    assert!(rejected >= 5, "only {rejected} samples rejected");
    assert!(report.final_samples >= 55, "kept {}", report.final_samples);
    assert_eq!(report.final_samples + rejected, 65);
}

#[test]
fn recentering_recovers_subpixel_offsets() {
    let mut rng = StdRng::seed_from_u64(42);
    let offset = Uniform::new(-0.4, 0.4).unwrap();
    let mut set = SampleSet::new((15, 15), (15, 15), 0);

    // Stars drawn at random sub-pixel offsets; declared positions carry no
    // fractional part, so the initial offsets are all zero. Each sample gets
    // a distinct integer x so it can be matched back after rejection.
    let mut truth = Vec::new();
    for i in 0..30 {
        let (ox, oy) = (offset.sample(&mut rng), offset.sample(&mut rng));
        let mut vig = star((15, 15), 7.0 + ox, 7.0 + oy, 1.8, 200.0);
        add_noise(&mut vig, 0.5, &mut rng);
        let x = 25.0 + 100.0 * i as f64;
        // Normalize by the star's total flux, as an aperture would measure.
        let flux = vig.sum();
        set.add_sample(vig, vec![], x, 25.0, flux, 0.25, 0.0, 0.01)
            .unwrap();
        truth.push((x, ox, oy));
    }

    let config = FitConfig {
        psf_step: Some(1.0),
        recenter: true,
        ..FitConfig::default()
    };
    let (_, report) = fit_psf(&mut set, PolySpec::constant(), &config).unwrap();
    assert!(report.final_samples >= 25);

    // Offsets are only defined up to a shift common to the whole population,
    // so compare after removing the mean residual.
    let residuals: Vec<(f64, f64)> = set
        .samples()
        .iter()
        .map(|s| {
            let (_, ox, oy) = *truth
                .iter()
                .find(|&&(tx, _, _)| (tx - s.x).abs() < 0.5)
                .unwrap();
            (s.dx - ox, s.dy - oy)
        })
        .collect();
    let n = residuals.len() as f64;
    let bias_x: f64 = residuals.iter().map(|r| r.0).sum::<f64>() / n;
    let bias_y: f64 = residuals.iter().map(|r| r.1).sum::<f64>() / n;
    let mean_err: f64 = residuals
        .iter()
        .map(|r| (r.0 - bias_x).hypot(r.1 - bias_y))
        .sum::<f64>()
        / n;
    assert!(mean_err < 0.1, "mean offset error {mean_err}");
}

#[test]
fn super_resolution_pass_runs_to_completion() {
    let mut set = SampleSet::new(VIG, VIG, 0);
    let truth = star(VIG, 5.0, 5.0, 1.5, 120.0);
    for _ in 0..10 {
        set.add_sample(truth.clone(), vec![], 30.0, 30.0, 120.0, 1.0, 0.0, 0.0)
            .unwrap();
    }

    let config = FitConfig {
        psf_step: Some(1.0),
        recenter: false,
        nsuper: 30,
        ..FitConfig::default()
    };
    let (mut model, report) = fit_psf(&mut set, PolySpec::constant(), &config).unwrap();

    assert!(report.refined_pixels >= 30);
    assert!(report.refined_pixels <= model.npix());

    // The correction must not degrade an already-converged model.
    model.build(&[]);
    for (m, t) in model.loc.iter().zip(truth.iter()) {
        assert!((m - t / 120.0).abs() < 1e-6);
    }
}

//! Order statistics and robust population statistics.
//!
//! Small numerical helpers shared by the outlier filter and the
//! super-resolution pixel selection: quickselect order statistics, the
//! iterative k-sigma clip used on per-sample chi distributions, and the
//! minimal-gap sliding-window mode estimator used for FWHM selection.

/// Convergence epsilon for the k-sigma clip (relative change in sigma).
const CLIP_EPS: f64 = 1e-4;

/// Half-width of the clip in units of sigma.
const CLIP_KAPPA: f64 = 3.0;

/// Returns the k-th smallest value of `data` (0-based).
///
/// Partially reorders `data` in place. NaNs sort last.
///
/// # Panics
/// Panics if `data` is empty or `k >= data.len()`.
pub fn kth_smallest(data: &mut [f64], k: usize) -> f64 {
    let (_, kth, _) = data.select_nth_unstable_by(k, |a, b| a.total_cmp(b));
    *kth
}

/// Median of `data` by order statistics (mean of the two central values for
/// even lengths). Partially reorders `data` in place.
///
/// # Panics
/// Panics if `data` is empty.
pub fn median(data: &mut [f64]) -> f64 {
    let n = data.len();
    if n % 2 == 1 {
        kth_smallest(data, n / 2)
    } else {
        let hi = kth_smallest(data, n / 2);
        let lo = data[..n / 2]
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);
        0.5 * (lo + hi)
    }
}

/// Result of an iterative k-sigma clip over a population of values.
#[derive(Debug, Clone, Copy)]
pub struct ClippedStats {
    /// Median of the last retained subset.
    pub median: f64,
    /// Mean of the last retained subset.
    pub mean: f64,
    /// Clipped standard deviation.
    pub sigma: f64,
    /// Lower cut bound after the final iteration.
    pub locut: f64,
    /// Upper cut bound after the final iteration.
    pub hicut: f64,
    /// Values still inside the cut after the final iteration.
    pub retained: usize,
}

/// Iteratively clip `values` at `median +/- 3 sigma`.
///
/// Each iteration computes the median of the currently retained subset, then
/// drops values outside the cut bounds carried over from the previous
/// iteration before recomputing mean and sigma. Iteration stops when sigma
/// drops below 0.1, when its relative change falls under 1e-4, or after
/// `max_iter` rounds. The initial cut is unbounded, so a single iteration
/// yields plain (median, mean, sigma) over the full population.
pub fn kappa_sigma_clip(values: &[f64], max_iter: usize) -> ClippedStats {
    let mut vals = values.to_vec();
    let mut locut = f64::NEG_INFINITY;
    let mut hicut = f64::INFINITY;
    let mut sigma = f64::INFINITY;
    let mut sigma_prev = 1.0;
    let mut med = 0.0;
    let mut mean = 0.0;

    for _ in 0..max_iter {
        if !(sigma >= 0.1 && (sigma / sigma_prev - 1.0).abs() > CLIP_EPS) {
            break;
        }
        sigma_prev = sigma;
        med = median(&mut vals);

        vals.retain(|&v| v > locut && v < hicut);
        let n = vals.len();
        if n == 0 {
            break;
        }
        mean = vals.iter().sum::<f64>() / n as f64;
        let sumsq: f64 = vals.iter().map(|v| v * v).sum();
        let dof = if n > 1 { n - 1 } else { 1 };
        sigma = ((sumsq - mean * mean * n as f64).max(0.0) / dof as f64).sqrt();

        locut = med - CLIP_KAPPA * sigma;
        hicut = med + CLIP_KAPPA * sigma;
    }

    ClippedStats {
        median: med,
        mean,
        sigma,
        locut,
        hicut,
        retained: vals.len(),
    }
}

/// Approximate mode of a sample via the minimal k/4-width window.
///
/// Sorts a copy of `values`, slides a window of `max(n/4, 1)` elements over
/// it and returns the midpoint of the narrowest window (first minimal gap
/// encountered wins). A cheap, robust mode estimator for unimodal
/// distributions such as the FWHM of a star population.
///
/// Returns `None` for an empty input.
pub fn min_gap_mode(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let nw = (sorted.len() / 4).max(1);
    if nw >= sorted.len() {
        return Some(0.5 * (sorted[0] + sorted[sorted.len() - 1]));
    }

    let mut best_gap = f64::INFINITY;
    let mut mode = 0.0;
    for i in 0..sorted.len() - nw {
        let gap = sorted[i + nw] - sorted[i];
        if gap < best_gap {
            best_gap = gap;
            mode = 0.5 * (sorted[i + nw] + sorted[i]);
        }
    }
    Some(mode)
}

//! Outlier-resistant linear regression by the repeated-median (Siegel)
//! estimator.
//!
//! For each sample point the median of its pairwise slopes to every other
//! point is taken, and the overall slope is the median of those row medians.
//! A minority of arbitrarily bad samples (blended stars, cosmic ray hits,
//! catalog mismatches) cannot drag the estimate, so no iterative outlier
//! rejection is needed.
//!
//! The exact estimator is O(N²). Above [`EXACT_LIMIT`] samples each row is
//! estimated from a fixed number of randomly drawn partners instead, using a
//! seedable xoshiro256** generator so results are reproducible.

use log::debug;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256StarStar;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{median_in_place, median_of, order_stat};

/// Largest sample count fitted exactly; beyond this the sampled
/// approximation is used.
pub const EXACT_LIMIT: usize = 10_000;

/// Partner draws per row on the sampled path.
const ROW_SAMPLES: usize = 10_000;

/// Minimum paired samples for a meaningful fit.
pub const MIN_SAMPLES: usize = 5;

/// Consistency constant mapping the Sn estimator to a normal sigma.
const SN_CONSISTENCY: f64 = 1.1926;

/// Abscissa separations at or below this are treated as a degenerate
/// (vertical) pairwise slope and skipped.
const X_COLLISION: f64 = 2.0 * f64::EPSILON;

/// Redraw attempts per sampled partner before the slot is abandoned.
const MAX_REDRAWS: usize = 64;

/// Seed for [`fit`]; [`fit_seeded`] lets tests pick their own.
const DEFAULT_SEED: u64 = 0x9E37_79B9_7F4A_7C15;

/// Errors from the regression stage.
#[derive(Debug, Error)]
pub enum RegressionError {
    #[error("insufficient data for {label}: {count} samples, need at least {MIN_SAMPLES}")]
    InsufficientData { label: String, count: usize },

    #[error("input lengths differ: {x} x-values vs {y} y-values")]
    LengthMismatch { x: usize, y: usize },

    #[error("degenerate abscissa for {label}: no well-defined pairwise slopes")]
    DegenerateAbscissa { label: String },
}

/// Result of one robust linear fit, `y ≈ intercept + slope · x`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinearFit {
    pub intercept: f64,
    pub slope: f64,
    /// Robust dispersion of the per-row slope estimates
    /// (`1.1926 · Sn`), a quality figure for the fit.
    pub scale_deviation: f64,
}

impl LinearFit {
    /// Evaluate the fitted relation at `x`.
    pub fn evaluate(&self, x: f64) -> f64 {
        self.intercept + self.slope * x
    }
}

/// Fit `y = a + b·x` with the repeated-median estimator and the default
/// seed. Deterministic for any input size.
pub fn fit(x: &[f64], y: &[f64], label: &str) -> Result<LinearFit, RegressionError> {
    fit_seeded(x, y, label, DEFAULT_SEED)
}

/// Fit with an explicit seed for the sampled large-N path.
///
/// For `N ≤` [`EXACT_LIMIT`] the seed has no effect: every row median is
/// computed over all partners.
pub fn fit_seeded(
    x: &[f64],
    y: &[f64],
    label: &str,
    seed: u64,
) -> Result<LinearFit, RegressionError> {
    if x.len() != y.len() {
        return Err(RegressionError::LengthMismatch {
            x: x.len(),
            y: y.len(),
        });
    }
    let n = x.len();
    if n < MIN_SAMPLES {
        return Err(RegressionError::InsufficientData {
            label: label.to_string(),
            count: n,
        });
    }

    let mut rng = Xoshiro256StarStar::seed_from_u64(seed);
    let rows = if n <= EXACT_LIMIT {
        row_medians_exact(x, y)
    } else {
        row_medians_sampled(x, y, ROW_SAMPLES, &mut rng)
    };
    if rows.is_empty() {
        return Err(RegressionError::DegenerateAbscissa {
            label: label.to_string(),
        });
    }

    let slope = median_of(&rows);
    let mut residuals: Vec<f64> = x.iter().zip(y).map(|(xi, yi)| yi - slope * xi).collect();
    let intercept = median_in_place(&mut residuals);

    // Sn is itself O(N²); above the exact limit it runs on a uniform
    // subsample governed by the same generator as the slope draws.
    let scale_deviation = if rows.len() <= EXACT_LIMIT {
        SN_CONSISTENCY * sn(&rows)
    } else {
        let sub = subsample(&rows, EXACT_LIMIT, &mut rng);
        SN_CONSISTENCY * sn(&sub)
    };

    debug!(
        "robust fit [{}]: {} samples, slope {:.6}, intercept {:.6}, adev {:.6}",
        label, n, slope, intercept, scale_deviation
    );

    Ok(LinearFit {
        intercept,
        slope,
        scale_deviation,
    })
}

/// Exact per-row slope medians, every point against all partners.
fn row_medians_exact(x: &[f64], y: &[f64]) -> Vec<f64> {
    let n = x.len();
    let mut rows = Vec::with_capacity(n);
    let mut slopes = Vec::with_capacity(n - 1);
    for i in 0..n {
        slopes.clear();
        for j in 0..n {
            if j == i {
                continue;
            }
            let dx = x[j] - x[i];
            if dx.abs() <= X_COLLISION {
                continue;
            }
            slopes.push((y[j] - y[i]) / dx);
        }
        if !slopes.is_empty() {
            rows.push(median_in_place(&mut slopes));
        }
    }
    rows
}

/// Sampled per-row slope medians: `draws` uniformly random partners per
/// row, re-drawing on a degenerate abscissa collision.
fn row_medians_sampled(
    x: &[f64],
    y: &[f64],
    draws: usize,
    rng: &mut Xoshiro256StarStar,
) -> Vec<f64> {
    let n = x.len();
    let mut rows = Vec::with_capacity(n);
    let mut slopes = Vec::with_capacity(draws);
    for i in 0..n {
        slopes.clear();
        for _ in 0..draws {
            for _attempt in 0..MAX_REDRAWS {
                let j = rng.gen_range(0..n);
                if j == i {
                    continue;
                }
                let dx = x[j] - x[i];
                if dx.abs() <= X_COLLISION {
                    continue;
                }
                slopes.push((y[j] - y[i]) / dx);
                break;
            }
        }
        if !slopes.is_empty() {
            rows.push(median_in_place(&mut slopes));
        }
    }
    rows
}

/// Rousseeuw–Croux Sn scale: the low median over i of the high median
/// over j of |v_i − v_j|, without the consistency constant.
fn sn(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let mut outer = Vec::with_capacity(n);
    let mut diffs = Vec::with_capacity(n - 1);
    for (i, vi) in values.iter().enumerate() {
        diffs.clear();
        for (j, vj) in values.iter().enumerate() {
            if i != j {
                diffs.push((vi - vj).abs());
            }
        }
        // High median: (floor(k/2) + 1)-th smallest of k values
        let k = diffs.len();
        outer.push(order_stat(&mut diffs, k / 2));
    }
    // Low median: floor((n + 1)/2)-th smallest
    let k = outer.len();
    order_stat(&mut outer, (k - 1) / 2)
}

/// Uniform subsample of `count` elements.
fn subsample(values: &[f64], count: usize, rng: &mut Xoshiro256StarStar) -> Vec<f64> {
    (0..count)
        .map(|_| values[rng.gen_range(0..values.len())])
        .collect()
}

//! Robust statistics used throughout the pipeline.
//!
//! All estimators here are order-statistic based: medians, the median
//! absolute deviation, sigma-clipped location estimates, and (in
//! [`robust`]) the repeated-median linear regression.

pub mod robust;

/// Consistency factor making the MAD an unbiased sigma estimate for a
/// normal distribution.
pub const MAD_SIGMA: f64 = 1.4826;

/// Median of a slice, computed in place.
///
/// For an even count the average of the two middle order statistics is
/// returned. Empty input yields `f64::NAN`; callers are expected to have
/// checked for data before asking for a location estimate.
pub fn median_in_place(values: &mut [f64]) -> f64 {
    let n = values.len();
    if n == 0 {
        return f64::NAN;
    }
    if n % 2 == 1 {
        order_stat(values, n / 2)
    } else {
        let hi = order_stat(values, n / 2);
        let lo = order_stat(values, n / 2 - 1);
        (lo + hi) / 2.0
    }
}

/// Median of a borrowed slice (copies once).
pub fn median_of(values: &[f64]) -> f64 {
    let mut buf = values.to_vec();
    median_in_place(&mut buf)
}

/// `k`-th order statistic (0-based), computed in place by quickselect.
pub fn order_stat(values: &mut [f64], k: usize) -> f64 {
    let (_, kth, _) = values.select_nth_unstable_by(k, |a, b| a.total_cmp(b));
    *kth
}

/// Median absolute deviation about `center`.
///
/// Multiply by [`MAD_SIGMA`] for a robust sigma estimate.
pub fn mad(values: &[f64], center: f64) -> f64 {
    let mut deviations: Vec<f64> = values.iter().map(|v| (v - center).abs()).collect();
    median_in_place(&mut deviations)
}

/// Iterative sigma-clipped location and scale estimate.
///
/// Starts from the median and the scaled MAD, then repeatedly rejects
/// samples further than `kappa` sigma from the current center. Converges
/// quickly for star-field backgrounds; `rounds` bounds the worst case.
///
/// # Returns
///
/// `(center, sigma)` of the surviving samples.
pub fn sigma_clipped(values: &[f64], kappa: f64, rounds: usize) -> (f64, f64) {
    let mut kept: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if kept.is_empty() {
        return (f64::NAN, f64::NAN);
    }

    let mut center = median_in_place(&mut kept);
    let mut sigma = MAD_SIGMA * mad(&kept, center);

    for _ in 0..rounds {
        if sigma <= 0.0 {
            break;
        }
        let before = kept.len();
        kept.retain(|v| (v - center).abs() <= kappa * sigma);
        if kept.is_empty() || kept.len() == before {
            break;
        }
        center = median_in_place(&mut kept);
        sigma = MAD_SIGMA * mad(&kept, center);
    }

    (center, sigma)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_median_odd_even() {
        assert_relative_eq!(median_of(&[3.0, 1.0, 2.0]), 2.0);
        assert_relative_eq!(median_of(&[4.0, 1.0, 3.0, 2.0]), 2.5);
        assert!(median_of(&[]).is_nan());
    }

    #[test]
    fn test_order_stat() {
        let mut v = vec![5.0, 1.0, 4.0, 2.0, 3.0];
        assert_relative_eq!(order_stat(&mut v, 0), 1.0);
        let mut v = vec![5.0, 1.0, 4.0, 2.0, 3.0];
        assert_relative_eq!(order_stat(&mut v, 4), 5.0);
    }

    #[test]
    fn test_mad() {
        // Median 3, absolute deviations {2, 1, 0, 1, 2} -> MAD 1
        let v = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_relative_eq!(mad(&v, 3.0), 1.0);
    }

    #[test]
    fn test_sigma_clipped_rejects_outliers() {
        let mut v: Vec<f64> = (0..100).map(|i| 10.0 + 0.01 * (i % 7) as f64).collect();
        v.push(1e6);
        v.push(-1e6);
        let (center, sigma) = sigma_clipped(&v, 3.0, 5);
        assert_relative_eq!(center, 10.03, epsilon = 0.05);
        assert!(sigma < 1.0);
    }
}

//! Band integration of spectral curve products.
//!
//! Predicted channel fluxes are integrals of a source spectrum weighted
//! by the detector quantum efficiency and, for broadband filters, the
//! filter transmission. Integration uses composite Simpson's rule over
//! equal sub-intervals; curve evaluation goes through the Akima
//! interpolants, which are zero outside their tabulated domains.

use serde::{Deserialize, Serialize};

use super::curve::AkimaInterpolant;

/// Default broadband integration step in nanometers.
pub const DEFAULT_BROADBAND_STEP_NM: f64 = 0.5;

/// Default sub-interval count for narrowband integration.
pub const DEFAULT_NARROWBAND_STEPS: u32 = 100;

/// A narrowband filter described by its center and bandwidth rather than
/// a tabulated transmission curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NarrowbandFilter {
    pub center_nm: f64,
    pub bandwidth_nm: f64,
}

impl NarrowbandFilter {
    /// Integration band `(lower, upper)` in nanometers.
    pub fn bounds(&self) -> (f64, f64) {
        (
            self.center_nm - self.bandwidth_nm / 2.0,
            self.center_nm + self.bandwidth_nm / 2.0,
        )
    }
}

/// Integrate `a(λ)·b(λ)[·c(λ)] dλ` over `[lower, upper]` with composite
/// Simpson's rule.
///
/// The band is divided into an even number of equal sub-intervals no
/// wider than `step`. Degenerate bands (`upper ≤ lower`) and
/// non-positive steps integrate to zero.
pub fn integrate_band(
    a: &AkimaInterpolant,
    b: &AkimaInterpolant,
    c: Option<&AkimaInterpolant>,
    lower: f64,
    upper: f64,
    step: f64,
) -> f64 {
    if !(upper > lower) || !(step > 0.0) {
        return 0.0;
    }

    let mut intervals = ((upper - lower) / step).ceil() as usize;
    intervals = intervals.max(2);
    if intervals % 2 == 1 {
        intervals += 1;
    }
    let h = (upper - lower) / intervals as f64;

    let eval = |x: f64| -> f64 {
        let product = a.eval(x) * b.eval(x);
        match c {
            Some(c) => product * c.eval(x),
            None => product,
        }
    };

    let mut sum = eval(lower) + eval(upper);
    for i in 1..intervals {
        let weight = if i % 2 == 1 { 4.0 } else { 2.0 };
        sum += weight * eval(lower + i as f64 * h);
    }
    sum * h / 3.0
}

/// Broadband predicted flux: the source spectrum weighted by quantum
/// efficiency and filter transmission, integrated over the filter's own
/// tabulated domain.
pub fn broadband_flux(
    spectrum: &AkimaInterpolant,
    qe: &AkimaInterpolant,
    filter: &AkimaInterpolant,
    step: f64,
) -> f64 {
    let (lower, upper) = filter.domain();
    integrate_band(spectrum, qe, Some(filter), lower, upper, step)
}

/// Narrowband predicted flux over `center ± bandwidth/2` with a fixed
/// sub-interval count; `normalize` divides by the bandwidth so narrowband
/// and broadband results stay comparable.
pub fn narrowband_flux(
    spectrum: &AkimaInterpolant,
    qe: &AkimaInterpolant,
    filter: &NarrowbandFilter,
    steps: u32,
    normalize: bool,
) -> f64 {
    let (lower, upper) = filter.bounds();
    let step = step_width(filter.bandwidth_nm, steps);
    let integral = integrate_band(spectrum, qe, None, lower, upper, step);
    if normalize && filter.bandwidth_nm > 0.0 {
        integral / filter.bandwidth_nm
    } else {
        integral
    }
}

fn step_width(bandwidth_nm: f64, steps: u32) -> f64 {
    bandwidth_nm / steps.max(1) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::photometry::curve::SpectralCurve;
    use approx::assert_relative_eq;

    fn constant_one(lo: f64, hi: f64) -> AkimaInterpolant {
        let n = 9;
        let xs: Vec<f64> = (0..n)
            .map(|i| lo + (hi - lo) * i as f64 / (n - 1) as f64)
            .collect();
        AkimaInterpolant::from_points(&xs, &vec![1.0; n])
    }

    fn triangle() -> AkimaInterpolant {
        // Peak 1.0 at 450 nm over [400, 500]; analytic integral = 50
        let xs: Vec<f64> = (0..21).map(|i| 400.0 + 5.0 * i as f64).collect();
        let ys: Vec<f64> = xs
            .iter()
            .map(|&x| 1.0 - (x - 450.0).abs() / 50.0)
            .collect();
        AkimaInterpolant::from_points(&xs, &ys)
    }

    #[test]
    fn test_constant_curve_integrates_exactly() {
        let unit = constant_one(0.0, 100.0);
        let integral = integrate_band(&unit, &unit, None, 0.0, 100.0, 0.5);
        assert_relative_eq!(integral, 100.0, epsilon = 1e-9);
    }

    #[test]
    fn test_triangle_against_itself() {
        // ∫ T(λ)² dλ over the full domain: analytic 2·∫₀⁵⁰ (x/50)² dx = 100/3
        let tri = triangle();
        // The Akima fit rounds the sharp peak slightly, so compare with a
        // tolerance covering that local deviation.
        let integral = integrate_band(&tri, &tri, None, 400.0, 500.0, 0.25);
        assert_relative_eq!(integral, 100.0 / 3.0, epsilon = 0.25);
    }

    #[test]
    fn test_triangle_with_unit_weight() {
        let tri = triangle();
        let unit = constant_one(350.0, 550.0);
        let integral = integrate_band(&tri, &unit, None, 400.0, 500.0, 0.25);
        assert_relative_eq!(integral, 50.0, epsilon = 0.15);
    }

    #[test]
    fn test_band_beyond_domain_adds_nothing() {
        let tri = triangle();
        let unit = constant_one(300.0, 600.0);
        let inside = integrate_band(&tri, &unit, None, 400.0, 500.0, 0.25);
        let wide = integrate_band(&tri, &unit, None, 300.0, 600.0, 0.25);
        assert_relative_eq!(inside, wide, epsilon = 0.05);
    }

    #[test]
    fn test_degenerate_band_is_zero() {
        let unit = constant_one(0.0, 10.0);
        assert_eq!(integrate_band(&unit, &unit, None, 5.0, 5.0, 0.1), 0.0);
        assert_eq!(integrate_band(&unit, &unit, None, 5.0, 4.0, 0.1), 0.0);
    }

    #[test]
    fn test_three_curve_product() {
        let unit = constant_one(0.0, 100.0);
        let half = {
            let xs: Vec<f64> = (0..9).map(|i| 12.5 * i as f64).collect();
            AkimaInterpolant::from_points(&xs, &vec![0.5; 9])
        };
        let integral = integrate_band(&unit, &unit, Some(&half), 0.0, 100.0, 0.5);
        assert_relative_eq!(integral, 50.0, epsilon = 1e-9);
    }

    #[test]
    fn test_narrowband_normalization() {
        let unit = constant_one(400.0, 700.0);
        let filter = NarrowbandFilter {
            center_nm: 656.3,
            bandwidth_nm: 3.0,
        };
        let raw = narrowband_flux(&unit, &unit, &filter, 100, false);
        let normalized = narrowband_flux(&unit, &unit, &filter, 100, true);
        assert_relative_eq!(raw, 3.0, epsilon = 1e-9);
        assert_relative_eq!(normalized, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_broadband_uses_filter_domain() {
        let spectrum = constant_one(300.0, 800.0);
        let qe = constant_one(300.0, 800.0);
        let filter = SpectralCurve::from_table(
            "tophat",
            None,
            vec![500.0, 510.0, 520.0, 530.0, 540.0],
            vec![1.0; 5],
        )
        .unwrap()
        .interpolant();
        let flux = broadband_flux(&spectrum, &qe, &filter, 0.5);
        assert_relative_eq!(flux, 40.0, epsilon = 1e-9);
    }
}

//! Tabulated spectral curves.
//!
//! A [`SpectralCurve`] is an ordered table of (wavelength, value) samples
//! with at least [`MIN_POINTS`] entries and strictly ascending
//! wavelengths in nanometers. Curves are read-only reference data: once
//! validated they are only evaluated (through an Akima interpolant that
//! is zero outside the tabulated domain) and serialized to/from
//! comma-delimited text.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Minimum table size for a usable curve.
pub const MIN_POINTS: usize = 5;

/// Errors from curve construction and parsing.
#[derive(Debug, Error)]
pub enum CurveError {
    #[error("curve '{name}' has {count} points, need at least {MIN_POINTS}")]
    TooFewPoints { name: String, count: usize },

    #[error("curve '{name}': wavelength and value tables differ in length")]
    LengthMismatch { name: String },

    #[error("curve '{name}': wavelengths must be strictly ascending")]
    NotAscending { name: String },

    #[error("curve '{name}': non-finite sample")]
    NonFinite { name: String },

    #[error("curve '{name}': unparseable sample at line {line}")]
    Parse { name: String, line: usize },
}

/// Color channel tag for filter curves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Channel {
    Red,
    Green,
    Blue,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Red, Channel::Green, Channel::Blue];

    /// Index into per-channel triples, R = 0, G = 1, B = 2.
    pub fn index(&self) -> usize {
        match self {
            Channel::Red => 0,
            Channel::Green => 1,
            Channel::Blue => 2,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            Channel::Red => "R",
            Channel::Green => "G",
            Channel::Blue => "B",
        };
        write!(f, "{tag}")
    }
}

/// A validated tabulated spectral curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpectralCurve {
    name: String,
    channel: Option<Channel>,
    wavelengths: Vec<f64>,
    values: Vec<f64>,
}

impl SpectralCurve {
    /// Build a curve from wavelength and value tables.
    ///
    /// # Errors
    ///
    /// Rejects tables with fewer than [`MIN_POINTS`] samples, mismatched
    /// lengths, non-ascending wavelengths, or non-finite entries.
    pub fn from_table(
        name: impl Into<String>,
        channel: Option<Channel>,
        wavelengths: Vec<f64>,
        values: Vec<f64>,
    ) -> Result<Self, CurveError> {
        let name = name.into();
        if wavelengths.len() != values.len() {
            return Err(CurveError::LengthMismatch { name });
        }
        if wavelengths.len() < MIN_POINTS {
            return Err(CurveError::TooFewPoints {
                name,
                count: wavelengths.len(),
            });
        }
        if wavelengths
            .iter()
            .chain(values.iter())
            .any(|v| !v.is_finite())
        {
            return Err(CurveError::NonFinite { name });
        }
        if wavelengths.windows(2).any(|w| w[1] <= w[0]) {
            return Err(CurveError::NotAscending { name });
        }
        Ok(Self {
            name,
            channel,
            wavelengths,
            values,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn channel(&self) -> Option<Channel> {
        self.channel
    }

    pub fn len(&self) -> usize {
        self.wavelengths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wavelengths.is_empty()
    }

    /// Tabulated wavelength domain `(first, last)` in nanometers.
    pub fn domain(&self) -> (f64, f64) {
        (self.wavelengths[0], *self.wavelengths.last().unwrap())
    }

    pub fn samples(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.wavelengths
            .iter()
            .zip(self.values.iter())
            .map(|(&w, &v)| (w, v))
    }

    /// Build the Akima interpolant for this curve.
    pub fn interpolant(&self) -> AkimaInterpolant {
        AkimaInterpolant::from_points(&self.wavelengths, &self.values)
    }

    /// Serialize as comma-delimited text, one `wavelength,value` row per
    /// sample under a fixed header.
    ///
    /// `f64` formatting uses the shortest round-trippable representation,
    /// so [`SpectralCurve::from_csv`] reproduces the table exactly.
    pub fn to_csv(&self) -> String {
        let mut out = String::from("wavelength_nm,value\n");
        for (w, v) in self.samples() {
            out.push_str(&format!("{w},{v}\n"));
        }
        out
    }

    /// Parse comma-delimited text written by [`SpectralCurve::to_csv`]
    /// (a header row is recognized and skipped).
    pub fn from_csv(
        name: impl Into<String>,
        channel: Option<Channel>,
        text: &str,
    ) -> Result<Self, CurveError> {
        let name = name.into();
        let mut wavelengths = Vec::new();
        let mut values = Vec::new();
        for (index, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if index == 0 && line.starts_with("wavelength") {
                continue;
            }
            let parse = || -> Option<(f64, f64)> {
                let (w, v) = line.split_once(',')?;
                Some((w.trim().parse().ok()?, v.trim().parse().ok()?))
            };
            let (w, v) = parse().ok_or(CurveError::Parse {
                name: name.clone(),
                line: index + 1,
            })?;
            wavelengths.push(w);
            values.push(v);
        }
        Self::from_table(name, channel, wavelengths, values)
    }
}

/// Piecewise-cubic Akima interpolant over a tabulated curve.
///
/// Akima's slope weighting avoids the overshoot of a global cubic spline
/// near abrupt features like filter band edges. Evaluation outside the
/// tabulated domain returns zero signal, never an extrapolation.
#[derive(Debug, Clone)]
pub struct AkimaInterpolant {
    xs: Vec<f64>,
    ys: Vec<f64>,
    /// Per-segment cubic coefficients:
    /// `y(d) = ys[i] + c1[i]·d + c2[i]·d² + c3[i]·d³` with `d = x − xs[i]`.
    c1: Vec<f64>,
    c2: Vec<f64>,
    c3: Vec<f64>,
}

impl AkimaInterpolant {
    /// Build from sample tables. Callers guarantee ascending `xs` with at
    /// least three points; [`SpectralCurve`] enforces this plus the
    /// five-point minimum.
    pub fn from_points(xs: &[f64], ys: &[f64]) -> Self {
        let n = xs.len();
        let segments = n - 1;

        // Segment slopes, extended by two ghost slopes on each side so
        // every point has the four neighbors the Akima weights need.
        let mut m = Vec::with_capacity(segments + 4);
        m.push(0.0);
        m.push(0.0);
        for i in 0..segments {
            m.push((ys[i + 1] - ys[i]) / (xs[i + 1] - xs[i]));
        }
        m[1] = 2.0 * m[2] - m[3];
        m[0] = 2.0 * m[1] - m[2];
        let tail = m[segments + 1];
        let prev = m[segments];
        m.push(2.0 * tail - prev);
        let last = m[segments + 2];
        m.push(2.0 * last - tail);

        // Akima derivative at each point.
        let mut t = Vec::with_capacity(n);
        for i in 0..n {
            // m is offset by 2: slopes around point i are
            // m[i] (i-2), m[i+1] (i-1), m[i+2] (i), m[i+3] (i+1)
            let w1 = (m[i + 3] - m[i + 2]).abs();
            let w2 = (m[i + 1] - m[i]).abs();
            if w1 + w2 > f64::EPSILON {
                t.push((w1 * m[i + 1] + w2 * m[i + 2]) / (w1 + w2));
            } else {
                t.push((m[i + 1] + m[i + 2]) / 2.0);
            }
        }

        let mut c1 = Vec::with_capacity(segments);
        let mut c2 = Vec::with_capacity(segments);
        let mut c3 = Vec::with_capacity(segments);
        for i in 0..segments {
            let h = xs[i + 1] - xs[i];
            let slope = m[i + 2];
            c1.push(t[i]);
            c2.push((3.0 * slope - 2.0 * t[i] - t[i + 1]) / h);
            c3.push((t[i] + t[i + 1] - 2.0 * slope) / (h * h));
        }

        Self {
            xs: xs.to_vec(),
            ys: ys.to_vec(),
            c1,
            c2,
            c3,
        }
    }

    /// Tabulated domain `(first, last)`.
    pub fn domain(&self) -> (f64, f64) {
        (self.xs[0], *self.xs.last().unwrap())
    }

    /// Evaluate at `x`; zero outside the tabulated domain.
    pub fn eval(&self, x: f64) -> f64 {
        let (lo, hi) = self.domain();
        if x < lo || x > hi {
            return 0.0;
        }
        let segment = self
            .xs
            .partition_point(|&xi| xi <= x)
            .saturating_sub(1)
            .min(self.xs.len() - 2);
        let d = x - self.xs[segment];
        self.ys[segment] + self.c1[segment] * d + self.c2[segment] * d * d
            + self.c3[segment] * d * d * d
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn ramp_curve() -> SpectralCurve {
        SpectralCurve::from_table(
            "ramp",
            None,
            vec![400.0, 450.0, 500.0, 550.0, 600.0],
            vec![0.0, 0.25, 0.5, 0.75, 1.0],
        )
        .unwrap()
    }

    #[test]
    fn test_validation_errors() {
        let too_few = SpectralCurve::from_table("f", None, vec![1.0, 2.0], vec![0.0, 1.0]);
        assert!(matches!(too_few, Err(CurveError::TooFewPoints { count: 2, .. })));

        let descending = SpectralCurve::from_table(
            "d",
            None,
            vec![1.0, 3.0, 2.0, 4.0, 5.0],
            vec![0.0; 5],
        );
        assert!(matches!(descending, Err(CurveError::NotAscending { .. })));

        let nan = SpectralCurve::from_table(
            "n",
            None,
            vec![1.0, 2.0, 3.0, 4.0, 5.0],
            vec![0.0, f64::NAN, 0.0, 0.0, 0.0],
        );
        assert!(matches!(nan, Err(CurveError::NonFinite { .. })));

        let mismatch =
            SpectralCurve::from_table("m", None, vec![1.0, 2.0, 3.0, 4.0, 5.0], vec![0.0; 4]);
        assert!(matches!(mismatch, Err(CurveError::LengthMismatch { .. })));
    }

    #[test]
    fn test_interpolation_hits_knots_and_linear_data() {
        let interp = ramp_curve().interpolant();
        // Exact at the knots
        assert_relative_eq!(interp.eval(450.0), 0.25, epsilon = 1e-12);
        assert_relative_eq!(interp.eval(600.0), 1.0, epsilon = 1e-12);
        // Collinear data interpolates linearly
        assert_relative_eq!(interp.eval(475.0), 0.375, epsilon = 1e-9);
        assert_relative_eq!(interp.eval(512.5), 0.5625, epsilon = 1e-9);
    }

    #[test]
    fn test_zero_outside_domain() {
        let interp = ramp_curve().interpolant();
        assert_eq!(interp.eval(399.999), 0.0);
        assert_eq!(interp.eval(600.001), 0.0);
    }

    #[test]
    fn test_csv_round_trip_identity() {
        let curve = SpectralCurve::from_table(
            "Sloan r'",
            Some(Channel::Red),
            vec![540.25, 551.125, 600.0, 671.5, 699.0625, 700.1],
            vec![0.0, 0.871, 0.9035, 0.55, 0.0121, 0.0],
        )
        .unwrap();

        let text = curve.to_csv();
        let back = SpectralCurve::from_csv("Sloan r'", Some(Channel::Red), &text).unwrap();
        assert_eq!(curve, back);
    }

    #[test]
    fn test_csv_parse_error_names_line() {
        let text = "wavelength_nm,value\n400,0.0\nnot-a-number\n";
        let err = SpectralCurve::from_csv("bad", None, text).unwrap_err();
        assert!(matches!(err, CurveError::Parse { line: 3, .. }));
    }
}

//! Point-spread-function models and fitting.
//!
//! A closed set of radial profiles is fit to each detected source with a
//! damped Gauss–Newton loop and the best model kept by minimum residual;
//! no trait objects, just enum dispatch over [`PsfModel`]. The fitted
//! profile sizes a full-width-at-tenth-maximum aperture, and the
//! background-subtracted flux inside it is the source's photometric
//! signal.

use log::trace;
use nalgebra::{DMatrix, DVector, Point2};

use crate::geometry::Rect;
use crate::image_proc::detection::StarCandidate;
use crate::image_proc::ImageStack;

/// Candidate models tried on every source.
pub const MODEL_SET: [PsfModel; 3] = [
    PsfModel::Gaussian,
    PsfModel::Moffat { beta: 4.0 },
    PsfModel::Moffat { beta: 2.5 },
];

/// Signals at or below this are degenerate and unusable for photometry.
pub const MIN_SIGNAL: f64 = 1e-8;

/// Fit iteration cap.
const MAX_FIT_ITERATIONS: usize = 50;

/// Center shift (pixels) below which the fit is considered settled.
const FIT_CONVERGENCE_PX: f64 = 1e-4;

/// A radial PSF profile shape.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PsfModel {
    /// `A·exp(−r²/2σ²)`
    Gaussian,
    /// `A·(1 + r²/σ²)^(−β)`
    Moffat { beta: f64 },
}

impl PsfModel {
    /// Profile value at squared radius `r2` for width parameter `sigma`.
    pub fn profile(&self, r2: f64, sigma: f64) -> f64 {
        let s2 = sigma * sigma;
        match self {
            PsfModel::Gaussian => (-r2 / (2.0 * s2)).exp(),
            PsfModel::Moffat { beta } => (1.0 + r2 / s2).powf(-beta),
        }
    }

    /// Full width at a tenth of maximum for width parameter `sigma`.
    pub fn fwtm(&self, sigma: f64) -> f64 {
        match self {
            PsfModel::Gaussian => 2.0 * sigma * (2.0 * 10.0f64.ln()).sqrt(),
            PsfModel::Moffat { beta } => 2.0 * sigma * (10.0f64.powf(1.0 / beta) - 1.0).sqrt(),
        }
    }
}

/// One fitted PSF.
#[derive(Debug, Clone)]
pub struct PsfFit {
    pub model: PsfModel,
    pub background: f64,
    pub amplitude: f64,
    pub center: Point2<f64>,
    pub sigma: f64,
    /// RMS of the model-minus-data residual over the fit window.
    pub residual: f64,
}

impl PsfFit {
    /// Flux measurement aperture: a square of the model's FWTM centered
    /// on the fitted position.
    pub fn fwtm_rect(&self) -> Rect {
        let half = (self.model.fwtm(self.sigma) / 2.0).ceil() as i64;
        Rect::from_center_radius(self.center, half.max(1))
    }
}

/// A tri-color photometric sample: one physical star measured on all
/// three channels.
#[derive(Debug, Clone)]
pub struct PsfSample {
    pub position: Point2<f64>,
    /// Background-subtracted flux per channel, R/G/B order.
    pub signal: [f64; 3],
    pub fwtm_rect: Rect,
}

impl PsfSample {
    /// All three channel signals finite and non-degenerate.
    pub fn is_usable(&self) -> bool {
        self.signal
            .iter()
            .all(|s| s.is_finite() && *s > MIN_SIGNAL)
    }
}

/// Fit every candidate model to a detected source and keep the best.
///
/// Returns `None` when no model converges to a physically sensible
/// solution (positive amplitude, reasonable width, finite parameters).
pub fn fit_best(stack: &ImageStack, candidate: &StarCandidate) -> Option<PsfFit> {
    let rect = candidate.rect.intersect(&stack.bounds())?;
    if rect.area() < 9 {
        return None;
    }

    let pixels = collect_pixels(stack, candidate.channel, &rect);
    let background = stack.median(candidate.channel, &rect);
    let peak = pixels
        .iter()
        .map(|&(_, _, v)| v)
        .fold(f64::NEG_INFINITY, f64::max);
    let guess = [
        background,
        (peak - background).max(MIN_SIGNAL),
        candidate.centroid.x,
        candidate.centroid.y,
        (rect.width().min(rect.height()) as f64 / 4.0).max(1.0),
    ];

    let mut best: Option<PsfFit> = None;
    for model in MODEL_SET {
        if let Some(fit) = fit_model(model, &pixels, &rect, guess) {
            trace!(
                "psf fit ch{} {:?}: residual {:.4}",
                candidate.channel,
                model,
                fit.residual
            );
            if best.as_ref().map_or(true, |b| fit.residual < b.residual) {
                best = Some(fit);
            }
        }
    }
    best
}

/// Background-subtracted flux inside the fit's FWTM aperture.
pub fn measure_signal(stack: &ImageStack, channel: usize, fit: &PsfFit) -> f64 {
    let rect = match fit.fwtm_rect().intersect(&stack.bounds()) {
        Some(r) => r,
        None => return 0.0,
    };
    let mut sum = 0.0;
    for y in rect.y0..=rect.y1 {
        for x in rect.x0..=rect.x1 {
            sum += stack.sample(channel, x, y) as f64 - fit.background;
        }
    }
    sum
}

fn collect_pixels(stack: &ImageStack, channel: usize, rect: &Rect) -> Vec<(f64, f64, f64)> {
    let mut pixels = Vec::with_capacity(rect.area() as usize);
    for y in rect.y0..=rect.y1 {
        for x in rect.x0..=rect.x1 {
            pixels.push((x as f64, y as f64, stack.sample(channel, x, y) as f64));
        }
    }
    pixels
}

/// Damped Gauss–Newton fit of one model over the window pixels.
///
/// Parameters are `[background, amplitude, x0, y0, sigma]`. The damping
/// factor backs off on any rejected step, so a bad linearization cannot
/// run the solution out of the window.
fn fit_model(
    model: PsfModel,
    pixels: &[(f64, f64, f64)],
    rect: &Rect,
    guess: [f64; 5],
) -> Option<PsfFit> {
    let mut params = guess;
    let mut ssr = sum_squared_residual(model, pixels, &params);
    let mut lambda = 1e-3;

    for _ in 0..MAX_FIT_ITERATIONS {
        let (jtj, jtr) = normal_equations(model, pixels, &params);

        let mut damped = jtj.clone();
        for i in 0..5 {
            damped[(i, i)] *= 1.0 + lambda;
        }
        let delta = match damped.cholesky() {
            Some(chol) => chol.solve(&jtr),
            None => {
                lambda *= 10.0;
                if lambda > 1e8 {
                    return None;
                }
                continue;
            }
        };

        let mut trial = params;
        for i in 0..5 {
            trial[i] += delta[i];
        }
        if trial.iter().any(|p| !p.is_finite()) || trial[4] <= 0.05 {
            lambda *= 10.0;
            if lambda > 1e8 {
                return None;
            }
            continue;
        }

        let trial_ssr = sum_squared_residual(model, pixels, &trial);
        if trial_ssr <= ssr {
            let shift = delta[2].abs().max(delta[3].abs());
            let improved = ssr - trial_ssr;
            params = trial;
            let done = shift < FIT_CONVERGENCE_PX && improved <= 1e-9 * ssr.max(1e-30);
            ssr = trial_ssr;
            lambda = (lambda * 0.5).max(1e-12);
            if done {
                break;
            }
        } else {
            lambda *= 10.0;
            if lambda > 1e8 {
                break;
            }
        }
    }

    let [background, amplitude, x0, y0, sigma] = params;
    let max_extent = rect.width().max(rect.height()) as f64;
    if amplitude <= 0.0 || sigma <= 0.0 || sigma > max_extent {
        return None;
    }
    if !rect.grown(2).contains_point(x0.round() as i64, y0.round() as i64) {
        return None;
    }

    Some(PsfFit {
        model,
        background,
        amplitude,
        center: Point2::new(x0, y0),
        sigma,
        residual: (ssr / pixels.len() as f64).sqrt(),
    })
}

fn model_value(model: PsfModel, params: &[f64; 5], x: f64, y: f64) -> f64 {
    let [b, a, x0, y0, sigma] = *params;
    let r2 = (x - x0) * (x - x0) + (y - y0) * (y - y0);
    b + a * model.profile(r2, sigma)
}

fn sum_squared_residual(model: PsfModel, pixels: &[(f64, f64, f64)], params: &[f64; 5]) -> f64 {
    pixels
        .iter()
        .map(|&(x, y, v)| {
            let r = v - model_value(model, params, x, y);
            r * r
        })
        .sum()
}

/// Accumulate `JᵀJ` and `Jᵀr` for the current parameters.
fn normal_equations(
    model: PsfModel,
    pixels: &[(f64, f64, f64)],
    params: &[f64; 5],
) -> (DMatrix<f64>, DVector<f64>) {
    let [_, a, x0, y0, sigma] = *params;
    let s2 = sigma * sigma;

    let mut jtj = DMatrix::<f64>::zeros(5, 5);
    let mut jtr = DVector::<f64>::zeros(5);

    for &(x, y, v) in pixels {
        let dx = x - x0;
        let dy = y - y0;
        let r2 = dx * dx + dy * dy;
        let profile = model.profile(r2, sigma);

        // ∂(A·profile)/∂ρ with ρ = r²; shared by the position and width
        // derivatives.
        let dprofile_dr2 = match model {
            PsfModel::Gaussian => -profile / (2.0 * s2),
            PsfModel::Moffat { beta } => {
                -beta * (1.0 + r2 / s2).powf(-beta - 1.0) / s2
            }
        };

        let row = [
            1.0,
            profile,
            -2.0 * a * dprofile_dr2 * dx,
            -2.0 * a * dprofile_dr2 * dy,
            -2.0 * a * dprofile_dr2 * r2 / sigma,
        ];
        let residual = v - model_value(model, params, x, y);

        for i in 0..5 {
            jtr[i] += row[i] * residual;
            for j in 0..5 {
                jtj[(i, j)] += row[i] * row[j];
            }
        }
    }

    (jtj, jtr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_proc::detection::DetectionStatus;
    use approx::assert_relative_eq;
    use ndarray::Array3;

    fn gaussian_frame(cx: f64, cy: f64, amplitude: f64, sigma: f64) -> ImageStack {
        let data = Array3::from_shape_fn((1, 48, 48), |(_, y, x)| {
            let dx = x as f64 - cx;
            let dy = y as f64 - cy;
            (50.0 + amplitude * (-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp()) as f32
        });
        ImageStack::from_data(data)
    }

    fn candidate_at(cx: f64, cy: f64) -> StarCandidate {
        StarCandidate {
            channel: 0,
            seed: Point2::new(cx.round(), cy.round()),
            rect: Rect::from_center_radius(Point2::new(cx, cy), 9),
            centroid: Point2::new(cx + 0.3, cy - 0.2),
            status: DetectionStatus::Ok,
        }
    }

    #[test]
    fn test_recovers_gaussian_parameters() {
        let stack = gaussian_frame(23.4, 24.6, 900.0, 1.8);
        let fit = fit_best(&stack, &candidate_at(23.4, 24.6)).expect("fit");

        assert_relative_eq!(fit.center.x, 23.4, epsilon = 0.01);
        assert_relative_eq!(fit.center.y, 24.6, epsilon = 0.01);
        assert_relative_eq!(fit.sigma, 1.8, epsilon = 0.05);
        assert_relative_eq!(fit.amplitude, 900.0, epsilon = 10.0);
        assert_relative_eq!(fit.background, 50.0, epsilon = 2.0);
    }

    #[test]
    fn test_gaussian_data_selects_gaussian_model() {
        let stack = gaussian_frame(24.0, 24.0, 900.0, 1.8);
        let fit = fit_best(&stack, &candidate_at(24.0, 24.0)).expect("fit");
        assert_eq!(fit.model, PsfModel::Gaussian);
    }

    #[test]
    fn test_fwtm_values() {
        // Gaussian FWTM = 2σ√(2 ln 10) ≈ 4.2919σ
        assert_relative_eq!(PsfModel::Gaussian.fwtm(2.0), 8.5839, epsilon = 1e-3);
        // Moffat β=4: 2σ√(10^(1/4) − 1) ≈ 1.7794σ
        assert_relative_eq!(
            PsfModel::Moffat { beta: 4.0 }.fwtm(2.0),
            3.5588,
            epsilon = 1e-3
        );
    }

    #[test]
    fn test_signal_measures_aperture_flux() {
        let amplitude = 900.0;
        let sigma = 1.8;
        let stack = gaussian_frame(24.0, 24.0, amplitude, sigma);
        let fit = fit_best(&stack, &candidate_at(24.0, 24.0)).expect("fit");
        let signal = measure_signal(&stack, 0, &fit);

        // The FWTM square captures most but not all of the total
        // Gaussian volume 2πAσ².
        let total = 2.0 * std::f64::consts::PI * amplitude * sigma * sigma;
        assert!(signal > 0.85 * total, "signal {signal} vs total {total}");
        assert!(signal < 1.05 * total, "signal {signal} vs total {total}");
    }

    #[test]
    fn test_degenerate_sample_rejected() {
        let sample = PsfSample {
            position: Point2::new(0.0, 0.0),
            signal: [10.0, 0.0, 5.0],
            fwtm_rect: Rect::new(0, 0, 4, 4),
        };
        assert!(!sample.is_usable());

        let good = PsfSample {
            signal: [10.0, 8.0, 5.0],
            ..sample
        };
        assert!(good.is_usable());
    }
}

//! Iterative star detection.
//!
//! Starting from a seed pixel, each iteration extracts a square window,
//! subtracts a robust background threshold, and walks the thresholded
//! pixels outward from the brightest one to find the flux-weighted
//! centroid and bounding box of the source. The window re-centers and
//! re-sizes on every pass until the centroid settles to sub-pixel
//! precision.
//!
//! Detection never returns an error: every outcome is a tagged
//! [`DetectionStatus`] the caller must check before trusting the centroid
//! or bounding rectangle.

use log::trace;
use nalgebra::Point2;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::geometry::Rect;
use crate::image_proc::ImageStack;
use crate::stats::{self, MAD_SIGMA};

/// Smallest search window half-width.
pub const MIN_RADIUS: i64 = 5;

/// Largest search window half-width.
pub const MAX_RADIUS: i64 = 127;

/// Centroid iteration cap.
const MAX_ITERATIONS: usize = 10;

/// Centroid movement (per axis, pixels) below which the position is
/// considered settled.
const CONVERGENCE_PX: f64 = 0.005;

/// Aperture growth step cap, guarding degenerate backgrounds that never
/// stop improving.
const MAX_GROWTH_STEPS: usize = 200;

/// Relative median decrease required to accept one aperture growth step.
const GROWTH_MEDIAN_DROP: f64 = 0.01;

/// Outcome of one detection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DetectionStatus {
    /// Initial state, before any detection pass has run.
    NotDetected,
    /// Converged on a source away from the window edges.
    Ok,
    /// The window collapsed to a single level after thresholding; there
    /// is nothing to centroid.
    NoSignificantData,
    /// Converged, but the bounding box is flush against the sampling
    /// window, so part of the source likely lies outside it.
    CrossingEdges,
    /// The seed (or the whole sampling window) falls outside the image.
    OutsideImage,
    /// The centroid failed to settle within the iteration cap.
    NoConvergence,
}

/// A detected (or attempted) stellar source on one channel.
#[derive(Debug, Clone)]
pub struct StarCandidate {
    pub channel: usize,
    pub seed: Point2<f64>,
    /// Bounding rectangle of the thresholded source; after auto-aperture
    /// growth this also covers the local background sampling region.
    pub rect: Rect,
    /// Flux-weighted centroid, sub-pixel.
    pub centroid: Point2<f64>,
    pub status: DetectionStatus,
}

impl StarCandidate {
    fn failed(channel: usize, seed: Point2<f64>, status: DetectionStatus) -> Self {
        Self {
            channel,
            seed,
            rect: Rect::from_center_radius(seed, 0),
            centroid: seed,
            status,
        }
    }
}

/// Detector tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DetectorSettings {
    /// Initial search window half-width in pixels.
    pub initial_radius: i64,
    /// Background threshold in sigma above the window median.
    pub background_sigma: f64,
    /// Grow the bounding rectangle after convergence to adaptively size
    /// the local background region.
    pub auto_aperture: bool,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            initial_radius: 7,
            background_sigma: 1.0,
            auto_aperture: true,
        }
    }
}

/// Run the iterative centroid search from `seed` on one channel.
pub fn detect(
    stack: &ImageStack,
    channel: usize,
    seed: Point2<f64>,
    settings: &DetectorSettings,
) -> StarCandidate {
    if !stack.contains(seed.x.round() as i64, seed.y.round() as i64) {
        return StarCandidate::failed(channel, seed, DetectionStatus::OutsideImage);
    }

    let bounds = stack.bounds();
    let mut position = seed;
    let mut radius = settings.initial_radius.clamp(MIN_RADIUS, MAX_RADIUS);

    for iteration in 0..MAX_ITERATIONS {
        let window_rect = match Rect::from_center_radius(position, radius).intersect(&bounds) {
            Some(r) => r,
            None => return StarCandidate::failed(channel, seed, DetectionStatus::OutsideImage),
        };

        let window = match thresholded_window(stack, channel, &window_rect, settings.background_sigma)
        {
            Some(w) => w,
            None => {
                return StarCandidate::failed(channel, seed, DetectionStatus::NoSignificantData)
            }
        };

        let scan = scan_source(&window);
        let centroid = Point2::new(
            window_rect.x0 as f64 + scan.centroid_x,
            window_rect.y0 as f64 + scan.centroid_y,
        );
        let bbox = Rect::new(
            window_rect.x0 + scan.bbox.x0,
            window_rect.y0 + scan.bbox.y0,
            window_rect.x0 + scan.bbox.x1,
            window_rect.y0 + scan.bbox.y1,
        );
        let next_radius = bbox.width().max(bbox.height()).clamp(MIN_RADIUS, MAX_RADIUS);

        let moved_x = (centroid.x - position.x).abs();
        let moved_y = (centroid.y - position.y).abs();
        trace!(
            "detect ch{} iter {}: centroid ({:.3}, {:.3}) moved ({:.4}, {:.4}) radius {}",
            channel,
            iteration,
            centroid.x,
            centroid.y,
            moved_x,
            moved_y,
            next_radius
        );

        if moved_x < CONVERGENCE_PX && moved_y < CONVERGENCE_PX && next_radius == radius {
            let flush = bbox.x0 <= window_rect.x0
                || bbox.y0 <= window_rect.y0
                || bbox.x1 >= window_rect.x1
                || bbox.y1 >= window_rect.y1;
            if flush {
                return StarCandidate {
                    channel,
                    seed,
                    rect: bbox,
                    centroid,
                    status: DetectionStatus::CrossingEdges,
                };
            }
            let rect = if settings.auto_aperture {
                grow_aperture(stack, channel, bbox, &bounds)
            } else {
                bbox
            };
            return StarCandidate {
                channel,
                seed,
                rect,
                centroid,
                status: DetectionStatus::Ok,
            };
        }

        position = centroid;
        radius = next_radius;
    }

    StarCandidate {
        channel,
        seed,
        rect: Rect::from_center_radius(position, radius),
        centroid: position,
        status: DetectionStatus::NoConvergence,
    }
}

/// Threshold a window at `median + k·sigma` (sigma from the scaled MAD)
/// and rescale the surviving pixels to [0, 1].
///
/// Returns `None` when the window collapses to a single level, i.e. no
/// pixel rises meaningfully above the background cut.
fn thresholded_window(
    stack: &ImageStack,
    channel: usize,
    rect: &Rect,
    background_sigma: f64,
) -> Option<Array2<f64>> {
    let mut window = stack.window(channel, rect);

    let mut values: Vec<f64> = window.iter().copied().collect();
    let median = stats::median_in_place(&mut values);
    let sigma = MAD_SIGMA * stats::mad(window.as_slice().unwrap_or(&values), median);
    let cut = median + background_sigma * sigma;

    let max = window.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let span = max - cut;
    if !(span > f64::EPSILON * max.abs().max(1.0)) {
        return None;
    }

    window.mapv_inplace(|v| if v < cut { 0.0 } else { (v - cut) / span });
    Some(window)
}

struct SourceScan {
    centroid_x: f64,
    centroid_y: f64,
    /// Bounding box in window coordinates.
    bbox: Rect,
}

/// Flood-style scan outward from the brightest pixel, accumulating
/// flux-weighted coordinate sums row by row.
///
/// A row contributes one contiguous non-zero run, found under the column
/// range of the previous row's run and expanded until a zero pixel is hit
/// on each side (4-connected growth approximation). Scanning stops in
/// each direction at the first row with no qualifying pixel.
fn scan_source(window: &Array2<f64>) -> SourceScan {
    let rows = window.dim().0;

    // Brightest pixel; the rescale guarantees exactly one 1.0 maximum.
    let (mut peak_row, mut peak_col) = (0usize, 0usize);
    let mut peak = f64::NEG_INFINITY;
    for ((r, c), &v) in window.indexed_iter() {
        if v > peak {
            peak = v;
            peak_row = r;
            peak_col = c;
        }
    }

    let mut wsum = 0.0;
    let mut xsum = 0.0;
    let mut ysum = 0.0;
    let mut bbox: Option<Rect> = None;

    let mut accumulate = |row: usize, lo: usize, hi: usize| {
        for col in lo..=hi {
            let v = window[[row, col]];
            wsum += v;
            xsum += v * col as f64;
            ysum += v * row as f64;
        }
        let run = Rect::new(lo as i64, row as i64, hi as i64, row as i64);
        bbox = Some(match bbox {
            Some(b) => b.union(&run),
            None => run,
        });
    };

    let seed_run = scan_row(window, peak_row, peak_col, peak_col)
        .unwrap_or((peak_col, peak_col));
    accumulate(peak_row, seed_run.0, seed_run.1);

    // Downward
    let (mut lo, mut hi) = seed_run;
    for row in peak_row + 1..rows {
        match scan_row(window, row, lo, hi) {
            Some((l, h)) => {
                accumulate(row, l, h);
                lo = l;
                hi = h;
            }
            None => break,
        }
    }

    // Upward
    let (mut lo, mut hi) = seed_run;
    for row in (0..peak_row).rev() {
        match scan_row(window, row, lo, hi) {
            Some((l, h)) => {
                accumulate(row, l, h);
                lo = l;
                hi = h;
            }
            None => break,
        }
    }

    let bbox = bbox.unwrap_or_else(|| {
        Rect::new(peak_col as i64, peak_row as i64, peak_col as i64, peak_row as i64)
    });

    SourceScan {
        centroid_x: xsum / wsum,
        centroid_y: ysum / wsum,
        bbox,
    }
}

/// Find the contiguous non-zero run in `row` touching the column range
/// `[lo, hi]` of the previous row, seeded at its brightest pixel.
fn scan_row(window: &Array2<f64>, row: usize, lo: usize, hi: usize) -> Option<(usize, usize)> {
    let cols = window.dim().1;

    let mut seed: Option<usize> = None;
    let mut best = 0.0;
    for col in lo..=hi.min(cols - 1) {
        let v = window[[row, col]];
        if v > best {
            best = v;
            seed = Some(col);
        }
    }
    let seed = seed?;

    let mut left = seed;
    while left > 0 && window[[row, left - 1]] > 0.0 {
        left -= 1;
    }
    let mut right = seed;
    while right + 1 < cols && window[[row, right + 1]] > 0.0 {
        right += 1;
    }
    Some((left, right))
}

/// Grow the bounding rectangle one pixel at a time while the channel
/// median keeps dropping by more than [`GROWTH_MEDIAN_DROP`] per step, to
/// adaptively size the local background sampling region.
fn grow_aperture(stack: &ImageStack, channel: usize, rect: Rect, bounds: &Rect) -> Rect {
    let mut current = rect;
    let mut median = stack.median(channel, &current);

    for _ in 0..MAX_GROWTH_STEPS {
        if median <= 0.0 {
            break;
        }
        let grown = match current.grown(1).intersect(bounds) {
            Some(g) if g != current => g,
            _ => break,
        };
        let grown_median = stack.median(channel, &grown);
        if grown_median < median * (1.0 - GROWTH_MEDIAN_DROP) {
            current = grown;
            median = grown_median;
        } else {
            break;
        }
    }

    current
}

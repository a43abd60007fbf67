//! The color calibration pipeline.
//!
//! One run walks eight stages: validate preconditions, search the
//! reference catalog, measure stars per channel (detector + PSF fit on
//! the worker pool), merge channels, cross-match against the catalog
//! while integrating predicted fluxes, fit the R/G and B/G color ratios
//! with the repeated-median regression, evaluate the white reference,
//! and optionally apply the resulting scale factors to the image.
//!
//! Nothing mutates the image before the final application stage, so any
//! failure up to that point leaves the caller's pixels untouched.

use std::io::Write;

use log::{debug, info, warn};
use nalgebra::Point2;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::astrometry::{AstrometricMapping, AstrometryError, SkyCoord};
use crate::catalog::{self, CatalogError, CatalogService, CatalogStar};
use crate::geometry::Rect;
use crate::image_proc::detection::{self, DetectionStatus, DetectorSettings};
use crate::image_proc::ImageStack;
use crate::parallel::{self, AbortFlag};
use crate::photometry::curve::{AkimaInterpolant, Channel, SpectralCurve};
use crate::photometry::integrate::{
    broadband_flux, narrowband_flux, NarrowbandFilter, DEFAULT_BROADBAND_STEP_NM,
    DEFAULT_NARROWBAND_STEPS,
};
use crate::psf::{self, PsfSample, MIN_SIGNAL};
use crate::spatial::{Bounds, QuadTree};
use crate::stats;
use crate::stats::robust::{self, LinearFit, RegressionError};

/// Per-chunk overhead hint for the photometry fan-out; detection plus a
/// PSF fit is far more expensive than catalog record decoding.
const PHOTOMETRY_OVERHEAD: usize = 8;

/// Default seed for the regression's sampled large-N path.
const DEFAULT_REGRESSION_SEED: u64 = 0x0005_7A2C_A1B2;

/// Filter description for one nominal channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelFilter {
    /// Tabulated transmission curve; the integration band is the
    /// curve's own domain.
    Broadband(SpectralCurve),
    /// Center/bandwidth narrowband filter.
    Narrowband(NarrowbandFilter),
}

impl ChannelFilter {
    /// Two channels defined by identical filter parameters measure the
    /// same light; their photometry is shared and their ratio fit forced
    /// to unity.
    pub fn is_identical(&self, other: &ChannelFilter) -> bool {
        match (self, other) {
            (ChannelFilter::Broadband(a), ChannelFilter::Broadband(b)) => a == b,
            (ChannelFilter::Narrowband(a), ChannelFilter::Narrowband(b)) => a == b,
            _ => false,
        }
    }
}

/// Background neutralization settings for the application stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackgroundSettings {
    /// Region to estimate the background over; `None` samples the whole
    /// image.
    pub region: Option<Rect>,
    /// Sigma-clipping threshold for the per-channel level estimate.
    pub sigma_clip: f64,
    pub clip_rounds: usize,
}

impl Default for BackgroundSettings {
    fn default() -> Self {
        Self {
            region: None,
            sigma_clip: 3.0,
            clip_rounds: 5,
        }
    }
}

/// One calibration run's configuration. Owned by the caller; the
/// orchestrator never mutates it.
#[derive(Debug, Clone)]
pub struct CalibrationSettings {
    /// Detector quantum efficiency curve.
    pub qe_curve: SpectralCurve,
    /// White reference spectrum the factors neutralize against.
    pub white_reference: SpectralCurve,
    /// Per-channel filters, R/G/B order.
    pub filters: [ChannelFilter; 3],
    pub detector: DetectorSettings,
    /// Catalog limiting magnitude; `None` runs the automatic search.
    pub limit_magnitude: Option<f64>,
    /// Target source count for the automatic magnitude search.
    pub target_source_count: usize,
    /// Channel-to-channel match tolerance in pixels.
    pub channel_tolerance_px: f64,
    /// Detection-to-catalog match tolerance in pixels.
    pub match_tolerance_px: f64,
    pub broadband_step_nm: f64,
    pub narrowband_steps: u32,
    /// Divide narrowband integrals by the bandwidth so they stay
    /// comparable with broadband results.
    pub normalize_narrowband: bool,
    pub regression_seed: u64,
    /// Scale the image channels by the computed factors.
    pub apply: bool,
    /// Background neutralization during application.
    pub background: Option<BackgroundSettings>,
}

impl CalibrationSettings {
    /// Settings with pipeline defaults around the mandatory curves.
    pub fn new(
        qe_curve: SpectralCurve,
        white_reference: SpectralCurve,
        filters: [ChannelFilter; 3],
    ) -> Self {
        Self {
            qe_curve,
            white_reference,
            filters,
            detector: DetectorSettings::default(),
            limit_magnitude: None,
            target_source_count: 1000,
            channel_tolerance_px: 2.0,
            match_tolerance_px: 4.0,
            broadband_step_nm: DEFAULT_BROADBAND_STEP_NM,
            narrowband_steps: DEFAULT_NARROWBAND_STEPS,
            normalize_narrowband: true,
            regression_seed: DEFAULT_REGRESSION_SEED,
            apply: true,
            background: None,
        }
    }
}

/// One matched star: predicted and measured per-channel flux.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColorSample {
    pub position: [f64; 2],
    pub sky: SkyCoord,
    /// Integrated catalog flux per channel, R/G/B.
    pub catalog: [f64; 3],
    /// Fitted image signal per channel, R/G/B.
    pub measured: [f64; 3],
}

impl ColorSample {
    /// All six flux values finite and non-degenerate.
    pub fn is_usable(&self) -> bool {
        self.catalog
            .iter()
            .chain(self.measured.iter())
            .all(|v| v.is_finite() && *v > MIN_SIGNAL)
    }

    pub fn catalog_ratio(&self, channel: Channel) -> f64 {
        self.catalog[channel.index()] / self.catalog[Channel::Green.index()]
    }

    pub fn measured_ratio(&self, channel: Channel) -> f64 {
        self.measured[channel.index()] / self.measured[Channel::Green.index()]
    }
}

/// Result of one color-ratio regression.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum RatioFit {
    Fitted(LinearFit),
    /// The channel pair's filters are identical; correction forced to
    /// unity.
    Skipped,
}

impl RatioFit {
    /// Measured ratio the camera would report for a source with the
    /// given catalog ratio.
    pub fn predicted_ratio(&self, catalog_ratio: f64) -> f64 {
        match self {
            RatioFit::Fitted(fit) => fit.evaluate(catalog_ratio),
            RatioFit::Skipped => 1.0,
        }
    }
}

/// What happened at the application stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ApplicationOutcome {
    /// Application was not requested; factors were only computed.
    Skipped,
    Applied,
    /// Calibration succeeded but application was refused before any
    /// pixel was touched.
    Failed { reason: String },
}

/// Everything one calibration run yields.
#[derive(Debug, Clone)]
pub struct CalibrationOutcome {
    /// White-balance scale factors, R/G/B, normalized so the largest is
    /// exactly 1.0.
    pub factors: [f64; 3],
    pub red_green: RatioFit,
    pub blue_green: RatioFit,
    /// Per-channel background levels subtracted during neutralization.
    pub background_reference: Option<[f64; 3]>,
    /// All usable color samples, for diagnostics export.
    pub samples: Vec<ColorSample>,
    pub limit_magnitude: f64,
    pub catalog_sources: usize,
    pub application: ApplicationOutcome,
}

#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("target image has {found} channels; color calibration needs at least 3")]
    MissingChannels { found: usize },

    #[error("target image is empty")]
    EmptyImage,

    #[error("no catalog sources within the search footprint at limit magnitude {limit:.2}")]
    NoCatalogSources { limit: f64 },

    #[error("no stars measured on the {channel} channel")]
    NoStarsDetected { channel: Channel },

    #[error("no stars matched across all three channels")]
    NoMatchedStars,

    #[error("no cross-matches between measured stars and catalog sources")]
    NoCrossMatches,

    #[error("white reference evaluates to a degenerate {channel} flux")]
    WhiteReferenceDegenerate { channel: Channel },

    #[error("calibration aborted")]
    Aborted,

    #[error(transparent)]
    Regression(#[from] RegressionError),

    #[error(transparent)]
    Astrometry(#[from] AstrometryError),

    #[error(transparent)]
    Catalog(CatalogError),
}

impl From<CatalogError> for CalibrationError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::Aborted => CalibrationError::Aborted,
            other => CalibrationError::Catalog(other),
        }
    }
}

/// A filter prepared for integration.
enum PreparedFilter {
    Broadband(AkimaInterpolant),
    Narrowband(NarrowbandFilter),
}

/// One star measured on one channel.
#[derive(Debug, Clone)]
struct ChannelStar {
    position: Point2<f64>,
    signal: f64,
    fwtm_rect: Rect,
}

/// The top-level pipeline over one calibration run.
pub struct Calibrator<'a> {
    settings: CalibrationSettings,
    catalog: &'a dyn CatalogService,
    mapping: &'a dyn AstrometricMapping,
    abort: AbortFlag,
}

impl<'a> Calibrator<'a> {
    pub fn new(
        settings: CalibrationSettings,
        catalog: &'a dyn CatalogService,
        mapping: &'a dyn AstrometricMapping,
    ) -> Self {
        Self {
            settings,
            catalog,
            mapping,
            abort: AbortFlag::new(),
        }
    }

    /// Handle for cancelling this run from another thread. Polled
    /// between stars and chunks, never preemptive.
    pub fn abort_flag(&self) -> AbortFlag {
        self.abort.clone()
    }

    fn ensure_not_aborted(&self) -> Result<(), CalibrationError> {
        if self.abort.is_set() {
            Err(CalibrationError::Aborted)
        } else {
            Ok(())
        }
    }

    /// Run the full pipeline against `image`.
    ///
    /// The image is only written in the final application stage, and
    /// only when `settings.apply` is set; every failure before that
    /// leaves it untouched.
    pub fn run(&self, image: &mut ImageStack) -> Result<CalibrationOutcome, CalibrationError> {
        // 1. Preconditions
        if image.channels() < 3 {
            return Err(CalibrationError::MissingChannels {
                found: image.channels(),
            });
        }
        if image.width() == 0 || image.height() == 0 {
            return Err(CalibrationError::EmptyImage);
        }

        // 2. Catalog search
        let center = self.mapping.image_to_sky(image.bounds().center())?;
        let radius = self.mapping.field_radius_deg();
        let (limit, search) = match self.settings.limit_magnitude {
            Some(limit) => (limit, self.catalog.search(center, radius, limit)?),
            None => catalog::search_with_auto_limit(
                self.catalog,
                center,
                radius,
                self.settings.target_source_count,
            )?,
        };
        info!(
            "catalog search: {} sources at limit magnitude {:.2}",
            search.records.len(),
            limit
        );
        if search.records.is_empty() {
            return Err(CalibrationError::NoCatalogSources { limit });
        }

        let catalog_stars = catalog::decode_stars(&search, self.mapping, &self.abort)?;
        if catalog_stars.is_empty() {
            return Err(CalibrationError::NoCatalogSources { limit });
        }
        self.ensure_not_aborted()?;

        // 3. Per-channel photometry
        let channel_stars = self.measure_channels(image, &catalog_stars)?;
        for channel in Channel::ALL {
            if channel_stars[channel.index()].is_empty() {
                return Err(CalibrationError::NoStarsDetected { channel });
            }
        }

        // 4. Channel merge
        let merged = self.merge_channels(&channel_stars);
        info!("channel merge: {} tri-color stars", merged.len());
        if merged.is_empty() {
            return Err(CalibrationError::NoMatchedStars);
        }
        self.ensure_not_aborted()?;

        // 5. Catalog cross-match + spectral integration
        let qe = self.settings.qe_curve.interpolant();
        let filters = self.prepare_filters();
        let samples = self.cross_match(&merged, &catalog_stars, &qe, &filters);
        info!("catalog cross-match: {} usable color samples", samples.len());
        if samples.is_empty() {
            return Err(CalibrationError::NoCrossMatches);
        }
        self.ensure_not_aborted()?;

        // 6. Outlier-robust ratio fits
        let red_green = self.fit_ratio(&samples, Channel::Red)?;
        let blue_green = self.fit_ratio(&samples, Channel::Blue)?;

        // 7. White reference evaluation
        let white = self.settings.white_reference.interpolant();
        let mut white_flux = [0.0; 3];
        for channel in Channel::ALL {
            let flux = self.predicted_flux(&white, &qe, &filters[channel.index()]);
            if !flux.is_finite() || flux <= MIN_SIGNAL {
                return Err(CalibrationError::WhiteReferenceDegenerate { channel });
            }
            white_flux[channel.index()] = flux;
        }
        let factors = derive_factors(&red_green, &blue_green, &white_flux)?;
        info!(
            "white balance factors: R {:.4}, G {:.4}, B {:.4}",
            factors[0], factors[1], factors[2]
        );

        // 8. Application
        let (application, background_reference) = if self.settings.apply {
            self.apply(image, &factors)
        } else {
            (ApplicationOutcome::Skipped, None)
        };

        Ok(CalibrationOutcome {
            factors,
            red_green,
            blue_green,
            background_reference,
            samples,
            limit_magnitude: limit,
            catalog_sources: catalog_stars.len(),
            application,
        })
    }

    /// Detect and PSF-fit every catalog seed on each channel, reusing a
    /// previous channel's measurements when the filters are identical.
    fn measure_channels(
        &self,
        image: &ImageStack,
        catalog_stars: &[CatalogStar],
    ) -> Result<[Vec<ChannelStar>; 3], CalibrationError> {
        let seeds: Vec<Point2<f64>> = catalog_stars.iter().map(|s| s.image_position).collect();
        let mut channels: [Vec<ChannelStar>; 3] = [Vec::new(), Vec::new(), Vec::new()];

        for channel in Channel::ALL {
            let index = channel.index();
            if let Some(previous) = (0..index).find(|&p| {
                self.settings.filters[p].is_identical(&self.settings.filters[index])
            }) {
                debug!(
                    "channel {}: filters identical to channel {}, reusing photometry",
                    channel, previous
                );
                channels[index] = channels[previous].clone();
                continue;
            }

            let measured = parallel::run_partitioned(
                &seeds,
                |seed| self.measure_star(image, index, *seed),
                PHOTOMETRY_OVERHEAD,
                &self.abort,
            )
            .ok_or(CalibrationError::Aborted)?;

            channels[index] = measured.into_iter().flatten().collect();
            info!(
                "channel {}: {} of {} seeds measured",
                channel,
                channels[index].len(),
                seeds.len()
            );
        }

        Ok(channels)
    }

    /// One star on one channel: detection, best-model PSF fit, aperture
    /// photometry. Any failure drops the star.
    fn measure_star(
        &self,
        image: &ImageStack,
        channel: usize,
        seed: Point2<f64>,
    ) -> Option<ChannelStar> {
        let candidate = detection::detect(image, channel, seed, &self.settings.detector);
        if candidate.status != DetectionStatus::Ok {
            return None;
        }
        let fit = psf::fit_best(image, &candidate)?;
        let signal = psf::measure_signal(image, channel, &fit);
        if !signal.is_finite() || signal <= MIN_SIGNAL {
            return None;
        }
        Some(ChannelStar {
            position: fit.center,
            signal,
            fwtm_rect: fit.fwtm_rect(),
        })
    }

    /// Match green-channel stars against red and blue within the
    /// channel tolerance square; unmatched stars are discarded.
    fn merge_channels(&self, channels: &[Vec<ChannelStar>; 3]) -> Vec<PsfSample> {
        let red_positions: Vec<Point2<f64>> =
            channels[0].iter().map(|s| s.position).collect();
        let blue_positions: Vec<Point2<f64>> =
            channels[2].iter().map(|s| s.position).collect();
        let red_tree = QuadTree::build(&red_positions);
        let blue_tree = QuadTree::build(&blue_positions);

        let tolerance = self.settings.channel_tolerance_px;
        let mut merged = Vec::new();
        for green in &channels[1] {
            let window = Bounds::around(green.position, tolerance);
            let Some(red) = red_tree.nearest_in_rect(green.position, &window) else {
                continue;
            };
            let Some(blue) = blue_tree.nearest_in_rect(green.position, &window) else {
                continue;
            };
            let sample = PsfSample {
                position: green.position,
                signal: [channels[0][red].signal, green.signal, channels[2][blue].signal],
                fwtm_rect: green.fwtm_rect,
            };
            if sample.is_usable() {
                merged.push(sample);
            }
        }
        merged
    }

    fn prepare_filters(&self) -> [PreparedFilter; 3] {
        let prepare = |filter: &ChannelFilter| match filter {
            ChannelFilter::Broadband(curve) => PreparedFilter::Broadband(curve.interpolant()),
            ChannelFilter::Narrowband(nb) => PreparedFilter::Narrowband(*nb),
        };
        [
            prepare(&self.settings.filters[0]),
            prepare(&self.settings.filters[1]),
            prepare(&self.settings.filters[2]),
        ]
    }

    fn predicted_flux(
        &self,
        spectrum: &AkimaInterpolant,
        qe: &AkimaInterpolant,
        filter: &PreparedFilter,
    ) -> f64 {
        match filter {
            PreparedFilter::Broadband(transmission) => {
                broadband_flux(spectrum, qe, transmission, self.settings.broadband_step_nm)
            }
            PreparedFilter::Narrowband(nb) => narrowband_flux(
                spectrum,
                qe,
                nb,
                self.settings.narrowband_steps,
                self.settings.normalize_narrowband,
            ),
        }
    }

    /// Join each merged star with its nearest catalog source and
    /// integrate the catalog spectrum into predicted channel fluxes.
    fn cross_match(
        &self,
        merged: &[PsfSample],
        catalog_stars: &[CatalogStar],
        qe: &AkimaInterpolant,
        filters: &[PreparedFilter; 3],
    ) -> Vec<ColorSample> {
        let positions: Vec<Point2<f64>> =
            catalog_stars.iter().map(|s| s.image_position).collect();
        let tree = QuadTree::build(&positions);
        let tolerance = self.settings.match_tolerance_px;

        let mut samples = Vec::with_capacity(merged.len());
        for star in merged {
            let window = Bounds::around(star.position, tolerance);
            let Some(index) = tree.nearest_in_rect(star.position, &window) else {
                continue;
            };
            let matched = &catalog_stars[index];

            let mut catalog_flux = [0.0; 3];
            for channel in Channel::ALL {
                catalog_flux[channel.index()] =
                    self.predicted_flux(&matched.spectrum, qe, &filters[channel.index()]);
            }

            let sample = ColorSample {
                position: [star.position.x, star.position.y],
                sky: matched.sky_position,
                catalog: catalog_flux,
                measured: star.signal,
            };
            if sample.is_usable() {
                samples.push(sample);
            }
        }
        samples
    }

    /// Robust fit of measured-vs-catalog ratio for one channel against
    /// green, or a forced-unity skip for identical filters.
    fn fit_ratio(
        &self,
        samples: &[ColorSample],
        channel: Channel,
    ) -> Result<RatioFit, CalibrationError> {
        let index = channel.index();
        if self.settings.filters[index].is_identical(&self.settings.filters[Channel::Green.index()])
        {
            debug!("ratio fit {}/G skipped: identical filters", channel);
            return Ok(RatioFit::Skipped);
        }

        let x: Vec<f64> = samples.iter().map(|s| s.catalog_ratio(channel)).collect();
        let y: Vec<f64> = samples.iter().map(|s| s.measured_ratio(channel)).collect();
        let label = format!("{channel}/G");
        let fit = robust::fit_seeded(&x, &y, &label, self.settings.regression_seed)?;
        Ok(RatioFit::Fitted(fit))
    }

    /// Stage 8: scale the channels, then optionally neutralize the
    /// background. The background region is validated before any pixel
    /// is written.
    fn apply(
        &self,
        image: &mut ImageStack,
        factors: &[f64; 3],
    ) -> (ApplicationOutcome, Option<[f64; 3]>) {
        let neutralization = match &self.settings.background {
            Some(settings) => {
                let requested = settings.region.unwrap_or_else(|| image.bounds());
                match requested.intersect(&image.bounds()) {
                    Some(region) if region.area() >= 16 => Some((region, settings)),
                    _ => {
                        warn!("background region {requested:?} invalid; image left untouched");
                        return (
                            ApplicationOutcome::Failed {
                                reason: format!("background reference region {requested:?} is invalid"),
                            },
                            None,
                        );
                    }
                }
            }
            None => None,
        };

        for channel in Channel::ALL {
            image.scale_channel(channel.index(), factors[channel.index()]);
        }

        let mut background_reference = None;
        if let Some((region, settings)) = neutralization {
            let mut levels = [0.0; 3];
            for channel in Channel::ALL {
                let values = image.rect_values(channel.index(), &region);
                let (level, _) =
                    stats::sigma_clipped(&values, settings.sigma_clip, settings.clip_rounds);
                levels[channel.index()] = level;
                image.offset_channel(channel.index(), -level);
            }
            debug!(
                "background neutralization: R {:.5}, G {:.5}, B {:.5}",
                levels[0], levels[1], levels[2]
            );

            // Renormalize only when subtraction-plus-scaling pushed the
            // stack over full scale.
            let max = image.max_sample() as f64;
            if max > 1.0 {
                for channel in 0..image.channels() {
                    image.scale_channel(channel, 1.0 / max);
                }
            }
            background_reference = Some(levels);
        }

        (ApplicationOutcome::Applied, background_reference)
    }
}

/// Correction factors from the fitted ratio relations and the white
/// reference fluxes, normalized so the largest factor is 1.0.
fn derive_factors(
    red_green: &RatioFit,
    blue_green: &RatioFit,
    white_flux: &[f64; 3],
) -> Result<[f64; 3], CalibrationError> {
    let white_rg = white_flux[0] / white_flux[1];
    let white_bg = white_flux[2] / white_flux[1];

    let predicted_rg = red_green.predicted_ratio(white_rg);
    let predicted_bg = blue_green.predicted_ratio(white_bg);
    if !(predicted_rg > MIN_SIGNAL) || !predicted_rg.is_finite() {
        return Err(CalibrationError::WhiteReferenceDegenerate {
            channel: Channel::Red,
        });
    }
    if !(predicted_bg > MIN_SIGNAL) || !predicted_bg.is_finite() {
        return Err(CalibrationError::WhiteReferenceDegenerate {
            channel: Channel::Blue,
        });
    }

    let mut factors = [1.0 / predicted_rg, 1.0, 1.0 / predicted_bg];
    let largest = factors.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    for f in &mut factors {
        *f /= largest;
    }
    Ok(factors)
}

/// Export the color sample table as delimited text for diagnostics.
pub fn write_diagnostics_csv<W: Write>(
    samples: &[ColorSample],
    writer: &mut W,
) -> std::io::Result<()> {
    writeln!(
        writer,
        "x,y,sky_lon,sky_lat,cat_R,cat_G,cat_B,measured_R,measured_G,measured_B,\
         cat_R/G,cat_B/G,measured_R/G,measured_B/G"
    )?;
    for s in samples {
        writeln!(
            writer,
            "{},{},{},{},{},{},{},{},{},{},{},{},{},{}",
            s.position[0],
            s.position[1],
            s.sky.ra_deg,
            s.sky.dec_deg,
            s.catalog[0],
            s.catalog[1],
            s.catalog[2],
            s.measured[0],
            s.measured[1],
            s.measured[2],
            s.catalog_ratio(Channel::Red),
            s.catalog_ratio(Channel::Blue),
            s.measured_ratio(Channel::Red),
            s.measured_ratio(Channel::Blue),
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample(catalog: [f64; 3], measured: [f64; 3]) -> ColorSample {
        ColorSample {
            position: [10.0, 20.0],
            sky: SkyCoord {
                ra_deg: 1.0,
                dec_deg: 2.0,
            },
            catalog,
            measured,
        }
    }

    #[test]
    fn test_color_sample_usability() {
        assert!(sample([1.0, 2.0, 3.0], [4.0, 5.0, 6.0]).is_usable());
        assert!(!sample([1.0, 0.0, 3.0], [4.0, 5.0, 6.0]).is_usable());
        assert!(!sample([1.0, 2.0, 3.0], [4.0, f64::NAN, 6.0]).is_usable());
    }

    #[test]
    fn test_ratios() {
        let s = sample([2.0, 4.0, 1.0], [3.0, 6.0, 9.0]);
        assert_relative_eq!(s.catalog_ratio(Channel::Red), 0.5);
        assert_relative_eq!(s.catalog_ratio(Channel::Blue), 0.25);
        assert_relative_eq!(s.measured_ratio(Channel::Red), 0.5);
        assert_relative_eq!(s.measured_ratio(Channel::Blue), 1.5);
    }

    #[test]
    fn test_derive_factors_normalizes_largest_to_one() {
        // Camera measures R/G at 0.8x the catalog ratio and B/G at 1.25x
        let red_green = RatioFit::Fitted(LinearFit {
            intercept: 0.0,
            slope: 0.8,
            scale_deviation: 0.0,
        });
        let blue_green = RatioFit::Fitted(LinearFit {
            intercept: 0.0,
            slope: 1.25,
            scale_deviation: 0.0,
        });
        let factors = derive_factors(&red_green, &blue_green, &[1.0, 1.0, 1.0]).unwrap();

        let largest = factors.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        assert_relative_eq!(largest, 1.0, epsilon = 1e-12);
        // R is under-measured so gets the largest boost
        assert_relative_eq!(factors[0], 1.0, epsilon = 1e-12);
        assert_relative_eq!(factors[1], 0.8, epsilon = 1e-12);
        assert_relative_eq!(factors[2], 0.8 / 1.25, epsilon = 1e-12);
    }

    #[test]
    fn test_derive_factors_skipped_pair_is_unity() {
        let blue_green = RatioFit::Fitted(LinearFit {
            intercept: 0.0,
            slope: 2.0,
            scale_deviation: 0.0,
        });
        let factors =
            derive_factors(&RatioFit::Skipped, &blue_green, &[1.0, 1.0, 1.0]).unwrap();
        assert_relative_eq!(factors[0], 1.0, epsilon = 1e-12);
        assert_relative_eq!(factors[1], 1.0, epsilon = 1e-12);
        assert_relative_eq!(factors[2], 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_derive_factors_rejects_degenerate_prediction() {
        let negative = RatioFit::Fitted(LinearFit {
            intercept: -2.0,
            slope: 0.1,
            scale_deviation: 0.0,
        });
        let err = derive_factors(&negative, &RatioFit::Skipped, &[1.0, 1.0, 1.0]).unwrap_err();
        assert!(matches!(
            err,
            CalibrationError::WhiteReferenceDegenerate {
                channel: Channel::Red
            }
        ));
    }

    #[test]
    fn test_diagnostics_csv_shape() {
        let samples = vec![sample([2.0, 4.0, 1.0], [3.0, 6.0, 9.0])];
        let mut out = Vec::new();
        write_diagnostics_csv(&samples, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let mut lines = text.lines();

        let header = lines.next().unwrap();
        assert_eq!(header.split(',').count(), 14);
        assert!(header.starts_with("x,y,sky_lon,sky_lat"));

        let row = lines.next().unwrap();
        assert_eq!(row.split(',').count(), 14);
        assert!(row.starts_with("10,20,1,2,"));
        assert!(lines.next().is_none());
    }

    #[test]
    fn test_identical_filters() {
        let nb = |c, b| {
            ChannelFilter::Narrowband(NarrowbandFilter {
                center_nm: c,
                bandwidth_nm: b,
            })
        };
        assert!(nb(656.3, 3.0).is_identical(&nb(656.3, 3.0)));
        assert!(!nb(656.3, 3.0).is_identical(&nb(500.7, 3.0)));

        let curve = SpectralCurve::from_table(
            "L",
            None,
            vec![400.0, 450.0, 500.0, 550.0, 600.0],
            vec![0.0, 0.9, 0.9, 0.9, 0.0],
        )
        .unwrap();
        assert!(ChannelFilter::Broadband(curve.clone())
            .is_identical(&ChannelFilter::Broadband(curve.clone())));
        assert!(!ChannelFilter::Broadband(curve).is_identical(&nb(656.3, 3.0)));
    }
}

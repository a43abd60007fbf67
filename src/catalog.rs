//! Spectrophotometric reference catalog interface.
//!
//! The catalog database format and transport are external; this module
//! defines the record shapes the engine consumes, the automatic
//! limiting-magnitude search, and the decoding of raw records into
//! in-image catalog stars (projection plus spectrum interpolant), which
//! fans out over the worker pool for large search results.

use log::{debug, warn};
use nalgebra::Point2;
use thiserror::Error;

use crate::astrometry::{AstrometricMapping, SkyCoord};
use crate::parallel::{self, AbortFlag};
use crate::photometry::curve::{AkimaInterpolant, MIN_POINTS};

/// Relative deviation from the target source count accepted by the
/// automatic limiting-magnitude search.
pub const MAGNITUDE_TOLERANCE: f64 = 0.125;

/// Magnitude bracket explored by the automatic search.
const MAGNITUDE_RANGE: (f64, f64) = (4.0, 30.0);

/// Bisection step cap for the automatic search.
const MAX_MAGNITUDE_STEPS: usize = 24;

/// Per-chunk overhead hint for parallel record decoding.
const DECODE_OVERHEAD: usize = 64;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog service failure: {0}")]
    Service(String),

    #[error("catalog spectrum grid has {count} points, need at least {MIN_POINTS}")]
    SpectrumGrid { count: usize },

    #[error("catalog spectrum grid wavelengths must be strictly ascending")]
    GridNotAscending,

    #[error("catalog decoding aborted")]
    Aborted,
}

/// One raw catalog source: sky position, magnitude, and spectral fluxes
/// on the catalog's shared wavelength grid.
#[derive(Debug, Clone)]
pub struct CatalogRecord {
    pub position: SkyCoord,
    pub magnitude: f64,
    pub fluxes: Vec<f64>,
}

/// Result of one catalog search. The wavelength grid is fixed per
/// catalog and delivered once per run.
#[derive(Debug, Clone)]
pub struct CatalogSearchResult {
    pub wavelengths_nm: Vec<f64>,
    pub records: Vec<CatalogRecord>,
}

/// External catalog service boundary. `Sync` so a borrowed service can
/// sit inside the orchestrator while its photometry stages fan out over
/// the worker pool.
pub trait CatalogService: Sync {
    /// All sources within `radius_deg` of `center` brighter than
    /// `limit_magnitude`.
    fn search(
        &self,
        center: SkyCoord,
        radius_deg: f64,
        limit_magnitude: f64,
    ) -> Result<CatalogSearchResult, CatalogError>;
}

/// A catalog source decoded for one calibration run: projected image
/// position plus spectrum interpolant.
#[derive(Debug, Clone)]
pub struct CatalogStar {
    pub image_position: Point2<f64>,
    pub sky_position: SkyCoord,
    pub spectrum: AkimaInterpolant,
}

/// Bisection-like search for the limiting magnitude yielding close to
/// `target` sources.
///
/// Returns the limit actually used together with its search result.
/// When the bracket never lands within ±[`MAGNITUDE_TOLERANCE`] of the
/// target, the closest result seen is returned.
pub fn search_with_auto_limit(
    service: &dyn CatalogService,
    center: SkyCoord,
    radius_deg: f64,
    target: usize,
) -> Result<(f64, CatalogSearchResult), CatalogError> {
    let (mut shallow, mut deep) = MAGNITUDE_RANGE;
    let mut best: Option<(usize, f64, CatalogSearchResult)> = None;

    for step in 0..MAX_MAGNITUDE_STEPS {
        let limit = (shallow + deep) / 2.0;
        let result = service.search(center, radius_deg, limit)?;
        let count = result.records.len();
        debug!(
            "auto magnitude step {}: limit {:.3} -> {} sources (target {})",
            step, limit, count, target
        );

        let deviation = count.abs_diff(target);
        if (deviation as f64) <= MAGNITUDE_TOLERANCE * target as f64 {
            return Ok((limit, result));
        }
        if best
            .as_ref()
            .map_or(true, |(best_dev, _, _)| deviation < *best_dev)
        {
            best = Some((deviation, limit, result));
        }

        if count < target {
            // Too few sources: push the limit fainter
            shallow = limit;
        } else {
            deep = limit;
        }
    }

    let (deviation, limit, result) = best.expect("at least one search step ran");
    warn!(
        "auto magnitude search did not converge; using limit {:.3} ({} off target {})",
        limit, deviation, target
    );
    Ok((limit, result))
}

/// Decode raw records into [`CatalogStar`]s for this run.
///
/// Projection failures and malformed records drop the individual star;
/// only a bad shared wavelength grid fails the whole decode. Runs on the
/// worker pool for large search results.
pub fn decode_stars(
    result: &CatalogSearchResult,
    mapping: &dyn AstrometricMapping,
    abort: &AbortFlag,
) -> Result<Vec<CatalogStar>, CatalogError> {
    let grid = &result.wavelengths_nm;
    if grid.len() < MIN_POINTS {
        return Err(CatalogError::SpectrumGrid { count: grid.len() });
    }
    if grid.windows(2).any(|w| w[1] <= w[0]) {
        return Err(CatalogError::GridNotAscending);
    }

    let decoded = parallel::run_partitioned(
        &result.records,
        |record| -> Option<CatalogStar> {
            if record.fluxes.len() != grid.len() {
                return None;
            }
            let image_position = mapping.sky_to_image(record.position).ok()?;
            Some(CatalogStar {
                image_position,
                sky_position: record.position,
                spectrum: AkimaInterpolant::from_points(grid, &record.fluxes),
            })
        },
        DECODE_OVERHEAD,
        abort,
    )
    .ok_or(CatalogError::Aborted)?;

    let stars: Vec<CatalogStar> = decoded.into_iter().flatten().collect();
    let dropped = result.records.len() - stars.len();
    if dropped > 0 {
        debug!("catalog decode dropped {dropped} of {} records", result.records.len());
    }
    Ok(stars)
}

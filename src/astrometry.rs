//! Narrow interface to the astrometric solution.
//!
//! Plate solving itself is an external service; the calibration engine
//! only needs the pixel ↔ sky transform and the angular size of the
//! solved field. The [`TangentPlane`] gnomonic mapping implements the
//! trait for synthetic fields and tests.

use nalgebra::Point2;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Equatorial sky coordinate in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SkyCoord {
    pub ra_deg: f64,
    pub dec_deg: f64,
}

#[derive(Debug, Error)]
pub enum AstrometryError {
    #[error("sky position (RA {ra_deg:.4}°, Dec {dec_deg:.4}°) falls outside the solved field")]
    OutsideField { ra_deg: f64, dec_deg: f64 },

    #[error("pixel ({x:.1}, {y:.1}) falls outside the solved field")]
    OutsidePixel { x: f64, y: f64 },
}

/// Pixel ↔ sky transform of one solved image.
pub trait AstrometricMapping: Sync {
    fn image_to_sky(&self, pixel: Point2<f64>) -> Result<SkyCoord, AstrometryError>;

    /// Project a sky coordinate onto the image; fails when the point
    /// does not land on the solved field.
    fn sky_to_image(&self, coord: SkyCoord) -> Result<Point2<f64>, AstrometryError>;

    /// Angular radius (degrees) of a circle covering the solved field,
    /// used to size catalog searches.
    fn field_radius_deg(&self) -> f64;
}

/// Gnomonic (tangent-plane) projection around a field center.
///
/// Good to well under a pixel for the few-degree fields this engine
/// works with; distortion correction belongs to the external solver.
#[derive(Debug, Clone)]
pub struct TangentPlane {
    pub center: SkyCoord,
    /// Plate scale in degrees per pixel.
    pub pixel_scale_deg: f64,
    pub width: usize,
    pub height: usize,
}

impl TangentPlane {
    pub fn new(center: SkyCoord, pixel_scale_deg: f64, width: usize, height: usize) -> Self {
        Self {
            center,
            pixel_scale_deg,
            width,
            height,
        }
    }

    fn center_pixel(&self) -> (f64, f64) {
        (
            (self.width as f64 - 1.0) / 2.0,
            (self.height as f64 - 1.0) / 2.0,
        )
    }
}

impl AstrometricMapping for TangentPlane {
    fn image_to_sky(&self, pixel: Point2<f64>) -> Result<SkyCoord, AstrometryError> {
        if pixel.x < 0.0
            || pixel.y < 0.0
            || pixel.x > self.width as f64 - 1.0
            || pixel.y > self.height as f64 - 1.0
        {
            return Err(AstrometryError::OutsidePixel {
                x: pixel.x,
                y: pixel.y,
            });
        }

        let (cx, cy) = self.center_pixel();
        let scale = self.pixel_scale_deg.to_radians();
        // Standard coordinates: ξ east, η north; image y grows downward.
        let xi = (pixel.x - cx) * scale;
        let eta = -(pixel.y - cy) * scale;

        let ra0 = self.center.ra_deg.to_radians();
        let dec0 = self.center.dec_deg.to_radians();
        let (sin_d0, cos_d0) = dec0.sin_cos();

        let denom = cos_d0 - eta * sin_d0;
        let ra = ra0 + xi.atan2(denom);
        let dec = ((sin_d0 + eta * cos_d0) / (1.0 + xi * xi + eta * eta).sqrt()).asin();

        Ok(SkyCoord {
            ra_deg: ra.to_degrees().rem_euclid(360.0),
            dec_deg: dec.to_degrees(),
        })
    }

    fn sky_to_image(&self, coord: SkyCoord) -> Result<Point2<f64>, AstrometryError> {
        let ra0 = self.center.ra_deg.to_radians();
        let dec0 = self.center.dec_deg.to_radians();
        let ra = coord.ra_deg.to_radians();
        let dec = coord.dec_deg.to_radians();
        let (sin_d0, cos_d0) = dec0.sin_cos();
        let (sin_d, cos_d) = dec.sin_cos();
        let delta_ra = ra - ra0;

        let cos_c = sin_d0 * sin_d + cos_d0 * cos_d * delta_ra.cos();
        if cos_c <= 0.0 {
            // Opposite hemisphere: not projectable onto the tangent plane
            return Err(AstrometryError::OutsideField {
                ra_deg: coord.ra_deg,
                dec_deg: coord.dec_deg,
            });
        }

        let xi = cos_d * delta_ra.sin() / cos_c;
        let eta = (cos_d0 * sin_d - sin_d0 * cos_d * delta_ra.cos()) / cos_c;

        let (cx, cy) = self.center_pixel();
        let scale = self.pixel_scale_deg.to_radians();
        let x = cx + xi / scale;
        let y = cy - eta / scale;

        if x < 0.0 || y < 0.0 || x > self.width as f64 - 1.0 || y > self.height as f64 - 1.0 {
            return Err(AstrometryError::OutsideField {
                ra_deg: coord.ra_deg,
                dec_deg: coord.dec_deg,
            });
        }

        Ok(Point2::new(x, y))
    }

    fn field_radius_deg(&self) -> f64 {
        let (cx, cy) = self.center_pixel();
        (cx * cx + cy * cy).sqrt() * self.pixel_scale_deg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn mapping() -> TangentPlane {
        TangentPlane::new(
            SkyCoord {
                ra_deg: 83.6,
                dec_deg: 22.0,
            },
            // 2 arcsec/px over a 1024² field: ~0.57° across
            2.0 / 3600.0,
            1024,
            1024,
        )
    }

    #[test]
    fn test_round_trip_center_and_offsets() {
        let map = mapping();
        for &(x, y) in &[(511.5, 511.5), (100.0, 200.0), (1000.0, 50.0), (0.0, 1023.0)] {
            let sky = map.image_to_sky(Point2::new(x, y)).unwrap();
            let back = map.sky_to_image(sky).unwrap();
            assert_relative_eq!(back.x, x, epsilon = 1e-6);
            assert_relative_eq!(back.y, y, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_center_maps_to_field_center() {
        let map = mapping();
        let sky = map.image_to_sky(Point2::new(511.5, 511.5)).unwrap();
        assert_relative_eq!(sky.ra_deg, 83.6, epsilon = 1e-9);
        assert_relative_eq!(sky.dec_deg, 22.0, epsilon = 1e-9);
    }

    #[test]
    fn test_off_field_projection_fails() {
        let map = mapping();
        let far = SkyCoord {
            ra_deg: 120.0,
            dec_deg: -40.0,
        };
        assert!(matches!(
            map.sky_to_image(far),
            Err(AstrometryError::OutsideField { .. })
        ));
    }

    #[test]
    fn test_out_of_bounds_pixel_fails() {
        let map = mapping();
        assert!(map.image_to_sky(Point2::new(-1.0, 10.0)).is_err());
        assert!(map.image_to_sky(Point2::new(10.0, 2000.0)).is_err());
    }

    #[test]
    fn test_field_radius_covers_corners() {
        let map = mapping();
        let corner_sky = map.image_to_sky(Point2::new(0.0, 0.0)).unwrap();
        let center_sky = map.image_to_sky(Point2::new(511.5, 511.5)).unwrap();
        // Rough angular separation check at small angles
        let d_ra = (corner_sky.ra_deg - center_sky.ra_deg)
            * center_sky.dec_deg.to_radians().cos();
        let d_dec = corner_sky.dec_deg - center_sky.dec_deg;
        let separation = (d_ra * d_ra + d_dec * d_dec).sqrt();
        assert!(separation <= map.field_radius_deg() * 1.001);
    }
}

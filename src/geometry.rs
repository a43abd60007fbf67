//! Integer rectangles for image sub-regions.
//!
//! Detection windows, PSF flux apertures and background regions are all
//! axis-aligned rectangles with inclusive bounds in image (x, y) coordinates.

use nalgebra::Point2;
use serde::{Deserialize, Serialize};

/// Axis-aligned rectangle with inclusive integer bounds.
///
/// Coordinates are signed so that a window centered near an image border can
/// be constructed first and clamped to the image afterwards with
/// [`Rect::intersect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    /// Left edge (inclusive)
    pub x0: i64,
    /// Top edge (inclusive)
    pub y0: i64,
    /// Right edge (inclusive)
    pub x1: i64,
    /// Bottom edge (inclusive)
    pub y1: i64,
}

impl Rect {
    /// Create a rectangle from explicit inclusive bounds.
    pub fn new(x0: i64, y0: i64, x1: i64, y1: i64) -> Self {
        Self { x0, y0, x1, y1 }
    }

    /// Square window of half-width `radius` centered on the pixel containing
    /// `center`.
    pub fn from_center_radius(center: Point2<f64>, radius: i64) -> Self {
        let cx = center.x.round() as i64;
        let cy = center.y.round() as i64;
        Self {
            x0: cx - radius,
            y0: cy - radius,
            x1: cx + radius,
            y1: cy + radius,
        }
    }

    /// Width in pixels (inclusive bounds).
    pub fn width(&self) -> i64 {
        self.x1 - self.x0 + 1
    }

    /// Height in pixels (inclusive bounds).
    pub fn height(&self) -> i64 {
        self.y1 - self.y0 + 1
    }

    /// Number of pixels covered.
    pub fn area(&self) -> i64 {
        self.width() * self.height()
    }

    pub fn is_valid(&self) -> bool {
        self.x0 <= self.x1 && self.y0 <= self.y1
    }

    /// Geometric center in floating-point pixel coordinates.
    pub fn center(&self) -> Point2<f64> {
        Point2::new(
            (self.x0 + self.x1) as f64 / 2.0,
            (self.y0 + self.y1) as f64 / 2.0,
        )
    }

    /// Rectangle grown by `amount` pixels in every direction.
    pub fn grown(&self, amount: i64) -> Self {
        Self {
            x0: self.x0 - amount,
            y0: self.y0 - amount,
            x1: self.x1 + amount,
            y1: self.y1 + amount,
        }
    }

    /// Intersection with another rectangle, or `None` when disjoint.
    pub fn intersect(&self, other: &Rect) -> Option<Rect> {
        let r = Rect {
            x0: self.x0.max(other.x0),
            y0: self.y0.max(other.y0),
            x1: self.x1.min(other.x1),
            y1: self.y1.min(other.y1),
        };
        r.is_valid().then_some(r)
    }

    pub fn contains_point(&self, x: i64, y: i64) -> bool {
        x >= self.x0 && x <= self.x1 && y >= self.y0 && y <= self.y1
    }

    /// Smallest rectangle containing both inputs.
    pub fn union(&self, other: &Rect) -> Rect {
        Rect {
            x0: self.x0.min(other.x0),
            y0: self.y0.min(other.y0),
            x1: self.x1.max(other.x1),
            y1: self.y1.max(other.y1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dimensions() {
        let r = Rect::new(10, 20, 19, 24);
        assert_eq!(r.width(), 10);
        assert_eq!(r.height(), 5);
        assert_eq!(r.area(), 50);
        assert!(r.is_valid());
    }

    #[test]
    fn test_from_center_radius() {
        let r = Rect::from_center_radius(Point2::new(50.4, 60.6), 5);
        assert_eq!(r, Rect::new(45, 56, 55, 66));
        assert_eq!(r.center(), Point2::new(50.0, 61.0));
    }

    #[test]
    fn test_intersect() {
        let a = Rect::new(0, 0, 10, 10);
        let b = Rect::new(5, 5, 20, 20);
        assert_eq!(a.intersect(&b), Some(Rect::new(5, 5, 10, 10)));

        let c = Rect::new(11, 11, 12, 12);
        assert_eq!(a.intersect(&c), None);
    }

    #[test]
    fn test_grown_and_union() {
        let r = Rect::new(5, 5, 10, 10);
        assert_eq!(r.grown(2), Rect::new(3, 3, 12, 12));

        let other = Rect::new(8, 0, 15, 7);
        assert_eq!(r.union(&other), Rect::new(5, 0, 15, 10));
    }

    #[test]
    fn test_contains_point() {
        let r = Rect::new(-2, -2, 2, 2);
        assert!(r.contains_point(-2, -2));
        assert!(r.contains_point(2, 2));
        assert!(!r.contains_point(3, 0));
    }
}

//! Multi-channel pixel buffer.
//!
//! Images are stored as `channels × height × width` arrays of `f32`
//! samples, indexed `[[channel, y, x]]`. The calibration pipeline only
//! reads pixel data until the final application step, which uses the
//! channel scale/offset write path at the bottom of this module.

use ndarray::{Array2, Array3, ArrayView2, ArrayViewMut2};

use crate::geometry::Rect;
use crate::stats;

/// A stack of equally-sized image channels.
#[derive(Debug, Clone)]
pub struct ImageStack {
    data: Array3<f32>,
}

impl ImageStack {
    /// Zero-filled stack.
    pub fn new(channels: usize, height: usize, width: usize) -> Self {
        Self {
            data: Array3::zeros((channels, height, width)),
        }
    }

    /// Wrap an existing `channels × height × width` array.
    pub fn from_data(data: Array3<f32>) -> Self {
        Self { data }
    }

    pub fn channels(&self) -> usize {
        self.data.dim().0
    }

    pub fn height(&self) -> usize {
        self.data.dim().1
    }

    pub fn width(&self) -> usize {
        self.data.dim().2
    }

    /// Full image bounds as an inclusive rectangle.
    pub fn bounds(&self) -> Rect {
        Rect::new(0, 0, self.width() as i64 - 1, self.height() as i64 - 1)
    }

    pub fn contains(&self, x: i64, y: i64) -> bool {
        x >= 0 && y >= 0 && x < self.width() as i64 && y < self.height() as i64
    }

    /// Sample one pixel. Panics when out of bounds; use [`contains`] first
    /// for positions that may fall outside.
    ///
    /// [`contains`]: ImageStack::contains
    pub fn sample(&self, channel: usize, x: i64, y: i64) -> f32 {
        self.data[[channel, y as usize, x as usize]]
    }

    pub fn channel_view(&self, channel: usize) -> ArrayView2<'_, f32> {
        self.data.index_axis(ndarray::Axis(0), channel)
    }

    pub fn channel_view_mut(&mut self, channel: usize) -> ArrayViewMut2<'_, f32> {
        self.data.index_axis_mut(ndarray::Axis(0), channel)
    }

    /// Copy a sub-window of one channel into an `f64` working array.
    ///
    /// `rect` must lie inside the image; intersect with [`bounds`] first.
    ///
    /// [`bounds`]: ImageStack::bounds
    pub fn window(&self, channel: usize, rect: &Rect) -> Array2<f64> {
        let view = self.channel_view(channel);
        Array2::from_shape_fn(
            (rect.height() as usize, rect.width() as usize),
            |(wy, wx)| view[[(rect.y0 + wy as i64) as usize, (rect.x0 + wx as i64) as usize]] as f64,
        )
    }

    /// Channel samples over a rectangle as a flat vector.
    pub fn rect_values(&self, channel: usize, rect: &Rect) -> Vec<f64> {
        self.window(channel, rect).into_iter().collect()
    }

    /// Median of one channel over a rectangle.
    pub fn median(&self, channel: usize, rect: &Rect) -> f64 {
        let mut values = self.rect_values(channel, rect);
        stats::median_in_place(&mut values)
    }

    /// Median absolute deviation about `center` over a rectangle.
    pub fn mad(&self, channel: usize, rect: &Rect, center: f64) -> f64 {
        stats::mad(&self.rect_values(channel, rect), center)
    }

    /// Largest sample across all channels.
    pub fn max_sample(&self) -> f32 {
        self.data.iter().copied().fold(f32::NEG_INFINITY, f32::max)
    }

    /// Multiply every sample of one channel by `factor`.
    pub fn scale_channel(&mut self, channel: usize, factor: f64) {
        self.channel_view_mut(channel)
            .mapv_inplace(|v| (v as f64 * factor) as f32);
    }

    /// Add `delta` to every sample of one channel.
    pub fn offset_channel(&mut self, channel: usize, delta: f64) {
        self.channel_view_mut(channel)
            .mapv_inplace(|v| (v as f64 + delta) as f32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn ramp_stack() -> ImageStack {
        // One channel, 4x4, values 0..16 row-major
        let data = Array3::from_shape_fn((1, 4, 4), |(_, y, x)| (y * 4 + x) as f32);
        ImageStack::from_data(data)
    }

    #[test]
    fn test_bounds_and_contains() {
        let stack = ramp_stack();
        assert_eq!(stack.bounds(), Rect::new(0, 0, 3, 3));
        assert!(stack.contains(0, 0));
        assert!(stack.contains(3, 3));
        assert!(!stack.contains(4, 0));
        assert!(!stack.contains(-1, 2));
    }

    #[test]
    fn test_window_extraction() {
        let stack = ramp_stack();
        let w = stack.window(0, &Rect::new(1, 1, 2, 2));
        assert_eq!(w.dim(), (2, 2));
        assert_relative_eq!(w[[0, 0]], 5.0);
        assert_relative_eq!(w[[1, 1]], 10.0);
    }

    #[test]
    fn test_rect_median_and_mad() {
        let stack = ramp_stack();
        let full = stack.bounds();
        assert_relative_eq!(stack.median(0, &full), 7.5);
        assert_relative_eq!(stack.mad(0, &full, 7.5), 4.0);
    }

    #[test]
    fn test_scale_and_offset() {
        let mut stack = ramp_stack();
        stack.scale_channel(0, 2.0);
        assert_relative_eq!(stack.sample(0, 3, 3), 30.0);
        stack.offset_channel(0, -10.0);
        assert_relative_eq!(stack.sample(0, 3, 3), 20.0);
        assert_relative_eq!(stack.max_sample(), 20.0);
    }
}

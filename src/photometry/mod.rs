//! Spectral curves and band integration.
//!
//! Filter transmissions, detector quantum efficiency, catalog source
//! spectra and white references are all tabulated wavelength → value
//! curves, evaluated through piecewise-cubic Akima interpolation and
//! integrated over wavelength bands with composite Simpson's rule.

pub mod curve;
pub mod integrate;

pub use curve::{AkimaInterpolant, Channel, CurveError, SpectralCurve};
pub use integrate::{broadband_flux, integrate_band, narrowband_flux, NarrowbandFilter};

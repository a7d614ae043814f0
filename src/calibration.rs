//! Calibrator scaling.
//!
//! The calibrator drives the rack through an amplifier, so a calibrator output of
//! `x` native volts produces roughly `a * x + b` volts on the rack. Setpoints are
//! converted back with [`ScalingCoefficients::to_native`] and clamped to the
//! calibrator's `[0, 10]` V input range.
//!
//! Coefficients come from a least-squares fit over recorded `(native, measured)`
//! pairs, see [`fit`] and the `calibrate` subcommand.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{AppResult, RackError};

/// Lower bound of the calibrator input range, in native volts.
pub const NATIVE_MIN: f64 = 0.0;
/// Upper bound of the calibrator input range, in native volts.
pub const NATIVE_MAX: f64 = 10.0;

/// Affine transform between calibrator output and rack voltage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScalingCoefficients {
    /// Rack volts per native volt.
    pub a: f64,
    /// Rack voltage at zero native output.
    pub b: f64,
}

impl Default for ScalingCoefficients {
    fn default() -> Self {
        Self { a: 350.0, b: 0.0 }
    }
}

impl ScalingCoefficients {
    /// Rack voltage → calibrator native units, clamped to the calibrator range.
    pub fn to_native(&self, voltage: f64) -> f64 {
        ((voltage - self.b) / self.a).clamp(NATIVE_MIN, NATIVE_MAX)
    }

    /// Calibrator native units → expected rack voltage.
    pub fn to_rack(&self, native: f64) -> f64 {
        self.a * native + self.b
    }

    /// Rejects coefficients that cannot be inverted.
    pub fn validate(&self) -> AppResult<()> {
        if !(self.a.is_finite() && self.a != 0.0 && self.b.is_finite()) {
            return Err(RackError::Configuration(format!(
                "scaling coefficients must be finite with a != 0, got a={} b={}",
                self.a, self.b
            )));
        }
        Ok(())
    }
}

/// One recorded calibration point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationPoint {
    /// Calibrator output, native volts.
    pub native: f64,
    /// Rack voltage measured after settling.
    pub measured: f64,
}

/// Least-squares line `measured = a * native + b`.
pub fn fit(points: &[CalibrationPoint]) -> AppResult<ScalingCoefficients> {
    if points.len() < 2 {
        return Err(RackError::Calibration(format!(
            "need at least 2 points, got {}",
            points.len()
        )));
    }

    let n = points.len() as f64;
    let mean_x = points.iter().map(|p| p.native).sum::<f64>() / n;
    let mean_y = points.iter().map(|p| p.measured).sum::<f64>() / n;

    let (sxy, sxx) = points.iter().fold((0.0, 0.0), |(sxy, sxx), p| {
        let dx = p.native - mean_x;
        (sxy + dx * (p.measured - mean_y), sxx + dx * dx)
    });

    if sxx == 0.0 {
        return Err(RackError::Calibration(
            "all points share the same native input".to_string(),
        ));
    }

    let a = sxy / sxx;
    let coefficients = ScalingCoefficients {
        a,
        b: mean_y - a * mean_x,
    };
    coefficients
        .validate()
        .map_err(|e| RackError::Calibration(e.to_string()))?;
    Ok(coefficients)
}

/// Reads points from a CSV file with a `native,measured` header.
pub fn load_points<P: AsRef<Path>>(path: P) -> AppResult<Vec<CalibrationPoint>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path.as_ref())?;
    let points = reader
        .deserialize()
        .collect::<Result<Vec<CalibrationPoint>, csv::Error>>()?;
    Ok(points)
}

/// Renders coefficients as a config snippet.
pub fn to_toml_snippet(coefficients: &ScalingCoefficients) -> String {
    format!(
        "[hardware.real.scaling]\na = {:?}\nb = {:?}\n",
        coefficients.a, coefficients.b
    )
}

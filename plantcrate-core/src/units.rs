//! Length units and model-to-physical scale conversion

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Physical length units, metric and imperial
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LengthUnit {
    Kilometers,
    Meters,
    Centimeters,
    Millimeters,
    Micrometers,
    Miles,
    Feet,
    Inches,
    Thou,
}

impl LengthUnit {
    /// Length of one unit in meters
    pub fn meters(self) -> f64 {
        match self {
            LengthUnit::Kilometers => 1000.0,
            LengthUnit::Meters => 1.0,
            LengthUnit::Centimeters => 0.01,
            LengthUnit::Millimeters => 0.001,
            LengthUnit::Micrometers => 0.000001,
            LengthUnit::Miles => 1609.344,
            LengthUnit::Feet => 0.3048,
            LengthUnit::Inches => 0.0254,
            LengthUnit::Thou => 0.0000254,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            LengthUnit::Kilometers => "km",
            LengthUnit::Meters => "m",
            LengthUnit::Centimeters => "cm",
            LengthUnit::Millimeters => "mm",
            LengthUnit::Micrometers => "µm",
            LengthUnit::Miles => "mi",
            LengthUnit::Feet => "'",
            LengthUnit::Inches => "\"",
            LengthUnit::Thou => "thou",
        }
    }

    /// Convert a length expressed in `self` into `target`
    pub fn convert(self, value: f64, target: LengthUnit) -> f64 {
        value * self.meters() / target.meters()
    }
}

/// Scale factor from model units to a physical length unit.
///
/// Lengths scale by `factor`, areas by `factor²` and volumes by `factor³`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeasurementScale {
    /// Physical units per model unit
    pub factor: f64,
    /// Unit of the physical values
    pub unit: LengthUnit,
}

impl MeasurementScale {
    pub fn new(factor: f64, unit: LengthUnit) -> Result<Self> {
        if !factor.is_finite() || factor <= 0.0 {
            return Err(Error::InvalidParameter(format!(
                "scale factor must be finite and positive, got {}",
                factor
            )));
        }
        Ok(Self { factor, unit })
    }

    /// Identity scale: model units are reported as-is in meters
    pub fn unit_meters() -> Self {
        Self {
            factor: 1.0,
            unit: LengthUnit::Meters,
        }
    }

    /// Derive the scale from a reference object of known size.
    ///
    /// `model_length` is the reference measured in the scan, `real_length_m` its
    /// true size in meters, and `unit` the unit results should be reported in.
    pub fn from_reference(model_length: f64, real_length_m: f64, unit: LengthUnit) -> Result<Self> {
        if !model_length.is_finite() || model_length <= 0.0 {
            return Err(Error::InvalidParameter(format!(
                "reference model length must be finite and positive, got {}",
                model_length
            )));
        }
        if !real_length_m.is_finite() || real_length_m <= 0.0 {
            return Err(Error::InvalidParameter(format!(
                "reference real length must be finite and positive, got {}",
                real_length_m
            )));
        }
        Self::new(real_length_m / model_length / unit.meters(), unit)
    }

    pub fn length(&self, model_length: f64) -> f64 {
        model_length * self.factor
    }

    pub fn area(&self, model_area: f64) -> f64 {
        model_area * self.factor * self.factor
    }

    pub fn volume(&self, model_volume: f64) -> f64 {
        model_volume * self.factor.powi(3)
    }
}

impl Default for MeasurementScale {
    fn default() -> Self {
        Self::unit_meters()
    }
}

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};

use crate::error::{ProductError, Result};

/// Semantic axis of a variable dimension.
///
/// Every dimension of a variable is tagged with one of these types. All
/// variables in a product that use the same non-independent dimension type
/// share the same length along that axis. `Independent` marks axes whose
/// positions carry no cross-variable meaning (e.g. polygon vertices), so
/// they are never coupled through the product dimension table.
#[derive(
    Display,
    EnumString,
    EnumIter,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DimensionType {
    Time,
    Vertical,
    Spectral,
    Latitude,
    Longitude,
    Independent,
}

impl DimensionType {
    /// All dimension types that participate in the product dimension table.
    pub const COUPLED: [DimensionType; 5] = [
        DimensionType::Time,
        DimensionType::Vertical,
        DimensionType::Spectral,
        DimensionType::Latitude,
        DimensionType::Longitude,
    ];

    pub fn is_independent(self) -> bool {
        self == DimensionType::Independent
    }
}

/// Storage type of a variable's data buffer.
#[derive(
    Display, EnumString, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Int8,
    Int16,
    Int32,
    Float,
    #[default]
    Double,
    #[strum(serialize = "string")]
    #[serde(rename = "string")]
    Str,
}

impl DataType {
    pub fn is_numeric(self) -> bool {
        self != DataType::Str
    }

    pub fn is_integer(self) -> bool {
        matches!(self, DataType::Int8 | DataType::Int16 | DataType::Int32)
    }

    pub fn is_float(self) -> bool {
        matches!(self, DataType::Float | DataType::Double)
    }
}

/// A single typed value, used for valid ranges and fill values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scalar {
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Float(f32),
    Double(f64),
}

impl Scalar {
    pub fn data_type(&self) -> DataType {
        match self {
            Scalar::Int8(_) => DataType::Int8,
            Scalar::Int16(_) => DataType::Int16,
            Scalar::Int32(_) => DataType::Int32,
            Scalar::Float(_) => DataType::Float,
            Scalar::Double(_) => DataType::Double,
        }
    }

    /// Widen to `f64` for comparisons against filter thresholds.
    pub fn as_f64(&self) -> f64 {
        match *self {
            Scalar::Int8(v) => v as f64,
            Scalar::Int16(v) => v as f64,
            Scalar::Int32(v) => v as f64,
            Scalar::Float(v) => v as f64,
            Scalar::Double(v) => v,
        }
    }

    /// Construct a scalar of `data_type` from an `f64` value, saturating
    /// integer types at their bounds.
    pub fn from_f64(data_type: DataType, value: f64) -> Result<Self> {
        match data_type {
            DataType::Int8 => Ok(Scalar::Int8(value.clamp(i8::MIN as f64, i8::MAX as f64) as i8)),
            DataType::Int16 => Ok(Scalar::Int16(
                value.clamp(i16::MIN as f64, i16::MAX as f64) as i16
            )),
            DataType::Int32 => Ok(Scalar::Int32(
                value.clamp(i32::MIN as f64, i32::MAX as f64) as i32
            )),
            DataType::Float => Ok(Scalar::Float(value as f32)),
            DataType::Double => Ok(Scalar::Double(value)),
            DataType::Str => Err(ProductError::invalid_type(
                "cannot construct a string scalar from a numeric value",
            )),
        }
    }

    /// The smallest representable value for a numeric data type.
    pub fn type_min(data_type: DataType) -> Result<Self> {
        match data_type {
            DataType::Int8 => Ok(Scalar::Int8(i8::MIN)),
            DataType::Int16 => Ok(Scalar::Int16(i16::MIN)),
            DataType::Int32 => Ok(Scalar::Int32(i32::MIN)),
            DataType::Float => Ok(Scalar::Float(f32::NEG_INFINITY)),
            DataType::Double => Ok(Scalar::Double(f64::NEG_INFINITY)),
            DataType::Str => Err(ProductError::invalid_type("string type has no minimum")),
        }
    }

    /// The largest representable value for a numeric data type.
    pub fn type_max(data_type: DataType) -> Result<Self> {
        match data_type {
            DataType::Int8 => Ok(Scalar::Int8(i8::MAX)),
            DataType::Int16 => Ok(Scalar::Int16(i16::MAX)),
            DataType::Int32 => Ok(Scalar::Int32(i32::MAX)),
            DataType::Float => Ok(Scalar::Float(f32::INFINITY)),
            DataType::Double => Ok(Scalar::Double(f64::INFINITY)),
            DataType::Str => Err(ProductError::invalid_type("string type has no maximum")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn dimension_type_round_trips_through_strings() {
        assert_eq!(DimensionType::Time.to_string(), "time");
        assert_eq!(
            DimensionType::from_str("vertical").unwrap(),
            DimensionType::Vertical
        );
        assert!(DimensionType::from_str("sideways").is_err());
    }

    #[test]
    fn data_type_classification() {
        assert!(DataType::Int16.is_integer());
        assert!(DataType::Double.is_float());
        assert!(!DataType::Str.is_numeric());
        assert_eq!(DataType::Str.to_string(), "string");
    }

    #[test]
    fn scalar_widens_to_f64() {
        assert_eq!(Scalar::Int8(-5).as_f64(), -5.0);
        assert_eq!(Scalar::Double(2.5).as_f64(), 2.5);
    }

    #[test]
    fn scalar_from_f64_saturates_integers() {
        assert_eq!(
            Scalar::from_f64(DataType::Int8, 300.0).unwrap(),
            Scalar::Int8(i8::MAX)
        );
        assert!(Scalar::from_f64(DataType::Str, 1.0).is_err());
    }
}

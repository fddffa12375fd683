//! Unit comparison and conversion.
//!
//! Filter thresholds may carry a unit that differs from the unit of the
//! variable they apply to; in that case a converter is composed ahead of
//! the comparison. The registry resolves unit names to a linear transform
//! (scale and offset) against a per-quantity base unit. Unknown units or
//! conversions across quantities fail predicate construction.

use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;

use crate::error::{PipelineError, Result};

/// Physical quantity a unit measures. Conversion is only defined within
/// one quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Quantity {
    Angle,
    Length,
    Pressure,
    Temperature,
    Time,
    Frequency,
    Fraction,
}

#[derive(Debug, Clone, Copy)]
struct UnitDef {
    quantity: Quantity,
    /// base_value = value * scale + offset
    scale: f64,
    offset: f64,
}

static UNIT_TABLE: Lazy<FxHashMap<&'static str, UnitDef>> = Lazy::new(|| {
    let mut table = FxHashMap::default();
    let mut add = |names: &[&'static str], quantity, scale, offset| {
        for &name in names {
            table.insert(name, UnitDef { quantity, scale, offset });
        }
    };

    // Angles; latitude/longitude flavours are plain degrees.
    add(
        &["degree", "deg", "degree_north", "degree_east"],
        Quantity::Angle,
        1.0,
        0.0,
    );
    add(&["rad", "radian"], Quantity::Angle, 180.0 / std::f64::consts::PI, 0.0);

    // Lengths, base metre.
    add(&["m", "metre", "meter"], Quantity::Length, 1.0, 0.0);
    add(&["km"], Quantity::Length, 1000.0, 0.0);
    add(&["cm"], Quantity::Length, 0.01, 0.0);
    add(&["mm"], Quantity::Length, 0.001, 0.0);

    // Pressure, base pascal.
    add(&["Pa"], Quantity::Pressure, 1.0, 0.0);
    add(&["hPa", "mbar"], Quantity::Pressure, 100.0, 0.0);
    add(&["bar"], Quantity::Pressure, 100000.0, 0.0);

    // Temperature, base kelvin.
    add(&["K", "kelvin"], Quantity::Temperature, 1.0, 0.0);
    add(&["degC", "celsius"], Quantity::Temperature, 1.0, 273.15);

    // Time, base second.
    add(&["s", "second"], Quantity::Time, 1.0, 0.0);
    add(&["minute"], Quantity::Time, 60.0, 0.0);
    add(&["h", "hour"], Quantity::Time, 3600.0, 0.0);
    add(&["day"], Quantity::Time, 86400.0, 0.0);

    // Frequency, base hertz.
    add(&["Hz"], Quantity::Frequency, 1.0, 0.0);
    add(&["kHz"], Quantity::Frequency, 1e3, 0.0);
    add(&["MHz"], Quantity::Frequency, 1e6, 0.0);
    add(&["GHz"], Quantity::Frequency, 1e9, 0.0);

    // Dimensionless fractions and mixing ratios.
    add(&["1", ""], Quantity::Fraction, 1.0, 0.0);
    add(&["%", "percent"], Quantity::Fraction, 0.01, 0.0);
    add(&["ppm", "ppmv"], Quantity::Fraction, 1e-6, 0.0);
    add(&["ppb", "ppbv"], Quantity::Fraction, 1e-9, 0.0);

    table
});

fn lookup(unit: &str) -> Result<UnitDef> {
    UNIT_TABLE
        .get(unit)
        .copied()
        .ok_or_else(|| PipelineError::invalid_argument(format!("unknown unit '{unit}'")))
}

/// Whether two unit names denote the same physical scale, so that values
/// may be compared without conversion.
pub fn units_compatible(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    match (lookup(a), lookup(b)) {
        (Ok(da), Ok(db)) => {
            da.quantity == db.quantity && da.scale == db.scale && da.offset == db.offset
        }
        _ => false,
    }
}

/// A composed linear conversion from one unit to another.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnitConverter {
    scale: f64,
    offset: f64,
}

impl UnitConverter {
    /// Build a converter. Fails when either unit is unknown or the units
    /// measure different quantities.
    pub fn new(from: &str, to: &str) -> Result<Self> {
        let from_def = lookup(from)?;
        let to_def = lookup(to)?;
        if from_def.quantity != to_def.quantity {
            return Err(PipelineError::invalid_argument(format!(
                "cannot convert from '{from}' to '{to}'"
            )));
        }
        // value_to = (value_from * s_f + o_f - o_t) / s_t
        Ok(UnitConverter {
            scale: from_def.scale / to_def.scale,
            offset: (from_def.offset - to_def.offset) / to_def.scale,
        })
    }

    /// A converter that passes values through unchanged.
    pub fn identity() -> Self {
        UnitConverter { scale: 1.0, offset: 0.0 }
    }

    pub fn apply(&self, value: f64) -> f64 {
        value * self.scale + self.offset
    }

    pub fn apply_slice(&self, values: &mut [f64]) {
        for value in values {
            *value = *value * self.scale + self.offset;
        }
    }
}

/// Convert every element of a numeric variable to a new unit in place.
pub fn convert_variable_unit(
    variable: &mut tropo_product::Variable,
    target_unit: &str,
) -> Result<()> {
    let source_unit = variable.unit.clone().ok_or_else(|| {
        PipelineError::invalid_argument(format!(
            "variable '{}' has no unit to convert from",
            variable.name
        ))
    })?;
    if source_unit == target_unit {
        return Ok(());
    }
    let converter = UnitConverter::new(&source_unit, target_unit)?;
    for i in 0..variable.num_elements() {
        let value = variable.data.get_f64(i)?;
        variable.data.set_f64(i, converter.apply(value))?;
    }
    if let Some(min) = variable.valid_min {
        variable.valid_min = Some(tropo_product::Scalar::from_f64(
            variable.data_type(),
            converter.apply(min.as_f64()),
        )?);
    }
    if let Some(max) = variable.valid_max {
        variable.valid_max = Some(tropo_product::Scalar::from_f64(
            variable.data_type(),
            converter.apply(max.as_f64()),
        )?);
    }
    variable.unit = Some(target_unit.to_string());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn km_to_m() {
        let converter = UnitConverter::new("km", "m").unwrap();
        assert_relative_eq!(converter.apply(1.2), 1200.0);
    }

    #[test]
    fn celsius_to_kelvin_has_offset() {
        let converter = UnitConverter::new("degC", "K").unwrap();
        assert_relative_eq!(converter.apply(0.0), 273.15);
        let back = UnitConverter::new("K", "degC").unwrap();
        assert_relative_eq!(back.apply(273.15), 0.0);
    }

    #[test]
    fn cross_quantity_conversion_fails() {
        assert!(UnitConverter::new("km", "K").is_err());
        assert!(UnitConverter::new("parsec", "m").is_err());
    }

    #[test]
    fn latitude_and_longitude_degrees_are_compatible() {
        assert!(units_compatible("degree_north", "degree"));
        assert!(units_compatible("degree_east", "degree"));
        assert!(!units_compatible("degree", "rad"));
    }
}

//! Variable derivation.
//!
//! Filters and operations ask for variables in a canonical form (name,
//! data type, unit, dimension types). A derived variable is produced from
//! the product without mutating it: an existing variable is copied and
//! converted, a scalar is broadcast along time, and a missing `index` is
//! synthesized as the row enumeration. The `derive` operation uses the
//! same machinery to add or convert variables in place.

use tropo_product::{ArrayData, DataType, DimensionType, Product, Variable};

use crate::error::{PipelineError, Result};
use crate::units::convert_variable_unit;

/// Produce a copy of the named variable in the requested form.
///
/// Fails with `invalid_argument` when the variable is missing and cannot
/// be synthesized, or when its dimensions cannot be reconciled with the
/// request.
pub fn derived_variable(
    product: &Product,
    name: &str,
    data_type: DataType,
    unit: Option<&str>,
    dimensions: &[DimensionType],
) -> Result<Variable> {
    if let Ok(variable) = product.variable(name) {
        let mut copy = variable.clone();
        let have: Vec<DimensionType> = copy.dims.iter().map(|&(d, _)| d).collect();
        if have != dimensions {
            // A variable missing only the leading time axis is broadcast.
            if dimensions.first() == Some(&DimensionType::Time)
                && have.as_slice() == &dimensions[1..]
            {
                let time_length = product.dimension(DimensionType::Time).ok_or_else(|| {
                    PipelineError::invalid_argument(
                        "product has no time dimension to broadcast along",
                    )
                })?;
                copy.prepend_dimension(DimensionType::Time, time_length)?;
            } else {
                return Err(PipelineError::invalid_argument(format!(
                    "variable '{name}' does not have the required dimensions"
                )));
            }
        }
        if let Some(unit) = unit {
            if copy.unit.is_some() && !copy.unit.as_deref().is_some_and(|u| u == unit) {
                convert_variable_unit(&mut copy, unit)?;
            } else if copy.unit.is_none() {
                // An undeclared unit is taken to already be canonical.
                copy.unit = Some(unit.to_string());
            }
        }
        copy.convert_data_type(data_type)?;
        return Ok(copy);
    }

    // Synthesizable variables.
    if name == "index" && dimensions == [DimensionType::Time] {
        let time_length = product.dimension(DimensionType::Time).ok_or_else(|| {
            PipelineError::invalid_argument("product has no time dimension to enumerate")
        })?;
        let mut variable = Variable::with_data(
            "index",
            vec![(DimensionType::Time, time_length)],
            ArrayData::Int32((0..time_length as i32).collect()),
        )?;
        variable.convert_data_type(data_type)?;
        return Ok(variable);
    }

    Err(PipelineError::invalid_argument(format!(
        "variable '{name}' is not present and cannot be derived"
    )))
}

/// Execute a `derive` operation.
///
/// Without dimensions only unit and/or data type conversion is performed
/// on the existing variable. With dimensions, a missing variable is
/// derived and added; an existing one is replaced by its converted form.
pub fn execute_derive(
    product: &mut Product,
    name: &str,
    data_type: Option<DataType>,
    dimensions: Option<&[DimensionType]>,
    unit: Option<&str>,
) -> Result<()> {
    let Some(dimensions) = dimensions else {
        // Conversion-only form: the variable must already be there.
        if !product.has_variable(name) {
            return Err(PipelineError::operation(format!(
                "cannot convert non-existent variable '{name}'"
            )));
        }
        let variable = product.variable_mut(name)?;
        if let Some(unit) = unit {
            if variable.unit.as_deref() != Some(unit) {
                convert_variable_unit(variable, unit)?;
            }
        }
        if let Some(data_type) = data_type {
            variable.convert_data_type(data_type)?;
        }
        return Ok(());
    };

    let data_type = data_type.unwrap_or_else(|| {
        product
            .variable(name)
            .map(|v| v.data_type())
            .unwrap_or(DataType::Double)
    });
    let variable = derived_variable(product, name, data_type, unit, dimensions)?;
    if product.has_variable(name) {
        product.replace_variable(variable)?;
    } else {
        product.add_variable(variable)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product_with_time(time: usize) -> Product {
        let mut product = Product::new();
        product
            .add_variable(
                Variable::with_data(
                    "t",
                    vec![(DimensionType::Time, time)],
                    ArrayData::Double((0..time).map(|i| i as f64).collect()),
                )
                .unwrap(),
            )
            .unwrap();
        product
    }

    #[test]
    fn scalar_latitude_broadcasts_to_time() {
        let mut product = product_with_time(3);
        product
            .add_variable(
                Variable::scalar("latitude", ArrayData::Double(vec![52.0]))
                    .unwrap()
                    .with_unit("degree_north"),
            )
            .unwrap();

        let derived = derived_variable(
            &product,
            "latitude",
            DataType::Double,
            Some("degree_north"),
            &[DimensionType::Time],
        )
        .unwrap();
        assert_eq!(derived.data, ArrayData::Double(vec![52.0, 52.0, 52.0]));
    }

    #[test]
    fn index_is_synthesized() {
        let product = product_with_time(4);
        let derived = derived_variable(
            &product,
            "index",
            DataType::Int32,
            None,
            &[DimensionType::Time],
        )
        .unwrap();
        assert_eq!(derived.data, ArrayData::Int32(vec![0, 1, 2, 3]));
    }

    #[test]
    fn missing_variable_is_invalid_argument() {
        let product = product_with_time(2);
        let error = derived_variable(
            &product,
            "latitude",
            DataType::Double,
            None,
            &[DimensionType::Time],
        )
        .unwrap_err();
        assert!(matches!(error, PipelineError::InvalidArgument { .. }));
    }

    #[test]
    fn conversion_only_derive_preserves_shape() {
        let mut product = Product::new();
        product
            .add_variable(
                Variable::with_data(
                    "altitude",
                    vec![(DimensionType::Vertical, 2)],
                    ArrayData::Double(vec![1000.0, 2000.0]),
                )
                .unwrap()
                .with_unit("m"),
            )
            .unwrap();

        execute_derive(&mut product, "altitude", None, None, Some("km")).unwrap();
        let altitude = product.variable("altitude").unwrap();
        assert_eq!(altitude.data, ArrayData::Double(vec![1.0, 2.0]));
        assert_eq!(altitude.unit.as_deref(), Some("km"));
        assert_eq!(altitude.dims, vec![(DimensionType::Vertical, 2)]);
    }

    #[test]
    fn derive_with_dimensions_adds_the_variable() {
        let mut product = product_with_time(3);
        execute_derive(
            &mut product,
            "index",
            Some(DataType::Int32),
            Some(&[DimensionType::Time]),
            None,
        )
        .unwrap();
        assert_eq!(
            product.variable("index").unwrap().data,
            ArrayData::Int32(vec![0, 1, 2])
        );
    }
}

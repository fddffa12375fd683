//! Named, typed, shaped arrays — the building block of a product.

use serde::{Deserialize, Serialize};

use crate::array::ArrayData;
use crate::datatype::{DataType, DimensionType, Scalar};
use crate::error::{ProductError, Result};

/// Maximum number of dimensions a variable may carry.
pub const MAX_NUM_DIMS: usize = 8;

/// A typed multi-dimensional array with an ordered dimension list.
///
/// The data buffer is flat and row-major; its length always equals the
/// product of the dimension lengths (1 for scalars). Optional metadata
/// carries the unit, valid range, an enumeration that maps integer values
/// to names, and a free-form description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    /// Ordered (dimension type, length) pairs; empty for scalars.
    pub dims: Vec<(DimensionType, usize)>,
    pub data: ArrayData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_min: Option<Scalar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_max: Option<Scalar>,
    /// Enumeration names: integer value `i` maps to `enum_names[i]`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enum_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Variable {
    /// Create a variable with a null-filled buffer of the right size.
    pub fn new(
        name: impl Into<String>,
        data_type: DataType,
        dims: Vec<(DimensionType, usize)>,
    ) -> Result<Self> {
        let name = name.into();
        if dims.len() > MAX_NUM_DIMS {
            return Err(ProductError::invalid(format!(
                "variable '{}' has {} dimensions; at most {} are supported",
                name,
                dims.len(),
                MAX_NUM_DIMS
            )));
        }
        let num_elements: usize = dims.iter().map(|(_, n)| n).product();
        Ok(Variable {
            data: ArrayData::null(data_type, num_elements),
            name,
            dims,
            unit: None,
            valid_min: None,
            valid_max: None,
            enum_names: Vec::new(),
            description: None,
        })
    }

    /// Create a variable from an existing buffer, verifying the shape.
    pub fn with_data(
        name: impl Into<String>,
        dims: Vec<(DimensionType, usize)>,
        data: ArrayData,
    ) -> Result<Self> {
        let name = name.into();
        if dims.len() > MAX_NUM_DIMS {
            return Err(ProductError::invalid(format!(
                "variable '{}' has {} dimensions; at most {} are supported",
                name,
                dims.len(),
                MAX_NUM_DIMS
            )));
        }
        let expected: usize = dims.iter().map(|(_, n)| n).product();
        if data.len() != expected {
            return Err(ProductError::InvalidShape {
                name,
                actual: data.len(),
                expected,
            });
        }
        Ok(Variable {
            name,
            dims,
            data,
            unit: None,
            valid_min: None,
            valid_max: None,
            enum_names: Vec::new(),
            description: None,
        })
    }

    /// Create a 0-dimensional variable holding a single element.
    pub fn scalar(name: impl Into<String>, data: ArrayData) -> Result<Self> {
        let name = name.into();
        if data.len() != 1 {
            return Err(ProductError::InvalidShape {
                name,
                actual: data.len(),
                expected: 1,
            });
        }
        Ok(Variable {
            name,
            dims: Vec::new(),
            data,
            unit: None,
            valid_min: None,
            valid_max: None,
            enum_names: Vec::new(),
            description: None,
        })
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn with_valid_range(mut self, min: Scalar, max: Scalar) -> Self {
        self.valid_min = Some(min);
        self.valid_max = Some(max);
        self
    }

    pub fn with_enumeration(mut self, names: Vec<String>) -> Self {
        self.enum_names = names;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn data_type(&self) -> DataType {
        self.data.data_type()
    }

    pub fn num_dims(&self) -> usize {
        self.dims.len()
    }

    pub fn num_elements(&self) -> usize {
        self.data.len()
    }

    pub fn dimension_length(&self, axis: usize) -> usize {
        self.dims[axis].1
    }

    pub fn dimension_type(&self, axis: usize) -> DimensionType {
        self.dims[axis].0
    }

    pub fn has_dimension_type(&self, dimension_type: DimensionType) -> bool {
        self.dims.iter().any(|(t, _)| *t == dimension_type)
    }

    /// Whether the variable has an enumeration attached; string filters on
    /// enumerated integer variables compare against the names.
    pub fn is_enumerated(&self) -> bool {
        !self.enum_names.is_empty()
    }

    /// Broadcast the variable along a new outer dimension of `length`,
    /// replicating the existing data once per new outer index.
    pub fn prepend_dimension(&mut self, dimension_type: DimensionType, length: usize) -> Result<()> {
        if self.dims.len() + 1 > MAX_NUM_DIMS {
            return Err(ProductError::invalid(format!(
                "cannot add a dimension to variable '{}'; at most {} are supported",
                self.name, MAX_NUM_DIMS
            )));
        }
        let block = self.num_elements();
        let mut data = ArrayData::null(self.data_type(), block * length);
        for rep in 0..length {
            for i in 0..block {
                data.copy_element_from(rep * block + i, &self.data, i)?;
            }
        }
        self.data = data;
        self.dims.insert(0, (dimension_type, length));
        Ok(())
    }

    /// Remove dimension `axis`, keeping one slice. All slices along the
    /// axis must hold identical values.
    pub fn squash_dimension(&mut self, axis: usize) -> Result<()> {
        if axis >= self.dims.len() {
            return Err(ProductError::invalid(format!(
                "variable '{}' has no dimension {axis}",
                self.name
            )));
        }
        let length = self.dims[axis].1;
        let inner: usize = self.dims[axis + 1..].iter().map(|(_, n)| n).product();
        let outer: usize = self.dims[..axis].iter().map(|(_, n)| n).product();

        let mut data = ArrayData::null(self.data_type(), outer * inner);
        for o in 0..outer {
            for i in 0..inner {
                let first = (o * length) * inner + i;
                for s in 1..length {
                    let other = (o * length + s) * inner + i;
                    if !elements_equal(&self.data, first, other) {
                        return Err(ProductError::invalid(format!(
                            "cannot squash dimension {} of variable '{}'; values differ along it",
                            axis, self.name
                        )));
                    }
                }
                data.copy_element_from(o * inner + i, &self.data, first)?;
            }
        }
        self.data = data;
        self.dims.remove(axis);
        Ok(())
    }

    /// Convert the variable's storage type, mapping the valid range along.
    pub fn convert_data_type(&mut self, data_type: DataType) -> Result<()> {
        if self.data_type() == data_type {
            return Ok(());
        }
        self.data = self.data.convert(data_type)?;
        if let Some(min) = self.valid_min {
            self.valid_min = Some(Scalar::from_f64(data_type, min.as_f64())?);
        }
        if let Some(max) = self.valid_max {
            self.valid_max = Some(Scalar::from_f64(data_type, max.as_f64())?);
        }
        Ok(())
    }

    /// Verify that the buffer length matches the declared shape.
    pub fn verify(&self) -> Result<()> {
        let expected: usize = self.dims.iter().map(|(_, n)| n).product();
        if self.data.len() != expected {
            return Err(ProductError::InvalidShape {
                name: self.name.clone(),
                actual: self.data.len(),
                expected,
            });
        }
        Ok(())
    }
}

fn elements_equal(data: &ArrayData, a: usize, b: usize) -> bool {
    match data {
        ArrayData::Int8(v) => v[a] == v[b],
        ArrayData::Int16(v) => v[a] == v[b],
        ArrayData::Int32(v) => v[a] == v[b],
        ArrayData::Float(v) => v[a] == v[b] || (v[a].is_nan() && v[b].is_nan()),
        ArrayData::Double(v) => v[a] == v[b] || (v[a].is_nan() && v[b].is_nan()),
        ArrayData::Str(v) => v[a] == v[b],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn time_series(values: Vec<f64>) -> Variable {
        let len = values.len();
        Variable::with_data(
            "t",
            vec![(DimensionType::Time, len)],
            ArrayData::Double(values),
        )
        .unwrap()
    }

    #[test]
    fn shape_is_validated() {
        let result = Variable::with_data(
            "bad",
            vec![(DimensionType::Time, 3)],
            ArrayData::Double(vec![1.0, 2.0]),
        );
        assert!(result.is_err());
    }

    #[test]
    fn scalar_has_one_element() {
        let v = Variable::scalar("s", ArrayData::Int32(vec![7])).unwrap();
        assert_eq!(v.num_dims(), 0);
        assert_eq!(v.num_elements(), 1);
    }

    #[test]
    fn prepend_dimension_broadcasts() {
        let mut v = Variable::with_data(
            "x",
            vec![(DimensionType::Vertical, 2)],
            ArrayData::Double(vec![1.0, 2.0]),
        )
        .unwrap();
        v.prepend_dimension(DimensionType::Time, 3).unwrap();
        assert_eq!(v.dims, vec![(DimensionType::Time, 3), (DimensionType::Vertical, 2)]);
        assert_eq!(
            v.data,
            ArrayData::Double(vec![1.0, 2.0, 1.0, 2.0, 1.0, 2.0])
        );
    }

    #[test]
    fn squash_requires_identical_slices() {
        let mut v = Variable::with_data(
            "x",
            vec![(DimensionType::Time, 2), (DimensionType::Vertical, 2)],
            ArrayData::Double(vec![1.0, 2.0, 1.0, 2.0]),
        )
        .unwrap();
        v.squash_dimension(0).unwrap();
        assert_eq!(v.dims, vec![(DimensionType::Vertical, 2)]);
        assert_eq!(v.data, ArrayData::Double(vec![1.0, 2.0]));

        let mut w = time_series(vec![1.0, 2.0]);
        assert!(w.squash_dimension(0).is_err());
    }

    #[test]
    fn convert_data_type_maps_valid_range() {
        let mut v = time_series(vec![1.0, 2.0])
            .with_valid_range(Scalar::Double(0.0), Scalar::Double(10.0));
        v.convert_data_type(DataType::Int32).unwrap();
        assert_eq!(v.valid_min, Some(Scalar::Int32(0)));
        assert_eq!(v.valid_max, Some(Scalar::Int32(10)));
        assert_eq!(v.data, ArrayData::Int32(vec![1, 2]));
    }
}

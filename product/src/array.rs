//! Typed flat storage for variable data.
//!
//! A variable owns exactly one `ArrayData` buffer holding its elements in
//! row-major order. String elements are individually owned and nullable so
//! that filter compaction can move them between slots without cloning.

use serde::{Deserialize, Serialize};

use crate::datatype::DataType;
use crate::error::{ProductError, Result};

/// Owned, typed element buffer of a variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArrayData {
    Int8(Vec<i8>),
    Int16(Vec<i16>),
    Int32(Vec<i32>),
    Float(Vec<f32>),
    Double(Vec<f64>),
    Str(Vec<Option<String>>),
}

impl ArrayData {
    /// Allocate a buffer of `len` null elements (0 for integers, NaN for
    /// floats, empty slot for strings).
    pub fn null(data_type: DataType, len: usize) -> Self {
        match data_type {
            DataType::Int8 => ArrayData::Int8(vec![0; len]),
            DataType::Int16 => ArrayData::Int16(vec![0; len]),
            DataType::Int32 => ArrayData::Int32(vec![0; len]),
            DataType::Float => ArrayData::Float(vec![f32::NAN; len]),
            DataType::Double => ArrayData::Double(vec![f64::NAN; len]),
            DataType::Str => ArrayData::Str(vec![None; len]),
        }
    }

    pub fn data_type(&self) -> DataType {
        match self {
            ArrayData::Int8(_) => DataType::Int8,
            ArrayData::Int16(_) => DataType::Int16,
            ArrayData::Int32(_) => DataType::Int32,
            ArrayData::Float(_) => DataType::Float,
            ArrayData::Double(_) => DataType::Double,
            ArrayData::Str(_) => DataType::Str,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ArrayData::Int8(v) => v.len(),
            ArrayData::Int16(v) => v.len(),
            ArrayData::Int32(v) => v.len(),
            ArrayData::Float(v) => v.len(),
            ArrayData::Double(v) => v.len(),
            ArrayData::Str(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Numeric element widened to `f64`. Returns an error for string data.
    pub fn get_f64(&self, index: usize) -> Result<f64> {
        match self {
            ArrayData::Int8(v) => Ok(v[index] as f64),
            ArrayData::Int16(v) => Ok(v[index] as f64),
            ArrayData::Int32(v) => Ok(v[index] as f64),
            ArrayData::Float(v) => Ok(v[index] as f64),
            ArrayData::Double(v) => Ok(v[index]),
            ArrayData::Str(_) => Err(ProductError::invalid_type(
                "cannot read a string element as a number",
            )),
        }
    }

    /// Store a numeric value, narrowing to the buffer's type.
    pub fn set_f64(&mut self, index: usize, value: f64) -> Result<()> {
        match self {
            ArrayData::Int8(v) => v[index] = value as i8,
            ArrayData::Int16(v) => v[index] = value as i16,
            ArrayData::Int32(v) => v[index] = value as i32,
            ArrayData::Float(v) => v[index] = value as f32,
            ArrayData::Double(v) => v[index] = value,
            ArrayData::Str(_) => {
                return Err(ProductError::invalid_type(
                    "cannot write a numeric value into a string element",
                ));
            }
        }
        Ok(())
    }

    /// String element, `None` for empty slots. Errors on numeric buffers.
    pub fn get_str(&self, index: usize) -> Result<Option<&str>> {
        match self {
            ArrayData::Str(v) => Ok(v[index].as_deref()),
            _ => Err(ProductError::invalid_type(
                "cannot read a numeric element as a string",
            )),
        }
    }

    /// Overwrite the element at `index` with the type's null value.
    pub fn set_null(&mut self, index: usize) {
        match self {
            ArrayData::Int8(v) => v[index] = 0,
            ArrayData::Int16(v) => v[index] = 0,
            ArrayData::Int32(v) => v[index] = 0,
            ArrayData::Float(v) => v[index] = f32::NAN,
            ArrayData::Double(v) => v[index] = f64::NAN,
            ArrayData::Str(v) => v[index] = None,
        }
    }

    /// Move the element at `src` into `dst`. For strings the source slot is
    /// emptied so that ownership transfers instead of duplicating.
    pub fn move_element(&mut self, dst: usize, src: usize) {
        if dst == src {
            return;
        }
        match self {
            ArrayData::Int8(v) => v[dst] = v[src],
            ArrayData::Int16(v) => v[dst] = v[src],
            ArrayData::Int32(v) => v[dst] = v[src],
            ArrayData::Float(v) => v[dst] = v[src],
            ArrayData::Double(v) => v[dst] = v[src],
            ArrayData::Str(v) => v[dst] = v[src].take(),
        }
    }

    /// Copy the element at `src` of `source` into `dst` of `self`. String
    /// elements are cloned, which allows gather operations to duplicate
    /// rows. Both buffers must share a data type.
    pub fn copy_element_from(&mut self, dst: usize, source: &ArrayData, src: usize) -> Result<()> {
        match (self, source) {
            (ArrayData::Int8(t), ArrayData::Int8(s)) => t[dst] = s[src],
            (ArrayData::Int16(t), ArrayData::Int16(s)) => t[dst] = s[src],
            (ArrayData::Int32(t), ArrayData::Int32(s)) => t[dst] = s[src],
            (ArrayData::Float(t), ArrayData::Float(s)) => t[dst] = s[src],
            (ArrayData::Double(t), ArrayData::Double(s)) => t[dst] = s[src],
            (ArrayData::Str(t), ArrayData::Str(s)) => t[dst] = s[src].clone(),
            _ => {
                return Err(ProductError::invalid_type(
                    "source and target buffers have different data types",
                ));
            }
        }
        Ok(())
    }

    /// Shrink the buffer to `len` elements, dropping the tail.
    pub fn truncate(&mut self, len: usize) {
        match self {
            ArrayData::Int8(v) => v.truncate(len),
            ArrayData::Int16(v) => v.truncate(len),
            ArrayData::Int32(v) => v.truncate(len),
            ArrayData::Float(v) => v.truncate(len),
            ArrayData::Double(v) => v.truncate(len),
            ArrayData::Str(v) => v.truncate(len),
        }
    }

    /// Convert the buffer to another numeric data type, widening each
    /// element through `f64`. Conversion to or from strings is refused.
    pub fn convert(&self, data_type: DataType) -> Result<ArrayData> {
        if self.data_type() == data_type {
            return Ok(self.clone());
        }
        if self.data_type() == DataType::Str || data_type == DataType::Str {
            return Err(ProductError::invalid_type(
                "cannot convert between string and numeric data",
            ));
        }
        let mut out = ArrayData::null(data_type, self.len());
        for i in 0..self.len() {
            out.set_f64(i, self.get_f64(i)?)?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_buffers_use_type_specific_fill() {
        let ints = ArrayData::null(DataType::Int32, 3);
        assert_eq!(ints, ArrayData::Int32(vec![0, 0, 0]));

        let floats = ArrayData::null(DataType::Double, 2);
        assert!(floats.get_f64(0).unwrap().is_nan());

        let strings = ArrayData::null(DataType::Str, 1);
        assert_eq!(strings.get_str(0).unwrap(), None);
    }

    #[test]
    fn move_element_transfers_string_ownership() {
        let mut data = ArrayData::Str(vec![Some("a".into()), Some("b".into())]);
        data.move_element(0, 1);
        assert_eq!(data.get_str(0).unwrap(), Some("b"));
        assert_eq!(data.get_str(1).unwrap(), None);
    }

    #[test]
    fn convert_widens_through_f64() {
        let data = ArrayData::Int16(vec![1, 2, 3]);
        let converted = data.convert(DataType::Double).unwrap();
        assert_eq!(converted, ArrayData::Double(vec![1.0, 2.0, 3.0]));
        assert!(data.convert(DataType::Str).is_err());
    }
}

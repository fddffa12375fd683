//! Products: ordered collections of variables sharing a dimension table.

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::datatype::DimensionType;
use crate::error::{ProductError, Result};
use crate::variable::Variable;

/// A named set of variables with coupled dimensions.
///
/// For each non-independent [`DimensionType`] the product tracks a single
/// length shared by every variable using that dimension. Adding a variable
/// pins the lengths it uses; removing the last user of a dimension unpins
/// it. A product with no variables, or with a pinned dimension of length
/// zero, is *empty* — a valid terminal state rather than an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Product {
    variables: Vec<Variable>,
    dimensions: BTreeMap<DimensionType, usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_product: Option<String>,
    #[serde(skip)]
    name_index: FxHashMap<String, usize>,
}

impl Product {
    pub fn new() -> Self {
        Product::default()
    }

    pub fn with_source(source_product: impl Into<String>) -> Self {
        Product {
            source_product: Some(source_product.into()),
            ..Product::default()
        }
    }

    pub fn num_variables(&self) -> usize {
        self.variables.len()
    }

    pub fn variables(&self) -> impl Iterator<Item = &Variable> {
        self.variables.iter()
    }

    pub fn variable_names(&self) -> Vec<&str> {
        self.variables.iter().map(|v| v.name.as_str()).collect()
    }

    pub fn has_variable(&self, name: &str) -> bool {
        self.name_index.contains_key(name)
    }

    pub fn variable(&self, name: &str) -> Result<&Variable> {
        self.name_index
            .get(name)
            .map(|&i| &self.variables[i])
            .ok_or_else(|| ProductError::unknown_variable(name))
    }

    pub fn variable_mut(&mut self, name: &str) -> Result<&mut Variable> {
        match self.name_index.get(name) {
            Some(&i) => Ok(&mut self.variables[i]),
            None => Err(ProductError::unknown_variable(name)),
        }
    }

    /// Length of a coupled dimension, if any variable pins it.
    pub fn dimension(&self, dimension_type: DimensionType) -> Option<usize> {
        self.dimensions.get(&dimension_type).copied()
    }

    pub fn dimensions(&self) -> &BTreeMap<DimensionType, usize> {
        &self.dimensions
    }

    /// Force a coupled dimension length. Used by filter passes that have
    /// already rewritten every variable to the new length.
    pub fn set_dimension(&mut self, dimension_type: DimensionType, length: usize) {
        if !dimension_type.is_independent() {
            self.dimensions.insert(dimension_type, length);
        }
    }

    /// A product is empty when it has no variables or a coupled dimension
    /// has collapsed to length zero.
    pub fn is_empty(&self) -> bool {
        self.variables.is_empty() || self.dimensions.values().any(|&n| n == 0)
    }

    /// Remove every variable and unpin all dimensions.
    pub fn clear(&mut self) {
        debug!(source = ?self.source_product, "clearing product");
        self.variables.clear();
        self.dimensions.clear();
        self.name_index.clear();
    }

    /// Add a variable, taking ownership. The variable's coupled dimensions
    /// must agree with the dimension table; new dimension types are pinned.
    pub fn add_variable(&mut self, variable: Variable) -> Result<()> {
        if self.has_variable(&variable.name) {
            return Err(ProductError::duplicate_variable(&variable.name));
        }
        variable.verify()?;
        for &(dimension_type, length) in &variable.dims {
            if dimension_type.is_independent() {
                continue;
            }
            if let Some(&expected) = self.dimensions.get(&dimension_type) {
                if expected != length {
                    return Err(ProductError::DimensionMismatch {
                        name: variable.name.clone(),
                        dimension: dimension_type,
                        length,
                        expected,
                    });
                }
            }
        }
        for &(dimension_type, length) in &variable.dims {
            if !dimension_type.is_independent() {
                self.dimensions.entry(dimension_type).or_insert(length);
            }
        }
        self.name_index
            .insert(variable.name.clone(), self.variables.len());
        self.variables.push(variable);
        Ok(())
    }

    /// Detach a variable, transferring ownership to the caller. Dimensions
    /// no longer used by any remaining variable are unpinned.
    pub fn detach_variable(&mut self, name: &str) -> Result<Variable> {
        let index = *self
            .name_index
            .get(name)
            .ok_or_else(|| ProductError::unknown_variable(name))?;
        let variable = self.variables.remove(index);
        self.rebuild_name_index();
        self.prune_dimensions();
        Ok(variable)
    }

    /// Remove and destroy a variable.
    pub fn remove_variable(&mut self, name: &str) -> Result<()> {
        self.detach_variable(name).map(|_| ())
    }

    /// Replace an existing variable of the same name in place. If the
    /// replacement is rejected the original variable is restored.
    pub fn replace_variable(&mut self, variable: Variable) -> Result<()> {
        let previous = self.detach_variable(&variable.name.clone())?;
        match self.add_variable(variable) {
            Ok(()) => Ok(()),
            Err(error) => {
                self.add_variable(previous)?;
                Err(error)
            }
        }
    }

    /// Gather rows along a coupled dimension according to `indices`.
    /// Indices may repeat (duplicating rows) or omit rows (dropping them);
    /// every variable using the dimension is rewritten and the dimension
    /// table updated to the new length.
    pub fn rearrange_dimension(
        &mut self,
        dimension_type: DimensionType,
        indices: &[usize],
    ) -> Result<()> {
        if dimension_type.is_independent() {
            return Err(ProductError::invalid(
                "cannot rearrange the independent dimension",
            ));
        }
        let Some(&length) = self.dimensions.get(&dimension_type) else {
            return Err(ProductError::invalid(format!(
                "product has no '{dimension_type}' dimension"
            )));
        };
        if let Some(&bad) = indices.iter().find(|&&i| i >= length) {
            return Err(ProductError::invalid(format!(
                "index {bad} out of range for dimension '{dimension_type}' of length {length}"
            )));
        }

        for variable in &mut self.variables {
            for axis in 0..variable.num_dims() {
                if variable.dimension_type(axis) == dimension_type {
                    rearrange_axis(variable, axis, indices)?;
                }
            }
        }
        self.dimensions.insert(dimension_type, indices.len());
        Ok(())
    }

    /// Keep only the rows of a coupled dimension whose mask entry is true.
    /// An all-false mask empties the product (success).
    pub fn filter_dimension(&mut self, dimension_type: DimensionType, mask: &[bool]) -> Result<()> {
        let Some(&length) = self.dimensions.get(&dimension_type) else {
            return Err(ProductError::invalid(format!(
                "product has no '{dimension_type}' dimension"
            )));
        };
        if mask.len() != length {
            return Err(ProductError::invalid(format!(
                "mask length {} does not match dimension '{dimension_type}' length {length}",
                mask.len()
            )));
        }
        let indices: Vec<usize> = mask
            .iter()
            .enumerate()
            .filter_map(|(i, &keep)| keep.then_some(i))
            .collect();
        if indices.is_empty() {
            self.clear();
            return Ok(());
        }
        self.rearrange_dimension(dimension_type, &indices)
    }

    /// Audit cross-variable dimension consistency.
    pub fn verify(&self) -> Result<()> {
        for variable in &self.variables {
            variable.verify()?;
            for &(dimension_type, length) in &variable.dims {
                if dimension_type.is_independent() {
                    continue;
                }
                match self.dimensions.get(&dimension_type) {
                    Some(&expected) if expected == length => {}
                    Some(&expected) => {
                        return Err(ProductError::DimensionMismatch {
                            name: variable.name.clone(),
                            dimension: dimension_type,
                            length,
                            expected,
                        });
                    }
                    None => {
                        return Err(ProductError::invalid(format!(
                            "variable '{}' uses unpinned dimension '{dimension_type}'",
                            variable.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn rebuild_name_index(&mut self) {
        self.name_index = self
            .variables
            .iter()
            .enumerate()
            .map(|(i, v)| (v.name.clone(), i))
            .collect();
    }

    /// Rebuild the name index after deserialization.
    pub fn reindex(&mut self) {
        self.rebuild_name_index();
    }

    /// Unpin dimensions that no variable uses anymore. Needed after
    /// in-place reshapes such as squashing or flattening.
    pub fn unpin_unused_dimensions(&mut self) {
        self.prune_dimensions();
    }

    fn prune_dimensions(&mut self) {
        self.dimensions.retain(|&dimension_type, _| {
            self.variables
                .iter()
                .any(|v| v.has_dimension_type(dimension_type))
        });
    }
}

/// Gather slices of `variable` along `axis` according to `indices`.
fn rearrange_axis(variable: &mut Variable, axis: usize, indices: &[usize]) -> Result<()> {
    let length = variable.dimension_length(axis);
    let inner: usize = variable.dims[axis + 1..].iter().map(|(_, n)| n).product();
    let outer: usize = variable.dims[..axis].iter().map(|(_, n)| n).product();

    let mut dims = variable.dims.clone();
    dims[axis].1 = indices.len();
    let num_elements: usize = dims.iter().map(|(_, n)| n).product();
    let mut data = crate::array::ArrayData::null(variable.data_type(), num_elements);

    for o in 0..outer {
        for (new_row, &src_row) in indices.iter().enumerate() {
            for i in 0..inner {
                let dst = (o * indices.len() + new_row) * inner + i;
                let src = (o * length + src_row) * inner + i;
                data.copy_element_from(dst, &variable.data, src)?;
            }
        }
    }

    variable.data = data;
    variable.dims = dims;
    Ok(())
}

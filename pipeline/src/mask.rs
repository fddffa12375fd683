//! Boolean selections over one or two dimensions.
//!
//! A rank-1 mask selects indices of a single dimension. A rank-2 mask is
//! used when the selection along a secondary dimension differs per time
//! step; its axis 0 is always the time dimension. Every mask caches its
//! `masked_length`: the retained count for rank 1, and the maximum
//! per-row retained count for rank 2 (the widest any compacted row will
//! need to be). All mutators keep the cache in step with the bits.

use std::collections::BTreeMap;

use tropo_product::{DimensionType, Variable};

use crate::error::{PipelineError, Result};
use crate::predicate::ValuePredicate;

/// A 1-D or 2-D boolean selection with cached cardinality.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DimensionMask {
    /// One entry per axis; length 1 or 2.
    dims: Vec<usize>,
    mask: Vec<bool>,
    masked_length: usize,
}

impl DimensionMask {
    /// All-true rank-1 mask over a dimension of `length`.
    pub fn new_1d(length: usize) -> Self {
        DimensionMask {
            dims: vec![length],
            mask: vec![true; length],
            masked_length: length,
        }
    }

    /// Rank-1 mask with explicit bits.
    pub fn from_bits(bits: Vec<bool>) -> Self {
        let masked_length = bits.iter().filter(|&&b| b).count();
        DimensionMask {
            dims: vec![bits.len()],
            mask: bits,
            masked_length,
        }
    }

    /// All-true rank-2 mask with `rows` time steps of `cols` entries.
    pub fn new_2d(rows: usize, cols: usize) -> Self {
        DimensionMask {
            dims: vec![rows, cols],
            mask: vec![true; rows * cols],
            masked_length: cols,
        }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn num_elements(&self) -> usize {
        self.mask.len()
    }

    /// Retained count along the last axis (maximum over rows for rank 2).
    pub fn masked_length(&self) -> usize {
        self.masked_length
    }

    pub fn as_slice(&self) -> &[bool] {
        &self.mask
    }

    pub fn get(&self, index: usize) -> bool {
        self.mask[index]
    }

    pub fn row(&self, row: usize) -> &[bool] {
        let cols = *self.dims.last().unwrap_or(&0);
        &self.mask[row * cols..(row + 1) * cols]
    }

    pub fn is_all_true(&self) -> bool {
        self.masked_length == *self.dims.last().unwrap_or(&0) && self.mask.iter().all(|&b| b)
    }

    fn recompute_masked_length(&mut self) {
        self.masked_length = match self.dims.len() {
            1 => self.mask.iter().filter(|&&b| b).count(),
            _ => {
                let cols = self.dims[1];
                (0..self.dims[0])
                    .map(|r| self.mask[r * cols..(r + 1) * cols].iter().filter(|&&b| b).count())
                    .max()
                    .unwrap_or(0)
            }
        };
    }

    /// Clear a single bit, keeping the cached length consistent.
    pub fn clear(&mut self, index: usize) {
        if self.mask[index] {
            self.mask[index] = false;
            self.recompute_masked_length();
        }
    }

    /// AND every element of a rank-1 mask with a predicate evaluated over
    /// the elements of `variable`. Already-cleared bits are skipped.
    pub fn update_all_1d(
        &mut self,
        predicate: &dyn ValuePredicate,
        variable: &Variable,
    ) -> Result<()> {
        if self.rank() != 1 || self.num_elements() != variable.num_elements() {
            return Err(PipelineError::invalid_argument(format!(
                "mask shape does not match variable '{}'",
                variable.name
            )));
        }
        if self.masked_length == 0 {
            return Ok(());
        }
        let mut retained = 0;
        for i in 0..self.mask.len() {
            if self.mask[i] {
                if predicate.eval(variable, i)? {
                    retained += 1;
                } else {
                    self.mask[i] = false;
                }
            }
        }
        self.masked_length = retained;
        Ok(())
    }

    /// AND a rank-2 mask with a predicate over a (time, secondary)
    /// variable, clearing the corresponding time bit in `time_mask` when
    /// an entire row empties.
    pub fn update_all_2d(
        &mut self,
        time_mask: &mut DimensionMask,
        predicate: &dyn ValuePredicate,
        variable: &Variable,
    ) -> Result<()> {
        if self.rank() != 2 || self.num_elements() != variable.num_elements() {
            return Err(PipelineError::invalid_argument(format!(
                "mask shape does not match variable '{}'",
                variable.name
            )));
        }
        if time_mask.rank() != 1 || time_mask.num_elements() != self.dims[0] {
            return Err(PipelineError::invalid_argument(
                "time mask does not match the mask's outer axis",
            ));
        }
        let (rows, cols) = (self.dims[0], self.dims[1]);
        let mut time_retained = 0;
        let mut max_row_retained = 0;
        for r in 0..rows {
            if !time_mask.mask[r] {
                // Row already dropped; clear its bits.
                self.mask[r * cols..(r + 1) * cols].fill(false);
                continue;
            }
            let mut row_retained = 0;
            for c in 0..cols {
                let index = r * cols + c;
                if self.mask[index] {
                    if predicate.eval(variable, index)? {
                        row_retained += 1;
                    } else {
                        self.mask[index] = false;
                    }
                }
            }
            if row_retained == 0 {
                time_mask.mask[r] = false;
            } else {
                time_retained += 1;
                max_row_retained = max_row_retained.max(row_retained);
            }
        }
        time_mask.masked_length = time_retained;
        self.masked_length = max_row_retained;
        Ok(())
    }

    /// Keep index `i` of a rank-1 time mask when *any* inner element of
    /// the variable's row passes the predicate. Used by valid-range
    /// filters over rank>=2 variables where only the outer axis may be
    /// filtered.
    pub fn update_any(
        &mut self,
        predicate: &dyn ValuePredicate,
        variable: &Variable,
    ) -> Result<()> {
        if self.rank() != 1 || variable.num_dims() == 0 {
            return Err(PipelineError::invalid_argument(
                "any-element update needs a rank-1 mask and a dimensioned variable",
            ));
        }
        if self.num_elements() != variable.dimension_length(0) {
            return Err(PipelineError::invalid_argument(format!(
                "mask length does not match the outer axis of variable '{}'",
                variable.name
            )));
        }
        let inner = variable.num_elements() / variable.dimension_length(0);
        let mut retained = 0;
        for r in 0..self.mask.len() {
            if !self.mask[r] {
                continue;
            }
            let mut any = false;
            for c in 0..inner {
                if predicate.eval(variable, r * inner + c)? {
                    any = true;
                    break;
                }
            }
            if any {
                retained += 1;
            } else {
                self.mask[r] = false;
            }
        }
        self.masked_length = retained;
        Ok(())
    }

    /// Promote a rank-1 mask to rank 2 by replicating it along a new time
    /// axis of `rows` entries.
    pub fn prepend_dimension(&mut self, rows: usize) -> Result<()> {
        if self.rank() != 1 {
            return Err(PipelineError::invalid_argument(
                "only rank-1 masks can be promoted to rank 2",
            ));
        }
        let cols = self.dims[0];
        let mut mask = Vec::with_capacity(rows * cols);
        for _ in 0..rows {
            mask.extend_from_slice(&self.mask);
        }
        self.mask = mask;
        self.dims = vec![rows, cols];
        // masked_length is per-row and every row is identical.
        Ok(())
    }

    /// Collapse a rank-2 mask to rank 1 by logical-or over axis 1,
    /// yielding one bit per time step.
    pub fn reduce_over_secondary(&self) -> Vec<bool> {
        match self.rank() {
            1 => self.mask.clone(),
            _ => {
                let cols = self.dims[1];
                (0..self.dims[0])
                    .map(|r| self.mask[r * cols..(r + 1) * cols].iter().any(|&b| b))
                    .collect()
            }
        }
    }

    /// AND a rank-1 mask over the secondary dimension into every row of a
    /// rank-2 mask.
    pub fn merge_secondary(&mut self, secondary: &[bool]) -> Result<()> {
        if self.rank() != 2 || secondary.len() != self.dims[1] {
            return Err(PipelineError::invalid_argument(
                "secondary mask length does not match the mask's inner axis",
            ));
        }
        let cols = self.dims[1];
        for r in 0..self.dims[0] {
            for c in 0..cols {
                self.mask[r * cols + c] &= secondary[c];
            }
        }
        self.recompute_masked_length();
        Ok(())
    }

    /// AND another rank-1 mask elementwise.
    pub fn intersect_1d(&mut self, other: &[bool]) -> Result<()> {
        if self.rank() != 1 || other.len() != self.mask.len() {
            return Err(PipelineError::invalid_argument(
                "masks to intersect must be rank 1 and equally long",
            ));
        }
        for (bit, &keep) in self.mask.iter_mut().zip(other) {
            *bit &= keep;
        }
        self.recompute_masked_length();
        Ok(())
    }

    /// Whether every row of a rank-2 mask is identical.
    pub fn rows_identical(&self) -> bool {
        if self.rank() != 2 || self.dims[0] <= 1 {
            return true;
        }
        let cols = self.dims[1];
        let first = &self.mask[..cols];
        (1..self.dims[0]).all(|r| &self.mask[r * cols..(r + 1) * cols] == first)
    }

    /// Collapse to rank 1 when all rows agree.
    fn collapse_identical_rows(&mut self) {
        if self.rank() == 2 && self.rows_identical() {
            let cols = self.dims[1];
            self.mask.truncate(cols);
            self.dims = vec![cols];
            self.recompute_masked_length();
        }
    }
}

/// Correlated masks keyed by semantic dimension.
///
/// Invariant: rank-2 masks have an axis-0 length equal to the time
/// dimension, and no mask is keyed by `independent`.
#[derive(Debug, Clone, Default)]
pub struct DimensionMaskSet {
    masks: BTreeMap<DimensionType, DimensionMask>,
}

impl DimensionMaskSet {
    pub fn new() -> Self {
        DimensionMaskSet::default()
    }

    pub fn get(&self, dimension_type: DimensionType) -> Option<&DimensionMask> {
        self.masks.get(&dimension_type)
    }

    pub fn get_mut(&mut self, dimension_type: DimensionType) -> Option<&mut DimensionMask> {
        self.masks.get_mut(&dimension_type)
    }

    pub fn insert(&mut self, dimension_type: DimensionType, mask: DimensionMask) -> Result<()> {
        if dimension_type.is_independent() {
            return Err(PipelineError::invalid_argument(
                "masks cannot be keyed by the independent dimension",
            ));
        }
        self.masks.insert(dimension_type, mask);
        Ok(())
    }

    pub fn remove(&mut self, dimension_type: DimensionType) -> Option<DimensionMask> {
        self.masks.remove(&dimension_type)
    }

    pub fn is_empty(&self) -> bool {
        self.masks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (DimensionType, &DimensionMask)> {
        self.masks.iter().map(|(&d, m)| (d, m))
    }

    /// True when any stored mask retains nothing — callers treat this as
    /// "product becomes empty".
    pub fn has_empty(&self) -> bool {
        self.masks.values().any(|m| m.masked_length() == 0)
    }

    /// Collapse rank-2 masks whose rows are identical and drop masks that
    /// retain everything.
    pub fn simplify(&mut self) {
        for mask in self.masks.values_mut() {
            mask.collapse_identical_rows();
        }
        self.masks.retain(|_, mask| !mask.is_all_true());
    }
}

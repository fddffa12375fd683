//! Ingestion-time optimization: executing the filter prefix of a program
//! against a streamed reader so that discarded samples are never
//! materialized.
//!
//! The optimizer walks the program while the current operation is a
//! value, index, point, area or collocation filter, or a keep/exclude.
//! Filters accumulate dimension masks by pulling only the variables they
//! reference; keep/exclude prune the variable selection so unselected
//! variables are never read. The first operation that cannot be pushed
//! stops the walk; the retained variables are then read through
//! mask-aware paths and the in-memory engine finishes the program. Any
//! failure while pushing falls back to full materialization.

use std::collections::BTreeMap;

use tracing::{debug, warn};
use tropo_product::{ArrayData, DataType, DimensionType, Product, Scalar, Variable};

use crate::collocation::CollocationSide;
use crate::engine::ExecutionEngine;
use crate::error::{PipelineError, Result};
use crate::filter::filter_variable;
use crate::geometry::{SphericalPoint, SphericalPolygon};
use crate::mask::{DimensionMask, DimensionMaskSet};
use crate::operation::Operation;
use crate::predicate::{
    CollocationIndexPredicate, IndexComparisonPredicate, IndexMembershipPredicate, IndexPredicate,
    ValuePredicate,
};
use crate::program::Program;

/// How a variable's data is delivered by the reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadAccess {
    /// One call returns the whole variable.
    Whole,
    /// One call per outermost index.
    Block,
    /// Arbitrary outer-index ranges; `optimal_length` sizes the internal
    /// buffer used to amortize per-call overhead.
    Range { optimal_length: usize },
}

/// Metadata for one variable the reader can deliver.
#[derive(Debug, Clone)]
pub struct VariableDefinition {
    pub name: String,
    pub data_type: DataType,
    pub dims: Vec<(DimensionType, usize)>,
    pub unit: Option<String>,
    pub valid_min: Option<Scalar>,
    pub valid_max: Option<Scalar>,
    pub enum_names: Vec<String>,
    pub description: Option<String>,
    pub access: ReadAccess,
}

impl VariableDefinition {
    pub fn num_elements(&self) -> usize {
        self.dims.iter().map(|&(_, n)| n).product()
    }

    pub fn block_elements(&self) -> usize {
        if self.dims.is_empty() {
            1
        } else {
            self.num_elements() / self.dims[0].1
        }
    }
}

/// Format-specific ingestion source.
///
/// Exactly one of the read methods applies per variable, selected by the
/// definition's [`ReadAccess`]; the others keep their unimplemented
/// default. Each read fills `dst`, a null-initialized buffer of exactly
/// the requested extent.
pub trait Reader {
    fn source_product(&self) -> String;

    fn dimensions(&mut self) -> Result<BTreeMap<DimensionType, usize>>;

    fn variables(&mut self) -> Result<Vec<VariableDefinition>>;

    /// Hide a variable based on reader option settings.
    fn exclude(&self, _name: &str) -> bool {
        false
    }

    fn read_whole(&mut self, name: &str, _dst: &mut ArrayData) -> Result<()> {
        Err(PipelineError::import(format!(
            "reader does not support whole reads for '{name}'"
        )))
    }

    fn read_block(&mut self, name: &str, _outer_index: usize, _dst: &mut ArrayData) -> Result<()> {
        Err(PipelineError::import(format!(
            "reader does not support block reads for '{name}'"
        )))
    }

    fn read_range(
        &mut self,
        name: &str,
        _start: usize,
        _count: usize,
        _dst: &mut ArrayData,
    ) -> Result<()> {
        Err(PipelineError::import(format!(
            "reader does not support range reads for '{name}'"
        )))
    }
}

/// Ingest a product, pushing the program's filter prefix into the reader,
/// then execute the remaining program in memory.
pub fn ingest(
    reader: &mut dyn Reader,
    program: &mut Program,
    engine: &ExecutionEngine,
) -> Result<Product> {
    let start_cursor = program.cursor;
    match try_optimized_ingest(reader, program, engine) {
        Ok(product) => Ok(product),
        Err(error) => {
            warn!(%error, "ingestion optimization failed; falling back to full materialization");
            program.cursor = start_cursor;
            let mut product = materialize(reader, None)?;
            engine.execute(&mut product, program)?;
            Ok(product)
        }
    }
}

fn try_optimized_ingest(
    reader: &mut dyn Reader,
    program: &mut Program,
    engine: &ExecutionEngine,
) -> Result<Product> {
    let mut state = OptimizerState::new(reader)?;

    if state.has_empty_dimension() {
        return Ok(Product::with_source(state.source_product));
    }

    state.evaluate_prefix(reader, program, engine)?;

    if !state.product_mask || state.mask_set.has_empty() {
        return Ok(Product::with_source(state.source_product));
    }

    let mut product = materialize(reader, Some(&state))?;
    engine.execute(&mut product, program)?;
    Ok(product)
}

struct OptimizerState {
    source_product: String,
    dimensions: BTreeMap<DimensionType, usize>,
    definitions: Vec<VariableDefinition>,
    /// Per-definition retain flag, pruned by keep/exclude.
    variable_mask: Vec<bool>,
    /// False once a 0-D filter rejected the whole product.
    product_mask: bool,
    mask_set: DimensionMaskSet,
}

impl OptimizerState {
    fn new(reader: &mut dyn Reader) -> Result<Self> {
        let dimensions = reader.dimensions()?;
        let definitions: Vec<VariableDefinition> = reader
            .variables()?
            .into_iter()
            .filter(|def| !reader.exclude(&def.name))
            .collect();
        let variable_mask = vec![true; definitions.len()];
        Ok(OptimizerState {
            source_product: reader.source_product(),
            dimensions,
            definitions,
            variable_mask,
            product_mask: true,
            mask_set: DimensionMaskSet::new(),
        })
    }

    fn has_empty_dimension(&self) -> bool {
        self.dimensions.values().any(|&n| n == 0) || self.definitions.is_empty()
    }

    fn definition(&self, name: &str) -> Option<(usize, &VariableDefinition)> {
        self.definitions
            .iter()
            .enumerate()
            .find(|(i, def)| def.name == name && self.variable_mask[*i])
            .map(|(i, def)| (i, def))
    }

    /// Read one variable in full (unfiltered) as a scratch value for mask
    /// construction.
    fn read_scratch(&self, reader: &mut dyn Reader, name: &str) -> Result<Variable> {
        let (_, def) = self.definition(name).ok_or_else(|| {
            PipelineError::invalid_argument(format!("variable '{name}' is not available"))
        })?;
        let def = def.clone();
        read_definition(reader, &def, None, None)
    }

    /// Execute pushable operations until the first one that must run in
    /// memory. The cursor is left at the first unexecuted operation.
    fn evaluate_prefix(
        &mut self,
        reader: &mut dyn Reader,
        program: &mut Program,
        engine: &ExecutionEngine,
    ) -> Result<()> {
        while !program.finished() {
            let operation = program.current().cloned().expect("cursor bounds checked");
            let pushed = match &operation {
                _ if operation.is_value_filter() => {
                    self.push_value_filter(reader, engine, &operation)?
                }
                _ if operation.is_index_filter() => self.push_index_filter(&operation)?,
                _ if operation.is_point_filter() => {
                    self.push_point_filter(reader, engine, &operation)?
                }
                _ if operation.is_area_filter() => {
                    self.push_area_filter(reader, engine, &operation)?
                }
                Operation::KeepVariable { patterns } => {
                    self.push_keep(patterns)?;
                    true
                }
                Operation::ExcludeVariable { patterns } => {
                    self.push_exclude(patterns)?;
                    true
                }
                Operation::CollocationFilter { filename, side, index_range } => {
                    // Prefilter on the index variable only; the in-memory
                    // engine performs the full join, so the cursor must
                    // not advance past this operation.
                    self.push_collocation_prefilter(
                        reader,
                        engine,
                        filename,
                        *side,
                        *index_range,
                    )?;
                    return Ok(());
                }
                _ => false,
            };

            if !pushed {
                debug!(?operation, "stopping ingestion optimization");
                return Ok(());
            }
            program.advance(1);

            if !self.product_mask || self.mask_set.has_empty() {
                return Ok(());
            }
        }
        Ok(())
    }

    fn push_value_filter(
        &mut self,
        reader: &mut dyn Reader,
        engine: &ExecutionEngine,
        operation: &Operation,
    ) -> Result<bool> {
        let name = operation.variable_name().expect("value filters carry a name");
        if self.definition(name).is_none() {
            // The variable may only exist after derivation; leave the
            // filter to the in-memory engine.
            return Ok(false);
        }
        let variable = self.read_scratch(reader, name)?;
        let predicate = engine.build_value_predicate(operation, &variable)?;

        let dims: Vec<DimensionType> =
            variable.dims.iter().map(|&(dimension_type, _)| dimension_type).collect();
        match dims.as_slice() {
            [] => {
                if !predicate.eval(&variable, 0)? {
                    self.product_mask = false;
                }
                Ok(true)
            }
            [dimension] if !dimension.is_independent() => {
                self.update_1d(*dimension, predicate.as_ref(), &variable)
            }
            [DimensionType::Time, secondary]
                if *secondary != DimensionType::Time && !secondary.is_independent() =>
            {
                self.update_2d(*secondary, predicate.as_ref(), &variable)?;
                Ok(true)
            }
            [DimensionType::Time, rest @ ..]
                if rest.iter().all(|d| d.is_independent())
                    && matches!(operation, Operation::ValidRangeFilter { .. }) =>
            {
                let time_length = variable.dimension_length(0);
                let mask = self.mask_for(DimensionType::Time, time_length)?;
                mask.update_any(predicate.as_ref(), &variable)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// AND a predicate into the 1-D mask of a dimension. An existing
    /// rank-2 mask is first simplified; when its rows differ the filter
    /// cannot be pushed.
    fn update_1d(
        &mut self,
        dimension: DimensionType,
        predicate: &dyn ValuePredicate,
        variable: &Variable,
    ) -> Result<bool> {
        if let Some(existing) = self.mask_set.get(dimension) {
            if existing.rank() == 2 && !existing.rows_identical() {
                return Ok(false);
            }
        }
        self.mask_set.simplify();
        let mask = self.mask_for(dimension, variable.num_elements())?;
        mask.update_all_1d(predicate, variable)?;
        Ok(true)
    }

    fn update_2d(
        &mut self,
        secondary: DimensionType,
        predicate: &dyn ValuePredicate,
        variable: &Variable,
    ) -> Result<()> {
        let rows = variable.dimension_length(0);
        let cols = variable.dimension_length(1);

        // The secondary mask must be rank 2; promote a 1-D leftover from
        // an earlier filter by replicating it along time.
        if self.mask_set.get(secondary).is_some_and(|m| m.rank() == 1) {
            let mask = self.mask_set.get_mut(secondary).expect("mask just checked");
            mask.prepend_dimension(rows)?;
        }
        if self.mask_set.get(secondary).is_none() {
            self.mask_set.insert(secondary, DimensionMask::new_2d(rows, cols))?;
        }
        if self.mask_set.get(DimensionType::Time).is_none() {
            self.mask_set.insert(DimensionType::Time, DimensionMask::new_1d(rows))?;
        }

        let mut time_mask = self.mask_set.remove(DimensionType::Time).expect("just inserted");
        let result = self
            .mask_set
            .get_mut(secondary)
            .expect("just inserted")
            .update_all_2d(&mut time_mask, predicate, variable);
        self.mask_set.insert(DimensionType::Time, time_mask)?;
        result
    }

    fn mask_for(&mut self, dimension: DimensionType, length: usize) -> Result<&mut DimensionMask> {
        if self.mask_set.get(dimension).is_none() {
            self.mask_set.insert(dimension, DimensionMask::new_1d(length))?;
        }
        let mask = self.mask_set.get_mut(dimension).expect("just inserted");
        if mask.rank() != 1 || mask.num_elements() != length {
            return Err(PipelineError::invalid_argument(format!(
                "mask for dimension '{dimension}' does not match length {length}"
            )));
        }
        Ok(mask)
    }

    fn push_index_filter(&mut self, operation: &Operation) -> Result<bool> {
        let (dimension, predicate): (DimensionType, Box<dyn IndexPredicate>) = match operation {
            Operation::IndexComparisonFilter { dimension, op, value } => {
                (*dimension, Box::new(IndexComparisonPredicate::new(*op, *value)))
            }
            Operation::IndexMembershipFilter { dimension, op, values } => (
                *dimension,
                Box::new(IndexMembershipPredicate::new(*op, values.clone())),
            ),
            _ => return Ok(false),
        };
        if dimension.is_independent() {
            return Ok(false);
        }
        let Some(&length) = self.dimensions.get(&dimension) else {
            return Ok(false);
        };
        if let Some(existing) = self.mask_set.get(dimension) {
            if existing.rank() == 2 && !existing.rows_identical() {
                return Ok(false);
            }
        }
        self.mask_set.simplify();
        let bits: Vec<bool> = (0..length).map(|i| predicate.eval(i as i64)).collect();
        let mask = self.mask_for(dimension, length)?;
        mask.intersect_1d(&bits)?;
        Ok(true)
    }

    fn push_point_filter(
        &mut self,
        reader: &mut dyn Reader,
        engine: &ExecutionEngine,
        operation: &Operation,
    ) -> Result<bool> {
        if self.definition("latitude").is_none() || self.definition("longitude").is_none() {
            return Ok(false);
        }
        let latitude = self.canonical_scratch(reader, "latitude", "degree_north")?;
        let longitude = self.canonical_scratch(reader, "longitude", "degree_east")?;
        let predicate = engine.build_point_predicate(operation)?;

        match (latitude.num_dims(), longitude.num_dims()) {
            (0, 0) => {
                let point = SphericalPoint::new(
                    latitude.data.get_f64(0)?,
                    longitude.data.get_f64(0)?,
                );
                if !predicate.eval(&point) {
                    self.product_mask = false;
                }
                Ok(true)
            }
            _ => {
                let time_length = *self
                    .dimensions
                    .get(&DimensionType::Time)
                    .ok_or_else(|| {
                        PipelineError::invalid_argument("point filter needs a time dimension")
                    })?;
                let coordinate = |variable: &Variable, i: usize| -> Result<f64> {
                    Ok(if variable.num_dims() == 0 {
                        variable.data.get_f64(0)?
                    } else {
                        variable.data.get_f64(i)?
                    })
                };
                let bits: Vec<bool> = (0..time_length)
                    .map(|i| {
                        Ok(predicate.eval(&SphericalPoint::new(
                            coordinate(&latitude, i)?,
                            coordinate(&longitude, i)?,
                        )))
                    })
                    .collect::<Result<_>>()?;
                let mask = self.mask_for(DimensionType::Time, time_length)?;
                mask.intersect_1d(&bits)?;
                Ok(true)
            }
        }
    }

    fn push_area_filter(
        &mut self,
        reader: &mut dyn Reader,
        engine: &ExecutionEngine,
        operation: &Operation,
    ) -> Result<bool> {
        if self.definition("latitude_bounds").is_none()
            || self.definition("longitude_bounds").is_none()
        {
            return Ok(false);
        }
        let latitude_bounds = self.canonical_scratch(reader, "latitude_bounds", "degree_north")?;
        let longitude_bounds = self.canonical_scratch(reader, "longitude_bounds", "degree_east")?;
        if latitude_bounds.num_dims() != 2 || longitude_bounds.num_dims() != 2 {
            return Ok(false);
        }
        let vertices = latitude_bounds.dimension_length(1);
        if vertices != longitude_bounds.dimension_length(1) || vertices < 2 {
            return Ok(false);
        }
        let predicate = engine.build_area_predicate(operation)?;

        let time_length = latitude_bounds.dimension_length(0);
        let bits: Vec<bool> = (0..time_length)
            .map(|i| {
                let latitudes: Vec<f64> = (0..vertices)
                    .map(|j| latitude_bounds.data.get_f64(i * vertices + j))
                    .collect::<tropo_product::Result<_>>()?;
                let longitudes: Vec<f64> = (0..vertices)
                    .map(|j| longitude_bounds.data.get_f64(i * vertices + j))
                    .collect::<tropo_product::Result<_>>()?;
                let polygon = SphericalPolygon::from_bounds(&latitudes, &longitudes)?;
                Ok(predicate.eval(&polygon))
            })
            .collect::<Result<_>>()?;
        let mask = self.mask_for(DimensionType::Time, time_length)?;
        mask.intersect_1d(&bits)?;
        Ok(true)
    }

    /// Scratch read with the unit converted to a canonical form.
    fn canonical_scratch(
        &self,
        reader: &mut dyn Reader,
        name: &str,
        unit: &str,
    ) -> Result<Variable> {
        let mut variable = self.read_scratch(reader, name)?;
        if variable.unit.is_some() && variable.unit.as_deref() != Some(unit) {
            crate::units::convert_variable_unit(&mut variable, unit)?;
        }
        Ok(variable)
    }

    fn push_keep(&mut self, patterns: &[String]) -> Result<()> {
        let regexes: Vec<regex::Regex> = patterns
            .iter()
            .map(|p| crate::engine::wildcard_regex(p))
            .collect::<Result<_>>()?;
        for (i, def) in self.definitions.iter().enumerate() {
            if self.variable_mask[i] && !regexes.iter().any(|r| r.is_match(&def.name)) {
                self.variable_mask[i] = false;
            }
        }
        for pattern in patterns {
            let plain = !pattern.contains('*') && !pattern.contains('?');
            if plain && self.definition(pattern).is_none() {
                return Err(PipelineError::operation(format!(
                    "cannot keep non-existent variable {pattern}"
                )));
            }
        }
        Ok(())
    }

    fn push_exclude(&mut self, patterns: &[String]) -> Result<()> {
        let regexes: Vec<regex::Regex> = patterns
            .iter()
            .map(|p| crate::engine::wildcard_regex(p))
            .collect::<Result<_>>()?;
        for (i, def) in self.definitions.iter().enumerate() {
            if self.variable_mask[i] && regexes.iter().any(|r| r.is_match(&def.name)) {
                self.variable_mask[i] = false;
            }
        }
        Ok(())
    }

    fn push_collocation_prefilter(
        &mut self,
        reader: &mut dyn Reader,
        engine: &ExecutionEngine,
        filename: &str,
        side: CollocationSide,
        index_range: Option<(i64, i64)>,
    ) -> Result<()> {
        if self.definition("index").is_none() {
            // Nothing to prefilter against; the in-memory join still runs.
            return Ok(());
        }
        let mask = engine.collocation_mask(filename, side, &self.source_product, index_range)?;
        let predicate = CollocationIndexPredicate::new(mask.sample_indices());
        let variable = self.read_scratch(reader, "index")?;
        if variable.num_dims() == 1 && !variable.dimension_type(0).is_independent() {
            self.update_1d(variable.dimension_type(0), &predicate, &variable)?;
        }
        Ok(())
    }
}

/// Read one variable definition in full or through dimension masks.
fn read_definition(
    reader: &mut dyn Reader,
    def: &VariableDefinition,
    mask_set: Option<&DimensionMaskSet>,
    time_length: Option<usize>,
) -> Result<Variable> {
    let variable = match mask_set {
        None => read_unfiltered(reader, def)?,
        Some(mask_set) => read_masked(reader, def, mask_set, time_length)?,
    };
    Ok(apply_metadata(variable, def))
}

fn apply_metadata(mut variable: Variable, def: &VariableDefinition) -> Variable {
    variable.unit = def.unit.clone();
    variable.valid_min = def.valid_min;
    variable.valid_max = def.valid_max;
    variable.enum_names = def.enum_names.clone();
    variable.description = def.description.clone();
    variable
}

fn read_unfiltered(reader: &mut dyn Reader, def: &VariableDefinition) -> Result<Variable> {
    let mut data = ArrayData::null(def.data_type, def.num_elements());
    match def.access {
        ReadAccess::Whole => reader.read_whole(&def.name, &mut data)?,
        ReadAccess::Block => {
            if def.dims.is_empty() {
                reader.read_block(&def.name, 0, &mut data)?;
            } else {
                let block_elements = def.block_elements();
                let mut block = ArrayData::null(def.data_type, block_elements);
                for outer in 0..def.dims[0].1 {
                    reader.read_block(&def.name, outer, &mut block)?;
                    for i in 0..block_elements {
                        data.copy_element_from(outer * block_elements + i, &block, i)?;
                    }
                }
            }
        }
        ReadAccess::Range { .. } => {
            reader.read_range(&def.name, 0, def.dims.first().map_or(1, |&(_, n)| n), &mut data)?;
        }
    }
    Variable::with_data(def.name.clone(), def.dims.clone(), data).map_err(Into::into)
}

/// Serves outer-dimension blocks of one variable, caching range reads
/// sized by the reader's optimal range length so adjacent block requests
/// hit the same buffered range.
struct BlockCursor<'a> {
    def: &'a VariableDefinition,
    block_elements: usize,
    /// Cached buffer and the outer-index range it covers.
    buffer: Option<(ArrayData, std::ops::Range<usize>)>,
}

impl<'a> BlockCursor<'a> {
    fn new(def: &'a VariableDefinition) -> Self {
        BlockCursor { def, block_elements: def.block_elements(), buffer: None }
    }

    /// Copy block `outer` into `dst` at element offset `offset`.
    fn copy_block(
        &mut self,
        reader: &mut dyn Reader,
        outer: usize,
        dst: &mut ArrayData,
        offset: usize,
    ) -> Result<()> {
        match self.def.access {
            ReadAccess::Block => {
                let mut block = ArrayData::null(self.def.data_type, self.block_elements);
                reader.read_block(&self.def.name, outer, &mut block)?;
                for i in 0..self.block_elements {
                    dst.copy_element_from(offset + i, &block, i)?;
                }
                Ok(())
            }
            ReadAccess::Whole => {
                if self.buffer.is_none() {
                    let mut data = ArrayData::null(self.def.data_type, self.def.num_elements());
                    reader.read_whole(&self.def.name, &mut data)?;
                    self.buffer = Some((data, 0..self.def.dims[0].1));
                }
                self.copy_from_buffer(outer, dst, offset)
            }
            ReadAccess::Range { optimal_length } => {
                let outer_length = self.def.dims[0].1;
                let needs_read = match &self.buffer {
                    Some((_, range)) => !range.contains(&outer),
                    None => true,
                };
                if needs_read {
                    let chunk = optimal_length.clamp(1, outer_length);
                    let start = (outer / chunk) * chunk;
                    let count = chunk.min(outer_length - start);
                    let mut data =
                        ArrayData::null(self.def.data_type, count * self.block_elements);
                    reader.read_range(&self.def.name, start, count, &mut data)?;
                    self.buffer = Some((data, start..start + count));
                }
                self.copy_from_buffer(outer, dst, offset)
            }
        }
    }

    fn copy_from_buffer(&mut self, outer: usize, dst: &mut ArrayData, offset: usize) -> Result<()> {
        let (buffer, range) = self.buffer.as_ref().expect("buffer filled before copy");
        let base = (outer - range.start) * self.block_elements;
        for i in 0..self.block_elements {
            dst.copy_element_from(offset + i, buffer, base + i)?;
        }
        Ok(())
    }
}

fn read_masked(
    reader: &mut dyn Reader,
    def: &VariableDefinition,
    mask_set: &DimensionMaskSet,
    time_length: Option<usize>,
) -> Result<Variable> {
    if def.dims.is_empty() {
        return read_unfiltered(reader, def);
    }

    let applicable: Vec<Option<&DimensionMask>> = def
        .dims
        .iter()
        .map(|&(dimension_type, _)| {
            if dimension_type.is_independent() {
                None
            } else {
                mask_set.get(dimension_type)
            }
        })
        .collect();
    if applicable.iter().all(|m| m.is_none()) {
        return read_unfiltered(reader, def);
    }

    let has_secondary = applicable.iter().skip(1).any(|m| m.is_some());
    let has_2d = applicable.iter().flatten().any(|m| m.rank() == 2);

    // A rank-2 mask on a variable without a leading time axis requires the
    // time broadcast; read in full, broadcast, then filter in memory.
    if has_2d && def.dims.first().map(|&(d, _)| d) != Some(DimensionType::Time) {
        let time_length = time_length.ok_or_else(|| {
            PipelineError::invalid_argument("rank-2 mask requires a known time dimension")
        })?;
        let mut variable = read_unfiltered(reader, def)?;
        variable.prepend_dimension(DimensionType::Time, time_length)?;
        filter_variable(&mut variable, mask_set)?;
        return Ok(variable);
    }

    let outer_length = def.dims[0].1;
    let outer_mask = applicable[0];

    let mut target_dims = def.dims.clone();
    for (axis, mask) in applicable.iter().enumerate() {
        if let Some(mask) = mask {
            target_dims[axis].1 = mask.masked_length();
        }
    }
    let target_elements: usize = target_dims.iter().map(|&(_, n)| n).product();
    let target_inner: Vec<usize> = target_dims[1..].iter().map(|&(_, n)| n).collect();
    let target_block: usize = target_inner.iter().product();
    let source_inner: Vec<usize> = def.dims[1..].iter().map(|&(_, n)| n).collect();

    let mut cursor = BlockCursor::new(def);
    let mut data = ArrayData::null(def.data_type, target_elements);
    let mut scratch = ArrayData::null(def.data_type, def.block_elements());
    let mut written_rows = 0;

    for outer in 0..outer_length {
        if let Some(mask) = outer_mask {
            if !mask.get(outer) {
                continue;
            }
        }
        if !has_secondary {
            cursor.copy_block(reader, outer, &mut data, written_rows * target_block)?;
        } else {
            cursor.copy_block(reader, outer, &mut scratch, 0)?;
            // Per-axis selections for this time step; rank-2 masks
            // contribute their current row.
            let row_masks: Vec<Option<&[bool]>> = applicable
                .iter()
                .skip(1)
                .map(|mask| {
                    mask.map(|m| if m.rank() == 2 { m.row(outer) } else { m.as_slice() })
                })
                .collect();
            copy_filtered_block(
                &scratch,
                &source_inner,
                &row_masks,
                &mut data,
                &target_inner,
                written_rows * target_block,
            )?;
        }
        written_rows += 1;
    }

    Variable::with_data(def.name.clone(), target_dims, data).map_err(Into::into)
}

fn block_strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; dims.len()];
    for i in (0..dims.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * dims[i + 1];
    }
    strides
}

/// Copy the masked elements of one source block into the target layout.
/// The target buffer is pre-nulled, so rows shorter than their allocated
/// width keep the type's null padding.
fn copy_filtered_block(
    src: &ArrayData,
    src_dims: &[usize],
    masks: &[Option<&[bool]>],
    dst: &mut ArrayData,
    dst_dims: &[usize],
    dst_base: usize,
) -> Result<()> {
    let src_strides = block_strides(src_dims);
    let dst_strides = block_strides(dst_dims);

    fn copy_axis(
        src: &ArrayData,
        dst: &mut ArrayData,
        axis: usize,
        src_dims: &[usize],
        src_strides: &[usize],
        src_base: usize,
        dst_strides: &[usize],
        dst_base: usize,
        masks: &[Option<&[bool]>],
    ) -> Result<()> {
        let mut written = 0;
        for s in 0..src_dims[axis] {
            if let Some(mask) = masks[axis] {
                if !mask[s] {
                    continue;
                }
            }
            if axis == src_dims.len() - 1 {
                dst.copy_element_from(dst_base + written, src, src_base + s)?;
            } else {
                copy_axis(
                    src,
                    dst,
                    axis + 1,
                    src_dims,
                    src_strides,
                    src_base + s * src_strides[axis],
                    dst_strides,
                    dst_base + written * dst_strides[axis],
                    masks,
                )?;
            }
            written += 1;
        }
        Ok(())
    }

    if src_dims.is_empty() {
        dst.copy_element_from(dst_base, src, 0)?;
        return Ok(());
    }
    copy_axis(
        src,
        dst,
        0,
        src_dims,
        &src_strides,
        0,
        &dst_strides,
        dst_base,
        masks,
    )
}

/// Read every retained variable. Without optimizer state the whole
/// product is materialized unfiltered.
fn materialize(reader: &mut dyn Reader, state: Option<&OptimizerState>) -> Result<Product> {
    let (definitions, variable_mask, mask_set, source_product, time_length) = match state {
        Some(state) => (
            state.definitions.clone(),
            state.variable_mask.clone(),
            Some(&state.mask_set),
            state.source_product.clone(),
            state.dimensions.get(&DimensionType::Time).copied(),
        ),
        None => {
            let definitions: Vec<VariableDefinition> = reader
                .variables()?
                .into_iter()
                .filter(|def| !reader.exclude(&def.name))
                .collect();
            let len = definitions.len();
            (definitions, vec![true; len], None, reader.source_product(), None)
        }
    };

    let mut product = Product::with_source(source_product);
    for (def, retained) in definitions.iter().zip(&variable_mask) {
        if !retained {
            continue;
        }
        let variable = read_definition(reader, def, mask_set, time_length)?;
        product.add_variable(variable)?;
    }
    product.verify()?;
    Ok(product)
}

/// Convenience entry point: parse the operation string, ingest with the
/// optimizer, run the rest in memory.
pub fn ingest_with_operations(
    reader: &mut dyn Reader,
    operations: &str,
    engine: &ExecutionEngine,
) -> Result<Product> {
    let mut program = Program::from_source(operations)?;
    ingest(reader, &mut program, engine)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collocation::{CollocationMask, CollocationPair, CollocationSource};
    use std::cell::RefCell;
    use std::collections::BTreeMap;

    /// In-memory reader that records which blocks were pulled.
    struct MemoryReader {
        source_product: String,
        dimensions: BTreeMap<DimensionType, usize>,
        variables: Vec<(VariableDefinition, ArrayData)>,
        blocks_read: RefCell<Vec<(String, usize)>>,
        whole_reads: RefCell<Vec<String>>,
    }

    impl MemoryReader {
        fn new(source_product: &str) -> Self {
            MemoryReader {
                source_product: source_product.to_string(),
                dimensions: BTreeMap::new(),
                variables: Vec::new(),
                blocks_read: RefCell::new(Vec::new()),
                whole_reads: RefCell::new(Vec::new()),
            }
        }

        fn with_variable(
            mut self,
            name: &str,
            dims: Vec<(DimensionType, usize)>,
            data: ArrayData,
            access: ReadAccess,
        ) -> Self {
            for &(dimension_type, length) in &dims {
                if !dimension_type.is_independent() {
                    self.dimensions.insert(dimension_type, length);
                }
            }
            self.variables.push((
                VariableDefinition {
                    name: name.to_string(),
                    data_type: data.data_type(),
                    dims,
                    unit: None,
                    valid_min: None,
                    valid_max: None,
                    enum_names: Vec::new(),
                    description: None,
                    access,
                },
                data,
            ));
            self
        }

        fn stored(&self, name: &str) -> &(VariableDefinition, ArrayData) {
            self.variables
                .iter()
                .find(|(def, _)| def.name == name)
                .expect("variable exists")
        }
    }

    impl Reader for MemoryReader {
        fn source_product(&self) -> String {
            self.source_product.clone()
        }

        fn dimensions(&mut self) -> Result<BTreeMap<DimensionType, usize>> {
            Ok(self.dimensions.clone())
        }

        fn variables(&mut self) -> Result<Vec<VariableDefinition>> {
            Ok(self.variables.iter().map(|(def, _)| def.clone()).collect())
        }

        fn read_whole(&mut self, name: &str, dst: &mut ArrayData) -> Result<()> {
            self.whole_reads.borrow_mut().push(name.to_string());
            let (_, data) = self.stored(name);
            let data = data.clone();
            for i in 0..data.len() {
                dst.copy_element_from(i, &data, i)?;
            }
            Ok(())
        }

        fn read_block(&mut self, name: &str, outer_index: usize, dst: &mut ArrayData) -> Result<()> {
            self.blocks_read.borrow_mut().push((name.to_string(), outer_index));
            let (def, data) = self.stored(name);
            let block = def.block_elements();
            let data = data.clone();
            for i in 0..block {
                dst.copy_element_from(i, &data, outer_index * block + i)?;
            }
            Ok(())
        }

        fn read_range(
            &mut self,
            name: &str,
            start: usize,
            count: usize,
            dst: &mut ArrayData,
        ) -> Result<()> {
            let (def, data) = self.stored(name);
            let block = def.block_elements();
            let data = data.clone();
            for i in 0..count * block {
                dst.copy_element_from(i, &data, start * block + i)?;
            }
            Ok(())
        }
    }

    struct StaticCollocation(Vec<(i64, i64)>);

    impl CollocationSource for StaticCollocation {
        fn mask(
            &self,
            _resource: &str,
            _side: CollocationSide,
            _source_product: &str,
            _index_range: Option<(i64, i64)>,
        ) -> Result<CollocationMask> {
            Ok(CollocationMask::new(
                self.0
                    .iter()
                    .map(|&(collocation_index, sample_index)| CollocationPair {
                        collocation_index,
                        sample_index,
                    })
                    .collect(),
            ))
        }
    }

    fn block_reader() -> MemoryReader {
        MemoryReader::new("unit_test_product")
            .with_variable(
                "t",
                vec![(DimensionType::Time, 4)],
                ArrayData::Double(vec![10.0, 20.0, 30.0, 40.0]),
                ReadAccess::Whole,
            )
            .with_variable(
                "profile",
                vec![(DimensionType::Time, 4), (DimensionType::Vertical, 2)],
                ArrayData::Double(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]),
                ReadAccess::Block,
            )
    }

    #[test]
    fn pushed_filter_skips_discarded_blocks() {
        let mut reader = block_reader();
        let engine = ExecutionEngine::new();
        let product =
            ingest_with_operations(&mut reader, "t>15;t<40", &engine).unwrap();

        assert_eq!(product.dimension(DimensionType::Time), Some(2));
        assert_eq!(
            product.variable("t").unwrap().data,
            ArrayData::Double(vec![20.0, 30.0])
        );
        assert_eq!(
            product.variable("profile").unwrap().data,
            ArrayData::Double(vec![3.0, 4.0, 5.0, 6.0])
        );
        // Only the two retained time blocks of `profile` were pulled.
        let blocks = reader.blocks_read.borrow();
        let profile_blocks: Vec<usize> = blocks
            .iter()
            .filter(|(name, _)| name == "profile")
            .map(|&(_, i)| i)
            .collect();
        assert_eq!(profile_blocks, vec![1, 2]);
    }

    #[test]
    fn keep_prevents_reading_excluded_variables() {
        let mut reader = block_reader();
        let engine = ExecutionEngine::new();
        let product = ingest_with_operations(&mut reader, "keep(t)", &engine).unwrap();

        assert!(product.has_variable("t"));
        assert!(!product.has_variable("profile"));
        assert!(reader.blocks_read.borrow().is_empty());
    }

    #[test]
    fn range_reader_matches_whole_reads() {
        let mut ranged = MemoryReader::new("ranged").with_variable(
            "t",
            vec![(DimensionType::Time, 6)],
            ArrayData::Double(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]),
            ReadAccess::Range { optimal_length: 2 },
        );
        let engine = ExecutionEngine::new();
        let product = ingest_with_operations(&mut ranged, "t>2.5", &engine).unwrap();
        assert_eq!(
            product.variable("t").unwrap().data,
            ArrayData::Double(vec![3.0, 4.0, 5.0, 6.0])
        );
    }

    #[test]
    fn collocation_prefilter_then_join() {
        let mut reader = MemoryReader::new("unit_test_product").with_variable(
            "index",
            vec![(DimensionType::Time, 3)],
            ArrayData::Int32(vec![5, 7, 9]),
            ReadAccess::Whole,
        );
        let engine = ExecutionEngine::new().with_collocation_source(Box::new(
            StaticCollocation(vec![(100, 5), (101, 9)]),
        ));
        let product =
            ingest_with_operations(&mut reader, r#"collocate-left("pairs.csv")"#, &engine)
                .unwrap();

        assert_eq!(product.dimension(DimensionType::Time), Some(2));
        assert_eq!(
            product.variable("index").unwrap().data,
            ArrayData::Int32(vec![5, 9])
        );
        assert_eq!(
            product.variable("collocation_index").unwrap().data,
            ArrayData::Int32(vec![100, 101])
        );
    }

    #[test]
    fn unpushable_prefix_runs_in_memory() {
        let mut reader = block_reader();
        let engine = ExecutionEngine::new();
        // rename is not pushable; both operations must still apply.
        let product =
            ingest_with_operations(&mut reader, "rename(t,temperature);temperature>25", &engine)
                .unwrap();
        assert!(product.has_variable("temperature"));
        assert_eq!(
            product.variable("temperature").unwrap().data,
            ArrayData::Double(vec![30.0, 40.0])
        );
    }

    #[test]
    fn optimized_ingest_matches_materialize_then_execute() {
        let operations = "profile>2;t<40";
        let engine = ExecutionEngine::new();

        let mut optimized_reader = block_reader();
        let optimized =
            ingest_with_operations(&mut optimized_reader, operations, &engine).unwrap();

        let mut plain_reader = block_reader();
        let mut plain = materialize(&mut plain_reader, None).unwrap();
        engine.execute_operations(&mut plain, operations).unwrap();

        assert_eq!(
            optimized.variable("t").unwrap().data,
            plain.variable("t").unwrap().data
        );
        assert_eq!(
            optimized.variable("profile").unwrap().data,
            plain.variable("profile").unwrap().data
        );
        assert_eq!(optimized.dimensions(), plain.dimensions());
    }

    #[test]
    fn empty_mask_yields_empty_product_without_reads() {
        let mut reader = block_reader();
        let engine = ExecutionEngine::new();
        let product = ingest_with_operations(&mut reader, "t>100", &engine).unwrap();
        assert!(product.is_empty());
        assert!(reader.blocks_read.borrow().is_empty());
    }
}

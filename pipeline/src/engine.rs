//! The in-memory execution engine.
//!
//! Walks a program sequentially and dispatches per operation variant.
//! Three fusion rules coalesce scans without changing semantics:
//! consecutive value filters on the same variable, consecutive point
//! filters, and consecutive area filters each run as a single pass.
//! A product becoming empty short-circuits the remaining program with
//! success.

use rayon::prelude::*;
use tracing::debug;
use tropo_product::{DataType, DimensionType, Product, Variable};

use crate::collocation::{
    self, CollocationSide, CollocationSource, CollocationTable, FsCollocationSource,
};
use crate::derive;
use crate::error::{PipelineError, Result};
use crate::filter::filter_product;
use crate::geometry::{AreaMask, SphericalPoint, SphericalPolygon};
use crate::kernels;
use crate::mask::{DimensionMask, DimensionMaskSet};
use crate::operation::{AreaSpec, Operation};
use crate::options;
use crate::predicate::{
    AreaCoversAreaPredicate, AreaCoversPointPredicate, AreaInsideAreaPredicate,
    AreaIntersectsAreaPredicate, AreaPredicate, BitMaskPredicate, ComparisonPredicate,
    IndexComparisonPredicate, IndexMembershipPredicate, IndexPredicate, LongitudeRangePredicate,
    MembershipPredicate, PointDistancePredicate, PointInAreaPredicate, PointPredicate,
    StringComparisonPredicate, StringMembershipPredicate, ValidRangePredicate, ValuePredicate,
};
use crate::program::Program;

/// Loads polygon area files referenced by operations.
pub trait AreaResolver: Send + Sync {
    fn area_mask(&self, filename: &str) -> Result<AreaMask>;
}

/// Area resolver backed by files on disk.
#[derive(Debug, Clone, Default)]
pub struct FsAreaResolver;

impl AreaResolver for FsAreaResolver {
    fn area_mask(&self, filename: &str) -> Result<AreaMask> {
        let text = std::fs::read_to_string(filename).map_err(|e| {
            PipelineError::import(format!("could not read area mask '{filename}': {e}"))
        })?;
        AreaMask::parse(&text)
    }
}

/// Imports collocated products for the `*-collocated-*` operations.
pub trait DatasetResolver: Send + Sync {
    /// Import a product from an explicit file.
    fn import(&self, filename: &str) -> Result<Product>;

    /// Import a product by source-product name from a dataset directory.
    fn import_from_dir(&self, dataset_dir: &str, source_product: &str) -> Result<Product>;
}

/// External vertical smoothing kernels.
pub trait SmoothingKernel: Send + Sync {
    fn smooth_vertical(
        &self,
        product: &mut Product,
        variables: &[String],
        axis_variable: &str,
        axis_unit: Option<&str>,
        collocated: &Product,
    ) -> Result<()>;

    fn derive_smoothed_column(
        &self,
        product: &Product,
        variable: &str,
        dimensions: &[DimensionType],
        unit: Option<&str>,
        axis_variable: &str,
        axis_unit: Option<&str>,
        collocated: &Product,
    ) -> Result<Variable>;
}

/// The engine with its external collaborators.
pub struct ExecutionEngine {
    collocation: Box<dyn CollocationSource>,
    areas: Box<dyn AreaResolver>,
    datasets: Option<Box<dyn DatasetResolver>>,
    smoothing: Option<Box<dyn SmoothingKernel>>,
}

impl Default for ExecutionEngine {
    fn default() -> Self {
        ExecutionEngine {
            collocation: Box::new(FsCollocationSource),
            areas: Box::new(FsAreaResolver),
            datasets: None,
            smoothing: None,
        }
    }
}

impl ExecutionEngine {
    pub fn new() -> Self {
        ExecutionEngine::default()
    }

    pub fn with_collocation_source(mut self, source: Box<dyn CollocationSource>) -> Self {
        self.collocation = source;
        self
    }

    pub fn with_area_resolver(mut self, resolver: Box<dyn AreaResolver>) -> Self {
        self.areas = resolver;
        self
    }

    pub fn with_dataset_resolver(mut self, resolver: Box<dyn DatasetResolver>) -> Self {
        self.datasets = Some(resolver);
        self
    }

    pub fn with_smoothing_kernel(mut self, kernel: Box<dyn SmoothingKernel>) -> Self {
        self.smoothing = Some(kernel);
        self
    }

    /// Parse and execute an operation string against a product.
    pub fn execute_operations(&self, product: &mut Product, source: &str) -> Result<()> {
        let mut program = Program::from_source(source)?;
        self.execute(product, &mut program)
    }

    /// Execute a program starting at its cursor.
    pub fn execute(&self, product: &mut Product, program: &mut Program) -> Result<()> {
        while !program.finished() {
            if product.is_empty() {
                debug!("product is empty; skipping the remaining program");
                return Ok(());
            }
            let operation = program.current().cloned().expect("cursor bounds checked");
            self.dispatch(product, program, &operation)?;
            program.advance(1);
        }
        Ok(())
    }

    fn dispatch(
        &self,
        product: &mut Product,
        program: &mut Program,
        operation: &Operation,
    ) -> Result<()> {
        match operation {
            _ if operation.is_value_filter() => self.execute_value_filter(product, program),
            _ if operation.is_point_filter() => self.execute_point_filter(product, program),
            _ if operation.is_area_filter() => self.execute_area_filter(product, program),
            Operation::IndexComparisonFilter { dimension, op, value } => {
                self.execute_index_filter(product, *dimension, &IndexComparisonPredicate::new(*op, *value))
            }
            Operation::IndexMembershipFilter { dimension, op, values } => self.execute_index_filter(
                product,
                *dimension,
                &IndexMembershipPredicate::new(*op, values.clone()),
            ),
            Operation::CollocationFilter { filename, side, index_range } => {
                self.execute_collocation_filter(product, filename, *side, *index_range)
            }
            Operation::KeepVariable { patterns } => execute_keep(product, patterns),
            Operation::ExcludeVariable { patterns } => execute_exclude(product, patterns),
            Operation::Rename { from, to } => execute_rename(product, from, to),
            Operation::Set { option, value } => options::apply_set(option, value),
            Operation::DeriveVariable { variable, data_type, dimensions, unit } => {
                derive::execute_derive(
                    product,
                    variable,
                    *data_type,
                    dimensions.as_deref(),
                    unit.as_deref(),
                )
            }
            Operation::Sort { variables } => kernels::sort(product, variables),
            Operation::Squash { dimension, variables } => {
                kernels::squash(product, *dimension, variables)
            }
            Operation::Flatten { dimension } => kernels::flatten(product, *dimension),
            Operation::Wrap { variable, unit, min, max } => {
                kernels::wrap(product, variable, unit.as_deref(), *min, *max)
            }
            Operation::Clamp { dimension, axis_variable, axis_unit, bounds } => {
                kernels::clamp(product, *dimension, axis_variable, axis_unit.as_deref(), *bounds)
            }
            Operation::BinFull => kernels::bin_full(product),
            Operation::BinWithVariables { variables } => {
                kernels::bin_with_variables(product, variables)
            }
            Operation::BinSpatial { latitude_edges, longitude_edges } => {
                kernels::bin_spatial(product, latitude_edges, longitude_edges)
            }
            Operation::BinCollocated { collocation_result, target } => {
                self.execute_bin_collocated(product, collocation_result, *target)
            }
            Operation::Regrid { dimension, axis_variable, axis_unit, values, bounds } => {
                match bounds {
                    Some(bounds) => {
                        if bounds.len() != values.len() + 1 {
                            return Err(PipelineError::invalid_argument(format!(
                                "regrid bounds need {} edges for {} axis values, got {}",
                                values.len() + 1,
                                values.len(),
                                bounds.len()
                            )));
                        }
                        kernels::rebin(product, *dimension, axis_variable, axis_unit.as_deref(), bounds)?;
                        let axis = product.variable_mut(axis_variable)?;
                        axis.data = tropo_product::ArrayData::Double(values.clone())
                            .convert(axis.data_type())?;
                        Ok(())
                    }
                    None => kernels::regrid(
                        product,
                        *dimension,
                        axis_variable,
                        axis_unit.as_deref(),
                        values,
                    ),
                }
            }
            Operation::Rebin { dimension, axis_variable, axis_unit, edges } => {
                kernels::rebin(product, *dimension, axis_variable, axis_unit.as_deref(), edges)
            }
            Operation::RegridCollocatedProduct { dimension, axis_variable, axis_unit, filename } => {
                let collocated = self.resolve_dataset()?.import(filename)?;
                self.regrid_onto_collocated(product, *dimension, axis_variable, axis_unit.as_deref(), &collocated)
            }
            Operation::RegridCollocatedDataset {
                dimension,
                axis_variable,
                axis_unit,
                collocation_result,
                target,
                dataset_dir,
            } => {
                let collocated = self.import_paired_product(product, collocation_result, *target, dataset_dir)?;
                self.regrid_onto_collocated(product, *dimension, axis_variable, axis_unit.as_deref(), &collocated)
            }
            Operation::SmoothCollocatedProduct {
                variables,
                dimension,
                axis_variable,
                axis_unit,
                filename,
            } => {
                check_vertical(*dimension)?;
                let collocated = self.resolve_dataset()?.import(filename)?;
                self.resolve_smoothing()?.smooth_vertical(
                    product,
                    variables,
                    axis_variable,
                    axis_unit.as_deref(),
                    &collocated,
                )
            }
            Operation::SmoothCollocatedDataset {
                variables,
                dimension,
                axis_variable,
                axis_unit,
                collocation_result,
                target,
                dataset_dir,
            } => {
                check_vertical(*dimension)?;
                let collocated = self.import_paired_product(product, collocation_result, *target, dataset_dir)?;
                self.resolve_smoothing()?.smooth_vertical(
                    product,
                    variables,
                    axis_variable,
                    axis_unit.as_deref(),
                    &collocated,
                )
            }
            Operation::DeriveSmoothedColumnCollocatedProduct {
                variable,
                dimensions,
                unit,
                axis_variable,
                axis_unit,
                filename,
            } => {
                let collocated = self.resolve_dataset()?.import(filename)?;
                let smoothed = self.resolve_smoothing()?.derive_smoothed_column(
                    product,
                    variable,
                    dimensions,
                    unit.as_deref(),
                    axis_variable,
                    axis_unit.as_deref(),
                    &collocated,
                )?;
                if product.has_variable(&smoothed.name) {
                    product.replace_variable(smoothed)?;
                } else {
                    product.add_variable(smoothed)?;
                }
                Ok(())
            }
            Operation::DeriveSmoothedColumnCollocatedDataset {
                variable,
                dimensions,
                unit,
                axis_variable,
                axis_unit,
                collocation_result,
                target,
                dataset_dir,
            } => {
                let collocated = self.import_paired_product(product, collocation_result, *target, dataset_dir)?;
                let smoothed = self.resolve_smoothing()?.derive_smoothed_column(
                    product,
                    variable,
                    dimensions,
                    unit.as_deref(),
                    axis_variable,
                    axis_unit.as_deref(),
                    &collocated,
                )?;
                if product.has_variable(&smoothed.name) {
                    product.replace_variable(smoothed)?;
                } else {
                    product.add_variable(smoothed)?;
                }
                Ok(())
            }
            // Filter variants are handled by the guards above.
            _ => Err(PipelineError::operation(format!(
                "operation {operation:?} is not executable"
            ))),
        }
    }

    /// Build the runtime predicate for a value-filter operation, resolving
    /// the target variable's unit, data type and valid range.
    pub(crate) fn build_value_predicate(
        &self,
        operation: &Operation,
        variable: &Variable,
    ) -> Result<Box<dyn ValuePredicate>> {
        if operation.is_string_value_filter()
            && variable.data_type() != DataType::Str
            && !variable.is_enumerated()
        {
            return Err(PipelineError::operation(format!(
                "string filter cannot be applied to variable '{}' of type '{}'",
                variable.name,
                variable.data_type()
            )));
        }
        let variable_unit = variable.unit.as_deref();
        match operation {
            Operation::ComparisonFilter { op, value, unit, .. } => Ok(Box::new(
                ComparisonPredicate::new(*op, *value, unit.as_deref(), variable_unit, variable.data_type())?,
            )),
            Operation::StringComparisonFilter { op, value, .. } => {
                Ok(Box::new(StringComparisonPredicate::new(*op, value.clone())))
            }
            Operation::MembershipFilter { op, values, unit, .. } => Ok(Box::new(
                MembershipPredicate::new(*op, values.clone(), unit.as_deref(), variable_unit, variable.data_type())?,
            )),
            Operation::StringMembershipFilter { op, values, .. } => Ok(Box::new(
                StringMembershipPredicate::new(*op, values.clone()),
            )),
            Operation::BitMaskFilter { op, mask, .. } => {
                Ok(Box::new(BitMaskPredicate::new(*op, *mask, variable.data_type())?))
            }
            Operation::ValidRangeFilter { invert, .. } => {
                Ok(Box::new(ValidRangePredicate::for_variable(variable, *invert)?))
            }
            Operation::LongitudeRangeFilter { min, max } => Ok(Box::new(
                LongitudeRangePredicate::new(*min, *max, Some("degree_east"), variable_unit)?,
            )),
            _ => Err(PipelineError::operation(format!(
                "operation {operation:?} is not a value filter"
            ))),
        }
    }

    /// Fused scan over consecutive value filters on one variable.
    fn execute_value_filter(&self, product: &mut Product, program: &mut Program) -> Result<()> {
        let head = program.current().expect("value filter at cursor");
        let variable_name = head
            .variable_name()
            .expect("value filters carry a variable name")
            .to_string();

        let mut count = 1;
        while let Some(next) = program.peek(count) {
            if next.is_value_filter() && next.variable_name() == Some(variable_name.as_str()) {
                count += 1;
            } else {
                break;
            }
        }
        debug!(variable = %variable_name, fused = count, "value filter");

        // Scalar variables decide pass/fail directly; dimensioned ones
        // accumulate masks to apply afterwards.
        let mut scalar_passed = true;
        let mut mask_set = DimensionMaskSet::new();
        {
            let variable = product.variable(&variable_name)?;
            let predicates: Vec<Box<dyn ValuePredicate>> = (0..count)
                .map(|k| {
                    self.build_value_predicate(
                        program.peek(k).expect("fused range is in bounds"),
                        variable,
                    )
                })
                .collect::<Result<_>>()?;

            let dims: Vec<DimensionType> =
                variable.dims.iter().map(|&(dimension_type, _)| dimension_type).collect();
            match dims.as_slice() {
                [] => {
                    for predicate in &predicates {
                        if !predicate.eval(variable, 0)? {
                            scalar_passed = false;
                            break;
                        }
                    }
                }
                [dimension] if !dimension.is_independent() => {
                    let mut mask = DimensionMask::new_1d(variable.num_elements());
                    for predicate in &predicates {
                        mask.update_all_1d(predicate.as_ref(), variable)?;
                    }
                    mask_set.insert(*dimension, mask)?;
                }
                [DimensionType::Time, secondary]
                    if *secondary != DimensionType::Time && !secondary.is_independent() =>
                {
                    let mut time_mask = DimensionMask::new_1d(variable.dimension_length(0));
                    let mut mask = DimensionMask::new_2d(
                        variable.dimension_length(0),
                        variable.dimension_length(1),
                    );
                    for predicate in &predicates {
                        mask.update_all_2d(&mut time_mask, predicate.as_ref(), variable)?;
                    }
                    mask_set.insert(DimensionType::Time, time_mask)?;
                    mask_set.insert(*secondary, mask)?;
                }
                [DimensionType::Time, rest @ ..]
                    if rest.iter().all(|d| d.is_independent())
                        && program_range_is_valid_range(program, count) =>
                {
                    // Valid-range filters over (time, independent...) keep a
                    // time step when any inner element passes.
                    let mut mask = DimensionMask::new_1d(variable.dimension_length(0));
                    for predicate in &predicates {
                        mask.update_any(predicate.as_ref(), variable)?;
                    }
                    mask_set.insert(DimensionType::Time, mask)?;
                }
                _ => {
                    return Err(PipelineError::operation(format!(
                        "variable '{variable_name}' has invalid dimensions for filtering"
                    )));
                }
            }
        }

        if !scalar_passed {
            product.clear();
        } else {
            filter_product(product, &mask_set)?;
        }
        program.advance(count - 1);
        Ok(())
    }

    /// Fused scan over consecutive point filters.
    fn execute_point_filter(&self, product: &mut Product, program: &mut Program) -> Result<()> {
        let mut count = 1;
        while let Some(next) = program.peek(count) {
            if next.is_point_filter() {
                count += 1;
            } else {
                break;
            }
        }

        let predicates: Vec<Box<dyn PointPredicate>> = (0..count)
            .map(|k| self.build_point_predicate(program.peek(k).expect("fused range")))
            .collect::<Result<_>>()?;

        let latitude = derive::derived_variable(
            product,
            "latitude",
            DataType::Double,
            Some("degree_north"),
            &[DimensionType::Time],
        )?;
        let longitude = derive::derived_variable(
            product,
            "longitude",
            DataType::Double,
            Some("degree_east"),
            &[DimensionType::Time],
        )?;

        let points: Vec<SphericalPoint> = (0..latitude.num_elements())
            .map(|i| {
                Ok(SphericalPoint::new(
                    latitude.data.get_f64(i)?,
                    longitude.data.get_f64(i)?,
                ))
            })
            .collect::<tropo_product::Result<_>>()?;

        let keep: Vec<bool> = points
            .par_iter()
            .map(|point| predicates.iter().all(|p| p.eval(point)))
            .collect();

        debug!(
            fused = count,
            retained = keep.iter().filter(|&&b| b).count(),
            total = keep.len(),
            "point filter"
        );
        product.filter_dimension(DimensionType::Time, &keep)?;
        program.advance(count - 1);
        Ok(())
    }

    pub(crate) fn build_point_predicate(&self, operation: &Operation) -> Result<Box<dyn PointPredicate>> {
        match operation {
            Operation::PointDistanceFilter { point, distance_m } => {
                Ok(Box::new(PointDistancePredicate::new(*point, *distance_m)))
            }
            Operation::PointInAreaFilter { area } => {
                Ok(Box::new(PointInAreaPredicate::new(self.resolve_area(area)?)))
            }
            _ => Err(PipelineError::operation(format!(
                "operation {operation:?} is not a point filter"
            ))),
        }
    }

    /// Fused scan over consecutive area filters.
    fn execute_area_filter(&self, product: &mut Product, program: &mut Program) -> Result<()> {
        let mut count = 1;
        while let Some(next) = program.peek(count) {
            if next.is_area_filter() {
                count += 1;
            } else {
                break;
            }
        }

        let predicates: Vec<Box<dyn AreaPredicate>> = (0..count)
            .map(|k| self.build_area_predicate(program.peek(k).expect("fused range")))
            .collect::<Result<_>>()?;

        let bounds_dims = [DimensionType::Time, DimensionType::Independent];
        let latitude_bounds = derive::derived_variable(
            product,
            "latitude_bounds",
            DataType::Double,
            Some("degree_north"),
            &bounds_dims,
        )?;
        let longitude_bounds = derive::derived_variable(
            product,
            "longitude_bounds",
            DataType::Double,
            Some("degree_east"),
            &bounds_dims,
        )?;

        let num_vertices = latitude_bounds.dimension_length(1);
        if num_vertices != longitude_bounds.dimension_length(1) {
            return Err(PipelineError::invalid_argument(format!(
                "the independent dimension of 'latitude_bounds' ({num_vertices}) does not match \
                 'longitude_bounds' ({})",
                longitude_bounds.dimension_length(1)
            )));
        }
        if num_vertices < 2 {
            return Err(PipelineError::invalid_argument(
                "'latitude_bounds' and 'longitude_bounds' need an independent length of 2 or more",
            ));
        }

        let num_areas = latitude_bounds.dimension_length(0);
        let polygons: Vec<SphericalPolygon> = (0..num_areas)
            .map(|i| {
                let latitudes: Vec<f64> = (0..num_vertices)
                    .map(|j| latitude_bounds.data.get_f64(i * num_vertices + j))
                    .collect::<tropo_product::Result<_>>()?;
                let longitudes: Vec<f64> = (0..num_vertices)
                    .map(|j| longitude_bounds.data.get_f64(i * num_vertices + j))
                    .collect::<tropo_product::Result<_>>()?;
                SphericalPolygon::from_bounds(&latitudes, &longitudes)
            })
            .collect::<Result<_>>()?;

        let keep: Vec<bool> = polygons
            .par_iter()
            .map(|polygon| predicates.iter().all(|p| p.eval(polygon)))
            .collect();

        product.filter_dimension(DimensionType::Time, &keep)?;
        program.advance(count - 1);
        Ok(())
    }

    pub(crate) fn build_area_predicate(&self, operation: &Operation) -> Result<Box<dyn AreaPredicate>> {
        match operation {
            Operation::AreaCoversPoint { point } => {
                Ok(Box::new(AreaCoversPointPredicate::new(*point)))
            }
            Operation::AreaCoversArea { area } => {
                Ok(Box::new(AreaCoversAreaPredicate::new(self.resolve_area(area)?)))
            }
            Operation::AreaInsideArea { area } => {
                Ok(Box::new(AreaInsideAreaPredicate::new(self.resolve_area(area)?)))
            }
            Operation::AreaIntersectsArea { area, min_fraction } => Ok(Box::new(
                AreaIntersectsAreaPredicate::new(self.resolve_area(area)?, *min_fraction),
            )),
            _ => Err(PipelineError::operation(format!(
                "operation {operation:?} is not an area filter"
            ))),
        }
    }

    fn resolve_area(&self, area: &AreaSpec) -> Result<AreaMask> {
        match area {
            AreaSpec::Inline(mask) => Ok(mask.clone()),
            AreaSpec::File(filename) => self.areas.area_mask(filename),
        }
    }

    fn execute_index_filter(
        &self,
        product: &mut Product,
        dimension: DimensionType,
        predicate: &dyn IndexPredicate,
    ) -> Result<()> {
        if dimension.is_independent() {
            return Err(PipelineError::operation(
                "index filters cannot apply to the independent dimension",
            ));
        }
        let Some(length) = product.dimension(dimension) else {
            return Ok(());
        };
        if length == 0 {
            return Ok(());
        }
        let mut mask_set = DimensionMaskSet::new();
        let bits: Vec<bool> = (0..length).map(|i| predicate.eval(i as i64)).collect();
        mask_set.insert(dimension, DimensionMask::from_bits(bits))?;
        filter_product(product, &mask_set)
    }

    fn execute_collocation_filter(
        &self,
        product: &mut Product,
        filename: &str,
        side: CollocationSide,
        index_range: Option<(i64, i64)>,
    ) -> Result<()> {
        let source_product = product.source_product.clone().ok_or_else(|| {
            PipelineError::invalid_argument("product attribute 'source_product' is not set")
        })?;

        // The join needs either variable; derive the row enumeration when
        // neither survived ingestion.
        if !product.has_variable("collocation_index") && !product.has_variable("index") {
            derive::execute_derive(
                product,
                "index",
                Some(DataType::Int32),
                Some(&[DimensionType::Time]),
                None,
            )?;
        }

        let mut mask = self
            .collocation
            .mask(filename, side, &source_product, index_range)?;
        collocation::apply_collocation_mask(product, &mut mask)
    }

    fn execute_bin_collocated(
        &self,
        product: &mut Product,
        collocation_result: &str,
        target: CollocationSide,
    ) -> Result<()> {
        let table = self.load_collocation_table(collocation_result)?;
        let variable = product.variable("collocation_index")?;
        let collocation_indices: Vec<i64> = (0..variable.num_elements())
            .map(|i| variable.data.get_f64(i).map(|v| v as i64))
            .collect::<tropo_product::Result<_>>()?;

        // Group this product's rows by the paired sample on the target
        // side, ascending.
        let mut keyed: Vec<(i64, usize)> = Vec::with_capacity(collocation_indices.len());
        for (row, collocation_index) in collocation_indices.iter().enumerate() {
            let sample = table
                .target_sample_index(*collocation_index, target)
                .ok_or_else(|| {
                    PipelineError::operation(format!(
                        "collocation index {collocation_index} is not present in '{collocation_result}'"
                    ))
                })?;
            keyed.push((sample, row));
        }
        keyed.sort_by_key(|&(sample, _)| sample);

        let mut groups: Vec<Vec<usize>> = Vec::new();
        let mut last_sample: Option<i64> = None;
        for (sample, row) in keyed {
            if last_sample == Some(sample) {
                groups.last_mut().expect("group exists").push(row);
            } else {
                groups.push(vec![row]);
                last_sample = Some(sample);
            }
        }
        kernels::bin_groups(product, &groups)
    }

    /// Regrid the product onto the axis carried by a collocated product.
    fn regrid_onto_collocated(
        &self,
        product: &mut Product,
        dimension: DimensionType,
        axis_variable: &str,
        axis_unit: Option<&str>,
        collocated: &Product,
    ) -> Result<()> {
        let axis = collocated.variable(axis_variable)?;
        if axis.num_dims() != 1 || axis.dimension_type(0) != dimension {
            return Err(PipelineError::operation(format!(
                "axis variable '{axis_variable}' of the collocated product must be 1-D over \
                 the '{dimension}' dimension"
            )));
        }
        let targets: Vec<f64> = (0..axis.num_elements())
            .map(|i| axis.data.get_f64(i))
            .collect::<tropo_product::Result<_>>()?;
        kernels::regrid(product, dimension, axis_variable, axis_unit, &targets)
    }

    /// Import the product paired with this one through a collocation
    /// result, from a dataset directory.
    fn import_paired_product(
        &self,
        product: &Product,
        collocation_result: &str,
        target: CollocationSide,
        dataset_dir: &str,
    ) -> Result<Product> {
        let source_product = product.source_product.clone().ok_or_else(|| {
            PipelineError::invalid_argument("product attribute 'source_product' is not set")
        })?;
        let table = self.load_collocation_table(collocation_result)?;
        let own_side = match target {
            CollocationSide::A => CollocationSide::B,
            CollocationSide::B => CollocationSide::A,
        };
        let paired = table
            .paired_source_product(own_side, &source_product)
            .ok_or_else(|| {
                PipelineError::operation(format!(
                    "'{collocation_result}' holds no pairs for source product '{source_product}'"
                ))
            })?;
        self.resolve_dataset()?.import_from_dir(dataset_dir, &paired)
    }

    /// Load a collocation mask through the configured source.
    pub(crate) fn collocation_mask(
        &self,
        resource: &str,
        side: CollocationSide,
        source_product: &str,
        index_range: Option<(i64, i64)>,
    ) -> Result<crate::collocation::CollocationMask> {
        self.collocation.mask(resource, side, source_product, index_range)
    }

    fn load_collocation_table(&self, resource: &str) -> Result<CollocationTable> {
        let text = std::fs::read_to_string(resource).map_err(|e| {
            PipelineError::import(format!("could not read collocation result '{resource}': {e}"))
        })?;
        CollocationTable::parse(&text)
    }

    fn resolve_dataset(&self) -> Result<&dyn DatasetResolver> {
        self.datasets.as_deref().ok_or_else(|| {
            PipelineError::import("no dataset importer is configured for collocated operations")
        })
    }

    fn resolve_smoothing(&self) -> Result<&dyn SmoothingKernel> {
        self.smoothing.as_deref().ok_or_else(|| {
            PipelineError::operation("no vertical smoothing kernel is configured")
        })
    }
}

fn check_vertical(dimension: DimensionType) -> Result<()> {
    if dimension != DimensionType::Vertical {
        return Err(PipelineError::operation(format!(
            "smoothing of '{dimension}' dimension not supported"
        )));
    }
    Ok(())
}

/// Whether every fused operation in `[cursor, cursor + count)` is a
/// valid-range filter; only those support the any-element reduction.
fn program_range_is_valid_range(program: &Program, count: usize) -> bool {
    (0..count).all(|k| {
        matches!(program.peek(k), Some(Operation::ValidRangeFilter { .. }))
    })
}

/// Compile a shell-style wildcard into an anchored regex.
pub(crate) fn wildcard_regex(pattern: &str) -> Result<regex::Regex> {
    let mut expression = String::with_capacity(pattern.len() + 8);
    expression.push('^');
    for c in pattern.chars() {
        match c {
            '*' => expression.push_str(".*"),
            '?' => expression.push('.'),
            other => expression.push_str(&regex::escape(&other.to_string())),
        }
    }
    expression.push('$');
    regex::Regex::new(&expression)
        .map_err(|e| PipelineError::invalid_argument(format!("invalid pattern '{pattern}': {e}")))
}

fn has_wildcards(pattern: &str) -> bool {
    pattern.contains('*') || pattern.contains('?')
}

/// Keep the variables matching any pattern. Non-wildcard patterns that
/// match nothing are an error.
fn execute_keep(product: &mut Product, patterns: &[String]) -> Result<()> {
    let regexes: Vec<regex::Regex> =
        patterns.iter().map(|p| wildcard_regex(p)).collect::<Result<_>>()?;
    let names: Vec<String> = product.variable_names().iter().map(|s| s.to_string()).collect();
    for name in &names {
        if !regexes.iter().any(|r| r.is_match(name)) {
            product.remove_variable(name)?;
        }
    }
    for pattern in patterns {
        if !has_wildcards(pattern) && !product.has_variable(pattern) {
            return Err(PipelineError::operation(format!(
                "cannot keep non-existent variable {pattern}"
            )));
        }
    }
    Ok(())
}

/// Remove the variables matching any pattern; misses are ignored.
fn execute_exclude(product: &mut Product, patterns: &[String]) -> Result<()> {
    let regexes: Vec<regex::Regex> =
        patterns.iter().map(|p| wildcard_regex(p)).collect::<Result<_>>()?;
    let names: Vec<String> = product.variable_names().iter().map(|s| s.to_string()).collect();
    for name in &names {
        if regexes.iter().any(|r| r.is_match(name)) {
            product.remove_variable(name)?;
        }
    }
    Ok(())
}

/// Rename a variable. Renaming an absent source onto a present target is
/// a success no-op, which makes re-execution idempotent.
fn execute_rename(product: &mut Product, from: &str, to: &str) -> Result<()> {
    if !product.has_variable(from) && product.has_variable(to) {
        return Ok(());
    }
    if product.has_variable(to) {
        return Err(PipelineError::operation(format!(
            "cannot rename '{from}' to '{to}'; the target variable already exists"
        )));
    }
    let mut variable = product.detach_variable(from)?;
    variable.name = to.to_string();
    product.add_variable(variable)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tropo_product::ArrayData;

    fn time_product(values: Vec<f64>) -> Product {
        let mut product = Product::new();
        let len = values.len();
        product
            .add_variable(
                Variable::with_data(
                    "t",
                    vec![(DimensionType::Time, len)],
                    ArrayData::Double(values),
                )
                .unwrap(),
            )
            .unwrap();
        product
    }

    #[test]
    fn chained_filters_narrow_the_time_dimension() {
        let mut product = time_product(vec![10.0, 20.0, 30.0, 40.0]);
        ExecutionEngine::new()
            .execute_operations(&mut product, "t>15;t<40")
            .unwrap();
        assert_eq!(product.dimension(DimensionType::Time), Some(2));
        assert_eq!(
            product.variable("t").unwrap().data,
            ArrayData::Double(vec![20.0, 30.0])
        );
    }

    #[test]
    fn fusion_matches_sequential_execution() {
        let engine = ExecutionEngine::new();

        let mut fused = time_product(vec![5.0, 10.0, 15.0, 20.0, 25.0]);
        engine.execute_operations(&mut fused, "t>5;t<25;t!=15").unwrap();

        let mut sequential = time_product(vec![5.0, 10.0, 15.0, 20.0, 25.0]);
        engine.execute_operations(&mut sequential, "t>5").unwrap();
        engine.execute_operations(&mut sequential, "t<25").unwrap();
        engine.execute_operations(&mut sequential, "t!=15").unwrap();

        assert_eq!(
            fused.variable("t").unwrap().data,
            sequential.variable("t").unwrap().data
        );
    }

    #[test]
    fn scalar_filter_can_empty_the_product() {
        let mut product = Product::new();
        product
            .add_variable(Variable::scalar("flag", ArrayData::Int32(vec![0])).unwrap())
            .unwrap();
        ExecutionEngine::new()
            .execute_operations(&mut product, "flag == 1")
            .unwrap();
        assert!(product.is_empty());
    }

    #[test]
    fn keep_and_exclude_with_wildcards() {
        let mut product = Product::new();
        for name in ["time", "t1", "t2", "tmp_a", "other"] {
            product
                .add_variable(
                    Variable::with_data(
                        name,
                        vec![(DimensionType::Time, 1)],
                        ArrayData::Double(vec![0.0]),
                    )
                    .unwrap(),
                )
                .unwrap();
        }
        ExecutionEngine::new()
            .execute_operations(&mut product, "keep(time,t*);exclude(tmp_*)")
            .unwrap();
        assert_eq!(product.variable_names(), vec!["time", "t1", "t2"]);
    }

    #[test]
    fn keep_errors_on_missing_plain_name() {
        let mut product = time_product(vec![1.0]);
        let error = ExecutionEngine::new()
            .execute_operations(&mut product, "keep(nope)")
            .unwrap_err();
        assert!(matches!(error, PipelineError::Operation { .. }));
    }

    #[test]
    fn rename_twice_is_idempotent() {
        let mut product = time_product(vec![1.0]);
        product
            .add_variable(
                Variable::with_data(
                    "a",
                    vec![(DimensionType::Time, 1)],
                    ArrayData::Double(vec![2.0]),
                )
                .unwrap(),
            )
            .unwrap();
        ExecutionEngine::new()
            .execute_operations(&mut product, "rename(a,b);rename(a,b)")
            .unwrap();
        assert!(product.has_variable("b"));
        assert!(!product.has_variable("a"));
    }

    #[test]
    fn point_distance_keeps_nearby_samples() {
        let mut product = Product::new();
        product
            .add_variable(
                Variable::with_data(
                    "latitude",
                    vec![(DimensionType::Time, 3)],
                    ArrayData::Double(vec![10.0, 20.0, 30.0]),
                )
                .unwrap()
                .with_unit("degree_north"),
            )
            .unwrap();
        product
            .add_variable(
                Variable::with_data(
                    "longitude",
                    vec![(DimensionType::Time, 3)],
                    ArrayData::Double(vec![0.0, 10.0, 20.0]),
                )
                .unwrap()
                .with_unit("degree_east"),
            )
            .unwrap();

        ExecutionEngine::new()
            .execute_operations(
                &mut product,
                "point-distance(20[degree_north],10[degree_east],1200[km])",
            )
            .unwrap();
        assert_eq!(product.dimension(DimensionType::Time), Some(1));
        assert_eq!(
            product.variable("latitude").unwrap().data,
            ArrayData::Double(vec![20.0])
        );
    }

    #[test]
    fn valid_range_uses_any_rule_over_independent_axes() {
        let mut product = Product::new();
        product
            .add_variable(
                Variable::with_data(
                    "x",
                    vec![(DimensionType::Time, 2), (DimensionType::Independent, 3)],
                    ArrayData::Double(vec![50.0, f64::NAN, 120.0, f64::NAN, 130.0, -4.0]),
                )
                .unwrap()
                .with_valid_range(
                    tropo_product::Scalar::Double(0.0),
                    tropo_product::Scalar::Double(100.0),
                ),
            )
            .unwrap();
        ExecutionEngine::new()
            .execute_operations(&mut product, "valid(x)")
            .unwrap();
        // Row 0 has one in-range element and survives; row 1 has none.
        assert_eq!(product.dimension(DimensionType::Time), Some(1));
    }

    #[test]
    fn index_filter_selects_positions() {
        let mut product = time_product(vec![10.0, 20.0, 30.0, 40.0]);
        ExecutionEngine::new()
            .execute_operations(&mut product, "index{time} in (1, 3)")
            .unwrap();
        assert_eq!(
            product.variable("t").unwrap().data,
            ArrayData::Double(vec![20.0, 40.0])
        );
    }

    #[test]
    fn empty_product_short_circuits_the_tail() {
        let mut product = time_product(vec![1.0, 2.0]);
        // The second filter would fail on a missing variable, but the
        // product is already empty by then.
        ExecutionEngine::new()
            .execute_operations(&mut product, "t>5;missing>1")
            .unwrap();
        assert!(product.is_empty());
    }

    #[test]
    fn string_filters_on_enumerated_variables() {
        let mut product = Product::new();
        product
            .add_variable(
                Variable::with_data(
                    "quality",
                    vec![(DimensionType::Time, 3)],
                    ArrayData::Int8(vec![0, 1, 2]),
                )
                .unwrap()
                .with_enumeration(vec![
                    "bad".to_string(),
                    "good".to_string(),
                    "best".to_string(),
                ]),
            )
            .unwrap();
        ExecutionEngine::new()
            .execute_operations(&mut product, r#"quality in ("good", "best")"#)
            .unwrap();
        assert_eq!(
            product.variable("quality").unwrap().data,
            ArrayData::Int8(vec![1, 2])
        );
    }
}

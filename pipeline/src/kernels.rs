//! Product transform kernels: sort, squash, flatten, wrap, clamp,
//! binning and regridding.
//!
//! The execution engine marshals operation arguments into these
//! functions. All kernels either commit in full or leave the product
//! unchanged; a product collapsing to zero rows is reported as success
//! with an empty product.

use itertools::Itertools;
use tracing::debug;
use tropo_product::{ArrayData, DataType, DimensionType, Product, Scalar, Variable};

use crate::error::{PipelineError, Result};
use crate::options::{self, RegridOutOfBounds};
use crate::units::{UnitConverter, convert_variable_unit, units_compatible};

/// Stable multi-key sort of the time dimension by the named variables.
pub fn sort(product: &mut Product, variables: &[String]) -> Result<()> {
    if variables.is_empty() {
        return Err(PipelineError::invalid_argument("sort needs at least one variable"));
    }
    let Some(time_length) = product.dimension(DimensionType::Time) else {
        return Err(PipelineError::operation("product has no time dimension to sort"));
    };

    // Collect the sort keys up front; every key variable must be 1-D over
    // time.
    let mut keys: Vec<&Variable> = Vec::with_capacity(variables.len());
    for name in variables {
        let variable = product.variable(name)?;
        if variable.num_dims() != 1 || variable.dimension_type(0) != DimensionType::Time {
            return Err(PipelineError::operation(format!(
                "sort variable '{name}' must depend on the time dimension only"
            )));
        }
        keys.push(variable);
    }

    let mut order: Vec<usize> = (0..time_length).collect();
    order.sort_by(|&a, &b| {
        for key in &keys {
            let ordering = match key.data {
                ArrayData::Str(ref values) => values[a].cmp(&values[b]),
                _ => {
                    let left = key.data.get_f64(a).unwrap_or(f64::NAN);
                    let right = key.data.get_f64(b).unwrap_or(f64::NAN);
                    left.total_cmp(&right)
                }
            };
            if ordering != std::cmp::Ordering::Equal {
                return ordering;
            }
        }
        std::cmp::Ordering::Equal
    });

    product.rearrange_dimension(DimensionType::Time, &order)?;
    Ok(())
}

/// Remove a dimension from the named variables where its slices are
/// identical.
pub fn squash(product: &mut Product, dimension: DimensionType, variables: &[String]) -> Result<()> {
    if dimension == DimensionType::Time {
        return Err(PipelineError::operation("cannot squash the time dimension"));
    }
    for name in variables {
        let variable = product.variable_mut(name)?;
        for axis in (0..variable.num_dims()).rev() {
            if variable.dimension_type(axis) == dimension {
                variable
                    .squash_dimension(axis)
                    .map_err(|e| PipelineError::operation(e.to_string()))?;
            }
        }
    }
    product.unpin_unused_dimensions();
    Ok(())
}

/// Move axis `from` of a variable to position `to`, permuting the data.
fn move_axis(variable: &mut Variable, from: usize, to: usize) -> Result<()> {
    if from == to {
        return Ok(());
    }
    let src_dims: Vec<usize> = variable.dims.iter().map(|&(_, n)| n).collect();
    let mut permutation: Vec<usize> = (0..src_dims.len()).collect();
    let axis = permutation.remove(from);
    permutation.insert(to, axis);

    let tgt_dims: Vec<usize> = permutation.iter().map(|&p| src_dims[p]).collect();
    let src_strides = row_major_strides(&src_dims);
    let tgt_strides = row_major_strides(&tgt_dims);

    let mut data = ArrayData::null(variable.data_type(), variable.num_elements());
    let mut index = vec![0usize; src_dims.len()];
    for flat in 0..variable.num_elements() {
        // Decompose the source index and recompose it in target order.
        let mut rest = flat;
        for (axis, &stride) in src_strides.iter().enumerate() {
            index[axis] = rest / stride;
            rest %= stride;
        }
        let target: usize = permutation
            .iter()
            .zip(&tgt_strides)
            .map(|(&p, &stride)| index[p] * stride)
            .sum();
        data.copy_element_from(target, &variable.data, flat)?;
    }

    variable.data = data;
    let dims = variable.dims.clone();
    variable.dims = permutation.iter().map(|&p| dims[p]).collect();
    Ok(())
}

fn row_major_strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; dims.len()];
    for i in (0..dims.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * dims[i + 1];
    }
    strides
}

/// Collapse `dimension` into the time dimension. Each (time, dim) pair
/// becomes one time step, in time-major order; variables that do not
/// depend on `dimension` have their time rows replicated.
pub fn flatten(product: &mut Product, dimension: DimensionType) -> Result<()> {
    if dimension == DimensionType::Time {
        return Err(PipelineError::operation("cannot flatten the time dimension"));
    }
    let Some(flat_length) = product.dimension(dimension) else {
        return Err(PipelineError::operation(format!(
            "product has no '{dimension}' dimension to flatten"
        )));
    };
    let Some(time_length) = product.dimension(DimensionType::Time) else {
        return Err(PipelineError::operation("product has no time dimension"));
    };

    let names: Vec<String> = product.variable_names().iter().map(|s| s.to_string()).collect();
    for name in &names {
        let uses = {
            let variable = product.variable(name)?;
            let count = variable
                .dims
                .iter()
                .filter(|&&(dimension_type, _)| dimension_type == dimension)
                .count();
            if count > 1 {
                return Err(PipelineError::operation(format!(
                    "variable '{name}' uses dimension '{dimension}' more than once"
                )));
            }
            count == 1
        };
        let variable = product.variable_mut(name)?;
        if uses {
            if !variable.has_dimension_type(DimensionType::Time) {
                variable.prepend_dimension(DimensionType::Time, time_length)?;
            }
            let axis = variable
                .dims
                .iter()
                .position(|&(dimension_type, _)| dimension_type == dimension)
                .expect("dimension use was checked above");
            move_axis(variable, axis, 1)?;
            // Merge axes 0 and 1 into a single time axis.
            variable.dims.splice(
                0..2,
                [(DimensionType::Time, time_length * flat_length)],
            );
        } else if variable.num_dims() > 0 && variable.dimension_type(0) == DimensionType::Time {
            // Replicate each time row once per flattened entry.
            let indices: Vec<usize> = (0..time_length)
                .flat_map(|t| std::iter::repeat_n(t, flat_length))
                .collect();
            replicate_axis(variable, &indices)?;
        } else if variable.has_dimension_type(DimensionType::Time) {
            return Err(PipelineError::operation(format!(
                "variable '{name}' uses the time dimension at a non-leading axis"
            )));
        }
    }

    product.set_dimension(DimensionType::Time, time_length * flat_length);
    product.unpin_unused_dimensions();
    debug!(dimension = %dimension, new_time = time_length * flat_length, "flattened dimension");
    Ok(())
}

/// Gather rows of axis 0 of one variable according to `indices`.
fn replicate_axis(variable: &mut Variable, indices: &[usize]) -> Result<()> {
    let length = variable.dimension_length(0);
    let inner: usize = variable.dims[1..].iter().map(|&(_, n)| n).product();
    let mut data = ArrayData::null(variable.data_type(), indices.len() * inner);
    for (row, &src) in indices.iter().enumerate() {
        debug_assert!(src < length);
        for i in 0..inner {
            data.copy_element_from(row * inner + i, &variable.data, src * inner + i)?;
        }
    }
    variable.data = data;
    variable.dims[0].1 = indices.len();
    Ok(())
}

/// Wrap the values of a variable into `[min, max)` and pin its valid
/// range to the window.
pub fn wrap(
    product: &mut Product,
    name: &str,
    unit: Option<&str>,
    min: f64,
    max: f64,
) -> Result<()> {
    if max <= min {
        return Err(PipelineError::invalid_argument(
            "wrap needs max to be greater than min",
        ));
    }
    let variable = product.variable_mut(name)?;
    match unit {
        Some(unit) => match variable.unit.clone() {
            Some(current) if !units_compatible(&current, unit) => {
                convert_variable_unit(variable, unit)?;
            }
            _ => variable.unit = Some(unit.to_string()),
        },
        None => variable.convert_data_type(DataType::Double)?,
    }
    let width = max - min;
    for i in 0..variable.num_elements() {
        let value = variable.data.get_f64(i)?;
        if value.is_nan() {
            continue;
        }
        variable
            .data
            .set_f64(i, value - width * ((value - min) / width).floor())?;
    }
    variable.valid_min = Some(Scalar::from_f64(variable.data_type(), min)?);
    variable.valid_max = Some(Scalar::from_f64(variable.data_type(), max)?);
    Ok(())
}

/// Restrict a dimension to the entries whose axis value lies inside the
/// given bounds.
pub fn clamp(
    product: &mut Product,
    dimension: DimensionType,
    axis_variable: &str,
    axis_unit: Option<&str>,
    bounds: [f64; 2],
) -> Result<()> {
    if dimension.is_independent() {
        return Err(PipelineError::operation("cannot clamp the independent dimension"));
    }
    let keep: Vec<bool> = {
        let axis = product.variable(axis_variable)?;
        if axis.num_dims() != 1 || axis.dimension_type(0) != dimension {
            return Err(PipelineError::operation(format!(
                "axis variable '{axis_variable}' must be 1-D over the '{dimension}' dimension"
            )));
        }
        let converter = match (axis_unit, axis.unit.as_deref()) {
            (Some(target), Some(source)) if !units_compatible(source, target) => {
                Some(UnitConverter::new(source, target)?)
            }
            _ => None,
        };
        let (lower, upper) = (bounds[0].min(bounds[1]), bounds[0].max(bounds[1]));
        (0..axis.num_elements())
            .map(|i| {
                axis.data.get_f64(i).map(|raw| {
                    let value = converter.map_or(raw, |c| c.apply(raw));
                    value >= lower && value <= upper
                })
            })
            .collect::<tropo_product::Result<_>>()?
    };
    product.filter_dimension(dimension, &keep)?;
    Ok(())
}

/// NaN-ignoring mean of selected rows of one column.
fn mean_over(variable: &Variable, rows: &[usize], inner: usize, column: usize) -> f64 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for &row in rows {
        if let Ok(value) = variable.data.get_f64(row * inner + column) {
            if !value.is_nan() {
                sum += value;
                count += 1;
            }
        }
    }
    if count == 0 { f64::NAN } else { sum / count as f64 }
}

/// Average groups of time rows. `groups` lists, per output row, the input
/// rows it aggregates. Numeric variables are averaged (NaN-ignoring);
/// string variables keep a value only when the group is unanimous. The
/// `index` and `collocation_index` variables lose their meaning under
/// binning and are removed.
pub(crate) fn bin_groups(product: &mut Product, groups: &[Vec<usize>]) -> Result<()> {
    for name in ["index", "collocation_index"] {
        if product.has_variable(name) {
            product.remove_variable(name)?;
        }
    }

    let names: Vec<String> = product.variable_names().iter().map(|s| s.to_string()).collect();
    for name in &names {
        let variable = product.variable_mut(name)?;
        if variable.num_dims() == 0 || variable.dimension_type(0) != DimensionType::Time {
            continue;
        }
        let inner: usize = variable.dims[1..].iter().map(|&(_, n)| n).product();
        let mut data = ArrayData::null(variable.data_type(), groups.len() * inner);
        match variable.data {
            ArrayData::Str(ref values) => {
                for (g, rows) in groups.iter().enumerate() {
                    for c in 0..inner {
                        let members: Vec<&Option<String>> =
                            rows.iter().map(|&r| &values[r * inner + c]).collect();
                        if let Some(first) = members.first() {
                            if members.iter().all(|v| v == first) {
                                if let Some(text) = (*first).clone() {
                                    let ArrayData::Str(ref mut out) = data else { unreachable!() };
                                    out[g * inner + c] = Some(text);
                                }
                            }
                        }
                    }
                }
            }
            _ => {
                for (g, rows) in groups.iter().enumerate() {
                    for c in 0..inner {
                        let mean = mean_over(variable, rows, inner, c);
                        if !mean.is_nan() {
                            data.set_f64(g * inner + c, mean)?;
                        } else if variable.data_type().is_float() {
                            data.set_f64(g * inner + c, f64::NAN)?;
                        }
                    }
                }
            }
        }
        variable.data = data;
        variable.dims[0].1 = groups.len();
    }
    product.set_dimension(DimensionType::Time, groups.len());
    Ok(())
}

/// Average every time row into a single sample.
pub fn bin_full(product: &mut Product) -> Result<()> {
    let Some(time_length) = product.dimension(DimensionType::Time) else {
        return Err(PipelineError::operation("product has no time dimension to bin"));
    };
    let groups = vec![(0..time_length).collect::<Vec<usize>>()];
    bin_groups(product, &groups)
}

/// Group time rows by the tuple of values of the named variables, in
/// order of first occurrence, and average within each group.
pub fn bin_with_variables(product: &mut Product, variables: &[String]) -> Result<()> {
    if variables.is_empty() {
        return Err(PipelineError::invalid_argument("bin needs at least one variable"));
    }
    let Some(time_length) = product.dimension(DimensionType::Time) else {
        return Err(PipelineError::operation("product has no time dimension to bin"));
    };

    let mut group_keys: Vec<Vec<String>> = Vec::new();
    let mut groups: Vec<Vec<usize>> = Vec::new();
    {
        let mut key_variables = Vec::with_capacity(variables.len());
        for name in variables {
            let variable = product.variable(name)?;
            if variable.num_dims() != 1 || variable.dimension_type(0) != DimensionType::Time {
                return Err(PipelineError::operation(format!(
                    "grouping variable '{name}' must depend on the time dimension only"
                )));
            }
            key_variables.push(variable);
        }
        for row in 0..time_length {
            let key: Vec<String> = key_variables
                .iter()
                .map(|v| match v.data {
                    ArrayData::Str(ref values) => {
                        values[row].clone().unwrap_or_default()
                    }
                    _ => format!("{:?}", v.data.get_f64(row).unwrap_or(f64::NAN)),
                })
                .collect();
            match group_keys.iter().position(|k| k == &key) {
                Some(g) => groups[g].push(row),
                None => {
                    group_keys.push(key);
                    groups.push(vec![row]);
                }
            }
        }
    }
    bin_groups(product, &groups)
}

/// Spatial binning over a latitude/longitude cell grid. The product's
/// time dimension becomes one entry per cell (latitude-major); cell
/// centre coordinates replace `latitude` and `longitude`.
pub fn bin_spatial(
    product: &mut Product,
    latitude_edges: &[f64],
    longitude_edges: &[f64],
) -> Result<()> {
    let Some(time_length) = product.dimension(DimensionType::Time) else {
        return Err(PipelineError::operation("product has no time dimension to bin"));
    };
    let lat_cells = latitude_edges.len() - 1;
    let lon_cells = longitude_edges.len() - 1;

    let groups: Vec<Vec<usize>> = {
        let latitude = product.variable("latitude")?;
        let longitude = product.variable("longitude")?;
        for (name, variable) in [("latitude", latitude), ("longitude", longitude)] {
            if variable.num_dims() != 1 || variable.dimension_type(0) != DimensionType::Time {
                return Err(PipelineError::operation(format!(
                    "variable '{name}' must depend on the time dimension only"
                )));
            }
        }

        let mut groups = vec![Vec::new(); lat_cells * lon_cells];
        for row in 0..time_length {
            let lat = latitude.data.get_f64(row)?;
            let mut lon = longitude.data.get_f64(row)?;
            if lat.is_nan() || lon.is_nan() {
                continue;
            }
            // Map the longitude into the grid's wrap window.
            lon -= 360.0 * ((lon - longitude_edges[0]) / 360.0).floor();
            let lat_cell = cell_of(latitude_edges, lat);
            let lon_cell = cell_of(longitude_edges, lon);
            if let (Some(i), Some(j)) = (lat_cell, lon_cell) {
                groups[i * lon_cells + j].push(row);
            }
        }
        groups
    };

    bin_groups(product, &groups)?;

    let centers =
        |edges: &[f64]| -> Vec<f64> { edges.windows(2).map(|w| (w[0] + w[1]) / 2.0).collect() };
    let lat_centers = centers(latitude_edges);
    let lon_centers = centers(longitude_edges);
    let mut latitude = Vec::with_capacity(lat_cells * lon_cells);
    let mut longitude = Vec::with_capacity(lat_cells * lon_cells);
    for (&lat, &lon) in lat_centers.iter().cartesian_product(lon_centers.iter()) {
        latitude.push(lat);
        longitude.push(lon);
    }

    for (name, values, unit) in [
        ("latitude", latitude, "degree_north"),
        ("longitude", longitude, "degree_east"),
    ] {
        let variable = Variable::with_data(
            name,
            vec![(DimensionType::Time, lat_cells * lon_cells)],
            ArrayData::Double(values),
        )?
        .with_unit(unit);
        if product.has_variable(name) {
            product.replace_variable(variable)?;
        } else {
            product.add_variable(variable)?;
        }
    }
    Ok(())
}

fn cell_of(edges: &[f64], value: f64) -> Option<usize> {
    if value < edges[0] || value > edges[edges.len() - 1] {
        return None;
    }
    // The last edge is inclusive.
    let cell = edges.partition_point(|&e| e <= value);
    Some(cell.saturating_sub(1).min(edges.len() - 2))
}

/// Linear interpolation of every variable depending on `dimension` onto a
/// new axis, honouring the out-of-bounds policy.
pub fn regrid(
    product: &mut Product,
    dimension: DimensionType,
    axis_variable: &str,
    axis_unit: Option<&str>,
    targets: &[f64],
) -> Result<()> {
    if dimension.is_independent() || dimension == DimensionType::Time {
        return Err(PipelineError::operation(format!(
            "regridding of '{dimension}' dimension not supported"
        )));
    }
    if product.dimension(dimension).is_none() {
        return Err(PipelineError::operation(format!(
            "product has no '{dimension}' dimension to regrid"
        )));
    }

    let source_axis: Vec<f64> = {
        let axis = product.variable(axis_variable)?;
        if axis.num_dims() != 1 || axis.dimension_type(0) != dimension {
            return Err(PipelineError::operation(format!(
                "axis variable '{axis_variable}' must be 1-D over the '{dimension}' dimension"
            )));
        }
        let converter = match (axis_unit, axis.unit.as_deref()) {
            (Some(target), Some(source)) if !units_compatible(source, target) => {
                Some(UnitConverter::new(source, target)?)
            }
            _ => None,
        };
        (0..axis.num_elements())
            .map(|i| axis.data.get_f64(i).map(|v| converter.map_or(v, |c| c.apply(v))))
            .collect::<tropo_product::Result<_>>()?
    };

    let out_of_bounds = options::current().regrid_out_of_bounds;
    let names: Vec<String> = product.variable_names().iter().map(|s| s.to_string()).collect();
    for name in &names {
        if name == axis_variable {
            continue;
        }
        let variable = product.variable(name)?;
        if !variable.has_dimension_type(dimension) {
            continue;
        }
        if variable.data_type() == DataType::Str {
            return Err(PipelineError::operation(format!(
                "cannot regrid string variable '{name}'"
            )));
        }
        let variable = product.variable_mut(name)?;
        regrid_variable(variable, dimension, &source_axis, targets, out_of_bounds)?;
    }

    // Replace the axis variable itself with the target grid.
    {
        let axis = product.variable_mut(axis_variable)?;
        axis.data = ArrayData::Double(targets.to_vec()).convert(axis.data_type())?;
        axis.dims[0].1 = targets.len();
        if let Some(unit) = axis_unit {
            axis.unit = Some(unit.to_string());
        }
    }
    product.set_dimension(dimension, targets.len());
    Ok(())
}

fn regrid_variable(
    variable: &mut Variable,
    dimension: DimensionType,
    source_axis: &[f64],
    targets: &[f64],
    out_of_bounds: RegridOutOfBounds,
) -> Result<()> {
    for axis in (0..variable.num_dims()).rev() {
        if variable.dimension_type(axis) != dimension {
            continue;
        }
        let length = variable.dimension_length(axis);
        let inner: usize = variable.dims[axis + 1..].iter().map(|&(_, n)| n).product();
        let outer: usize = variable.dims[..axis].iter().map(|&(_, n)| n).product();

        let mut dims = variable.dims.clone();
        dims[axis].1 = targets.len();
        let mut data =
            ArrayData::null(variable.data_type(), outer * targets.len() * inner);

        for o in 0..outer {
            for (t, &target) in targets.iter().enumerate() {
                for i in 0..inner {
                    let sample = |s: usize| {
                        variable.data.get_f64((o * length + s) * inner + i)
                    };
                    let value =
                        interpolate_linear(source_axis, target, out_of_bounds, &sample)?;
                    if !value.is_nan() || variable.data_type().is_float() {
                        data.set_f64((o * targets.len() + t) * inner + i, value)?;
                    }
                }
            }
        }
        variable.data = data;
        variable.dims = dims;
    }
    Ok(())
}

fn interpolate_linear(
    axis: &[f64],
    target: f64,
    out_of_bounds: RegridOutOfBounds,
    sample: &dyn Fn(usize) -> tropo_product::Result<f64>,
) -> Result<f64> {
    if axis.is_empty() {
        return Ok(f64::NAN);
    }
    let ascending = axis.first() <= axis.last();
    let position = |value: f64| -> f64 {
        if ascending { value } else { -value }
    };
    let target_pos = position(target);

    let mut upper = axis.len();
    for (i, &a) in axis.iter().enumerate() {
        if position(a) >= target_pos {
            upper = i;
            break;
        }
    }

    if upper == 0 {
        return Ok(match out_of_bounds {
            _ if position(axis[0]) == target_pos => sample(0)?,
            RegridOutOfBounds::Nan => f64::NAN,
            RegridOutOfBounds::Edge => sample(0)?,
            RegridOutOfBounds::Extrapolate if axis.len() >= 2 => {
                let slope = (sample(1)? - sample(0)?) / (axis[1] - axis[0]);
                sample(0)? + slope * (target - axis[0])
            }
            RegridOutOfBounds::Extrapolate => sample(0)?,
        });
    }
    if upper == axis.len() {
        let last = axis.len() - 1;
        return Ok(match out_of_bounds {
            RegridOutOfBounds::Nan => f64::NAN,
            RegridOutOfBounds::Edge => sample(last)?,
            RegridOutOfBounds::Extrapolate if axis.len() >= 2 => {
                let slope =
                    (sample(last)? - sample(last - 1)?) / (axis[last] - axis[last - 1]);
                sample(last)? + slope * (target - axis[last])
            }
            RegridOutOfBounds::Extrapolate => sample(last)?,
        });
    }
    if axis[upper] == target {
        return Ok(sample(upper)?);
    }
    let lower = upper - 1;
    let fraction = (target - axis[lower]) / (axis[upper] - axis[lower]);
    Ok(sample(lower)? + fraction * (sample(upper)? - sample(lower)?))
}

/// Interval rebinning: average source entries into target intervals
/// defined by `edges` (half-open, last edge inclusive).
pub fn rebin(
    product: &mut Product,
    dimension: DimensionType,
    axis_variable: &str,
    axis_unit: Option<&str>,
    edges: &[f64],
) -> Result<()> {
    if dimension.is_independent() || dimension == DimensionType::Time {
        return Err(PipelineError::operation(format!(
            "rebinning of '{dimension}' dimension not supported"
        )));
    }
    if edges.len() < 2 {
        return Err(PipelineError::invalid_argument("rebin needs at least 2 edges"));
    }
    let bins = edges.len() - 1;

    let assignments: Vec<Option<usize>> = {
        let axis = product.variable(axis_variable)?;
        if axis.num_dims() != 1 || axis.dimension_type(0) != dimension {
            return Err(PipelineError::operation(format!(
                "axis variable '{axis_variable}' must be 1-D over the '{dimension}' dimension"
            )));
        }
        let converter = match (axis_unit, axis.unit.as_deref()) {
            (Some(target), Some(source)) if !units_compatible(source, target) => {
                Some(UnitConverter::new(source, target)?)
            }
            _ => None,
        };
        (0..axis.num_elements())
            .map(|i| {
                axis.data
                    .get_f64(i)
                    .map(|raw| cell_of(edges, converter.map_or(raw, |c| c.apply(raw))))
            })
            .collect::<tropo_product::Result<_>>()?
    };

    let names: Vec<String> = product.variable_names().iter().map(|s| s.to_string()).collect();
    for name in &names {
        if name == axis_variable {
            continue;
        }
        let has_dim = product.variable(name)?.has_dimension_type(dimension);
        if !has_dim {
            continue;
        }
        if product.variable(name)?.data_type() == DataType::Str {
            return Err(PipelineError::operation(format!(
                "cannot rebin string variable '{name}'"
            )));
        }
        let variable = product.variable_mut(name)?;
        rebin_variable(variable, dimension, &assignments, bins)?;
    }

    // The axis variable becomes the bin midpoints.
    {
        let midpoints: Vec<f64> = edges.windows(2).map(|w| (w[0] + w[1]) / 2.0).collect();
        let axis = product.variable_mut(axis_variable)?;
        axis.data = ArrayData::Double(midpoints).convert(axis.data_type())?;
        axis.dims[0].1 = bins;
        if let Some(unit) = axis_unit {
            axis.unit = Some(unit.to_string());
        }
    }
    product.set_dimension(dimension, bins);
    Ok(())
}

fn rebin_variable(
    variable: &mut Variable,
    dimension: DimensionType,
    assignments: &[Option<usize>],
    bins: usize,
) -> Result<()> {
    for axis in (0..variable.num_dims()).rev() {
        if variable.dimension_type(axis) != dimension {
            continue;
        }
        let length = variable.dimension_length(axis);
        let inner: usize = variable.dims[axis + 1..].iter().map(|&(_, n)| n).product();
        let outer: usize = variable.dims[..axis].iter().map(|&(_, n)| n).product();

        let mut dims = variable.dims.clone();
        dims[axis].1 = bins;
        let mut data = ArrayData::null(variable.data_type(), outer * bins * inner);

        for o in 0..outer {
            for bin in 0..bins {
                for i in 0..inner {
                    let mut sum = 0.0;
                    let mut count = 0usize;
                    for (s, assignment) in assignments.iter().enumerate().take(length) {
                        if *assignment == Some(bin) {
                            let value = variable.data.get_f64((o * length + s) * inner + i)?;
                            if !value.is_nan() {
                                sum += value;
                                count += 1;
                            }
                        }
                    }
                    let target = (o * bins + bin) * inner + i;
                    if count > 0 {
                        data.set_f64(target, sum / count as f64)?;
                    } else if variable.data_type().is_float() {
                        data.set_f64(target, f64::NAN)?;
                    }
                }
            }
        }
        variable.data = data;
        variable.dims = dims;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn product_with(values: &[(&str, Vec<f64>)]) -> Product {
        let mut product = Product::new();
        for (name, data) in values {
            let len = data.len();
            product
                .add_variable(
                    Variable::with_data(
                        *name,
                        vec![(DimensionType::Time, len)],
                        ArrayData::Double(data.clone()),
                    )
                    .unwrap(),
                )
                .unwrap();
        }
        product
    }

    #[test]
    fn sort_orders_all_variables() {
        let mut product = product_with(&[
            ("key", vec![3.0, 1.0, 2.0]),
            ("payload", vec![30.0, 10.0, 20.0]),
        ]);
        sort(&mut product, &["key".to_string()]).unwrap();
        assert_eq!(
            product.variable("key").unwrap().data,
            ArrayData::Double(vec![1.0, 2.0, 3.0])
        );
        assert_eq!(
            product.variable("payload").unwrap().data,
            ArrayData::Double(vec![10.0, 20.0, 30.0])
        );
    }

    #[test]
    fn sort_is_stable_across_keys() {
        let mut product = product_with(&[
            ("a", vec![1.0, 1.0, 0.0]),
            ("b", vec![2.0, 1.0, 9.0]),
        ]);
        sort(&mut product, &["a".to_string(), "b".to_string()]).unwrap();
        assert_eq!(
            product.variable("b").unwrap().data,
            ArrayData::Double(vec![9.0, 1.0, 2.0])
        );
    }

    #[test]
    fn flatten_merges_into_time() {
        let mut product = Product::new();
        product
            .add_variable(
                Variable::with_data(
                    "profile",
                    vec![(DimensionType::Time, 2), (DimensionType::Vertical, 3)],
                    ArrayData::Double(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]),
                )
                .unwrap(),
            )
            .unwrap();
        product
            .add_variable(
                Variable::with_data(
                    "t",
                    vec![(DimensionType::Time, 2)],
                    ArrayData::Double(vec![10.0, 20.0]),
                )
                .unwrap(),
            )
            .unwrap();

        flatten(&mut product, DimensionType::Vertical).unwrap();
        assert_eq!(product.dimension(DimensionType::Time), Some(6));
        assert_eq!(product.dimension(DimensionType::Vertical), None);
        assert_eq!(
            product.variable("profile").unwrap().data,
            ArrayData::Double(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0])
        );
        assert_eq!(
            product.variable("t").unwrap().data,
            ArrayData::Double(vec![10.0, 10.0, 10.0, 20.0, 20.0, 20.0])
        );
    }

    #[test]
    fn wrap_maps_into_window() {
        let mut product = product_with(&[("longitude", vec![-190.0, 10.0, 370.0])]);
        wrap(&mut product, "longitude", None, -180.0, 180.0).unwrap();
        assert_eq!(
            product.variable("longitude").unwrap().data,
            ArrayData::Double(vec![170.0, 10.0, 10.0])
        );
    }

    #[test]
    fn clamp_filters_by_axis_interval() {
        let mut product = Product::new();
        product
            .add_variable(
                Variable::with_data(
                    "altitude",
                    vec![(DimensionType::Vertical, 4)],
                    ArrayData::Double(vec![0.0, 5.0, 10.0, 15.0]),
                )
                .unwrap()
                .with_unit("km"),
            )
            .unwrap();
        product
            .add_variable(
                Variable::with_data(
                    "o3",
                    vec![(DimensionType::Vertical, 4)],
                    ArrayData::Double(vec![1.0, 2.0, 3.0, 4.0]),
                )
                .unwrap(),
            )
            .unwrap();
        clamp(
            &mut product,
            DimensionType::Vertical,
            "altitude",
            Some("km"),
            [4.0, 12.0],
        )
        .unwrap();
        assert_eq!(
            product.variable("o3").unwrap().data,
            ArrayData::Double(vec![2.0, 3.0])
        );
    }

    #[test]
    fn bin_full_averages_and_drops_index() {
        let mut product = product_with(&[("t", vec![10.0, 20.0, 30.0])]);
        product
            .add_variable(
                Variable::with_data(
                    "index",
                    vec![(DimensionType::Time, 3)],
                    ArrayData::Int32(vec![0, 1, 2]),
                )
                .unwrap(),
            )
            .unwrap();
        bin_full(&mut product).unwrap();
        assert_eq!(product.dimension(DimensionType::Time), Some(1));
        assert_eq!(
            product.variable("t").unwrap().data,
            ArrayData::Double(vec![20.0])
        );
        assert!(!product.has_variable("index"));
    }

    #[test]
    fn bin_with_variables_groups_by_first_occurrence() {
        let mut product = product_with(&[
            ("site", vec![2.0, 1.0, 2.0]),
            ("value", vec![10.0, 20.0, 30.0]),
        ]);
        bin_with_variables(&mut product, &["site".to_string()]).unwrap();
        assert_eq!(
            product.variable("site").unwrap().data,
            ArrayData::Double(vec![2.0, 1.0])
        );
        assert_eq!(
            product.variable("value").unwrap().data,
            ArrayData::Double(vec![20.0, 20.0])
        );
    }

    #[test]
    fn bin_spatial_places_samples_in_cells() {
        let mut product = product_with(&[
            ("latitude", vec![5.0, 5.0, 15.0]),
            ("longitude", vec![5.0, 5.0, 15.0]),
            ("value", vec![1.0, 3.0, 10.0]),
        ]);
        bin_spatial(&mut product, &[0.0, 10.0, 20.0], &[0.0, 10.0, 20.0]).unwrap();
        assert_eq!(product.dimension(DimensionType::Time), Some(4));
        let ArrayData::Double(values) = &product.variable("value").unwrap().data else {
            panic!("expected doubles");
        };
        assert_eq!(values[0], 2.0);
        assert!(values[1].is_nan());
        assert!(values[2].is_nan());
        assert_eq!(values[3], 10.0);
        assert_eq!(
            product.variable("latitude").unwrap().data,
            ArrayData::Double(vec![5.0, 5.0, 15.0, 15.0])
        );
    }

    #[test]
    fn regrid_interpolates_linearly() {
        let mut product = Product::new();
        product
            .add_variable(
                Variable::with_data(
                    "altitude",
                    vec![(DimensionType::Vertical, 3)],
                    ArrayData::Double(vec![0.0, 10.0, 20.0]),
                )
                .unwrap(),
            )
            .unwrap();
        product
            .add_variable(
                Variable::with_data(
                    "o3",
                    vec![(DimensionType::Vertical, 3)],
                    ArrayData::Double(vec![0.0, 100.0, 200.0]),
                )
                .unwrap(),
            )
            .unwrap();
        regrid(
            &mut product,
            DimensionType::Vertical,
            "altitude",
            None,
            &[5.0, 15.0],
        )
        .unwrap();
        assert_eq!(product.dimension(DimensionType::Vertical), Some(2));
        assert_eq!(
            product.variable("o3").unwrap().data,
            ArrayData::Double(vec![50.0, 150.0])
        );
        assert_eq!(
            product.variable("altitude").unwrap().data,
            ArrayData::Double(vec![5.0, 15.0])
        );
    }

    #[test]
    fn regrid_out_of_bounds_defaults_to_nan() {
        let mut product = Product::new();
        product
            .add_variable(
                Variable::with_data(
                    "altitude",
                    vec![(DimensionType::Vertical, 2)],
                    ArrayData::Double(vec![0.0, 10.0]),
                )
                .unwrap(),
            )
            .unwrap();
        product
            .add_variable(
                Variable::with_data(
                    "o3",
                    vec![(DimensionType::Vertical, 2)],
                    ArrayData::Double(vec![0.0, 100.0]),
                )
                .unwrap(),
            )
            .unwrap();
        regrid(
            &mut product,
            DimensionType::Vertical,
            "altitude",
            None,
            &[-5.0, 5.0],
        )
        .unwrap();
        let ArrayData::Double(values) = &product.variable("o3").unwrap().data else {
            panic!("expected doubles");
        };
        assert!(values[0].is_nan());
        assert_relative_eq!(values[1], 50.0);
    }

    #[test]
    fn rebin_averages_within_intervals() {
        let mut product = Product::new();
        product
            .add_variable(
                Variable::with_data(
                    "altitude",
                    vec![(DimensionType::Vertical, 4)],
                    ArrayData::Double(vec![1.0, 3.0, 6.0, 9.0]),
                )
                .unwrap(),
            )
            .unwrap();
        product
            .add_variable(
                Variable::with_data(
                    "o3",
                    vec![(DimensionType::Vertical, 4)],
                    ArrayData::Double(vec![10.0, 20.0, 30.0, 40.0]),
                )
                .unwrap(),
            )
            .unwrap();
        rebin(
            &mut product,
            DimensionType::Vertical,
            "altitude",
            None,
            &[0.0, 5.0, 10.0],
        )
        .unwrap();
        assert_eq!(product.dimension(DimensionType::Vertical), Some(2));
        assert_eq!(
            product.variable("o3").unwrap().data,
            ArrayData::Double(vec![15.0, 35.0])
        );
        assert_eq!(
            product.variable("altitude").unwrap().data,
            ArrayData::Double(vec![2.5, 7.5])
        );
    }
}

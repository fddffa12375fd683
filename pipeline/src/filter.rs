//! Mask application: compacting variables and products.
//!
//! Applies a [`DimensionMaskSet`] to typed multi-dimensional buffers. The
//! walk skips source indices whose mask bit is cleared and moves retained
//! elements toward the front of the buffer; target rows that end up
//! shorter than their allocated width (possible under rank-2 masks, where
//! per-time retained counts differ) are padded with the type's null value.
//! String elements transfer by move so each owned string lives in exactly
//! one slot.

use tropo_product::{ArrayData, DimensionType, Product, Variable};

use crate::error::Result;
use crate::mask::DimensionMaskSet;

/// Row-major strides, in elements, for the given dimension lengths.
fn strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; dims.len()];
    for i in (0..dims.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * dims[i + 1];
    }
    strides
}

fn null_fill(data: &mut ArrayData, start: usize, end: usize) {
    for i in start..end {
        data.set_null(i);
    }
}

/// Compact one axis level: move retained elements from the source layout
/// to the target layout, null-padding target slots left unmatched.
/// `masks[axis]` holds the 1-D selection applicable at that axis for this
/// slice (already resolved to a row for rank-2 masks), or `None` for
/// keep-all.
#[allow(clippy::too_many_arguments)]
fn filter_axis(
    data: &mut ArrayData,
    axis: usize,
    src_dims: &[usize],
    src_strides: &[usize],
    src_base: usize,
    tgt_dims: &[usize],
    tgt_strides: &[usize],
    tgt_base: usize,
    masks: &[Option<&[bool]>],
) {
    if axis == src_dims.len() - 1 {
        let mut written = 0;
        match masks[axis] {
            Some(mask) => {
                for (c, &keep) in mask.iter().enumerate().take(src_dims[axis]) {
                    if keep {
                        data.move_element(tgt_base + written, src_base + c);
                        written += 1;
                    }
                }
            }
            None => {
                for c in 0..src_dims[axis] {
                    data.move_element(tgt_base + c, src_base + c);
                }
                written = src_dims[axis];
            }
        }
        null_fill(data, tgt_base + written, tgt_base + tgt_dims[axis]);
        return;
    }

    let mut written = 0;
    for s in 0..src_dims[axis] {
        if let Some(mask) = masks[axis] {
            if !mask[s] {
                continue;
            }
        }
        filter_axis(
            data,
            axis + 1,
            src_dims,
            src_strides,
            src_base + s * src_strides[axis],
            tgt_dims,
            tgt_strides,
            tgt_base + written * tgt_strides[axis],
            masks,
        );
        written += 1;
    }
    null_fill(
        data,
        tgt_base + written * tgt_strides[axis],
        tgt_base + tgt_dims[axis] * tgt_strides[axis],
    );
}

/// Apply a mask set to a single variable, compacting its buffer in place
/// and rewriting its dimension lengths. Scalars are unaffected. Rank-2
/// masks require the variable's axis 0 to be the time dimension (the
/// caller broadcasts beforehand where needed).
pub fn filter_variable(variable: &mut Variable, mask_set: &DimensionMaskSet) -> Result<()> {
    if variable.num_dims() == 0 {
        return Ok(());
    }

    let src_dims: Vec<usize> = variable.dims.iter().map(|&(_, n)| n).collect();
    let mut tgt_dims = src_dims.clone();
    let mut has_masks = false;
    let mut has_2d = false;

    for (axis, &(dimension_type, _)) in variable.dims.iter().enumerate() {
        if dimension_type.is_independent() {
            continue;
        }
        if let Some(mask) = mask_set.get(dimension_type) {
            tgt_dims[axis] = mask.masked_length();
            has_masks = true;
            if mask.rank() == 2 {
                debug_assert!(axis > 0 && variable.dimension_type(0) == DimensionType::Time);
                has_2d = true;
            }
        }
    }

    if !has_masks {
        return Ok(());
    }

    let new_num_elements: usize = tgt_dims.iter().product();
    let src_strides = strides(&src_dims);
    let tgt_strides = strides(&tgt_dims);

    if !has_2d {
        let masks: Vec<Option<&[bool]>> = variable
            .dims
            .iter()
            .map(|&(dimension_type, _)| {
                if dimension_type.is_independent() {
                    None
                } else {
                    mask_set.get(dimension_type).map(|m| m.as_slice())
                }
            })
            .collect();
        filter_axis(
            &mut variable.data,
            0,
            &src_dims,
            &src_strides,
            0,
            &tgt_dims,
            &tgt_strides,
            0,
            &masks,
        );
    } else {
        // Slice by the time axis and apply per-row masks separately.
        let time_mask = mask_set.get(DimensionType::Time);
        let mut written_rows = 0;
        for row in 0..src_dims[0] {
            if let Some(mask) = time_mask {
                if !mask.get(row) {
                    continue;
                }
            }
            let row_masks: Vec<Option<&[bool]>> = variable
                .dims
                .iter()
                .enumerate()
                .skip(1)
                .map(|(_, &(dimension_type, _))| {
                    if dimension_type.is_independent() {
                        return None;
                    }
                    mask_set.get(dimension_type).map(|m| {
                        if m.rank() == 2 { m.row(row) } else { m.as_slice() }
                    })
                })
                .collect();
            filter_axis(
                &mut variable.data,
                0,
                &src_dims[1..],
                &src_strides[1..],
                row * src_strides[0],
                &tgt_dims[1..],
                &tgt_strides[1..],
                written_rows * tgt_strides[0],
                &row_masks,
            );
            written_rows += 1;
        }
        null_fill(
            &mut variable.data,
            written_rows * tgt_strides[0],
            tgt_dims[0] * tgt_strides[0],
        );
    }

    variable.data.truncate(new_num_elements);
    for (axis, length) in tgt_dims.iter().enumerate() {
        variable.dims[axis].1 = *length;
    }
    Ok(())
}

/// Apply a mask set to every variable of a product.
///
/// If any mask retains nothing the product is cleared and success
/// returned — emptiness is terminal but not an error. Variables touched
/// by a rank-2 mask that lack a leading time axis are first broadcast
/// along time. Afterwards the product dimension table is rewritten from
/// the masks' retained lengths.
pub fn filter_product(product: &mut Product, mask_set: &DimensionMaskSet) -> Result<()> {
    if mask_set.is_empty() {
        return Ok(());
    }
    if mask_set.has_empty() {
        product.clear();
        return Ok(());
    }

    let time_length = product.dimension(DimensionType::Time);
    let names: Vec<String> = product.variable_names().iter().map(|s| s.to_string()).collect();
    for name in &names {
        let needs_time = {
            let variable = product.variable(name)?;
            variable.num_dims() > 0
                && variable.dimension_type(0) != DimensionType::Time
                && variable.dims.iter().any(|&(dimension_type, _)| {
                    !dimension_type.is_independent()
                        && mask_set
                            .get(dimension_type)
                            .is_some_and(|m| m.rank() == 2)
                })
        };
        let variable = product.variable_mut(name)?;
        if needs_time {
            let length = time_length.ok_or_else(|| {
                crate::error::PipelineError::invalid_argument(
                    "rank-2 mask requires a time dimension on the product",
                )
            })?;
            variable.prepend_dimension(DimensionType::Time, length)?;
        }
        filter_variable(variable, mask_set)?;
    }

    for (dimension_type, mask) in mask_set.iter() {
        product.set_dimension(dimension_type, mask.masked_length());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask::DimensionMask;
    use crate::predicate::{MembershipOp, MembershipPredicate};
    use tropo_product::DataType;

    fn mask_from_bits(bits: &[bool]) -> DimensionMask {
        let mut mask = DimensionMask::new_1d(bits.len());
        for (i, &b) in bits.iter().enumerate() {
            if !b {
                mask.clear(i);
            }
        }
        mask
    }

    #[test]
    fn filter_1d_compacts_in_place() {
        let mut variable = Variable::with_data(
            "t",
            vec![(DimensionType::Time, 4)],
            ArrayData::Double(vec![10.0, 20.0, 30.0, 40.0]),
        )
        .unwrap();
        let mut set = DimensionMaskSet::new();
        set.insert(
            DimensionType::Time,
            mask_from_bits(&[false, true, true, false]),
        )
        .unwrap();
        filter_variable(&mut variable, &set).unwrap();
        assert_eq!(variable.data, ArrayData::Double(vec![20.0, 30.0]));
        assert_eq!(variable.dims, vec![(DimensionType::Time, 2)]);
    }

    #[test]
    fn filter_2d_over_both_axes() {
        // 3 time steps x 2 levels; keep time rows 0 and 2, level 1 only.
        let mut variable = Variable::with_data(
            "x",
            vec![(DimensionType::Time, 3), (DimensionType::Vertical, 2)],
            ArrayData::Int32(vec![1, 2, 3, 4, 5, 6]),
        )
        .unwrap();
        let mut set = DimensionMaskSet::new();
        set.insert(DimensionType::Time, mask_from_bits(&[true, false, true]))
            .unwrap();
        set.insert(DimensionType::Vertical, mask_from_bits(&[false, true]))
            .unwrap();
        filter_variable(&mut variable, &set).unwrap();
        assert_eq!(variable.data, ArrayData::Int32(vec![2, 6]));
        assert_eq!(
            variable.dims,
            vec![(DimensionType::Time, 2), (DimensionType::Vertical, 1)]
        );
    }

    #[test]
    fn rank2_mask_pads_short_rows_with_null() {
        // 2 time steps x 3 levels; row 0 keeps 2 entries, row 1 keeps 1.
        let mut variable = Variable::with_data(
            "x",
            vec![(DimensionType::Time, 2), (DimensionType::Vertical, 3)],
            ArrayData::Double(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]),
        )
        .unwrap();
        let mut time_mask = DimensionMask::new_1d(2);
        let mut level_mask = DimensionMask::new_2d(2, 3);
        // Row 0 -> [1, 3], row 1 -> [5].
        let predicate = MembershipPredicate::new(
            MembershipOp::In,
            vec![1.0, 3.0, 5.0],
            None,
            None,
            DataType::Double,
        )
        .unwrap();
        level_mask
            .update_all_2d(&mut time_mask, &predicate, &variable)
            .unwrap();
        assert_eq!(level_mask.masked_length(), 2);

        let mut set = DimensionMaskSet::new();
        set.insert(DimensionType::Time, time_mask).unwrap();
        set.insert(DimensionType::Vertical, level_mask).unwrap();
        filter_variable(&mut variable, &set).unwrap();

        assert_eq!(variable.dims[1].1, 2);
        let ArrayData::Double(values) = &variable.data else {
            panic!("expected doubles");
        };
        assert_eq!(&values[..2], &[1.0, 3.0]);
        assert_eq!(values[2], 5.0);
        assert!(values[3].is_nan());
    }

    #[test]
    fn string_slots_move_without_cloning() {
        let mut variable = Variable::with_data(
            "s",
            vec![(DimensionType::Time, 3)],
            ArrayData::Str(vec![Some("a".into()), Some("b".into()), Some("c".into())]),
        )
        .unwrap();
        let mut set = DimensionMaskSet::new();
        set.insert(DimensionType::Time, mask_from_bits(&[false, true, true]))
            .unwrap();
        filter_variable(&mut variable, &set).unwrap();
        assert_eq!(
            variable.data,
            ArrayData::Str(vec![Some("b".into()), Some("c".into())])
        );
    }

    #[test]
    fn empty_mask_clears_the_product() {
        let mut product = Product::new();
        product
            .add_variable(
                Variable::with_data(
                    "t",
                    vec![(DimensionType::Time, 2)],
                    ArrayData::Double(vec![1.0, 2.0]),
                )
                .unwrap(),
            )
            .unwrap();
        let mut set = DimensionMaskSet::new();
        set.insert(DimensionType::Time, mask_from_bits(&[false, false]))
            .unwrap();
        filter_product(&mut product, &set).unwrap();
        assert!(product.is_empty());
    }

    #[test]
    fn product_filter_broadcasts_for_rank2_masks() {
        let mut product = Product::new();
        product
            .add_variable(
                Variable::with_data(
                    "t",
                    vec![(DimensionType::Time, 2)],
                    ArrayData::Double(vec![1.0, 2.0]),
                )
                .unwrap(),
            )
            .unwrap();
        // Vertical-only variable; a rank-2 vertical mask forces a time
        // broadcast before filtering.
        product
            .add_variable(
                Variable::with_data(
                    "z",
                    vec![(DimensionType::Vertical, 3)],
                    ArrayData::Double(vec![10.0, 20.0, 30.0]),
                )
                .unwrap(),
            )
            .unwrap();

        let mut level_mask = DimensionMask::new_2d(2, 3);
        level_mask.clear(0); // row 0 keeps levels 1, 2
        level_mask.clear(5); // row 1 keeps levels 0, 1
        let mut set = DimensionMaskSet::new();
        set.insert(DimensionType::Vertical, level_mask).unwrap();

        filter_product(&mut product, &set).unwrap();
        let z = product.variable("z").unwrap();
        assert_eq!(
            z.dims,
            vec![(DimensionType::Time, 2), (DimensionType::Vertical, 2)]
        );
        assert_eq!(z.data, ArrayData::Double(vec![20.0, 30.0, 10.0, 20.0]));
        assert_eq!(product.dimension(DimensionType::Vertical), Some(2));
    }
}

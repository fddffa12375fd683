//! Collocation masks: joining products against external pair tables.
//!
//! A collocation result pairs samples of two datasets; for filtering, the
//! engine only needs the `(collocation_index, sample_index)` pairs that
//! involve a given product on a given side. Lookup happens either through
//! binary search on an existing `collocation_index` variable, or through a
//! two-pointer merge against a monotonically non-decreasing `index`
//! variable, in which case the matched collocation indices become a new
//! variable.

use serde::{Deserialize, Serialize};
use strum_macros::Display;
use tracing::debug;
use tropo_product::{ArrayData, DataType, DimensionType, Product, Variable};

use crate::error::{PipelineError, Result};

/// Which dataset of the pair table the product belongs to.
#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CollocationSide {
    #[strum(serialize = "a")]
    A,
    #[strum(serialize = "b")]
    B,
}

/// One retained collocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollocationPair {
    pub collocation_index: i64,
    pub sample_index: i64,
}

/// The sort key the pair list currently honours. Binary search requires
/// the matching order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollocationSortKey {
    BySampleIndex,
    ByCollocationIndex,
}

/// Sorted table of index pairs for one (side, source product) query.
#[derive(Debug, Clone)]
pub struct CollocationMask {
    pairs: Vec<CollocationPair>,
    sort_key: CollocationSortKey,
}

impl CollocationMask {
    pub fn new(mut pairs: Vec<CollocationPair>) -> Self {
        pairs.sort_by_key(|p| p.sample_index);
        CollocationMask {
            pairs,
            sort_key: CollocationSortKey::BySampleIndex,
        }
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn pairs(&self) -> &[CollocationPair] {
        &self.pairs
    }

    pub fn sort_by_sample_index(&mut self) {
        if self.sort_key != CollocationSortKey::BySampleIndex {
            self.pairs.sort_by_key(|p| p.sample_index);
            self.sort_key = CollocationSortKey::BySampleIndex;
        }
    }

    pub fn sort_by_collocation_index(&mut self) {
        if self.sort_key != CollocationSortKey::ByCollocationIndex {
            self.pairs.sort_by_key(|p| p.collocation_index);
            self.sort_key = CollocationSortKey::ByCollocationIndex;
        }
    }

    /// Binary search for a collocation index; sorts first if needed.
    pub fn contains_collocation_index(&mut self, collocation_index: i64) -> bool {
        self.sort_by_collocation_index();
        self.pairs
            .binary_search_by_key(&collocation_index, |p| p.collocation_index)
            .is_ok()
    }

    /// Sample indices retained by the mask, ascending and deduplicated.
    pub fn sample_indices(&self) -> Vec<i64> {
        let mut indices: Vec<i64> = self.pairs.iter().map(|p| p.sample_index).collect();
        indices.sort_unstable();
        indices.dedup();
        indices
    }
}

/// Apply a collocation mask to a product, rearranging it to exactly the
/// collocated rows.
pub fn apply_collocation_mask(product: &mut Product, mask: &mut CollocationMask) -> Result<()> {
    let Some(time_length) = product.dimension(DimensionType::Time) else {
        return Ok(());
    };
    if time_length == 0 {
        return Ok(());
    }

    if product.has_variable("collocation_index") {
        let keep: Vec<bool> = {
            let variable = product.variable("collocation_index")?;
            check_index_variable(variable)?;
            (0..variable.num_elements())
                .map(|i| variable.data.get_f64(i).map(|v| v as i64))
                .collect::<tropo_product::Result<Vec<i64>>>()?
                .into_iter()
                .map(|v| mask.contains_collocation_index(v))
                .collect()
        };
        debug!(
            retained = keep.iter().filter(|&&b| b).count(),
            total = keep.len(),
            "collocation filter by collocation_index"
        );
        product.filter_dimension(DimensionType::Time, &keep)?;
        return Ok(());
    }

    // Merge-join the sorted mask against the monotonic index variable.
    let (rows, collocation_indices) = {
        let index = product.variable("index")?;
        check_index_variable(index)?;
        mask.sort_by_sample_index();

        let mut rows = Vec::new();
        let mut collocation_indices = Vec::new();
        let mut i = 0;
        let mut j = 0;
        while i < mask.pairs.len() && j < index.num_elements() {
            let sample = index.data.get_f64(j)? as i64;
            if mask.pairs[i].sample_index < sample {
                // Measurement not present in product, ignore.
                i += 1;
            } else if mask.pairs[i].sample_index > sample {
                // Measurement not selected, or duplicate index in product,
                // ignore.
                j += 1;
            } else {
                rows.push(j);
                collocation_indices.push(mask.pairs[i].collocation_index as i32);
                i += 1;
            }
        }
        (rows, collocation_indices)
    };

    if rows.is_empty() {
        product.clear();
        return Ok(());
    }

    product.rearrange_dimension(DimensionType::Time, &rows)?;
    let variable = Variable::with_data(
        "collocation_index",
        vec![(DimensionType::Time, collocation_indices.len())],
        ArrayData::Int32(collocation_indices),
    )?;
    product.add_variable(variable)?;
    Ok(())
}

fn check_index_variable(variable: &Variable) -> Result<()> {
    if variable.data_type() != DataType::Int32 {
        return Err(PipelineError::operation(format!(
            "variable '{}' has wrong data type '{}' (expected 'int32')",
            variable.name,
            variable.data_type()
        )));
    }
    if variable.num_dims() != 1 {
        return Err(PipelineError::operation(format!(
            "variable '{}' has {} dimensions (expected 1)",
            variable.name,
            variable.num_dims()
        )));
    }
    if variable.dimension_type(0) != DimensionType::Time {
        return Err(PipelineError::operation(format!(
            "dimension 0 of variable '{}' is of type '{}' (expected 'time')",
            variable.name,
            variable.dimension_type(0)
        )));
    }
    Ok(())
}

/// Access to collocation pair tables. The engine asks for the sorted mask
/// of a (side, source product) combination, optionally windowed by
/// collocation index.
pub trait CollocationSource: Send + Sync {
    fn mask(
        &self,
        resource: &str,
        side: CollocationSide,
        source_product: &str,
        index_range: Option<(i64, i64)>,
    ) -> Result<CollocationMask>;
}

/// In-memory collocation result table, as parsed from its row-oriented
/// text form.
#[derive(Debug, Clone, Default)]
pub struct CollocationTable {
    rows: Vec<CollocationRow>,
}

#[derive(Debug, Clone)]
struct CollocationRow {
    collocation_index: i64,
    source_product_a: String,
    source_product_b: String,
    sample_index_a: i64,
    sample_index_b: i64,
}

impl CollocationTable {
    /// Parse a comma-separated collocation result with a header naming at
    /// least `collocation_index`, `source_product_a`, `source_product_b`,
    /// `sample_index_a` and `sample_index_b`.
    pub fn parse(text: &str) -> Result<Self> {
        let mut lines = text.lines().enumerate().filter(|(_, l)| !l.trim().is_empty());
        let (_, header) = lines
            .next()
            .ok_or_else(|| PipelineError::import("collocation table is empty"))?;
        let columns: Vec<&str> = header.split(',').map(str::trim).collect();
        let column = |name: &str| -> Result<usize> {
            columns.iter().position(|&c| c == name).ok_or_else(|| {
                PipelineError::import(format!("collocation table is missing column '{name}'"))
            })
        };
        let collocation_index = column("collocation_index")?;
        let source_product_a = column("source_product_a")?;
        let source_product_b = column("source_product_b")?;
        let sample_index_a = column("sample_index_a")?;
        let sample_index_b = column("sample_index_b")?;

        let mut rows = Vec::new();
        for (line_no, line) in lines {
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            if fields.len() < columns.len() {
                return Err(PipelineError::import(format!(
                    "collocation table line {} has {} fields; expected {}",
                    line_no + 1,
                    fields.len(),
                    columns.len()
                )));
            }
            let int = |index: usize| -> Result<i64> {
                fields[index].parse::<i64>().map_err(|_| {
                    PipelineError::import(format!(
                        "invalid integer '{}' on collocation table line {}",
                        fields[index],
                        line_no + 1
                    ))
                })
            };
            rows.push(CollocationRow {
                collocation_index: int(collocation_index)?,
                source_product_a: fields[source_product_a].to_string(),
                source_product_b: fields[source_product_b].to_string(),
                sample_index_a: int(sample_index_a)?,
                sample_index_b: int(sample_index_b)?,
            });
        }
        Ok(CollocationTable { rows })
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    /// The sample index on `side` of the pair with the given collocation
    /// index.
    pub fn target_sample_index(
        &self,
        collocation_index: i64,
        side: CollocationSide,
    ) -> Option<i64> {
        self.rows
            .iter()
            .find(|row| row.collocation_index == collocation_index)
            .map(|row| match side {
                CollocationSide::A => row.sample_index_a,
                CollocationSide::B => row.sample_index_b,
            })
    }

    /// The source product paired opposite to `source_product`, which
    /// appears on `side` of the table.
    pub fn paired_source_product(
        &self,
        side: CollocationSide,
        source_product: &str,
    ) -> Option<String> {
        self.rows.iter().find_map(|row| match side {
            CollocationSide::A if row.source_product_a == source_product => {
                Some(row.source_product_b.clone())
            }
            CollocationSide::B if row.source_product_b == source_product => {
                Some(row.source_product_a.clone())
            }
            _ => None,
        })
    }

    /// Build the mask of pairs whose given side matches `source_product`,
    /// optionally windowed by collocation index.
    pub fn mask_for(
        &self,
        side: CollocationSide,
        source_product: &str,
        index_range: Option<(i64, i64)>,
    ) -> CollocationMask {
        let pairs = self
            .rows
            .iter()
            .filter(|row| match side {
                CollocationSide::A => row.source_product_a == source_product,
                CollocationSide::B => row.source_product_b == source_product,
            })
            .filter(|row| match index_range {
                Some((min, max)) => row.collocation_index >= min && row.collocation_index <= max,
                None => true,
            })
            .map(|row| CollocationPair {
                collocation_index: row.collocation_index,
                sample_index: match side {
                    CollocationSide::A => row.sample_index_a,
                    CollocationSide::B => row.sample_index_b,
                },
            })
            .collect();
        CollocationMask::new(pairs)
    }
}

/// Collocation source backed by files on disk.
#[derive(Debug, Clone, Default)]
pub struct FsCollocationSource;

impl CollocationSource for FsCollocationSource {
    fn mask(
        &self,
        resource: &str,
        side: CollocationSide,
        source_product: &str,
        index_range: Option<(i64, i64)>,
    ) -> Result<CollocationMask> {
        let text = std::fs::read_to_string(resource).map_err(|e| {
            PipelineError::import(format!("could not read collocation result '{resource}': {e}"))
        })?;
        let table = CollocationTable::parse(&text)?;
        Ok(table.mask_for(side, source_product, index_range))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(list: &[(i64, i64)]) -> CollocationMask {
        CollocationMask::new(
            list.iter()
                .map(|&(collocation_index, sample_index)| CollocationPair {
                    collocation_index,
                    sample_index,
                })
                .collect(),
        )
    }

    fn product_with_index(values: Vec<i32>) -> Product {
        let mut product = Product::with_source("s5p_l2_o3");
        let len = values.len();
        product
            .add_variable(
                Variable::with_data(
                    "index",
                    vec![(DimensionType::Time, len)],
                    ArrayData::Int32(values),
                )
                .unwrap(),
            )
            .unwrap();
        product
    }

    #[test]
    fn merge_join_builds_collocation_index_variable() {
        let mut product = product_with_index(vec![5, 7, 9]);
        let mut mask = pairs(&[(100, 5), (101, 9)]);
        apply_collocation_mask(&mut product, &mut mask).unwrap();

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
    fn duplicate_product_indices_are_skipped() {
        let mut product = product_with_index(vec![5, 5, 9]);
        let mut mask = pairs(&[(100, 5), (101, 9)]);
        apply_collocation_mask(&mut product, &mut mask).unwrap();
        assert_eq!(
            product.variable("index").unwrap().data,
            ArrayData::Int32(vec![5, 9])
        );
    }

    #[test]
    fn collocation_index_variable_uses_binary_search_path() {
        let mut product = Product::with_source("any");
        product
            .add_variable(
                Variable::with_data(
                    "collocation_index",
                    vec![(DimensionType::Time, 4)],
                    ArrayData::Int32(vec![3, 4, 5, 6]),
                )
                .unwrap(),
            )
            .unwrap();
        let mut mask = pairs(&[(4, 0), (6, 1)]);
        apply_collocation_mask(&mut product, &mut mask).unwrap();
        assert_eq!(
            product.variable("collocation_index").unwrap().data,
            ArrayData::Int32(vec![4, 6])
        );
    }

    #[test]
    fn no_matches_empties_the_product() {
        let mut product = product_with_index(vec![1, 2, 3]);
        let mut mask = pairs(&[(100, 50)]);
        apply_collocation_mask(&mut product, &mut mask).unwrap();
        assert!(product.is_empty());
    }

    #[test]
    fn table_filters_by_side_and_window() {
        let text = "\
collocation_index,source_product_a,product_index_a,sample_index_a,source_product_b,product_index_b,sample_index_b
100,prod_a,0,5,prod_b,0,12
101,prod_a,0,7,prod_b,0,14
102,other,1,3,prod_b,0,16
";
        let table = CollocationTable::parse(text).unwrap();
        assert_eq!(table.num_rows(), 3);

        let mask = table.mask_for(CollocationSide::A, "prod_a", None);
        assert_eq!(
            mask.pairs(),
            &[
                CollocationPair { collocation_index: 100, sample_index: 5 },
                CollocationPair { collocation_index: 101, sample_index: 7 },
            ]
        );

        let windowed = table.mask_for(CollocationSide::B, "prod_b", Some((101, 102)));
        assert_eq!(windowed.sample_indices(), vec![14, 16]);
    }
}

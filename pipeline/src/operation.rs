//! The operation model: one tagged variant per pipeline step.
//!
//! Each variant carries its full parameter set. Numeric parameters that
//! accept a unit (coordinates, distances, longitude windows) are
//! normalized into canonical units at construction time so that execution
//! never re-parses them. Constructor functions validate what can be
//! validated without a product; semantic checks against variables happen
//! at execution.

use serde::{Deserialize, Serialize};
use tropo_product::{DataType, DimensionType};

use crate::collocation::CollocationSide;
use crate::error::{PipelineError, Result};
use crate::geometry::{AreaMask, SphericalPoint, SphericalPolygon};
use crate::predicate::{BitMaskOp, ComparisonOp, MembershipOp};
use crate::units::UnitConverter;

/// An area parameter: a polygon file to load lazily, or an inline mask.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AreaSpec {
    File(String),
    Inline(AreaMask),
}

/// One step of a program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    AreaCoversArea {
        area: AreaSpec,
    },
    AreaCoversPoint {
        point: SphericalPoint,
    },
    AreaInsideArea {
        area: AreaSpec,
    },
    AreaIntersectsArea {
        area: AreaSpec,
        min_fraction: Option<f64>,
    },
    BinCollocated {
        collocation_result: String,
        target: CollocationSide,
    },
    BinFull,
    BinSpatial {
        latitude_edges: Vec<f64>,
        longitude_edges: Vec<f64>,
    },
    BinWithVariables {
        variables: Vec<String>,
    },
    BitMaskFilter {
        variable: String,
        op: BitMaskOp,
        mask: u32,
    },
    Clamp {
        dimension: DimensionType,
        axis_variable: String,
        axis_unit: Option<String>,
        bounds: [f64; 2],
    },
    CollocationFilter {
        filename: String,
        side: CollocationSide,
        index_range: Option<(i64, i64)>,
    },
    ComparisonFilter {
        variable: String,
        op: ComparisonOp,
        value: f64,
        unit: Option<String>,
    },
    DeriveVariable {
        variable: String,
        data_type: Option<DataType>,
        dimensions: Option<Vec<DimensionType>>,
        unit: Option<String>,
    },
    DeriveSmoothedColumnCollocatedDataset {
        variable: String,
        dimensions: Vec<DimensionType>,
        unit: Option<String>,
        axis_variable: String,
        axis_unit: Option<String>,
        collocation_result: String,
        target: CollocationSide,
        dataset_dir: String,
    },
    DeriveSmoothedColumnCollocatedProduct {
        variable: String,
        dimensions: Vec<DimensionType>,
        unit: Option<String>,
        axis_variable: String,
        axis_unit: Option<String>,
        filename: String,
    },
    ExcludeVariable {
        patterns: Vec<String>,
    },
    Flatten {
        dimension: DimensionType,
    },
    IndexComparisonFilter {
        dimension: DimensionType,
        op: ComparisonOp,
        value: i64,
    },
    IndexMembershipFilter {
        dimension: DimensionType,
        op: MembershipOp,
        values: Vec<i64>,
    },
    KeepVariable {
        patterns: Vec<String>,
    },
    LongitudeRangeFilter {
        min: f64,
        max: f64,
    },
    MembershipFilter {
        variable: String,
        op: MembershipOp,
        values: Vec<f64>,
        unit: Option<String>,
    },
    PointDistanceFilter {
        point: SphericalPoint,
        distance_m: f64,
    },
    PointInAreaFilter {
        area: AreaSpec,
    },
    Rebin {
        dimension: DimensionType,
        axis_variable: String,
        axis_unit: Option<String>,
        edges: Vec<f64>,
    },
    Regrid {
        dimension: DimensionType,
        axis_variable: String,
        axis_unit: Option<String>,
        values: Vec<f64>,
        bounds: Option<Vec<f64>>,
    },
    RegridCollocatedDataset {
        dimension: DimensionType,
        axis_variable: String,
        axis_unit: Option<String>,
        collocation_result: String,
        target: CollocationSide,
        dataset_dir: String,
    },
    RegridCollocatedProduct {
        dimension: DimensionType,
        axis_variable: String,
        axis_unit: Option<String>,
        filename: String,
    },
    Rename {
        from: String,
        to: String,
    },
    Set {
        option: String,
        value: String,
    },
    SmoothCollocatedDataset {
        variables: Vec<String>,
        dimension: DimensionType,
        axis_variable: String,
        axis_unit: Option<String>,
        collocation_result: String,
        target: CollocationSide,
        dataset_dir: String,
    },
    SmoothCollocatedProduct {
        variables: Vec<String>,
        dimension: DimensionType,
        axis_variable: String,
        axis_unit: Option<String>,
        filename: String,
    },
    Sort {
        variables: Vec<String>,
    },
    Squash {
        dimension: DimensionType,
        variables: Vec<String>,
    },
    StringComparisonFilter {
        variable: String,
        op: ComparisonOp,
        value: String,
    },
    StringMembershipFilter {
        variable: String,
        op: MembershipOp,
        values: Vec<String>,
    },
    ValidRangeFilter {
        variable: String,
        invert: bool,
    },
    Wrap {
        variable: String,
        unit: Option<String>,
        min: f64,
        max: f64,
    },
}

/// Convert a coordinate or distance into its canonical unit.
fn to_canonical(value: f64, unit: Option<&str>, canonical: &str) -> Result<f64> {
    match unit {
        Some(unit) if !crate::units::units_compatible(unit, canonical) => {
            Ok(UnitConverter::new(unit, canonical)?.apply(value))
        }
        _ => Ok(value),
    }
}

impl Operation {
    /// Point-distance filter, normalizing coordinates to degrees and the
    /// distance to metres.
    pub fn point_distance(
        latitude: f64,
        latitude_unit: Option<&str>,
        longitude: f64,
        longitude_unit: Option<&str>,
        distance: f64,
        distance_unit: Option<&str>,
    ) -> Result<Self> {
        Ok(Operation::PointDistanceFilter {
            point: SphericalPoint::new(
                to_canonical(latitude, latitude_unit, "degree_north")?,
                to_canonical(longitude, longitude_unit, "degree_east")?,
            ),
            distance_m: to_canonical(distance, distance_unit, "m")?,
        })
    }

    /// Area-covers-point filter with coordinates normalized to degrees.
    pub fn area_covers_point(
        latitude: f64,
        latitude_unit: Option<&str>,
        longitude: f64,
        longitude_unit: Option<&str>,
    ) -> Result<Self> {
        Ok(Operation::AreaCoversPoint {
            point: SphericalPoint::new(
                to_canonical(latitude, latitude_unit, "degree_north")?,
                to_canonical(longitude, longitude_unit, "degree_east")?,
            ),
        })
    }

    /// Longitude window, normalizing both bounds to degrees so that
    /// `0 <= max - min <= 360` holds after predicate construction.
    pub fn longitude_range(
        min: f64,
        min_unit: Option<&str>,
        max: f64,
        max_unit: Option<&str>,
    ) -> Result<Self> {
        Ok(Operation::LongitudeRangeFilter {
            min: to_canonical(min, min_unit, "degree_east")?,
            max: to_canonical(max, max_unit, "degree_east")?,
        })
    }

    /// Build an inline area from latitude/longitude vertex lists.
    pub fn inline_area(
        latitudes: &[f64],
        latitude_unit: Option<&str>,
        longitudes: &[f64],
        longitude_unit: Option<&str>,
    ) -> Result<AreaSpec> {
        let latitudes: Vec<f64> = latitudes
            .iter()
            .map(|&v| to_canonical(v, latitude_unit, "degree_north"))
            .collect::<Result<_>>()?;
        let longitudes: Vec<f64> = longitudes
            .iter()
            .map(|&v| to_canonical(v, longitude_unit, "degree_east"))
            .collect::<Result<_>>()?;
        Ok(AreaSpec::Inline(AreaMask::single(
            SphericalPolygon::from_bounds(&latitudes, &longitudes)?,
        )))
    }

    /// Spatial binning grid. Edges must be monotonically increasing; the
    /// longitude edges may span at most a full wrap of exactly 360°.
    pub fn bin_spatial(latitude_edges: Vec<f64>, longitude_edges: Vec<f64>) -> Result<Self> {
        for (name, edges) in [("latitude", &latitude_edges), ("longitude", &longitude_edges)] {
            if edges.len() < 2 {
                return Err(PipelineError::invalid_argument(format!(
                    "{name} edges need at least 2 values"
                )));
            }
            if edges.windows(2).any(|w| w[0] >= w[1]) {
                return Err(PipelineError::invalid_argument(format!(
                    "{name} edges must be strictly increasing"
                )));
            }
        }
        let span = longitude_edges[longitude_edges.len() - 1] - longitude_edges[0];
        if span > 360.0 {
            return Err(PipelineError::invalid_argument(
                "longitude edges may wrap by at most 360 degrees",
            ));
        }
        Ok(Operation::BinSpatial { latitude_edges, longitude_edges })
    }

    /// The variable a value filter applies to, used for fusion grouping.
    pub fn variable_name(&self) -> Option<&str> {
        match self {
            Operation::BitMaskFilter { variable, .. }
            | Operation::ComparisonFilter { variable, .. }
            | Operation::MembershipFilter { variable, .. }
            | Operation::StringComparisonFilter { variable, .. }
            | Operation::StringMembershipFilter { variable, .. }
            | Operation::ValidRangeFilter { variable, .. } => Some(variable),
            Operation::LongitudeRangeFilter { .. } => Some("longitude"),
            _ => None,
        }
    }

    /// Filters that test individual values of a named variable.
    pub fn is_value_filter(&self) -> bool {
        matches!(
            self,
            Operation::BitMaskFilter { .. }
                | Operation::ComparisonFilter { .. }
                | Operation::LongitudeRangeFilter { .. }
                | Operation::MembershipFilter { .. }
                | Operation::StringComparisonFilter { .. }
                | Operation::StringMembershipFilter { .. }
                | Operation::ValidRangeFilter { .. }
        )
    }

    pub fn is_string_value_filter(&self) -> bool {
        matches!(
            self,
            Operation::StringComparisonFilter { .. } | Operation::StringMembershipFilter { .. }
        )
    }

    /// Filters over derived point geometry.
    pub fn is_point_filter(&self) -> bool {
        matches!(
            self,
            Operation::PointDistanceFilter { .. } | Operation::PointInAreaFilter { .. }
        )
    }

    /// Filters over derived area geometry.
    pub fn is_area_filter(&self) -> bool {
        matches!(
            self,
            Operation::AreaCoversArea { .. }
                | Operation::AreaCoversPoint { .. }
                | Operation::AreaInsideArea { .. }
                | Operation::AreaIntersectsArea { .. }
        )
    }

    pub fn is_index_filter(&self) -> bool {
        matches!(
            self,
            Operation::IndexComparisonFilter { .. } | Operation::IndexMembershipFilter { .. }
        )
    }
}

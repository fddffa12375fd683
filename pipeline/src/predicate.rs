//! Filter predicates: per-element boolean tests with captured parameters.
//!
//! Value predicates evaluate one element of a variable; index predicates
//! evaluate positional indices along a dimension; point and area
//! predicates evaluate derived geographic geometry. Predicates are built
//! by the execution engine once per filter pass, with unit converters and
//! valid ranges resolved against the target variable at build time so
//! evaluation stays a tight loop.

use serde::{Deserialize, Serialize};
use strum_macros::Display;
use tropo_product::{DataType, Variable};

use crate::error::{PipelineError, Result};
use crate::geometry::{AreaMask, SphericalPoint, SphericalPolygon};
use crate::units::UnitConverter;

/// Comparison operators for value and index filters.
#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComparisonOp {
    #[strum(serialize = "==")]
    Eq,
    #[strum(serialize = "!=")]
    Ne,
    #[strum(serialize = "<")]
    Lt,
    #[strum(serialize = "<=")]
    Le,
    #[strum(serialize = ">")]
    Gt,
    #[strum(serialize = ">=")]
    Ge,
}

impl ComparisonOp {
    fn test<T: PartialOrd>(self, left: &T, right: &T) -> bool {
        match self {
            ComparisonOp::Eq => left == right,
            ComparisonOp::Ne => left != right,
            ComparisonOp::Lt => left < right,
            ComparisonOp::Le => left <= right,
            ComparisonOp::Gt => left > right,
            ComparisonOp::Ge => left >= right,
        }
    }
}

/// Membership operators.
#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MembershipOp {
    #[strum(serialize = "in")]
    In,
    #[strum(serialize = "not in")]
    NotIn,
}

/// Bit-mask test modes.
#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
pub enum BitMaskOp {
    /// All bits of the mask must be set
    All,
    /// At least one bit of the mask must be set
    Any,
    /// No bit of the mask may be set
    None,
}

/// Per-element test over one variable.
pub trait ValuePredicate: Send + Sync {
    fn eval(&self, variable: &Variable, index: usize) -> Result<bool>;
}

/// Test over a positional index along a dimension.
pub trait IndexPredicate: Send + Sync {
    fn eval(&self, index: i64) -> bool;
}

/// Test over a derived geographic point.
pub trait PointPredicate: Send + Sync {
    fn eval(&self, point: &SphericalPoint) -> bool;
}

/// Test over a derived geographic area.
pub trait AreaPredicate: Send + Sync {
    fn eval(&self, area: &SphericalPolygon) -> bool;
}

/// View one element as a string, resolving enumerations. Integer variables
/// with an enumeration expose the name for the stored value; out-of-range
/// values resolve to an empty slot.
fn element_str<'a>(variable: &'a Variable, index: usize) -> Result<Option<&'a str>> {
    if variable.data_type() == DataType::Str {
        return Ok(variable.data.get_str(index)?);
    }
    if variable.is_enumerated() {
        let value = variable.data.get_f64(index)?;
        if value.fract() != 0.0 || value < 0.0 {
            return Ok(None);
        }
        return Ok(variable.enum_names.get(value as usize).map(|s| s.as_str()));
    }
    Err(PipelineError::invalid_argument(format!(
        "variable '{}' has no string representation",
        variable.name
    )))
}

/// Numeric comparison against a fixed threshold, optionally converting the
/// variable's values into the filter's unit first.
#[derive(Debug, Clone)]
pub struct ComparisonPredicate {
    op: ComparisonOp,
    value: f64,
    converter: Option<UnitConverter>,
}

impl ComparisonPredicate {
    pub fn new(
        op: ComparisonOp,
        value: f64,
        filter_unit: Option<&str>,
        variable_unit: Option<&str>,
        data_type: DataType,
    ) -> Result<Self> {
        if data_type == DataType::Str {
            return Err(PipelineError::invalid_argument(
                "numeric comparison cannot be applied to a string variable",
            ));
        }
        let converter = build_converter(filter_unit, variable_unit)?;
        Ok(ComparisonPredicate { op, value, converter })
    }
}

impl ValuePredicate for ComparisonPredicate {
    fn eval(&self, variable: &Variable, index: usize) -> Result<bool> {
        let mut value = variable.data.get_f64(index)?;
        if let Some(converter) = &self.converter {
            value = converter.apply(value);
        }
        Ok(self.op.test(&value, &self.value))
    }
}

/// String comparison; `<`..`>=` apply lexicographic order. Empty slots
/// never match except under `!=`.
#[derive(Debug, Clone)]
pub struct StringComparisonPredicate {
    op: ComparisonOp,
    value: String,
}

impl StringComparisonPredicate {
    pub fn new(op: ComparisonOp, value: impl Into<String>) -> Self {
        StringComparisonPredicate { op, value: value.into() }
    }
}

impl ValuePredicate for StringComparisonPredicate {
    fn eval(&self, variable: &Variable, index: usize) -> Result<bool> {
        match element_str(variable, index)? {
            Some(s) => Ok(self.op.test(&s, &self.value.as_str())),
            None => Ok(self.op == ComparisonOp::Ne),
        }
    }
}

/// Membership test against a sorted value list.
#[derive(Debug, Clone)]
pub struct MembershipPredicate {
    op: MembershipOp,
    /// Sorted for binary search.
    values: Vec<f64>,
    converter: Option<UnitConverter>,
}

impl MembershipPredicate {
    pub fn new(
        op: MembershipOp,
        mut values: Vec<f64>,
        filter_unit: Option<&str>,
        variable_unit: Option<&str>,
        data_type: DataType,
    ) -> Result<Self> {
        if data_type == DataType::Str {
            return Err(PipelineError::invalid_argument(
                "numeric membership cannot be applied to a string variable",
            ));
        }
        let converter = build_converter(filter_unit, variable_unit)?;
        values.sort_by(f64::total_cmp);
        Ok(MembershipPredicate { op, values, converter })
    }
}

impl ValuePredicate for MembershipPredicate {
    fn eval(&self, variable: &Variable, index: usize) -> Result<bool> {
        let mut value = variable.data.get_f64(index)?;
        if let Some(converter) = &self.converter {
            value = converter.apply(value);
        }
        let found = self.values.binary_search_by(|v| v.total_cmp(&value)).is_ok();
        Ok(found == (self.op == MembershipOp::In))
    }
}

/// String membership test.
#[derive(Debug, Clone)]
pub struct StringMembershipPredicate {
    op: MembershipOp,
    values: Vec<String>,
}

impl StringMembershipPredicate {
    pub fn new(op: MembershipOp, mut values: Vec<String>) -> Self {
        values.sort();
        StringMembershipPredicate { op, values }
    }
}

impl ValuePredicate for StringMembershipPredicate {
    fn eval(&self, variable: &Variable, index: usize) -> Result<bool> {
        let found = match element_str(variable, index)? {
            Some(s) => self.values.binary_search_by(|v| v.as_str().cmp(s)).is_ok(),
            None => false,
        };
        Ok(found == (self.op == MembershipOp::In))
    }
}

/// Bit-mask test on integer variables; the stored value is reinterpreted
/// as `u32` (sign-extended then truncated).
#[derive(Debug, Clone)]
pub struct BitMaskPredicate {
    op: BitMaskOp,
    mask: u32,
}

impl BitMaskPredicate {
    pub fn new(op: BitMaskOp, mask: u32, data_type: DataType) -> Result<Self> {
        if !data_type.is_integer() {
            return Err(PipelineError::invalid_argument(format!(
                "bit-mask filters require an integer variable, got '{data_type}'"
            )));
        }
        Ok(BitMaskPredicate { op, mask })
    }
}

impl ValuePredicate for BitMaskPredicate {
    fn eval(&self, variable: &Variable, index: usize) -> Result<bool> {
        let bits = variable.data.get_f64(index)? as i64 as u32;
        Ok(match self.op {
            BitMaskOp::All => bits & self.mask == self.mask,
            BitMaskOp::Any => bits & self.mask != 0,
            BitMaskOp::None => bits & self.mask == 0,
        })
    }
}

/// Keep values inside `[valid_min, valid_max]`, rejecting NaN. The
/// inverted mode keeps only the complement.
#[derive(Debug, Clone)]
pub struct ValidRangePredicate {
    min: f64,
    max: f64,
    invert: bool,
}

impl ValidRangePredicate {
    pub fn new(min: f64, max: f64, invert: bool) -> Self {
        ValidRangePredicate { min, max, invert }
    }

    /// Build from a variable's declared valid range, defaulting to the
    /// type's full range where unset.
    pub fn for_variable(variable: &Variable, invert: bool) -> Result<Self> {
        let data_type = variable.data_type();
        if data_type == DataType::Str {
            return Err(PipelineError::invalid_argument(format!(
                "valid-range filter cannot be applied to string variable '{}'",
                variable.name
            )));
        }
        let min = match variable.valid_min {
            Some(scalar) => scalar.as_f64(),
            None => tropo_product::Scalar::type_min(data_type)?.as_f64(),
        };
        let max = match variable.valid_max {
            Some(scalar) => scalar.as_f64(),
            None => tropo_product::Scalar::type_max(data_type)?.as_f64(),
        };
        Ok(ValidRangePredicate::new(min, max, invert))
    }
}

impl ValuePredicate for ValidRangePredicate {
    fn eval(&self, variable: &Variable, index: usize) -> Result<bool> {
        let value = variable.data.get_f64(index)?;
        let valid = !value.is_nan() && value >= self.min && value <= self.max;
        Ok(valid != self.invert)
    }
}

/// Longitude window test; the window is normalized at construction so that
/// `0 <= max - min <= 360` and values are wrapped into `[min, min + 360)`
/// before testing against `max`.
#[derive(Debug, Clone)]
pub struct LongitudeRangePredicate {
    min: f64,
    max: f64,
    converter: Option<UnitConverter>,
}

impl LongitudeRangePredicate {
    pub fn new(
        min: f64,
        max: f64,
        filter_unit: Option<&str>,
        variable_unit: Option<&str>,
    ) -> Result<Self> {
        let converter = build_converter(filter_unit, variable_unit)?;
        let mut max = max;
        while max < min {
            max += 360.0;
        }
        while max - min > 360.0 {
            max -= 360.0;
        }
        Ok(LongitudeRangePredicate { min, max, converter })
    }
}

impl ValuePredicate for LongitudeRangePredicate {
    fn eval(&self, variable: &Variable, index: usize) -> Result<bool> {
        let mut value = variable.data.get_f64(index)?;
        if let Some(converter) = &self.converter {
            value = converter.apply(value);
        }
        if value.is_nan() {
            return Ok(false);
        }
        let wrapped = value - 360.0 * ((value - self.min) / 360.0).floor();
        Ok(wrapped <= self.max)
    }
}

/// Membership of a variable's values in a sorted list of collocation
/// sample indices. Used by the ingestion optimizer to prefilter the
/// `index` variable before the full collocation join runs in memory.
#[derive(Debug, Clone)]
pub struct CollocationIndexPredicate {
    /// Sorted sample indices.
    indices: Vec<i64>,
}

impl CollocationIndexPredicate {
    pub fn new(mut indices: Vec<i64>) -> Self {
        indices.sort_unstable();
        indices.dedup();
        CollocationIndexPredicate { indices }
    }
}

impl ValuePredicate for CollocationIndexPredicate {
    fn eval(&self, variable: &Variable, index: usize) -> Result<bool> {
        let value = variable.data.get_f64(index)? as i64;
        Ok(self.indices.binary_search(&value).is_ok())
    }
}

/// Positional comparison along a dimension.
#[derive(Debug, Clone)]
pub struct IndexComparisonPredicate {
    op: ComparisonOp,
    value: i64,
}

impl IndexComparisonPredicate {
    pub fn new(op: ComparisonOp, value: i64) -> Self {
        IndexComparisonPredicate { op, value }
    }
}

impl IndexPredicate for IndexComparisonPredicate {
    fn eval(&self, index: i64) -> bool {
        self.op.test(&index, &self.value)
    }
}

/// Positional membership along a dimension.
#[derive(Debug, Clone)]
pub struct IndexMembershipPredicate {
    op: MembershipOp,
    values: Vec<i64>,
}

impl IndexMembershipPredicate {
    pub fn new(op: MembershipOp, mut values: Vec<i64>) -> Self {
        values.sort_unstable();
        IndexMembershipPredicate { op, values }
    }
}

impl IndexPredicate for IndexMembershipPredicate {
    fn eval(&self, index: i64) -> bool {
        self.values.binary_search(&index).is_ok() == (self.op == MembershipOp::In)
    }
}

/// Keep points within a great-circle distance of a centre.
#[derive(Debug, Clone)]
pub struct PointDistancePredicate {
    center: SphericalPoint,
    distance_m: f64,
}

impl PointDistancePredicate {
    pub fn new(center: SphericalPoint, distance_m: f64) -> Self {
        PointDistancePredicate { center, distance_m }
    }
}

impl PointPredicate for PointDistancePredicate {
    fn eval(&self, point: &SphericalPoint) -> bool {
        point.distance_m(&self.center) <= self.distance_m
    }
}

/// Keep points inside an area mask.
#[derive(Debug, Clone)]
pub struct PointInAreaPredicate {
    mask: AreaMask,
}

impl PointInAreaPredicate {
    pub fn new(mask: AreaMask) -> Self {
        PointInAreaPredicate { mask }
    }
}

impl PointPredicate for PointInAreaPredicate {
    fn eval(&self, point: &SphericalPoint) -> bool {
        self.mask.any_contains_point(point)
    }
}

/// Keep areas that cover a fixed point.
#[derive(Debug, Clone)]
pub struct AreaCoversPointPredicate {
    point: SphericalPoint,
}

impl AreaCoversPointPredicate {
    pub fn new(point: SphericalPoint) -> Self {
        AreaCoversPointPredicate { point }
    }
}

impl AreaPredicate for AreaCoversPointPredicate {
    fn eval(&self, area: &SphericalPolygon) -> bool {
        area.contains_point(&self.point)
    }
}

/// Keep areas that fully cover some polygon of the mask.
#[derive(Debug, Clone)]
pub struct AreaCoversAreaPredicate {
    mask: AreaMask,
}

impl AreaCoversAreaPredicate {
    pub fn new(mask: AreaMask) -> Self {
        AreaCoversAreaPredicate { mask }
    }
}

impl AreaPredicate for AreaCoversAreaPredicate {
    fn eval(&self, area: &SphericalPolygon) -> bool {
        self.mask.any_covered_by(area)
    }
}

/// Keep areas that lie inside some polygon of the mask.
#[derive(Debug, Clone)]
pub struct AreaInsideAreaPredicate {
    mask: AreaMask,
}

impl AreaInsideAreaPredicate {
    pub fn new(mask: AreaMask) -> Self {
        AreaInsideAreaPredicate { mask }
    }
}

impl AreaPredicate for AreaInsideAreaPredicate {
    fn eval(&self, area: &SphericalPolygon) -> bool {
        self.mask.any_covers(area)
    }
}

/// Keep areas that overlap some polygon of the mask, optionally requiring
/// a minimum overlap fraction.
#[derive(Debug, Clone)]
pub struct AreaIntersectsAreaPredicate {
    mask: AreaMask,
    min_fraction: Option<f64>,
}

impl AreaIntersectsAreaPredicate {
    pub fn new(mask: AreaMask, min_fraction: Option<f64>) -> Self {
        AreaIntersectsAreaPredicate { mask, min_fraction }
    }
}

impl AreaPredicate for AreaIntersectsAreaPredicate {
    fn eval(&self, area: &SphericalPolygon) -> bool {
        self.mask.any_intersects(area, self.min_fraction)
    }
}

fn build_converter(
    filter_unit: Option<&str>,
    variable_unit: Option<&str>,
) -> Result<Option<UnitConverter>> {
    match (filter_unit, variable_unit) {
        (Some(filter), Some(variable)) if !crate::units::units_compatible(filter, variable) => {
            Ok(Some(UnitConverter::new(variable, filter)?))
        }
        (Some(filter), None) => {
            // A unit on the filter with no unit on the variable is accepted
            // as long as the filter unit itself is known.
            UnitConverter::new(filter, filter)?;
            Ok(None)
        }
        _ => Ok(None),
    }
}

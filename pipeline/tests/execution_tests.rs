//! End-to-end pipeline tests: operation strings executed against
//! in-memory products.

use tropo_pipeline::collocation::{CollocationMask, CollocationPair, CollocationSource};
use tropo_pipeline::{CollocationSide, ExecutionEngine, PipelineError};
use tropo_product::{ArrayData, DimensionType, Product, Scalar, Variable};

fn time_variable(name: &str, values: Vec<f64>) -> Variable {
    let len = values.len();
    Variable::with_data(
        name,
        vec![(DimensionType::Time, len)],
        ArrayData::Double(values),
    )
    .unwrap()
}

fn product_with(variables: Vec<Variable>) -> Product {
    let mut product = Product::with_source("test_product");
    for variable in variables {
        product.add_variable(variable).unwrap();
    }
    product
}

struct StaticCollocation(Vec<(i64, i64)>);

impl CollocationSource for StaticCollocation {
    fn mask(
        &self,
        _resource: &str,
        _side: CollocationSide,
        _source_product: &str,
        _index_range: Option<(i64, i64)>,
    ) -> tropo_pipeline::Result<CollocationMask> {
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

#[test]
fn chained_comparisons_narrow_time() {
    // time=4, t=[10,20,30,40], program "t>15;t<40" -> time=2, t=[20,30].
    let mut product = product_with(vec![time_variable("t", vec![10.0, 20.0, 30.0, 40.0])]);
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
fn point_distance_retains_single_sample() {
    let mut product = product_with(vec![
        time_variable("latitude", vec![10.0, 20.0, 30.0]).with_unit("degree_north"),
        time_variable("longitude", vec![0.0, 10.0, 20.0]).with_unit("degree_east"),
    ]);
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
fn collocation_filter_joins_on_index() {
    let mut product = Product::with_source("test_product");
    product
        .add_variable(
            Variable::with_data(
                "index",
                vec![(DimensionType::Time, 3)],
                ArrayData::Int32(vec![5, 7, 9]),
            )
            .unwrap(),
        )
        .unwrap();

    let engine = ExecutionEngine::new()
        .with_collocation_source(Box::new(StaticCollocation(vec![(100, 5), (101, 9)])));
    engine
        .execute_operations(&mut product, r#"collocate-left("pairs.csv")"#)
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
fn keep_then_exclude_selects_variables() {
    let mut product = product_with(
        ["time", "t1", "t2", "tmp_a", "other"]
            .iter()
            .map(|name| time_variable(name, vec![1.0]))
            .collect(),
    );
    ExecutionEngine::new()
        .execute_operations(&mut product, "keep(time,t*);exclude(tmp_*)")
        .unwrap();
    assert_eq!(product.variable_names(), vec!["time", "t1", "t2"]);
}

#[test]
fn keep_and_exclude_are_idempotent() {
    let make = || {
        product_with(
            ["a", "b", "c"]
                .iter()
                .map(|name| time_variable(name, vec![1.0, 2.0]))
                .collect(),
        )
    };
    let engine = ExecutionEngine::new();

    let mut once = make();
    engine.execute_operations(&mut once, "keep(a,b)").unwrap();
    let mut twice = make();
    engine.execute_operations(&mut twice, "keep(a,b);keep(a,b)").unwrap();
    assert_eq!(once.variable_names(), twice.variable_names());

    let mut excluded_once = make();
    engine.execute_operations(&mut excluded_once, "exclude(c)").unwrap();
    let mut excluded_twice = make();
    engine
        .execute_operations(&mut excluded_twice, "exclude(c);exclude(c)")
        .unwrap();
    assert_eq!(excluded_once.variable_names(), excluded_twice.variable_names());
}

#[test]
fn valid_range_drops_rows_with_no_valid_element() {
    let mut product = Product::new();
    product
        .add_variable(
            Variable::with_data(
                "x",
                vec![(DimensionType::Time, 2), (DimensionType::Vertical, 3)],
                // Row 0 has one valid element; row 1 has none.
                ArrayData::Double(vec![50.0, f64::NAN, 120.0, f64::NAN, 130.0, -10.0]),
            )
            .unwrap()
            .with_valid_range(Scalar::Double(0.0), Scalar::Double(100.0)),
        )
        .unwrap();
    ExecutionEngine::new()
        .execute_operations(&mut product, "valid(x)")
        .unwrap();
    assert_eq!(product.dimension(DimensionType::Time), Some(1));
    let x = product.variable("x").unwrap();
    assert_eq!(x.data.get_f64(0).unwrap(), 50.0);
}

#[test]
fn rename_twice_is_a_success_no_op() {
    let mut product = product_with(vec![time_variable("a", vec![1.0])]);
    ExecutionEngine::new()
        .execute_operations(&mut product, "rename(a,b);rename(a,b)")
        .unwrap();
    assert!(product.has_variable("b"));
    assert!(!product.has_variable("a"));
}

#[test]
fn longitude_range_normalizes_wrapped_values() {
    let mut product = product_with(vec![
        time_variable("longitude", vec![340.0, 10.0, 180.0]).with_unit("degree_east"),
    ]);
    ExecutionEngine::new()
        .execute_operations(&mut product, "longitude-range(-30, 50)")
        .unwrap();
    assert_eq!(
        product.variable("longitude").unwrap().data,
        ArrayData::Double(vec![340.0, 10.0])
    );
}

#[test]
fn all_false_filter_yields_empty_product_and_success() {
    let mut product = product_with(vec![
        time_variable("t", vec![1.0, 2.0]),
        time_variable("u", vec![3.0, 4.0]),
    ]);
    ExecutionEngine::new()
        .execute_operations(&mut product, "t>100;u<0")
        .unwrap();
    assert!(product.is_empty());
    assert_eq!(product.num_variables(), 0);
}

#[test]
fn fusion_preserves_retained_row_set() {
    use rand::Rng;
    let mut rng = rand::rng();
    let values: Vec<f64> = (0..200).map(|_| rng.random_range(0.0..50.0)).collect();
    let engine = ExecutionEngine::new();

    let mut fused = product_with(vec![time_variable("v", values.clone())]);
    engine
        .execute_operations(&mut fused, "v>4;v<45;v!=20;v not in (30, 31)")
        .unwrap();

    let mut stepwise = product_with(vec![time_variable("v", values)]);
    for operations in ["v>4", "v<45", "v!=20", "v not in (30, 31)"] {
        engine.execute_operations(&mut stepwise, operations).unwrap();
    }

    assert_eq!(
        fused.variable("v").unwrap().data,
        stepwise.variable("v").unwrap().data
    );
}

#[test]
fn dimension_lengths_stay_consistent_across_variables() {
    let mut product = product_with(vec![
        time_variable("t", vec![1.0, 2.0, 3.0, 4.0]),
        Variable::with_data(
            "profile",
            vec![(DimensionType::Time, 4), (DimensionType::Vertical, 2)],
            ArrayData::Double(vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]),
        )
        .unwrap(),
        Variable::with_data(
            "name",
            vec![(DimensionType::Time, 4)],
            ArrayData::Str(vec![
                Some("a".into()),
                Some("b".into()),
                Some("c".into()),
                Some("d".into()),
            ]),
        )
        .unwrap(),
    ]);
    ExecutionEngine::new()
        .execute_operations(&mut product, "t>1.5;t<4")
        .unwrap();
    product.verify().unwrap();
    assert_eq!(product.dimension(DimensionType::Time), Some(2));
    for variable in product.variables() {
        assert_eq!(variable.dimension_length(0), 2);
    }
    assert_eq!(
        product.variable("name").unwrap().data,
        ArrayData::Str(vec![Some("b".into()), Some("c".into())])
    );
}

#[test]
fn derive_with_unit_only_keeps_shape_and_converts() {
    let mut product = product_with(vec![
        time_variable("altitude", vec![1000.0, 2000.0]).with_unit("m"),
    ]);
    ExecutionEngine::new()
        .execute_operations(&mut product, "derive(altitude [km])")
        .unwrap();
    let altitude = product.variable("altitude").unwrap();
    assert_eq!(altitude.dims, vec![(DimensionType::Time, 2)]);
    assert_eq!(altitude.data, ArrayData::Double(vec![1.0, 2.0]));
    assert_eq!(altitude.unit.as_deref(), Some("km"));
}

#[test]
fn area_filter_on_bounds_variables() {
    // Two samples: the first footprint sits inside the test area, the
    // second is far away.
    let mut product = Product::new();
    product
        .add_variable(
            Variable::with_data(
                "latitude_bounds",
                vec![(DimensionType::Time, 2), (DimensionType::Independent, 4)],
                ArrayData::Double(vec![
                    1.0, 1.0, 2.0, 2.0, //
                    60.0, 60.0, 61.0, 61.0,
                ]),
            )
            .unwrap()
            .with_unit("degree_north"),
        )
        .unwrap();
    product
        .add_variable(
            Variable::with_data(
                "longitude_bounds",
                vec![(DimensionType::Time, 2), (DimensionType::Independent, 4)],
                ArrayData::Double(vec![
                    1.0, 2.0, 2.0, 1.0, //
                    60.0, 61.0, 61.0, 60.0,
                ]),
            )
            .unwrap()
            .with_unit("degree_east"),
        )
        .unwrap();

    ExecutionEngine::new()
        .execute_operations(
            &mut product,
            "area-inside-area((0, 0, 10, 10), (0, 10, 10, 0))",
        )
        .unwrap();
    assert_eq!(product.dimension(DimensionType::Time), Some(1));
}

#[test]
fn unknown_variable_is_an_error_but_leaves_nothing_half_done() {
    let mut product = product_with(vec![time_variable("t", vec![1.0, 2.0])]);
    let error = ExecutionEngine::new()
        .execute_operations(&mut product, "missing>1")
        .unwrap_err();
    assert!(matches!(error, PipelineError::Product(_)));
    // The product is untouched.
    assert_eq!(product.dimension(DimensionType::Time), Some(2));
}

#[test]
fn set_option_applies_to_regrid() {
    // With the edge policy, out-of-range targets take the edge value
    // instead of NaN.
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

    ExecutionEngine::new()
        .execute_operations(
            &mut product,
            "set(regrid_out_of_bounds, edge); regrid(vertical, altitude, (-5, 5))",
        )
        .unwrap();
    assert_eq!(
        product.variable("o3").unwrap().data,
        ArrayData::Double(vec![0.0, 50.0])
    );
}

#[test]
fn sort_orders_every_variable_by_key() {
    let mut product = product_with(vec![
        time_variable("key", vec![3.0, 1.0, 2.0]),
        time_variable("value", vec![30.0, 10.0, 20.0]),
    ]);
    ExecutionEngine::new()
        .execute_operations(&mut product, "sort(key)")
        .unwrap();
    assert_eq!(
        product.variable("value").unwrap().data,
        ArrayData::Double(vec![10.0, 20.0, 30.0])
    );
}

#[test]
fn scalar_string_filter_clears_product_on_mismatch() {
    let mut product = Product::new();
    product
        .add_variable(
            Variable::scalar("platform", ArrayData::Str(vec![Some("S5P".into())])).unwrap(),
        )
        .unwrap();
    product
        .add_variable(
            Variable::scalar("orbit", ArrayData::Int32(vec![42])).unwrap(),
        )
        .unwrap();

    let engine = ExecutionEngine::new();
    let mut kept = product.clone();
    engine
        .execute_operations(&mut kept, r#"platform == "S5P""#)
        .unwrap();
    assert_eq!(kept.num_variables(), 2);

    engine
        .execute_operations(&mut product, r#"platform == "ERS""#)
        .unwrap();
    assert!(product.is_empty());
}

//! Operation language and in-memory execution engine for observation
//! products.
//!
//! A pipeline is written as a semicolon-separated operation string,
//! parsed into a [`Program`], and executed against a
//! [`tropo_product::Product`] by the [`ExecutionEngine`]. Filters compose
//! into coordinated dimension masks so that every variable of the product
//! stays dimensionally consistent; the [`ingest`] module additionally
//! pushes the filter prefix of a program into a streamed [`Reader`] so
//! that discarded samples are never materialized.
//!
//! ```
//! use tropo_pipeline::ExecutionEngine;
//! use tropo_product::{ArrayData, DimensionType, Product, Variable};
//!
//! # fn main() -> tropo_pipeline::Result<()> {
//! let mut product = Product::new();
//! product.add_variable(Variable::with_data(
//!     "t",
//!     vec![(DimensionType::Time, 4)],
//!     ArrayData::Double(vec![10.0, 20.0, 30.0, 40.0]),
//! )?)?;
//!
//! ExecutionEngine::new().execute_operations(&mut product, "t>15;t<40")?;
//! assert_eq!(product.dimension(DimensionType::Time), Some(2));
//! # Ok(())
//! # }
//! ```

pub mod collocation;
pub mod derive;
pub mod engine;
pub mod error;
pub mod filter;
pub mod geometry;
pub mod ingest;
pub mod kernels;
pub mod mask;
pub mod operation;
pub mod options;
pub mod parser;
pub mod predicate;
pub mod program;
pub mod units;

pub use collocation::{
    CollocationMask, CollocationPair, CollocationSide, CollocationSource, CollocationTable,
    FsCollocationSource, apply_collocation_mask,
};
pub use engine::{
    AreaResolver, DatasetResolver, ExecutionEngine, FsAreaResolver, SmoothingKernel,
};
pub use error::{PipelineError, Result};
pub use filter::{filter_product, filter_variable};
pub use geometry::{AreaMask, SphericalPoint, SphericalPolygon, WGS84_SPHERE_RADIUS_M};
pub use ingest::{ReadAccess, Reader, VariableDefinition, ingest, ingest_with_operations};
pub use mask::{DimensionMask, DimensionMaskSet};
pub use operation::{AreaSpec, Operation};
pub use options::EngineOptions;
pub use parser::parse_operations;
pub use predicate::{BitMaskOp, ComparisonOp, MembershipOp};
pub use program::Program;

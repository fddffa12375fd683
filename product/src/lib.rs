//! Data model for multi-dimensional atmospheric observation products.
//!
//! A [`Product`] is an ordered collection of named [`Variable`]s that share
//! a small set of semantic dimensions ([`DimensionType`]). Variables own
//! flat, row-major, typed buffers ([`ArrayData`]) plus optional metadata
//! (unit, valid range, enumeration, description). The crate provides the
//! structural primitives — add/detach/replace, dimension coupling,
//! row gathering — that the pipeline crate builds its filter and transform
//! engine on.

pub mod array;
pub mod datatype;
pub mod error;
pub mod product;
pub mod variable;

pub use array::ArrayData;
pub use datatype::{DataType, DimensionType, Scalar};
pub use error::{ProductError, Result};
pub use product::Product;
pub use variable::{MAX_NUM_DIMS, Variable};

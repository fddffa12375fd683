//! Error type for the product data model.

use thiserror::Error;

use crate::datatype::DimensionType;

/// Error raised by product and variable manipulation.
#[derive(Debug, Error)]
pub enum ProductError {
    /// A variable with the given name already exists in the product
    #[error("variable '{name}' already exists")]
    DuplicateVariable { name: String },

    /// The named variable is not present in the product
    #[error("variable '{name}' does not exist")]
    UnknownVariable { name: String },

    /// A dimension length conflicts with the product dimension table
    #[error(
        "length {length} of dimension '{dimension}' of variable '{name}' \
         does not match product dimension length {expected}"
    )]
    DimensionMismatch {
        name: String,
        dimension: DimensionType,
        length: usize,
        expected: usize,
    },

    /// A data buffer does not match the shape it is declared with
    #[error("variable '{name}' has {actual} elements; expected {expected}")]
    InvalidShape {
        name: String,
        actual: usize,
        expected: usize,
    },

    /// An operation was applied to a variable of an incompatible data type
    #[error("invalid data type: {message}")]
    InvalidType { message: String },

    /// Generic structural violation
    #[error("{message}")]
    Invalid { message: String },
}

impl ProductError {
    pub fn duplicate_variable(name: impl Into<String>) -> Self {
        Self::DuplicateVariable { name: name.into() }
    }

    pub fn unknown_variable(name: impl Into<String>) -> Self {
        Self::UnknownVariable { name: name.into() }
    }

    pub fn invalid_type(message: impl Into<String>) -> Self {
        Self::InvalidType {
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }
}

/// Type alias for Result using ProductError
pub type Result<T> = std::result::Result<T, ProductError>;

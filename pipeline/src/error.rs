//! Error taxonomy of the pipeline engine.
//!
//! The engine exposes a closed set of error categories. Operations never
//! perform partial destructive updates: an operation either commits in
//! full or propagates one of these errors leaving the product unchanged.
//! A product becoming empty is *not* an error.

use thiserror::Error;
use tropo_product::ProductError;

/// Error raised while building or executing an operation pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Allocation failure reported by an external reader or kernel
    #[error("out of memory: {message}")]
    OutOfMemory { message: String },

    /// Bad call shape, impossible unit conversion, or a missing required
    /// variable in a filter that requires it
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Semantic failure during a specific operation
    #[error("operation error: {message}")]
    Operation { message: String },

    /// Syntactic failure from the operation parser, with a byte position
    #[error("syntax error at position {position}: {message}")]
    Script { position: usize, message: String },

    /// Failure reported through the external reader interface
    #[error("import error: {message}")]
    Import { message: String },

    /// Inconsistent product state
    #[error("product error: {0}")]
    Product(#[from] ProductError),
}

// Conversion from anyhow::Error for convenience at integration
// boundaries.
impl From<anyhow::Error> for PipelineError {
    fn from(err: anyhow::Error) -> Self {
        Self::Operation {
            message: format!("{err:#}"),
        }
    }
}

impl PipelineError {
    pub fn out_of_memory(message: impl Into<String>) -> Self {
        Self::OutOfMemory {
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn operation(message: impl Into<String>) -> Self {
        Self::Operation {
            message: message.into(),
        }
    }

    pub fn script(position: usize, message: impl Into<String>) -> Self {
        Self::Script {
            position,
            message: message.into(),
        }
    }

    pub fn import(message: impl Into<String>) -> Self {
        Self::Import {
            message: message.into(),
        }
    }
}

/// Type alias for Result using PipelineError
pub type Result<T> = std::result::Result<T, PipelineError>;

//! Error types for resource parsing and arithmetic.

use thiserror::Error;

/// Errors from parsing or operating on resource bundles.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ResourceError {
    /// The textual form could not be parsed.
    #[error("cannot parse resource {input:?}: {message}")]
    Parse { input: String, message: String },

    /// A checked subtraction would have produced a negative or
    /// non-contained component.
    #[error("cannot subtract {subtrahend} from {minuend}: underflow on {name:?}")]
    Underflow {
        name: String,
        minuend: String,
        subtrahend: String,
    },
}

impl ResourceError {
    pub(crate) fn parse(input: &str, message: impl Into<String>) -> Self {
        Self::Parse {
            input: input.to_string(),
            message: message.into(),
        }
    }
}

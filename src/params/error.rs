//! Parameter binding errors.

use thiserror::Error;

/// Result type for binding operations.
pub type BindResult<T> = Result<T, BindError>;

/// Errors raised while resolving named placeholders.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BindError {
    /// A placeholder in the template has no key in the parameter map.
    #[error("no value for named parameter :{name}")]
    MissingParameter { name: String },

    /// The template has placeholders but the task carries no parameters.
    #[error("statement expects parameters ({}) but none were supplied", names_display(.names))]
    NoParameters { names: Vec<String> },

    /// The template could not be tokenized.
    #[error("invalid statement template: {0}")]
    Template(String),

    /// Parameters were built from a JSON value that is not an object.
    #[error("parameters must be a JSON object, got {found}")]
    NotAnObject { found: &'static str },
}

impl From<sqlparser::tokenizer::TokenizerError> for BindError {
    fn from(e: sqlparser::tokenizer::TokenizerError) -> Self {
        BindError::Template(e.to_string())
    }
}

fn names_display(names: &[String]) -> String {
    names
        .iter()
        .map(|n| format!(":{n}"))
        .collect::<Vec<_>>()
        .join(", ")
}

//! Rule language error types.

use thiserror::Error;

/// Errors that can occur loading or evaluating rules.
#[derive(Error, Debug)]
pub enum DslError {
    /// Reading rule files failed
    #[error("Failed to read rule files: {0}")]
    Io(#[from] std::io::Error),

    /// A rule file is not valid HCL
    #[error("Failed to parse {file}: {message}")]
    Parse { file: String, message: String },

    /// The rule body contains no `on` blocks
    #[error("At least one 'on' block must be defined")]
    EmptyRuleSet,

    /// Two blocks produced the same slug within one parse
    #[error("Duplicate block found: {0}")]
    DuplicateSlug(String),

    /// A label or name is not a valid identifier
    #[error("Invalid label '{0}': must start with a letter and use only letters, digits and underscores")]
    InvalidLabel(String),

    /// A block is missing its label
    #[error("'{0}' block is missing its label")]
    MissingLabel(String),

    /// A `name` attribute is not a string literal
    #[error("'name' must be a string literal")]
    InvalidName,

    /// The bundle has no source event to match against
    #[error("Bundle has no source event")]
    MissingSourceEvent,

    /// The source event payload is unusable
    #[error("Invalid source event: {0}")]
    InvalidSourceEvent(String),

    /// Evaluating an expression failed
    #[error("Failed to evaluate expression: {0}")]
    Eval(String),

    /// Encoding call inputs failed
    #[error("Failed to encode call inputs: {0}")]
    InputsEncode(String),
}

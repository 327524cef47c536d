//! Error types for template compilation and rendering

use thiserror::Error;

/// Result type for template operations
pub type TemplateResult<T> = Result<T, TemplateError>;

/// Errors that can occur while compiling or rendering a template
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TemplateError {
    /// Invalid template syntax
    #[error("invalid template syntax: {message}")]
    Syntax { message: String },

    /// Undefined variable or attribute in template
    #[error("undefined variable: {name}")]
    UndefinedVariable { name: String },

    /// Any other failure while rendering
    #[error("failed to render template: {message}")]
    Render { message: String },
}

impl From<minijinja::Error> for TemplateError {
    fn from(err: minijinja::Error) -> Self {
        match err.kind() {
            minijinja::ErrorKind::SyntaxError => TemplateError::Syntax {
                message: err.to_string(),
            },
            minijinja::ErrorKind::UndefinedError => TemplateError::UndefinedVariable {
                name: err.to_string(),
            },
            _ => TemplateError::Render {
                message: err.to_string(),
            },
        }
    }
}

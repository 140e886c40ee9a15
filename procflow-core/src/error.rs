use thiserror::Error;

use crate::expression::ExpressionError;

/// Structural violation found while compiling a process document.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("parse error at '{element_id}': {reason}")]
pub struct ParseError {
    pub element_id: String,
    pub reason: String,
}

impl ParseError {
    pub fn new(element_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            element_id: element_id.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("Cannot resolve identifier '{0}'")]
    UnresolvedReference(String),

    #[error("expression error: {0}")]
    Expression(String),

    #[error("no subscription matches message '{name}' (correlation key: {correlation_key:?})")]
    Correlation {
        name: String,
        correlation_key: Option<String>,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("listener failed on {event_type}: {message}")]
    ListenerInvocation { event_type: String, message: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("deployment rejected: {0}")]
    Deployment(String),

    #[error("no eligible outgoing flow from '{element_id}'")]
    NoEligibleFlow { element_id: String },

    #[error("command exceeded {limit} transitions")]
    TransitionLimit { limit: usize },

    #[error("store: {0}")]
    Store(#[from] anyhow::Error),
}

impl EngineError {
    pub fn correlation(name: &str, correlation_key: Option<&str>) -> Self {
        Self::Correlation {
            name: name.to_string(),
            correlation_key: correlation_key.map(str::to_string),
        }
    }

    /// True for failures that leave the engine untouched and may succeed on retry
    /// once the caller fixes its input (variables, message keys).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::UnresolvedReference(_)
                | EngineError::Expression(_)
                | EngineError::Correlation { .. }
                | EngineError::NoEligibleFlow { .. }
        )
    }
}

impl From<ExpressionError> for EngineError {
    fn from(err: ExpressionError) -> Self {
        match err {
            ExpressionError::UnresolvedReference(name) => EngineError::UnresolvedReference(name),
            other => EngineError::Expression(other.to_string()),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

// ABOUTME: Error taxonomy for the extraction engine
// ABOUTME: Configuration, database, boundary and invalid-state failures with operation context

use std::fmt;
use thiserror::Error;

/// A single field-level validation failure, keyed by the property it concerns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyError {
    pub property: String,
    pub message: String,
}

impl PropertyError {
    pub fn new(property: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for PropertyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.property, self.message)
    }
}

#[derive(Debug, Error)]
pub enum ExtractorError {
    /// The source configuration is unusable. Reported as a list so callers
    /// can show every problem at once.
    #[error("invalid configuration: {}", join_property_errors(.0))]
    Configuration(Vec<PropertyError>),

    /// A SQL or connection failure. Never retried internally.
    #[error("database error while {operation}: {source:#}")]
    Database {
        operation: String,
        #[source]
        source: anyhow::Error,
    },

    /// A row broke an assumption the window boundaries rely on, for example a
    /// row with every timestamp column null.
    #[error("boundary violation: {0}")]
    BoundaryViolation(String),

    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl ExtractorError {
    pub fn configuration(property: impl Into<String>, message: impl Into<String>) -> Self {
        ExtractorError::Configuration(vec![PropertyError::new(property, message)])
    }

    pub fn database(operation: impl Into<String>, source: anyhow::Error) -> Self {
        ExtractorError::Database {
            operation: operation.into(),
            source,
        }
    }

    /// Field-level errors when this is a configuration failure.
    pub fn property_errors(&self) -> &[PropertyError] {
        match self {
            ExtractorError::Configuration(errors) => errors,
            _ => &[],
        }
    }
}

fn join_property_errors(errors: &[PropertyError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T, E = ExtractorError> = std::result::Result<T, E>;

/// Wraps backend (`anyhow`) failures with the name of the engine operation
/// that was running when they happened.
pub trait DatabaseContext<T> {
    fn during(self, operation: &str) -> Result<T>;
}

impl<T> DatabaseContext<T> for anyhow::Result<T> {
    fn during(self, operation: &str) -> Result<T> {
        self.map_err(|source| ExtractorError::database(operation, source))
    }
}

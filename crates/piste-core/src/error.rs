//! Error types for Piste

use thiserror::Error;

/// The main error type for Piste operations
#[derive(Debug, Error)]
pub enum PisteError {
    #[error("Invalid height field: {0}")]
    InvalidGrid(String),

    #[error("Allocation failed: {0}")]
    Allocation(String),

    #[error("Triangle budget exceeded: frame needs more than {budget} triangles")]
    TriangleBudgetExceeded { budget: usize },

    #[error("Node budget exceeded: tree needs more than {budget} nodes")]
    NodeBudgetExceeded { budget: usize },

    #[error("Image load error: {0}")]
    ImageLoad(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParseError(String),

    #[error("Value out of range: {field} must be between {min} and {max}, got {value}")]
    ValueOutOfRange {
        field: String,
        min: f64,
        max: f64,
        value: f64,
    },
}

/// Result type alias for Piste operations
pub type Result<T> = std::result::Result<T, PisteError>;

impl From<toml::de::Error> for PisteError {
    fn from(err: toml::de::Error) -> Self {
        PisteError::TomlParseError(err.to_string())
    }
}

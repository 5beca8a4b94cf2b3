//! Error types and handling for Helia
//!
//! This module defines the error types used throughout the application,
//! providing consistent error handling and reporting.

use thiserror::Error;

/// Result type alias for Helia operations
pub type Result<T> = std::result::Result<T, HeliaError>;

/// Main error type for Helia
#[derive(Debug, Error)]
pub enum HeliaError {
    /// Configuration-related errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Wallbox UDP request timed out after all attempts
    #[error("Transport timeout: {message}")]
    TransportTimeout { message: String },

    /// Wallbox UDP socket gone or channel stopped
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// Unrecognised wallbox reply payload
    #[error("Parse error: {message}")]
    Parse { message: String },

    /// Reply did not validate for the pending command
    #[error("Reply rejected: {message}")]
    ValidationRejected { message: String },

    /// Inverter Modbus read/connect errors
    #[error("Modbus error: {message}")]
    Modbus { message: String },

    /// Inverter CLI returned a non-zero exit status
    #[error("CLI error: {message}")]
    Cli { message: String },

    /// Inverter CLI invoked again inside the rate-limit window
    #[error("Rate limited: {message}")]
    RateLimited { message: String },

    /// Invalid HTTP payload or field value
    #[error("Invalid input: {field} - {message}")]
    InvalidInput { field: String, message: String },

    /// Missing device address or disabled integration
    #[error("Not configured: {message}")]
    NotConfigured { message: String },

    /// Operation refused because another subsystem holds authority
    #[error("Conflict: {message}")]
    Conflict { message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// File I/O errors
    #[error("I/O error: {message}")]
    Io { message: String },

    /// HTTP/Web server errors
    #[error("Web server error: {message}")]
    Web { message: String },
}

impl HeliaError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        HeliaError::Config {
            message: message.into(),
        }
    }

    /// Create a new transport timeout error
    pub fn timeout<S: Into<String>>(message: S) -> Self {
        HeliaError::TransportTimeout {
            message: message.into(),
        }
    }

    /// Create a new transport error
    pub fn transport<S: Into<String>>(message: S) -> Self {
        HeliaError::Transport {
            message: message.into(),
        }
    }

    /// Create a new parse error
    pub fn parse<S: Into<String>>(message: S) -> Self {
        HeliaError::Parse {
            message: message.into(),
        }
    }

    /// Create a new reply-rejected error
    pub fn rejected<S: Into<String>>(message: S) -> Self {
        HeliaError::ValidationRejected {
            message: message.into(),
        }
    }

    /// Create a new Modbus error
    pub fn modbus<S: Into<String>>(message: S) -> Self {
        HeliaError::Modbus {
            message: message.into(),
        }
    }

    /// Create a new CLI error
    pub fn cli<S: Into<String>>(message: S) -> Self {
        HeliaError::Cli {
            message: message.into(),
        }
    }

    /// Create a new rate-limited error
    pub fn rate_limited<S: Into<String>>(message: S) -> Self {
        HeliaError::RateLimited {
            message: message.into(),
        }
    }

    /// Create a new invalid-input error
    pub fn invalid_input<S: Into<String>>(field: S, message: S) -> Self {
        HeliaError::InvalidInput {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new not-configured error
    pub fn not_configured<S: Into<String>>(message: S) -> Self {
        HeliaError::NotConfigured {
            message: message.into(),
        }
    }

    /// Create a new conflict error
    pub fn conflict<S: Into<String>>(message: S) -> Self {
        HeliaError::Conflict {
            message: message.into(),
        }
    }

    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        HeliaError::Io {
            message: message.into(),
        }
    }

    /// Create a new web error
    pub fn web<S: Into<String>>(message: S) -> Self {
        HeliaError::Web {
            message: message.into(),
        }
    }

    /// Whether this error is a timeout that warrants another transport attempt
    pub fn is_timeout(&self) -> bool {
        matches!(self, HeliaError::TransportTimeout { .. })
    }
}

impl From<std::io::Error> for HeliaError {
    fn from(err: std::io::Error) -> Self {
        HeliaError::io(err.to_string())
    }
}

impl From<serde_yaml::Error> for HeliaError {
    fn from(err: serde_yaml::Error) -> Self {
        HeliaError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for HeliaError {
    fn from(err: serde_json::Error) -> Self {
        HeliaError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<chrono::ParseError> for HeliaError {
    fn from(err: chrono::ParseError) -> Self {
        HeliaError::invalid_input("datetime", &err.to_string())
    }
}

//! # Error Types
//!
//! Error types for the Edgeplane control plane using `thiserror`.
//!
//! Problems found while translating Kubernetes objects are never raised as
//! errors; they are recorded as status conditions on the offending object.
//! The variants here cover the systemic failures that stop startup or a
//! server task.

/// Custom result type for Edgeplane operations
pub type Result<T> = std::result::Result<T, EdgeplaneError>;

/// Main error type for the Edgeplane control plane
#[derive(thiserror::Error, Debug)]
pub enum EdgeplaneError {
    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Validation errors
    #[error("Validation error: {message}")]
    Validation { message: String, field: Option<String> },

    /// I/O errors with additional context
    #[error("I/O error: {context}")]
    Io {
        #[source]
        source: std::io::Error,
        context: String,
    },

    /// Kubernetes manifest decoding errors
    #[error("Manifest error: {message}")]
    Manifest { message: String, path: Option<String> },

    /// Network transport errors (gRPC bind and serve)
    #[error("Transport error: {0}")]
    Transport(String),

    /// xDS protocol errors
    #[error("xDS protocol error: {message}")]
    Xds { message: String, type_url: Option<String> },

    /// Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl EdgeplaneError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config { message: message.into(), source: None }
    }

    /// Create a configuration error with source
    pub fn config_with_source<S: Into<String>>(
        message: S,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        Self::Config { message: message.into(), source: Some(source) }
    }

    /// Create a validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation { message: message.into(), field: None }
    }

    /// Create a validation error with field information
    pub fn validation_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Validation { message: message.into(), field: Some(field.into()) }
    }

    /// Create a manifest error
    pub fn manifest<S: Into<String>>(message: S) -> Self {
        Self::Manifest { message: message.into(), path: None }
    }

    /// Create a manifest error tied to a file
    pub fn manifest_at<S: Into<String>, P: Into<String>>(message: S, path: P) -> Self {
        Self::Manifest { message: message.into(), path: Some(path.into()) }
    }

    /// Create a new transport error
    pub fn transport<S: Into<String>>(message: S) -> Self {
        Self::Transport(message.into())
    }

    /// Create an xDS protocol error
    pub fn xds<S: Into<String>>(message: S) -> Self {
        Self::Xds { message: message.into(), type_url: None }
    }

    /// Create an xDS protocol error for a resource type
    pub fn xds_for_type<S: Into<String>, T: Into<String>>(message: S, type_url: T) -> Self {
        Self::Xds { message: message.into(), type_url: Some(type_url.into()) }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Add context to I/O errors
    pub fn with_context<S: Into<String>>(mut self, context: S) -> Self {
        if let EdgeplaneError::Io { context: ref mut ctx, .. } = self {
            *ctx = format!("{}: {}", context.into(), ctx);
        }
        self
    }
}

impl From<std::io::Error> for EdgeplaneError {
    fn from(error: std::io::Error) -> Self {
        Self::Io { source: error, context: "I/O operation failed".to_string() }
    }
}

impl From<serde_yaml::Error> for EdgeplaneError {
    fn from(error: serde_yaml::Error) -> Self {
        Self::manifest(format!("YAML decoding failed: {}", error))
    }
}

impl From<serde_json::Error> for EdgeplaneError {
    fn from(error: serde_json::Error) -> Self {
        Self::manifest(format!("object decoding failed: {}", error))
    }
}

impl From<config::ConfigError> for EdgeplaneError {
    fn from(error: config::ConfigError) -> Self {
        Self::config_with_source("Configuration loading failed", Box::new(error))
    }
}

impl From<tonic::transport::Error> for EdgeplaneError {
    fn from(error: tonic::transport::Error) -> Self {
        Self::transport(error.to_string())
    }
}

impl From<validator::ValidationErrors> for EdgeplaneError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let mut fields: Vec<String> = errors
            .field_errors()
            .iter()
            .map(|(field, field_errors)| {
                let error_messages: Vec<String> = field_errors
                    .iter()
                    .map(|e| {
                        e.message.as_ref().map_or("Invalid value".to_string(), |m| m.to_string())
                    })
                    .collect();
                format!("{}: {}", field, error_messages.join(", "))
            })
            .collect();
        fields.sort();

        Self::validation(format!("Validation failed: {}", fields.join("; ")))
    }
}

use thiserror::Error;

/// Error types for response cache operations
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Downstream pipeline failed: {0}")]
    Downstream(String),

    #[error("Downstream pipeline finished without producing a response")]
    IncompleteResponse,

    #[error("Gave up populating {path} after {attempts} attempts")]
    Contended { path: String, attempts: u32 },

    #[error("Invalid map capacity {0}: must be a non-zero power of two")]
    InvalidCapacity(usize),

    #[error("Invalid load factor {0}: must be in (0, 1]")]
    InvalidLoadFactor(f32),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl CacheError {
    /// Create a new Downstream error
    pub fn downstream(message: impl Into<String>) -> Self {
        Self::Downstream(message.into())
    }

    /// Create a new Configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Whether a later request for the same path may succeed where this one failed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Downstream(_) | Self::Contended { .. }
        )
    }

    /// Get error category for logging/monitoring
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Io(_) => ErrorCategory::Storage,
            Self::Downstream(_) | Self::IncompleteResponse => ErrorCategory::Downstream,
            Self::Contended { .. } => ErrorCategory::Contention,
            Self::InvalidCapacity(_) | Self::InvalidLoadFactor(_) | Self::Configuration(_) => {
                ErrorCategory::Configuration
            }
        }
    }
}

/// Error categories for monitoring and classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Storage,
    Downstream,
    Contention,
    Configuration,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Storage => write!(f, "storage"),
            Self::Downstream => write!(f, "downstream"),
            Self::Contention => write!(f, "contention"),
            Self::Configuration => write!(f, "configuration"),
        }
    }
}

/// Convenience result type for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: CacheError = io_err.into();

        assert!(matches!(err, CacheError::Io(_)));
        assert!(err.is_retryable());
        assert_eq!(err.category(), ErrorCategory::Storage);
    }

    #[test]
    fn test_contended_error() {
        let err = CacheError::Contended {
            path: "/greet/bob".into(),
            attempts: 8,
        };
        assert_eq!(
            err.to_string(),
            "Gave up populating /greet/bob after 8 attempts"
        );
        assert_eq!(err.category(), ErrorCategory::Contention);
    }

    #[test]
    fn test_configuration_errors_are_not_retryable() {
        let err = CacheError::InvalidCapacity(1000);
        assert!(!err.is_retryable());
        assert_eq!(err.category(), ErrorCategory::Configuration);
        assert_eq!(
            err.to_string(),
            "Invalid map capacity 1000: must be a non-zero power of two"
        );
    }

    #[test]
    fn test_error_categories_display() {
        assert_eq!(ErrorCategory::Storage.to_string(), "storage");
        assert_eq!(ErrorCategory::Downstream.to_string(), "downstream");
        assert_eq!(ErrorCategory::Contention.to_string(), "contention");
        assert_eq!(ErrorCategory::Configuration.to_string(), "configuration");
    }
}

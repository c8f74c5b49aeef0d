//! Error handling for the IvBench engine
//!
//! This module defines custom error types and a Result alias for use
//! throughout the crate.

use thiserror::Error;

/// Main error type for IvBench operations
#[derive(Error, Debug)]
pub enum IvBenchError {
    /// A telemetry line that does not decode as a five-field frame
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Failure to open the instrument port
    #[error("Failed to connect to {port}: {source}")]
    Connect {
        port: String,
        #[source]
        source: serialport::Error,
    },

    /// The link guard could not be acquired within the bounded wait
    #[error("Link busy: gave up after {timeout_ms} ms")]
    LinkBusy { timeout_ms: u64 },

    /// An operation was attempted on a closed link
    #[error("Link is not open")]
    LinkClosed,

    /// Errors from the serial transport
    #[error("Serial error: {0}")]
    Serial(#[from] serialport::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A sweep configuration that cannot run
    #[error("Invalid sweep: {0}")]
    InvalidSweep(String),

    /// A sweep capture with no pairs inside the aggregation window
    #[error("Aggregation window contains no samples")]
    EmptyAggregation,

    /// Errors related to profile loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors related to channel communication
    #[error("Channel error: {0}")]
    Channel(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<IvBenchError>,
    },
}

impl IvBenchError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        IvBenchError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }
}

/// Result type alias for IvBench operations
pub type Result<T> = std::result::Result<T, IvBenchError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = IvBenchError::MalformedFrame("1;2;3".to_string());
        assert_eq!(err.to_string(), "Malformed frame: 1;2;3");
    }

    #[test]
    fn test_error_with_context() {
        let err = IvBenchError::LinkClosed;
        let with_ctx = err.with_context("Failed to issue setpoint");
        assert!(with_ctx.to_string().contains("Failed to issue setpoint"));
        assert!(with_ctx.to_string().contains("not open"));
    }

    #[test]
    fn test_link_busy_reports_timeout() {
        let err = IvBenchError::LinkBusy { timeout_ms: 3000 };
        assert!(err.to_string().contains("3000 ms"));
    }

    #[test]
    fn test_invalid_sweep_display() {
        let err = IvBenchError::InvalidSweep("step must be nonzero".to_string());
        assert_eq!(err.to_string(), "Invalid sweep: step must be nonzero");
    }
}

//! Error types for the streaming engine
//!
//! Only request construction and configuration loading hand these back to
//! callers directly. Errors raised while a request runs on the processing
//! thread are logged and collapse into a terminal `Failed` status.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the streaming engine
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be parsed
    #[error("Failed to parse configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    // =========================================================================
    // Request Errors
    // =========================================================================
    /// Malformed request parameters, caught at creation
    #[error("Invalid request: {0}")]
    Validation(String),

    /// The request was canceled while it was being processed
    #[error("Request was canceled")]
    Canceled,

    /// The engine has shut down and no longer accepts work
    #[error("Streamer has been shut down")]
    Shutdown,

    // =========================================================================
    // Device Errors
    // =========================================================================
    /// File does not exist on the device
    #[error("File not found: {}", path.display())]
    FileNotFound { path: PathBuf },

    /// Open or read failure reported by the device
    #[error("Device error on {}: {reason}", path.display())]
    Device { path: PathBuf, reason: String },

    /// Read extends past the end of the file
    #[error(
        "Short read on {}: requested {requested} bytes at offset {offset}, \
         file size is {file_size}",
        path.display()
    )]
    ShortRead {
        path: PathBuf,
        offset: u64,
        requested: u64,
        file_size: u64,
    },

    // =========================================================================
    // Cache Errors
    // =========================================================================
    /// Internal cache invariant violation (a defect, never expected)
    #[error("Cache consistency error: {0}")]
    CacheConsistency(String),

    // =========================================================================
    // Compression Errors
    // =========================================================================
    /// Decompression failed or produced the wrong amount of data
    #[error("Decompression with {algorithm} failed: {reason}")]
    Decompression { algorithm: String, reason: String },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build a device error from an I/O error for a given file.
    pub fn device(path: impl Into<PathBuf>, err: &std::io::Error) -> Self {
        let path = path.into();
        if err.kind() == std::io::ErrorKind::NotFound {
            Error::FileNotFound { path }
        } else {
            Error::Device {
                path,
                reason: err.to_string(),
            }
        }
    }

    /// Whether this error is the cancellation marker rather than a failure.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Error::Canceled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_maps_to_file_not_found() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err = Error::device("/tmp/nope.bin", &io);
        assert!(matches!(err, Error::FileNotFound { .. }));
        assert!(err.to_string().contains("nope.bin"));
    }

    #[test]
    fn test_other_io_maps_to_device() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = Error::device("/tmp/locked.bin", &io);
        assert!(matches!(err, Error::Device { .. }));
        assert!(!err.is_canceled());
    }

    #[test]
    fn test_short_read_message() {
        let err = Error::ShortRead {
            path: PathBuf::from("a.bin"),
            offset: 10,
            requested: 20,
            file_size: 15,
        };
        let msg = err.to_string();
        assert!(msg.contains("offset 10"));
        assert!(msg.contains("file size is 15"));
    }
}

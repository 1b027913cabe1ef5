//! Error type shared by every gonet crate.

use std::path::PathBuf;

/// All errors that can occur within gonet.
///
/// The variants follow the harness's recovery policy: construction and
/// feed errors (`Shape`, `Contract`, `Config`) are fatal, `Restore` is
/// logged and dropped by the executor, `NumericInstability` skips one
/// training step, `Interrupted` ends training after the session is
/// released, and `Save` always propagates.
#[derive(Debug, thiserror::Error)]
pub enum GoNetError {
    /// A fed array does not match the expected layout.
    #[error("shape error: {message}")]
    Shape { message: String },

    /// A model variant did not provide a required graph element.
    #[error("model contract violated: missing `{name}`")]
    Contract { name: String },

    /// A configuration value is out of range.
    #[error("invalid configuration: {message}")]
    Config { message: String },

    /// Loading parameters from a checkpoint failed.
    #[error("restore from {} failed: {message}", .path.display())]
    Restore { path: PathBuf, message: String },

    /// Loss or gradients became non-finite during a training step.
    #[error("numeric instability: {message}")]
    NumericInstability { message: String },

    /// Training was interrupted by the user.
    #[error("interrupted by user")]
    Interrupted,

    /// The executor was used after `close`.
    #[error("executor is closed")]
    Closed,

    /// Writing a checkpoint failed.
    #[error("saving checkpoint {} failed: {message}", .path.display())]
    Save { path: PathBuf, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Tensor backend failure, with the operation that triggered it.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl GoNetError {
    /// Shorthand for a [`GoNetError::Shape`] with the given message.
    pub fn shape(message: impl Into<String>) -> Self {
        Self::Shape {
            message: message.into(),
        }
    }

    /// Shorthand for a [`GoNetError::Config`] with the given message.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_paths() {
        let err = GoNetError::Restore {
            path: PathBuf::from("savedmodels/original"),
            message: "no checkpoint state".into(),
        };
        let text = err.to_string();
        assert!(text.contains("savedmodels/original"));
        assert!(text.contains("no checkpoint state"));
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: GoNetError = io.into();
        assert!(matches!(err, GoNetError::Io(_)));
    }
}

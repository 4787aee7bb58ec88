//! Error types for the nmtprep pipeline.

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for nmtprep operations.
pub type Result<T> = std::result::Result<T, Error>;

/// HTTP-equivalent status reported to the host runtime on inference failure.
pub const INFERENCE_ERROR_STATUS: u16 = 500;

/// Generic message reported to the host runtime on inference failure.
pub const INFERENCE_ERROR_MESSAGE: &str = "Unknown inference error";

/// Main error type for the nmtprep library.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A regular expression built from configuration failed to compile.
    #[error("Invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    /// A model resource (merge table, script) is missing or corrupt.
    #[error("Failed to load resource {}: {message}", path.display())]
    ResourceLoad { path: PathBuf, message: String },

    /// An external program could not be spawned, failed, or broke its pipes.
    #[error("External tool {} failed: {message}", program.display())]
    ExternalTool { program: PathBuf, message: String },

    /// An external program did not finish in time and was killed.
    #[error("External tool {} timed out after {after:?}", program.display())]
    Timeout { program: PathBuf, after: Duration },

    /// An external program was killed because the request was abandoned.
    #[error("External tool {} was cancelled", program.display())]
    Cancelled { program: PathBuf },

    /// A chain member failed.
    #[error("Stage '{stage}' failed: {source}")]
    Stage {
        stage: String,
        #[source]
        source: Box<Error>,
    },

    /// A request item carries no extractable text.
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    /// Failure surfaced to the host runtime.
    #[error("Inference error ({status}): {message}")]
    Inference { status: u16, message: String },

    /// The language profile is not in a state that allows the operation.
    #[error("Invalid profile state: {0}")]
    InvalidState(String),
}

impl Error {
    pub(crate) fn resource(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Error::ResourceLoad {
            path: path.into(),
            message: message.into(),
        }
    }

    pub(crate) fn external(program: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Error::ExternalTool {
            program: program.into(),
            message: message.into(),
        }
    }

    /// The generic failure reported to clients.
    pub fn unknown_inference() -> Self {
        Error::Inference {
            status: INFERENCE_ERROR_STATUS,
            message: INFERENCE_ERROR_MESSAGE.to_string(),
        }
    }

    /// Returns the innermost error, looking through `Stage` wrappers.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::Stage { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Returns true for errors raised by an external program.
    pub fn is_external(&self) -> bool {
        matches!(
            self.root_cause(),
            Error::ExternalTool { .. } | Error::Timeout { .. } | Error::Cancelled { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_error_names_stage() {
        let err = Error::Stage {
            stage: "tokenizer".to_string(),
            source: Box::new(Error::external("/opt/tokenizer.perl", "exit status 2")),
        };
        let msg = err.to_string();
        assert!(msg.contains("tokenizer"));
        assert!(msg.contains("exit status 2"));
        assert!(err.is_external());
    }

    #[test]
    fn test_root_cause_nested() {
        let inner = Error::Timeout {
            program: PathBuf::from("detokenize.pl"),
            after: Duration::from_secs(1),
        };
        let err = Error::Stage {
            stage: "outer".into(),
            source: Box::new(Error::Stage {
                stage: "inner".into(),
                source: Box::new(inner),
            }),
        };
        assert!(matches!(err.root_cause(), Error::Timeout { .. }));
    }

    #[test]
    fn test_unknown_inference() {
        match Error::unknown_inference() {
            Error::Inference { status, message } => {
                assert_eq!(status, 500);
                assert_eq!(message, "Unknown inference error");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_resource_not_external() {
        let err = Error::resource("bpe-codes.txt", "invalid line 3");
        assert!(!err.is_external());
        assert!(err.to_string().contains("bpe-codes.txt"));
    }
}

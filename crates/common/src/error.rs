//! Error types shared across Viralize crates.

use std::path::PathBuf;

/// Top-level error type for Viralize operations.
#[derive(Debug, thiserror::Error)]
pub enum ViralizeError {
    #[error("Invalid input: {message}")]
    Validation { message: String },

    #[error("Decode error: {message}")]
    Decode { message: String },

    #[error("Audio error: {message}")]
    Audio { message: String },

    #[error("Encode error: {message}")]
    Encode { message: String },

    #[error("Mux error: {message}")]
    Mux { message: String },

    #[error("Render error: {message}")]
    Render { message: String },

    #[error("Playback error: {message}")]
    Playback { message: String },

    #[error("Service error: {message}")]
    Service { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("File not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Unsupported operation: {message}")]
    Unsupported { message: String },

    #[error("Export cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias using ViralizeError.
pub type ViralizeResult<T> = Result<T, ViralizeError>;

impl ViralizeError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode {
            message: msg.into(),
        }
    }

    pub fn audio(msg: impl Into<String>) -> Self {
        Self::Audio {
            message: msg.into(),
        }
    }

    pub fn encode(msg: impl Into<String>) -> Self {
        Self::Encode {
            message: msg.into(),
        }
    }

    pub fn mux(msg: impl Into<String>) -> Self {
        Self::Mux {
            message: msg.into(),
        }
    }

    pub fn render(msg: impl Into<String>) -> Self {
        Self::Render {
            message: msg.into(),
        }
    }

    pub fn playback(msg: impl Into<String>) -> Self {
        Self::Playback {
            message: msg.into(),
        }
    }

    pub fn service(msg: impl Into<String>) -> Self {
        Self::Service {
            message: msg.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported {
            message: msg.into(),
        }
    }

    /// Whether the pipeline may continue (video-only) after this error.
    ///
    /// Decode and audio failures degrade the export to a silent track;
    /// everything else aborts the render session.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Decode { .. } | Self::Audio { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(ViralizeError::audio("no track").is_recoverable());
        assert!(ViralizeError::decode("bad header").is_recoverable());
        assert!(!ViralizeError::encode("flush failed").is_recoverable());
        assert!(!ViralizeError::mux("finalize").is_recoverable());
        assert!(!ViralizeError::Cancelled.is_recoverable());
    }

    #[test]
    fn test_display_includes_message() {
        let err = ViralizeError::validation("video must be under 100 MB");
        assert_eq!(err.to_string(), "Invalid input: video must be under 100 MB");
    }
}

//! Error types shared by every copilot-speaker component.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SpeakerError {
    /// A voice parameter fell outside its valid range.
    #[error("invalid {field}: {value} (must be between {min} and {max})")]
    InvalidParameter {
        field: &'static str,
        min: f32,
        max: f32,
        value: f32,
    },

    #[error("suggestion source connection failed: {0}")]
    Connection(String),

    #[error("suggestion source is not connected")]
    NotInitialized,

    #[error("speech synthesis failed: {0}")]
    Synthesis(String),

    #[error("text is not speakable after normalization")]
    UnspeakableText,

    #[error("initialization failed: {0}")]
    Initialization(#[source] Box<SpeakerError>),
}

pub type Result<T> = std::result::Result<T, SpeakerError>;

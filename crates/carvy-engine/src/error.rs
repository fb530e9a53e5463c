//! Failure taxonomy for the vehicle image pipeline.

use carvy_contracts::Stage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GenerateError {
    /// The backend answered but no part carried an image.
    #[error("generation backend returned no image: {diagnostic}")]
    NoImage { diagnostic: String },

    /// Transport, auth, quota or protocol failure talking to the backend.
    #[error("generation backend call failed: {0}")]
    Backend(String),
}

#[derive(Error, Debug)]
pub enum RefineError {
    #[error("input is not a decodable image: {0}")]
    Decode(String),

    #[error("background removal failed: {0}")]
    Backend(String),

    #[error("png encoding failed: {0}")]
    Encode(String),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage rejected upload of '{key}' ({status}): {message}")]
    Rejected {
        key: String,
        status: u16,
        message: String,
    },

    #[error("storage request for '{key}' failed: {message}")]
    Transport { key: String, message: String },

    #[error("storage io error for '{key}': {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("unreadable input: {0}")]
    Input(String),

    #[error("generation failed: {0}")]
    Generation(#[from] GenerateError),

    #[error("processing failed: {0}")]
    Refinement(#[from] RefineError),

    #[error("storage failed: {0}")]
    Storage(#[from] StoreError),
}

impl PipelineError {
    pub fn stage(&self) -> Stage {
        match self {
            Self::Input(_) => Stage::Reading,
            Self::Generation(_) => Stage::Generating,
            Self::Refinement(_) => Stage::Refining,
            Self::Storage(_) => Stage::Publishing,
        }
    }

    /// Stable machine-readable code for callers choosing a retry policy.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Input(_) => "invalid_input",
            Self::Generation(GenerateError::NoImage { .. }) => "generation_failed",
            Self::Generation(GenerateError::Backend(_)) => "generation_unavailable",
            Self::Refinement(RefineError::Decode(_)) => "undecodable_image",
            Self::Refinement(_) => "processing_failed",
            Self::Storage(_) => "storage_failed",
        }
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure surface of the engine.
///
/// Load-time errors (`ModelFileNotFound`, `UnresolvedTensorName`,
/// `MalformedModel`) surface immediately when a model is opened and are never
/// recovered automatically. Call-scoped errors (`Cancelled`, `Inference`)
/// abort the current generation only; the loaded sessions remain usable.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{role} model not found under {}: tried {tried:?}", .dir.display())]
    ModelFileNotFound {
        role: &'static str,
        dir: PathBuf,
        tried: Vec<String>,
    },

    #[error(
        "{role}: none of the candidate inputs {candidates:?} match the model's declared inputs {declared:?}"
    )]
    UnresolvedTensorName {
        role: &'static str,
        candidates: Vec<String>,
        declared: Vec<String>,
    },

    #[error("generation cancelled")]
    Cancelled,

    #[error("invalid generation options: {0}")]
    InvalidOptions(String),

    #[error("malformed model: {0}")]
    MalformedModel(String),

    #[error("tokenization failed: {0}")]
    Tokenizer(String),

    #[error("inference failed: {0}")]
    Inference(#[from] candle_core::Error),

    #[error("image encoding failed: {0}")]
    ImageEncode(#[from] image::ImageError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("background task failed: {0}")]
    Task(String),
}

impl Error {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

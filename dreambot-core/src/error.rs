use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the bot core.
///
/// Everything except `Config`, `Io` and `Image` is meant to be shown to the
/// requester as-is.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("the model ran out of memory: {0}")]
    OutOfMemory(String),

    #[error("image is {size} bytes, over the {ceiling} byte upload limit")]
    TooLarge {
        size: usize,
        ceiling: usize,
        saved_to: Option<PathBuf>,
    },

    #[error("gave up after waiting {0:?} for the generator to become free")]
    QueueTimeout(Duration),

    #[error("generation did not finish within {0:?}")]
    Timeout(Duration),

    #[error("configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Sorts a backend failure into out-of-memory vs. everything else.
    pub fn from_model(err: anyhow::Error) -> Self {
        let msg = format!("{err:#}");
        if msg.to_lowercase().contains("out of memory") {
            Self::OutOfMemory(msg)
        } else {
            Self::ModelUnavailable(msg)
        }
    }

    /// True for errors caused by the request rather than the bot.
    pub fn is_user_error(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::TooLarge { .. })
    }
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::Config(Box::new(err))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_error_classification() {
        let oom = Error::from_model(anyhow::anyhow!("CUDA_ERROR_OUT_OF_MEMORY: out of memory"));
        assert!(matches!(oom, Error::OutOfMemory(_)));

        let other = Error::from_model(anyhow::anyhow!("weights missing").context("loading flux"));
        match other {
            Error::ModelUnavailable(msg) => assert!(msg.contains("weights missing")),
            e => panic!("unexpected {e:?}"),
        }
    }
}

/// Errors produced while loading a model, generating or serving images.
#[derive(Debug, thiserror::Error)]
pub enum ImagineError {
    /// The prompt was rejected by the prompt policy.
    #[error("prompt is empty")]
    EmptyPrompt,

    /// A generation is still running for this session.
    #[error("a generation is already in progress")]
    Busy,

    /// The engine worker is gone and cannot take requests.
    #[error("engine is not running")]
    EngineStopped,

    #[error("failed to load model: {0}")]
    ModelLoad(String),

    #[error("generation failed: {0}")]
    Generation(String),

    #[error(transparent)]
    Image(#[from] kornia_image::ImageError),

    #[error("image container error: {0}")]
    Codec(#[from] image::ImageError),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[cfg(feature = "diffusion")]
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, ImagineError>;

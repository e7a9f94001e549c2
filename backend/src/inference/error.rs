use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ModelLoadError {
    #[error("checkpoint not found: {0}")]
    NotFound(PathBuf),
    #[error("failed to read checkpoint {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: tch::TchError,
    },
    #[error("failed to unpickle checkpoint {path}: {source}")]
    Unpickle {
        path: PathBuf,
        #[source]
        source: candle_core::Error,
    },
    #[error("unrecognized checkpoint layout: {0}")]
    UnrecognizedLayout(String),
    #[error("checkpoint does not match the model (missing: {missing:?}, unexpected: {unexpected:?})")]
    ParameterMismatch {
        missing: Vec<String>,
        unexpected: Vec<String>,
    },
    #[error("shape mismatch for {name}: model expects {expected:?}, checkpoint has {found:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<i64>,
        found: Vec<i64>,
    },
    #[error("failed to assign {name}: {source}")]
    Assign {
        name: String,
        #[source]
        source: tch::TchError,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ImageDecodeError {
    #[error("Error preprocessing image: image data is empty")]
    Empty,
    #[error("Error preprocessing image: {0}")]
    Decode(#[from] image::ImageError),
}

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("Model not loaded. Please check the model path.")]
    ModelUnavailable,
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Decode(#[from] ImageDecodeError),
    #[error("model forward pass failed: {0}")]
    Model(#[from] tch::TchError),
    #[error("{0}")]
    Processing(String),
}

impl InferenceError {
    pub fn validation(message: impl Into<String>) -> Self {
        InferenceError::Validation(message.into())
    }

    pub fn is_client_error(&self) -> bool {
        matches!(self, InferenceError::Validation(_))
    }

    /// Message returned to HTTP clients in the `error` field.
    pub fn client_message(&self) -> String {
        match self {
            InferenceError::ModelUnavailable | InferenceError::Validation(_) => self.to_string(),
            _ => format!("Error processing image: {}", self),
        }
    }
}

use thiserror::Error;
use crumple_core::TransformError;
use crumple_core::request::RequestError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OrchestratorError {
    #[error("a transform is already in progress")]
    AlreadyInProgress,
    #[error("invalid transform request: {0}")]
    InvalidRequest(#[from] RequestError),
    /// Terminal failure; also recorded in history
    #[error("transform failed: {0}")]
    Transform(#[from] TransformError),
}

impl OrchestratorError {
    pub fn transform_error(&self) -> Option<&TransformError> {
        match self {
            Self::Transform(err) => Some(err),
            _ => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {var}: {value:?}")]
    Invalid { var: String, value: String },
    #[error("failed to read .env file: {0}")]
    DotEnv(#[from] dotenvy::Error),
}

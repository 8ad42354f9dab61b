use ccm_error::{CcmError, ErrorCodes};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("manifest list is empty")]
    NoManifests,
    #[error("agent already started")]
    AlreadyStarted,
    #[error("unknown source scheme in identifier {0:?}")]
    UnknownScheme(String),
    #[error(transparent)]
    Archive(#[from] ccm_archive::ExtractError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl CcmError for AgentError {
    fn code(&self) -> ErrorCodes {
        match self {
            AgentError::Config(_) => ErrorCodes::InvalidArgument,
            AgentError::NoManifests => ErrorCodes::InvalidArgument,
            AgentError::AlreadyStarted => ErrorCodes::FailedPrecondition,
            AgentError::UnknownScheme(_) => ErrorCodes::InvalidArgument,
            AgentError::Archive(_) => ErrorCodes::InvalidArgument,
            AgentError::Io(_) => ErrorCodes::Unknown,
            AgentError::Http(_) => ErrorCodes::Unavailable,
        }
    }
}

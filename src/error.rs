use crate::extract::ExtractError;
use crate::fetch::FetchError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Anything that can fail a poll cycle. Reference time failures are not here: they only
/// degrade the drift classification.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Extract(#[from] ExtractError),
}

/// Error category as recorded in the snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    SelectorNotFound,
    MalformedJson,
    MissingField,
    OutOfRange,
    FetchTimeout,
    FetchNetworkError,
}

impl CycleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CycleError::Fetch(FetchError::Timeout(_)) => ErrorKind::FetchTimeout,
            CycleError::Fetch(FetchError::Network(_)) => ErrorKind::FetchNetworkError,
            CycleError::Extract(e) => match e {
                ExtractError::SelectorNotFound(_) => ErrorKind::SelectorNotFound,
                ExtractError::MalformedJson(_) => ErrorKind::MalformedJson,
                ExtractError::MissingField(_) => ErrorKind::MissingField,
                ExtractError::OutOfRange { .. } => ErrorKind::OutOfRange,
            },
        }
    }
}

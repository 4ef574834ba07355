use thiserror::Error;

use crate::health::HealthStoreError;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("no client registered for provider {0}")]
    UnknownProvider(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("api error ({status}): {body}")]
    Api {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("failed to parse json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("request cancelled")]
    Cancelled,
    #[error("health store error: {0}")]
    Store(#[from] HealthStoreError),
    #[error("all candidate models failed: {last}")]
    Exhausted { last: Box<RelayError> },
}

pub type Result<T> = std::result::Result<T, RelayError>;

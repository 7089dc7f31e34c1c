use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unexpected HTTP status {0}")]
    UnexpectedStatus(u16),

    #[error("Timeout error")]
    Timeout,

    #[error("No route to node at {0}")]
    NodeNotFound(String),
}

impl From<hyper::Error> for NetworkError {
    fn from(err: hyper::Error) -> Self {
        NetworkError::ConnectionError(err.to_string())
    }
}

impl From<hyper::http::Error> for NetworkError {
    fn from(err: hyper::http::Error) -> Self {
        NetworkError::InvalidRequest(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for NetworkError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        NetworkError::Timeout
    }
}

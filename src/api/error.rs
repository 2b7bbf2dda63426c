use thiserror::Error;

/// Errors a handler or middleware can raise that carry an HTTP-style status.
/// Anything else escaping a handler is flattened to a generic 500 at the
/// router boundary, so callers never see internals.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("rate limit exceeded")]
    RateLimited,
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> u16 {
        match self {
            ApiError::NotFound(_) => 404,
            ApiError::BadRequest(_) => 400,
            ApiError::Unauthorized(_) => 401,
            ApiError::RateLimited => 429,
            ApiError::Internal(_) => 500,
        }
    }
}

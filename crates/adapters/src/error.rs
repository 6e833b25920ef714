use reqwest::StatusCode;
use storyloom_core::model::LanguageModelError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("failed to parse response: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid adapter configuration: {0}")]
    InvalidConfig(String),
    #[error("unexpected http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },
    #[error("operation failed after {attempts} attempts: {source}")]
    RetryExhausted {
        attempts: usize,
        #[source]
        source: Box<AdapterError>,
    },
    #[error("API returned an empty response")]
    EmptyResponse,
    #[error("request cancelled")]
    Cancelled,
}

impl AdapterError {
    pub fn retry_exhausted(attempts: usize, source: AdapterError) -> Self {
        AdapterError::RetryExhausted {
            attempts,
            source: Box::new(source),
        }
    }

    /// Gateway errors, rate limiting and transport failures are worth another
    /// attempt; everything else is final.
    pub fn is_retryable(&self) -> bool {
        match self {
            AdapterError::Http(err) => !err.is_builder() && !err.is_decode(),
            AdapterError::HttpStatus { status, .. } => is_retryable_status(*status),
            _ => false,
        }
    }

    /// HTTP status of the underlying failure, looking through retries.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            AdapterError::HttpStatus { status, .. } => Some(*status),
            AdapterError::Http(err) => err.status(),
            AdapterError::RetryExhausted { source, .. } => source.status(),
            _ => None,
        }
    }
}

pub(crate) fn is_retryable_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 429 | 502 | 503 | 504)
}

impl From<AdapterError> for LanguageModelError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::RetryExhausted { source, .. } => LanguageModelError::from(*source),
            AdapterError::HttpStatus { status, body } => LanguageModelError::RequestFailed {
                status: status.as_u16(),
                body,
            },
            AdapterError::Http(err) => match err.status() {
                Some(status) => LanguageModelError::RequestFailed {
                    status: status.as_u16(),
                    body: err.to_string(),
                },
                None => LanguageModelError::network(err),
            },
            AdapterError::Json(err) => LanguageModelError::MalformedResponse(err.to_string()),
            AdapterError::EmptyResponse => {
                LanguageModelError::MalformedResponse("empty response".to_string())
            }
            AdapterError::InvalidConfig(message) => LanguageModelError::InvalidConfig(message),
            AdapterError::Cancelled => LanguageModelError::Cancelled,
        }
    }
}

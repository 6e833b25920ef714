use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::EndpointConfig;

/// Receives `(increment, full_text_so_far)` while a streamed completion is
/// read. The final call always has an empty increment.
pub type ChunkCallback<'a> = &'a (dyn Fn(&str, &str) + Send + Sync);

#[derive(Debug, Error)]
pub enum LanguageModelError {
    #[error("network error: {0}")]
    Network(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("request failed with status {status}: {body}")]
    RequestFailed { status: u16, body: String },
    #[error("invalid endpoint configuration: {0}")]
    InvalidConfig(String),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("request cancelled")]
    Cancelled,
}

impl LanguageModelError {
    pub fn network<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Network(Box::new(error))
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::RequestFailed { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// A chat-completion capable backend.
///
/// With `on_chunk` present the implementation streams and reports partial
/// output through it; otherwise it performs a single non-streaming request.
/// Either way the returned text is the raw, uncleaned model output.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(
        &self,
        endpoint: &EndpointConfig,
        prompt: &str,
        on_chunk: Option<ChunkCallback<'_>>,
        cancel: &CancellationToken,
    ) -> Result<String, LanguageModelError>;
}

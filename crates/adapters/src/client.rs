use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{self, HeaderValue};
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use storyloom_core::config::EndpointConfig;
use storyloom_core::model::{ChunkCallback, LanguageModel, LanguageModelError};
use tokio_util::sync::CancellationToken;

use crate::base_url::endpoint_url;
use crate::error::AdapterError;
use crate::retry::{call_with_retry, RetryConfig};
use crate::sse::consume_event_stream;
use crate::throttle::DEFAULT_THROTTLE_INTERVAL;

/// OpenAI-compatible chat-completions client. One instance can serve any
/// number of endpoints; connection settings arrive with each call.
#[derive(Clone, Debug)]
pub struct CompletionClient {
    client: Client,
    retry: RetryConfig,
    throttle_interval: Duration,
}

impl CompletionClient {
    pub fn new() -> Result<Self, AdapterError> {
        Ok(Self::with_client(Client::builder().build()?))
    }

    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            retry: RetryConfig::default(),
            throttle_interval: DEFAULT_THROTTLE_INTERVAL,
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_throttle_interval(mut self, interval: Duration) -> Self {
        self.throttle_interval = interval;
        self
    }

    /// Ids reported by `GET {base}/models`.
    pub async fn list_models(&self, endpoint: &EndpointConfig) -> Result<Vec<String>, AdapterError> {
        ensure_base_url(endpoint)?;
        let request = authorize(
            self.client
                .get(endpoint_url(&endpoint.base_url, "models"))
                .timeout(endpoint.timeout()),
            &endpoint.api_key,
        );
        let response = check_status(request.send().await?).await?;
        let models: ModelList = response.json().await?;
        Ok(models.data.into_iter().map(|model| model.id).collect())
    }

    /// Single request; any non-success status is final.
    pub async fn complete_once(
        &self,
        endpoint: &EndpointConfig,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<String, AdapterError> {
        let request = self.chat_request(endpoint, prompt, false)?;
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(AdapterError::Cancelled),
            response = request.send() => response?,
        };
        let response = check_status(response).await?;
        let parsed: ChatCompletionResponse = tokio::select! {
            _ = cancel.cancelled() => return Err(AdapterError::Cancelled),
            parsed = response.json() => parsed?,
        };
        extract_choice_content(parsed).ok_or(AdapterError::EmptyResponse)
    }

    /// Streams the completion through `on_chunk`, retrying transient
    /// failures with exponential backoff.
    pub async fn complete_streaming(
        &self,
        endpoint: &EndpointConfig,
        prompt: &str,
        on_chunk: Option<ChunkCallback<'_>>,
        cancel: &CancellationToken,
    ) -> Result<String, AdapterError> {
        call_with_retry(
            || self.stream_attempt(endpoint, prompt, on_chunk, cancel),
            &self.retry,
            cancel,
        )
        .await
    }

    async fn stream_attempt(
        &self,
        endpoint: &EndpointConfig,
        prompt: &str,
        on_chunk: Option<ChunkCallback<'_>>,
        cancel: &CancellationToken,
    ) -> Result<String, AdapterError> {
        let request = self.chat_request(endpoint, prompt, true)?;
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(AdapterError::Cancelled),
            response = request.send() => response?,
        };
        let response = check_status(response).await?;
        consume_event_stream(
            response.bytes_stream(),
            on_chunk,
            self.throttle_interval,
            cancel,
        )
        .await
    }

    fn chat_request(
        &self,
        endpoint: &EndpointConfig,
        prompt: &str,
        stream: bool,
    ) -> Result<RequestBuilder, AdapterError> {
        ensure_base_url(endpoint)?;
        if endpoint.model_name.trim().is_empty() {
            return Err(AdapterError::InvalidConfig(
                "model_name must not be empty".to_string(),
            ));
        }

        let body = ChatCompletionRequest {
            model: endpoint.model_name.trim(),
            messages: vec![ChatMessageRequest {
                role: "user",
                content: prompt,
            }],
            temperature: endpoint.temperature,
            max_tokens: (endpoint.max_tokens > 0).then_some(endpoint.max_tokens),
            stream,
        };

        let request = self
            .client
            .post(endpoint_url(&endpoint.base_url, "chat/completions"))
            .header(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            )
            .timeout(endpoint.timeout())
            .json(&body);
        Ok(authorize(request, &endpoint.api_key))
    }
}

#[async_trait]
impl LanguageModel for CompletionClient {
    async fn complete(
        &self,
        endpoint: &EndpointConfig,
        prompt: &str,
        on_chunk: Option<ChunkCallback<'_>>,
        cancel: &CancellationToken,
    ) -> Result<String, LanguageModelError> {
        let result = match on_chunk {
            Some(_) => self.complete_streaming(endpoint, prompt, on_chunk, cancel).await,
            None => self.complete_once(endpoint, prompt, cancel).await,
        };
        result.map_err(LanguageModelError::from)
    }
}

fn ensure_base_url(endpoint: &EndpointConfig) -> Result<(), AdapterError> {
    if endpoint.base_url.trim().is_empty() {
        return Err(AdapterError::InvalidConfig(
            "base_url must not be empty".to_string(),
        ));
    }
    Ok(())
}

fn authorize(request: RequestBuilder, api_key: &str) -> RequestBuilder {
    let key = api_key.trim();
    if key.is_empty() {
        request
    } else {
        request.bearer_auth(key)
    }
}

async fn check_status(response: Response) -> Result<Response, AdapterError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(AdapterError::HttpStatus { status, body })
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessageRequest<'a>>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
}

#[derive(Serialize)]
struct ChatMessageRequest<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    #[serde(default)]
    message: Option<ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

/// Content of the first choice, verbatim.
fn extract_choice_content(response: ChatCompletionResponse) -> Option<String> {
    response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message)
        .and_then(|message| message.content)
}

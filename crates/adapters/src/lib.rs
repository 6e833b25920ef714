mod base_url;
mod client;
mod error;
mod retry;
mod sse;
mod store;
mod throttle;

pub use base_url::normalize_base_url;
pub use client::CompletionClient;
pub use error::AdapterError;
pub use retry::{call_with_retry, RetryConfig};
pub use store::JsonProjectStore;
pub use throttle::DEFAULT_THROTTLE_INTERVAL;

pub use storyloom_core::config::{Config, ConfigStore, EndpointConfig};
pub use storyloom_core::model::{LanguageModel, LanguageModelError};

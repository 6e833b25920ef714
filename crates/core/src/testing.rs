//! Shared fixtures for unit tests.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::ops::RangeInclusive;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::{EndpointConfig, GenerationSettings};
use crate::model::{ChunkCallback, LanguageModel, LanguageModelError};
use crate::project::{NewProject, Project};

/// Answers requests from a fixed queue and records what it was asked.
/// Streamed calls deliver the whole response as one increment followed by
/// the closing empty increment.
#[derive(Default)]
pub(crate) struct ScriptedModel {
    responses: Mutex<VecDeque<Result<String, LanguageModelError>>>,
    prompts: Mutex<Vec<String>>,
    models: Mutex<Vec<String>>,
}

impl ScriptedModel {
    pub(crate) fn new<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            responses: Mutex::new(responses.into_iter().map(|r| Ok(r.into())).collect()),
            ..Self::default()
        }
    }

    pub(crate) fn then_fail(self, status: u16) -> Self {
        self.responses
            .lock()
            .unwrap()
            .push_back(Err(LanguageModelError::RequestFailed {
                status,
                body: "scripted failure".into(),
            }));
        self
    }

    pub(crate) fn then_respond(self, response: impl Into<String>) -> Self {
        self.responses
            .lock()
            .unwrap()
            .push_back(Ok(response.into()));
        self
    }

    pub(crate) fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub(crate) fn models(&self) -> Vec<String> {
        self.models.lock().unwrap().clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(
        &self,
        endpoint: &EndpointConfig,
        prompt: &str,
        on_chunk: Option<ChunkCallback<'_>>,
        _cancel: &CancellationToken,
    ) -> Result<String, LanguageModelError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.models
            .lock()
            .unwrap()
            .push(endpoint.model_name.clone());

        let next = self.responses.lock().unwrap().pop_front();
        let response = next.unwrap_or_else(|| {
            Err(LanguageModelError::MalformedResponse(
                "no scripted response left".into(),
            ))
        })?;
        if let Some(callback) = on_chunk {
            callback(&response, &response);
            callback("", &response);
        }
        Ok(response)
    }
}

/// Outline text in the current label set for chapters `range`.
pub(crate) fn outline(range: RangeInclusive<u32>) -> String {
    range
        .map(|n| {
            format!(
                "第{n}章 - 标题{n}\n本章定位：定位{n}\n核心作用：作用{n}\n悬念密度：悬念{n}\n伏笔操作：伏笔{n}\n认知颠覆：★★☆☆☆\n本章简述：简述{n}\n"
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub(crate) fn sample_project(number_of_chapters: u32) -> Project {
    Project::from_new(NewProject {
        title: "星海回声".into(),
        topic: "失落文明的信号".into(),
        genre: vec!["科幻".into(), "悬疑".into()],
        number_of_chapters,
        word_number: 1000,
        user_guidance: String::new(),
    })
}

pub(crate) fn settings_with_max_tokens(max_tokens: u32) -> GenerationSettings {
    GenerationSettings::new(EndpointConfig {
        api_key: "test-key".into(),
        base_url: "http://localhost:9/v1".into(),
        model_name: "test-model".into(),
        max_tokens,
        ..EndpointConfig::default()
    })
}

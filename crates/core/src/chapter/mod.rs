pub mod finalization;
pub mod quality;
mod prompt;

use std::fmt;

use crate::blueprint::ChapterBlueprintEntry;
use crate::model::LanguageModelError;
use crate::orchestrator::{Stage, StageContext};
use crate::project::Project;
use crate::prompts::{PromptError, PromptKey};

pub use prompt::novel_setting;
use prompt::{render_first_chapter_prompt, render_next_chapter_prompt};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChapterStep {
    Draft,
    Enrichment,
}

impl ChapterStep {
    fn label(&self) -> &'static str {
        match self {
            Self::Draft => "章节草稿生成",
            Self::Enrichment => "章节扩写",
        }
    }
}

impl fmt::Display for ChapterStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChapterError {
    #[error("未在章节蓝图中找到第{number}章信息")]
    ChapterNotFound { number: u32 },
    #[error("渲染{step}提示词失败: {source}")]
    Prompt {
        step: ChapterStep,
        #[source]
        source: PromptError,
    },
    #[error("调用模型执行{step}失败: {source}")]
    Model {
        step: ChapterStep,
        #[source]
        source: LanguageModelError,
    },
    #[error("第{number}章草稿为空")]
    EmptyResponse { number: u32 },
}

impl ChapterError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Model { source, .. } if source.is_cancelled())
    }
}

/// A generated chapter that has not been committed to the project yet.
#[derive(Clone, Debug)]
pub struct ChapterDraft {
    pub chapter_number: u32,
    pub content: String,
    pub prompt: String,
}

pub struct ChapterService<'a> {
    ctx: StageContext<'a>,
}

impl<'a> ChapterService<'a> {
    pub fn new(ctx: StageContext<'a>) -> Self {
        Self { ctx }
    }

    /// Drafts chapter `number` from its outline entry. The project is only
    /// read; committing the text is left to the caller.
    pub async fn generate_draft(
        &self,
        project: &Project,
        number: u32,
    ) -> Result<ChapterDraft, ChapterError> {
        let blueprint = project.blueprint();
        let chapter = blueprint
            .entry(number)
            .ok_or(ChapterError::ChapterNotFound { number })?;
        let next = blueprint.entry(number.saturating_add(1));

        self.ctx
            .report(format!("正在生成第 {number} 章草稿..."), 0, 3);
        let prompt = self.render_draft_prompt(project, chapter, next)?;

        let content = self
            .ctx
            .invoke_streamed(Stage::Draft, &prompt, None)
            .await
            .map_err(|source| ChapterError::Model {
                step: ChapterStep::Draft,
                source,
            })?;
        if content.is_empty() {
            log::warn!("第{number}章草稿生成失败，模型返回内容为空");
            return Err(ChapterError::EmptyResponse { number });
        }

        log::info!("第{number}章草稿生成完成，共{}字", content.chars().count());
        self.ctx
            .report(format!("第 {number} 章草稿生成完成"), 1, 3);
        Ok(ChapterDraft {
            chapter_number: number,
            content,
            prompt,
        })
    }

    /// Asks the model to expand a thin chapter towards `word_number` words.
    /// An empty answer keeps the original text.
    pub async fn enrich_chapter(
        &self,
        chapter_text: &str,
        word_number: u32,
    ) -> Result<String, ChapterError> {
        self.ctx.report("正在扩写章节...", 0, 1);
        let prompt = self
            .ctx
            .prompts()
            .format_with(
                PromptKey::EnrichChapter,
                [
                    ("chapter_text", chapter_text.to_string()),
                    ("word_number", word_number.to_string()),
                ],
            )
            .map_err(|source| ChapterError::Prompt {
                step: ChapterStep::Enrichment,
                source,
            })?;

        let enriched = self
            .ctx
            .invoke_streamed(Stage::Enrich, &prompt, None)
            .await
            .map_err(|source| ChapterError::Model {
                step: ChapterStep::Enrichment,
                source,
            })?;

        self.ctx.report("扩写完成", 1, 1);
        if enriched.is_empty() {
            log::warn!("扩写结果为空，保留原文");
            return Ok(chapter_text.to_string());
        }
        Ok(enriched)
    }

    fn render_draft_prompt(
        &self,
        project: &Project,
        chapter: &ChapterBlueprintEntry,
        next: Option<&ChapterBlueprintEntry>,
    ) -> Result<String, ChapterError> {
        let prompts = self.ctx.prompts();
        let rendered = if chapter.number <= 1 {
            render_first_chapter_prompt(prompts, project, chapter, next)
        } else {
            render_next_chapter_prompt(prompts, project, chapter, next)
        };
        rendered.map_err(|source| ChapterError::Prompt {
            step: ChapterStep::Draft,
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StageModels;
    use crate::progress::VecProgressSink;
    use crate::prompts::PromptRegistry;
    use crate::testing::{outline, sample_project, settings_with_max_tokens, ScriptedModel};

    #[tokio::test]
    async fn missing_chapter_is_reported() {
        let model = ScriptedModel::new(["不会被使用"]);
        let prompts = PromptRegistry::new().unwrap();
        let settings = settings_with_max_tokens(8192);
        let ctx = StageContext::new(&model, &settings, &prompts);

        let mut project = sample_project(3);
        project.chapter_blueprint = outline(1..=2);
        let error = ChapterService::new(ctx)
            .generate_draft(&project, 3)
            .await
            .unwrap_err();

        assert!(matches!(error, ChapterError::ChapterNotFound { number: 3 }));
        assert!(model.prompts().is_empty());
    }

    #[tokio::test]
    async fn first_chapter_draft_is_sanitized_and_not_committed() {
        let model = ScriptedModel::new(["```\n注释\n```\n  正文第一段  "]);
        let prompts = PromptRegistry::new().unwrap();
        let settings = settings_with_max_tokens(8192);
        let progress = VecProgressSink::new();
        let ctx = StageContext::new(&model, &settings, &prompts).with_progress(&progress);

        let mut project = sample_project(3);
        project.chapter_blueprint = outline(1..=3);
        let draft = ChapterService::new(ctx)
            .generate_draft(&project, 1)
            .await
            .unwrap();

        assert_eq!(draft.content, "正文第一段");
        assert!(project.chapters.is_empty());
        assert_eq!(progress.milestones(), vec![(0, 3), (1, 3)]);
        assert!(model.prompts()[0].contains("即将创作：第1章《标题1》"));
    }

    #[tokio::test]
    async fn continuation_embeds_rolling_context() {
        let model = ScriptedModel::new(["第二章正文"]);
        let prompts = PromptRegistry::new().unwrap();
        let settings = settings_with_max_tokens(8192).with_stage_models(StageModels {
            chapter: Some("writer-model".into()),
            ..StageModels::default()
        });
        let ctx = StageContext::new(&model, &settings, &prompts);

        let mut project = sample_project(3);
        project.chapter_blueprint = outline(1..=3);
        project.global_summary = "主角抵达空间站".into();
        project.character_state = "主角：轻伤".into();
        project.commit_chapter(1, "第一章的结尾");

        ChapterService::new(ctx)
            .generate_draft(&project, 2)
            .await
            .unwrap();

        let prompt = &model.prompts()[0];
        assert!(prompt.contains("主角抵达空间站"));
        assert!(prompt.contains("第一章的结尾"));
        assert!(prompt.contains("主角：轻伤"));
        assert!(prompt.contains("第3章《标题3》"));
        assert_eq!(model.models(), vec!["writer-model".to_string()]);
    }

    #[tokio::test]
    async fn draft_failure_surfaces() {
        let model = ScriptedModel::default().then_fail(429);
        let prompts = PromptRegistry::new().unwrap();
        let settings = settings_with_max_tokens(8192);
        let ctx = StageContext::new(&model, &settings, &prompts);

        let mut project = sample_project(3);
        project.chapter_blueprint = outline(1..=3);
        let error = ChapterService::new(ctx)
            .generate_draft(&project, 1)
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            ChapterError::Model { step: ChapterStep::Draft, ref source } if source.status() == Some(429)
        ));
    }

    #[tokio::test]
    async fn enrichment_keeps_original_on_empty_output() {
        let model = ScriptedModel::new(["", "扩写后的正文"]);
        let prompts = PromptRegistry::new().unwrap();
        let settings = settings_with_max_tokens(8192);
        let progress = VecProgressSink::new();
        let ctx = StageContext::new(&model, &settings, &prompts).with_progress(&progress);
        let service = ChapterService::new(ctx);

        assert_eq!(service.enrich_chapter("原文", 1000).await.unwrap(), "原文");
        assert_eq!(
            service.enrich_chapter("原文", 1000).await.unwrap(),
            "扩写后的正文"
        );
        assert!(model.prompts()[0].contains("字数接近1000字"));
        assert_eq!(progress.milestones(), vec![(0, 1), (1, 1), (0, 1), (1, 1)]);
    }
}

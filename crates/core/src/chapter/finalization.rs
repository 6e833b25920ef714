use std::fmt;
use thiserror::Error;

use crate::model::LanguageModelError;
use crate::orchestrator::{Stage, StageContext};
use crate::pacing::Cancelled;
use crate::progress::StreamField;
use crate::project::Project;
use crate::prompts::{PromptError, PromptKey};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FinalizeStep {
    Summary,
    CharacterState,
}

impl FinalizeStep {
    fn label(&self) -> &'static str {
        match self {
            Self::Summary => "前文摘要更新",
            Self::CharacterState => "角色状态更新",
        }
    }
}

impl fmt::Display for FinalizeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Error)]
pub enum FinalizeError {
    #[error("第{chapter_number}章内容为空，无法完成定稿")]
    EmptyChapter { chapter_number: u32 },
    #[error("渲染{step}提示词失败: {source}")]
    Prompt {
        step: FinalizeStep,
        #[source]
        source: PromptError,
    },
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

/// Which rolling documents actually changed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FinalizeOutcome {
    pub summary_updated: bool,
    pub character_state_updated: bool,
}

/// Folds a finished chapter into the rolling global summary and character
/// state. A failed or empty update leaves the previous document in place.
pub struct ChapterFinalizer<'a> {
    ctx: StageContext<'a>,
}

impl<'a> ChapterFinalizer<'a> {
    pub fn new(ctx: StageContext<'a>) -> Self {
        Self { ctx }
    }

    pub async fn finalize(
        &self,
        project: &mut Project,
        chapter_number: u32,
        chapter_text: &str,
    ) -> Result<FinalizeOutcome, FinalizeError> {
        let chapter_text = chapter_text.trim();
        if chapter_text.is_empty() {
            return Err(FinalizeError::EmptyChapter { chapter_number });
        }
        log::info!("开始定稿第{chapter_number}章，更新前文摘要与角色状态。");
        let mut outcome = FinalizeOutcome::default();

        self.ctx.report("正在更新前文摘要...", 1, 3);
        let prompt = self.render(
            FinalizeStep::Summary,
            PromptKey::GlobalSummary,
            [
                ("chapter_text", chapter_text.to_string()),
                ("global_summary", project.global_summary.clone()),
            ],
        )?;
        if let Some(summary) = self
            .update(FinalizeStep::Summary, &prompt, StreamField::GlobalSummary)
            .await?
        {
            project.global_summary = summary;
            outcome.summary_updated = true;
        }

        self.ctx.pause(self.ctx.pacing().finalize_delay).await?;

        self.ctx.report("正在更新角色状态...", 2, 3);
        let prompt = self.render(
            FinalizeStep::CharacterState,
            PromptKey::UpdateCharacterState,
            [
                ("chapter_text", chapter_text.to_string()),
                ("old_state", project.character_state.clone()),
            ],
        )?;
        if let Some(state) = self
            .update(
                FinalizeStep::CharacterState,
                &prompt,
                StreamField::CharacterState,
            )
            .await?
        {
            project.character_state = state;
            outcome.character_state_updated = true;
        }

        self.ctx.report("章节定稿完成", 3, 3);
        Ok(outcome)
    }

    fn render<const N: usize>(
        &self,
        step: FinalizeStep,
        key: PromptKey,
        arguments: [(&str, String); N],
    ) -> Result<String, FinalizeError> {
        self.ctx
            .prompts()
            .format_with(key, arguments)
            .map_err(|source| FinalizeError::Prompt { step, source })
    }

    /// `Ok(None)` keeps the current document.
    async fn update(
        &self,
        step: FinalizeStep,
        prompt: &str,
        field: StreamField,
    ) -> Result<Option<String>, FinalizeError> {
        match self
            .ctx
            .invoke_streamed(Stage::Finalize, prompt, Some(field))
            .await
        {
            Ok(text) if text.is_empty() => {
                log::warn!("{step}返回为空，保留原内容");
                Ok(None)
            }
            Ok(text) => Ok(Some(text)),
            Err(LanguageModelError::Cancelled) => Err(FinalizeError::Cancelled(Cancelled)),
            Err(err) => {
                log::warn!("{step}失败，保留原内容：{err}");
                Ok(None)
            }
        }
    }
}

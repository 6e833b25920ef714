use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::architecture::{ArchitectureError, ArchitectureOutcome, ArchitectureService};
use crate::blueprint::{BlueprintError, BlueprintOutcome, BlueprintService};
use crate::chapter::finalization::{ChapterFinalizer, FinalizeError, FinalizeOutcome};
use crate::chapter::quality::{QualityContext, QualityReport, QualityService};
use crate::chapter::{ChapterDraft, ChapterError, ChapterService};
use crate::config::GenerationSettings;
use crate::model::{ChunkCallback, LanguageModel, LanguageModelError};
use crate::pacing::{self, Cancelled, Pacing};
use crate::progress::{NullProgressSink, ProgressSink, ProgressUpdate, StreamEvent, StreamField, StreamSink};
use crate::project::Project;
use crate::prompts::PromptRegistry;
use crate::sanitize;

static NULL_PROGRESS: NullProgressSink = NullProgressSink;

/// Pipeline phases. Each one resolves its own endpoint through
/// [`GenerationSettings::endpoint_for`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    Architecture,
    Blueprint,
    Draft,
    Finalize,
    QualityCheck,
    Repair,
    Enrich,
}

impl Stage {
    pub fn label(&self) -> &'static str {
        match self {
            Stage::Architecture => "架构生成",
            Stage::Blueprint => "章节大纲",
            Stage::Draft => "章节草稿",
            Stage::Finalize => "章节定稿",
            Stage::QualityCheck => "章节质检",
            Stage::Repair => "章节修复",
            Stage::Enrich => "章节扩写",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Everything one pipeline invocation needs: the model, resolved settings,
/// prompt templates, the two sinks, pacing and the cancellation token.
#[derive(Clone)]
pub struct StageContext<'a> {
    model: &'a dyn LanguageModel,
    settings: &'a GenerationSettings,
    prompts: &'a PromptRegistry,
    progress: &'a dyn ProgressSink,
    stream: Option<&'a dyn StreamSink>,
    pacing: Pacing,
    cancel: CancellationToken,
}

impl<'a> StageContext<'a> {
    pub fn new(
        model: &'a dyn LanguageModel,
        settings: &'a GenerationSettings,
        prompts: &'a PromptRegistry,
    ) -> Self {
        Self {
            model,
            settings,
            prompts,
            progress: &NULL_PROGRESS,
            stream: None,
            pacing: Pacing::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_progress(mut self, progress: &'a dyn ProgressSink) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_stream(mut self, stream: &'a dyn StreamSink) -> Self {
        self.stream = Some(stream);
        self
    }

    pub fn with_pacing(mut self, pacing: Pacing) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn settings(&self) -> &GenerationSettings {
        self.settings
    }

    pub fn prompts(&self) -> &PromptRegistry {
        self.prompts
    }

    pub fn pacing(&self) -> Pacing {
        self.pacing
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn report(&self, message: impl Into<String>, completed: u32, total: u32) {
        self.progress
            .report(ProgressUpdate::new(message, completed, total));
    }

    pub(crate) async fn pause(&self, duration: Duration) -> Result<(), Cancelled> {
        pacing::pause(duration, &self.cancel).await
    }

    /// Streams when a stream sink is attached, tagging events with `field`.
    /// Returns sanitized text.
    pub(crate) async fn invoke_streamed(
        &self,
        stage: Stage,
        prompt: &str,
        field: Option<StreamField>,
    ) -> Result<String, LanguageModelError> {
        match self.stream {
            Some(sink) => {
                let forward = move |increment: &str, full_text: &str| {
                    sink.on_stream(StreamEvent {
                        field,
                        increment,
                        full_text,
                    });
                };
                let callback: ChunkCallback<'_> = &forward;
                let raw = self.call(stage, prompt, Some(callback)).await?;
                Ok(sanitize::clean(&raw))
            }
            None => Ok(sanitize::clean(&self.call(stage, prompt, None).await?)),
        }
    }

    /// Single non-streaming request. The response is returned raw so that
    /// fenced JSON survives for the caller to parse.
    pub(crate) async fn invoke_once(
        &self,
        stage: Stage,
        prompt: &str,
    ) -> Result<String, LanguageModelError> {
        self.call(stage, prompt, None).await
    }

    async fn call(
        &self,
        stage: Stage,
        prompt: &str,
        on_chunk: Option<ChunkCallback<'_>>,
    ) -> Result<String, LanguageModelError> {
        if self.cancel.is_cancelled() {
            return Err(LanguageModelError::Cancelled);
        }
        let endpoint = self.settings.endpoint_for(stage);
        log::debug!("[{stage}] model={} prompt:\n{prompt}", endpoint.model_name);
        let raw = self
            .model
            .complete(&endpoint, prompt, on_chunk, &self.cancel)
            .await?;
        log::debug!("[{stage}] response:\n{raw}");
        Ok(raw)
    }
}

/// One unit of work for [`StageOrchestrator::run`].
#[derive(Clone, Debug)]
pub enum StageRequest {
    Architecture,
    Blueprint,
    Draft {
        chapter_number: u32,
    },
    Finalize {
        chapter_number: u32,
        chapter_text: String,
    },
    QualityCheck {
        chapter_number: u32,
        chapter_text: String,
    },
    Repair {
        chapter_number: u32,
        chapter_text: String,
        report: QualityReport,
    },
    Enrich {
        chapter_text: String,
    },
}

impl StageRequest {
    pub fn stage(&self) -> Stage {
        match self {
            StageRequest::Architecture => Stage::Architecture,
            StageRequest::Blueprint => Stage::Blueprint,
            StageRequest::Draft { .. } => Stage::Draft,
            StageRequest::Finalize { .. } => Stage::Finalize,
            StageRequest::QualityCheck { .. } => Stage::QualityCheck,
            StageRequest::Repair { .. } => Stage::Repair,
            StageRequest::Enrich { .. } => Stage::Enrich,
        }
    }
}

#[derive(Clone, Debug)]
pub enum StageOutcome {
    Architecture(ArchitectureOutcome),
    Blueprint(BlueprintOutcome),
    Draft(ChapterDraft),
    Finalize(FinalizeOutcome),
    QualityCheck(QualityReport),
    Repair { text: String },
    Enrich { text: String },
}

/// Updated snapshot plus what the stage produced. Persisting `project` is
/// the caller's job.
#[derive(Clone, Debug)]
pub struct StageOutput {
    pub project: Project,
    pub outcome: StageOutcome,
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Architecture(#[from] ArchitectureError),
    #[error(transparent)]
    Blueprint(#[from] BlueprintError),
    #[error(transparent)]
    Chapter(#[from] ChapterError),
    #[error(transparent)]
    Finalize(#[from] FinalizeError),
}

impl StageError {
    pub fn is_cancelled(&self) -> bool {
        match self {
            StageError::Architecture(err) => err.is_cancelled(),
            StageError::Blueprint(err) => err.is_cancelled(),
            StageError::Chapter(err) => err.is_cancelled(),
            StageError::Finalize(err) => matches!(err, FinalizeError::Cancelled(_)),
        }
    }
}

/// A failed stage together with the snapshot as far as it got. Sub-stages
/// and outline chunks completed before the error are kept in `partial`.
#[derive(Debug, Error)]
#[error("{stage} failed: {error}")]
pub struct StageFailure {
    pub stage: Stage,
    pub partial: Box<Project>,
    #[source]
    pub error: StageError,
}

/// Entry point for running pipeline stages against a project snapshot. The
/// input project is never modified; every run works on a copy.
#[derive(Clone)]
pub struct StageOrchestrator<'a> {
    ctx: StageContext<'a>,
}

impl<'a> StageOrchestrator<'a> {
    pub fn new(
        model: &'a dyn LanguageModel,
        settings: &'a GenerationSettings,
        prompts: &'a PromptRegistry,
    ) -> Self {
        Self {
            ctx: StageContext::new(model, settings, prompts),
        }
    }

    pub fn from_context(ctx: StageContext<'a>) -> Self {
        Self { ctx }
    }

    pub fn with_progress(mut self, progress: &'a dyn ProgressSink) -> Self {
        self.ctx = self.ctx.with_progress(progress);
        self
    }

    pub fn with_stream(mut self, stream: &'a dyn StreamSink) -> Self {
        self.ctx = self.ctx.with_stream(stream);
        self
    }

    pub fn with_pacing(mut self, pacing: Pacing) -> Self {
        self.ctx = self.ctx.with_pacing(pacing);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.ctx = self.ctx.with_cancellation(cancel);
        self
    }

    pub fn context(&self) -> &StageContext<'a> {
        &self.ctx
    }

    pub fn architecture(&self) -> ArchitectureService<'a> {
        ArchitectureService::new(self.ctx.clone())
    }

    pub fn blueprint(&self) -> BlueprintService<'a> {
        BlueprintService::new(self.ctx.clone())
    }

    pub fn chapters(&self) -> ChapterService<'a> {
        ChapterService::new(self.ctx.clone())
    }

    pub fn finalizer(&self) -> ChapterFinalizer<'a> {
        ChapterFinalizer::new(self.ctx.clone())
    }

    pub fn quality(&self) -> QualityService<'a> {
        QualityService::new(self.ctx.clone())
    }

    pub async fn run(
        &self,
        project: &Project,
        request: StageRequest,
    ) -> Result<StageOutput, StageFailure> {
        let stage = request.stage();
        let mut working = project.clone();
        log::info!("[{stage}] 开始，项目 {}", working.id);

        let result = self.dispatch(&mut working, request).await;
        match result {
            Ok(outcome) => {
                log::info!("[{stage}] 完成");
                Ok(StageOutput {
                    project: working,
                    outcome,
                })
            }
            Err(error) => {
                log::warn!("[{stage}] 失败：{error}");
                Err(StageFailure {
                    stage,
                    partial: Box::new(working),
                    error,
                })
            }
        }
    }

    async fn dispatch(
        &self,
        project: &mut Project,
        request: StageRequest,
    ) -> Result<StageOutcome, StageError> {
        let outcome = match request {
            StageRequest::Architecture => {
                StageOutcome::Architecture(self.architecture().generate(project).await?)
            }
            StageRequest::Blueprint => {
                StageOutcome::Blueprint(self.blueprint().generate(project).await?)
            }
            StageRequest::Draft { chapter_number } => {
                StageOutcome::Draft(self.chapters().generate_draft(project, chapter_number).await?)
            }
            StageRequest::Finalize {
                chapter_number,
                chapter_text,
            } => StageOutcome::Finalize(
                self.finalizer()
                    .finalize(project, chapter_number, &chapter_text)
                    .await?,
            ),
            StageRequest::QualityCheck {
                chapter_number,
                chapter_text,
            } => {
                let context = QualityContext::from_project(project, chapter_number)?;
                StageOutcome::QualityCheck(self.quality().check_quality(&chapter_text, &context).await)
            }
            StageRequest::Repair {
                chapter_number,
                chapter_text,
                report,
            } => {
                let context = QualityContext::from_project(project, chapter_number)?;
                let text = self
                    .quality()
                    .fix_chapter(&chapter_text, &report, &context)
                    .await;
                StageOutcome::Repair { text }
            }
            StageRequest::Enrich { chapter_text } => {
                let text = self
                    .chapters()
                    .enrich_chapter(&chapter_text, project.word_number)
                    .await?;
                StageOutcome::Enrich { text }
            }
        };
        Ok(outcome)
    }
}

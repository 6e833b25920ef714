pub mod parser;

use std::fmt;
use thiserror::Error;

use crate::model::LanguageModelError;
use crate::orchestrator::{Stage, StageContext};
use crate::pacing::Cancelled;
use crate::project::Project;
use crate::prompts::{PromptError, PromptKey};

pub use parser::{BlueprintField, ChapterBlueprintEntry};

/// Outline chapters kept as context when asking for the next chunk.
pub const CONTEXT_CHAPTER_LIMIT: usize = 100;
/// Empirical output cost of one outline entry.
pub const TOKENS_PER_CHAPTER: u32 = 350;
pub const MIN_CHUNK_SIZE: u32 = 5;
pub const MAX_CHUNK_SIZE: u32 = 25;
const DEFAULT_MAX_TOKENS: u32 = 8192;

/// Parsed view over a project's outline text.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChapterBlueprint {
    entries: Vec<ChapterBlueprintEntry>,
}

impl ChapterBlueprint {
    pub fn from_text(text: &str) -> Self {
        Self {
            entries: parser::parse(text),
        }
    }

    pub fn entries(&self) -> &[ChapterBlueprintEntry] {
        &self.entries
    }

    /// First entry with this number, in source order.
    pub fn entry(&self, number: u32) -> Option<&ChapterBlueprintEntry> {
        self.entries.iter().find(|entry| entry.number == number)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Chapters requested per outline call: 70% of the token budget divided by
/// the per-chapter cost, clamped to `[5, 25]` and to the chapter count.
pub fn compute_chunk_size(max_tokens: u32, number_of_chapters: u32) -> u32 {
    let max_tokens = if max_tokens == 0 {
        DEFAULT_MAX_TOKENS
    } else {
        max_tokens
    };
    let budget = (f64::from(max_tokens) * 0.7 / f64::from(TOKENS_PER_CHAPTER)).floor() as u32;
    budget
        .clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE)
        .min(number_of_chapters)
}

/// Novel setting block the outline prompts are built from.
pub fn novel_architecture_text(project: &Project) -> String {
    format!(
        "#=== 0) 小说设定 ===\n主题：{}，类型：{}，篇幅：约{}章（每章{}字）\n\n#=== 1) 核心种子 ===\n{}\n\n#=== 2) 角色动力学 ===\n{}\n\n#=== 3) 世界观 ===\n{}\n\n#=== 4) 三幕式情节架构 ===\n{}\n",
        project.topic,
        project.genre_label(),
        project.number_of_chapters,
        project.word_number,
        project.core_seed,
        project.character_dynamics,
        project.world_building,
        project.plot_architecture,
    )
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BlueprintRange {
    Full { end: u32 },
    Chunk { start: u32, end: u32 },
}

impl BlueprintRange {
    fn prompt_key(&self) -> PromptKey {
        match self {
            Self::Full { .. } => PromptKey::ChapterBlueprint,
            Self::Chunk { .. } => PromptKey::ChunkedChapterBlueprint,
        }
    }
}

impl fmt::Display for BlueprintRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full { end } => write!(f, "章节目录(1-{end})"),
            Self::Chunk { start, end } => write!(f, "章节目录分块({start}-{end})"),
        }
    }
}

#[derive(Debug, Error)]
pub enum BlueprintError {
    #[error("project has no chapters to outline")]
    NoChapters,
    #[error("failed to render {range} prompt: {source}")]
    Prompt {
        range: BlueprintRange,
        #[source]
        source: PromptError,
    },
    #[error("language model invocation failed for {range}: {source}")]
    Model {
        range: BlueprintRange,
        #[source]
        source: LanguageModelError,
    },
    #[error("{range} response was empty")]
    EmptyResponse { range: BlueprintRange },
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

impl BlueprintError {
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled(_) => true,
            Self::Model { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlueprintOutcome {
    pub ranges: Vec<BlueprintRange>,
    pub chunk_size: u32,
}

pub struct BlueprintService<'a> {
    ctx: StageContext<'a>,
}

impl<'a> BlueprintService<'a> {
    pub fn new(ctx: StageContext<'a>) -> Self {
        Self { ctx }
    }

    /// Fills `project.chapter_blueprint` up to `number_of_chapters`, resuming
    /// after the highest chapter already outlined. Every chunk that succeeds
    /// is appended before the next request, so a failure leaves the outline
    /// ready for another attempt.
    pub async fn generate(&self, project: &mut Project) -> Result<BlueprintOutcome, BlueprintError> {
        let total = project.number_of_chapters;
        if total == 0 {
            return Err(BlueprintError::NoChapters);
        }

        let endpoint = self.ctx.settings().endpoint_for(Stage::Blueprint);
        let chunk_size = compute_chunk_size(endpoint.max_tokens, total);
        let architecture = novel_architecture_text(project);
        log::info!("章节总数 = {total}，计算出的 chunk_size = {chunk_size}");

        let mut outcome = BlueprintOutcome {
            ranges: Vec::new(),
            chunk_size,
        };

        if project.chapter_blueprint.trim().is_empty() && chunk_size >= total {
            let range = BlueprintRange::Full { end: total };
            self.ctx
                .report(format!("正在生成章节大纲 (1-{total})..."), 0, 1);
            let prompt = self.render(range, project, &architecture, "")?;
            let text = self.request(range, &prompt).await?;
            project.chapter_blueprint = text;
            outcome.ranges.push(range);
        } else {
            let existing = parser::max_chapter_number(&project.chapter_blueprint).unwrap_or(0);
            if existing > 0 {
                log::info!("现有大纲已生成至第{existing}章，继续分块生成");
            }

            let mut start = existing.saturating_add(1);
            while start <= total {
                let end = start.saturating_add(chunk_size - 1).min(total);
                let range = BlueprintRange::Chunk { start, end };
                self.ctx.report(
                    format!("正在生成章节大纲 ({start}-{end})..."),
                    start - 1,
                    total,
                );

                let recent =
                    parser::truncate_to_recent(&project.chapter_blueprint, CONTEXT_CHAPTER_LIMIT);
                let prompt = self.render(range, project, &architecture, &recent)?;
                let text = self.request(range, &prompt).await?;
                append_section(&mut project.chapter_blueprint, &text);
                outcome.ranges.push(range);

                start = end + 1;
                if start <= total {
                    self.ctx.pause(self.ctx.pacing().blueprint_chunk_delay).await?;
                }
            }
        }

        project.blueprint_generated = project.blueprint_complete();
        self.ctx.report("章节大纲生成完成!", total, total);
        Ok(outcome)
    }

    fn render(
        &self,
        range: BlueprintRange,
        project: &Project,
        architecture: &str,
        chapter_list: &str,
    ) -> Result<String, BlueprintError> {
        let (start, end) = match range {
            BlueprintRange::Full { end } => (1, end),
            BlueprintRange::Chunk { start, end } => (start, end),
        };
        self.ctx
            .prompts()
            .format_with(
                range.prompt_key(),
                [
                    ("novel_architecture", architecture.to_string()),
                    ("chapter_list", chapter_list.to_string()),
                    ("number_of_chapters", project.number_of_chapters.to_string()),
                    ("word_number", project.word_number.to_string()),
                    ("start_chapter", start.to_string()),
                    ("end_chapter", end.to_string()),
                    ("user_guidance", project.user_guidance.trim().to_string()),
                ],
            )
            .map_err(|source| BlueprintError::Prompt { range, source })
    }

    async fn request(&self, range: BlueprintRange, prompt: &str) -> Result<String, BlueprintError> {
        let text = self
            .ctx
            .invoke_streamed(Stage::Blueprint, prompt, None)
            .await
            .map_err(|source| BlueprintError::Model { range, source })?;
        if text.is_empty() {
            return Err(BlueprintError::EmptyResponse { range });
        }
        Ok(text)
    }
}

fn append_section(blueprint: &mut String, section: &str) {
    if blueprint.trim().is_empty() {
        *blueprint = section.to_string();
    } else {
        blueprint.push_str("\n\n");
        blueprint.push_str(section);
    }
}

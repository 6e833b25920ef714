pub mod architecture;
pub mod blueprint;
pub mod chapter;
pub mod config;
pub mod model;
pub mod orchestrator;
pub mod pacing;
pub mod progress;
pub mod project;
pub mod prompts;
pub mod sanitize;

#[cfg(test)]
pub(crate) mod testing;

pub use architecture::{
    ArchitectureError, ArchitectureField, ArchitectureOutcome, ArchitectureService,
};
pub use blueprint::{
    compute_chunk_size, BlueprintError, BlueprintField, BlueprintOutcome, BlueprintRange,
    BlueprintService, ChapterBlueprint, ChapterBlueprintEntry,
};
pub use chapter::finalization::{ChapterFinalizer, FinalizeError, FinalizeOutcome};
pub use chapter::quality::{
    count_words, QualityContext, QualityReport, QualityService, WORD_COUNT_TOLERANCE,
};
pub use chapter::{ChapterDraft, ChapterError, ChapterService};
pub use config::{
    Config, ConfigError, ConfigStore, EndpointConfig, GenerationSettings, PromptConfig,
    RecentUsage, StageModels, StoreConfig,
};
pub use model::{ChunkCallback, LanguageModel, LanguageModelError};
pub use orchestrator::{
    Stage, StageContext, StageError, StageFailure, StageOrchestrator, StageOutcome, StageOutput,
    StageRequest,
};
pub use pacing::{Cancelled, Pacing};
pub use progress::{
    LogProgressSink, NullProgressSink, ProgressSink, ProgressUpdate, StreamEvent, StreamField,
    StreamSink, VecProgressSink, VecStreamSink,
};
pub use project::{MemoryProjectStore, NewProject, Project, ProjectStore, StoreError};
pub use prompts::{PromptArguments, PromptError, PromptKey, PromptRegistry, PromptSource};

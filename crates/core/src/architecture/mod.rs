use std::fmt;
use thiserror::Error;

use crate::model::LanguageModelError;
use crate::orchestrator::{Stage, StageContext};
use crate::progress::StreamField;
use crate::project::Project;
use crate::prompts::{PromptArguments, PromptError, PromptKey};

/// The five setting documents, in generation order.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ArchitectureField {
    CoreSeed,
    CharacterDynamics,
    CharacterState,
    WorldBuilding,
    PlotArchitecture,
}

impl ArchitectureField {
    pub const ALL: [ArchitectureField; 5] = [
        ArchitectureField::CoreSeed,
        ArchitectureField::CharacterDynamics,
        ArchitectureField::CharacterState,
        ArchitectureField::WorldBuilding,
        ArchitectureField::PlotArchitecture,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Self::CoreSeed => "核心种子",
            Self::CharacterDynamics => "角色动力学",
            Self::CharacterState => "角色状态",
            Self::WorldBuilding => "世界观",
            Self::PlotArchitecture => "三幕式情节",
        }
    }

    pub fn dependencies(&self) -> &'static [ArchitectureField] {
        match self {
            Self::CoreSeed => &[],
            Self::CharacterDynamics => &[ArchitectureField::CoreSeed],
            Self::CharacterState => &[ArchitectureField::CharacterDynamics],
            Self::WorldBuilding => &[ArchitectureField::CoreSeed],
            Self::PlotArchitecture => &[
                ArchitectureField::CoreSeed,
                ArchitectureField::CharacterDynamics,
                ArchitectureField::WorldBuilding,
            ],
        }
    }

    pub fn prompt_key(&self) -> PromptKey {
        match self {
            Self::CoreSeed => PromptKey::CoreSeed,
            Self::CharacterDynamics => PromptKey::CharacterDynamics,
            Self::CharacterState => PromptKey::CreateCharacterState,
            Self::WorldBuilding => PromptKey::WorldBuilding,
            Self::PlotArchitecture => PromptKey::PlotArchitecture,
        }
    }

    fn step(&self) -> u32 {
        match self {
            Self::CoreSeed => 1,
            Self::CharacterDynamics => 2,
            Self::CharacterState => 3,
            Self::WorldBuilding => 4,
            Self::PlotArchitecture => 5,
        }
    }
}

impl fmt::Display for ArchitectureField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl From<ArchitectureField> for StreamField {
    fn from(field: ArchitectureField) -> Self {
        match field {
            ArchitectureField::CoreSeed => StreamField::CoreSeed,
            ArchitectureField::CharacterDynamics => StreamField::CharacterDynamics,
            ArchitectureField::CharacterState => StreamField::CharacterState,
            ArchitectureField::WorldBuilding => StreamField::WorldBuilding,
            ArchitectureField::PlotArchitecture => StreamField::PlotArchitecture,
        }
    }
}

#[derive(Debug, Error)]
pub enum ArchitectureError {
    #[error("failed to render prompt for {field}: {source}")]
    Prompt {
        field: ArchitectureField,
        #[source]
        source: PromptError,
    },
    #[error("language model invocation failed for {field}: {source}")]
    Model {
        field: ArchitectureField,
        #[source]
        source: LanguageModelError,
    },
    #[error("{field} returned empty content")]
    EmptyResponse { field: ArchitectureField },
    #[error("missing dependency {dependency} when generating {field}")]
    MissingDependency {
        field: ArchitectureField,
        dependency: ArchitectureField,
    },
}

impl ArchitectureError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Model { source, .. } if source.is_cancelled())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ArchitectureOutcome {
    pub generated: Vec<ArchitectureField>,
    pub skipped: Vec<ArchitectureField>,
}

pub struct ArchitectureService<'a> {
    ctx: StageContext<'a>,
}

impl<'a> ArchitectureService<'a> {
    pub fn new(ctx: StageContext<'a>) -> Self {
        Self { ctx }
    }

    /// Generates every empty setting field in order, writing each result into
    /// `project` as soon as it arrives. Populated fields are left untouched.
    pub async fn generate(
        &self,
        project: &mut Project,
    ) -> Result<ArchitectureOutcome, ArchitectureError> {
        let total = ArchitectureField::ALL.len() as u32;
        let mut outcome = ArchitectureOutcome::default();

        for field in ArchitectureField::ALL {
            if project.has_architecture_field(field) {
                log::info!("Step{} 已完成，跳过{}生成", field.step(), field);
                outcome.skipped.push(field);
                continue;
            }
            ensure_dependencies(project, field)?;

            log::info!("Step{}: 生成{}...", field.step(), field);
            self.ctx
                .report(format!("正在生成{}...", field), field.step(), total);

            let prompt = self
                .ctx
                .prompts()
                .format(field.prompt_key(), &architecture_arguments(project))
                .map_err(|source| ArchitectureError::Prompt { field, source })?;
            let text = self
                .ctx
                .invoke_streamed(Stage::Architecture, &prompt, Some(field.into()))
                .await
                .map_err(|source| ArchitectureError::Model { field, source })?;
            if text.is_empty() {
                log::warn!("{field}生成失败，模型返回内容为空");
                return Err(ArchitectureError::EmptyResponse { field });
            }

            project.set_architecture_field(field, text);
            outcome.generated.push(field);
        }

        project.architecture_generated = project.architecture_complete();
        self.ctx.report("架构生成完成!", total, total);
        Ok(outcome)
    }
}

fn ensure_dependencies(project: &Project, field: ArchitectureField) -> Result<(), ArchitectureError> {
    match field
        .dependencies()
        .iter()
        .find(|dependency| !project.has_architecture_field(**dependency))
    {
        Some(dependency) => Err(ArchitectureError::MissingDependency {
            field,
            dependency: *dependency,
        }),
        None => Ok(()),
    }
}

/// Every template in the architecture family draws from the same pool of
/// project values; each one picks the placeholders it needs.
fn architecture_arguments(project: &Project) -> PromptArguments {
    PromptArguments::from([
        ("topic".to_string(), project.topic.trim().to_string()),
        ("genre".to_string(), project.genre_label()),
        (
            "number_of_chapters".to_string(),
            project.number_of_chapters.to_string(),
        ),
        ("word_number".to_string(), project.word_number.to_string()),
        (
            "user_guidance".to_string(),
            project.user_guidance.trim().to_string(),
        ),
        ("core_seed".to_string(), project.core_seed.clone()),
        (
            "character_dynamics".to_string(),
            project.character_dynamics.clone(),
        ),
        ("character_state".to_string(), project.character_state.clone()),
        ("world_building".to_string(), project.world_building.clone()),
        (
            "plot_architecture".to_string(),
            project.plot_architecture.clone(),
        ),
    ])
}

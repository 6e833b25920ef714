use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;
use thiserror::Error;
use uuid::Uuid;

use crate::architecture::ArchitectureField;
use crate::blueprint::ChapterBlueprint;

/// User-supplied fields of a new project.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewProject {
    pub title: String,
    pub topic: String,
    #[serde(default, deserialize_with = "genre_tags")]
    pub genre: Vec<String>,
    pub number_of_chapters: u32,
    pub word_number: u32,
    #[serde(default)]
    pub user_guidance: String,
}

/// One novel-in-progress. Generated fields start empty and are filled by the
/// pipeline stages; the whole value is persisted as one JSON document.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub topic: String,
    #[serde(default, deserialize_with = "genre_tags")]
    pub genre: Vec<String>,
    #[serde(default)]
    pub number_of_chapters: u32,
    #[serde(default)]
    pub word_number: u32,
    #[serde(default)]
    pub user_guidance: String,
    #[serde(default)]
    pub core_seed: String,
    #[serde(default)]
    pub character_dynamics: String,
    #[serde(default)]
    pub character_state: String,
    #[serde(default)]
    pub world_building: String,
    #[serde(default)]
    pub plot_architecture: String,
    #[serde(default)]
    pub chapter_blueprint: String,
    #[serde(default)]
    pub chapters: BTreeMap<u32, String>,
    #[serde(default)]
    pub global_summary: String,
    #[serde(default)]
    pub architecture_generated: bool,
    #[serde(default)]
    pub blueprint_generated: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    pub fn from_new(new: NewProject) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            title: new.title,
            topic: new.topic,
            genre: new.genre,
            number_of_chapters: new.number_of_chapters,
            word_number: new.word_number,
            user_guidance: new.user_guidance,
            core_seed: String::new(),
            character_dynamics: String::new(),
            character_state: String::new(),
            world_building: String::new(),
            plot_architecture: String::new(),
            chapter_blueprint: String::new(),
            chapters: BTreeMap::new(),
            global_summary: String::new(),
            architecture_generated: false,
            blueprint_generated: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Genre tags as they appear in prompts.
    pub fn genre_label(&self) -> String {
        self.genre.join(" / ")
    }

    pub fn architecture_field(&self, field: ArchitectureField) -> &str {
        match field {
            ArchitectureField::CoreSeed => &self.core_seed,
            ArchitectureField::CharacterDynamics => &self.character_dynamics,
            ArchitectureField::CharacterState => &self.character_state,
            ArchitectureField::WorldBuilding => &self.world_building,
            ArchitectureField::PlotArchitecture => &self.plot_architecture,
        }
    }

    pub fn set_architecture_field(&mut self, field: ArchitectureField, value: String) {
        let slot = match field {
            ArchitectureField::CoreSeed => &mut self.core_seed,
            ArchitectureField::CharacterDynamics => &mut self.character_dynamics,
            ArchitectureField::CharacterState => &mut self.character_state,
            ArchitectureField::WorldBuilding => &mut self.world_building,
            ArchitectureField::PlotArchitecture => &mut self.plot_architecture,
        };
        *slot = value;
    }

    pub fn has_architecture_field(&self, field: ArchitectureField) -> bool {
        !self.architecture_field(field).trim().is_empty()
    }

    pub fn architecture_complete(&self) -> bool {
        ArchitectureField::ALL
            .iter()
            .all(|field| self.has_architecture_field(*field))
    }

    pub fn blueprint(&self) -> ChapterBlueprint {
        ChapterBlueprint::from_text(&self.chapter_blueprint)
    }

    pub fn blueprint_complete(&self) -> bool {
        let blueprint = self.blueprint();
        (1..=self.number_of_chapters).all(|number| blueprint.entry(number).is_some())
    }

    pub fn chapter(&self, number: u32) -> Option<&str> {
        self.chapters.get(&number).map(String::as_str)
    }

    pub fn commit_chapter(&mut self, number: u32, text: impl Into<String>) {
        self.chapters.insert(number, text.into());
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Title header followed by every stored chapter in ascending order.
    pub fn export_text(&self) -> String {
        let blueprint = self.blueprint();
        let mut lines = vec![
            format!("《{}》", self.title),
            String::new(),
            format!("类型：{}", self.genre_label()),
            format!("主题：{}", self.topic),
            String::new(),
            "=".repeat(50),
            String::new(),
        ];

        for (number, text) in &self.chapters {
            let title = blueprint
                .entry(*number)
                .map(|entry| entry.title.clone())
                .filter(|title| !title.is_empty())
                .unwrap_or_else(|| format!("第{number}章"));
            lines.push(format!("第{number}章 {title}"));
            lines.push(String::new());
            lines.push(text.clone());
            lines.push(String::new());
            lines.push("-".repeat(30));
            lines.push(String::new());
        }

        lines.join("\n")
    }
}

/// Accepts either a single genre string or a list of tags.
fn genre_tags<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Genre {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<Genre>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(Genre::One(tag)) if tag.trim().is_empty() => Vec::new(),
        Some(Genre::One(tag)) => vec![tag],
        Some(Genre::Many(tags)) => tags,
    })
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("project `{0}` not found")]
    NotFound(String),
    #[error("invalid project id `{0}`")]
    InvalidId(String),
    #[error("failed to access `{path}`: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to (de)serialize `{path}`: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("project store lock poisoned")]
    Poisoned,
}

/// Persistence seam for projects. `update` replaces the stored snapshot and
/// refreshes `updated_at`; `list` returns the most recently updated first.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn create(&self, new: NewProject) -> Result<Project, StoreError>;
    async fn get(&self, id: &str) -> Result<Option<Project>, StoreError>;
    async fn update(&self, project: &Project) -> Result<Project, StoreError>;
    async fn delete(&self, id: &str) -> Result<bool, StoreError>;
    async fn list(&self) -> Result<Vec<Project>, StoreError>;
}

#[derive(Default)]
pub struct MemoryProjectStore {
    projects: Mutex<BTreeMap<String, Project>>,
}

impl MemoryProjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProjectStore for MemoryProjectStore {
    async fn create(&self, new: NewProject) -> Result<Project, StoreError> {
        let project = Project::from_new(new);
        let mut guard = self.projects.lock().map_err(|_| StoreError::Poisoned)?;
        guard.insert(project.id.clone(), project.clone());
        Ok(project)
    }

    async fn get(&self, id: &str) -> Result<Option<Project>, StoreError> {
        let guard = self.projects.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(guard.get(id).cloned())
    }

    async fn update(&self, project: &Project) -> Result<Project, StoreError> {
        let mut guard = self.projects.lock().map_err(|_| StoreError::Poisoned)?;
        let slot = guard
            .get_mut(&project.id)
            .ok_or_else(|| StoreError::NotFound(project.id.clone()))?;
        let mut updated = project.clone();
        updated.touch();
        *slot = updated.clone();
        Ok(updated)
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let mut guard = self.projects.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(guard.remove(id).is_some())
    }

    async fn list(&self) -> Result<Vec<Project>, StoreError> {
        let guard = self.projects.lock().map_err(|_| StoreError::Poisoned)?;
        let mut projects: Vec<Project> = guard.values().cloned().collect();
        projects.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(projects)
    }
}

use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::PromptConfig;

const BUILT_IN_PROMPTS: &str = include_str!("../../prompts/default.toml");

pub type PromptArguments = HashMap<String, String>;

/// Every template the pipeline renders.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PromptKey {
    CoreSeed,
    CharacterDynamics,
    CreateCharacterState,
    WorldBuilding,
    PlotArchitecture,
    ChapterBlueprint,
    ChunkedChapterBlueprint,
    FirstChapterDraft,
    NextChapterDraft,
    GlobalSummary,
    UpdateCharacterState,
    QualityCheck,
    FixChapter,
    RepairWordCount,
    RepairNextChapterLeak,
    RepairCliffhanger,
    RepairContentMatch,
    EnrichChapter,
}

impl PromptKey {
    pub const ALL: [PromptKey; 18] = [
        PromptKey::CoreSeed,
        PromptKey::CharacterDynamics,
        PromptKey::CreateCharacterState,
        PromptKey::WorldBuilding,
        PromptKey::PlotArchitecture,
        PromptKey::ChapterBlueprint,
        PromptKey::ChunkedChapterBlueprint,
        PromptKey::FirstChapterDraft,
        PromptKey::NextChapterDraft,
        PromptKey::GlobalSummary,
        PromptKey::UpdateCharacterState,
        PromptKey::QualityCheck,
        PromptKey::FixChapter,
        PromptKey::RepairWordCount,
        PromptKey::RepairNextChapterLeak,
        PromptKey::RepairCliffhanger,
        PromptKey::RepairContentMatch,
        PromptKey::EnrichChapter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PromptKey::CoreSeed => "core_seed",
            PromptKey::CharacterDynamics => "character_dynamics",
            PromptKey::CreateCharacterState => "create_character_state",
            PromptKey::WorldBuilding => "world_building",
            PromptKey::PlotArchitecture => "plot_architecture",
            PromptKey::ChapterBlueprint => "chapter_blueprint",
            PromptKey::ChunkedChapterBlueprint => "chunked_chapter_blueprint",
            PromptKey::FirstChapterDraft => "first_chapter_draft",
            PromptKey::NextChapterDraft => "next_chapter_draft",
            PromptKey::GlobalSummary => "global_summary",
            PromptKey::UpdateCharacterState => "update_character_state",
            PromptKey::QualityCheck => "quality_check",
            PromptKey::FixChapter => "fix_chapter",
            PromptKey::RepairWordCount => "repair_word_count",
            PromptKey::RepairNextChapterLeak => "repair_next_chapter_leak",
            PromptKey::RepairCliffhanger => "repair_cliffhanger",
            PromptKey::RepairContentMatch => "repair_content_match",
            PromptKey::EnrichChapter => "enrich_chapter",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|candidate| candidate.as_str() == key)
    }
}

impl fmt::Display for PromptKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PromptSource {
    BuiltIn,
    File(PathBuf),
}

impl PromptSource {
    pub fn is_builtin(&self) -> bool {
        matches!(self, Self::BuiltIn)
    }

    pub fn as_path(&self) -> Option<&Path> {
        match self {
            Self::BuiltIn => None,
            Self::File(path) => Some(path.as_path()),
        }
    }
}

#[derive(Clone, Debug)]
pub struct PromptTemplate {
    key: PromptKey,
    template: String,
    segments: Vec<Segment>,
    placeholders: BTreeSet<String>,
    description: Option<String>,
    source: PromptSource,
}

impl PromptTemplate {
    pub fn key(&self) -> PromptKey {
        self.key
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn source(&self) -> &PromptSource {
        &self.source
    }

    pub fn placeholders(&self) -> impl Iterator<Item = &str> {
        self.placeholders.iter().map(String::as_str)
    }

    /// Fills every `{name}` placeholder. All placeholders are required;
    /// `{{` and `}}` render as literal braces.
    pub fn render(&self, arguments: &PromptArguments) -> Result<String, PromptError> {
        if let Some(missing) = self
            .placeholders
            .iter()
            .find(|name| !arguments.contains_key(name.as_str()))
        {
            return Err(PromptError::MissingArgument {
                key: self.key,
                argument: missing.clone(),
            });
        }

        let mut output = String::with_capacity(self.template.len());
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => output.push_str(text),
                Segment::Slot(name) => {
                    if let Some(value) = arguments.get(name) {
                        output.push_str(value);
                    }
                }
            }
        }
        Ok(output)
    }

    fn parse(key: PromptKey, raw: RawPrompt, source: PromptSource) -> Self {
        let (segments, placeholders) = split_template(&raw.template);
        Self {
            key,
            template: raw.template,
            segments,
            placeholders,
            description: raw.description,
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("prompt `{0}` not found")]
    NotFound(PromptKey),
    #[error("missing argument `{argument}` when rendering prompt `{key}`")]
    MissingArgument { key: PromptKey, argument: String },
    #[error("unknown prompt key `{key}` in `{path}`")]
    UnknownKey { key: String, path: PathBuf },
    #[error("failed to read prompt file `{path}`: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse built-in prompt definitions: {0}")]
    ParseBuiltIn(toml::de::Error),
    #[error("failed to parse prompt file `{path}` as TOML: {source}")]
    ParseToml {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("failed to parse prompt file `{path}` as YAML: {source}")]
    ParseYaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

/// Built-in templates, optionally overridden per key by `.toml`/`.yaml`
/// files found in custom directories.
#[derive(Debug, Clone)]
pub struct PromptRegistry {
    prompts: BTreeMap<PromptKey, PromptTemplate>,
    directories: Vec<PathBuf>,
}

impl PromptRegistry {
    pub fn new() -> Result<Self, PromptError> {
        Self::with_custom_directories::<PathBuf>(&[])
    }

    pub fn from_prompt_config(config: &PromptConfig) -> Result<Self, PromptError> {
        Self::with_custom_directories(&config.custom_directories)
    }

    pub fn with_custom_directories<P: AsRef<Path>>(directories: &[P]) -> Result<Self, PromptError> {
        let mut registry = Self {
            prompts: BTreeMap::new(),
            directories: directories
                .iter()
                .map(|dir| dir.as_ref().to_path_buf())
                .collect(),
        };
        registry.reload()?;
        Ok(registry)
    }

    pub fn custom_directories(&self) -> &[PathBuf] {
        &self.directories
    }

    pub fn reload(&mut self) -> Result<(), PromptError> {
        let mut prompts = BTreeMap::new();
        let document: PromptDocument =
            toml::from_str(BUILT_IN_PROMPTS).map_err(PromptError::ParseBuiltIn)?;
        insert_document(document, PromptSource::BuiltIn, &mut prompts)?;

        for dir in &self.directories {
            load_directory(dir, &mut prompts)?;
        }

        self.prompts = prompts;
        Ok(())
    }

    pub fn get(&self, key: PromptKey) -> Option<&PromptTemplate> {
        self.prompts.get(&key)
    }

    pub fn contains(&self, key: PromptKey) -> bool {
        self.prompts.contains_key(&key)
    }

    pub fn format(&self, key: PromptKey, args: &PromptArguments) -> Result<String, PromptError> {
        self.get(key)
            .ok_or(PromptError::NotFound(key))?
            .render(args)
    }

    pub fn format_with<I, K, V>(&self, key: PromptKey, arguments: I) -> Result<String, PromptError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let args: PromptArguments = arguments
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self.format(key, &args)
    }
}

fn insert_document(
    document: PromptDocument,
    source: PromptSource,
    prompts: &mut BTreeMap<PromptKey, PromptTemplate>,
) -> Result<(), PromptError> {
    for (name, raw) in document.prompts {
        let Some(key) = PromptKey::from_key(&name) else {
            return Err(PromptError::UnknownKey {
                key: name,
                path: source
                    .as_path()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| PathBuf::from("<built-in>")),
            });
        };
        prompts.insert(key, PromptTemplate::parse(key, raw, source.clone()));
    }
    Ok(())
}

fn load_directory(
    dir: &Path,
    prompts: &mut BTreeMap<PromptKey, PromptTemplate>,
) -> Result<(), PromptError> {
    if !dir.is_dir() {
        log::debug!("prompt directory {} missing, skipped", dir.display());
        return Ok(());
    }

    let io_error = |path: &Path| {
        let path = path.to_path_buf();
        move |source| PromptError::Io { path, source }
    };

    let mut files = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_error(dir))? {
        let path = entry.map_err(io_error(dir))?.path();
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();

    for path in files {
        let Some(ext) = path.extension().and_then(|ext| ext.to_str()) else {
            continue;
        };
        let document: PromptDocument = match ext.to_ascii_lowercase().as_str() {
            "toml" => {
                let contents = fs::read_to_string(&path).map_err(io_error(&path))?;
                toml::from_str(&contents).map_err(|source| PromptError::ParseToml {
                    path: path.clone(),
                    source,
                })?
            }
            "yaml" | "yml" => {
                let contents = fs::read_to_string(&path).map_err(io_error(&path))?;
                serde_yaml::from_str(&contents).map_err(|source| PromptError::ParseYaml {
                    path: path.clone(),
                    source,
                })?
            }
            _ => continue,
        };
        log::debug!("loaded prompt overrides from {}", path.display());
        insert_document(document, PromptSource::File(path), prompts)?;
    }

    Ok(())
}

#[derive(Debug, Deserialize)]
struct PromptDocument {
    #[serde(default)]
    prompts: BTreeMap<String, RawPrompt>,
}

#[derive(Debug, Deserialize)]
struct RawPrompt {
    #[serde(alias = "text")]
    template: String,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Clone, Debug)]
enum Segment {
    Text(String),
    Slot(String),
}

fn split_template(template: &str) -> (Vec<Segment>, BTreeSet<String>) {
    let mut segments = Vec::new();
    let mut names = BTreeSet::new();
    let mut text = String::new();
    let mut rest = template;

    while let Some(position) = rest.find(['{', '}']) {
        text.push_str(&rest[..position]);
        let tail = &rest[position..];

        if tail.starts_with("{{") || tail.starts_with("}}") {
            text.push_str(&tail[..1]);
            rest = &tail[2..];
            continue;
        }
        if tail.starts_with('}') {
            text.push('}');
            rest = &tail[1..];
            continue;
        }

        match tail[1..].find('}') {
            Some(end) => {
                let name = tail[1..1 + end].trim();
                if name.is_empty() {
                    text.push_str("{}");
                } else {
                    if !text.is_empty() {
                        segments.push(Segment::Text(std::mem::take(&mut text)));
                    }
                    names.insert(name.to_string());
                    segments.push(Segment::Slot(name.to_string()));
                }
                rest = &tail[end + 2..];
            }
            None => {
                text.push_str(tail);
                rest = "";
            }
        }
    }
    text.push_str(rest);

    if !text.is_empty() {
        segments.push(Segment::Text(text));
    }
    (segments, names)
}

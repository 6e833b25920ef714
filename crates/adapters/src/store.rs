use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use storyloom_core::project::{NewProject, Project, ProjectStore, StoreError};
use tokio::fs;

const PROJECT_EXTENSION: &str = "json";

/// One pretty-printed JSON document per project, named `{id}.json`.
#[derive(Clone, Debug)]
pub struct JsonProjectStore {
    directory: PathBuf,
}

impl JsonProjectStore {
    pub async fn open(directory: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let directory = directory.into();
        fs::create_dir_all(&directory)
            .await
            .map_err(|source| io_error(&directory, source))?;
        Ok(Self { directory })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn path_for(&self, id: &str) -> Result<PathBuf, StoreError> {
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_');
        if !valid {
            return Err(StoreError::InvalidId(id.to_string()));
        }
        Ok(self.directory.join(format!("{id}.{PROJECT_EXTENSION}")))
    }

    async fn read(&self, path: &Path) -> Result<Option<Project>, StoreError> {
        let raw = match fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_error(path, err)),
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| StoreError::Json {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Writes through a temporary sibling and renames it into place.
    async fn write(&self, project: &Project) -> Result<(), StoreError> {
        let path = self.path_for(&project.id)?;
        let data = serde_json::to_string_pretty(project).map_err(|source| StoreError::Json {
            path: path.clone(),
            source,
        })?;
        let temp = path.with_extension("json.tmp");
        fs::write(&temp, data)
            .await
            .map_err(|source| io_error(&temp, source))?;
        fs::rename(&temp, &path)
            .await
            .map_err(|source| io_error(&path, source))
    }
}

fn io_error(path: &Path, source: io::Error) -> StoreError {
    StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[async_trait]
impl ProjectStore for JsonProjectStore {
    async fn create(&self, new: NewProject) -> Result<Project, StoreError> {
        let project = Project::from_new(new);
        self.write(&project).await?;
        log::info!("created project {} ({})", project.id, project.title);
        Ok(project)
    }

    async fn get(&self, id: &str) -> Result<Option<Project>, StoreError> {
        let path = self.path_for(id)?;
        self.read(&path).await
    }

    async fn update(&self, project: &Project) -> Result<Project, StoreError> {
        let path = self.path_for(&project.id)?;
        if fs::metadata(&path).await.is_err() {
            return Err(StoreError::NotFound(project.id.clone()));
        }
        let mut updated = project.clone();
        updated.touch();
        self.write(&updated).await?;
        Ok(updated)
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let path = self.path_for(id)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(io_error(&path, err)),
        }
    }

    async fn list(&self) -> Result<Vec<Project>, StoreError> {
        let mut entries = fs::read_dir(&self.directory)
            .await
            .map_err(|source| io_error(&self.directory, source))?;
        let mut projects = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|source| io_error(&self.directory, source))?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(PROJECT_EXTENSION) {
                continue;
            }
            match self.read(&path).await {
                Ok(Some(project)) => projects.push(project),
                Ok(None) => {}
                Err(err) => log::warn!("skipping unreadable project file: {err}"),
            }
        }
        projects.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(projects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn new_project(title: &str) -> NewProject {
        NewProject {
            title: title.into(),
            topic: "边境小镇的怪事".into(),
            genre: vec!["悬疑".into()],
            number_of_chapters: 10,
            word_number: 2000,
            user_guidance: String::new(),
        }
    }

    #[tokio::test]
    async fn create_update_and_reload() {
        let dir = tempdir().unwrap();
        let store = JsonProjectStore::open(dir.path().join("projects")).await.unwrap();

        let mut project = store.create(new_project("雾镇")).await.unwrap();
        assert!(store.directory().join(format!("{}.json", project.id)).exists());

        project.core_seed = "种子".into();
        project.commit_chapter(1, "第一章");
        let updated = store.update(&project).await.unwrap();
        assert!(updated.updated_at >= project.updated_at);

        let reopened = JsonProjectStore::open(dir.path().join("projects")).await.unwrap();
        let loaded = reopened.get(&project.id).await.unwrap().unwrap();
        assert_eq!(loaded.core_seed, "种子");
        assert_eq!(loaded.chapter(1), Some("第一章"));
    }

    #[tokio::test]
    async fn lists_newest_first_and_skips_garbage() {
        let dir = tempdir().unwrap();
        let store = JsonProjectStore::open(dir.path()).await.unwrap();

        let pause = std::time::Duration::from_millis(5);
        let first = store.create(new_project("一")).await.unwrap();
        tokio::time::sleep(pause).await;
        let second = store.create(new_project("二")).await.unwrap();
        std::fs::write(dir.path().join("broken.json"), "{").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        tokio::time::sleep(pause).await;
        store.update(&first).await.unwrap();

        let listed = store.list().await.unwrap();
        let ids: Vec<_> = listed.iter().map(|project| project.id.as_str()).collect();
        assert_eq!(ids, vec![first.id.as_str(), second.id.as_str()]);
    }

    #[tokio::test]
    async fn rejects_unknown_and_invalid_ids() {
        let dir = tempdir().unwrap();
        let store = JsonProjectStore::open(dir.path()).await.unwrap();

        assert!(store.get("missing").await.unwrap().is_none());
        assert!(!store.delete("missing").await.unwrap());
        assert!(matches!(
            store.get("../etc/passwd").await,
            Err(StoreError::InvalidId(_))
        ));

        let orphan = Project::from_new(new_project("孤儿"));
        assert!(matches!(
            store.update(&orphan).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn delete_removes_file() {
        let dir = tempdir().unwrap();
        let store = JsonProjectStore::open(dir.path()).await.unwrap();
        let project = store.create(new_project("删")).await.unwrap();

        assert!(store.delete(&project.id).await.unwrap());
        assert!(store.get(&project.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_errors_carry_their_path() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("occupied");
        std::fs::write(&blocker, "not a directory").unwrap();

        match JsonProjectStore::open(&blocker).await {
            Err(StoreError::Io { path, .. }) => assert_eq!(path, blocker),
            other => panic!("expected io error, got {other:?}"),
        }

        let store = JsonProjectStore::open(dir.path()).await.unwrap();
        std::fs::create_dir(dir.path().join("shadow.json")).unwrap();
        assert!(matches!(
            store.get("shadow").await,
            Err(StoreError::Io { .. })
        ));
    }
}

//! Companion directory: lookup of persona records by identifier

use super::Companion;
use crate::{CompanionError, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::fs;
use tracing::{debug, warn};

/// Read-only source of companion records.
#[async_trait::async_trait]
pub trait CompanionDirectory: Send + Sync {
    /// Fetch one companion. Unknown ids yield `CompanionNotFound`, records
    /// that fail validation yield `Configuration`.
    async fn get_companion(&self, companion_id: &str) -> Result<Companion>;

    /// All valid companions, in file order.
    async fn list_companions(&self) -> Result<Vec<Companion>>;
}

/// `companions.toml` layout
#[derive(Debug, Deserialize)]
struct CompanionsFile {
    #[serde(default, rename = "companion")]
    companions: Vec<Companion>,
}

/// Directory backed by a `companions.toml` file.
///
/// The file is re-read on every lookup so edits made by admin tooling are
/// visible to the next turn.
pub struct TomlCompanionDirectory {
    path: PathBuf,
}

impl TomlCompanionDirectory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn read_all(&self) -> Result<Vec<Companion>> {
        if !self.path.exists() {
            debug!("No companions file at {:?}", self.path);
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path).await?;
        let file: CompanionsFile = toml::from_str(&content).map_err(|e| {
            CompanionError::Configuration(format!("{}: {}", self.path.display(), e))
        })?;
        Ok(file.companions)
    }
}

#[async_trait::async_trait]
impl CompanionDirectory for TomlCompanionDirectory {
    async fn get_companion(&self, companion_id: &str) -> Result<Companion> {
        let companion = self
            .read_all()
            .await?
            .into_iter()
            .find(|c| c.id == companion_id)
            .ok_or_else(|| CompanionError::CompanionNotFound(companion_id.to_string()))?;
        companion.validate()?;
        Ok(companion)
    }

    async fn list_companions(&self) -> Result<Vec<Companion>> {
        let mut valid = Vec::new();
        for companion in self.read_all().await? {
            match companion.validate() {
                Ok(()) => valid.push(companion),
                Err(e) => warn!("Skipping companion '{}': {}", companion.id, e),
            }
        }
        Ok(valid)
    }
}

/// In-process directory, for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryCompanionDirectory {
    companions: HashMap<String, Companion>,
    order: Vec<String>,
}

impl MemoryCompanionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, companion: Companion) -> Self {
        self.insert(companion);
        self
    }

    pub fn insert(&mut self, companion: Companion) {
        if !self.companions.contains_key(&companion.id) {
            self.order.push(companion.id.clone());
        }
        self.companions.insert(companion.id.clone(), companion);
    }
}

#[async_trait::async_trait]
impl CompanionDirectory for MemoryCompanionDirectory {
    async fn get_companion(&self, companion_id: &str) -> Result<Companion> {
        let companion = self
            .companions
            .get(companion_id)
            .cloned()
            .ok_or_else(|| CompanionError::CompanionNotFound(companion_id.to_string()))?;
        companion.validate()?;
        Ok(companion)
    }

    async fn list_companions(&self) -> Result<Vec<Companion>> {
        Ok(self
            .order
            .iter()
            .filter_map(|id| self.companions.get(id))
            .filter(|c| c.validate().is_ok())
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const COMPANIONS_TOML: &str = r#"
[[companion]]
id = "luna"
name = "Luna"
background = "A retired astronomer who loves night walks."
traits = ["curious", "warm"]
interests = ["stars"]
conversation_style = "gentle"

[[companion]]
id = "rex"
name = "Rex"
background = "A retired sea captain with a thousand stories."
traits = ["gruff"]

[[companion]]
id = "broken"
name = "B"
background = "short"
"#;

    async fn directory() -> (TempDir, TomlCompanionDirectory) {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("companions.toml");
        tokio::fs::write(&path, COMPANIONS_TOML).await.unwrap();
        (temp_dir, TomlCompanionDirectory::new(path))
    }

    #[tokio::test]
    async fn test_get_companion_from_toml() {
        let (_tmp, dir) = directory().await;
        let luna = dir.get_companion("luna").await.unwrap();
        assert_eq!(luna.name, "Luna");
        assert_eq!(luna.traits, vec!["curious", "warm"]);
        assert_eq!(luna.conversation_style, "gentle");

        let rex = dir.get_companion("rex").await.unwrap();
        assert_eq!(rex.conversation_style, "friendly and engaging");
        assert!(rex.interests.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_and_invalid_companions() {
        let (_tmp, dir) = directory().await;
        let err = dir.get_companion("nobody").await.unwrap_err();
        assert_eq!(err.reason(), "companion_not_found");

        let err = dir.get_companion("broken").await.unwrap_err();
        assert_eq!(err.reason(), "configuration_error");
    }

    #[tokio::test]
    async fn test_list_skips_invalid_records() {
        let (_tmp, dir) = directory().await;
        let ids: Vec<String> = dir
            .list_companions()
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, vec!["luna", "rex"]);
    }

    #[tokio::test]
    async fn test_missing_file_is_empty_directory() {
        let temp_dir = TempDir::new().unwrap();
        let dir = TomlCompanionDirectory::new(temp_dir.path().join("none.toml"));
        assert!(dir.list_companions().await.unwrap().is_empty());
        assert!(dir.get_companion("luna").await.is_err());
    }

    #[tokio::test]
    async fn test_malformed_file_is_configuration_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("companions.toml");
        tokio::fs::write(&path, "[[companion]]\nid = 3").await.unwrap();
        let dir = TomlCompanionDirectory::new(path);
        let err = dir.list_companions().await.unwrap_err();
        assert_eq!(err.reason(), "configuration_error");
    }

    #[tokio::test]
    async fn test_memory_directory() {
        let dir = MemoryCompanionDirectory::new().with(Companion::new(
            "ava",
            "Ava",
            "A chess coach from Lisbon.",
        ));
        assert_eq!(dir.get_companion("ava").await.unwrap().name, "Ava");
        assert_eq!(dir.list_companions().await.unwrap().len(), 1);
    }
}

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Save/load service for named state objects. Each object is one JSON file,
/// fully rewritten on every save; writes go through a sibling temp file and
/// a rename so a crash never leaves a half-written object behind.
#[derive(Debug, Clone)]
pub struct ObjectStore {
    dir: PathBuf,
}

impl ObjectStore {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create data directory: {}", dir.display()))?;
        Ok(ObjectStore { dir })
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.path(name).exists()
    }

    pub fn save<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        let path = self.path(name);
        let staged = self.dir.join(format!("{name}.json.new"));
        let content = serde_json::to_string_pretty(value)
            .with_context(|| format!("Failed to serialize object {name}"))?;
        std::fs::write(&staged, content)
            .with_context(|| format!("Failed to write {}", staged.display()))?;
        std::fs::rename(&staged, &path)
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }

    /// Save, treating failure as a logged warning. The in-memory state is
    /// already updated by the time this runs, so a failed save only risks
    /// losing that update on crash, never computing with a stale value.
    pub fn persist<T: Serialize>(&self, name: &str, value: &T) {
        if let Err(e) = self.save(name, value) {
            log::warn!("Persist {name} error: {e:#}");
        }
    }

    pub fn load<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        let path = self.path(name);
        if !path.exists() {
            return None;
        }

        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) => {
                log::warn!("Read {} error: {e}", path.display());
                return None;
            }
        };

        match serde_json::from_str(&content) {
            Ok(value) => Some(value),
            Err(e) => {
                log::warn!("Decode object {name} error: {e}");
                None
            }
        }
    }
}

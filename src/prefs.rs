//! Device-local preferences, persisted as a small JSON file next to the
//! database. Only tracks whether this install has completed activation.

use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default, Serialize, Deserialize)]
struct PreferenceFile {
    #[serde(default)]
    has_activated: bool,
}

pub struct Preferences {
    path: Option<PathBuf>,
    has_activated: AtomicBool,
}

impl Preferences {
    pub async fn load(path: &Path) -> io::Result<Self> {
        let file = match tokio::fs::read_to_string(path).await {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                tracing::warn!(error = %e, path = ?path, "ignoring unreadable preferences file");
                PreferenceFile::default()
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => PreferenceFile::default(),
            Err(e) => return Err(e),
        };

        Ok(Preferences {
            path: Some(path.to_path_buf()),
            has_activated: AtomicBool::new(file.has_activated),
        })
    }

    /// Not persisted; for tests and ephemeral runs.
    pub fn in_memory() -> Self {
        Preferences {
            path: None,
            has_activated: AtomicBool::new(false),
        }
    }

    pub fn has_activated(&self) -> bool {
        self.has_activated.load(Ordering::SeqCst)
    }

    pub async fn mark_activated(&self) -> io::Result<()> {
        self.has_activated.store(true, Ordering::SeqCst);
        if let Some(path) = &self.path {
            let body = serde_json::to_string(&PreferenceFile {
                has_activated: true,
            })
            .map_err(io::Error::other)?;
            tokio::fs::write(path, body).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("adipura-{}-{}.json", name, uuid::Uuid::new_v4().simple()))
    }

    #[tokio::test]
    async fn test_missing_file_means_not_activated() {
        let prefs = Preferences::load(&scratch_path("missing")).await.unwrap();
        assert!(!prefs.has_activated());
    }

    #[tokio::test]
    async fn test_activation_survives_reload() {
        let path = scratch_path("reload");
        let prefs = Preferences::load(&path).await.unwrap();
        prefs.mark_activated().await.unwrap();

        let reloaded = Preferences::load(&path).await.unwrap();
        assert!(reloaded.has_activated());
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn test_corrupt_file_falls_back_to_default() {
        let path = scratch_path("corrupt");
        tokio::fs::write(&path, "{not json").await.unwrap();

        let prefs = Preferences::load(&path).await.unwrap();
        assert!(!prefs.has_activated());
        let _ = tokio::fs::remove_file(&path).await;
    }
}

//! Resume point for interrupted runs.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

/// Last row of the window whose fetch settled, saved after every batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub last_row: u32,
    pub last_tracking: String,
    pub carrier: String,
    pub run_id: Uuid,
    pub saved_at: DateTime<Utc>,
}

impl Checkpoint {
    /// First row a resumed run should read.
    pub fn resume_row(&self) -> u32 {
        self.last_row.saturating_add(1)
    }

    /// `None` when no checkpoint has been saved.
    pub async fn load(path: &Path) -> Result<Option<Self>> {
        match fs::read_to_string(path).await {
            Ok(text) => serde_json::from_str(&text)
                .map(Some)
                .with_context(|| format!("parsing {}", path.display())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
        }
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let bytes = serde_json::to_vec_pretty(self).context("serializing checkpoint")?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .await
            .with_context(|| format!("replacing {}", path.display()))
    }

    pub async fn clear(path: &Path) -> Result<()> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("removing {}", path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn checkpoint(last_row: u32) -> Checkpoint {
        Checkpoint {
            last_row,
            last_tracking: "240000000004".to_string(),
            carrier: "interrapidisimo".to_string(),
            run_id: Uuid::nil(),
            saved_at: Utc.with_ymd_and_hms(2026, 3, 14, 9, 30, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn saves_loads_and_clears() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("logs/checkpoint.json");
        assert_eq!(Checkpoint::load(&path).await.unwrap(), None);

        checkpoint(5).save(&path).await.unwrap();
        checkpoint(9).save(&path).await.unwrap();
        let loaded = Checkpoint::load(&path).await.unwrap().unwrap();
        assert_eq!(loaded, checkpoint(9));
        assert_eq!(loaded.resume_row(), 10);
        assert!(!dir.path().join("logs/checkpoint.json.tmp").exists());

        Checkpoint::clear(&path).await.unwrap();
        Checkpoint::clear(&path).await.unwrap();
        assert_eq!(Checkpoint::load(&path).await.unwrap(), None);
    }

    #[tokio::test]
    async fn corrupt_checkpoint_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(Checkpoint::load(&path).await.is_err());
    }
}

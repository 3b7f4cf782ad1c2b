//! Warm-start snapshot: which models were resident when the engine last looked.
//!
//! Written atomically (temp file, then rename) and read once at startup. Losing it only costs
//! a cold start.
use crate::catalog::ModelKey;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub written_at_unix: u64,
    pub resident: Vec<ModelKey>,
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

impl Snapshot {
    pub fn new(resident: Vec<ModelKey>) -> Self {
        let written_at_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        Self {
            written_at_unix,
            resident,
        }
    }

    pub async fn write(&self, path: &Path) -> Result<(), anyhow::Error> {
        let tmp = temp_path(path);
        let contents = serde_json::to_vec_pretty(self).context("Failed to encode snapshot")?;
        tokio::fs::write(&tmp, contents)
            .await
            .with_context(|| format!("Failed to write snapshot to '{}'", tmp.display()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .with_context(|| format!("Failed to move snapshot into '{}'", path.display()))?;
        Ok(())
    }

    /// Read a snapshot. A missing file is `None`, not an error.
    pub async fn read(path: &Path) -> Result<Option<Self>, anyhow::Error> {
        match tokio::fs::read(path).await {
            Ok(bytes) => {
                let snapshot = serde_json::from_slice(&bytes).with_context(|| {
                    format!("Failed to parse snapshot '{}'", path.display())
                })?;
                Ok(Some(snapshot))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => {
                Err(e).with_context(|| format!("Failed to read snapshot '{}'", path.display()))
            }
        }
    }
}

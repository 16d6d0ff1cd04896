use super::ApplyCheckpoint;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Persists the active checkpoint as `current.json` and archives finished
/// runs under `runs/`.
pub struct CheckpointStore {
    checkpoint_dir: PathBuf,
    current_file: PathBuf,
}

impl CheckpointStore {
    pub fn new(checkpoint_dir: &Path) -> Self {
        Self {
            checkpoint_dir: checkpoint_dir.to_path_buf(),
            current_file: checkpoint_dir.join("current.json"),
        }
    }

    pub fn current_path(&self) -> &Path {
        &self.current_file
    }

    /// Write the checkpoint atomically (temp file, then rename).
    pub fn save(&self, checkpoint: &ApplyCheckpoint) -> Result<()> {
        fs::create_dir_all(&self.checkpoint_dir).with_context(|| {
            format!(
                "Failed to create checkpoint dir {}",
                self.checkpoint_dir.display()
            )
        })?;
        let json =
            serde_json::to_string_pretty(checkpoint).context("Failed to serialize checkpoint")?;
        let tmp = self.checkpoint_dir.join("current.json.tmp");
        fs::write(&tmp, json).context("Failed to write checkpoint")?;
        fs::rename(&tmp, &self.current_file).context("Failed to replace current.json")?;
        Ok(())
    }

    pub fn load_current(&self) -> Result<Option<ApplyCheckpoint>> {
        if !self.current_file.exists() {
            return Ok(None);
        }
        self.load(&self.current_file).map(Some)
    }

    /// Move a terminal checkpoint into `runs/` and clear `current.json`.
    pub fn archive(&self, checkpoint: &ApplyCheckpoint) -> Result<PathBuf> {
        let runs_dir = self.checkpoint_dir.join("runs");
        fs::create_dir_all(&runs_dir).context("Failed to create runs dir")?;

        let filename = format!(
            "{}_{}.json",
            checkpoint.started_at.format("%Y-%m-%dT%H-%M-%S"),
            &checkpoint.run_id.to_string()[..8]
        );
        let run_file = runs_dir.join(filename);
        let json =
            serde_json::to_string_pretty(checkpoint).context("Failed to serialize checkpoint")?;
        fs::write(&run_file, json).context("Failed to write archived checkpoint")?;

        if self.current_file.exists() {
            fs::remove_file(&self.current_file)
                .context("Failed to remove current.json after archiving")?;
        }
        Ok(run_file)
    }

    /// Archived runs, most recent first.
    pub fn list_runs(&self) -> Result<Vec<PathBuf>> {
        let runs_dir = self.checkpoint_dir.join("runs");
        if !runs_dir.exists() {
            return Ok(Vec::new());
        }

        let mut runs: Vec<PathBuf> = fs::read_dir(&runs_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|e| e == "json").unwrap_or(false))
            .collect();

        runs.sort();
        runs.reverse();
        Ok(runs)
    }

    pub fn load(&self, path: &Path) -> Result<ApplyCheckpoint> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read checkpoint {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse checkpoint {}", path.display()))
    }
}

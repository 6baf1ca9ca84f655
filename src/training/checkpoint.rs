//! Periodic adapter checkpoints during training
//!
//! Each checkpoint is a directory `checkpoint-<step>` holding the adapter
//! weights, the PEFT adapter config and the trainer state, so any of them can
//! be loaded as a standalone adapter. Only the newest `max_checkpoints`
//! directories are kept.

use super::export::{collect_adapter_state, save_adapter_state, AdapterStats};
use crate::error::Result;
use crate::lora::PeftAdapterConfig;
use crate::runtime::CausalLanguageModel;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const ADAPTER_WEIGHTS_FILE: &str = "adapter_model.safetensors";
pub const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";
pub const TRAINER_STATE_FILE: &str = "trainer_state.json";

/// One logged optimizer step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub step: usize,
    /// Fractional epoch, e.g. 1.5 half way through the second epoch
    pub epoch: f64,
    pub loss: f32,
    pub learning_rate: f64,
    pub grad_norm: f32,
}

/// Progress written next to every checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerState {
    pub global_step: usize,
    pub max_steps: usize,
    pub epoch: f64,
    pub timestamp: DateTime<Utc>,
    pub log_history: Vec<LogEntry>,
}

#[derive(Debug, Clone)]
pub struct CheckpointInfo {
    pub step: usize,
    pub path: PathBuf,
}

/// Writes and rotates checkpoints under `<output_dir>/checkpoints`.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    checkpoint_dir: PathBuf,
    max_checkpoints: usize,
    adapter_config: Option<PeftAdapterConfig>,
}

impl CheckpointManager {
    pub fn new(
        output_dir: &Path,
        max_checkpoints: usize,
        adapter_config: Option<PeftAdapterConfig>,
    ) -> Self {
        Self {
            checkpoint_dir: output_dir.join("checkpoints"),
            max_checkpoints,
            adapter_config,
        }
    }

    pub fn checkpoint_dir(&self) -> &Path {
        &self.checkpoint_dir
    }

    /// Save the current adapter and trainer state, then drop old checkpoints.
    pub fn save(
        &self,
        model: &dyn CausalLanguageModel,
        state: &TrainerState,
    ) -> Result<(PathBuf, AdapterStats)> {
        let path = self
            .checkpoint_dir
            .join(format!("checkpoint-{}", state.global_step));
        fs::create_dir_all(&path)?;

        let adapter = collect_adapter_state(model)?;
        let stats = save_adapter_state(&adapter, &path.join(ADAPTER_WEIGHTS_FILE))?;
        if let Some(config) = &self.adapter_config {
            fs::write(
                path.join(ADAPTER_CONFIG_FILE),
                serde_json::to_string_pretty(config)?,
            )?;
        }
        fs::write(
            path.join(TRAINER_STATE_FILE),
            serde_json::to_string_pretty(state)?,
        )?;

        tracing::info!("Checkpoint saved: step {} at {}", state.global_step, path.display());

        if let Err(e) = self.cleanup_old_checkpoints() {
            tracing::warn!("Failed to clean up old checkpoints: {}", e);
        }
        Ok((path, stats))
    }

    /// Checkpoints on disk, oldest first.
    pub fn list_checkpoints(&self) -> Result<Vec<CheckpointInfo>> {
        if !self.checkpoint_dir.exists() {
            return Ok(Vec::new());
        }

        let mut checkpoints = Vec::new();
        for entry in fs::read_dir(&self.checkpoint_dir)? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            let step = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix("checkpoint-"))
                .and_then(|s| s.parse().ok());
            if let Some(step) = step {
                checkpoints.push(CheckpointInfo { step, path });
            }
        }

        checkpoints.sort_by_key(|c| c.step);
        Ok(checkpoints)
    }

    pub fn load_state(&self, checkpoint: &CheckpointInfo) -> Result<TrainerState> {
        let json = fs::read_to_string(checkpoint.path.join(TRAINER_STATE_FILE))?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Keep only the most recent `max_checkpoints`; zero keeps everything.
    fn cleanup_old_checkpoints(&self) -> Result<()> {
        let checkpoints = self.list_checkpoints()?;
        if self.max_checkpoints == 0 || checkpoints.len() <= self.max_checkpoints {
            return Ok(());
        }

        let to_remove = checkpoints.len() - self.max_checkpoints;
        for checkpoint in checkpoints.into_iter().take(to_remove) {
            tracing::debug!("Removing old checkpoint {}", checkpoint.path.display());
            if let Err(e) = fs::remove_dir_all(&checkpoint.path) {
                tracing::warn!("Failed to remove old checkpoint: {}", e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lora::LoRAConfig;
    use crate::runtime::causal_lm::tests::tiny_model;
    use crate::training::export::load_adapter;
    use tempfile::tempdir;

    fn state(step: usize) -> TrainerState {
        TrainerState {
            global_step: step,
            max_steps: 10,
            epoch: step as f64 / 5.0,
            timestamp: Utc::now(),
            log_history: vec![LogEntry {
                step,
                epoch: step as f64 / 5.0,
                loss: 2.5,
                learning_rate: 1e-4,
                grad_norm: 0.7,
            }],
        }
    }

    #[test]
    fn test_checkpoint_layout() {
        let dir = tempdir().expect("test: tempdir");
        let lora = LoRAConfig { rank: 4, alpha: 8.0, ..Default::default() };
        let model = tiny_model(&lora);
        let manager = CheckpointManager::new(dir.path(), 2, Some(lora.to_peft_config("tiny")));

        let saved = state(3);
        let (path, stats) = manager.save(&model, &saved).expect("test: save");
        assert!(path.ends_with("checkpoints/checkpoint-3"));
        assert_eq!(stats.tensors, 16);

        let adapter = load_adapter(&path.join(ADAPTER_WEIGHTS_FILE)).expect("test: load");
        assert_eq!(adapter.len(), 16);

        let config: serde_json::Value = serde_json::from_str(
            &fs::read_to_string(path.join(ADAPTER_CONFIG_FILE)).expect("test: read config"),
        )
        .expect("test: parse config");
        assert_eq!(config["r"], 4);
        assert_eq!(config["peft_type"], "LORA");

        let info = &manager.list_checkpoints().expect("test: list")[0];
        let restored = manager.load_state(info).expect("test: state");
        assert_eq!(restored.global_step, 3);
        assert_eq!(restored.timestamp, saved.timestamp);
        assert_eq!(restored.log_history.len(), 1);
    }

    #[test]
    fn test_rotation_keeps_newest() {
        let dir = tempdir().expect("test: tempdir");
        let lora = LoRAConfig { rank: 2, alpha: 4.0, ..Default::default() };
        let model = tiny_model(&lora);
        let manager = CheckpointManager::new(dir.path(), 2, Some(lora.to_peft_config("tiny")));

        for step in [5, 10, 15] {
            manager.save(&model, &state(step)).expect("test: save");
        }
        let steps: Vec<usize> = manager
            .list_checkpoints()
            .expect("test: list")
            .iter()
            .map(|c| c.step)
            .collect();
        assert_eq!(steps, vec![10, 15]);
    }

    #[test]
    fn test_list_without_directory() {
        let dir = tempdir().expect("test: tempdir");
        let manager = CheckpointManager::new(
            &dir.path().join("missing"),
            2,
            None,
        );
        assert!(manager.list_checkpoints().expect("test: list").is_empty());
    }
}

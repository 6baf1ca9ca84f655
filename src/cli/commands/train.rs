//! Arguments of the `train_lora` command

use crate::config::TrainConfig;
use crate::error::Result;
use clap::Parser;
use std::path::{Path, PathBuf};

/// Train a LoRA adapter for Qwen models from a weighted JSONL queue
///
/// Flags left unset fall back to the config file, then the
/// `TRAIN_LORA__<SECTION>__<KEY>` environment variables, then the built-in
/// defaults.
#[derive(Debug, Clone, Parser)]
#[command(name = "train_lora", author, version, about, long_about = None)]
pub struct TrainLoraArgs {
    /// Path to training queue JSONL file
    pub queue_file: PathBuf,

    /// Path to output safetensors file
    pub output_file: PathBuf,

    /// Base model hub id (already downloaded) or local directory
    #[arg(long)]
    pub base_model: String,

    /// LoRA rank [default: 16]
    #[arg(long)]
    pub rank: Option<usize>,

    /// LoRA alpha [default: 32.0]
    #[arg(long)]
    pub alpha: Option<f64>,

    /// LoRA dropout [default: 0.05]
    #[arg(long)]
    pub dropout: Option<f32>,

    /// Training epochs [default: 3]
    #[arg(long)]
    pub epochs: Option<usize>,

    /// Batch size [default: 4]
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Learning rate [default: 1e-4]
    #[arg(long)]
    pub learning_rate: Option<f64>,

    /// Sequence length after truncation and padding [default: 512]
    #[arg(long)]
    pub max_length: Option<usize>,

    /// System turn prepended to every example
    #[arg(long)]
    pub system_prompt: Option<String>,

    /// Seed for adapter initialization, dropout and sampling [default: 42]
    #[arg(long)]
    pub seed: Option<u64>,

    /// TOML configuration file
    #[arg(long, env = "TRAIN_LORA_CONFIG")]
    pub config: Option<PathBuf>,

    /// Also write logs to this file
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Never use an accelerator
    #[arg(long)]
    pub cpu: bool,

    /// Rename the queue file with a timestamp after a successful export
    #[arg(long)]
    pub archive_queue: bool,

    /// Validate the queue and base model, then exit without training
    #[arg(long)]
    pub check: bool,
}

impl TrainLoraArgs {
    /// Layered configuration with this command line applied on top.
    pub fn load_config(&self) -> Result<TrainConfig> {
        let mut config = TrainConfig::load(self.config.as_deref())?;
        self.apply_to(&mut config);
        config.validate()?;
        Ok(config)
    }

    /// Override `config` with every flag that was given.
    pub fn apply_to(&self, config: &mut TrainConfig) {
        if let Some(rank) = self.rank {
            config.lora.rank = rank;
        }
        if let Some(alpha) = self.alpha {
            config.lora.alpha = alpha;
        }
        if let Some(dropout) = self.dropout {
            config.lora.dropout = dropout;
        }
        if let Some(epochs) = self.epochs {
            config.training.epochs = epochs;
        }
        if let Some(batch_size) = self.batch_size {
            config.training.batch_size = batch_size;
        }
        if let Some(learning_rate) = self.learning_rate {
            config.training.learning_rate = learning_rate;
        }
        if let Some(max_length) = self.max_length {
            config.training.max_length = max_length;
        }
        if let Some(prompt) = &self.system_prompt {
            config.training.system_prompt = prompt.clone();
        }
        if let Some(seed) = self.seed {
            config.training.seed = seed;
        }
        if let Some(file) = &self.log_file {
            config.logging.file = Some(file.clone());
        }
        if self.cpu {
            config.runtime.use_gpu = false;
        }
    }

    /// Checkpoints go next to the exported adapter.
    pub fn output_dir(&self) -> PathBuf {
        match self.output_file.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => Path::new(".").to_path_buf(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_arguments() {
        assert!(TrainLoraArgs::try_parse_from(["train_lora", "q.jsonl", "out.safetensors"]).is_err());
        let args = TrainLoraArgs::try_parse_from([
            "train_lora",
            "q.jsonl",
            "out/adapter.safetensors",
            "--base-model",
            "Qwen/Qwen2.5-1.5B-Instruct",
        ])
        .expect("test: parse");
        assert_eq!(args.queue_file, PathBuf::from("q.jsonl"));
        assert_eq!(args.output_dir(), PathBuf::from("out"));
        assert!(args.rank.is_none());
        assert!(!args.cpu);
    }

    #[test]
    fn test_flags_override_config() {
        let args = TrainLoraArgs::try_parse_from([
            "train_lora",
            "q.jsonl",
            "adapter.safetensors",
            "--base-model",
            "m",
            "--rank",
            "8",
            "--alpha",
            "16",
            "--epochs",
            "1",
            "--batch-size",
            "2",
            "--learning-rate",
            "3e-4",
            "--cpu",
        ])
        .expect("test: parse");

        let mut config = TrainConfig::default();
        args.apply_to(&mut config);
        assert_eq!(config.lora.rank, 8);
        assert_eq!(config.lora.alpha, 16.0);
        assert_eq!(config.lora.dropout, 0.05);
        assert_eq!(config.training.epochs, 1);
        assert_eq!(config.training.batch_size, 2);
        assert!((config.training.learning_rate - 3e-4).abs() < 1e-12);
        assert!(!config.runtime.use_gpu);
        assert_eq!(args.output_dir(), PathBuf::from("."));
    }
}

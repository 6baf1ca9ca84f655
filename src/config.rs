//! Configuration management for train_lora.
//!
//! Settings are layered, later sources overriding earlier ones:
//! 1. Built-in defaults (`config/default.toml`, embedded in the binary)
//! 2. An optional user TOML file (`--config` or `$TRAIN_LORA_CONFIG`)
//! 3. Environment variables `TRAIN_LORA__<SECTION>__<KEY>`,
//!    e.g. `TRAIN_LORA__TRAINING__EPOCHS=5`
//! 4. Command-line flags, applied by the CLI after loading

use crate::error::Result;
use crate::lora::LoRAConfig;
use crate::training::TrainingArguments;
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");
const ENV_PREFIX: &str = "TRAIN_LORA";

/// Complete settings for one training run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    #[serde(default)]
    pub lora: LoRAConfig,
    #[serde(default)]
    pub training: TrainingArguments,
    #[serde(default)]
    pub runtime: RuntimeSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Device selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeSettings {
    /// Use CUDA or Metal when available
    #[serde(default = "default_true")]
    pub use_gpu: bool,
    /// F16 base weights on accelerators
    #[serde(default = "default_true")]
    pub mixed_precision: bool,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            use_gpu: true,
            mixed_precision: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Also write logs to this file
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

impl TrainConfig {
    /// Load defaults, the optional config file and the process environment.
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        Self::load_with_env(config_file, None)
    }

    /// Like [`TrainConfig::load`], reading variables from `env` instead of the
    /// process environment when given.
    pub fn load_with_env(
        config_file: Option<&Path>,
        env: Option<HashMap<String, String>>,
    ) -> Result<Self> {
        let mut builder =
            Config::builder().add_source(File::from_str(DEFAULT_CONFIG, FileFormat::Toml));

        if let Some(path) = config_file {
            builder = builder.add_source(File::from(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("lora.target_modules")
                .try_parsing(true)
                .source(env),
        );

        let config: TrainConfig = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.lora.validate()?;
        self.training.validate()
    }
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn no_env() -> Option<HashMap<String, String>> {
        Some(HashMap::new())
    }

    #[test]
    fn test_embedded_defaults_match_code() {
        let config = TrainConfig::load_with_env(None, no_env()).expect("test: load");
        assert_eq!(config, TrainConfig::default());
        assert_eq!(config.lora.rank, 16);
        assert_eq!(config.training.epochs, 3);
        assert_eq!(config.training.max_length, 512);
        assert_eq!(config.training.system_prompt, "You are Qwen, a helpful AI assistant.");
        config.validate().expect("test: defaults are valid");
    }

    #[test]
    fn test_file_overrides_defaults() {
        let dir = tempdir().expect("test: tempdir");
        let path = dir.path().join("train.toml");
        fs::write(
            &path,
            "[training]\nepochs = 7\n\n[lora]\nrank = 8\ntarget_modules = [\"q_proj\"]\n",
        )
        .expect("test: write");

        let config = TrainConfig::load_with_env(Some(&path), no_env()).expect("test: load");
        assert_eq!(config.training.epochs, 7);
        assert_eq!(config.training.batch_size, 4);
        assert_eq!(config.lora.rank, 8);
        assert_eq!(config.lora.target_modules, vec!["q_proj".to_string()]);
    }

    #[test]
    fn test_environment_overrides_file() {
        let dir = tempdir().expect("test: tempdir");
        let path = dir.path().join("train.toml");
        fs::write(&path, "[training]\nepochs = 7\n").expect("test: write");

        let env = HashMap::from([
            ("TRAIN_LORA__TRAINING__EPOCHS".to_string(), "9".to_string()),
            ("TRAIN_LORA__TRAINING__LEARNING_RATE".to_string(), "0.0005".to_string()),
            ("TRAIN_LORA__RUNTIME__USE_GPU".to_string(), "false".to_string()),
            ("TRAIN_LORA__LORA__TARGET_MODULES".to_string(), "q_proj,v_proj".to_string()),
        ]);
        let config = TrainConfig::load_with_env(Some(&path), Some(env)).expect("test: load");
        assert_eq!(config.training.epochs, 9);
        assert!((config.training.learning_rate - 5e-4).abs() < 1e-12);
        assert!(!config.runtime.use_gpu);
        assert_eq!(config.lora.target_modules, vec!["q_proj", "v_proj"]);
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let dir = tempdir().expect("test: tempdir");
        let result = TrainConfig::load_with_env(Some(&dir.path().join("nope.toml")), no_env());
        assert!(result.is_err());
    }
}

//! Decoder-only transformer configuration (Qwen2 / Llama family) read from config.json

use crate::error::{Result, TrainError};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_model_type")]
    pub model_type: String,
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    /// Fewer than `num_attention_heads` for grouped-query attention
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,
    #[serde(default)]
    pub head_dim: Option<usize>,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default)]
    pub tie_word_embeddings: bool,
    #[serde(default = "default_hidden_act")]
    pub hidden_act: String,
}

fn default_model_type() -> String {
    "qwen2".to_string()
}

fn default_rms_norm_eps() -> f64 {
    1e-6
}

fn default_rope_theta() -> f64 {
    10_000.0
}

fn default_max_position_embeddings() -> usize {
    32_768
}

fn default_hidden_act() -> String {
    "silu".to_string()
}

impl ModelConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: ModelConfig = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn num_kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
            .unwrap_or(self.hidden_size / self.num_attention_heads)
    }

    /// Query heads sharing each key/value head.
    pub fn gqa_groups(&self) -> usize {
        self.num_attention_heads / self.num_kv_heads()
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_attention_heads == 0 || self.num_hidden_layers == 0 {
            return Err(TrainError::InvalidConfig(
                "model config must have at least one layer and one attention head".into(),
            ));
        }
        if self.num_attention_heads % self.num_kv_heads() != 0 {
            return Err(TrainError::InvalidConfig(format!(
                "{} attention heads cannot be grouped over {} key/value heads",
                self.num_attention_heads,
                self.num_kv_heads()
            )));
        }
        if self.head_dim() % 2 != 0 {
            return Err(TrainError::InvalidConfig(format!(
                "rotary embeddings need an even head dim, got {}",
                self.head_dim()
            )));
        }
        if self.hidden_act != "silu" {
            return Err(TrainError::InvalidConfig(format!(
                "unsupported activation '{}', only silu MLPs are supported",
                self.hidden_act
            )));
        }
        Ok(())
    }
}

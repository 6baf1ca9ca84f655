//! Low-rank adaptation of linear projections.
//!
//! [`LoRAConfig`] is the single description of an adapter. [`LoraLinear`]
//! wraps a frozen projection and adds the trainable `B @ A` path for the
//! modules named in `target_modules`.

pub mod linear;

use crate::error::{Result, TrainError};
use serde::{Deserialize, Serialize};

pub use linear::{LoraLinear, LoraWeights};

/// Attention projections adapted by default.
pub const DEFAULT_TARGET_MODULES: [&str; 4] = ["q_proj", "v_proj", "k_proj", "o_proj"];

/// LoRA configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoRAConfig {
    /// Low-rank dimension (r in the paper)
    pub rank: usize,
    /// Scaling numerator; the adapter output is multiplied by alpha / rank
    pub alpha: f64,
    /// Dropout applied to the adapter input while training
    pub dropout: f32,
    /// Module names to apply LoRA to
    pub target_modules: Vec<String>,
    pub bias: LoraBias,
}

impl Default for LoRAConfig {
    fn default() -> Self {
        Self {
            rank: 16,
            alpha: 32.0,
            dropout: 0.05,
            target_modules: DEFAULT_TARGET_MODULES.iter().map(|m| m.to_string()).collect(),
            bias: LoraBias::None,
        }
    }
}

/// Which bias terms are trained alongside the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoraBias {
    #[default]
    None,
}

impl LoRAConfig {
    pub fn scaling(&self) -> f64 {
        self.alpha / self.rank as f64
    }

    /// Whether the projection called `module` (e.g. `q_proj`) gets an adapter.
    pub fn targets(&self, module: &str) -> bool {
        self.target_modules.iter().any(|t| t == module)
    }

    pub fn validate(&self) -> Result<()> {
        if self.rank == 0 {
            return Err(TrainError::InvalidConfig("LoRA rank must be positive".into()));
        }
        if !(self.alpha.is_finite() && self.alpha > 0.0) {
            return Err(TrainError::InvalidConfig(format!(
                "LoRA alpha must be positive, got {}",
                self.alpha
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(TrainError::InvalidConfig(format!(
                "LoRA dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        if self.target_modules.is_empty() {
            return Err(TrainError::InvalidConfig(
                "LoRA needs at least one target module".into(),
            ));
        }
        Ok(())
    }

    /// The `adapter_config.json` document written next to checkpoint weights.
    pub fn to_peft_config(&self, base_model: &str) -> PeftAdapterConfig {
        PeftAdapterConfig {
            peft_type: "LORA".to_string(),
            task_type: "CAUSAL_LM".to_string(),
            base_model_name_or_path: base_model.to_string(),
            r: self.rank,
            lora_alpha: self.alpha,
            lora_dropout: self.dropout,
            target_modules: self.target_modules.clone(),
            bias: self.bias,
            inference_mode: false,
        }
    }
}

/// Adapter metadata in the layout consumed by PEFT-compatible loaders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeftAdapterConfig {
    pub peft_type: String,
    pub task_type: String,
    pub base_model_name_or_path: String,
    pub r: usize,
    pub lora_alpha: f64,
    pub lora_dropout: f32,
    pub target_modules: Vec<String>,
    pub bias: LoraBias,
    pub inference_mode: bool,
}

//! Weighted LoRA fine-tuning for Qwen-style causal language models.
//!
//! The pipeline reads a JSONL queue of weighted query/response pairs, renders
//! each pair through the base model's chat template, oversamples heavy
//! examples, trains low-rank adapters on the attention projections of a frozen
//! base model and exports only the adapter tensors as PEFT-compatible
//! safetensors.

pub mod cli;
pub mod config;
pub mod error;
pub mod lora;
pub mod runtime;
pub mod training;

pub use config::TrainConfig;
pub use error::{Result, TrainError};
pub use lora::{LoRAConfig, LoraBias, PeftAdapterConfig};
pub use runtime::{CausalLanguageModel, ChatTokenizer, HfChatTokenizer, LoraCausalLM};
pub use training::{
    export_adapter, load_adapter, load_training_records, AdapterStats, LoRATrainer,
    TrainingArguments, TrainingRecord, WeightedDataset, WeightedSampler,
};

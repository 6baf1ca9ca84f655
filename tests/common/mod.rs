//! Common test utilities: a tiny on-disk Qwen2-style model and queue files

#![allow(dead_code)]

use candle_core::{DType, Device, Tensor};
use lora_train_core::cli::TrainLoraArgs;
use lora_train_core::config::TrainConfig;
use lora_train_core::{LoRAConfig, TrainingArguments};
use std::collections::HashMap;
use std::error::Error;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use tokenizers::models::wordlevel::WordLevel;
use tokenizers::pre_tokenizers::whitespace::Whitespace;
use tokenizers::{AddedToken, Tokenizer};

pub const VOCAB_SIZE: usize = 32;
pub const HIDDEN_SIZE: usize = 16;
pub const NUM_LAYERS: usize = 2;

const WORDS: [&str; 22] = [
    "<unk>", "<pad>", "<eos>", "<|im_start|>", "<|im_end|>", "system", "user", "assistant",
    "You", "are", "Qwen", ",", "a", "helpful", "AI", ".", "hi", "hello", "how", "is", "the",
    "weather",
];

/// Write config.json, tokenizer files and random safetensors weights for a
/// two-layer model into `dir/model`.
pub fn create_tiny_model(dir: &Path) -> Result<PathBuf, Box<dyn Error + Send + Sync>> {
    let model_dir = dir.join("model");
    fs::create_dir_all(&model_dir)?;

    let config = serde_json::json!({
        "model_type": "qwen2",
        "vocab_size": VOCAB_SIZE,
        "hidden_size": HIDDEN_SIZE,
        "intermediate_size": 32,
        "num_hidden_layers": NUM_LAYERS,
        "num_attention_heads": 4,
        "num_key_value_heads": 2,
        "rms_norm_eps": 1e-6,
        "rope_theta": 10000.0,
        "max_position_embeddings": 128,
        "tie_word_embeddings": true,
        "hidden_act": "silu"
    });
    fs::write(model_dir.join("config.json"), serde_json::to_string_pretty(&config)?)?;

    let vocab: HashMap<String, u32> = WORDS
        .iter()
        .enumerate()
        .map(|(i, w)| (w.to_string(), i as u32))
        .collect();
    let model = WordLevel::builder()
        .vocab(vocab)
        .unk_token("<unk>".to_string())
        .build()?;
    let mut tokenizer = Tokenizer::new(model);
    tokenizer.with_pre_tokenizer(Some(Whitespace::default()));
    let special: Vec<AddedToken> = ["<|im_start|>", "<|im_end|>", "<pad>", "<eos>"]
        .iter()
        .map(|t| AddedToken::from(t.to_string(), true))
        .collect();
    tokenizer.add_special_tokens(&special);
    tokenizer.save(model_dir.join("tokenizer.json"), false)?;

    let tokenizer_config = serde_json::json!({
        "eos_token": "<eos>",
        "pad_token": "<pad>",
    });
    fs::write(
        model_dir.join("tokenizer_config.json"),
        serde_json::to_string(&tokenizer_config)?,
    )?;

    candle_core::safetensors::save(&random_weights()?, model_dir.join("model.safetensors"))?;
    Ok(model_dir)
}

fn random_weights() -> Result<HashMap<String, Tensor>, Box<dyn Error + Send + Sync>> {
    let device = Device::Cpu;
    let h = HIDDEN_SIZE;
    let kv = 8;
    let inter = 32;
    let randn = |rows: usize, cols: usize| Tensor::randn(0f32, 0.2, (rows, cols), &device);

    let mut w = HashMap::new();
    w.insert("model.embed_tokens.weight".to_string(), randn(VOCAB_SIZE, h)?);
    w.insert("model.norm.weight".to_string(), Tensor::ones(h, DType::F32, &device)?);
    for l in 0..NUM_LAYERS {
        let p = format!("model.layers.{l}");
        w.insert(format!("{p}.input_layernorm.weight"), Tensor::ones(h, DType::F32, &device)?);
        w.insert(
            format!("{p}.post_attention_layernorm.weight"),
            Tensor::ones(h, DType::F32, &device)?,
        );
        w.insert(format!("{p}.self_attn.q_proj.weight"), randn(h, h)?);
        w.insert(format!("{p}.self_attn.q_proj.bias"), Tensor::zeros(h, DType::F32, &device)?);
        w.insert(format!("{p}.self_attn.k_proj.weight"), randn(kv, h)?);
        w.insert(format!("{p}.self_attn.k_proj.bias"), Tensor::zeros(kv, DType::F32, &device)?);
        w.insert(format!("{p}.self_attn.v_proj.weight"), randn(kv, h)?);
        w.insert(format!("{p}.self_attn.v_proj.bias"), Tensor::zeros(kv, DType::F32, &device)?);
        w.insert(format!("{p}.self_attn.o_proj.weight"), randn(h, h)?);
        w.insert(format!("{p}.mlp.gate_proj.weight"), randn(inter, h)?);
        w.insert(format!("{p}.mlp.up_proj.weight"), randn(inter, h)?);
        w.insert(format!("{p}.mlp.down_proj.weight"), randn(h, inter)?);
    }
    Ok(w)
}

/// Write `lines` as a JSONL queue file.
pub fn write_queue(dir: &Path, lines: &[&str]) -> Result<PathBuf, Box<dyn Error + Send + Sync>> {
    let path = dir.join("training_queue.jsonl");
    fs::write(&path, lines.join("\n") + "\n")?;
    Ok(path)
}

pub fn sample_queue_lines() -> Vec<&'static str> {
    vec![
        r#"{"query": "hi", "response": "hello", "weight": 10}"#,
        r#"{"query": "how is the weather", "response": "hello", "weight": 3}"#,
        r#"{"query": "hi hi", "response": "hello hello"}"#,
    ]
}

/// A small, CPU-only configuration that trains in well under a second.
pub fn test_config() -> TrainConfig {
    let mut config = TrainConfig::default();
    config.lora = LoRAConfig {
        rank: 4,
        alpha: 8.0,
        dropout: 0.0,
        ..Default::default()
    };
    config.training = TrainingArguments {
        epochs: 1,
        batch_size: 2,
        learning_rate: 1e-2,
        warmup_steps: 1,
        logging_steps: 1,
        max_length: 24,
        ..Default::default()
    };
    config.runtime.use_gpu = false;
    config
}

pub fn parse_args(queue: &Path, output: &Path, model_dir: &Path, extra: &[&str]) -> TrainLoraArgs {
    use clap::Parser;

    let mut argv: Vec<OsString> = vec![
        "train_lora".into(),
        queue.into(),
        output.into(),
        "--base-model".into(),
        model_dir.into(),
        "--cpu".into(),
    ];
    argv.extend(extra.iter().map(OsString::from));
    TrainLoraArgs::parse_from(argv)
}

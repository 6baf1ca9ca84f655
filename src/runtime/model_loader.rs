//! Locating base model assets and loading their weights
//!
//! A base model is either a local directory or a Hugging Face hub id. Hub
//! files are fetched through `hf-hub`, which serves them from the local hub
//! cache and only downloads on a miss.

use super::model_config::ModelConfig;
use crate::error::{Result, TrainError};
use candle_core::{Device, Tensor};
use hf_hub::api::sync::{Api, ApiRepo};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const WEIGHT_INDEX_FILE: &str = "model.safetensors.index.json";

/// Files making up a base model checkpoint.
#[derive(Debug, Clone)]
pub struct BaseModelFiles {
    /// Name as given on the command line
    pub name: String,
    pub dir: PathBuf,
    pub config: ModelConfig,
    /// Safetensors shards in load order
    pub weight_files: Vec<PathBuf>,
}

impl BaseModelFiles {
    pub fn tokenizer_dir(&self) -> &Path {
        &self.dir
    }
}

/// Resolve `name` to a directory holding config.json, tokenizer.json and
/// safetensors weights, fetching hub ids that are not cached yet.
pub fn resolve_base_model(name: &str) -> Result<BaseModelFiles> {
    let local = PathBuf::from(name);
    let dir = if local.is_dir() {
        local
    } else if looks_like_path(name) {
        return Err(TrainError::environment(
            format!("Base model directory not found: {}", name),
            install_hint(name),
        ));
    } else {
        fetch_from_hub(name)?
    };

    let missing: Vec<&str> = ["config.json", "tokenizer.json"]
        .into_iter()
        .filter(|f| !dir.join(f).is_file())
        .collect();
    if !missing.is_empty() {
        return Err(TrainError::environment(
            format!(
                "Base model directory {} is missing {}",
                dir.display(),
                missing.join(", ")
            ),
            install_hint(name),
        ));
    }

    let weight_files = find_weight_files(&dir)?;
    if weight_files.is_empty() {
        return Err(TrainError::environment(
            format!("No .safetensors weights found in {}", dir.display()),
            install_hint(name),
        ));
    }

    let config = ModelConfig::from_file(&dir.join("config.json"))?;
    info!(
        "Resolved base model {} at {} ({} weight files)",
        name,
        dir.display(),
        weight_files.len()
    );

    Ok(BaseModelFiles {
        name: name.to_string(),
        dir,
        config,
        weight_files,
    })
}

fn install_hint(name: &str) -> String {
    format!(
        "Check the model id and your network access, or download it first, e.g.\n  \
         huggingface-cli download {} --include '*.json' '*.safetensors'\n\
         or pass --base-model a local directory containing config.json, tokenizer.json and *.safetensors",
        name
    )
}

/// Hub ids are `name` or `org/name`; anything else is meant as a filesystem path.
fn looks_like_path(name: &str) -> bool {
    let path = Path::new(name);
    path.is_absolute()
        || name.starts_with('.')
        || name.starts_with('~')
        || name.contains('\\')
        || name.split('/').count() > 2
        || name.split('/').any(str::is_empty)
}

/// Fetch a hub repository's config, tokenizer and weights into the hub cache
/// and return the snapshot directory holding them.
fn fetch_from_hub(repo_id: &str) -> Result<PathBuf> {
    let hub_error = |file: &str, e: hf_hub::api::sync::ApiError| {
        TrainError::environment(
            format!("Failed to fetch {} for base model {}: {}", file, repo_id, e),
            install_hint(repo_id),
        )
    };

    let api = Api::new().map_err(|e| hub_error("hub client", e))?;
    let repo = api.model(repo_id.to_string());
    info!("Fetching base model {} from the Hugging Face hub cache", repo_id);

    let config_path = repo
        .get("config.json")
        .map_err(|e| hub_error("config.json", e))?;
    repo.get("tokenizer.json")
        .map_err(|e| hub_error("tokenizer.json", e))?;
    if let Err(e) = repo.get("tokenizer_config.json") {
        warn!("No tokenizer_config.json for {}: {}", repo_id, e);
    }

    for shard in hub_weight_files(&repo).map_err(|(file, e)| hub_error(&file, e))? {
        debug!("Fetched {}", shard.display());
    }

    config_path
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| {
            TrainError::environment(
                format!("Unexpected hub cache path {}", config_path.display()),
                install_hint(repo_id),
            )
        })
}

/// The sharded index and its shards when present, else `model.safetensors`.
fn hub_weight_files(
    repo: &ApiRepo,
) -> std::result::Result<Vec<PathBuf>, (String, hf_hub::api::sync::ApiError)> {
    let index_path = match repo.get(WEIGHT_INDEX_FILE) {
        Ok(path) => path,
        Err(_) => {
            let single = repo
                .get("model.safetensors")
                .map_err(|e| ("model.safetensors".to_string(), e))?;
            return Ok(vec![single]);
        }
    };

    let shards = std::fs::read_to_string(&index_path)
        .ok()
        .map(|content| shard_names(&content))
        .unwrap_or_default();
    shards
        .into_iter()
        .map(|shard| repo.get(&shard).map_err(|e| (shard, e)))
        .collect()
}

/// Distinct shard file names from a `model.safetensors.index.json` document.
fn shard_names(index: &str) -> Vec<String> {
    let mut shards: Vec<String> = serde_json::from_str::<serde_json::Value>(index)
        .ok()
        .and_then(|index| {
            index.get("weight_map").and_then(|m| m.as_object()).map(|m| {
                m.values()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
        })
        .unwrap_or_default();
    shards.sort();
    shards.dedup();
    shards
}

/// Shards listed in `model.safetensors.index.json`, else every `*.safetensors` file.
fn find_weight_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let index_path = dir.join(WEIGHT_INDEX_FILE);
    if index_path.is_file() {
        let content = std::fs::read_to_string(&index_path)?;
        // Validate the document before trusting an empty shard list
        serde_json::from_str::<serde_json::Value>(&content)?;
        return Ok(shard_names(&content)
            .into_iter()
            .map(|s| dir.join(s))
            .collect());
    }

    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().and_then(|e| e.to_str()) == Some("safetensors"))
        .collect();
    files.sort();
    Ok(files)
}

/// Load every tensor from the given safetensors files onto `device`.
pub fn load_weights(files: &[PathBuf], device: &Device) -> Result<HashMap<String, Tensor>> {
    let mut weights = HashMap::new();
    for file in files {
        let shard = candle_core::safetensors::load(file, device)?;
        debug!("Loaded {} tensors from {}", shard.len(), file.display());
        weights.extend(shard);
    }
    Ok(weights)
}

/// CUDA, then Metal, when allowed and compiled in; otherwise the CPU.
pub fn select_device(use_gpu: bool) -> Result<Device> {
    if use_gpu {
        if candle_core::utils::cuda_is_available() {
            info!("Using CUDA GPU acceleration");
            return Ok(Device::new_cuda(0)?);
        }
        if candle_core::utils::metal_is_available() {
            info!("Using Metal GPU acceleration");
            return Ok(Device::new_metal(0)?);
        }
    }
    info!("Using CPU");
    Ok(Device::Cpu)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const TINY_CONFIG: &str = r#"{"vocab_size": 8, "hidden_size": 4, "intermediate_size": 8,
        "num_hidden_layers": 1, "num_attention_heads": 2}"#;

    #[test]
    fn test_missing_model_is_environment_error() {
        let err = resolve_base_model("/nonexistent/definitely/not/a/model")
            .expect_err("test: should fail");
        assert!(err.is_environment());
        assert!(err.hint().expect("test: hint").contains("huggingface-cli download"));
    }

    #[test]
    fn test_local_dir_missing_tokenizer() {
        let dir = tempdir().expect("test: create temp dir");
        std::fs::write(dir.path().join("config.json"), TINY_CONFIG).expect("test: write");

        let err = resolve_base_model(dir.path().to_str().expect("test: utf8"))
            .expect_err("test: should fail");
        assert!(err.is_environment());
        assert!(err.to_string().contains("tokenizer.json"));
    }

    #[test]
    fn test_local_dir_without_weights() {
        let dir = tempdir().expect("test: create temp dir");
        std::fs::write(dir.path().join("config.json"), TINY_CONFIG).expect("test: write");
        std::fs::write(dir.path().join("tokenizer.json"), "{}").expect("test: write");

        let err = resolve_base_model(dir.path().to_str().expect("test: utf8"))
            .expect_err("test: should fail");
        assert!(err.to_string().contains(".safetensors"));
    }

    #[test]
    fn test_path_like_names_skip_the_hub() {
        assert!(looks_like_path("/models/qwen"));
        assert!(looks_like_path("./qwen"));
        assert!(looks_like_path("~/models/qwen"));
        assert!(looks_like_path("models/qwen/snapshot"));
        assert!(looks_like_path("Qwen/"));
        assert!(!looks_like_path("Qwen/Qwen2.5-0.5B-Instruct"));
        assert!(!looks_like_path("gpt2"));
    }

    #[test]
    fn test_shard_names_dedup() {
        let names = shard_names(
            r#"{"weight_map": {"a": "model-00002-of-00002.safetensors",
                               "b": "model-00001-of-00002.safetensors",
                               "c": "model-00001-of-00002.safetensors"}}"#,
        );
        assert_eq!(
            names,
            vec![
                "model-00001-of-00002.safetensors".to_string(),
                "model-00002-of-00002.safetensors".to_string()
            ]
        );
        assert!(shard_names("not json").is_empty());
    }

    #[test]
    fn test_sharded_index() {
        let dir = tempdir().expect("test: create temp dir");
        std::fs::write(
            dir.path().join("model.safetensors.index.json"),
            r#"{"weight_map": {"a": "model-00002-of-00002.safetensors",
                               "b": "model-00001-of-00002.safetensors",
                               "c": "model-00001-of-00002.safetensors"}}"#,
        )
        .expect("test: write");
        let files = find_weight_files(dir.path()).expect("test: shards");
        assert_eq!(files.len(), 2);
        assert!(files[0].ends_with("model-00001-of-00002.safetensors"));
    }

    #[test]
    fn test_cpu_device_when_gpu_disabled() {
        let device = select_device(false).expect("test: device");
        assert!(device.is_cpu());
    }
}

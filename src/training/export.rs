//! Adapter export to safetensors
//!
//! Only parameters whose name contains `lora` are written, keyed by their
//! PEFT names, so the file loads directly as a PEFT adapter.

use crate::error::Result;
use crate::runtime::CausalLanguageModel;
use candle_core::{Device, Tensor};
use safetensors::SafeTensors;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// Counts for an exported (or about to be exported) adapter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdapterStats {
    pub tensors: usize,
    pub parameters: usize,
    pub size_mb: f64,
}

impl AdapterStats {
    pub fn from_state(state: &BTreeMap<String, Tensor>) -> Self {
        let mut parameters = 0;
        let mut bytes = 0;
        for tensor in state.values() {
            parameters += tensor.elem_count();
            bytes += tensor.elem_count() * tensor.dtype().size_in_bytes();
        }
        Self {
            tensors: state.len(),
            parameters,
            size_mb: bytes as f64 / (1024.0 * 1024.0),
        }
    }
}

fn is_adapter_parameter(name: &str) -> bool {
    name.to_lowercase().contains("lora")
}

// Detached host copy that no longer aliases the live variable storage
fn to_host(tensor: &Tensor) -> Result<Tensor> {
    let detached = tensor.detach();
    let host = match detached.device() {
        Device::Cpu => detached.copy()?,
        _ => detached.to_device(&Device::Cpu)?,
    };
    Ok(host)
}

/// Snapshot of every adapter parameter, moved to the CPU.
pub fn collect_adapter_state(model: &dyn CausalLanguageModel) -> Result<BTreeMap<String, Tensor>> {
    let mut state = BTreeMap::new();
    for (name, tensor) in model.named_parameters()? {
        if is_adapter_parameter(&name) {
            state.insert(name, to_host(&tensor)?);
        }
    }
    debug!("Collected {} adapter tensors", state.len());
    Ok(state)
}

/// Write an adapter state to `path` with one safetensors save.
pub fn save_adapter_state(state: &BTreeMap<String, Tensor>, path: &Path) -> Result<AdapterStats> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let tensors: HashMap<&str, Tensor> = state
        .iter()
        .map(|(name, tensor)| (name.as_str(), tensor.clone()))
        .collect();
    candle_core::safetensors::save(&tensors, path)?;

    Ok(AdapterStats::from_state(state))
}

/// Collect the adapter parameters of `model` and save them to `path`.
pub fn export_adapter(model: &dyn CausalLanguageModel, path: &Path) -> Result<AdapterStats> {
    let state = collect_adapter_state(model)?;
    let stats = save_adapter_state(&state, path)?;
    info!(
        "Exported {} adapter tensors ({} parameters) to {}",
        stats.tensors,
        stats.parameters,
        path.display()
    );
    Ok(stats)
}

/// Read an adapter file back onto the CPU.
pub fn load_adapter(path: &Path) -> Result<HashMap<String, Tensor>> {
    Ok(candle_core::safetensors::load(path, &Device::Cpu)?)
}

/// Parse the safetensors header and payload without building tensors.
pub fn inspect_adapter(path: &Path) -> Result<AdapterStats> {
    let bytes = fs::read(path)?;
    let file = SafeTensors::deserialize(&bytes)?;

    let mut parameters = 0;
    let mut data_bytes = 0;
    let names = file.names();
    for name in &names {
        let view = file.tensor(name)?;
        parameters += view.shape().iter().product::<usize>();
        data_bytes += view.data().len();
    }

    Ok(AdapterStats {
        tensors: names.len(),
        parameters,
        size_mb: data_bytes as f64 / (1024.0 * 1024.0),
    })
}

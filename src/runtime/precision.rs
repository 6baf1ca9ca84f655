//! Precision management for mixed-precision LoRA training
//!
//! The frozen base model may run in half precision on an accelerator while
//! adapter weights, optimizer state and the loss stay in F32.

use candle_core::{DType, Device, Tensor};
use std::fmt;

/// Precision modes for different hardware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrecisionMode {
    /// F16 base weights with F32 adapter and loss
    FP16Mixed,
    /// F32 for everything
    FP32Full,
}

/// Precision configuration for models and training
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrecisionConfig {
    pub mode: PrecisionMode,
    /// Base model weights and activations
    pub base_model_dtype: DType,
    /// LoRA adapter weights (never below F32)
    pub lora_adapter_dtype: DType,
    /// Attention softmax and loss accumulation
    pub compute_dtype: DType,
}

impl PrecisionConfig {
    pub fn from_mode(mode: PrecisionMode) -> Self {
        match mode {
            PrecisionMode::FP16Mixed => Self {
                mode,
                base_model_dtype: DType::F16,
                lora_adapter_dtype: DType::F32,
                compute_dtype: DType::F32,
            },
            PrecisionMode::FP32Full => Self {
                mode,
                base_model_dtype: DType::F32,
                lora_adapter_dtype: DType::F32,
                compute_dtype: DType::F32,
            },
        }
    }

    /// Mixed precision on an accelerator when enabled, full precision otherwise.
    pub fn for_device(device: &Device, mixed_precision: bool) -> Self {
        if mixed_precision && !device.is_cpu() {
            Self::from_mode(PrecisionMode::FP16Mixed)
        } else {
            Self::from_mode(PrecisionMode::FP32Full)
        }
    }

    pub fn is_mixed(&self) -> bool {
        self.mode == PrecisionMode::FP16Mixed
    }

    /// Convert a base-model tensor to the configured precision.
    pub fn to_base(&self, tensor: &Tensor) -> candle_core::Result<Tensor> {
        if tensor.dtype() == self.base_model_dtype {
            Ok(tensor.clone())
        } else {
            tensor.to_dtype(self.base_model_dtype)
        }
    }
}

impl fmt::Display for PrecisionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "base={:?} adapter={:?} compute={:?}",
            self.base_model_dtype, self.lora_adapter_dtype, self.compute_dtype
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_is_full_precision() {
        let config = PrecisionConfig::for_device(&Device::Cpu, true);
        assert_eq!(config.mode, PrecisionMode::FP32Full);
        assert_eq!(config.base_model_dtype, DType::F32);
        assert!(!config.is_mixed());
    }

    #[test]
    fn test_mixed_keeps_adapter_in_f32() {
        let config = PrecisionConfig::from_mode(PrecisionMode::FP16Mixed);
        assert_eq!(config.base_model_dtype, DType::F16);
        assert_eq!(config.lora_adapter_dtype, DType::F32);
        assert_eq!(config.compute_dtype, DType::F32);
    }

    #[test]
    fn test_to_base_converts() {
        let config = PrecisionConfig::from_mode(PrecisionMode::FP32Full);
        let t = Tensor::zeros(3, DType::F16, &Device::Cpu).expect("test: tensor");
        let t = config.to_base(&t).expect("test: convert");
        assert_eq!(t.dtype(), DType::F32);
    }
}

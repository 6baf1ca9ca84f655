//! Frozen linear projection with an optional trainable low-rank path

use super::LoRAConfig;
use crate::error::{Result, TrainError};
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::VarMap;
use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;

/// Trainable LoRA matrices for one projection.
///
/// `a` is `[rank, in_features]`, `b` is `[out_features, rank]`, both in the
/// adapter dtype and registered in the model's [`VarMap`] under PEFT names.
#[derive(Debug, Clone)]
pub struct LoraWeights {
    pub a: Tensor,
    pub b: Tensor,
    scaling: f64,
    dropout: f32,
}

impl LoraWeights {
    /// Create adapter matrices for the module at `prefix`
    /// (e.g. `base_model.model.model.layers.0.self_attn.q_proj`).
    ///
    /// A uses Kaiming uniform with a = sqrt(5), which bounds it by
    /// 1/sqrt(in_features); B starts at zero so the adapter is a no-op until trained.
    pub fn new(
        varmap: &VarMap,
        prefix: &str,
        in_features: usize,
        out_features: usize,
        config: &LoRAConfig,
        dtype: DType,
        rng: &mut StdRng,
        device: &Device,
    ) -> Result<Self> {
        let rank = config.rank;
        let bound = 1.0 / (in_features as f32).sqrt();
        let dist = Uniform::new_inclusive(-bound, bound);
        let a_init: Vec<f32> = (0..rank * in_features).map(|_| dist.sample(rng)).collect();

        let a_init = Tensor::from_vec(a_init, (rank, in_features), device)?.to_dtype(dtype)?;
        let a = Var::from_tensor(&a_init)?;
        let b = Var::zeros((out_features, rank), dtype, device)?;

        let a_tensor = a.as_tensor().clone();
        let b_tensor = b.as_tensor().clone();

        let mut vars = varmap
            .data()
            .lock()
            .map_err(|_| TrainError::Training("variable map lock poisoned".into()))?;
        vars.insert(format!("{prefix}.lora_A.default.weight"), a);
        vars.insert(format!("{prefix}.lora_B.default.weight"), b);

        Ok(Self {
            a: a_tensor,
            b: b_tensor,
            scaling: config.scaling(),
            dropout: config.dropout,
        })
    }

    /// `dropout(x) @ A^T @ B^T * scaling`, computed in the adapter dtype.
    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let mut x = x.to_dtype(self.dtype())?;
        if train && self.dropout > 0.0 {
            x = candle_nn::ops::dropout(&x, self.dropout)?;
        }
        let hidden = x.matmul(&self.a.t()?)?;
        let out = hidden.matmul(&self.b.t()?)?;
        Ok(out.affine(self.scaling, 0.0)?)
    }

    pub fn scaling(&self) -> f64 {
        self.scaling
    }

    pub fn dtype(&self) -> DType {
        self.a.dtype()
    }
}

/// Linear projection whose base weight never receives gradients.
#[derive(Debug, Clone)]
pub struct LoraLinear {
    /// Base weight in checkpoint layout `[out_features, in_features]`
    weight: Tensor,
    bias: Option<Tensor>,
    lora: Option<LoraWeights>,
}

impl LoraLinear {
    pub fn new(weight: Tensor, bias: Option<Tensor>, lora: Option<LoraWeights>) -> Result<Self> {
        if weight.rank() != 2 {
            return Err(TrainError::InvalidConfig(format!(
                "linear weight must be 2D, got shape {:?}",
                weight.dims()
            )));
        }
        Ok(Self { weight, bias, lora })
    }

    pub fn in_features(&self) -> usize {
        self.weight.dims()[1]
    }

    pub fn out_features(&self) -> usize {
        self.weight.dims()[0]
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    pub fn lora(&self) -> Option<&LoraWeights> {
        self.lora.as_ref()
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let dims = x.dims().to_vec();
        let in_features = self.in_features();
        let rows = x.elem_count() / in_features;

        // Flatten leading dims for a 2D matmul
        let x_2d = x.reshape((rows, in_features))?;
        let mut out = x_2d.matmul(&self.weight.t()?)?;
        if let Some(bias) = &self.bias {
            out = out.broadcast_add(bias)?;
        }
        if let Some(lora) = &self.lora {
            let delta = lora.forward(&x_2d, train)?.to_dtype(out.dtype())?;
            out = (out + delta)?;
        }

        let mut out_shape = dims;
        if let Some(last) = out_shape.last_mut() {
            *last = self.out_features();
        }
        Ok(out.reshape(out_shape)?)
    }
}

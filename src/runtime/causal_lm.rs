//! Decoder-only transformer (Qwen2 / Llama) with LoRA-adapted projections
//!
//! Base weights are plain tensors and never receive gradients; the only
//! [`Var`]s are the adapter matrices registered in the model's `VarMap`.
//! Parameter names follow the PEFT layout so an exported adapter loads in
//! runtimes that expect `base_model.model.<module>.lora_{A,B}.default.weight`.

use super::model_config::ModelConfig;
use super::model_loader::{load_weights, BaseModelFiles};
use super::precision::PrecisionConfig;
use crate::error::{Result, TrainError};
use crate::lora::{LoRAConfig, LoraLinear, LoraWeights};
use candle_core::{DType, Device, Tensor, Var, D};
use candle_nn::VarMap;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;
use tracing::{debug, info};

/// Prefix PEFT puts in front of every wrapped-model parameter.
pub const PEFT_PREFIX: &str = "base_model.model";

/// Additive attention bias for masked positions.
const MASK_VALUE: f64 = -1e9;

/// A causal language model the trainer can optimize.
pub trait CausalLanguageModel {
    /// Logits `[batch, seq, vocab]` in F32 for `input_ids` `[batch, seq]` (u32).
    fn forward(&self, input_ids: &Tensor, attention_mask: &Tensor, train: bool) -> Result<Tensor>;

    /// Parameters the optimizer updates.
    fn trainable_variables(&self) -> Vec<Var>;

    /// Every parameter, frozen and trainable, keyed by its PEFT name.
    fn named_parameters(&self) -> Result<Vec<(String, Tensor)>>;

    fn device(&self) -> &Device;
}

struct RmsNorm {
    weight: Tensor,
    eps: f64,
}

impl RmsNorm {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        // Normalize in F32 and scale in the weight dtype
        let dtype = x.dtype();
        let x = x.to_dtype(DType::F32)?;
        let rrms = x
            .sqr()?
            .mean_keepdim(D::Minus1)?
            .affine(1.0, self.eps)?
            .sqrt()?
            .recip()?;
        let normed = x.broadcast_mul(&rrms)?.to_dtype(dtype)?;
        Ok(normed.broadcast_mul(&self.weight)?)
    }
}

struct RotaryEmbedding {
    inv_freq: Vec<f32>,
}

impl RotaryEmbedding {
    fn new(head_dim: usize, theta: f64) -> Self {
        let inv_freq = (0..head_dim / 2)
            .map(|i| (1.0 / theta.powf(2.0 * i as f64 / head_dim as f64)) as f32)
            .collect();
        Self { inv_freq }
    }

    /// `cos`/`sin` tables `[seq_len, head_dim / 2]`.
    fn cos_sin(&self, seq_len: usize, device: &Device, dtype: DType) -> Result<(Tensor, Tensor)> {
        let half = self.inv_freq.len();
        let inv_freq = Tensor::from_vec(self.inv_freq.clone(), (1, half), device)?;
        let positions = Tensor::arange(0u32, seq_len as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((seq_len, 1))?;
        let freqs = positions.matmul(&inv_freq)?;
        Ok((freqs.cos()?.to_dtype(dtype)?, freqs.sin()?.to_dtype(dtype)?))
    }
}

/// Rotate the two halves of the head dim: (x1, x2) -> (x1 cos - x2 sin, x1 sin + x2 cos).
fn apply_rotary(x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
    // x: [batch, heads, seq, head_dim]
    let head_dim = x.dim(D::Minus1)?;
    let half = head_dim / 2;
    let x1 = x.narrow(D::Minus1, 0, half)?;
    let x2 = x.narrow(D::Minus1, half, half)?;

    let cos = cos.unsqueeze(0)?.unsqueeze(0)?;
    let sin = sin.unsqueeze(0)?.unsqueeze(0)?;

    let rotated_x1 = (x1.broadcast_mul(&cos)? - x2.broadcast_mul(&sin)?)?;
    let rotated_x2 = (x1.broadcast_mul(&sin)? + x2.broadcast_mul(&cos)?)?;
    Ok(Tensor::cat(&[rotated_x1, rotated_x2], D::Minus1)?)
}

/// Expand key/value heads for grouped-query attention.
fn repeat_kv(x: Tensor, groups: usize) -> Result<Tensor> {
    if groups == 1 {
        return Ok(x);
    }
    let (batch, kv_heads, seq, head_dim) = x.dims4()?;
    Ok(x.unsqueeze(2)?
        .expand((batch, kv_heads, groups, seq, head_dim))?
        .reshape((batch, kv_heads * groups, seq, head_dim))?)
}

/// Causal mask plus padding mask, `[batch, 1, seq, seq]` in F32.
fn attention_bias(attention_mask: &Tensor, device: &Device) -> Result<Tensor> {
    let (batch, seq) = attention_mask.dims2()?;
    let causal: Vec<f32> = (0..seq)
        .flat_map(|i| (0..seq).map(move |j| if j > i { MASK_VALUE as f32 } else { 0.0 }))
        .collect();
    let causal = Tensor::from_vec(causal, (1, 1, seq, seq), device)?;

    // mask 1 -> 0, mask 0 -> MASK_VALUE
    let padding = attention_mask
        .to_dtype(DType::F32)?
        .affine(-MASK_VALUE, MASK_VALUE)?
        .reshape((batch, 1, 1, seq))?;
    Ok(causal.broadcast_add(&padding)?)
}

struct Attention {
    q_proj: LoraLinear,
    k_proj: LoraLinear,
    v_proj: LoraLinear,
    o_proj: LoraLinear,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl Attention {
    fn forward(
        &self,
        x: &Tensor,
        cos: &Tensor,
        sin: &Tensor,
        bias: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        let (batch, seq, _) = x.dims3()?;

        // [batch, seq, heads * dim] -> [batch, heads, seq, dim]
        let q = self
            .q_proj
            .forward(x, train)?
            .reshape((batch, seq, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = self
            .k_proj
            .forward(x, train)?
            .reshape((batch, seq, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = self
            .v_proj
            .forward(x, train)?
            .reshape((batch, seq, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let q = apply_rotary(&q, cos, sin)?;
        let k = apply_rotary(&k, cos, sin)?;

        let groups = self.num_heads / self.num_kv_heads;
        let k = repeat_kv(k, groups)?;
        let v = repeat_kv(v, groups)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = q
            .matmul(&k.t()?)?
            .affine(scale, 0.0)?
            .to_dtype(DType::F32)?
            .broadcast_add(bias)?;
        let probs = candle_nn::ops::softmax(&scores, D::Minus1)?.to_dtype(v.dtype())?;

        let out = probs
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((batch, seq, self.num_heads * self.head_dim))?;
        self.o_proj.forward(&out, train)
    }
}

struct Mlp {
    gate_proj: LoraLinear,
    up_proj: LoraLinear,
    down_proj: LoraLinear,
}

impl Mlp {
    fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let gate = candle_nn::ops::silu(&self.gate_proj.forward(x, train)?)?;
        let up = self.up_proj.forward(x, train)?;
        self.down_proj.forward(&(gate * up)?, train)
    }
}

struct DecoderLayer {
    input_layernorm: RmsNorm,
    self_attn: Attention,
    post_attention_layernorm: RmsNorm,
    mlp: Mlp,
}

impl DecoderLayer {
    fn forward(
        &self,
        x: &Tensor,
        cos: &Tensor,
        sin: &Tensor,
        bias: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        let attn = self
            .self_attn
            .forward(&self.input_layernorm.forward(x)?, cos, sin, bias, train)?;
        let hidden = (x + attn)?;
        let mlp = self
            .mlp
            .forward(&self.post_attention_layernorm.forward(&hidden)?, train)?;
        Ok((hidden + mlp)?)
    }

    fn projections(&self) -> [(&'static str, &LoraLinear); 7] {
        [
            ("self_attn.q_proj", &self.self_attn.q_proj),
            ("self_attn.k_proj", &self.self_attn.k_proj),
            ("self_attn.v_proj", &self.self_attn.v_proj),
            ("self_attn.o_proj", &self.self_attn.o_proj),
            ("mlp.gate_proj", &self.mlp.gate_proj),
            ("mlp.up_proj", &self.mlp.up_proj),
            ("mlp.down_proj", &self.mlp.down_proj),
        ]
    }
}

/// Moves checkpoint tensors into model layers, attaching adapters as it goes.
struct WeightLoader<'a> {
    weights: HashMap<String, Tensor>,
    precision: &'a PrecisionConfig,
    device: &'a Device,
    lora: &'a LoRAConfig,
    varmap: &'a VarMap,
    rng: StdRng,
}

impl WeightLoader<'_> {
    fn take(&mut self, name: &str) -> Result<Tensor> {
        self.take_optional(name)?.ok_or_else(|| {
            TrainError::InvalidConfig(format!("base model checkpoint is missing tensor {}", name))
        })
    }

    fn take_optional(&mut self, name: &str) -> Result<Option<Tensor>> {
        match self.weights.remove(name) {
            Some(tensor) => {
                let tensor = self.precision.to_base(&tensor.to_device(self.device)?)?;
                Ok(Some(tensor))
            }
            None => Ok(None),
        }
    }

    fn norm(&mut self, path: &str, eps: f64) -> Result<RmsNorm> {
        Ok(RmsNorm {
            weight: self.take(&format!("{path}.weight"))?,
            eps,
        })
    }

    fn linear(&mut self, path: &str) -> Result<LoraLinear> {
        let weight = self.take(&format!("{path}.weight"))?;
        let bias = self.take_optional(&format!("{path}.bias"))?;

        let module = path.rsplit('.').next().unwrap_or(path);
        let lora = if self.lora.targets(module) {
            let (out_features, in_features) = weight.dims2()?;
            Some(LoraWeights::new(
                self.varmap,
                &format!("{PEFT_PREFIX}.{path}"),
                in_features,
                out_features,
                self.lora,
                self.precision.lora_adapter_dtype,
                &mut self.rng,
                self.device,
            )?)
        } else {
            None
        };
        LoraLinear::new(weight, bias, lora)
    }
}

/// Frozen base model with LoRA adapters on the configured projections.
pub struct LoraCausalLM {
    config: ModelConfig,
    lora_config: LoRAConfig,
    precision: PrecisionConfig,
    device: Device,
    embed_tokens: Tensor,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    /// `None` when tied to the input embeddings
    lm_head: Option<Tensor>,
    rotary: RotaryEmbedding,
    varmap: VarMap,
}

impl LoraCausalLM {
    /// Load a base model from disk and wrap it with adapters.
    pub fn load(
        files: &BaseModelFiles,
        lora: &LoRAConfig,
        precision: PrecisionConfig,
        seed: u64,
        device: &Device,
    ) -> Result<Self> {
        let weights = load_weights(&files.weight_files, device)?;
        Self::from_weights(files.config.clone(), weights, lora, precision, seed, device)
    }

    /// Build from checkpoint tensors named as in Hugging Face Qwen2/Llama
    /// checkpoints (`model.layers.0.self_attn.q_proj.weight`, ...).
    pub fn from_weights(
        config: ModelConfig,
        weights: HashMap<String, Tensor>,
        lora: &LoRAConfig,
        precision: PrecisionConfig,
        seed: u64,
        device: &Device,
    ) -> Result<Self> {
        config.validate()?;
        lora.validate()?;

        let varmap = VarMap::new();
        let mut loader = WeightLoader {
            weights,
            precision: &precision,
            device,
            lora,
            varmap: &varmap,
            rng: StdRng::seed_from_u64(seed),
        };

        let embed_tokens = loader.take("model.embed_tokens.weight")?;

        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            let p = format!("model.layers.{i}");
            layers.push(DecoderLayer {
                input_layernorm: loader.norm(&format!("{p}.input_layernorm"), config.rms_norm_eps)?,
                self_attn: Attention {
                    q_proj: loader.linear(&format!("{p}.self_attn.q_proj"))?,
                    k_proj: loader.linear(&format!("{p}.self_attn.k_proj"))?,
                    v_proj: loader.linear(&format!("{p}.self_attn.v_proj"))?,
                    o_proj: loader.linear(&format!("{p}.self_attn.o_proj"))?,
                    num_heads: config.num_attention_heads,
                    num_kv_heads: config.num_kv_heads(),
                    head_dim: config.head_dim(),
                },
                post_attention_layernorm: loader
                    .norm(&format!("{p}.post_attention_layernorm"), config.rms_norm_eps)?,
                mlp: Mlp {
                    gate_proj: loader.linear(&format!("{p}.mlp.gate_proj"))?,
                    up_proj: loader.linear(&format!("{p}.mlp.up_proj"))?,
                    down_proj: loader.linear(&format!("{p}.mlp.down_proj"))?,
                },
            });
        }

        let norm = loader.norm("model.norm", config.rms_norm_eps)?;
        let lm_head = if config.tie_word_embeddings {
            None
        } else {
            Some(loader.take("lm_head.weight")?)
        };

        if !loader.weights.is_empty() {
            debug!("{} checkpoint tensors left unused", loader.weights.len());
        }
        drop(loader);

        let adapters = varmap.all_vars().len() / 2;
        if adapters == 0 {
            return Err(TrainError::InvalidConfig(format!(
                "none of the LoRA target modules {:?} exist in the model",
                lora.target_modules
            )));
        }
        info!(
            "Injected {} LoRA adapters (rank {}, alpha {}) into {} layers, precision {}",
            adapters, lora.rank, lora.alpha, config.num_hidden_layers, precision
        );

        Ok(Self {
            rotary: RotaryEmbedding::new(config.head_dim(), config.rope_theta),
            config,
            lora_config: lora.clone(),
            precision,
            device: device.clone(),
            embed_tokens,
            layers,
            norm,
            lm_head,
            varmap,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn lora_config(&self) -> &LoRAConfig {
        &self.lora_config
    }

    pub fn precision(&self) -> &PrecisionConfig {
        &self.precision
    }

    /// (trainable, total) parameter counts.
    pub fn parameter_counts(&self) -> Result<(usize, usize)> {
        let trainable = self
            .trainable_variables()
            .iter()
            .map(|v| v.elem_count())
            .sum();
        let total = self
            .named_parameters()?
            .iter()
            .map(|(_, t)| t.elem_count())
            .sum();
        Ok((trainable, total))
    }
}

impl CausalLanguageModel for LoraCausalLM {
    fn forward(&self, input_ids: &Tensor, attention_mask: &Tensor, train: bool) -> Result<Tensor> {
        let (batch, seq) = input_ids.dims2()?;
        let hidden_size = self.config.hidden_size;

        let mut hidden = self
            .embed_tokens
            .index_select(&input_ids.flatten_all()?, 0)?
            .reshape((batch, seq, hidden_size))?;

        let (cos, sin) = self.rotary.cos_sin(seq, &self.device, hidden.dtype())?;
        let bias = attention_bias(attention_mask, &self.device)?;

        for layer in &self.layers {
            hidden = layer.forward(&hidden, &cos, &sin, &bias, train)?;
        }
        let hidden = self.norm.forward(&hidden)?;

        let head = self.lm_head.as_ref().unwrap_or(&self.embed_tokens);
        let vocab = head.dim(0)?;
        let logits = hidden
            .reshape((batch * seq, hidden_size))?
            .matmul(&head.t()?)?
            .reshape((batch, seq, vocab))?;
        Ok(logits.to_dtype(self.precision.compute_dtype)?)
    }

    fn trainable_variables(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    fn named_parameters(&self) -> Result<Vec<(String, Tensor)>> {
        let name = |stem: &str| format!("{PEFT_PREFIX}.{stem}");
        let mut params = vec![(name("model.embed_tokens.weight"), self.embed_tokens.clone())];

        for (i, layer) in self.layers.iter().enumerate() {
            let p = format!("model.layers.{i}");
            params.push((
                name(&format!("{p}.input_layernorm.weight")),
                layer.input_layernorm.weight.clone(),
            ));
            params.push((
                name(&format!("{p}.post_attention_layernorm.weight")),
                layer.post_attention_layernorm.weight.clone(),
            ));
            for (module, linear) in layer.projections() {
                // PEFT moves the wrapped projection's own weights under base_layer
                let stem = if linear.lora().is_some() {
                    format!("{p}.{module}.base_layer")
                } else {
                    format!("{p}.{module}")
                };
                params.push((name(&format!("{stem}.weight")), linear.weight().clone()));
                if let Some(bias) = linear.bias() {
                    params.push((name(&format!("{stem}.bias")), bias.clone()));
                }
            }
        }

        params.push((name("model.norm.weight"), self.norm.weight.clone()));
        if let Some(lm_head) = &self.lm_head {
            params.push((name("lm_head.weight"), lm_head.clone()));
        }

        let vars = self
            .varmap
            .data()
            .lock()
            .map_err(|_| TrainError::Training("variable map lock poisoned".into()))?;
        params.extend(
            vars.iter()
                .map(|(n, var)| (n.clone(), var.as_tensor().clone())),
        );
        drop(vars);

        params.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(params)
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

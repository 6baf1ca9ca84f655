//! Causal LM fine-tuning loop for LoRA adapters
//!
//! One optimizer step consumes `gradient_accumulation_steps` micro-batches.
//! Every epoch redraws its sample order from the weighted sampler, so
//! heavily weighted examples appear several times per epoch.

use super::checkpoint::{CheckpointManager, LogEntry, TrainerState};
use super::dataset::{WeightedDataset, DEFAULT_MAX_LENGTH, DEFAULT_SYSTEM_PROMPT, IGNORE_INDEX};
use crate::error::{Result, TrainError};
use crate::lora::PeftAdapterConfig;
use crate::runtime::CausalLanguageModel;
use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor, Var, D};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use chrono::Utc;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Hyperparameters for a training run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingArguments {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub gradient_accumulation_steps: usize,
    pub warmup_steps: usize,
    pub logging_steps: usize,
    pub save_steps: usize,
    pub save_total_limit: usize,
    pub max_grad_norm: f64,
    pub weight_decay: f64,
    pub adam_beta1: f64,
    pub adam_beta2: f64,
    pub adam_epsilon: f64,
    pub seed: u64,
    pub max_length: usize,
    pub system_prompt: String,
}

impl Default for TrainingArguments {
    fn default() -> Self {
        Self {
            epochs: 3,
            batch_size: 4,
            learning_rate: 1e-4,
            gradient_accumulation_steps: 1,
            warmup_steps: 10,
            logging_steps: 5,
            save_steps: 50,
            save_total_limit: 2,
            max_grad_norm: 1.0,
            weight_decay: 0.0,
            adam_beta1: 0.9,
            adam_beta2: 0.999,
            adam_epsilon: 1e-8,
            seed: 42,
            max_length: DEFAULT_MAX_LENGTH,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

impl TrainingArguments {
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("epochs", self.epochs),
            ("batch_size", self.batch_size),
            ("gradient_accumulation_steps", self.gradient_accumulation_steps),
            ("logging_steps", self.logging_steps),
            ("save_steps", self.save_steps),
            ("max_length", self.max_length),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(TrainError::InvalidConfig(format!("{name} must be positive")));
            }
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(TrainError::InvalidConfig(format!(
                "learning_rate must be a positive number, got {}",
                self.learning_rate
            )));
        }
        if !(self.max_grad_norm > 0.0) {
            return Err(TrainError::InvalidConfig(
                "max_grad_norm must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Micro-batches per epoch; the last one may be short.
    pub fn batches_per_epoch(&self, dataset_len: usize) -> usize {
        dataset_len.div_ceil(self.batch_size)
    }

    pub fn steps_per_epoch(&self, dataset_len: usize) -> usize {
        self.batches_per_epoch(dataset_len)
            .div_ceil(self.gradient_accumulation_steps)
    }

    pub fn total_steps(&self, dataset_len: usize) -> usize {
        self.steps_per_epoch(dataset_len) * self.epochs
    }

    /// Learning rate for the optimizer step taken after `step` completed steps.
    ///
    /// Rises linearly over `warmup_steps`, then decays linearly to zero at
    /// `total_steps`.
    pub fn lr_at(&self, step: usize, total_steps: usize) -> f64 {
        let factor = if step < self.warmup_steps {
            step as f64 / self.warmup_steps.max(1) as f64
        } else {
            let remaining = total_steps.saturating_sub(step) as f64;
            let decay_span = total_steps.saturating_sub(self.warmup_steps).max(1) as f64;
            (remaining / decay_span).max(0.0)
        };
        self.learning_rate * factor
    }
}

/// Outcome of [`LoRATrainer::train`].
#[derive(Debug, Clone)]
pub struct TrainingSummary {
    pub global_step: usize,
    pub epochs: usize,
    /// Mean loss over every micro-batch of the run
    pub train_loss: f32,
    pub final_loss: f32,
    pub log_history: Vec<LogEntry>,
    pub last_checkpoint: Option<PathBuf>,
    pub duration: Duration,
}

/// Shifted next-token cross entropy averaged over non-ignored targets.
///
/// `logits` is `[batch, seq, vocab]`, `labels` is `[batch, seq]` i64.
pub fn causal_lm_loss(logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
    let (batch, seq, vocab) = logits.dims3()?;
    if seq < 2 {
        return Err(TrainError::Training(
            "sequences need at least two tokens for next-token loss".into(),
        ));
    }

    let logits = logits
        .to_dtype(DType::F32)?
        .narrow(1, 0, seq - 1)?
        .reshape((batch * (seq - 1), vocab))?;
    let targets = labels
        .to_dtype(DType::I64)?
        .narrow(1, 1, seq - 1)?
        .reshape(batch * (seq - 1))?;

    let keep = targets.ne(IGNORE_INDEX)?;
    let safe_targets = keep.where_cond(&targets, &targets.zeros_like()?)?;
    let keep = keep.to_dtype(DType::F32)?;

    let count = keep.sum_all()?.to_scalar::<f32>()?;
    if count == 0.0 {
        return Err(TrainError::Training("batch has no target tokens".into()));
    }

    let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?;
    let picked = log_probs.gather(&safe_targets.unsqueeze(1)?, 1)?.squeeze(1)?;
    let total = (picked * keep)?.sum_all()?;
    Ok(total.affine(-1.0 / count as f64, 0.0)?)
}

/// Sum `incoming` into `accumulated` for every trainable variable.
fn accumulate(accumulated: Option<GradStore>, mut incoming: GradStore, vars: &[Var]) -> Result<GradStore> {
    let Some(previous) = accumulated else {
        return Ok(incoming);
    };
    for var in vars {
        if let Some(prev) = previous.get(var.as_tensor()) {
            let sum = match incoming.get(var.as_tensor()) {
                Some(grad) => (grad + prev)?,
                None => prev.clone(),
            };
            incoming.insert(var.as_tensor(), sum);
        }
    }
    Ok(incoming)
}

/// Scale gradients so their global L2 norm is at most `max_norm`.
///
/// Returns the norm before clipping.
pub fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> Result<f32> {
    let mut squared = 0f64;
    for var in vars {
        if let Some(grad) = grads.get(var.as_tensor()) {
            squared += grad.sqr()?.sum_all()?.to_dtype(DType::F64)?.to_scalar::<f64>()?;
        }
    }
    let norm = squared.sqrt();

    if norm > max_norm {
        let scale = max_norm / (norm + 1e-6);
        for var in vars {
            if let Some(grad) = grads.get(var.as_tensor()) {
                let clipped = grad.affine(scale, 0.0)?;
                grads.insert(var.as_tensor(), clipped);
            }
        }
    }
    Ok(norm as f32)
}

/// Drives optimization of the adapter parameters of a [`CausalLanguageModel`].
pub struct LoRATrainer {
    args: TrainingArguments,
    output_dir: PathBuf,
    adapter_config: Option<PeftAdapterConfig>,
}

impl LoRATrainer {
    pub fn new(args: TrainingArguments, output_dir: impl Into<PathBuf>) -> Result<Self> {
        args.validate()?;
        Ok(Self {
            args,
            output_dir: output_dir.into(),
            adapter_config: None,
        })
    }

    /// Write `adapter_config.json` into every checkpoint.
    pub fn with_adapter_config(mut self, config: PeftAdapterConfig) -> Self {
        self.adapter_config = Some(config);
        self
    }

    pub fn args(&self) -> &TrainingArguments {
        &self.args
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn train(
        &self,
        model: &mut dyn CausalLanguageModel,
        dataset: &WeightedDataset,
    ) -> Result<TrainingSummary> {
        let args = &self.args;
        if dataset.is_empty() {
            return Err(TrainError::Training("training dataset is empty".into()));
        }

        let vars = model.trainable_variables();
        if vars.is_empty() {
            return Err(TrainError::Training("model has no trainable parameters".into()));
        }

        let mut optimizer = AdamW::new(
            vars.clone(),
            ParamsAdamW {
                lr: args.learning_rate,
                beta1: args.adam_beta1,
                beta2: args.adam_beta2,
                eps: args.adam_epsilon,
                weight_decay: args.weight_decay,
            },
        )?;
        let checkpoints = CheckpointManager::new(
            &self.output_dir,
            args.save_total_limit,
            self.adapter_config.clone(),
        );

        let sampler = dataset.sampler()?;
        let mut rng = StdRng::seed_from_u64(args.seed);
        let batches_per_epoch = args.batches_per_epoch(dataset.len());
        let steps_per_epoch = args.steps_per_epoch(dataset.len());
        let total_steps = args.total_steps(dataset.len());

        info!(
            "Training {} examples for {} epochs ({} optimizer steps, {} per epoch)",
            dataset.len(),
            args.epochs,
            total_steps,
            steps_per_epoch
        );

        let started = Instant::now();
        let mut global_step = 0usize;
        let mut log_history = Vec::new();
        let mut last_checkpoint = None;
        let mut run_loss = 0f64;
        let mut run_batches = 0usize;
        let mut window_loss = 0f64;
        let mut window_batches = 0usize;
        let mut last_loss = f32::NAN;

        for epoch in 0..args.epochs {
            let order = sampler.sample(&mut rng);
            debug!("Epoch {} sample order: {:?}", epoch + 1, order);

            let mut accumulated: Option<GradStore> = None;
            for (batch_index, indices) in order.chunks(args.batch_size).enumerate() {
                let batch = dataset.collate(indices, model.device())?;
                let logits = model.forward(&batch.input_ids, &batch.attention_mask, true)?;
                let loss = causal_lm_loss(&logits, &batch.labels)?;

                let loss_value = loss.to_scalar::<f32>()?;
                if !loss_value.is_finite() {
                    return Err(TrainError::Training(format!(
                        "non-finite loss {} at step {} (epoch {})",
                        loss_value,
                        global_step + 1,
                        epoch + 1
                    )));
                }
                last_loss = loss_value;
                run_loss += loss_value as f64;
                run_batches += 1;
                window_loss += loss_value as f64;
                window_batches += 1;

                let scaled = loss.affine(1.0 / args.gradient_accumulation_steps as f64, 0.0)?;
                accumulated = Some(accumulate(accumulated.take(), scaled.backward()?, &vars)?);

                let end_of_epoch = batch_index + 1 == batches_per_epoch;
                if (batch_index + 1) % args.gradient_accumulation_steps != 0 && !end_of_epoch {
                    continue;
                }
                let Some(mut grads) = accumulated.take() else {
                    continue;
                };

                let grad_norm = clip_grad_norm(&mut grads, &vars, args.max_grad_norm)?;
                let lr = args.lr_at(global_step, total_steps);
                optimizer.set_learning_rate(lr);
                optimizer.step(&grads)?;
                global_step += 1;

                let epoch_progress =
                    epoch as f64 + (batch_index + 1) as f64 / batches_per_epoch as f64;

                if global_step % args.logging_steps == 0 || global_step == total_steps {
                    let mean = (window_loss / window_batches.max(1) as f64) as f32;
                    info!(
                        "step {}/{} loss {:.4} lr {:.3e} grad_norm {:.4} epoch {:.2}",
                        global_step, total_steps, mean, lr, grad_norm, epoch_progress
                    );
                    log_history.push(LogEntry {
                        step: global_step,
                        epoch: epoch_progress,
                        loss: mean,
                        learning_rate: lr,
                        grad_norm,
                    });
                    window_loss = 0.0;
                    window_batches = 0;
                }

                if global_step % args.save_steps == 0 || global_step == total_steps {
                    let state = TrainerState {
                        global_step,
                        max_steps: total_steps,
                        epoch: epoch_progress,
                        timestamp: Utc::now(),
                        log_history: log_history.clone(),
                    };
                    let (path, _) = checkpoints.save(&*model, &state)?;
                    last_checkpoint = Some(path);
                }
            }
        }

        let summary = TrainingSummary {
            global_step,
            epochs: args.epochs,
            train_loss: (run_loss / run_batches.max(1) as f64) as f32,
            final_loss: last_loss,
            log_history,
            last_checkpoint,
            duration: started.elapsed(),
        };
        info!(
            "Training finished: {} steps, mean loss {:.4}, {:.1}s",
            summary.global_step,
            summary.train_loss,
            summary.duration.as_secs_f64()
        );
        Ok(summary)
    }
}

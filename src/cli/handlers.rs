//! The `train_lora` pipeline: load queue, load model, train, export.
//!
//! Progress banners go to stdout; diagnostics go through `tracing`.

use super::commands::TrainLoraArgs;
use crate::config::TrainConfig;
use crate::error::{Result, TrainError};
use crate::runtime::{
    resolve_base_model, select_device, HfChatTokenizer, LoraCausalLM, PrecisionConfig,
};
use crate::training::{
    archive_queue, export_adapter, inspect_adapter, load_training_records, AdapterStats,
    LoRATrainer, TrainingSummary, WeightedDataset,
};
use std::path::PathBuf;
use tracing::info;

const RULE: &str = "============================================================";

/// What a successful run produced.
#[derive(Debug)]
pub enum TrainOutcome {
    /// `--check`: everything loaded, nothing trained
    Checked { records: usize, trainable_parameters: usize },
    Trained {
        summary: TrainingSummary,
        adapter: AdapterStats,
        archived_queue: Option<PathBuf>,
    },
}

/// Run the full pipeline for `args` with the already-layered `config`.
pub fn handle_train(args: &TrainLoraArgs, config: &TrainConfig) -> Result<TrainOutcome> {
    if !args.queue_file.is_file() {
        return Err(TrainError::QueueNotFound(args.queue_file.clone()));
    }

    println!("{RULE}");
    println!("LoRA Fine-Tuning for Qwen Models");
    println!("{RULE}");

    println!("\n📖 Loading training examples from {}", args.queue_file.display());
    let report = load_training_records(&args.queue_file)?;
    println!("Loaded {} training examples", report.records.len());
    if !report.records.is_empty() {
        println!("{}", report.summary);
    }
    if report.defaulted_weights > 0 {
        info!(
            "{} records had a missing or invalid weight and use 1.0",
            report.defaulted_weights
        );
    }
    let records = report.into_records()?;

    let device = select_device(config.runtime.use_gpu)?;
    let precision = PrecisionConfig::for_device(&device, config.runtime.mixed_precision);

    println!("\n🔧 Loading tokenizer from {}", args.base_model);
    let files = resolve_base_model(&args.base_model)?;
    let tokenizer = HfChatTokenizer::from_model_dir(files.tokenizer_dir(), &files.config.model_type)?;

    println!("\n🤖 Loading base model from {}", args.base_model);
    info!("Device {:?}, precision {}", device, precision);
    if precision.is_mixed() {
        println!("  Mixed precision: F16 base weights, F32 adapters");
    }
    let mut model = LoraCausalLM::load(
        &files,
        &config.lora,
        precision,
        config.training.seed,
        &device,
    )?;

    println!("\n⚙️  Configuring LoRA");
    println!("  Rank: {}", config.lora.rank);
    println!("  Alpha: {}", config.lora.alpha);
    println!("  Dropout: {}", config.lora.dropout);
    let (trainable, total) = model.parameter_counts()?;
    println!("{}", trainable_parameters_line(trainable, total));

    println!("\n📚 Creating weighted dataset");
    let training = &config.training;
    let dataset = WeightedDataset::build(
        &records,
        &tokenizer,
        training.max_length,
        &training.system_prompt,
    )?;

    println!("\nTraining Configuration:");
    println!("  Epochs: {}", training.epochs);
    println!("  Batch size: {}", training.batch_size);
    println!("  Learning rate: {}", training.learning_rate);
    println!("  Examples: {}", dataset.len());
    println!("  Total training steps: {}", training.total_steps(dataset.len()));

    if args.check {
        println!("\n✅ Check passed: queue, tokenizer and base model are usable");
        return Ok(TrainOutcome::Checked {
            records: dataset.len(),
            trainable_parameters: trainable,
        });
    }

    let trainer = LoRATrainer::new(training.clone(), args.output_dir())?
        .with_adapter_config(config.lora.to_peft_config(&args.base_model));

    println!("\nStarting training...");
    let summary = trainer.train(&mut model, &dataset)?;
    println!("✅ Training complete!");

    println!("\nExporting adapter to {}", args.output_file.display());
    export_adapter(&model, &args.output_file)?;
    let adapter = inspect_adapter(&args.output_file)?;
    println!("Adapter contains {} parameters", adapter.tensors);
    println!(
        "Total parameters: {} ({:.2} MB)",
        group_thousands(adapter.parameters),
        adapter.size_mb
    );
    println!("✅ Adapter saved successfully!");

    let archived_queue = if args.archive_queue {
        let archived = archive_queue(&args.queue_file)?;
        println!("Archived training queue to {}", archived.display());
        Some(archived)
    } else {
        None
    };

    println!("\n{RULE}");
    println!("✅ LoRA training complete!");
    println!("{RULE}");
    println!("\nAdapter saved to: {}", args.output_file.display());

    Ok(TrainOutcome::Trained {
        summary,
        adapter,
        archived_queue,
    })
}

/// `trainable params: 1,024 || all params: 2,048 || trainable%: 50.0000`
pub fn trainable_parameters_line(trainable: usize, total: usize) -> String {
    let percent = if total == 0 {
        0.0
    } else {
        100.0 * trainable as f64 / total as f64
    };
    format!(
        "trainable params: {} || all params: {} || trainable%: {:.4}",
        group_thousands(trainable),
        group_thousands(total),
        percent
    )
}

fn group_thousands(n: usize) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

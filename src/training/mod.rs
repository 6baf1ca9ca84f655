//! Training pipeline: queue loading, weighted dataset, trainer, checkpoints
//! and adapter export

pub mod checkpoint;
pub mod dataset;
pub mod examples;
pub mod export;
pub mod trainer;

pub use checkpoint::{CheckpointInfo, CheckpointManager, LogEntry, TrainerState};

pub use dataset::{
    Batch,
    TokenizedExample,
    WeightedDataset,
    WeightedSampler,
    DEFAULT_MAX_LENGTH,
    DEFAULT_SYSTEM_PROMPT,
    IGNORE_INDEX,
};

pub use examples::{
    archive_queue,
    load_training_records,
    LineWarning,
    LoadReport,
    TrainingRecord,
    WeightSummary,
    WeightTier,
};

pub use export::{collect_adapter_state, export_adapter, inspect_adapter, load_adapter, AdapterStats};

pub use trainer::{causal_lm_loss, LoRATrainer, TrainingArguments, TrainingSummary};

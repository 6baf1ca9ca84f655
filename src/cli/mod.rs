//! Command-line interface for `train_lora`.

pub mod commands;
pub mod handlers;

pub use commands::TrainLoraArgs;
pub use handlers::{handle_train, TrainOutcome};

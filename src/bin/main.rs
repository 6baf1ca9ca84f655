//! train_lora binary.
//!
//! Trains a LoRA adapter from a weighted training queue and writes it as a
//! safetensors file. Exits with status 1 and a diagnostic on stderr on any
//! failure.

use anyhow::Context;
use clap::Parser;
use lora_train_core::cli::{handle_train, TrainLoraArgs};
use lora_train_core::config::LoggingSettings;
use lora_train_core::TrainError;
use std::fs::OpenOptions;
use std::io::Write;
use std::process::ExitCode;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

fn main() -> ExitCode {
    let args = TrainLoraArgs::parse();

    let config = match args.load_config() {
        Ok(config) => config,
        Err(e) => return report(&e, &mut std::io::stderr()),
    };

    let _guard = match init_logging(&config.logging) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    match handle_train(&args, &config) {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => report(&e, &mut std::io::stderr()),
    }
}

/// The single diagnostic for a failed run.
fn report(err: &TrainError, out: &mut impl Write) -> ExitCode {
    let _ = writeln!(out, "Error: {}", err);
    if let Some(hint) = err.hint() {
        let _ = writeln!(out, "\n{}", hint);
    }
    ExitCode::FAILURE
}

/// stderr logging filtered by `RUST_LOG` or the configured level, plus an
/// optional plain-text file.
fn init_logging(
    settings: &LoggingSettings,
) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = || {
        EnvFilter::builder()
            .with_default_directive(settings.level.parse().unwrap_or(Level::INFO).into())
            .from_env_lossy()
    };

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(filter());

    let (file_layer, guard) = match &settings.file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create log directory {}", parent.display()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_line_number(true)
                .with_filter(filter());
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_report_prints_error_once() {
        let mut out = Vec::new();
        report(&TrainError::QueueNotFound(PathBuf::from("q.jsonl")), &mut out);

        let text = String::from_utf8(out).expect("test: utf8");
        assert_eq!(text.matches("Error:").count(), 1);
        assert!(text.contains("q.jsonl"));
    }

    #[test]
    fn test_report_appends_environment_hint() {
        let mut out = Vec::new();
        report(&TrainError::environment("no model", "install it"), &mut out);
        let text = String::from_utf8(out).expect("test: utf8");
        assert!(text.starts_with("Error: "));
        assert!(text.ends_with("\ninstall it\n"));
    }
}

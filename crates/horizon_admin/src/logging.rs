//! Tracing subscriber setup.

use crate::config::LoggingSettings;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Installs the global subscriber. `RUST_LOG` takes precedence over the
/// configured level.
pub fn setup_logging(config: &LoggingSettings) -> Result<(), Box<dyn std::error::Error>> {
    let log_level = config.level.as_str();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let console = if config.json_format {
        fmt::layer()
            .json()
            .with_file(false)
            .with_line_number(false)
            .with_thread_ids(true)
            .boxed()
    } else {
        fmt::layer()
            .with_ansi(true)
            .with_file(false)
            .with_line_number(false)
            .with_thread_ids(true)
            .boxed()
    };

    let file = match &config.file_path {
        Some(path) => {
            let path = Path::new(path);
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)).boxed())
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()?;

    info!("Logging initialized with level: {}", log_level);
    Ok(())
}

use std::{env, path::PathBuf};
use tracing::info;

/// Runtime settings for the courier daemon.
///
/// Everything is resolved once at startup from the environment (a `.env`
/// file is honoured if present) and then passed around by value.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Directory all persisted JSON documents live under.
    pub data_dir: PathBuf,
    /// Log level filter handed to the tracing subscriber.
    pub log_level: String,
    /// Optional directory for rolling log files. `None` logs to stdout only.
    pub log_dir: Option<PathBuf>,
}

impl Settings {
    /// Resolve settings from the environment, loading `.env` first.
    pub fn from_env() -> Self {
        if dotenvy::dotenv().is_ok() {
            info!("Loaded .env");
        }
        Settings {
            data_dir: resolve_data_dir(),
            log_level: env::var("COURIER_LOG").unwrap_or_else(|_| "info".to_string()),
            log_dir: env::var("COURIER_LOG_DIR").ok().map(PathBuf::from),
        }
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            data_dir: PathBuf::from("./courier-data"),
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

/// Resolve the courier data directory from the environment or use default.
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(path) = env::var("COURIER_ROOT") {
        PathBuf::from(path)
    } else {
        PathBuf::from("./courier-data")
    }
}

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use crate::error::{Error, Result};

pub const LOG_ENV: &str = "CTMIGRATE_LOG";
const FALLBACK_ENV: &str = "RUST_LOG";
const DEFAULT_FILTER: &str = "info";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// `CTMIGRATE_LOG`, then `RUST_LOG`, then `info`. Unparsable directives
/// fall through to the next source.
pub fn env_filter() -> EnvFilter {
    [LOG_ENV, FALLBACK_ENV]
        .iter()
        .filter_map(|k| std::env::var(k).ok())
        .filter(|v| !v.trim().is_empty())
        .find_map(|v| EnvFilter::try_new(v).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}

pub fn log_file_name(now: chrono::DateTime<chrono::Local>) -> String {
    format!("ctmigrate_{}.log", now.format("%Y%m%d_%H%M%S"))
}

/// Install the global subscriber: console on stderr, plus a plain-text
/// per-run file under `log_dir` when given. Returns the file path.
pub fn init(format: LogFormat, log_dir: Option<&Path>) -> Result<Option<PathBuf>> {
    let mut layers: Vec<BoxedLayer> = Vec::new();
    layers.push(match format {
        LogFormat::Text => fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .boxed(),
        LogFormat::Json => fmt::layer().json().with_writer(std::io::stderr).boxed(),
    });

    let mut file_path = None;
    if let Some(dir) = log_dir {
        fs::create_dir_all(dir)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", dir.display())))?;
        let path = dir.join(log_file_name(chrono::Local::now()));
        let file = File::create(&path)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", path.display())))?;
        layers.push(
            fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .boxed(),
        );
        file_path = Some(path);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(env_filter())
        .try_init()
        .map_err(|e| Error::msg(format!("failed to install log subscriber: {e}")))?;
    Ok(file_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn file_name_is_timestamped() {
        let t = chrono::Local
            .with_ymd_and_hms(2026, 3, 4, 5, 6, 7)
            .single()
            .expect("time");
        assert_eq!(log_file_name(t), "ctmigrate_20260304_050607.log");
    }
}

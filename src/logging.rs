//! Logging setup.
//!
//! Without `--log` everything goes through `env_logger` to stderr. With a
//! log file, records are appended either as
//! `<timestamp>:<pid>:<level>:<message>` lines or as one JSON object per
//! line, selectable with `--log-format`.

use crate::state::iso8601_timestamp;
use anyhow::{Context, Result};
use log::{LevelFilter, Log, Metadata, Record};
use serde_json::json;
use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
    process,
    sync::Mutex,
};
use strum::{Display, EnumString};

/// Selectable log output formats.
#[derive(Clone, Copy, Debug, Default, Display, EnumString, Eq, PartialEq)]
#[strum(serialize_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// A logger appending to a file in the configured format.
#[derive(Debug)]
pub struct FileLogger {
    level: LevelFilter,
    format: LogFormat,
    path: PathBuf,
    // Serializes writers within this process; concurrent runtime invocations
    // rely on O_APPEND.
    lock: Mutex<()>,
}

impl FileLogger {
    pub fn new(path: &Path, format: LogFormat, level: LevelFilter) -> Self {
        Self {
            level,
            format,
            path: path.to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    /// Render one record in the configured format, newline-terminated.
    fn render(&self, level: &str, message: &str) -> String {
        let timestamp = iso8601_timestamp();
        match self.format {
            LogFormat::Text => format!(
                "{}:{}:{}:{}\n",
                timestamp,
                process::id(),
                level,
                message
            ),
            LogFormat::Json => format!(
                "{}\n",
                json!({
                    "level": level,
                    "msg": message,
                    "time": timestamp,
                })
            ),
        }
    }

    fn append(&self, line: &str) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open log file {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("write log file {}", self.path.display()))
    }
}

impl Log for FileLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let line = self.render(
            &record.level().to_string().to_lowercase(),
            &record.args().to_string(),
        );
        // Nothing sensible left to do if the log file is unwritable.
        let _ = self.append(&line);
    }

    fn flush(&self) {}
}

/// Install the global logger for this invocation.
pub fn setup(debug: bool, log_file: Option<&Path>, format: LogFormat) -> Result<()> {
    let level = if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    match log_file {
        Some(path) => {
            log::set_boxed_logger(Box::new(FileLogger::new(path, format, level)))
                .context("install file logger")?;
            log::set_max_level(level);
        }
        None => {
            env_logger::Builder::from_default_env()
                .filter_level(level)
                .try_init()
                .context("install stderr logger")?;
        }
    }

    Ok(())
}

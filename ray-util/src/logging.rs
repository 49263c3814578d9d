// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Logging setup using the `tracing` ecosystem.
//!
//! Every component (driver, node store, pool worker) installs one global
//! subscriber at startup. Library code only emits `tracing` events.

use std::path::{Path, PathBuf};

use tracing_subscriber::EnvFilter;

/// Output encoding of log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl LogFormat {
    /// Parse `"text"` / `"json"` (case-insensitive).
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "text" => Some(Self::Text),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Options for [`init_ray_logging`].
#[derive(Debug, Clone, Default)]
pub struct LoggingOptions {
    /// Write to `<log_dir>/<component>.log` instead of stderr.
    pub log_dir: Option<PathBuf>,
    /// 0 = info, 1 = debug, anything higher = trace. Ignored when
    /// `RAY_LOG_LEVEL` or `RUST_LOG` is set.
    pub verbosity: i32,
    pub format: LogFormat,
}

/// Resolve the filter: `RAY_LOG_LEVEL`, then `RUST_LOG`, then verbosity.
fn build_filter(verbosity: i32) -> EnvFilter {
    EnvFilter::try_from_env("RAY_LOG_LEVEL")
        .or_else(|_| EnvFilter::try_from_env("RUST_LOG"))
        .unwrap_or_else(|_| EnvFilter::new(verbosity_level(verbosity)))
}

pub fn verbosity_level(verbosity: i32) -> &'static str {
    match verbosity {
        i32::MIN..=0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

/// Path of the log file for `component` inside `dir`.
pub fn log_file_path(dir: &Path, component: &str) -> PathBuf {
    dir.join(format!("{component}.log"))
}

/// Initialize the process-wide logging subscriber.
///
/// Returns `Ok(true)` when this call installed the subscriber and `Ok(false)`
/// when one was already installed (by an earlier call or by a test harness).
/// Fails only if the log file cannot be opened.
pub fn init_ray_logging(component: &str, options: &LoggingOptions) -> std::io::Result<bool> {
    let filter = build_filter(options.verbosity);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let installed = match (&options.log_dir, options.format) {
        (Some(dir), format) => {
            std::fs::create_dir_all(dir)?;
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_file_path(dir, component))?;
            let builder = builder.with_ansi(false).with_writer(std::sync::Mutex::new(file));
            match format {
                LogFormat::Text => builder.try_init().is_ok(),
                LogFormat::Json => builder.json().try_init().is_ok(),
            }
        }
        (None, LogFormat::Text) => builder.try_init().is_ok(),
        (None, LogFormat::Json) => builder.json().try_init().is_ok(),
    };

    if installed {
        tracing::info!(component, format = ?options.format, "Ray logging initialized");
    }
    Ok(installed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_levels() {
        assert_eq!(verbosity_level(-1), "info");
        assert_eq!(verbosity_level(0), "info");
        assert_eq!(verbosity_level(1), "debug");
        assert_eq!(verbosity_level(5), "trace");
    }

    #[test]
    fn test_log_format_from_name() {
        assert_eq!(LogFormat::from_name("JSON"), Some(LogFormat::Json));
        assert_eq!(LogFormat::from_name("text"), Some(LogFormat::Text));
        assert_eq!(LogFormat::from_name("xml"), None);
    }

    #[test]
    fn test_init_creates_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("logs");
        let options = LoggingOptions {
            log_dir: Some(log_dir.clone()),
            verbosity: 1,
            format: LogFormat::Json,
        };
        init_ray_logging("driver", &options).unwrap();
        // The file is opened even when another subscriber already won the race.
        assert!(log_file_path(&log_dir, "driver").exists());
        // Second install is a no-op.
        assert!(!init_ray_logging("driver", &options).unwrap());
    }
}

// Copyright 2026 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Mutex, OnceLock};
use std::thread;

use log::{Log, Metadata, Record};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::metrics::{IncMetric, METRICS};
use crate::utils::{LocalTime, lock};

/// Default level filter for the logger.
pub const DEFAULT_LEVEL: log::LevelFilter = log::LevelFilter::Info;
/// Instance id used until one is configured.
pub const DEFAULT_INSTANCE_ID: &str = "vhost-engine";
/// Instance id printed in every log line. Set once.
pub static INSTANCE_ID: OnceLock<String> = OnceLock::new();

/// The process-wide logger.
pub static LOGGER: Logger = Logger::new();

/// Error type for [`Logger::init`].
pub type LoggerInitError = log::SetLoggerError;

/// Errors of [`Logger::update`].
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum LoggerUpdateError {
    /// Failed to open log file: {0}
    Open(std::io::Error),
    /// Instance id is already set to {0}
    InstanceId(String),
}

#[derive(Debug)]
struct LoggerState {
    target: Option<File>,
    module: Option<String>,
    show_level: bool,
    show_log_origin: bool,
}

/// Logger writing one line per record to a file, or to stdout until a file is configured.
///
/// Lines look like `<local time> [<instance id>:<thread>[:LEVEL][:file:line]] message`.
#[derive(Debug)]
pub struct Logger(Mutex<LoggerState>);

impl Logger {
    /// Creates a logger writing to stdout with no module filter.
    pub const fn new() -> Self {
        Logger(Mutex::new(LoggerState {
            target: None,
            module: None,
            show_level: false,
            show_log_origin: false,
        }))
    }

    /// Installs the logger as the `log` facade backend.
    pub fn init(&'static self) -> Result<(), LoggerInitError> {
        log::set_logger(self)?;
        log::set_max_level(DEFAULT_LEVEL);
        Ok(())
    }

    /// Applies `config`. Fields left `None` keep their current value, except the level, which
    /// falls back to [`DEFAULT_LEVEL`].
    pub fn update(&self, config: LoggerConfig) -> Result<(), LoggerUpdateError> {
        // Open before touching any state so a bad path changes nothing.
        let target = match &config.log_path {
            Some(path) => Some(
                OpenOptions::new()
                    .custom_flags(libc::O_NONBLOCK)
                    .read(true)
                    .write(true)
                    .open(path)
                    .map_err(LoggerUpdateError::Open)?,
            ),
            None => None,
        };
        if let Some(id) = config.instance_id {
            let current = INSTANCE_ID.get_or_init(|| id.clone());
            if *current != id {
                return Err(LoggerUpdateError::InstanceId(current.clone()));
            }
        }

        let mut state = lock(&self.0);
        if target.is_some() {
            state.target = target;
        }
        if let Some(show_level) = config.show_level {
            state.show_level = show_level;
        }
        if let Some(show_log_origin) = config.show_log_origin {
            state.show_log_origin = show_log_origin;
        }
        if config.module.is_some() {
            state.module = config.module;
        }
        // Released before the level changes: a record logged meanwhile takes the lock.
        drop(state);

        log::set_max_level(config.level.map_or(DEFAULT_LEVEL, |level| level.0));
        Ok(())
    }

    fn format_line(state: &LoggerState, record: &Record) -> String {
        let mut prefix = format!(
            "{}:{}",
            INSTANCE_ID.get().map_or(DEFAULT_INSTANCE_ID, String::as_str),
            thread::current().name().unwrap_or("-")
        );
        if state.show_level {
            prefix.push(':');
            prefix.push_str(record.level().as_str());
        }
        if state.show_log_origin {
            let line = record.line().map_or_else(|| String::from("?"), |l| l.to_string());
            prefix.push_str(&format!(":{}:{line}", record.file().unwrap_or("?")));
        }
        format!("{} [{prefix}] {}\n", LocalTime::now(), record.args())
    }
}

impl Default for Logger {
    fn default() -> Self {
        Logger::new()
    }
}

impl Log for Logger {
    // Levels are filtered through `log::max_level`.
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        let mut state = lock(&self.0);
        if let Some(module) = &state.module {
            if !record.module_path().is_some_and(|path| path.starts_with(module)) {
                return;
            }
        }

        let line = Logger::format_line(&state, record);
        let result = match &mut state.target {
            Some(file) => file.write_all(line.as_bytes()),
            None => std::io::stdout().write_all(line.as_bytes()),
        };
        if result.is_err() {
            METRICS.logger.missed_log_count.inc();
        }
    }

    fn flush(&self) {}
}

/// Logger configuration, as deserialized from the host's control plane.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LoggerConfig {
    /// File or named pipe the log goes to.
    pub log_path: Option<PathBuf>,
    /// Maximum level logged.
    pub level: Option<LevelFilter>,
    /// Prefix lines with the record level.
    pub show_level: Option<bool>,
    /// Prefix lines with the source file and line.
    pub show_log_origin: Option<bool>,
    /// Only log records whose module path starts with this.
    pub module: Option<String>,
    /// Instance id printed in every line. Can only be set once per process.
    pub instance_id: Option<String>,
}

/// [`log::LevelFilter`] parsed case-insensitively, with `warning` accepted for `warn`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LevelFilter(pub log::LevelFilter);

/// Invalid level filter: {0}
#[derive(Debug, PartialEq, Eq, thiserror::Error, displaydoc::Display)]
pub struct LevelFilterFromStrError(String);

impl FromStr for LevelFilter {
    type Err = LevelFilterFromStrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("warning") {
            return Ok(LevelFilter(log::LevelFilter::Warn));
        }
        log::LevelFilter::from_str(s)
            .map(LevelFilter)
            .map_err(|_| LevelFilterFromStrError(String::from(s)))
    }
}

impl Serialize for LevelFilter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.0.as_str())
    }
}

impl<'de> Deserialize<'de> for LevelFilter {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let key = String::deserialize(deserializer)?;
        LevelFilter::from_str(&key).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use itertools::Itertools;
    use log::Level;
    use vmm_sys_util::tempfile::TempFile;

    use super::*;

    // Shared by every test that touches the process-wide instance id.
    const TEST_INSTANCE_ID: &str = "vhost-net-test";

    #[test]
    fn test_level_filter_any_case() {
        for (name, expected) in [
            ("off", log::LevelFilter::Off),
            ("trace", log::LevelFilter::Trace),
            ("debug", log::LevelFilter::Debug),
            ("info", log::LevelFilter::Info),
            ("warn", log::LevelFilter::Warn),
            ("warning", log::LevelFilter::Warn),
            ("error", log::LevelFilter::Error),
        ] {
            for upper in name.chars().map(|_| [false, true]).multi_cartesian_product() {
                let variant: String = name
                    .chars()
                    .zip_eq(upper)
                    .map(|(c, up)| if up { c.to_ascii_uppercase() } else { c })
                    .collect();
                assert_eq!(LevelFilter::from_str(&variant), Ok(LevelFilter(expected)));
            }
        }
        assert_eq!(
            LevelFilter::from_str("loud"),
            Err(LevelFilterFromStrError(String::from("loud")))
        );
    }

    #[test]
    fn test_logger_config_serde() {
        let config: LoggerConfig =
            serde_json::from_str(r#"{"level": "Warning", "show_level": true}"#).unwrap();
        assert_eq!(config.level, Some(LevelFilter(log::LevelFilter::Warn)));
        assert_eq!(config.show_level, Some(true));
        assert_eq!(config.log_path, None);

        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains(r#""level":"WARN""#));
        assert_eq!(serde_json::from_str::<LoggerConfig>(&json).unwrap(), config);

        serde_json::from_str::<LoggerConfig>(r#"{"colour": true}"#).unwrap_err();
        serde_json::from_str::<LoggerConfig>(r#"{"level": "blah"}"#).unwrap_err();
    }

    #[test]
    fn test_logger_writes_formatted_line() {
        let file = TempFile::new().unwrap();
        let logger = Logger::new();
        logger
            .update(LoggerConfig {
                log_path: Some(file.as_path().to_path_buf()),
                level: Some(LevelFilter(log::LevelFilter::Debug)),
                show_level: Some(true),
                show_log_origin: Some(true),
                module: Some(String::from("vhost_engine::vring")),
                instance_id: Some(String::from(TEST_INSTANCE_ID)),
            })
            .unwrap();
        assert!(logger.enabled(&Metadata::builder().level(Level::Trace).build()));

        let metadata = Metadata::builder().level(Level::Error).build();
        logger.log(
            &Record::builder()
                .args(format_args!("vq 0: loop detected"))
                .metadata(metadata.clone())
                .file(Some("src/vring/chain.rs"))
                .line(Some(200))
                .module_path(Some("vhost_engine::vring::chain"))
                .build(),
        );
        // Filtered out by module.
        logger.log(
            &Record::builder()
                .args(format_args!("worker stopped"))
                .metadata(metadata)
                .module_path(Some("vhost_engine::worker"))
                .build(),
        );

        let contents = std::fs::read_to_string(file.as_path()).unwrap();
        let (_time, rest) = contents.split_once(' ').unwrap();
        let thread = thread::current().name().unwrap_or("-").to_string();
        assert_eq!(
            rest,
            format!("[{TEST_INSTANCE_ID}:{thread}:ERROR:src/vring/chain.rs:200] vq 0: loop detected\n")
        );
    }

    #[test]
    fn test_logger_update_is_all_or_nothing() {
        let logger = Logger::new();
        let err = logger
            .update(LoggerConfig {
                log_path: Some(PathBuf::from("/nonexistent/dir/vhost.log")),
                show_level: Some(true),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, LoggerUpdateError::Open(_)));
        assert!(!lock(&logger.0).show_level);

        logger
            .update(LoggerConfig {
                show_level: Some(true),
                module: Some(String::from("vhost_engine")),
                ..Default::default()
            })
            .unwrap();
        let state = lock(&logger.0);
        assert!(state.show_level);
        assert!(state.target.is_none());
        assert_eq!(state.module.as_deref(), Some("vhost_engine"));
    }

    #[test]
    fn test_instance_id_set_once() {
        let logger = Logger::new();
        let id = String::from(TEST_INSTANCE_ID);
        let config = LoggerConfig {
            instance_id: Some(id.clone()),
            ..Default::default()
        };
        logger.update(config.clone()).unwrap();
        // Same id again is fine, a different one is not.
        logger.update(config).unwrap();
        let err = logger
            .update(LoggerConfig {
                instance_id: Some(String::from("other")),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, LoggerUpdateError::InstanceId(current) if current == id));
    }
}

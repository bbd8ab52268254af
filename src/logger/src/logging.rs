// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Mutex;
use std::thread;

use log::{Log, Metadata, Record};
use serde::{Deserialize, Deserializer, Serialize};
use utils::time::LocalTime;

use crate::extract_guard;
use crate::metrics::{IncMetric, METRICS};

/// Default level filter for the logger.
pub const DEFAULT_LEVEL: log::LevelFilter = log::LevelFilter::Info;
// Leads the tag of every log line.
const LOG_TAG: &str = "rawtcp";

/// The logger.
pub static LOGGER: Logger = Logger(Mutex::new(LoggerConfiguration {
    target: None,
    filter: LogFilter { module: None },
    format: LogFormat {
        show_level: false,
        show_log_origin: false,
    },
}));

/// Error type for [`Logger::update`].
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum LoggerUpdateError {
    /// Failed to open target file: {0}
    OpenTarget(std::io::Error),
    /// Failed to install the logger: {0}
    SetLogger(#[from] log::SetLoggerError),
}

impl Logger {
    /// Installs the logger as the `log` facade backend.
    pub fn init(&'static self) -> Result<(), LoggerUpdateError> {
        log::set_logger(self)?;
        log::set_max_level(DEFAULT_LEVEL);
        Ok(())
    }

    /// Applies the given logger configuration the logger.
    pub fn update(&self, config: LoggerConfig) -> Result<(), LoggerUpdateError> {
        let mut guard = extract_guard(self.0.lock());
        log::set_max_level(
            config
                .level
                .map(log::LevelFilter::from)
                .unwrap_or(DEFAULT_LEVEL),
        );

        if let Some(log_path) = config.log_path {
            let file = std::fs::OpenOptions::new()
                .custom_flags(libc::O_NONBLOCK)
                .create(true)
                .append(true)
                .open(log_path)
                .map_err(LoggerUpdateError::OpenTarget)?;

            guard.target = Some(file);
        };

        if let Some(show_level) = config.show_level {
            guard.format.show_level = show_level;
        }

        if let Some(show_log_origin) = config.show_log_origin {
            guard.format.show_log_origin = show_log_origin;
        }

        if let Some(module) = config.module {
            guard.filter.module = Some(module);
        }

        // Ensure we drop the guard before attempting to log, otherwise this
        // would deadlock.
        drop(guard);

        Ok(())
    }
}

/// Records are only written when their module path starts with `module`.
#[derive(Debug)]
pub struct LogFilter {
    /// Module path prefix.
    pub module: Option<String>,
}
/// Optional parts of the line tag.
#[derive(Debug)]
pub struct LogFormat {
    /// Show the record level.
    pub show_level: bool,
    /// Show the file and line the record comes from.
    pub show_log_origin: bool,
}
/// Mutable state of the [`Logger`].
#[derive(Debug)]
pub struct LoggerConfiguration {
    /// Output file, stdout when unset.
    pub target: Option<std::fs::File>,
    /// Record filter.
    pub filter: LogFilter,
    /// Line format.
    pub format: LogFormat,
}

/// `log` backend writing one line per record to a file, or stdout when no file is set.
#[derive(Debug)]
pub struct Logger(pub Mutex<LoggerConfiguration>);

impl Logger {
    fn format(format: &LogFormat, record: &Record) -> String {
        let thread = thread::current().name().unwrap_or("-").to_string();
        let level = match format.show_level {
            true => format!(":{}", record.level()),
            false => String::new(),
        };

        let origin = match format.show_log_origin {
            true => {
                let file = record.file().unwrap_or("?");
                let line = match record.line() {
                    Some(x) => x.to_string(),
                    None => String::from("?"),
                };
                format!(":{file}:{line}")
            }
            false => String::new(),
        };

        format!(
            "{} [{}:{thread}{level}{origin}] {}\n",
            LocalTime::now(),
            LOG_TAG,
            record.args()
        )
    }
}

impl Log for Logger {
    // No additional filters to <https://docs.rs/log/latest/log/fn.max_level.html>.
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        let mut guard = extract_guard(self.0.lock());

        let enabled = match (&guard.filter.module, record.module_path()) {
            (Some(filter), Some(source)) => source.starts_with(filter),
            (Some(_), None) => false,
            (None, _) => true,
        };
        if !enabled {
            return;
        }

        let message = Self::format(&guard.format, record);
        let result = if let Some(file) = &mut guard.target {
            file.write_all(message.as_bytes())
        } else {
            std::io::stdout().write_all(message.as_bytes())
        };

        // If the write returns an error, increment missed log count.
        // No reason to log the error to stderr here, just increment the metric.
        if result.is_err() {
            METRICS.logger.missed_log_count.inc();
        }
    }

    fn flush(&self) {}
}

/// Strongly typed structure used to describe the logger.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LoggerConfig {
    /// Named pipe or file used as output for logs.
    pub log_path: Option<PathBuf>,
    /// The level of the Logger.
    pub level: Option<LevelFilter>,
    /// Whether to show the log level in the log.
    pub show_level: Option<bool>,
    /// Whether to show the log origin in the log.
    pub show_log_origin: Option<bool>,
    /// The module to filter logs by.
    pub module: Option<String>,
}

/// Log level accepted in [`LoggerConfig`]; parsing is case insensitive and `warning` is an
/// alias of `warn`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum LevelFilter {
    /// [`log::LevelFilter::Off`]
    Off,
    /// [`log::LevelFilter::Trace`]
    Trace,
    /// [`log::LevelFilter::Debug`]
    Debug,
    /// [`log::LevelFilter::Info`]
    Info,
    /// [`log::LevelFilter::Warn`]
    Warn,
    /// [`log::LevelFilter::Error`]
    Error,
}
impl From<LevelFilter> for log::LevelFilter {
    fn from(filter: LevelFilter) -> log::LevelFilter {
        match filter {
            LevelFilter::Off => log::LevelFilter::Off,
            LevelFilter::Trace => log::LevelFilter::Trace,
            LevelFilter::Debug => log::LevelFilter::Debug,
            LevelFilter::Info => log::LevelFilter::Info,
            LevelFilter::Warn => log::LevelFilter::Warn,
            LevelFilter::Error => log::LevelFilter::Error,
        }
    }
}
impl<'de> Deserialize<'de> for LevelFilter {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;
        let key = String::deserialize(deserializer)?;
        LevelFilter::from_str(&key).map_err(|_| D::Error::custom("Invalid LevelFilter"))
    }
}

/// Error type for [`<LevelFilter as FromStr>::from_str`].
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("Failed to parse string to level filter: {0}")]
pub struct LevelFilterFromStrError(String);

impl FromStr for LevelFilter {
    type Err = LevelFilterFromStrError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "off" => Ok(Self::Off),
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(LevelFilterFromStrError(String::from(s))),
        }
    }
}

#[cfg(test)]
mod tests {
    use log::Level;
    use vmm_sys_util::tempfile::TempFile;

    use super::*;

    #[test]
    fn test_levelfilter_from_str() {
        for (level, level_enum) in [
            ("off", LevelFilter::Off),
            ("TRACE", LevelFilter::Trace),
            ("Debug", LevelFilter::Debug),
            ("info", LevelFilter::Info),
            ("warn", LevelFilter::Warn),
            ("Warning", LevelFilter::Warn),
            ("error", LevelFilter::Error),
        ] {
            assert_eq!(LevelFilter::from_str(level), Ok(level_enum));
        }
        assert_eq!(
            LevelFilter::from_str("bad"),
            Err(LevelFilterFromStrError(String::from("bad")))
        );
        assert_eq!(
            log::LevelFilter::from(LevelFilter::Debug),
            log::LevelFilter::Debug
        );
    }

    #[test]
    fn test_logger_config_deserialize() {
        let config: LoggerConfig = serde_json::from_str(
            r#"{ "log_path": "/tmp/rawtcp.log", "level": "Warning", "show_level": true }"#,
        )
        .unwrap();
        assert_eq!(
            config,
            LoggerConfig {
                log_path: Some(PathBuf::from("/tmp/rawtcp.log")),
                level: Some(LevelFilter::Warn),
                show_level: Some(true),
                show_log_origin: None,
                module: None,
            }
        );

        serde_json::from_str::<LoggerConfig>(r#"{ "level": "blah" }"#).unwrap_err();
        serde_json::from_str::<LoggerConfig>(r#"{ "colour": true }"#).unwrap_err();
    }

    #[test]
    fn test_logger() {
        let file = TempFile::new().unwrap();
        let path = file.as_path().to_path_buf();

        let logger = Logger(Mutex::new(LoggerConfiguration {
            target: None,
            filter: LogFilter { module: None },
            format: LogFormat {
                show_level: false,
                show_log_origin: false,
            },
        }));
        logger
            .update(LoggerConfig {
                log_path: Some(path.clone()),
                level: Some(LevelFilter::Debug),
                show_level: Some(true),
                show_log_origin: Some(true),
                module: Some(String::from("rawtcp")),
            })
            .unwrap();

        assert!(logger.enabled(&Metadata::builder().level(Level::Debug).build()));

        let filtered = Record::builder()
            .args(format_args!("dropped"))
            .metadata(Metadata::builder().level(Level::Warn).build())
            .module_path(Some("other::module"))
            .build();
        logger.log(&filtered);

        let record = Record::builder()
            .args(format_args!("segment dropped"))
            .metadata(Metadata::builder().level(Level::Warn).build())
            .file(Some("tcp/dispatcher.rs"))
            .line(Some(42))
            .module_path(Some("rawtcp::tcp::dispatcher"))
            .build();
        logger.log(&record);
        logger.flush();

        let contents = std::fs::read_to_string(&path).unwrap();
        let (_time, rest) = contents.split_once(' ').unwrap();
        let thread = thread::current().name().unwrap_or("-").to_string();
        assert_eq!(
            rest,
            format!("[{LOG_TAG}:{thread}:WARN:tcp/dispatcher.rs:42] segment dropped\n")
        );
    }
}

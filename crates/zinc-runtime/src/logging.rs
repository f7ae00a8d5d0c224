//! Subscriber setup for the runtime.
//!
//! [`init_from_config`] is what [`ZincRuntime`](crate::ZincRuntime) calls.
//! Embedders that want a different setup can use the builder directly:
//!
//! ```rust,ignore
//! LoggingBuilder::new()
//!     .level(tracing::Level::DEBUG)
//!     .directive("zinc_core::context=trace")
//!     .span_events(SpanEvents::LIFECYCLE)
//!     .init();
//! ```
//!
//! A set `RUST_LOG` takes the place of the base level. Per-target filters
//! from the configuration still apply on top of it.

use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::Level;
use tracing::level_filters::LevelFilter;
use tracing::debug;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use crate::config::{LogFormat, LogOutput, LogRotation, LoggingConfig, SpanEventConfig};

/// Span events written alongside regular log lines.
///
/// Dispatch runs inside a `dispatch` span, so [`SpanEvents::LIFECYCLE`] shows
/// how long each cascading walk took.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpanEvents {
    pub new: bool,
    pub enter: bool,
    pub exit: bool,
    pub close: bool,
}

impl SpanEvents {
    pub const NONE: Self = Self::of(false, false, false, false);
    /// Creation and close only.
    pub const LIFECYCLE: Self = Self::of(true, false, false, true);
    pub const FULL: Self = Self::of(true, true, true, true);

    const fn of(new: bool, enter: bool, exit: bool, close: bool) -> Self {
        Self {
            new,
            enter,
            exit,
            close,
        }
    }

    fn fmt_span(self) -> FmtSpan {
        [
            (self.new, FmtSpan::NEW),
            (self.enter, FmtSpan::ENTER),
            (self.exit, FmtSpan::EXIT),
            (self.close, FmtSpan::CLOSE),
        ]
        .into_iter()
        .filter(|(on, _)| *on)
        .fold(FmtSpan::NONE, |acc, (_, span)| acc | span)
    }
}

impl From<&SpanEventConfig> for SpanEvents {
    fn from(c: &SpanEventConfig) -> Self {
        Self::of(c.new, c.enter, c.exit, c.close)
    }
}

/// Installs the subscriber described by `config`, unless one is already
/// installed.
pub fn init_from_config(config: &LoggingConfig) {
    LoggingBuilder::from_config(config).init();
}

/// The file currently written by a file-output configuration.
///
/// With rotation enabled the appender adds a date suffix, so the newest
/// file carrying the configured name as prefix is returned.
pub fn current_log_file(config: &LoggingConfig) -> Option<PathBuf> {
    if config.output != LogOutput::File {
        return None;
    }
    let path = config.file_path.as_ref()?;
    if config.rotation == LogRotation::Never {
        return Some(path.clone());
    }
    let prefix = path.file_name()?.to_str()?;
    fs::read_dir(parent_dir(path))
        .ok()?
        .filter_map(Result::ok)
        .filter(|entry| entry.file_name().to_str().is_some_and(|n| n.starts_with(prefix)))
        .filter_map(|entry| Some((entry.metadata().ok()?.modified().ok()?, entry.path())))
        .max_by_key(|(modified, _)| *modified)
        .map(|(_, path)| path)
}

fn parent_dir(path: &Path) -> &Path {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
}

/// Where log files go and how they roll over.
#[derive(Debug, Clone, Default)]
struct FileTarget {
    path: PathBuf,
    rotation: LogRotation,
    keep: usize,
}

impl FileTarget {
    fn open(&self) -> Option<RollingFileAppender> {
        let rotation = match self.rotation {
            LogRotation::Never => Rotation::NEVER,
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Daily => Rotation::DAILY,
        };
        let prefix = self.path.file_name().unwrap_or(OsStr::new("zinc.log"));
        let mut builder = RollingFileAppender::builder()
            .rotation(rotation)
            .filename_prefix(prefix.to_string_lossy());
        if self.keep > 0 && self.rotation != LogRotation::Never {
            builder = builder.max_log_files(self.keep);
        }
        builder
            .build(parent_dir(&self.path))
            .inspect_err(|error| eprintln!("Cannot open log file {}: {error}", self.path.display()))
            .ok()
    }
}

/// Collects subscriber settings, then installs them globally.
#[derive(Debug, Default)]
pub struct LoggingBuilder {
    level: Option<Level>,
    directives: Vec<String>,
    span_events: SpanEvents,
    format: LogFormat,
    output: LogOutput,
    file: Option<FileTarget>,
    thread_ids: bool,
    source_location: bool,
}

impl LoggingBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &LoggingConfig) -> Self {
        let mut filters: Vec<_> = config.filters.iter().collect();
        filters.sort_by(|a, b| a.0.cmp(b.0));
        Self {
            level: Some(config.level.to_tracing_level()),
            directives: filters
                .into_iter()
                .map(|(target, level)| format!("{target}={level}"))
                .collect(),
            span_events: SpanEvents::from(&config.span_events),
            format: config.format,
            output: config.output,
            file: config.file_path.clone().map(|path| FileTarget {
                path,
                rotation: config.rotation,
                keep: config.max_files as usize,
            }),
            thread_ids: config.thread_ids,
            source_location: config.file_location,
        }
    }

    pub fn level(mut self, level: Level) -> Self {
        self.level = Some(level);
        self
    }

    /// Adds a filter directive such as `zinc_core::context=trace`.
    pub fn directive(mut self, directive: &str) -> Self {
        self.directives.push(directive.to_string());
        self
    }

    pub fn span_events(mut self, events: SpanEvents) -> Self {
        self.span_events = events;
        self
    }

    pub fn format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn output(mut self, output: LogOutput) -> Self {
        self.output = output;
        self
    }

    /// Log file for [`LogOutput::File`], kept as `keep` rotated files.
    pub fn file(mut self, path: PathBuf, rotation: LogRotation, keep: usize) -> Self {
        self.file = Some(FileTarget {
            path,
            rotation,
            keep,
        });
        self
    }

    pub fn thread_ids(mut self, enabled: bool) -> Self {
        self.thread_ids = enabled;
        self
    }

    /// Prints the file and line of each event.
    pub fn source_location(mut self, enabled: bool) -> Self {
        self.source_location = enabled;
        self
    }

    fn env_filter(&self) -> EnvFilter {
        let base = LevelFilter::from_level(self.level.unwrap_or(Level::INFO));
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::default().add_directive(base.into()));
        self.directives
            .iter()
            .fold(filter, |filter, raw| match raw.parse() {
                Ok(directive) => filter.add_directive(directive),
                Err(error) => {
                    eprintln!("Ignoring invalid log directive {raw:?}: {error}");
                    filter
                }
            })
    }

    fn writer(&self) -> BoxMakeWriter {
        match self.output {
            LogOutput::Stdout => BoxMakeWriter::new(std::io::stdout),
            LogOutput::Stderr => BoxMakeWriter::new(std::io::stderr),
            LogOutput::File => match self.file.as_ref().and_then(FileTarget::open) {
                Some(appender) => BoxMakeWriter::new(appender),
                None => {
                    eprintln!("File logging needs a usable file path, writing to stdout");
                    BoxMakeWriter::new(std::io::stdout)
                }
            },
        }
    }

    /// Installs the subscriber, ignoring an already installed one.
    pub fn init(self) {
        if let Err(error) = self.try_init() {
            debug!(%error, "Logging was already initialized");
        }
    }

    pub fn try_init(self) -> Result<(), TryInitError> {
        let spans = self.span_events.fmt_span();
        let writer = self.writer();

        macro_rules! decorated {
            ($layer:expr) => {
                $layer
                    .with_span_events(spans.clone())
                    .with_thread_ids(self.thread_ids)
                    .with_file(self.source_location)
                    .with_line_number(self.source_location)
                    .with_writer(writer)
                    .boxed()
            };
        }

        let layer: Box<dyn Layer<Registry> + Send + Sync> = match self.format {
            #[cfg(feature = "json-log")]
            LogFormat::Json => fmt::layer()
                .json()
                .with_span_events(spans.clone())
                .with_writer(writer)
                .boxed(),
            LogFormat::Compact => decorated!(fmt::layer().compact()),
            LogFormat::Pretty => decorated!(fmt::layer().pretty()),
            // JSON without the `json-log` feature uses the full format.
            _ => decorated!(fmt::layer()),
        };
        tracing_subscriber::registry()
            .with(layer)
            .with(self.env_filter())
            .try_init()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogLevel;

    #[test]
    fn test_from_config_collects_directives() {
        let mut config = LoggingConfig::default();
        config.level = LogLevel::Warn;
        config.filters.insert("zinc_core".into(), LogLevel::Trace);
        config.span_events.close = true;

        let builder = LoggingBuilder::from_config(&config);
        assert_eq!(builder.level, Some(tracing::Level::WARN));
        assert_eq!(builder.directives, vec!["zinc_core=trace"]);
        assert_eq!(
            builder.span_events,
            SpanEvents {
                close: true,
                ..SpanEvents::NONE
            }
        );
    }

    #[test]
    fn test_file_target_and_spans() {
        let mut config = LoggingConfig::default();
        assert!(LoggingBuilder::from_config(&config).file.is_none());

        config.file_path = Some(PathBuf::from("logs/zinc.log"));
        config.rotation = LogRotation::Daily;
        let target = LoggingBuilder::from_config(&config).file.unwrap();
        assert_eq!(target.path, PathBuf::from("logs/zinc.log"));
        assert_eq!(target.rotation, LogRotation::Daily);
        assert_eq!(target.keep, config.max_files as usize);

        assert_eq!(SpanEvents::NONE.fmt_span(), FmtSpan::NONE);
        assert_eq!(
            SpanEvents::LIFECYCLE.fmt_span(),
            FmtSpan::NEW | FmtSpan::CLOSE
        );
    }

    #[test]
    fn test_current_log_file() {
        let mut config = LoggingConfig::default();
        assert_eq!(current_log_file(&config), None);

        config.output = LogOutput::File;
        config.file_path = Some(PathBuf::from("logs/zinc.log"));
        assert_eq!(
            current_log_file(&config),
            Some(PathBuf::from("logs/zinc.log"))
        );
    }
}

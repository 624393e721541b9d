use std::io::IsTerminal;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::de::Visitor;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::Subscriber;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// Per-target log levels, stored as a `{ "target": "level" }` map.
#[derive(Debug, Default, Clone)]
pub struct LoggerTargets {
    directives: Vec<Directive>,
}

impl LoggerTargets {
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        crate::serde_helpers::load_json_from_file(path)
    }

    pub fn build_filter(&self) -> EnvFilter {
        self.directives
            .iter()
            .fold(EnvFilter::default(), |filter, item| {
                filter.add_directive(item.clone())
            })
    }
}

impl<'de> Deserialize<'de> for LoggerTargets {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct TargetsVisitor;

        impl<'de> Visitor<'de> for TargetsVisitor {
            type Value = LoggerTargets;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a map of targets and levels")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: serde::de::MapAccess<'de>,
            {
                let mut directives = Vec::new();
                while let Some((target, level)) = map.next_entry::<String, String>()? {
                    let directive = format!("{target}={level}")
                        .parse::<Directive>()
                        .map_err(serde::de::Error::custom)?;
                    directives.push(directive);
                }
                Ok(LoggerTargets { directives })
            }
        }

        deserializer.deserialize_map(TargetsVisitor)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggerConfig {
    pub outputs: Vec<LoggerOutput>,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            outputs: vec![LoggerOutput::Stderr(LoggerStderrOutput)],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LoggerOutput {
    Stderr(LoggerStderrOutput),
    File(LoggerFileOutput),
}

impl LoggerOutput {
    pub fn as_layer<S>(&self) -> Result<Box<dyn Layer<S> + Send + Sync + 'static>>
    where
        S: Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    {
        match self {
            Self::Stderr(stderr) => Ok(stderr.as_layer()),
            Self::File(file) => file.as_layer::<S>(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggerStderrOutput;

impl LoggerStderrOutput {
    pub fn as_layer<S>(&self) -> Box<dyn Layer<S> + Send + Sync + 'static>
    where
        S: Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    {
        let layer = fmt::layer().with_writer(std::io::stderr);
        if is_systemd_child() {
            layer.without_time().with_ansi(false).boxed()
        } else if !std::io::stderr().is_terminal() {
            layer.with_ansi(false).boxed()
        } else {
            layer.boxed()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggerFileOutput {
    pub dir: PathBuf,
    /// Write plain text lines instead of stackdriver JSON.
    #[serde(default)]
    pub human_readable: bool,
    /// Default: `shardscan.log`
    #[serde(default = "log_file_prefix")]
    pub file_prefix: String,
    /// Default: `25`
    #[serde(default = "max_log_files")]
    pub max_files: NonZeroUsize,
}

impl LoggerFileOutput {
    pub fn as_layer<S>(&self) -> Result<Box<dyn Layer<S> + Send + Sync + 'static>>
    where
        S: Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    {
        let writer = tracing_appender::rolling::Builder::new()
            .rotation(Rotation::HOURLY)
            .filename_prefix(&self.file_prefix)
            .max_log_files(self.max_files.get())
            .build(&self.dir)
            .with_context(|| format!("failed to open log dir {}", self.dir.display()))?;

        Ok(if self.human_readable {
            fmt::layer()
                .without_time()
                .with_ansi(false)
                .with_writer(writer)
                .boxed()
        } else {
            tracing_stackdriver::layer().with_writer(writer).boxed()
        })
    }
}

fn log_file_prefix() -> String {
    "shardscan.log".to_owned()
}

fn max_log_files() -> NonZeroUsize {
    NonZeroUsize::new(25).unwrap_or(NonZeroUsize::MIN)
}

/// Installs the global subscriber.
///
/// Filter priority: `RUST_LOG`, then the targets file, then `info`.
pub fn init_logger(config: &LoggerConfig, targets_path: Option<&Path>) -> Result<()> {
    let filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(value) if !value.is_empty() => {
            EnvFilter::try_new(&value).with_context(|| format!("invalid RUST_LOG: {value}"))?
        }
        _ => match targets_path {
            Some(path) => LoggerTargets::load_from(path)
                .with_context(|| format!("failed to load logger targets {}", path.display()))?
                .build_filter(),
            None => EnvFilter::new("info"),
        },
    };

    let mut layers = Vec::with_capacity(config.outputs.len());
    for output in &config.outputs {
        layers.push(output.as_layer()?);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .context("failed to install logger")
}

pub fn is_systemd_child() -> bool {
    #[cfg(target_os = "linux")]
    unsafe {
        libc::getppid() == 1
    }

    #[cfg(not(target_os = "linux"))]
    {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn targets_are_parsed_from_map() {
        let targets: LoggerTargets =
            serde_json::from_str(r#"{"shardscan_core":"debug","reqwest":"warn"}"#).unwrap();
        assert_eq!(targets.directives.len(), 2);

        let res = serde_json::from_str::<LoggerTargets>(r#"{"a":"very loud"}"#);
        assert!(res.is_err());
    }

    #[test]
    fn file_output_defaults() {
        let config: LoggerConfig =
            serde_json::from_str(r#"{"outputs":[{"type":"Stderr"},{"type":"File","dir":"logs"}]}"#)
                .unwrap();
        match &config.outputs[1] {
            LoggerOutput::File(file) => {
                assert_eq!(file.file_prefix, "shardscan.log");
                assert_eq!(file.max_files.get(), 25);
                assert!(!file.human_readable);
            }
            other => panic!("unexpected output: {other:?}"),
        }
    }
}

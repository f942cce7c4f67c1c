use anyhow::Context;
use serde::Deserialize;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{
  Registry, layer::SubscriberExt, util::SubscriberInitExt,
};

#[derive(
  Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq,
)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
  Error,
  Warn,
  #[default]
  Info,
  Debug,
  Trace,
}

impl From<tracing::Level> for LogLevel {
  fn from(level: tracing::Level) -> LogLevel {
    if level == tracing::Level::ERROR {
      LogLevel::Error
    } else if level == tracing::Level::WARN {
      LogLevel::Warn
    } else if level == tracing::Level::DEBUG {
      LogLevel::Debug
    } else if level == tracing::Level::TRACE {
      LogLevel::Trace
    } else {
      LogLevel::Info
    }
  }
}

impl From<LogLevel> for tracing::Level {
  fn from(level: LogLevel) -> tracing::Level {
    match level {
      LogLevel::Error => tracing::Level::ERROR,
      LogLevel::Warn => tracing::Level::WARN,
      LogLevel::Info => tracing::Level::INFO,
      LogLevel::Debug => tracing::Level::DEBUG,
      LogLevel::Trace => tracing::Level::TRACE,
    }
  }
}

#[derive(
  Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq,
)]
#[serde(rename_all = "lowercase")]
pub enum StdioLogMode {
  #[default]
  Standard,
  Json,
  None,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
  #[serde(default)]
  pub level: LogLevel,
  #[serde(default)]
  pub stdio: StdioLogMode,
  /// Whether to use the pretty (multi-line) stdio format.
  #[serde(default)]
  pub pretty: bool,
  /// Whether to include the emitting module in log lines.
  #[serde(default)]
  pub location: bool,
  #[serde(default = "default_ansi")]
  pub ansi: bool,
}

impl Default for LogConfig {
  fn default() -> LogConfig {
    LogConfig {
      level: LogLevel::default(),
      stdio: StdioLogMode::default(),
      pretty: false,
      location: false,
      ansi: true,
    }
  }
}

fn default_ansi() -> bool {
  true
}

pub fn init(config: &LogConfig) -> anyhow::Result<()> {
  let log_level: tracing::Level = config.level.into();

  let registry =
    Registry::default().with(LevelFilter::from(log_level));

  match (config.stdio, config.pretty) {
    (StdioLogMode::Standard, true) => registry
      .with(
        tracing_subscriber::fmt::layer()
          .pretty()
          .with_file(false)
          .with_line_number(false)
          .with_target(config.location)
          .with_ansi(config.ansi),
      )
      .try_init(),
    (StdioLogMode::Standard, false) => registry
      .with(
        tracing_subscriber::fmt::layer()
          .with_file(false)
          .with_line_number(false)
          .with_target(config.location)
          .with_ansi(config.ansi),
      )
      .try_init(),
    (StdioLogMode::Json, _) => registry
      .with(tracing_subscriber::fmt::layer().json())
      .try_init(),
    (StdioLogMode::None, _) => registry.try_init(),
  }
  .context("Failed to init logger")
}

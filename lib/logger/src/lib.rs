//! Initializes the `tracing` subscriber used by `xec-core` and its adapters.
//! Supports plain / pretty / json stdio output, optionally paired with an
//! OpenTelemetry OTLP exporter.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::{
  Registry, layer::SubscriberExt, util::SubscriberInitExt,
};

mod otel;

/// How log lines are rendered on stdout/stderr.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StdioLogMode {
  #[default]
  Standard,
  Json,
  None,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
  Error,
  Warn,
  #[default]
  Info,
  Debug,
  Trace,
}

impl From<LogLevel> for tracing::Level {
  fn from(level: LogLevel) -> Self {
    match level {
      LogLevel::Error => tracing::Level::ERROR,
      LogLevel::Warn => tracing::Level::WARN,
      LogLevel::Info => tracing::Level::INFO,
      LogLevel::Debug => tracing::Level::DEBUG,
      LogLevel::Trace => tracing::Level::TRACE,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
  pub level: LogLevel,
  pub stdio: StdioLogMode,
  pub pretty: bool,
  /// Empty string disables the OTLP exporter.
  pub otlp_endpoint: String,
  pub opentelemetry_service_name: String,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: LogLevel::Info,
      stdio: StdioLogMode::Standard,
      pretty: false,
      otlp_endpoint: String::new(),
      opentelemetry_service_name: "xec-core".to_string(),
    }
  }
}

/// Installs the global tracing subscriber.
pub fn init(config: &LogConfig) -> anyhow::Result<()> {
  let log_level: tracing::Level = config.level.into();

  let registry =
    Registry::default().with(LevelFilter::from(log_level));

  let use_otel = !config.otlp_endpoint.is_empty();

  match (config.stdio, use_otel, config.pretty) {
    (StdioLogMode::Standard, true, true) => {
      let tracer = otel::tracer(
        &config.otlp_endpoint,
        config.opentelemetry_service_name.clone(),
      );
      registry
        .with(
          tracing_subscriber::fmt::layer()
            .pretty()
            .with_file(false)
            .with_line_number(false),
        )
        .with(OpenTelemetryLayer::new(tracer))
        .try_init()
    }
    (StdioLogMode::Standard, true, false) => {
      let tracer = otel::tracer(
        &config.otlp_endpoint,
        config.opentelemetry_service_name.clone(),
      );
      registry
        .with(
          tracing_subscriber::fmt::layer()
            .with_file(false)
            .with_line_number(false),
        )
        .with(OpenTelemetryLayer::new(tracer))
        .try_init()
    }

    (StdioLogMode::Json, true, _) => {
      let tracer = otel::tracer(
        &config.otlp_endpoint,
        config.opentelemetry_service_name.clone(),
      );
      registry
        .with(tracing_subscriber::fmt::layer().json())
        .with(OpenTelemetryLayer::new(tracer))
        .try_init()
    }

    (StdioLogMode::Standard, false, true) => registry
      .with(
        tracing_subscriber::fmt::layer()
          .pretty()
          .with_file(false)
          .with_line_number(false),
      )
      .try_init(),
    (StdioLogMode::Standard, false, false) => registry
      .with(
        tracing_subscriber::fmt::layer()
          .with_file(false)
          .with_line_number(false),
      )
      .try_init(),

    (StdioLogMode::Json, false, _) => registry
      .with(tracing_subscriber::fmt::layer().json())
      .try_init(),

    (StdioLogMode::None, true, _) => {
      let tracer = otel::tracer(
        &config.otlp_endpoint,
        config.opentelemetry_service_name.clone(),
      );
      registry.with(OpenTelemetryLayer::new(tracer)).try_init()
    }
    (StdioLogMode::None, false, _) => Ok(()),
  }
  .context("failed to init logger")
}

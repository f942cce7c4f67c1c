use std::{path::PathBuf, sync::OnceLock};

use anyhow::Context;
use clap::Parser;
use colored::Colorize;
use logger::{LogConfig, LogLevel};
use serde::Deserialize;

/// # Scatter Gateway Command Line Arguments.
///
/// The final configuration is built from the config file,
/// the environment, and these args, in rising priority.
#[derive(Parser)]
#[command(name = "gateway", author, about, version)]
pub struct CliArgs {
  /// Sets the path of the config file to use.
  #[arg(long, short = 'c')]
  pub config_path: Option<PathBuf>,

  /// Configure the logging level: error, warn, info, debug, trace.
  /// If passed, will override any other log_level set.
  #[arg(long)]
  pub log_level: Option<tracing::Level>,
}

/// # Scatter Gateway Environment Variables
///
/// Passed in the traditional `UPPER_SNAKE_CASE` format.
/// Overrides the equivalent config file parameter; overridden
/// by the equivalent [CliArgs] parameter.
#[derive(Deserialize)]
pub struct Env {
  #[serde(default)]
  pub scatter_config_path: Option<PathBuf>,
  #[serde(default)]
  pub scatter_bind_ip: Option<String>,
  #[serde(default)]
  pub scatter_port: Option<u16>,
  #[serde(default)]
  pub scatter_log_level: Option<LogLevel>,
  #[serde(default)]
  pub scatter_concurrency: Option<usize>,
  #[serde(default)]
  pub scatter_fanout_timeout_ms: Option<u64>,
  #[serde(default)]
  pub scatter_client_timeout_ms: Option<u64>,
  /// Override `authorization`
  #[serde(default)]
  pub scatter_authorization: Option<String>,
  /// Override `authorization` with the contents of a file
  #[serde(default)]
  pub scatter_authorization_file: Option<PathBuf>,
}

/// One discovered back-end service. Either a fixed
/// `instances` list, or a DNS name polled on an interval.
#[derive(Deserialize, Debug, Clone)]
pub struct ServiceConfig {
  /// The discovery key, eg. `talaria`.
  pub key: String,
  /// Fixed instances for this service. When set, DNS
  /// discovery is bypassed for this key.
  #[serde(default)]
  pub instances: Vec<String>,
  /// The DNS name resolved to the instance set.
  #[serde(default)]
  pub host: String,
  /// The port every discovered instance listens on.
  #[serde(default)]
  pub port: u16,
  /// Scheme applied to discovered instances.
  #[serde(default = "default_scheme")]
  pub scheme: String,
  /// How often the DNS record set is re-resolved.
  #[serde(default = "default_refresh_ms")]
  pub refresh_ms: u64,
}

fn default_scheme() -> String {
  String::from("https")
}

fn default_refresh_ms() -> u64 {
  30_000
}

/// # Scatter Gateway Configuration
///
/// The gateway fans every inbound request out to either the
/// `endpoints` list (when configured) or to the instances
/// discovered for each entry of `services`.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct GatewayConfig {
  /// IP to bind the gateway server. Default: `[::]`.
  pub bind_ip: String,
  /// Port to bind the gateway server. Default: `4000`.
  pub port: u16,

  /// Static fanout endpoints. When empty, `services`
  /// discovery drives the endpoint set instead.
  pub endpoints: Vec<String>,
  /// Discovered back-end services.
  pub services: Vec<ServiceConfig>,

  /// Total deadline per inbound request. Default: `45000`.
  pub fanout_timeout_ms: u64,
  /// Per-child client timeout. Default: `30000`.
  pub client_timeout_ms: u64,
  /// Maximum concurrent fanouts across the process.
  /// Default: `1000`.
  pub concurrency: usize,
  /// Follow at most this many redirects per child.
  /// Default: `0`.
  pub max_redirects: usize,
  /// Headers never carried across redirects.
  pub redirect_exclude_headers: Vec<String>,
  /// Idle connections kept per back-end host. Default: `20`.
  pub max_idle_conns_per_host: usize,

  /// Credential attached to every child request, opaque to
  /// the gateway. Empty disables.
  pub authorization: String,

  /// Gateway-local path prefix stripped from child requests.
  /// Empty disables.
  pub strip_path_prefix: String,

  /// Header carrying the routing key of an inbound request.
  /// Default: `X-Scatter-Device-Name`.
  pub device_header: String,
  /// Header the back-ends expect the routing key on. Empty
  /// disables the copy.
  pub destination_header: String,
  /// Inbound headers forwarded to every child request.
  pub forward_headers: Vec<String>,
  /// Child response headers copied onto the outbound
  /// response.
  pub response_headers: Vec<String>,

  /// Scheme applied to discovered instances that come without
  /// one. Default: `https`.
  pub default_scheme: String,
  /// Debounce applied to discovery updates before they
  /// replace the accessor set. `0` disables. Default: `0`.
  pub discovery_debounce_ms: u64,

  pub logging: LogConfig,
}

impl Default for GatewayConfig {
  fn default() -> GatewayConfig {
    GatewayConfig {
      bind_ip: String::from("[::]"),
      port: 4000,
      endpoints: Vec::new(),
      services: Vec::new(),
      fanout_timeout_ms: 45_000,
      client_timeout_ms: 30_000,
      concurrency: 1_000,
      max_redirects: 0,
      redirect_exclude_headers: Vec::new(),
      max_idle_conns_per_host: 20,
      authorization: String::new(),
      strip_path_prefix: String::new(),
      device_header: String::from("X-Scatter-Device-Name"),
      destination_header: String::new(),
      forward_headers: Vec::new(),
      response_headers: Vec::new(),
      default_scheme: String::from("https"),
      discovery_debounce_ms: 0,
      logging: LogConfig::default(),
    }
  }
}

impl GatewayConfig {
  /// Safe to log.
  pub fn sanitized(&self) -> GatewayConfig {
    let mut config = self.clone();
    if !config.authorization.is_empty() {
      config.authorization = String::from("##############");
    }
    config
  }
}

pub fn gateway_args() -> &'static CliArgs {
  static GATEWAY_ARGS: OnceLock<CliArgs> = OnceLock::new();
  GATEWAY_ARGS.get_or_init(CliArgs::parse)
}

pub fn gateway_config() -> &'static GatewayConfig {
  static GATEWAY_CONFIG: OnceLock<GatewayConfig> = OnceLock::new();
  GATEWAY_CONFIG.get_or_init(|| {
    let env: Env = envy::from_env()
      .expect("Failed to parse Scatter Gateway environment");
    let args = gateway_args();

    let config_path = args
      .config_path
      .as_ref()
      .or(env.scatter_config_path.as_ref());

    let config = match config_path {
      Some(path) => {
        let contents = std::fs::read_to_string(path)
          .with_context(|| {
            format!("Failed to read config file at {path:?}")
          })
          .unwrap();
        toml::from_str(&contents)
          .with_context(|| {
            format!("Failed to parse config file at {path:?}")
          })
          .unwrap()
      }
      None => {
        println!(
          "{}: No config path found, using default config",
          "INFO".green(),
        );
        GatewayConfig::default()
      }
    };

    // Recreating GatewayConfig here makes sure all env / cli
    // overrides are applied.
    GatewayConfig {
      bind_ip: env.scatter_bind_ip.unwrap_or(config.bind_ip),
      port: env.scatter_port.unwrap_or(config.port),
      concurrency: env
        .scatter_concurrency
        .unwrap_or(config.concurrency),
      fanout_timeout_ms: env
        .scatter_fanout_timeout_ms
        .unwrap_or(config.fanout_timeout_ms),
      client_timeout_ms: env
        .scatter_client_timeout_ms
        .unwrap_or(config.client_timeout_ms),
      authorization: maybe_read_item_from_file(
        env.scatter_authorization_file,
        env.scatter_authorization,
      )
      .unwrap_or(config.authorization),
      logging: LogConfig {
        level: args
          .log_level
          .map(LogLevel::from)
          .or(env.scatter_log_level)
          .unwrap_or(config.logging.level),
        ..config.logging
      },
      ..config
    }
  })
}

fn maybe_read_item_from_file(
  file: Option<PathBuf>,
  item: Option<String>,
) -> Option<String> {
  match file {
    Some(path) => {
      let contents = std::fs::read_to_string(&path)
        .with_context(|| {
          format!("Failed to read file at {path:?}")
        })
        .unwrap();
      Some(contents.trim().to_string())
    }
    None => item,
  }
}

#[cfg(test)]
mod tests {
  use logger::StdioLogMode;

  use super::*;

  #[test]
  fn defaults_match_the_documented_values() {
    let config = GatewayConfig::default();
    assert_eq!(config.port, 4000);
    assert_eq!(config.fanout_timeout_ms, 45_000);
    assert_eq!(config.client_timeout_ms, 30_000);
    assert_eq!(config.concurrency, 1_000);
    assert_eq!(config.max_redirects, 0);
    assert_eq!(config.max_idle_conns_per_host, 20);
    assert_eq!(config.device_header, "X-Scatter-Device-Name");
  }

  #[test]
  fn config_file_fills_unset_fields_with_defaults() {
    let config: GatewayConfig = toml::from_str(
      r#"
port = 8080

[[services]]
key = "talaria"
host = "talaria.example.net"
port = 6200

[[services]]
key = "talaria-canary"
instances = ["https://canary-a:6200", "https://canary-b:6200"]

[logging]
level = "debug"
stdio = "json"
"#,
    )
    .unwrap();

    assert_eq!(config.port, 8080);
    assert_eq!(config.fanout_timeout_ms, 45_000);
    assert_eq!(config.services.len(), 2);
    assert_eq!(config.services[0].scheme, "https");
    assert_eq!(config.services[0].refresh_ms, 30_000);
    assert_eq!(config.services[1].instances.len(), 2);
    assert!(config.services[1].host.is_empty());
    assert_eq!(config.logging.level, LogLevel::Debug);
    assert_eq!(config.logging.stdio, StdioLogMode::Json);
  }

  #[test]
  fn sanitized_redacts_the_authorization() {
    let config = GatewayConfig {
      authorization: String::from("Basic dXNlcjpwYXNz"),
      ..Default::default()
    };
    let sanitized = config.sanitized();
    assert!(!sanitized.authorization.contains("dXNlcjpwYXNz"));
    assert!(config.sanitized().authorization.starts_with('#'));
  }
}

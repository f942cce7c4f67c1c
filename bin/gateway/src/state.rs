use std::{
  sync::{Arc, OnceLock},
  time::Duration,
};

use accessor::ring_factory;
use admission::ConcurrencyLimiter;
use anyhow::Context;
use axum::http::HeaderName;
use discovery::{
  DelayedListener, DnsInstancer, Filter, Instancer, Listener,
  Listeners, Monitor, StaticInstancer,
};
use endpoints::{
  Endpoints, FixedEndpoints, ServiceEndpoints, device_id_key,
};
use fanout::{
  Authorize, DestinationHeader, Fanout, ForwardBody,
  ForwardHeaders, HttpTransactor, StripPrefix, TransactorOptions,
};
use headerset::HeaderSet;
use tokio::sync::Mutex;

use crate::config::{ServiceConfig, gateway_config};

static FANOUT: OnceLock<Arc<Fanout>> = OnceLock::new();

pub fn fanout_handler() -> &'static Arc<Fanout> {
  FANOUT.get().unwrap_or_else(|| {
    error!(
      "FATAL: fanout handler accessed before initialized | Ensure init_fanout() is called during startup | Exiting..."
    );
    std::process::exit(1)
  })
}

pub fn limiter() -> &'static Arc<ConcurrencyLimiter> {
  static LIMITER: OnceLock<Arc<ConcurrencyLimiter>> =
    OnceLock::new();
  LIMITER.get_or_init(|| {
    Arc::new(ConcurrencyLimiter::new(gateway_config().concurrency))
  })
}

fn monitor_slot() -> &'static Mutex<Option<Monitor>> {
  static MONITOR: OnceLock<Mutex<Option<Monitor>>> = OnceLock::new();
  MONITOR.get_or_init(Default::default)
}

/// Must be called in app startup sequence, after the runtime
/// is up (discovery tasks are spawned here).
pub async fn init_fanout() -> anyhow::Result<()> {
  let (fanout, monitor) = build_fanout().await?;
  FANOUT
    .set(fanout)
    .map_err(|_| anyhow::anyhow!("init_fanout called twice"))?;
  *monitor_slot().lock().await = monitor;
  Ok(())
}

/// Stops discovery and waits for the monitor tasks to wind
/// down. The fanout handler keeps serving with the last
/// accessor state until the process exits.
pub async fn shutdown_monitor() {
  let monitor = monitor_slot().lock().await.take();
  if let Some(monitor) = monitor {
    monitor.shutdown().await;
  }
}

async fn build_fanout()
-> anyhow::Result<(Arc<Fanout>, Option<Monitor>)> {
  let config = gateway_config();

  let device_header =
    HeaderName::from_bytes(config.device_header.as_bytes())
      .context("Invalid device_header name")?;

  let (endpoints, monitor): (Arc<dyn Endpoints>, Option<Monitor>) =
    if !config.endpoints.is_empty() {
      let fixed = FixedEndpoints::new(&config.endpoints)
        .context("Invalid static endpoints")?;
      info!("Fanout endpoints: {} static", fixed.len());
      (Arc::new(fixed), None)
    } else {
      if config.services.is_empty() {
        return Err(anyhow::anyhow!(
          "Neither 'endpoints' nor 'services' are configured"
        ));
      }
      let service = Arc::new(ServiceEndpoints::new(
        device_id_key(device_header.clone()),
        ring_factory(),
      ));
      let listener: Arc<dyn Listener> =
        if config.discovery_debounce_ms > 0 {
          Arc::new(DelayedListener::new(
            Duration::from_millis(config.discovery_debounce_ms),
            service.clone(),
          ))
        } else {
          service.clone()
        };
      let instancers = config
        .services
        .iter()
        .map(build_instancer)
        .collect::<anyhow::Result<Vec<_>>>()?;
      let monitor = Monitor::start(
        instancers,
        Filter::with_default_scheme(&config.default_scheme),
        Listeners::new(vec![listener]),
        None,
      );
      (service, Some(monitor))
    };

  let transactor = HttpTransactor::new(&TransactorOptions {
    client_timeout: Duration::from_millis(config.client_timeout_ms),
    max_idle_conns_per_host: config.max_idle_conns_per_host,
    max_redirects: config.max_redirects,
    redirect_exclude_headers: HeaderSet::new(
      &config.redirect_exclude_headers,
    )
    .context("Invalid redirect_exclude_headers")?,
  })?;

  let mut fanout = Fanout::new(endpoints, Arc::new(transactor))
    .with_fanout_timeout(Duration::from_millis(
      config.fanout_timeout_ms,
    ));

  if !config.strip_path_prefix.is_empty() {
    fanout = fanout.with_before(Arc::new(StripPrefix(
      config.strip_path_prefix.clone(),
    )));
  }

  fanout = fanout
    .with_before(Arc::new(ForwardHeaders(
      HeaderSet::new(&config.forward_headers)
        .context("Invalid forward_headers")?,
    )))
    .with_before(Arc::new(ForwardBody))
    .with_response_headers(
      HeaderSet::new(&config.response_headers)
        .context("Invalid response_headers")?,
    );

  if !config.destination_header.is_empty() {
    fanout = fanout.with_before(Arc::new(DestinationHeader {
      from: device_header,
      to: HeaderName::from_bytes(
        config.destination_header.as_bytes(),
      )
      .context("Invalid destination_header name")?,
    }));
  }

  if !config.authorization.is_empty() {
    fanout = fanout.with_before(Arc::new(
      Authorize::new(&config.authorization)
        .context("Invalid authorization credential")?,
    ));
  }

  Ok((Arc::new(fanout), monitor))
}

fn build_instancer(
  service: &ServiceConfig,
) -> anyhow::Result<Arc<dyn Instancer>> {
  if !service.instances.is_empty() {
    info!(
      "Discovering {} from {} fixed instances",
      service.key,
      service.instances.len()
    );
    return Ok(Arc::new(StaticInstancer::new(
      &service.key,
      service.instances.clone(),
    )));
  }
  if service.host.is_empty() || service.port == 0 {
    return Err(anyhow::anyhow!(
      "Service {} needs either 'instances' or 'host' + 'port'",
      service.key
    ));
  }
  let instancer = DnsInstancer::new(
    &service.key,
    &service.host,
    service.port,
    &service.scheme,
    Duration::from_millis(service.refresh_ms),
  )
  .with_context(|| {
    format!("Failed to build dns instancer for {}", service.key)
  })?;
  info!(
    "Discovering {} at {}:{} every {}ms",
    service.key, service.host, service.port, service.refresh_ms
  );
  Ok(Arc::new(instancer))
}

use std::{net::SocketAddr, str::FromStr};

use anyhow::Context;

use crate::config::gateway_config;

#[macro_use]
extern crate tracing;

mod api;
mod config;
mod state;

async fn app() -> anyhow::Result<()> {
  let config = gateway_config();
  logger::init(&config.logging)?;

  info!("Scatter Gateway version: v{}", env!("CARGO_PKG_VERSION"));
  info!("{:?}", config.sanitized());

  state::init_fanout().await?;

  let addr = format!("{}:{}", config.bind_ip, config.port);
  let socket_addr = SocketAddr::from_str(&addr)
    .context("Failed to parse listen address")?;

  info!("Scatter Gateway starting on http://{socket_addr}");

  let app = api::app().into_make_service();
  axum_server::bind(socket_addr)
    .serve(app)
    .await
    .context("Server crashed")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  dotenvy::dotenv().ok();

  let mut term_signal = tokio::signal::unix::signal(
    tokio::signal::unix::SignalKind::terminate(),
  )?;

  let app = tokio::spawn(app());

  tokio::select! {
    res = app => return res?,
    _ = term_signal.recv() => {
      info!("Stopping discovery monitor for shutdown");
      state::shutdown_monitor().await;
    }
  }

  Ok(())
}

use std::sync::Arc;

use anyhow::{Context, anyhow};
use axum::http::{HeaderMap, HeaderName, Method, Uri};
use bytes::Bytes;
use device::DeviceId;
use tokio_util::sync::CancellationToken;
use url::Url;

mod fixed;
mod service;

pub use fixed::FixedEndpoints;
pub use service::ServiceEndpoints;

/// Default header carrying the routing key of an inbound
/// request, typically a device identifier like
/// `mac:112233445566`.
pub const DEVICE_NAME_HEADER: HeaderName =
  HeaderName::from_static("x-scatter-device-name");

/// Explicit per-request record handed to resolvers and hooks:
/// the captured body, the inbound header snapshot, and the
/// derived cancellation scope.
#[derive(Clone, Debug)]
pub struct RequestState {
  pub method: Method,
  pub uri: Uri,
  pub headers: HeaderMap,
  pub body: Bytes,
  pub cancel: CancellationToken,
}

/// Selects, per inbound request, the set of child urls for one
/// fanout.
///
/// Total: returns a non-empty url list or an error. An empty
/// list is only legal when the underlying configuration is
/// itself empty, and the caller treats it like an error.
pub trait Endpoints: Send + Sync + 'static {
  fn fanout_urls(
    &self,
    request: &RequestState,
  ) -> anyhow::Result<Vec<Url>>;
}

/// Extracts the hash key from an inbound request.
pub type KeyFunc =
  Arc<dyn Fn(&RequestState) -> anyhow::Result<Vec<u8>> + Send + Sync>;

/// The default key function: the canonicalised device id
/// carried by the configured header. Canonicalising first
/// keeps `MAC:11-22-...` and `mac:1122...` on the same ring
/// position.
pub fn device_id_key(header: HeaderName) -> KeyFunc {
  Arc::new(move |request| {
    let value = request
      .headers
      .get(&header)
      .with_context(|| {
        format!("Missing routing key header: {header}")
      })?
      .to_str()
      .with_context(|| {
        format!("Routing key header {header} is not valid utf-8")
      })?;
    let id = DeviceId::parse(value)?;
    Ok(id.as_bytes().to_vec())
  })
}

/// Copy the inbound path and query onto a child base url.
fn apply_request_parts(url: &mut Url, request: &RequestState) {
  url.set_path(request.uri.path());
  url.set_query(request.uri.query());
}

fn parse_base(raw: &str) -> anyhow::Result<Url> {
  let url = Url::parse(raw)
    .with_context(|| format!("Invalid endpoint url: {raw}"))?;
  if url.host_str().is_none() {
    return Err(anyhow!("Endpoint url has no host: {raw}"));
  }
  if url.query().is_some() {
    return Err(anyhow!(
      "Endpoint url must not carry a query string: {raw}"
    ));
  }
  Ok(url)
}

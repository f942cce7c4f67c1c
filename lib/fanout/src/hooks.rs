use axum::http::{
  HeaderMap, HeaderName, HeaderValue,
  header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE},
};
use endpoints::RequestState;
use headerset::HeaderSet;

use crate::{FanoutResult, OutboundRequest};

/// Decorates a child request before dispatch. Hooks run in
/// their configured order and must not block.
pub trait BeforeHook: Send + Sync {
  fn before(
    &self,
    child: &mut OutboundRequest,
    state: &RequestState,
  ) -> anyhow::Result<()>;
}

/// Runs against the terminating result before the outbound
/// response is written.
pub trait AfterHook: Send + Sync {
  fn after(&self, outbound: &mut HeaderMap, result: &FanoutResult);
}

/// Runs against every non-terminating result.
pub trait FailureHook: Send + Sync {
  fn failure(&self, result: &FanoutResult);
}

/// Attach the captured inbound body to the child, along with
/// its content type and length.
pub struct ForwardBody;

impl BeforeHook for ForwardBody {
  fn before(
    &self,
    child: &mut OutboundRequest,
    state: &RequestState,
  ) -> anyhow::Result<()> {
    child.body = Some(state.body.clone());
    child
      .headers
      .insert(CONTENT_LENGTH, HeaderValue::from(state.body.len()));
    if let Some(content_type) = state.headers.get(CONTENT_TYPE) {
      child.headers.insert(CONTENT_TYPE, content_type.clone());
    }
    Ok(())
  }
}

/// Copy the configured inbound headers onto the child.
pub struct ForwardHeaders(pub HeaderSet);

impl BeforeHook for ForwardHeaders {
  fn before(
    &self,
    child: &mut OutboundRequest,
    state: &RequestState,
  ) -> anyhow::Result<()> {
    self.0.filter(&mut child.headers, &state.headers);
    Ok(())
  }
}

/// Attach a fixed credential to every child.
pub struct Authorize(HeaderValue);

impl Authorize {
  pub fn new(credential: &str) -> anyhow::Result<Authorize> {
    let mut value = HeaderValue::from_str(credential)
      .map_err(|_| anyhow::anyhow!("Invalid authorization value"))?;
    value.set_sensitive(true);
    Ok(Authorize(value))
  }
}

impl BeforeHook for Authorize {
  fn before(
    &self,
    child: &mut OutboundRequest,
    _state: &RequestState,
  ) -> anyhow::Result<()> {
    child.headers.insert(AUTHORIZATION, self.0.clone());
    Ok(())
  }
}

/// Copy the routing key from the inbound request onto the
/// destination header the back-end expects.
pub struct DestinationHeader {
  pub from: HeaderName,
  pub to: HeaderName,
}

impl BeforeHook for DestinationHeader {
  fn before(
    &self,
    child: &mut OutboundRequest,
    state: &RequestState,
  ) -> anyhow::Result<()> {
    if let Some(value) = state.headers.get(&self.from) {
      child.headers.insert(self.to.clone(), value.clone());
    }
    Ok(())
  }
}

/// Strip a gateway-local path prefix before the request
/// reaches the back-end.
pub struct StripPrefix(pub String);

impl BeforeHook for StripPrefix {
  fn before(
    &self,
    child: &mut OutboundRequest,
    _state: &RequestState,
  ) -> anyhow::Result<()> {
    let path = child.url.path().to_string();
    if let Some(stripped) = path.strip_prefix(&self.0) {
      let stripped = if stripped.starts_with('/') {
        stripped.to_string()
      } else {
        format!("/{stripped}")
      };
      child.url.set_path(&stripped);
    }
    Ok(())
  }
}

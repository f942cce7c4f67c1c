use std::time::Duration;

use anyhow::Context;
use axum::http::{
  HeaderMap, Method, StatusCode,
  header::{CONTENT_LENGTH, CONTENT_TYPE, LOCATION},
};
use bytes::Bytes;
use futures_util::future::BoxFuture;
use headerset::HeaderSet;
use spans::FanoutError;
use url::Url;

/// One child request of a fanout. Owned exclusively by the
/// branch that executes it.
#[derive(Clone, Debug)]
pub struct OutboundRequest {
  pub method: Method,
  pub url: Url,
  pub headers: HeaderMap,
  pub body: Option<Bytes>,
}

/// A child response with its body already read in full, so
/// the underlying connection can be released immediately.
#[derive(Clone, Debug)]
pub struct OutboundResponse {
  pub status: StatusCode,
  pub headers: HeaderMap,
  pub body: Bytes,
}

/// Executes one child request. The engine is agnostic to
/// TLS, HTTP version, and pooling; the transactor owns its
/// own concurrency discipline.
pub trait Transactor: Send + Sync + 'static {
  fn transact(
    &self,
    request: OutboundRequest,
  ) -> BoxFuture<'_, Result<OutboundResponse, FanoutError>>;
}

#[derive(Clone, Debug)]
pub struct TransactorOptions {
  /// Per-child client timeout. The earlier of this and the
  /// fanout deadline wins.
  pub client_timeout: Duration,
  pub max_idle_conns_per_host: usize,
  /// Follow at most this many redirects per child.
  pub max_redirects: usize,
  /// Headers never carried across a redirect hop.
  pub redirect_exclude_headers: HeaderSet,
}

impl Default for TransactorOptions {
  fn default() -> TransactorOptions {
    TransactorOptions {
      client_timeout: Duration::from_secs(30),
      max_idle_conns_per_host: 20,
      max_redirects: 0,
      redirect_exclude_headers: HeaderSet::default(),
    }
  }
}

/// The default transactor: a pooled reqwest client.
///
/// Redirects are followed here rather than inside the client,
/// so each hop can re-attach the captured body and drop the
/// configured exclude headers.
pub struct HttpTransactor {
  client: reqwest::Client,
  max_redirects: usize,
  exclude: HeaderSet,
}

impl HttpTransactor {
  pub fn new(
    options: &TransactorOptions,
  ) -> anyhow::Result<HttpTransactor> {
    let client = reqwest::Client::builder()
      .timeout(options.client_timeout)
      .pool_max_idle_per_host(options.max_idle_conns_per_host)
      .redirect(reqwest::redirect::Policy::none())
      .build()
      .context("Failed to build fanout http client")?;
    Ok(HttpTransactor {
      client,
      max_redirects: options.max_redirects,
      exclude: options.redirect_exclude_headers.clone(),
    })
  }

  async fn execute(
    &self,
    request: OutboundRequest,
  ) -> Result<OutboundResponse, FanoutError> {
    let OutboundRequest {
      mut method,
      mut url,
      mut headers,
      mut body,
    } = request;

    let mut hops = 0;
    loop {
      let mut builder = self
        .client
        .request(method.clone(), url.clone())
        .headers(headers.clone());
      if let Some(bytes) = &body {
        builder = builder.body(bytes.clone());
      }
      let response =
        builder.send().await.map_err(map_transport_error)?;
      let status = response.status();

      if status.is_redirection() && hops < self.max_redirects {
        if let Some(next) = redirect_target(&url, response.headers())
        {
          hops += 1;
          for name in self.exclude.names() {
            headers.remove(name);
          }
          if downgrades_to_get(status, &method) {
            method = Method::GET;
            body = None;
            headers.remove(CONTENT_LENGTH);
            headers.remove(CONTENT_TYPE);
          }
          url = next;
          continue;
        }
      }

      let response_headers = response.headers().clone();
      // Read eagerly so the connection is returned to the
      // pool. A failed read keeps the response, body-less.
      let bytes = match response.bytes().await {
        Ok(bytes) => bytes,
        Err(e) => {
          tracing::warn!(
            "Failed to read child response body from {url} | {e:?}"
          );
          Bytes::new()
        }
      };
      return Ok(OutboundResponse {
        status,
        headers: response_headers,
        body: bytes,
      });
    }
  }
}

impl Transactor for HttpTransactor {
  fn transact(
    &self,
    request: OutboundRequest,
  ) -> BoxFuture<'_, Result<OutboundResponse, FanoutError>> {
    Box::pin(self.execute(request))
  }
}

fn map_transport_error(e: reqwest::Error) -> FanoutError {
  if e.is_timeout() {
    FanoutError::Deadline
  } else {
    FanoutError::Transport(anyhow::Error::new(e))
  }
}

fn redirect_target(
  current: &Url,
  headers: &HeaderMap,
) -> Option<Url> {
  let location = headers.get(LOCATION)?.to_str().ok()?;
  current
    .join(location)
    .inspect_err(|e| {
      tracing::warn!(
        "Ignoring unparseable redirect location {location} | {e:?}"
      )
    })
    .ok()
}

fn downgrades_to_get(status: StatusCode, method: &Method) -> bool {
  status == StatusCode::SEE_OTHER
    || ((status == StatusCode::MOVED_PERMANENTLY
      || status == StatusCode::FOUND)
      && *method == Method::POST)
}

#[cfg(test)]
mod tests {
  use axum::http::HeaderValue;

  use super::*;

  #[test]
  fn see_other_always_downgrades() {
    assert!(downgrades_to_get(
      StatusCode::SEE_OTHER,
      &Method::PUT
    ));
  }

  #[test]
  fn moved_permanently_downgrades_only_post() {
    assert!(downgrades_to_get(
      StatusCode::MOVED_PERMANENTLY,
      &Method::POST
    ));
    assert!(!downgrades_to_get(
      StatusCode::MOVED_PERMANENTLY,
      &Method::GET
    ));
  }

  #[test]
  fn redirect_targets_resolve_relative_locations() {
    let current = Url::parse("http://a:8080/api/device").unwrap();
    let mut headers = HeaderMap::new();
    headers
      .insert(LOCATION, HeaderValue::from_static("/v2/device"));
    assert_eq!(
      redirect_target(&current, &headers).unwrap().as_str(),
      "http://a:8080/v2/device"
    );

    headers.insert(
      LOCATION,
      HeaderValue::from_static("http://b:9090/device"),
    );
    assert_eq!(
      redirect_target(&current, &headers).unwrap().as_str(),
      "http://b:9090/device"
    );
  }

  #[test]
  fn missing_location_yields_no_target() {
    let current = Url::parse("http://a:8080/").unwrap();
    assert!(redirect_target(&current, &HeaderMap::new()).is_none());
  }
}

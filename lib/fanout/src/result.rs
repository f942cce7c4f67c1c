use std::sync::Arc;

use axum::http::{HeaderMap, HeaderValue, StatusCode};
use bytes::Bytes;
use spans::{FanoutError, Span};
use url::Url;

/// The outcome of one branch. Exactly one of `headers` /
/// `error` is populated; `status` always is (taken from the
/// response, or inferred from the error).
#[derive(Clone, Debug)]
pub struct FanoutResult {
  pub status: StatusCode,
  pub url: Url,
  /// Response headers, when the branch produced a response.
  pub headers: Option<HeaderMap>,
  pub body: Bytes,
  pub content_type: Option<HeaderValue>,
  pub error: Option<Arc<FanoutError>>,
  pub span: Span,
}

impl FanoutResult {
  pub fn is_response(&self) -> bool {
    self.headers.is_some()
  }
}

/// Decides whether a result terminates the fanout.
pub type ShouldTerminate =
  Arc<dyn Fn(&FanoutResult) -> bool + Send + Sync>;

/// The default terminator: any status below 400.
pub fn default_should_terminate() -> ShouldTerminate {
  Arc::new(|result| result.status.as_u16() < 400)
}

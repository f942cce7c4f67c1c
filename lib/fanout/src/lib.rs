use std::{sync::Arc, time::Duration};

use axum::{
  body::Body,
  extract::Request,
  http::{
    HeaderMap, HeaderValue, StatusCode, header::CONTENT_TYPE,
  },
  response::Response,
};
use bytes::Bytes;
use endpoints::{Endpoints, RequestState};
use headerset::HeaderSet;
use spans::{
  DEFAULT_TIME_LAYOUT, FanoutError, Spanner, append_span_header,
  headers_for_error, status_code_for_error,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

mod hooks;
mod result;
mod transactor;

pub use hooks::{
  AfterHook, Authorize, BeforeHook, DestinationHeader,
  FailureHook, ForwardBody, ForwardHeaders, StripPrefix,
};
pub use result::{
  FanoutResult, ShouldTerminate, default_should_terminate,
};
pub use transactor::{
  HttpTransactor, OutboundRequest, OutboundResponse, Transactor,
  TransactorOptions,
};

/// Total deadline per inbound request.
pub const DEFAULT_FANOUT_TIMEOUT: Duration = Duration::from_secs(45);

/// Cap on the buffered inbound entity.
const MAX_INBOUND_BODY: usize = 16 * 1024 * 1024;

/// Renders a core error as the outbound response.
pub type ErrorEncoder =
  Arc<dyn Fn(&FanoutError) -> Response + Send + Sync>;

/// The default encoder: status via the span-error derivation
/// rules, trace headers, and the error message as a plain-text
/// body.
pub fn default_error_encoder() -> ErrorEncoder {
  Arc::new(|error| {
    let status = status_code_for_error(error);
    let mut headers = HeaderMap::new();
    headers_for_error(error, DEFAULT_TIME_LAYOUT, &mut headers);
    respond(
      status,
      headers,
      Some(HeaderValue::from_static("text/plain; charset=utf-8")),
      Bytes::from(error.to_string()),
    )
  })
}

/// The fanout engine: dispatches one inbound request to every
/// candidate back-end concurrently and terminates on the first
/// qualifying result, cancelling the rest.
pub struct Fanout {
  endpoints: Arc<dyn Endpoints>,
  transactor: Arc<dyn Transactor>,
  should_terminate: ShouldTerminate,
  error_encoder: ErrorEncoder,
  before: Vec<Arc<dyn BeforeHook>>,
  after: Vec<Arc<dyn AfterHook>>,
  failure: Vec<Arc<dyn FailureHook>>,
  fanout_timeout: Duration,
  spanner: Spanner,
  response_headers: HeaderSet,
}

impl Fanout {
  pub fn new(
    endpoints: Arc<dyn Endpoints>,
    transactor: Arc<dyn Transactor>,
  ) -> Fanout {
    Fanout {
      endpoints,
      transactor,
      should_terminate: default_should_terminate(),
      error_encoder: default_error_encoder(),
      before: Vec::new(),
      after: Vec::new(),
      failure: Vec::new(),
      fanout_timeout: DEFAULT_FANOUT_TIMEOUT,
      spanner: Spanner::default(),
      response_headers: HeaderSet::default(),
    }
  }

  pub fn with_should_terminate(
    mut self,
    should_terminate: ShouldTerminate,
  ) -> Fanout {
    self.should_terminate = should_terminate;
    self
  }

  pub fn with_error_encoder(
    mut self,
    error_encoder: ErrorEncoder,
  ) -> Fanout {
    self.error_encoder = error_encoder;
    self
  }

  pub fn with_before(
    mut self,
    hook: Arc<dyn BeforeHook>,
  ) -> Fanout {
    self.before.push(hook);
    self
  }

  pub fn with_after(mut self, hook: Arc<dyn AfterHook>) -> Fanout {
    self.after.push(hook);
    self
  }

  pub fn with_failure(
    mut self,
    hook: Arc<dyn FailureHook>,
  ) -> Fanout {
    self.failure.push(hook);
    self
  }

  pub fn with_fanout_timeout(mut self, timeout: Duration) -> Fanout {
    self.fanout_timeout = timeout;
    self
  }

  pub fn with_spanner(mut self, spanner: Spanner) -> Fanout {
    self.spanner = spanner;
    self
  }

  /// Headers copied from the terminating child response onto
  /// the outbound response.
  pub fn with_response_headers(mut self, set: HeaderSet) -> Fanout {
    self.response_headers = set;
    self
  }

  /// The single operation: exactly one status and body are
  /// written per inbound request, on every path.
  pub async fn handle(&self, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let body =
      match axum::body::to_bytes(body, MAX_INBOUND_BODY).await {
        Ok(body) => body,
        Err(e) => {
          tracing::error!("Failed to read inbound body | {e:?}");
          return (self.error_encoder)(&FanoutError::Message(
            format!("Failed to read inbound request body: {e}"),
          ));
        }
      };

    // Cancelled unconditionally when this function returns,
    // which unwinds any still-running child transaction.
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let state = RequestState {
      method: parts.method,
      uri: parts.uri,
      headers: parts.headers,
      body,
      cancel: cancel.clone(),
    };

    let urls = match self.endpoints.fanout_urls(&state) {
      Ok(urls) if !urls.is_empty() => urls,
      Ok(_) => {
        return (self.error_encoder)(&FanoutError::Message(
          String::from("No fanout endpoints configured"),
        ));
      }
      Err(e) => {
        return (self.error_encoder)(&FanoutError::Message(
          format!("{e:#}"),
        ));
      }
    };

    let mut children = Vec::with_capacity(urls.len());
    for url in urls {
      let mut child = OutboundRequest {
        method: state.method.clone(),
        url,
        headers: HeaderMap::new(),
        body: None,
      };
      for hook in &self.before {
        if let Err(e) = hook.before(&mut child, &state) {
          return (self.error_encoder)(&FanoutError::Message(
            format!("Failed to prepare child request: {e:#}"),
          ));
        }
      }
      children.push(child);
    }

    let total = children.len();
    let (tx, mut rx) = mpsc::channel::<FanoutResult>(total);
    for child in children {
      let transactor = self.transactor.clone();
      let spanner = self.spanner.clone();
      let cancel = cancel.clone();
      let tx = tx.clone();
      tokio::spawn(async move {
        let result =
          run_branch(transactor, child, cancel, spanner).await;
        // Capacity matches the branch count, so the send never
        // blocks. A receiver gone after early termination just
        // discards the result.
        let _ = tx.try_send(result);
      });
    }
    drop(tx);

    let deadline = tokio::time::sleep(self.fanout_timeout);
    tokio::pin!(deadline);

    let mut outbound = HeaderMap::new();
    let mut spans = Vec::with_capacity(total);
    let mut worst: Option<FanoutResult> = None;
    let mut received = 0;

    while received < total {
      tokio::select! {
        _ = &mut deadline => {
          // The deadline is the causal error; the branches
          // that did report become its spans.
          return (self.error_encoder)(
            &FanoutError::Deadline.with_spans(spans),
          );
        }
        result = rx.recv() => {
          // All producers gone before `total` results only
          // means branch tasks died; aggregate what arrived.
          let Some(result) = result else {
            break;
          };
          received += 1;
          append_span_header(
            &result.span,
            DEFAULT_TIME_LAYOUT,
            &mut outbound,
          );
          spans.push(result.span.clone());

          if (self.should_terminate)(&result) {
            for hook in &self.after {
              hook.after(&mut outbound, &result);
            }
            if let Some(child_headers) = &result.headers {
              self
                .response_headers
                .filter(&mut outbound, child_headers);
            }
            return respond(
              result.status,
              outbound,
              result.content_type,
              result.body,
            );
          }

          for hook in &self.failure {
            hook.failure(&result);
          }
          match &result.error {
            Some(error) => tracing::debug!(
              "Fanout branch {} failed | {error}",
              result.url
            ),
            None => tracing::debug!(
              "Fanout branch {} returned {}",
              result.url,
              result.status
            ),
          }
          let worse = worst
            .as_ref()
            .is_none_or(|w| result.status > w.status);
          if worse {
            worst = Some(result);
          }
        }
      }
    }

    match worst {
      Some(worst) => {
        // Surface the aggregate failure: the worst status per
        // the aggregation rule, plus span and error trace
        // headers for every branch in arrival order.
        let error = FanoutError::spanned(None, spans);
        let mut headers = HeaderMap::new();
        headers_for_error(
          &error,
          DEFAULT_TIME_LAYOUT,
          &mut headers,
        );
        respond(
          worst.status,
          headers,
          worst.content_type,
          worst.body,
        )
      }
      None => respond(
        StatusCode::SERVICE_UNAVAILABLE,
        outbound,
        None,
        Bytes::new(),
      ),
    }
  }
}

async fn run_branch(
  transactor: Arc<dyn Transactor>,
  child: OutboundRequest,
  cancel: CancellationToken,
  spanner: Spanner,
) -> FanoutResult {
  let url = child.url.clone();
  let finisher = spanner.start(url.to_string());

  let outcome = tokio::select! {
    _ = cancel.cancelled() => Err(FanoutError::Cancelled),
    outcome = transactor.transact(child) => outcome,
  };

  match outcome {
    Ok(response) => {
      let content_type =
        response.headers.get(CONTENT_TYPE).cloned();
      let span = finisher.finish(None);
      FanoutResult {
        status: response.status,
        url,
        headers: Some(response.headers),
        body: response.body,
        content_type,
        error: None,
        span,
      }
    }
    Err(error) => {
      let status = match &error {
        FanoutError::Deadline | FanoutError::Cancelled => {
          StatusCode::GATEWAY_TIMEOUT
        }
        _ => StatusCode::SERVICE_UNAVAILABLE,
      };
      let span = finisher.finish(Some(error));
      FanoutResult {
        status,
        url,
        headers: None,
        body: Bytes::new(),
        content_type: None,
        error: span.shared_error(),
        span,
      }
    }
  }
}

fn respond(
  status: StatusCode,
  headers: HeaderMap,
  content_type: Option<HeaderValue>,
  body: Bytes,
) -> Response {
  let mut response = Response::new(Body::from(body));
  *response.status_mut() = status;
  *response.headers_mut() = headers;
  if let Some(content_type) = content_type {
    response.headers_mut().insert(CONTENT_TYPE, content_type);
  }
  response
}


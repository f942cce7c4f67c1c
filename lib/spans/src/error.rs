use axum::http::{
  HeaderMap, HeaderName, HeaderValue, StatusCode,
};
use thiserror::Error;

use crate::Span;

/// One entry per finished span on the outbound response:
/// `"<name>","<rfc3339-start>","<duration>"`.
pub const SPAN_HEADER: HeaderName =
  HeaderName::from_static("x-scatter-span");

/// One entry per span that finished with an error:
/// `"<name>",<status?>,"<message>"`.
pub const ERROR_HEADER: HeaderName =
  HeaderName::from_static("x-scatter-error");

/// Every failure the fanout core recognises, as one exhaustive
/// variant set rather than downcast probing.
#[derive(Debug, Error)]
pub enum FanoutError {
  /// Transport-level failure from a child transaction.
  #[error("{0:#}")]
  Transport(anyhow::Error),

  /// A definitive HTTP status, carrying headers to surface
  /// on the outbound response.
  #[error("upstream returned {code}")]
  HttpStatus { code: StatusCode, headers: HeaderMap },

  /// A multi-branch failure: the causal error plus the spans
  /// of the branches that contributed to it.
  #[error("{}", .cause.as_ref().map_or_else(|| String::from("fanout failed with no spanned cause"), |cause| cause.to_string()))]
  Spanned {
    cause: Option<Box<FanoutError>>,
    spans: Vec<Span>,
  },

  /// The fanout deadline elapsed.
  #[error("fanout deadline exceeded")]
  Deadline,

  /// The inbound scope was cancelled before a result arrived.
  #[error("fanout cancelled")]
  Cancelled,

  /// Resolver / configuration failure, eg. empty endpoint set.
  #[error("{0}")]
  Message(String),
}

impl FanoutError {
  pub fn spanned(
    cause: Option<FanoutError>,
    spans: Vec<Span>,
  ) -> FanoutError {
    FanoutError::Spanned {
      cause: cause.map(Box::new),
      spans,
    }
  }

  /// Replace the attached spans, keeping the causal error.
  ///
  /// A non-spanned error is wrapped. Replacing the (empty)
  /// spans of a spanless spanned error with an empty list
  /// returns the value unchanged.
  pub fn with_spans(self, replacement: Vec<Span>) -> FanoutError {
    match self {
      FanoutError::Spanned { cause, spans } => {
        if spans.is_empty() && replacement.is_empty() {
          FanoutError::Spanned { cause, spans }
        } else {
          FanoutError::Spanned {
            cause,
            spans: replacement,
          }
        }
      }
      other => FanoutError::Spanned {
        cause: Some(Box::new(other)),
        spans: replacement,
      },
    }
  }

  /// The causal error of a spanned failure.
  pub fn cause(&self) -> Option<&FanoutError> {
    match self {
      FanoutError::Spanned { cause, .. } => cause.as_deref(),
      _ => None,
    }
  }

  pub fn spans(&self) -> &[Span] {
    match self {
      FanoutError::Spanned { spans, .. } => spans,
      _ => &[],
    }
  }
}

/// Derive the terminal HTTP status for a fanned-out failure.
///
/// Spanned failures take the MINIMUM status among the span
/// errors: any definitive 4xx from any branch (eg. not found)
/// is preferred over a sea of timeouts. An all-5xx minimum
/// collapses to `503 Service Unavailable`.
pub fn status_code_for_error(error: &FanoutError) -> StatusCode {
  match error {
    FanoutError::HttpStatus { code, .. } => *code,
    FanoutError::Deadline | FanoutError::Cancelled => {
      StatusCode::GATEWAY_TIMEOUT
    }
    FanoutError::Spanned { cause, spans } => {
      if matches!(
        cause.as_deref(),
        Some(FanoutError::Deadline | FanoutError::Cancelled)
      ) {
        return StatusCode::GATEWAY_TIMEOUT;
      }
      if !spans.is_empty() {
        let minimum = spans
          .iter()
          .filter_map(Span::error)
          .map(status_code_for_error)
          .min();
        return match minimum {
          Some(code) if code.as_u16() < 500 => code,
          _ => StatusCode::SERVICE_UNAVAILABLE,
        };
      }
      match cause.as_deref() {
        Some(cause) => status_code_for_error(cause),
        None => StatusCode::INTERNAL_SERVER_ERROR,
      }
    }
    FanoutError::Transport(_) => StatusCode::SERVICE_UNAVAILABLE,
    FanoutError::Message(_) => StatusCode::INTERNAL_SERVER_ERROR,
  }
}

/// Write the trace headers describing a failure onto `out`.
///
/// Spanned failures emit one [SPAN_HEADER] per span, one
/// [ERROR_HEADER] per span that finished with an error, then
/// recurse into the causal error. Carried headers of an
/// [FanoutError::HttpStatus] are copied through. Other
/// variants write nothing.
pub fn headers_for_error(
  error: &FanoutError,
  time_layout: &str,
  out: &mut HeaderMap,
) {
  match error {
    FanoutError::HttpStatus { headers, .. } => {
      for (name, value) in headers {
        out.append(name.clone(), value.clone());
      }
    }
    FanoutError::Spanned { cause, spans } => {
      for span in spans {
        append_span_header(span, time_layout, out);
      }
      for span in spans {
        let Some(error) = span.error() else {
          continue;
        };
        append_error_header(span.name(), error, out);
      }
      if let Some(cause) = cause.as_deref() {
        headers_for_error(cause, time_layout, out);
      }
    }
    _ => {}
  }
}

/// Span headers for the branches that already produced a
/// result, in arrival order. Used on both terminating and
/// aggregate-failure responses.
pub fn append_span_header(
  span: &Span,
  time_layout: &str,
  out: &mut HeaderMap,
) {
  let value = format!(
    "\"{}\",\"{}\",\"{:?}\"",
    span.name(),
    span.start().format(time_layout),
    span.duration(),
  );
  if let Ok(value) = HeaderValue::from_str(&value) {
    out.append(SPAN_HEADER, value);
  }
}

fn append_error_header(
  name: &str,
  error: &FanoutError,
  out: &mut HeaderMap,
) {
  let value = match error {
    FanoutError::HttpStatus { code, .. } => {
      format!("\"{name}\",{},\"{error}\"", code.as_u16())
    }
    _ => format!("\"{name}\",\"{error}\""),
  };
  if let Ok(value) = HeaderValue::from_str(&value) {
    out.append(ERROR_HEADER, value);
  }
}

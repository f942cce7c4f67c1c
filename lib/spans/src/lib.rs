use std::{
  sync::{Arc, OnceLock},
  time::{Duration, Instant},
};

use chrono::{DateTime, Utc};

mod error;

pub use error::{
  ERROR_HEADER, FanoutError, SPAN_HEADER, append_span_header,
  headers_for_error, status_code_for_error,
};

/// Default layout for span start times in trace headers.
/// RFC-3339 in UTC.
pub const DEFAULT_TIME_LAYOUT: &str = "%+";

type NowFn = dyn Fn() -> DateTime<Utc> + Send + Sync;
type SinceFn = dyn Fn(Instant) -> Duration + Send + Sync;

/// Factory for [Span]s. The wall clock and the monotonic
/// elapsed strategy are injectable so tests can pin both.
#[derive(Clone)]
pub struct Spanner {
  now: Arc<NowFn>,
  since: Arc<SinceFn>,
}

impl Default for Spanner {
  fn default() -> Spanner {
    Spanner {
      now: Arc::new(Utc::now),
      since: Arc::new(|started| started.elapsed()),
    }
  }
}

impl Spanner {
  pub fn new(
    now: impl Fn() -> DateTime<Utc> + Send + Sync + 'static,
    since: impl Fn(Instant) -> Duration + Send + Sync + 'static,
  ) -> Spanner {
    Spanner {
      now: Arc::new(now),
      since: Arc::new(since),
    }
  }

  /// Begin timing an operation. The returned [Finisher]
  /// seals the span on its first call.
  pub fn start(&self, name: impl Into<String>) -> Finisher {
    Finisher {
      inner: Arc::new(SpanInner {
        name: name.into(),
        start: (self.now)(),
        started: Instant::now(),
        since: self.since.clone(),
        sealed: OnceLock::new(),
      }),
    }
  }
}

struct SpanInner {
  name: String,
  start: DateTime<Utc>,
  started: Instant,
  since: Arc<SinceFn>,
  sealed: OnceLock<Sealed>,
}

struct Sealed {
  duration: Duration,
  error: Option<Arc<FanoutError>>,
}

/// Seals the [Span] it was started for.
///
/// Only the first call to [Finisher::finish] takes effect.
/// Subsequent calls return the same span unchanged, no matter
/// which error they pass. Enforced by a single-shot set on the
/// span's internal state, so concurrent finishers are safe.
#[derive(Clone)]
pub struct Finisher {
  inner: Arc<SpanInner>,
}

impl Finisher {
  pub fn finish(&self, error: Option<FanoutError>) -> Span {
    let inner = &self.inner;
    let sealed = inner.sealed.get_or_init(|| Sealed {
      duration: (inner.since)(inner.started),
      error: error.map(Arc::new),
    });
    Span {
      name: inner.name.clone(),
      start: inner.start,
      duration: sealed.duration,
      error: sealed.error.clone(),
    }
  }
}

/// Immutable record of one finished operation.
#[derive(Clone, Debug)]
pub struct Span {
  name: String,
  start: DateTime<Utc>,
  duration: Duration,
  error: Option<Arc<FanoutError>>,
}

impl Span {
  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn start(&self) -> DateTime<Utc> {
    self.start
  }

  pub fn duration(&self) -> Duration {
    self.duration
  }

  pub fn error(&self) -> Option<&FanoutError> {
    self.error.as_deref()
  }

  /// The sealed error, shared. Lets a branch result carry the
  /// same error value its span records.
  pub fn shared_error(&self) -> Option<Arc<FanoutError>> {
    self.error.clone()
  }
}

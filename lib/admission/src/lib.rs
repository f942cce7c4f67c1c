use std::sync::Arc;

use anyhow::anyhow;
use axum::{
  extract::{Request, State},
  http::StatusCode,
  middleware::Next,
  response::Response,
};
use serror::{AddStatusCode, AddStatusCodeError};
use tokio::sync::{Semaphore, TryAcquireError};

/// Process-wide cap on concurrent fanouts, enforced upstream
/// of the engine. Saturation sheds load instead of queueing:
/// a saturated gateway returns `429 Too Many Requests`
/// immediately.
pub struct ConcurrencyLimiter {
  semaphore: Arc<Semaphore>,
  max_concurrent: usize,
}

impl ConcurrencyLimiter {
  pub fn new(max_concurrent: usize) -> ConcurrencyLimiter {
    ConcurrencyLimiter {
      semaphore: Arc::new(Semaphore::new(max_concurrent)),
      max_concurrent,
    }
  }

  pub fn available(&self) -> usize {
    self.semaphore.available_permits()
  }
}

/// Axum middleware guarding the fanout route.
pub async fn guard(
  State(limiter): State<Arc<ConcurrencyLimiter>>,
  request: Request,
  next: Next,
) -> serror::Result<Response> {
  let _permit = limiter
    .semaphore
    .clone()
    .try_acquire_owned()
    .map_err(|e| match e {
      TryAcquireError::NoPermits => {
        tracing::warn!(
          "Shedding inbound request | {} fanouts already in flight",
          limiter.max_concurrent
        );
        anyhow!(
          "Too many in-flight fanouts | max {}",
          limiter.max_concurrent
        )
      }
      TryAcquireError::Closed => {
        anyhow!("Fanout admission semaphore closed")
      }
    })
    .status_code(StatusCode::TOO_MANY_REQUESTS)?;
  Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn permits_are_released_on_drop() {
    let limiter = ConcurrencyLimiter::new(2);
    let first =
      limiter.semaphore.clone().try_acquire_owned().unwrap();
    let _second =
      limiter.semaphore.clone().try_acquire_owned().unwrap();
    assert!(
      limiter.semaphore.clone().try_acquire_owned().is_err()
    );
    drop(first);
    assert_eq!(limiter.available(), 1);
  }
}

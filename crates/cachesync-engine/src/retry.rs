//! Timeout plus capped exponential backoff around backend calls.

use std::{future::Future, time::Duration};

use tracing::debug;

use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
  /// Deadline for a single attempt.
  pub timeout:         Duration,
  pub max_attempts:    u32,
  pub initial_backoff: Duration,
  pub max_backoff:     Duration,
}

impl RetryPolicy {
  /// Run `call` until it succeeds or `max_attempts` attempts have failed.
  ///
  /// Each attempt is bounded by `timeout`. Exhaustion surfaces as
  /// [`Error::BackendUnavailable`] carrying the last failure.
  pub async fn run<T, E, F, Fut>(&self, op: &'static str, mut call: F) -> Result<T>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::error::Error,
  {
    let mut backoff = self.initial_backoff;
    let mut attempt = 1;
    loop {
      let reason = match tokio::time::timeout(self.timeout, call()).await {
        Ok(Ok(value)) => return Ok(value),
        Ok(Err(e)) => e.to_string(),
        Err(_) => format!("timed out after {:?}", self.timeout),
      };

      if attempt >= self.max_attempts {
        return Err(Error::BackendUnavailable {
          op,
          attempts: attempt,
          reason,
        });
      }

      debug!(op, attempt, error = %reason, "backend call failed, retrying");
      tokio::time::sleep(backoff).await;
      backoff = (backoff * 2).min(self.max_backoff);
      attempt += 1;
    }
  }
}

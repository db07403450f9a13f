//! Call-site middleware for state-changing commands.
//!
//! Starting, stopping and applying a test can leave the controller in a
//! transient state for several seconds; re-running the whole submit-and-wait
//! cycle absorbs that without modelling every interim state.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{info, warn};

use crate::error::{ControlError, Result};
use crate::session::Session;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Never less than one.
    pub max_tries: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_tries: u32, delay: Duration) -> Self {
        Self {
            max_tries: max_tries.max(1),
            delay,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(5))
    }
}

/// Run `op` until it succeeds, a non-retryable error occurs, or
/// `policy.max_tries` attempts have been made. The last error is returned.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 1;
    loop {
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    info!(%what, attempt, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if e.is_retryable() && attempt < policy.max_tries => {
                warn!(
                    %what,
                    attempt,
                    max_tries = policy.max_tries,
                    error = %e,
                    "attempt failed, retrying in {:?}",
                    policy.delay
                );
                sleep(policy.delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Confirm the session resource still answers.
pub async fn check_connection(session: &Session) -> Result<()> {
    let reply = session.transport().get(session.url()).await.map_err(|e| {
        warn!(session = %session.id(), error = %e, "session unreachable");
        e
    })?;
    if !reply.is_success() {
        warn!(session = %session.id(), status = reply.status, "session resource rejected probe");
        return Err(ControlError::Transport {
            url: reply.url,
            detail: format!("session resource answered {}", reply.status),
        });
    }
    Ok(())
}

/// Run `op` only after the session answers a liveness probe.
pub async fn with_connection_check<T, Fut>(session: &Session, op: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    check_connection(session).await?;
    op.await
}

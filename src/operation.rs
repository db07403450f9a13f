//! Operation executor and completion poller.
//!
//! `submit` issues a command and extracts the status resource the remote
//! side created for it; `wait` polls that resource until the operation is
//! finished. A submit reply without a status locator means the command never
//! started remotely, so it fails before any polling happens.
//!
//! State machine: `Idle -> Submitted -> Running -> Finished{Successful|Error}`.

use std::time::Duration;

use reqwest::Url;
use serde::Deserialize;
use serde_json::Value;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::error::{ControlError, Result};
use crate::session::Session;
use crate::transport::{self, Reply};

/// How often to poll and how long to keep polling.
#[derive(Debug, Clone, PartialEq)]
pub struct PollConfig {
    pub interval: Duration,
    /// `None` blocks until a terminal state is observed.
    pub max_wait: Option<Duration>,
}

impl PollConfig {
    /// Defaults for quick commands (apply, stop).
    pub fn fast() -> Self {
        Self {
            interval: Duration::from_millis(500),
            max_wait: Some(Duration::from_secs(600)),
        }
    }

    /// Defaults for session start and test loading.
    pub fn slow() -> Self {
        Self {
            interval: Duration::from_secs(2),
            max_wait: Some(Duration::from_secs(600)),
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self::fast()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Pending,
    Running,
    Finished,
}

impl OperationState {
    fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "finished" => OperationState::Finished,
            "pending" | "queued" => OperationState::Pending,
            "running" | "in progress" => OperationState::Running,
            other => {
                debug!(state = %other, "unrecognised operation state, treating as running");
                OperationState::Running
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationResult {
    Successful,
    Error,
}

#[derive(Deserialize)]
struct StatusBody {
    state: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// One observation of a status resource.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationStatus {
    pub state: OperationState,
    /// Only meaningful once `state` is `Finished`.
    pub result: Option<OperationResult>,
    pub error_message: Option<String>,
    raw_status: Option<String>,
}

impl OperationStatus {
    fn from_reply(reply: &Reply) -> Result<Self> {
        let body: StatusBody = reply.json()?;
        let state = OperationState::parse(&body.state);
        let result = body.status.as_deref().map(|s| {
            if s.trim().eq_ignore_ascii_case("successful") {
                OperationResult::Successful
            } else {
                OperationResult::Error
            }
        });
        Ok(Self {
            state,
            result,
            error_message: body.error.filter(|e| !e.trim().is_empty()),
            raw_status: body.status,
        })
    }
}

/// Reference to the remote status resource of a submitted command.
#[derive(Debug, Clone)]
pub struct OperationHandle {
    pub name: String,
    pub submit_url: Url,
    pub status_url: Url,
}

impl OperationHandle {
    pub(crate) fn from_reply(session: &Session, name: &str, submit_url: Url, reply: &Reply) -> Result<Self> {
        let locator = reply.locator().ok_or_else(|| {
            ControlError::protocol(
                format!("submit '{}'", name),
                format!("reply (status {}) has no status locator: {}", reply.status, reply.body),
            )
        })?;
        let status_url = transport::join(session.url(), &locator)?;
        Ok(Self {
            name: name.to_string(),
            submit_url,
            status_url,
        })
    }
}

/// Submit `operation` (a path relative to the session URL) with `payload`.
pub async fn submit(session: &Session, operation: &str, payload: Option<&Value>) -> Result<OperationHandle> {
    let url = session.resolve(operation)?;
    debug!(session = %session.id(), %url, "submitting operation");
    let reply = session.transport().post(&url, payload).await?;

    if !reply.is_success() {
        return Err(ControlError::protocol(
            format!("submit '{}'", operation),
            format!("unexpected status {}: {}", reply.status, reply.body),
        ));
    }
    OperationHandle::from_reply(session, operation, url, &reply)
}

/// Poll the handle's status resource until the operation finishes.
///
/// Always sleeps `poll.interval` between queries; gives up with
/// [`ControlError::Timeout`] once `poll.max_wait` has elapsed.
pub async fn wait(session: &Session, handle: &OperationHandle, poll: &PollConfig) -> Result<()> {
    let started = Instant::now();
    let mut polls: u32 = 0;

    loop {
        let reply = session.transport().get(&handle.status_url).await?;
        polls += 1;
        if !reply.is_success() {
            return Err(ControlError::Transport {
                url: reply.url,
                detail: format!("status resource answered {}", reply.status),
            });
        }

        let status = OperationStatus::from_reply(&reply)?;
        if status.state == OperationState::Finished {
            return match status.result {
                Some(OperationResult::Successful) => {
                    debug!(operation = %handle.name, polls, "operation finished");
                    Ok(())
                }
                _ => {
                    let message = status.error_message.unwrap_or_else(|| {
                        format!(
                            "finished with status '{}' at {}",
                            status.raw_status.as_deref().unwrap_or("<none>"),
                            handle.status_url
                        )
                    });
                    warn!(operation = %handle.name, %message, "operation failed");
                    Err(ControlError::Operation {
                        operation: handle.name.clone(),
                        message,
                    })
                }
            };
        }

        if let Some(max_wait) = poll.max_wait {
            let waited = started.elapsed();
            if waited >= max_wait {
                return Err(ControlError::Timeout {
                    operation: handle.name.clone(),
                    waited,
                });
            }
        }
        sleep(poll.interval).await;
    }
}

/// Submit and wait in one step.
pub async fn execute(
    session: &Session,
    operation: &str,
    payload: Option<&Value>,
    poll: &PollConfig,
) -> Result<()> {
    let handle = submit(session, operation, payload).await?;
    wait(session, &handle, poll).await?;
    info!(session = %session.id(), operation, "operation complete");
    Ok(())
}

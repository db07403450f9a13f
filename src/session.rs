//! Lifetime of a remote control-plane session.
//!
//! A session is created once per controller connection, started before any
//! test operation, and deleted remotely exactly once when released.

use std::sync::Arc;

use futures::future::BoxFuture;
use reqwest::Url;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{ControlError, Result};
use crate::operation::{self, OperationHandle, PollConfig};
use crate::transport::{self, Transport};

const SESSIONS_PATH: &str = "sessions";
const START_PATH: &str = "operations/start";

pub struct Session {
    transport: Arc<dyn Transport>,
    id: String,
    base: Url,
    url: Url,
    started: bool,
    released: bool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("url", &self.url.as_str())
            .field("started", &self.started)
            .field("released", &self.released)
            .finish()
    }
}

impl Session {
    /// Allocate a new session on the remote side.
    ///
    /// `base_address` is the API root (e.g. `http://server:8080/api/v0/`);
    /// `params` is sent verbatim as the creation payload.
    pub async fn create(
        transport: Arc<dyn Transport>,
        base_address: &str,
        params: &Value,
    ) -> Result<Session> {
        let base = transport::parse_url(base_address)?;
        let sessions = transport::join(&base, SESSIONS_PATH)?;

        info!(url = %sessions, "creating session");
        let reply = transport.post(&sessions, Some(params)).await?;

        let locator = reply.locator().ok_or_else(|| ControlError::SessionCreation {
            detail: format!(
                "reply (status {}) carries no session locator: {}",
                reply.status, reply.body
            ),
        })?;

        let id = locator
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();
        if id.is_empty() {
            return Err(ControlError::SessionCreation {
                detail: format!("session locator '{}' has no identifier", locator),
            });
        }

        // Trailing slash so relative joins stay under the session.
        let url = transport::join(&base, &format!("{}/", locator.trim_end_matches('/')))?;
        info!(session = %id, %url, "session created");

        Ok(Session {
            transport,
            id,
            base,
            url,
            started: false,
            released: false,
        })
    }

    /// Create a session, run `f` against it, and release it afterwards no
    /// matter how `f` finished.
    pub async fn scoped<T, F>(
        transport: Arc<dyn Transport>,
        base_address: &str,
        params: &Value,
        f: F,
    ) -> Result<T>
    where
        F: for<'s> FnOnce(&'s mut Session) -> BoxFuture<'s, Result<T>>,
    {
        let mut session = Session::create(transport, base_address, params).await?;
        let outcome = f(&mut session).await;
        session.release().await;
        outcome
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    pub(crate) fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    /// Resolve a path relative to the session URL.
    pub fn resolve(&self, path: &str) -> Result<Url> {
        transport::join(&self.url, path)
    }

    /// Start the session and block until the remote side reports ready.
    /// A no-op once started.
    pub async fn start(&mut self, poll: &PollConfig) -> Result<()> {
        if self.started {
            debug!(session = %self.id, "session already started");
            return Ok(());
        }

        info!(session = %self.id, "starting session; this can take a while");
        let url = self.resolve(START_PATH)?;
        let reply = self.transport.post(&url, None).await?;

        if reply.status != 202 {
            return Err(ControlError::SessionStart {
                status: reply.status,
                detail: reply.body,
            });
        }
        let handle = OperationHandle::from_reply(self, "start", url, &reply).map_err(|_| {
            ControlError::SessionStart {
                status: reply.status,
                detail: "start accepted without a status locator".to_string(),
            }
        })?;

        operation::wait(self, &handle, poll).await?;
        self.started = true;
        info!(session = %self.id, "session started");
        Ok(())
    }

    /// Delete the session remotely. Best-effort: failures are logged, never
    /// returned. Runs at most once.
    pub async fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        match self.transport.delete(&self.url).await {
            Ok(reply) if reply.is_success() => {
                info!(session = %self.id, "session released");
            }
            Ok(reply) => {
                warn!(session = %self.id, status = reply.status, body = %reply.body, "session delete rejected");
            }
            Err(e) => {
                warn!(session = %self.id, error = %e, "failed to delete session");
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.released {
            warn!(session = %self.id, url = %self.url, "session dropped without release; remote session leaked");
        }
    }
}

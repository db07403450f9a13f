//! Request/response seam between the control plane and the remote controller.

pub mod http;

#[cfg(test)]
pub(crate) mod mock;

use async_trait::async_trait;
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{ControlError, Result};

pub use http::HttpTransport;

/// A completed round-trip, independent of the HTTP client that produced it.
#[derive(Debug, Clone)]
pub struct Reply {
    pub url: String,
    pub status: u16,
    /// Value of the `Location` header, if any.
    pub location: Option<String>,
    pub body: String,
}

impl Reply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.body).map_err(|source| ControlError::Decode {
            url: self.url.clone(),
            source,
        })
    }

    /// Locator of the resource this reply points at.
    ///
    /// The `Location` header wins; some controllers only put it in the body
    /// as `location` or `url`.
    pub fn locator(&self) -> Option<String> {
        if let Some(loc) = self.location.as_deref().map(str::trim) {
            if !loc.is_empty() {
                return Some(loc.to_string());
            }
        }
        let value: Value = serde_json::from_str(&self.body).ok()?;
        ["location", "url"]
            .iter()
            .find_map(|key| value.get(*key).and_then(Value::as_str))
            .map(str::trim)
            .filter(|loc| !loc.is_empty())
            .map(str::to_string)
    }
}

/// Blocking-style round-trips against the remote controller.
///
/// Implementations must not retry on their own; retry policy lives in
/// [`crate::retry`].
#[async_trait]
pub trait Transport: Send + Sync {
    async fn post(&self, url: &Url, body: Option<&Value>) -> Result<Reply>;

    async fn get(&self, url: &Url) -> Result<Reply>;

    async fn delete(&self, url: &Url) -> Result<Reply>;
}

/// Resolve `path` against `base` the way a browser would.
pub fn join(base: &Url, path: &str) -> Result<Url> {
    base.join(path).map_err(|e| ControlError::InvalidUrl {
        url: format!("{}{}", base, path),
        detail: e.to_string(),
    })
}

pub fn parse_url(raw: &str) -> Result<Url> {
    Url::parse(raw).map_err(|e| ControlError::InvalidUrl {
        url: raw.to_string(),
        detail: e.to_string(),
    })
}

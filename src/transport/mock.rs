//! Scripted in-memory transport for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use reqwest::Url;
use serde_json::Value;

use super::{Reply, Transport};
use crate::error::{ControlError, Result};

pub(crate) const BASE: &str = "http://ctl.test:8080/api/v0/";
pub(crate) const SESSION_PATH: &str = "/api/v0/sessions/45/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Method {
    Get,
    Post,
    Delete,
}

#[derive(Debug, Clone)]
enum Scripted {
    Reply {
        status: u16,
        location: Option<String>,
        body: String,
    },
    Fail(String),
}

/// Replies are queued per (method, path). The last queued reply for a route
/// repeats once the queue drains to it.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    routes: Mutex<HashMap<(Method, String), VecDeque<Scripted>>>,
    calls: Mutex<Vec<(Method, String, Option<Value>)>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, method: Method, path: &str, scripted: Scripted) {
        self.routes
            .lock()
            .unwrap()
            .entry((method, path.to_string()))
            .or_default()
            .push_back(scripted);
    }

    pub fn reply(&self, method: Method, path: &str, status: u16, location: Option<&str>, body: Value) {
        let body = if body.is_null() { String::new() } else { body.to_string() };
        self.push(
            method,
            path,
            Scripted::Reply {
                status,
                location: location.map(str::to_string),
                body,
            },
        );
    }

    pub fn json(&self, method: Method, path: &str, body: Value) {
        self.reply(method, path, 200, None, body);
    }

    pub fn fail(&self, method: Method, path: &str, detail: &str) {
        self.push(method, path, Scripted::Fail(detail.to_string()));
    }

    /// Script a created session at [`SESSION_PATH`] plus its teardown.
    pub fn with_session(self) -> Self {
        self.reply(
            Method::Post,
            "/api/v0/sessions",
            201,
            Some("/api/v0/sessions/45"),
            Value::Null,
        );
        self.reply(Method::Delete, SESSION_PATH, 204, None, Value::Null);
        self
    }

    pub fn count(&self, method: Method, path: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, p, _)| *m == method && p == path)
            .count()
    }

    pub fn bodies(&self, method: Method, path: &str) -> Vec<Option<Value>> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, p, _)| *m == method && p == path)
            .map(|(_, _, b)| b.clone())
            .collect()
    }

    fn answer(&self, method: Method, url: &Url, body: Option<&Value>) -> Result<Reply> {
        let path = url.path().to_string();
        self.calls
            .lock()
            .unwrap()
            .push((method, path.clone(), body.cloned()));

        let mut routes = self.routes.lock().unwrap();
        let queue = routes
            .get_mut(&(method, path.clone()))
            .ok_or_else(|| ControlError::Transport {
                url: url.to_string(),
                detail: format!("no scripted reply for {:?} {}", method, path),
            })?;
        let next = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        match next {
            Some(Scripted::Reply { status, location, body }) => Ok(Reply {
                url: url.to_string(),
                status,
                location,
                body,
            }),
            Some(Scripted::Fail(detail)) => Err(ControlError::Transport {
                url: url.to_string(),
                detail,
            }),
            None => Err(ControlError::Transport {
                url: url.to_string(),
                detail: "empty script".to_string(),
            }),
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn post(&self, url: &Url, body: Option<&Value>) -> Result<Reply> {
        self.answer(Method::Post, url, body)
    }

    async fn get(&self, url: &Url) -> Result<Reply> {
        self.answer(Method::Get, url, None)
    }

    async fn delete(&self, url: &Url) -> Result<Reply> {
        self.answer(Method::Delete, url, None)
    }
}

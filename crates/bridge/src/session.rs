//! Per-connection session state and the bridge's session table.
//!
//! Sessions are exclusively owned by the table; connection tasks and the
//! idle sweep reach them through it by id. All timestamps are wall-clock
//! epoch milliseconds (see DESIGN.md on clock adjustment).

use std::collections::HashMap;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub window_ms: i64,
    pub max_requests: u32,
}

/// Commands for the per-connection writer task.
#[derive(Debug)]
pub enum SessionCommand {
    Send(String),
    Close { code: u16, reason: String },
}

pub struct Session {
    pub id: String,
    /// One-way false→true for the lifetime of the connection.
    pub authenticated: bool,
    pub created_at_ms: i64,
    pub last_activity_ms: i64,
    pub request_count: u32,
    pub window_reset_ms: i64,
    pub outbound: mpsc::Sender<SessionCommand>,
}

impl Session {
    pub fn new(outbound: mpsc::Sender<SessionCommand>, now_ms: i64, window_ms: i64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            authenticated: false,
            created_at_ms: now_ms,
            last_activity_ms: now_ms,
            request_count: 0,
            window_reset_ms: now_ms + window_ms,
            outbound,
        }
    }

    pub fn touch(&mut self, now_ms: i64) {
        self.last_activity_ms = now_ms;
    }

    /// Fixed-window limiter: the window resets lazily once the clock passes
    /// the stored reset time, then the counter increments and is compared
    /// to the maximum. Returns whether this request is allowed.
    pub fn check_rate_limit(&mut self, now_ms: i64, limit: &RateLimitConfig) -> bool {
        if now_ms >= self.window_reset_ms {
            self.request_count = 0;
            self.window_reset_ms = now_ms + limit.window_ms;
        }
        self.request_count += 1;
        self.request_count <= limit.max_requests
    }

    pub fn idle_ms(&self, now_ms: i64) -> i64 {
        now_ms - self.last_activity_ms
    }
}

#[derive(Default)]
pub struct SessionTable {
    inner: Mutex<HashMap<String, Session>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, session: Session) {
        self.inner.lock().await.insert(session.id.clone(), session);
    }

    pub async fn remove(&self, id: &str) -> Option<Session> {
        self.inner.lock().await.remove(id)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    /// Run `f` against a session while the table lock is held. Returns
    /// `None` when the session is gone (closed or swept).
    pub async fn with_session<R>(&self, id: &str, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        let mut map = self.inner.lock().await;
        map.get_mut(id).map(f)
    }

    /// Remove every session idle for longer than `timeout_ms`, returning
    /// them so the caller can close their sockets.
    pub async fn sweep_idle(&self, now_ms: i64, timeout_ms: i64) -> Vec<Session> {
        let mut map = self.inner.lock().await;
        let expired: Vec<String> = map
            .values()
            .filter(|s| s.idle_ms(now_ms) > timeout_ms)
            .map(|s| s.id.clone())
            .collect();
        expired.into_iter().filter_map(|id| map.remove(&id)).collect()
    }

    /// Remove and return every session (shutdown path).
    pub async fn drain(&self) -> Vec<Session> {
        let mut map = self.inner.lock().await;
        map.drain().map(|(_, s)| s).collect()
    }
}

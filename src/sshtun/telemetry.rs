use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use dashmap::DashMap;
use metrics_exporter_prometheus::PrometheusBuilder;

/// Installs a Prometheus recorder for the `metrics` crate and serves the
/// exposition format on `addr`.
///
/// This should be called once per process at startup. Without it, the
/// `metrics` macros are no-ops.
pub fn init_prometheus(addr: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .with_context(|| format!("metrics: install Prometheus exporter on {addr}"))
}

#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: String,
    /// `forward` or `reverse`.
    pub kind: &'static str,
    pub peer: String,
    pub target: String,
    pub started_at_unix_ms: u64,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, SessionInfo>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    pub fn add(&self, s: SessionInfo) {
        self.sessions.insert(s.id.clone(), s);
    }

    pub fn remove(&self, id: &str) {
        self.sessions.remove(id);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let mut out = Vec::with_capacity(self.sessions.len());
        for s in self.sessions.iter() {
            out.push(s.value().clone());
        }
        out.sort_by(|a, b| a.started_at_unix_ms.cmp(&b.started_at_unix_ms));
        out
    }
}

pub type SharedSessions = Arc<SessionRegistry>;

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub fn new_session_id() -> String {
    static SEQ: AtomicU64 = AtomicU64::new(1);
    let n = SEQ.fetch_add(1, Ordering::Relaxed);
    format!("s{n}")
}

/// Registers a live session and keeps the session metrics in step with it.
/// Dropping the guard removes the entry on every exit path.
pub struct SessionGuard {
    sessions: SharedSessions,
    id: String,
}

impl SessionGuard {
    pub fn register(sessions: &SharedSessions, info: SessionInfo) -> Self {
        metrics::counter!("sshtun_sessions_total", "kind" => info.kind).increment(1);
        metrics::gauge!("sshtun_active_sessions").increment(1.0);
        let id = info.id.clone();
        sessions.add(info);
        Self {
            sessions: sessions.clone(),
            id,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.sessions.remove(&self.id);
        metrics::gauge!("sshtun_active_sessions").decrement(1.0);
    }
}

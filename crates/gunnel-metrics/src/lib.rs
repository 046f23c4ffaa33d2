//! Stream metrics: per-stream byte counters plus a registry the dashboard
//! collaborator reads snapshots from.
//!
//! The registry is an explicit handle owned by whoever assembles the
//! process (hub or agent) and passed down to the transport; there is no
//! hidden global.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

/// Live counters for one stream.
#[derive(Debug)]
pub struct StreamInfo {
    id: String,
    subdomain: Mutex<String>,
    started: Instant,
    last_active: Mutex<Instant>,
    active: AtomicBool,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

impl StreamInfo {
    fn new(id: String) -> Self {
        let now = Instant::now();
        Self {
            id,
            subdomain: Mutex::new(String::new()),
            started: now,
            last_active: Mutex::new(now),
            active: AtomicBool::new(true),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn set_subdomain(&self, subdomain: &str) {
        *self.subdomain.lock().unwrap() = subdomain.to_string();
    }

    pub fn subdomain(&self) -> String {
        self.subdomain.lock().unwrap().clone()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn mark_inactive(&self) {
        self.active.store(false, Ordering::Relaxed);
        self.touch();
    }

    pub fn touch(&self) {
        *self.last_active.lock().unwrap() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_active.lock().unwrap().elapsed()
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }
}

/// Serializable view of one stream for the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct StreamSnapshot {
    pub id: String,
    pub subdomain: String,
    pub active: bool,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub age_secs: u64,
    pub idle_secs: u64,
}

/// Aggregate statistics across all streams ever registered.
#[derive(Debug, Clone, Serialize)]
pub struct StreamStats {
    pub total_streams: usize,
    pub active_streams: usize,
    pub total_bytes_in: u64,
    pub total_bytes_out: u64,
}

/// Process-wide metrics collector, passed around explicitly.
#[derive(Debug, Default, Clone)]
pub struct MetricsRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    streams: Mutex<Vec<Arc<StreamInfo>>>,
    total_in: AtomicU64,
    total_out: AtomicU64,
    started: Mutex<Option<SystemTime>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        let reg = Self::default();
        *reg.inner.started.lock().unwrap() = Some(SystemTime::now());
        reg
    }

    /// Register a new stream and return its counter handle.
    pub fn register_stream(&self, id: String) -> Arc<StreamInfo> {
        let info = Arc::new(StreamInfo::new(id));
        self.inner.streams.lock().unwrap().push(info.clone());
        info
    }

    pub fn record_in(&self, info: &StreamInfo, n: usize) {
        info.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
        self.inner.total_in.fetch_add(n as u64, Ordering::Relaxed);
        info.touch();
    }

    pub fn record_out(&self, info: &StreamInfo, n: usize) {
        info.bytes_out.fetch_add(n as u64, Ordering::Relaxed);
        self.inner.total_out.fetch_add(n as u64, Ordering::Relaxed);
        info.touch();
    }

    /// Drop bookkeeping for streams that are gone.
    pub fn prune_inactive(&self) {
        self.inner
            .streams
            .lock()
            .unwrap()
            .retain(|s| s.is_active());
    }

    pub fn active_streams(&self) -> Vec<Arc<StreamInfo>> {
        self.inner
            .streams
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.is_active())
            .cloned()
            .collect()
    }

    pub fn snapshot(&self) -> Vec<StreamSnapshot> {
        self.inner
            .streams
            .lock()
            .unwrap()
            .iter()
            .map(|s| StreamSnapshot {
                id: s.id().to_string(),
                subdomain: s.subdomain(),
                active: s.is_active(),
                bytes_in: s.bytes_in(),
                bytes_out: s.bytes_out(),
                age_secs: s.started.elapsed().as_secs(),
                idle_secs: s.idle_for().as_secs(),
            })
            .collect()
    }

    pub fn stats(&self) -> StreamStats {
        let streams = self.inner.streams.lock().unwrap();
        StreamStats {
            total_streams: streams.len(),
            active_streams: streams.iter().filter(|s| s.is_active()).count(),
            total_bytes_in: self.inner.total_in.load(Ordering::Relaxed),
            total_bytes_out: self.inner.total_out.load(Ordering::Relaxed),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.inner
            .started
            .lock()
            .unwrap()
            .and_then(|t| t.elapsed().ok())
            .unwrap_or_default()
    }
}

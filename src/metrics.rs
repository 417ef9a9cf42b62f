use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Metrics for observability
///
/// Counters are shared by every shard of a manager. Use `snapshot()` to get a
/// point-in-time view of all metrics, or the individual getters for specific
/// values.
///
/// # Example
/// ```ignore
/// let metrics = manager.metrics();
///
/// println!("Identifies: {}", metrics.identifies());
/// println!("Resumes: {}", metrics.resumes());
///
/// let snapshot = metrics.snapshot();
/// ```
#[derive(Debug, Default)]
pub struct Metrics {
    connections_total: AtomicU64,
    reconnections_total: AtomicU64,
    identifies_total: AtomicU64,
    resumes_total: AtomicU64,
    messages_received_total: AtomicU64,
    messages_sent_total: AtomicU64,
    heartbeats_sent_total: AtomicU64,
    heartbeat_acks_total: AtomicU64,
    zombie_connections_total: AtomicU64,
    send_throttles_total: AtomicU64,
    rest_rate_limits_total: AtomicU64,
    errors_total: AtomicU64,

    /// Per-shard metrics, indexed by shard id
    shard_metrics: RwLock<Vec<ShardMetrics>>,
}

/// Metrics for a single shard
#[derive(Debug, Clone, Default)]
pub struct ShardMetrics {
    /// Shard identifier
    pub shard_id: u32,
    /// Whether the shard's session is ready
    pub is_ready: bool,
    /// Last measured heartbeat round trip
    pub latency: Option<Duration>,
    /// Duration since last successful connection (None if never connected)
    pub time_since_connected: Option<Duration>,
    /// Duration since last message received (None if no messages)
    pub time_since_last_message: Option<Duration>,
    /// Current connect attempt (0 once ready)
    pub connect_attempt: u32,
    /// Total time spent ready
    pub total_uptime: Duration,
    #[doc(hidden)]
    pub(crate) last_connected_at: Option<Instant>,
    #[doc(hidden)]
    pub(crate) last_message_at: Option<Instant>,
}

impl ShardMetrics {
    /// Create a snapshot with computed durations
    fn snapshot(&self) -> ShardMetrics {
        ShardMetrics {
            time_since_connected: self.last_connected_at.map(|t| t.elapsed()),
            time_since_last_message: self.last_message_at.map(|t| t.elapsed()),
            ..self.clone()
        }
    }

    /// Mark the shard ready and start its uptime clock
    pub(crate) fn mark_ready(&mut self) {
        if !self.is_ready {
            self.is_ready = true;
            self.last_connected_at = Some(Instant::now());
        }
        self.connect_attempt = 0;
    }

    /// Mark the shard not ready and bank its uptime
    pub(crate) fn mark_down(&mut self) {
        if self.is_ready {
            if let Some(connected_at) = self.last_connected_at {
                self.total_uptime += connected_at.elapsed();
            }
        }
        self.is_ready = false;
    }
}

impl Metrics {
    /// Create a new Metrics instance
    pub fn new() -> Self {
        Self::default()
    }

    // ========== Getters ==========

    /// Get total sockets opened
    pub fn connections(&self) -> u64 {
        self.connections_total.load(Ordering::Relaxed)
    }

    /// Get total reconnections
    pub fn reconnections(&self) -> u64 {
        self.reconnections_total.load(Ordering::Relaxed)
    }

    /// Get total identify frames sent
    pub fn identifies(&self) -> u64 {
        self.identifies_total.load(Ordering::Relaxed)
    }

    /// Get total resume frames sent
    pub fn resumes(&self) -> u64 {
        self.resumes_total.load(Ordering::Relaxed)
    }

    /// Get total gateway payloads received
    pub fn messages_received(&self) -> u64 {
        self.messages_received_total.load(Ordering::Relaxed)
    }

    /// Get total frames written
    pub fn messages_sent(&self) -> u64 {
        self.messages_sent_total.load(Ordering::Relaxed)
    }

    /// Get total heartbeats sent
    pub fn heartbeats_sent(&self) -> u64 {
        self.heartbeats_sent_total.load(Ordering::Relaxed)
    }

    /// Get total heartbeat ACKs received
    pub fn heartbeat_acks(&self) -> u64 {
        self.heartbeat_acks_total.load(Ordering::Relaxed)
    }

    /// Get total connections dropped for missing heartbeat ACKs
    pub fn zombie_connections(&self) -> u64 {
        self.zombie_connections_total.load(Ordering::Relaxed)
    }

    /// Get total sends that waited for the send window to reset
    pub fn send_throttles(&self) -> u64 {
        self.send_throttles_total.load(Ordering::Relaxed)
    }

    /// Get total REST requests that waited on a bucket
    pub fn rest_rate_limits(&self) -> u64 {
        self.rest_rate_limits_total.load(Ordering::Relaxed)
    }

    /// Get total errors
    pub fn errors(&self) -> u64 {
        self.errors_total.load(Ordering::Relaxed)
    }

    // ========== Recording methods (called internally) ==========

    pub(crate) fn record_connection(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reconnection(&self) {
        self.reconnections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_identify(&self) {
        self.identifies_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_resume(&self) {
        self.resumes_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_message_received(&self) {
        self.messages_received_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_message_sent(&self) {
        self.messages_sent_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_heartbeat(&self) {
        self.heartbeats_sent_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_heartbeat_ack(&self) {
        self.heartbeat_acks_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_zombie(&self) {
        self.zombie_connections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_send_throttle(&self) {
        self.send_throttles_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rest_rate_limit(&self) {
        self.rest_rate_limits_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Update metrics for a specific shard
    pub(crate) fn update_shard(&self, shard_id: u32, update_fn: impl FnOnce(&mut ShardMetrics)) {
        let index = shard_id as usize;
        let mut shards = self.shard_metrics.write();

        // Ensure we have enough entries
        while shards.len() <= index {
            let id = shards.len() as u32;
            shards.push(ShardMetrics {
                shard_id: id,
                ..Default::default()
            });
        }

        update_fn(&mut shards[index]);
    }

    /// Get a snapshot of all shard metrics with computed durations
    pub fn shard_metrics(&self) -> Vec<ShardMetrics> {
        self.shard_metrics.read().iter().map(|s| s.snapshot()).collect()
    }

    /// Get current ready shard count
    pub fn ready_shards(&self) -> usize {
        self.shard_metrics
            .read()
            .iter()
            .filter(|s| s.is_ready)
            .count()
    }

    /// Get a point-in-time snapshot of all metrics for export
    pub fn snapshot(&self) -> MetricsSnapshot {
        // Take the shard lock once to ensure consistency
        let shards = self.shard_metrics.read();
        let shard_snapshots: Vec<ShardMetrics> = shards.iter().map(|s| s.snapshot()).collect();

        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Acquire),
            reconnections_total: self.reconnections_total.load(Ordering::Acquire),
            identifies_total: self.identifies_total.load(Ordering::Acquire),
            resumes_total: self.resumes_total.load(Ordering::Acquire),
            messages_received_total: self.messages_received_total.load(Ordering::Acquire),
            messages_sent_total: self.messages_sent_total.load(Ordering::Acquire),
            heartbeats_sent_total: self.heartbeats_sent_total.load(Ordering::Acquire),
            heartbeat_acks_total: self.heartbeat_acks_total.load(Ordering::Acquire),
            zombie_connections_total: self.zombie_connections_total.load(Ordering::Acquire),
            send_throttles_total: self.send_throttles_total.load(Ordering::Acquire),
            rest_rate_limits_total: self.rest_rate_limits_total.load(Ordering::Acquire),
            errors_total: self.errors_total.load(Ordering::Acquire),
            ready_shards: shard_snapshots.iter().filter(|s| s.is_ready).count(),
            shards: shard_snapshots,
        }
    }
}

/// A point-in-time snapshot of all metrics
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub reconnections_total: u64,
    pub identifies_total: u64,
    pub resumes_total: u64,
    pub messages_received_total: u64,
    pub messages_sent_total: u64,
    pub heartbeats_sent_total: u64,
    pub heartbeat_acks_total: u64,
    pub zombie_connections_total: u64,
    pub send_throttles_total: u64,
    pub rest_rate_limits_total: u64,
    pub errors_total: u64,
    pub ready_shards: usize,
    pub shards: Vec<ShardMetrics>,
}

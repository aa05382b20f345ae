//! Prometheus-compatible metrics endpoint
//!
//! Exposes tick engine metrics in Prometheus format.
//! Default endpoint: http://localhost:9090/metrics

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{info, debug};

/// Metrics registry for the server
#[derive(Debug)]
pub struct Metrics {
    // Client counts
    pub clients_connected: AtomicU64,
    pub clients_ingame: AtomicU64,

    // Tick timing (microseconds)
    pub tick_time_us: AtomicU64,
    pub tick_time_p95_us: AtomicU64,
    pub tick_time_p99_us: AtomicU64,
    pub tick_time_max_us: AtomicU64,
    pub tick_count: AtomicU64,

    // Snapshots
    pub snapshots_single: AtomicU64,
    pub snapshots_multipart: AtomicU64,
    pub snapshots_empty: AtomicU64,
    pub snapshot_bytes: AtomicU64,
    pub snap_ids_in_use: AtomicU64,

    // Network stats
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub packets_rate_limited: AtomicU64,
    pub map_chunks_sent: AtomicU64,
    pub bans_issued: AtomicU64,
    pub map_changes: AtomicU64,

    // Server uptime
    start_time: Instant,

    // Rolling tick times for percentile calculation (VecDeque for O(1) pop_front)
    tick_history: RwLock<VecDeque<u64>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            clients_connected: AtomicU64::new(0),
            clients_ingame: AtomicU64::new(0),
            tick_time_us: AtomicU64::new(0),
            tick_time_p95_us: AtomicU64::new(0),
            tick_time_p99_us: AtomicU64::new(0),
            tick_time_max_us: AtomicU64::new(0),
            tick_count: AtomicU64::new(0),
            snapshots_single: AtomicU64::new(0),
            snapshots_multipart: AtomicU64::new(0),
            snapshots_empty: AtomicU64::new(0),
            snapshot_bytes: AtomicU64::new(0),
            snap_ids_in_use: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            packets_rate_limited: AtomicU64::new(0),
            map_chunks_sent: AtomicU64::new(0),
            bans_issued: AtomicU64::new(0),
            map_changes: AtomicU64::new(0),
            start_time: Instant::now(),
            tick_history: RwLock::new(VecDeque::with_capacity(1000)),
        }
    }

    /// Record a tick time and update percentiles
    pub fn record_tick_time(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.tick_time_us.store(us, Ordering::Relaxed);
        self.tick_count.fetch_add(1, Ordering::Relaxed);

        let mut history = self.tick_history.write();
        history.push_back(us);

        // Keep last 1000 samples
        while history.len() > 1000 {
            history.pop_front();
        }

        if history.len() >= 10 {
            let mut sorted: Vec<u64> = history.iter().copied().collect();
            sorted.sort_unstable();

            let p95_idx = (sorted.len() as f32 * 0.95) as usize;
            let p99_idx = (sorted.len() as f32 * 0.99) as usize;

            self.tick_time_p95_us.store(sorted[p95_idx.min(sorted.len() - 1)], Ordering::Relaxed);
            self.tick_time_p99_us.store(sorted[p99_idx.min(sorted.len() - 1)], Ordering::Relaxed);
            self.tick_time_max_us.store(sorted.last().copied().unwrap_or(0), Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_sent(&self, bytes: usize) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_received(&self, bytes: usize) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-format metrics output
    pub fn to_prometheus(&self) -> String {
        let mut output = String::with_capacity(4096);

        macro_rules! metric {
            ($name:expr, $help:expr, $type:expr, $value:expr) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} {}\n{} {}\n",
                    $name, $help, $name, $type, $name, $value
                ));
            };
        }

        metric!("snapwire_clients_connected", "Occupied client slots", "gauge",
            self.clients_connected.load(Ordering::Relaxed));
        metric!("snapwire_clients_ingame", "Clients in game", "gauge",
            self.clients_ingame.load(Ordering::Relaxed));

        metric!("snapwire_tick_time_microseconds", "Current tick time in microseconds", "gauge",
            self.tick_time_us.load(Ordering::Relaxed));
        metric!("snapwire_tick_time_p95_microseconds", "95th percentile tick time", "gauge",
            self.tick_time_p95_us.load(Ordering::Relaxed));
        metric!("snapwire_tick_time_p99_microseconds", "99th percentile tick time", "gauge",
            self.tick_time_p99_us.load(Ordering::Relaxed));
        metric!("snapwire_tick_time_max_microseconds", "Maximum tick time", "gauge",
            self.tick_time_max_us.load(Ordering::Relaxed));
        metric!("snapwire_tick_count", "Total ticks processed", "counter",
            self.tick_count.load(Ordering::Relaxed));

        metric!("snapwire_snapshots_single_total", "Snapshots sent in one message", "counter",
            self.snapshots_single.load(Ordering::Relaxed));
        metric!("snapwire_snapshots_multipart_total", "Snapshots split over several messages", "counter",
            self.snapshots_multipart.load(Ordering::Relaxed));
        metric!("snapwire_snapshots_empty_total", "Empty snapshot deltas sent", "counter",
            self.snapshots_empty.load(Ordering::Relaxed));
        metric!("snapwire_snapshot_bytes_total", "Compressed snapshot payload bytes", "counter",
            self.snapshot_bytes.load(Ordering::Relaxed));
        metric!("snapwire_snap_ids_in_use", "Allocated snapshot identifiers", "gauge",
            self.snap_ids_in_use.load(Ordering::Relaxed));

        metric!("snapwire_messages_sent_total", "Total messages sent", "counter",
            self.messages_sent.load(Ordering::Relaxed));
        metric!("snapwire_messages_received_total", "Total messages received", "counter",
            self.messages_received.load(Ordering::Relaxed));
        metric!("snapwire_bytes_sent_total", "Total bytes sent", "counter",
            self.bytes_sent.load(Ordering::Relaxed));
        metric!("snapwire_bytes_received_total", "Total bytes received", "counter",
            self.bytes_received.load(Ordering::Relaxed));
        metric!("snapwire_packets_rate_limited_total", "Packets dropped by the traffic limit", "counter",
            self.packets_rate_limited.load(Ordering::Relaxed));
        metric!("snapwire_map_chunks_sent_total", "Map chunks sent", "counter",
            self.map_chunks_sent.load(Ordering::Relaxed));
        metric!("snapwire_bans_total", "Address bans issued", "counter",
            self.bans_issued.load(Ordering::Relaxed));
        metric!("snapwire_map_changes_total", "Maps loaded", "counter",
            self.map_changes.load(Ordering::Relaxed));
        metric!("snapwire_uptime_seconds", "Server uptime in seconds", "counter",
            self.uptime_seconds());

        output
    }

    /// Generate JSON format metrics (alternative for direct API access)
    pub fn to_json(&self) -> String {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        serde_json::json!({
            "clients": {
                "connected": load(&self.clients_connected),
                "ingame": load(&self.clients_ingame),
            },
            "performance": {
                "tick_time_us": load(&self.tick_time_us),
                "tick_time_p95_us": load(&self.tick_time_p95_us),
                "tick_time_p99_us": load(&self.tick_time_p99_us),
                "tick_time_max_us": load(&self.tick_time_max_us),
                "tick_count": load(&self.tick_count),
            },
            "snapshots": {
                "single": load(&self.snapshots_single),
                "multipart": load(&self.snapshots_multipart),
                "empty": load(&self.snapshots_empty),
                "bytes": load(&self.snapshot_bytes),
                "ids_in_use": load(&self.snap_ids_in_use),
            },
            "network": {
                "messages_sent": load(&self.messages_sent),
                "messages_received": load(&self.messages_received),
                "bytes_sent": load(&self.bytes_sent),
                "bytes_received": load(&self.bytes_received),
                "rate_limited": load(&self.packets_rate_limited),
                "map_chunks_sent": load(&self.map_chunks_sent),
                "bans": load(&self.bans_issued),
            },
            "uptime_seconds": self.uptime_seconds(),
        })
        .to_string()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the metrics HTTP server
pub async fn start_metrics_server(metrics: Arc<Metrics>, port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        let (mut socket, peer) = listener.accept().await?;
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 1024];

            match socket.read(&mut buffer).await {
                Ok(n) if n > 0 => {
                    let request = String::from_utf8_lossy(&buffer[..n]);
                    let response = route(&metrics, &request);
                    if let Err(e) = socket.write_all(response.as_bytes()).await {
                        debug!("Failed to write metrics response to {}: {}", peer, e);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("Failed to read from metrics socket {}: {}", peer, e);
                }
            }
        });
    }
}

fn route(metrics: &Metrics, request: &str) -> String {
    let (content_type, body) = if request.starts_with("GET /metrics/json") || request.starts_with("GET /json") {
        ("application/json", metrics.to_json())
    } else if request.starts_with("GET /metrics") {
        ("text/plain; version=0.0.4", metrics.to_prometheus())
    } else if request.starts_with("GET /health") || request.starts_with("GET / ") {
        ("text/plain", "OK".to_string())
    } else {
        return "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string();
    };
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        content_type,
        body.len(),
        body
    )
}

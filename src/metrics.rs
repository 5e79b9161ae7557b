//! Prometheus-compatible metrics endpoint.
//!
//! Counters and gauges for the tick pipeline, AOI broadcast and transport,
//! exposed in Prometheus text format. Default endpoint:
//! http://localhost:9090/metrics

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info};

/// Metrics registry for the simulation server.
#[derive(Debug)]
pub struct Metrics {
    // Population gauges
    pub entities_live: AtomicU64,
    pub sessions_active: AtomicU64,
    pub connections_active: AtomicU64,

    // Intent pipeline counters
    pub intents_received: AtomicU64,
    pub intents_applied: AtomicU64,
    pub intents_clamped: AtomicU64,
    pub intents_rejected: AtomicU64,
    pub intents_shed: AtomicU64,

    // Broadcast counters
    pub snapshots_sent: AtomicU64,
    pub despawns_sent: AtomicU64,
    pub corrections_sent: AtomicU64,
    pub broadcast_drops: AtomicU64,

    // Transport counters
    pub messages_received: AtomicU64,
    pub messages_sent: AtomicU64,
    pub decode_errors: AtomicU64,
    pub validation_errors: AtomicU64,
    pub sessions_reaped: AtomicU64,

    // Tick timing (microseconds)
    pub tick_count: AtomicU64,
    pub tick_time_us: AtomicU64,
    pub tick_time_p95_us: AtomicU64,
    pub tick_time_p99_us: AtomicU64,
    pub tick_time_max_us: AtomicU64,
    pub tick_overruns: AtomicU64,

    start_time: Instant,

    // Rolling tick times for percentile calculation
    tick_history: RwLock<VecDeque<u64>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            entities_live: AtomicU64::new(0),
            sessions_active: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            intents_received: AtomicU64::new(0),
            intents_applied: AtomicU64::new(0),
            intents_clamped: AtomicU64::new(0),
            intents_rejected: AtomicU64::new(0),
            intents_shed: AtomicU64::new(0),
            snapshots_sent: AtomicU64::new(0),
            despawns_sent: AtomicU64::new(0),
            corrections_sent: AtomicU64::new(0),
            broadcast_drops: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            validation_errors: AtomicU64::new(0),
            sessions_reaped: AtomicU64::new(0),
            tick_count: AtomicU64::new(0),
            tick_time_us: AtomicU64::new(0),
            tick_time_p95_us: AtomicU64::new(0),
            tick_time_p99_us: AtomicU64::new(0),
            tick_time_max_us: AtomicU64::new(0),
            tick_overruns: AtomicU64::new(0),
            start_time: Instant::now(),
            tick_history: RwLock::new(VecDeque::with_capacity(1000)),
        }
    }

    /// Record a tick duration and refresh the rolling percentiles.
    pub fn record_tick_time(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.tick_time_us.store(us, Ordering::Relaxed);
        self.tick_count.fetch_add(1, Ordering::Relaxed);

        let mut history = self.tick_history.write();
        history.push_back(us);
        while history.len() > 1000 {
            history.pop_front();
        }

        if history.len() >= 10 {
            let mut sorted: Vec<u64> = history.iter().copied().collect();
            sorted.sort_unstable();

            let p95_idx = (sorted.len() as f64 * 0.95) as usize;
            let p99_idx = (sorted.len() as f64 * 0.99) as usize;

            self.tick_time_p95_us
                .store(sorted[p95_idx.min(sorted.len() - 1)], Ordering::Relaxed);
            self.tick_time_p99_us
                .store(sorted[p99_idx.min(sorted.len() - 1)], Ordering::Relaxed);
            self.tick_time_max_us
                .store(sorted.last().copied().unwrap_or(0), Ordering::Relaxed);
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Snapshot of every counter and gauge, backing `Engine::stats`.
    pub fn snapshot(&self) -> HashMap<String, u64> {
        let mut out = HashMap::new();
        let mut put = |name: &str, value: u64| {
            out.insert(name.to_string(), value);
        };

        put("entities_live", self.entities_live.load(Ordering::Relaxed));
        put(
            "sessions_active",
            self.sessions_active.load(Ordering::Relaxed),
        );
        put(
            "connections_active",
            self.connections_active.load(Ordering::Relaxed),
        );
        put(
            "intents_received",
            self.intents_received.load(Ordering::Relaxed),
        );
        put(
            "intents_applied",
            self.intents_applied.load(Ordering::Relaxed),
        );
        put(
            "intents_clamped",
            self.intents_clamped.load(Ordering::Relaxed),
        );
        put(
            "intents_rejected",
            self.intents_rejected.load(Ordering::Relaxed),
        );
        put("intents_shed", self.intents_shed.load(Ordering::Relaxed));
        put("snapshots_sent", self.snapshots_sent.load(Ordering::Relaxed));
        put("despawns_sent", self.despawns_sent.load(Ordering::Relaxed));
        put(
            "corrections_sent",
            self.corrections_sent.load(Ordering::Relaxed),
        );
        put(
            "broadcast_drops",
            self.broadcast_drops.load(Ordering::Relaxed),
        );
        put(
            "messages_received",
            self.messages_received.load(Ordering::Relaxed),
        );
        put("messages_sent", self.messages_sent.load(Ordering::Relaxed));
        put("decode_errors", self.decode_errors.load(Ordering::Relaxed));
        put(
            "validation_errors",
            self.validation_errors.load(Ordering::Relaxed),
        );
        put(
            "sessions_reaped",
            self.sessions_reaped.load(Ordering::Relaxed),
        );
        put("tick_count", self.tick_count.load(Ordering::Relaxed));
        put("tick_time_us", self.tick_time_us.load(Ordering::Relaxed));
        put(
            "tick_time_p95_us",
            self.tick_time_p95_us.load(Ordering::Relaxed),
        );
        put(
            "tick_time_p99_us",
            self.tick_time_p99_us.load(Ordering::Relaxed),
        );
        put(
            "tick_time_max_us",
            self.tick_time_max_us.load(Ordering::Relaxed),
        );
        put("tick_overruns", self.tick_overruns.load(Ordering::Relaxed));
        put("uptime_seconds", self.uptime_seconds());
        out
    }

    /// Generate Prometheus-format metrics output.
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

        metric!(
            "driftfield_entities_live",
            "Live entities in the world",
            "gauge",
            self.entities_live.load(Ordering::Relaxed)
        );
        metric!(
            "driftfield_sessions_active",
            "Registered sessions",
            "gauge",
            self.sessions_active.load(Ordering::Relaxed)
        );
        metric!(
            "driftfield_connections_active",
            "Open transport connections",
            "gauge",
            self.connections_active.load(Ordering::Relaxed)
        );
        metric!(
            "driftfield_intents_received_total",
            "Movement intents staged by readers",
            "counter",
            self.intents_received.load(Ordering::Relaxed)
        );
        metric!(
            "driftfield_intents_applied_total",
            "Movement intents accepted as-is",
            "counter",
            self.intents_applied.load(Ordering::Relaxed)
        );
        metric!(
            "driftfield_intents_clamped_total",
            "Movement intents clamped before apply",
            "counter",
            self.intents_clamped.load(Ordering::Relaxed)
        );
        metric!(
            "driftfield_intents_rejected_total",
            "Movement intents dropped by validation",
            "counter",
            self.intents_rejected.load(Ordering::Relaxed)
        );
        metric!(
            "driftfield_intents_shed_total",
            "Movement intents shed by staging backpressure",
            "counter",
            self.intents_shed.load(Ordering::Relaxed)
        );
        metric!(
            "driftfield_snapshots_sent_total",
            "Per-observer AOI snapshots enqueued",
            "counter",
            self.snapshots_sent.load(Ordering::Relaxed)
        );
        metric!(
            "driftfield_despawns_sent_total",
            "AOI departure notices enqueued",
            "counter",
            self.despawns_sent.load(Ordering::Relaxed)
        );
        metric!(
            "driftfield_corrections_sent_total",
            "Corrections enqueued",
            "counter",
            self.corrections_sent.load(Ordering::Relaxed)
        );
        metric!(
            "driftfield_broadcast_drops_total",
            "Outbound messages dropped by full session queues",
            "counter",
            self.broadcast_drops.load(Ordering::Relaxed)
        );
        metric!(
            "driftfield_messages_received_total",
            "Frames received from clients",
            "counter",
            self.messages_received.load(Ordering::Relaxed)
        );
        metric!(
            "driftfield_messages_sent_total",
            "Frames written to clients",
            "counter",
            self.messages_sent.load(Ordering::Relaxed)
        );
        metric!(
            "driftfield_decode_errors_total",
            "Inbound frames that failed to decode",
            "counter",
            self.decode_errors.load(Ordering::Relaxed)
        );
        metric!(
            "driftfield_validation_errors_total",
            "Inbound messages discarded as semantically empty",
            "counter",
            self.validation_errors.load(Ordering::Relaxed)
        );
        metric!(
            "driftfield_sessions_reaped_total",
            "Sessions torn down at tick boundaries",
            "counter",
            self.sessions_reaped.load(Ordering::Relaxed)
        );
        metric!(
            "driftfield_tick_count",
            "Ticks processed",
            "counter",
            self.tick_count.load(Ordering::Relaxed)
        );
        metric!(
            "driftfield_tick_time_microseconds",
            "Last tick duration",
            "gauge",
            self.tick_time_us.load(Ordering::Relaxed)
        );
        metric!(
            "driftfield_tick_time_p95_microseconds",
            "95th percentile tick duration",
            "gauge",
            self.tick_time_p95_us.load(Ordering::Relaxed)
        );
        metric!(
            "driftfield_tick_time_p99_microseconds",
            "99th percentile tick duration",
            "gauge",
            self.tick_time_p99_us.load(Ordering::Relaxed)
        );
        metric!(
            "driftfield_tick_time_max_microseconds",
            "Maximum tick duration in the rolling window",
            "gauge",
            self.tick_time_max_us.load(Ordering::Relaxed)
        );
        metric!(
            "driftfield_tick_overruns_total",
            "Ticks exceeding half the configured period",
            "counter",
            self.tick_overruns.load(Ordering::Relaxed)
        );
        metric!(
            "driftfield_uptime_seconds",
            "Server uptime in seconds",
            "counter",
            self.uptime_seconds()
        );

        output
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the metrics HTTP server.
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

                    let response = if request.starts_with("GET /metrics") {
                        let body = metrics.to_prometheus();
                        format!(
                            "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            body.len(),
                            body
                        )
                    } else if request.starts_with("GET /health") || request.starts_with("GET / ") {
                        let body = "OK";
                        format!(
                            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            body.len(),
                            body
                        )
                    } else {
                        "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                            .to_string()
                    };

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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_start_at_zero() {
        let metrics = Metrics::new();
        assert_eq!(metrics.entities_live.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.tick_count.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_record_tick_time_updates_percentiles() {
        let metrics = Metrics::new();
        for i in 0..100 {
            metrics.record_tick_time(Duration::from_micros(100 + i * 10));
        }

        assert_eq!(metrics.tick_count.load(Ordering::Relaxed), 100);
        assert!(metrics.tick_time_p95_us.load(Ordering::Relaxed) > 0);
        assert!(
            metrics.tick_time_p99_us.load(Ordering::Relaxed)
                >= metrics.tick_time_p95_us.load(Ordering::Relaxed)
        );
    }

    #[test]
    fn test_prometheus_format() {
        let metrics = Metrics::new();
        metrics.entities_live.store(12, Ordering::Relaxed);
        metrics.broadcast_drops.store(3, Ordering::Relaxed);

        let output = metrics.to_prometheus();
        assert!(output.contains("driftfield_entities_live 12"));
        assert!(output.contains("driftfield_broadcast_drops_total 3"));
        assert!(output.contains("# HELP"));
        assert!(output.contains("# TYPE"));
    }

    #[test]
    fn test_snapshot_map() {
        let metrics = Metrics::new();
        metrics.sessions_active.store(4, Ordering::Relaxed);
        metrics.corrections_sent.store(9, Ordering::Relaxed);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot["sessions_active"], 4);
        assert_eq!(snapshot["corrections_sent"], 9);
        assert!(snapshot.contains_key("tick_count"));
        assert!(snapshot.contains_key("uptime_seconds"));
    }
}

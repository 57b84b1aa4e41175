//! Prometheus-compatible metrics endpoint
//!
//! Exposes concealment and dynamic visibility counters in Prometheus format.
//! Default endpoint: http://localhost:9090/metrics

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{info, debug};

/// Metrics registry for the concealment server
#[derive(Debug)]
pub struct Metrics {
    // Concealment state
    pub concealed_clusters: AtomicU64,
    pub concealed_entities: AtomicU64,

    // Concealment activity
    pub conceals_total: AtomicU64,
    pub reveals_total: AtomicU64,
    pub forced_reveals: AtomicU64,
    pub excluded_total: AtomicU64,

    // Scan timing (microseconds)
    pub scan_time_us: AtomicU64,
    pub scan_time_p95_us: AtomicU64,
    pub scan_time_p99_us: AtomicU64,
    pub scan_time_max_us: AtomicU64,
    pub scan_count: AtomicU64,

    // Tick counter
    pub tick_count: AtomicU64,

    // Dynamic visibility
    pub governed_entities: AtomicU64,
    pub updates_suppressed: AtomicU64,
    pub updates_passed: AtomicU64,
    pub nearby_refreshes: AtomicU64,
    pub decision_refreshes: AtomicU64,
    pub refresh_failures: AtomicU64,
    pub hook_failures: AtomicU64,

    // Server uptime
    start_time: Instant,

    // Rolling scan times for percentile calculation
    scan_history: RwLock<VecDeque<u64>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            concealed_clusters: AtomicU64::new(0),
            concealed_entities: AtomicU64::new(0),
            conceals_total: AtomicU64::new(0),
            reveals_total: AtomicU64::new(0),
            forced_reveals: AtomicU64::new(0),
            excluded_total: AtomicU64::new(0),
            scan_time_us: AtomicU64::new(0),
            scan_time_p95_us: AtomicU64::new(0),
            scan_time_p99_us: AtomicU64::new(0),
            scan_time_max_us: AtomicU64::new(0),
            scan_count: AtomicU64::new(0),
            tick_count: AtomicU64::new(0),
            governed_entities: AtomicU64::new(0),
            updates_suppressed: AtomicU64::new(0),
            updates_passed: AtomicU64::new(0),
            nearby_refreshes: AtomicU64::new(0),
            decision_refreshes: AtomicU64::new(0),
            refresh_failures: AtomicU64::new(0),
            hook_failures: AtomicU64::new(0),
            start_time: Instant::now(),
            scan_history: RwLock::new(VecDeque::with_capacity(256)),
        }
    }

    /// Record a conceal scan duration and update percentiles
    pub fn record_scan_time(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.scan_time_us.store(us, Ordering::Relaxed);
        self.scan_count.fetch_add(1, Ordering::Relaxed);

        let mut history = self.scan_history.write();
        history.push_back(us);

        // Scans are infrequent; 256 samples span hours at default intervals
        while history.len() > 256 {
            history.pop_front();
        }

        if history.len() >= 10 {
            let mut sorted: Vec<u64> = history.iter().copied().collect();
            sorted.sort_unstable();

            let p95_idx = (sorted.len() as f32 * 0.95) as usize;
            let p99_idx = (sorted.len() as f32 * 0.99) as usize;

            self.scan_time_p95_us.store(sorted[p95_idx.min(sorted.len() - 1)], Ordering::Relaxed);
            self.scan_time_p99_us.store(sorted[p99_idx.min(sorted.len() - 1)], Ordering::Relaxed);
            self.scan_time_max_us.store(sorted.last().copied().unwrap_or(0), Ordering::Relaxed);
        }
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

        // Concealment state
        metric!("concealment_clusters_concealed", "Clusters currently concealed", "gauge",
            self.concealed_clusters.load(Ordering::Relaxed));
        metric!("concealment_entities_concealed", "Top-level entities currently concealed", "gauge",
            self.concealed_entities.load(Ordering::Relaxed));

        // Activity
        metric!("concealment_conceals_total", "Clusters concealed", "counter",
            self.conceals_total.load(Ordering::Relaxed));
        metric!("concealment_reveals_total", "Clusters revealed", "counter",
            self.reveals_total.load(Ordering::Relaxed));
        metric!("concealment_forced_reveals_total", "Clusters revealed because a member was destroyed", "counter",
            self.forced_reveals.load(Ordering::Relaxed));
        metric!("concealment_excluded_total", "Distant clusters kept simulated by an exclusion rule", "counter",
            self.excluded_total.load(Ordering::Relaxed));

        // Scan timing
        metric!("concealment_scan_time_microseconds", "Last conceal scan time in microseconds", "gauge",
            self.scan_time_us.load(Ordering::Relaxed));
        metric!("concealment_scan_time_p95_microseconds", "95th percentile conceal scan time", "gauge",
            self.scan_time_p95_us.load(Ordering::Relaxed));
        metric!("concealment_scan_time_p99_microseconds", "99th percentile conceal scan time", "gauge",
            self.scan_time_p99_us.load(Ordering::Relaxed));
        metric!("concealment_scan_time_max_microseconds", "Maximum conceal scan time", "gauge",
            self.scan_time_max_us.load(Ordering::Relaxed));
        metric!("concealment_scan_count", "Conceal scans run", "counter",
            self.scan_count.load(Ordering::Relaxed));
        metric!("concealment_tick_count", "Controller ticks processed", "counter",
            self.tick_count.load(Ordering::Relaxed));

        // Dynamic visibility
        metric!("visibility_governed_entities", "Entities with a dynamic visibility runtime", "gauge",
            self.governed_entities.load(Ordering::Relaxed));
        #[cfg(feature = "metrics_extended")]
        {
            metric!("visibility_updates_suppressed_total", "Entity updates vetoed", "counter",
                self.updates_suppressed.load(Ordering::Relaxed));
            metric!("visibility_updates_passed_total", "Entity updates let through", "counter",
                self.updates_passed.load(Ordering::Relaxed));
        }
        metric!("visibility_nearby_refreshes_total", "Cluster nearby-list rebuilds", "counter",
            self.nearby_refreshes.load(Ordering::Relaxed));
        metric!("visibility_decision_refreshes_total", "Entity visibility decisions recomputed", "counter",
            self.decision_refreshes.load(Ordering::Relaxed));
        metric!("visibility_refresh_failures_total", "Background refresh tasks that panicked", "counter",
            self.refresh_failures.load(Ordering::Relaxed));
        metric!("visibility_hook_failures", "Entity types whose update veto could not be installed", "gauge",
            self.hook_failures.load(Ordering::Relaxed));

        metric!("concealment_uptime_seconds", "Server uptime in seconds", "counter",
            self.uptime_seconds());

        output
    }

    /// Generate JSON format metrics (alternative for direct API access)
    pub fn to_json(&self) -> String {
        format!(r#"{{
  "concealment": {{
    "clusters": {},
    "entities": {},
    "conceals_total": {},
    "reveals_total": {},
    "forced_reveals": {},
    "excluded_total": {}
  }},
  "performance": {{
    "scan_time_us": {},
    "scan_time_p95_us": {},
    "scan_time_p99_us": {},
    "scan_time_max_us": {},
    "scan_count": {},
    "tick_count": {}
  }},
  "visibility": {{
    "governed_entities": {},
    "updates_suppressed": {},
    "updates_passed": {},
    "nearby_refreshes": {},
    "decision_refreshes": {},
    "refresh_failures": {},
    "hook_failures": {}
  }},
  "uptime_seconds": {}
}}"#,
            self.concealed_clusters.load(Ordering::Relaxed),
            self.concealed_entities.load(Ordering::Relaxed),
            self.conceals_total.load(Ordering::Relaxed),
            self.reveals_total.load(Ordering::Relaxed),
            self.forced_reveals.load(Ordering::Relaxed),
            self.excluded_total.load(Ordering::Relaxed),
            self.scan_time_us.load(Ordering::Relaxed),
            self.scan_time_p95_us.load(Ordering::Relaxed),
            self.scan_time_p99_us.load(Ordering::Relaxed),
            self.scan_time_max_us.load(Ordering::Relaxed),
            self.scan_count.load(Ordering::Relaxed),
            self.tick_count.load(Ordering::Relaxed),
            self.governed_entities.load(Ordering::Relaxed),
            self.updates_suppressed.load(Ordering::Relaxed),
            self.updates_passed.load(Ordering::Relaxed),
            self.nearby_refreshes.load(Ordering::Relaxed),
            self.decision_refreshes.load(Ordering::Relaxed),
            self.refresh_failures.load(Ordering::Relaxed),
            self.hook_failures.load(Ordering::Relaxed),
            self.uptime_seconds(),
        )
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
            if let Err(e) = serve_connection(&mut socket, &metrics).await {
                debug!("Metrics connection {} failed: {}", peer, e);
            }
        });
    }
}

/// Answer a single request on an accepted connection
async fn serve_connection<S>(socket: &mut S, metrics: &Metrics) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buffer = [0u8; 1024];
    let n = socket.read(&mut buffer).await?;
    if n == 0 {
        return Ok(());
    }
    let request = String::from_utf8_lossy(&buffer[..n]);
    let response = route(&request, metrics);
    socket.write_all(response.as_bytes()).await
}

/// Build the HTTP response for a raw request
fn route(request: &str, metrics: &Metrics) -> String {
    // Longest prefix first: `/metrics` would also match `/metrics/json`
    if request.starts_with("GET /metrics/json") || request.starts_with("GET /json") {
        let body = metrics.to_json();
        format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        )
    } else if request.starts_with("GET /metrics") {
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
        "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = Metrics::new();
        assert_eq!(metrics.concealed_clusters.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.tick_count.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_record_scan_time() {
        let metrics = Metrics::new();

        for i in 0..100 {
            metrics.record_scan_time(Duration::from_micros(100 + i * 10));
        }

        assert_eq!(metrics.scan_count.load(Ordering::Relaxed), 100);
        assert!(metrics.scan_time_p95_us.load(Ordering::Relaxed) > 0);
        assert!(metrics.scan_time_p99_us.load(Ordering::Relaxed) > 0);
        assert_eq!(metrics.scan_time_max_us.load(Ordering::Relaxed), 1090);
    }

    #[test]
    fn test_prometheus_format() {
        let metrics = Metrics::new();
        metrics.concealed_clusters.store(12, Ordering::Relaxed);
        metrics.forced_reveals.store(3, Ordering::Relaxed);

        let output = metrics.to_prometheus();

        assert!(output.contains("concealment_clusters_concealed 12"));
        assert!(output.contains("concealment_forced_reveals_total 3"));
        assert!(output.contains("# HELP"));
        assert!(output.contains("# TYPE"));
    }

    #[test]
    fn test_json_format() {
        let metrics = Metrics::new();
        metrics.conceals_total.store(100, Ordering::Relaxed);

        let output = metrics.to_json();

        assert!(output.contains("\"conceals_total\": 100"));
        assert!(output.contains("\"concealment\":"));
        assert!(output.contains("\"visibility\":"));
        assert!(serde_json::from_str::<serde_json::Value>(&output).is_ok());
    }

    #[test]
    fn test_route() {
        let metrics = Metrics::new();
        assert!(route("GET /metrics HTTP/1.1\r\n", &metrics).contains("text/plain; version=0.0.4"));
        assert!(route("GET /metrics/json HTTP/1.1\r\n", &metrics).contains("application/json"));
        assert!(route("GET /health HTTP/1.1\r\n", &metrics).ends_with("OK"));
        assert!(route("POST /metrics HTTP/1.1\r\n", &metrics).starts_with("HTTP/1.1 404"));
    }

    #[test]
    fn test_serve_connection_answers_request() {
        let metrics = Metrics::new();
        let request = "GET /health HTTP/1.1\r\n\r\n";
        let expected = route(request, &metrics);

        let mut socket = tokio_test::io::Builder::new()
            .read(request.as_bytes())
            .write(expected.as_bytes())
            .build();
        tokio_test::block_on(serve_connection(&mut socket, &metrics)).unwrap();
    }
}

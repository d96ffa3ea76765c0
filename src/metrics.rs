//! Prometheus-style counters for the LDAP listener, plus a tiny HTTP endpoint serving them.

use crate::directory::Directory;
use anyhow::{Context, Result};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{error, info};

/// Operation labels, in the order they are rendered.
pub const OPERATIONS: [&str; 5] = ["bind", "search", "add", "modify", "delete"];

/// Histogram bucket upper bounds in seconds; +Inf is the total count.
const DURATION_BUCKETS: [f64; 11] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

#[derive(Debug, Default)]
struct DurationHistogram {
    /// Non-cumulative: each observation lands in the first bucket that fits.
    buckets: [AtomicU64; 11],
    count: AtomicU64,
    sum_micros: AtomicU64,
}

impl DurationHistogram {
    fn observe(&self, duration: Duration) {
        let micros = duration.as_micros().min(u64::MAX as u128) as u64;
        let secs = duration.as_secs_f64();
        if let Some(i) = DURATION_BUCKETS.iter().position(|&le| secs <= le) {
            self.buckets[i].fetch_add(1, Ordering::Relaxed);
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros.fetch_add(micros, Ordering::Relaxed);
    }
}

#[derive(Debug, Default)]
struct OpMetrics {
    requests: AtomicU64,
    errors: AtomicU64,
    duration: DurationHistogram,
}

/// Lock-free counters shared by every connection task.
#[derive(Debug, Default)]
pub struct Metrics {
    pub connections_total: AtomicU64,
    /// PDUs that could not be decoded.
    pub parse_errors: AtomicU64,
    /// Requests with no per-operation counter (unbind, abandon, unsupported ops).
    pub errors_other: AtomicU64,
    ops: [OpMetrics; 5],
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn op(&self, op: &str) -> Option<&OpMetrics> {
        OPERATIONS.iter().position(|name| *name == op).map(|i| &self.ops[i])
    }

    #[inline]
    pub fn inc_connections(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_request(&self, op: &str) {
        if let Some(m) = self.op(op) {
            m.requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn inc_error(&self, op: &str) {
        match self.op(op) {
            Some(m) => m.errors.fetch_add(1, Ordering::Relaxed),
            None => self.errors_other.fetch_add(1, Ordering::Relaxed),
        };
    }

    #[inline]
    pub fn inc_parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Records how long an operation took, whatever its outcome.
    #[inline]
    pub fn observe_duration(&self, op: &str, duration: Duration) {
        if let Some(m) = self.op(op) {
            m.duration.observe(duration);
        }
    }

    pub fn requests(&self, op: &str) -> u64 {
        self.op(op).map_or(0, |m| m.requests.load(Ordering::Relaxed))
    }

    pub fn errors(&self, op: &str) -> u64 {
        self.op(op).map_or(0, |m| m.errors.load(Ordering::Relaxed))
    }

    /// Prometheus text exposition format. `users` and `groups` are the current directory size.
    pub fn render(&self, users: usize, groups: usize) -> String {
        let mut out = String::new();
        out.push_str("# HELP fakeldap_connections_total Total number of client connections accepted.\n");
        out.push_str("# TYPE fakeldap_connections_total counter\n");
        out.push_str(&format!(
            "fakeldap_connections_total {}\n",
            self.connections_total.load(Ordering::Relaxed)
        ));

        out.push_str("# HELP fakeldap_parse_errors_total Total number of LDAP messages that failed to decode.\n");
        out.push_str("# TYPE fakeldap_parse_errors_total counter\n");
        out.push_str(&format!(
            "fakeldap_parse_errors_total {}\n",
            self.parse_errors.load(Ordering::Relaxed)
        ));

        out.push_str("# HELP fakeldap_requests_total Successful LDAP requests by operation.\n");
        out.push_str("# TYPE fakeldap_requests_total counter\n");
        for (op, m) in OPERATIONS.iter().zip(&self.ops) {
            out.push_str(&format!(
                "fakeldap_requests_total{{op=\"{}\"}} {}\n",
                op,
                m.requests.load(Ordering::Relaxed)
            ));
        }

        out.push_str("# HELP fakeldap_errors_total LDAP requests answered with a non-success result code.\n");
        out.push_str("# TYPE fakeldap_errors_total counter\n");
        for (op, m) in OPERATIONS.iter().zip(&self.ops) {
            out.push_str(&format!(
                "fakeldap_errors_total{{op=\"{}\"}} {}\n",
                op,
                m.errors.load(Ordering::Relaxed)
            ));
        }
        out.push_str(&format!(
            "fakeldap_errors_total{{op=\"other\"}} {}\n",
            self.errors_other.load(Ordering::Relaxed)
        ));

        out.push_str("# HELP fakeldap_directory_entries Entries currently held in the directory.\n");
        out.push_str("# TYPE fakeldap_directory_entries gauge\n");
        out.push_str(&format!("fakeldap_directory_entries{{kind=\"user\"}} {}\n", users));
        out.push_str(&format!("fakeldap_directory_entries{{kind=\"group\"}} {}\n", groups));

        out.push_str("# HELP fakeldap_request_duration_seconds Request duration in seconds by operation.\n");
        out.push_str("# TYPE fakeldap_request_duration_seconds histogram\n");
        for (op, m) in OPERATIONS.iter().zip(&self.ops) {
            let hist = &m.duration;
            let count = hist.count.load(Ordering::Relaxed);
            let mut cum = 0u64;
            for (bucket, &le) in hist.buckets.iter().zip(DURATION_BUCKETS.iter()) {
                cum += bucket.load(Ordering::Relaxed);
                out.push_str(&format!(
                    "fakeldap_request_duration_seconds_bucket{{op=\"{}\",le=\"{}\"}} {}\n",
                    op, le, cum
                ));
            }
            out.push_str(&format!(
                "fakeldap_request_duration_seconds_bucket{{op=\"{}\",le=\"+Inf\"}} {}\n",
                op, count
            ));
            let sum_secs = hist.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;
            out.push_str(&format!(
                "fakeldap_request_duration_seconds_sum{{op=\"{}\"}} {}\n",
                op, sum_secs
            ));
            out.push_str(&format!(
                "fakeldap_request_duration_seconds_count{{op=\"{}\"}} {}\n",
                op, count
            ));
        }

        out
    }
}

/// Body of GET /ready.
#[derive(Serialize)]
struct ReadyBody {
    ready: bool,
    users: usize,
    groups: usize,
}

/// Path from the request line ("GET /health HTTP/1.1" -> "/health").
fn request_path(first_line: &str) -> &str {
    let mut parts = first_line.trim().split_ascii_whitespace();
    let _method = parts.next();
    let path = parts.next().unwrap_or("");
    if path.starts_with('/') {
        path
    } else {
        ""
    }
}

/// (status, body, content type) for one request path.
fn respond(path: &str, metrics: &Metrics, directory: &Directory) -> (&'static str, String, &'static str) {
    match path {
        "/health" => ("200 OK", "ok".to_string(), "text/plain; charset=utf-8"),
        "/ready" => {
            let body = serde_json::to_string(&ReadyBody {
                ready: true,
                users: directory.user_count(),
                groups: directory.group_count(),
            })
            .unwrap_or_else(|_| r#"{"ready":true,"error":"serialize"}"#.to_string());
            ("200 OK", body, "application/json")
        }
        "/metrics" => (
            "200 OK",
            metrics.render(directory.user_count(), directory.group_count()),
            "text/plain; version=0.0.4; charset=utf-8",
        ),
        _ => (
            "404 Not Found",
            "Not found. Supported: GET /metrics, GET /health, GET /ready.\n".to_string(),
            "text/plain; charset=utf-8",
        ),
    }
}

/// Binds `addr` and serves GET /metrics, /health and /ready until the task is dropped.
pub async fn run_metrics_server(addr: &str, metrics: Arc<Metrics>, directory: Arc<Directory>) -> Result<()> {
    let socket_addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("Invalid metrics listen address: {}", addr))?;

    let listener = TcpListener::bind(&socket_addr)
        .await
        .with_context(|| format!("Failed to bind metrics server to {}", socket_addr))?;

    info!("Metrics server listening on http://{} (GET /metrics, /health, /ready)", socket_addr);
    serve_metrics(listener, metrics, directory).await
}

pub async fn serve_metrics(listener: TcpListener, metrics: Arc<Metrics>, directory: Arc<Directory>) -> Result<()> {
    loop {
        let (mut stream, _peer) = match listener.accept().await {
            Ok(accept) => accept,
            Err(e) => {
                error!("Metrics accept error: {}", e);
                continue;
            }
        };

        let metrics = Arc::clone(&metrics);
        let directory = Arc::clone(&directory);

        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            let mut total = 0usize;
            loop {
                match stream.read(&mut buf[total..]).await {
                    Ok(0) => break,
                    Ok(n) => {
                        total += n;
                        if buf[..total].windows(4).any(|w| w == b"\r\n\r\n") || total >= buf.len() {
                            break;
                        }
                    }
                    Err(_) => return,
                }
            }

            let request = String::from_utf8_lossy(&buf[..total]);
            let path = request.lines().next().map(request_path).unwrap_or("");
            let (status, body, content_type) = respond(path, &metrics, &directory);
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: {}\r\nConnection: close\r\nContent-Length: {}\r\n\r\n{}",
                status,
                content_type,
                body.len(),
                body
            );

            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpStream;

    #[test]
    fn test_request_path() {
        assert_eq!(request_path("GET /health HTTP/1.1"), "/health");
        assert_eq!(request_path("GET /ready HTTP/1.0"), "/ready");
        assert_eq!(request_path("GET /metrics HTTP/1.1"), "/metrics");
        assert_eq!(request_path(""), "");
        assert_eq!(request_path("GET  HTTP/1.1"), "");
    }

    #[test]
    fn test_counters_by_operation() {
        let m = Metrics::new();
        m.inc_request("bind");
        m.inc_request("bind");
        m.inc_error("search");
        m.inc_error("abandon");
        m.inc_request("compare");
        assert_eq!(m.requests("bind"), 2);
        assert_eq!(m.errors("search"), 1);
        assert_eq!(m.requests("compare"), 0);
        assert_eq!(m.errors_other.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_render() {
        let m = Metrics::new();
        m.inc_connections();
        m.inc_request("search");
        m.observe_duration("search", Duration::from_millis(3));
        m.observe_duration("search", Duration::from_millis(30));
        let out = m.render(2, 1);
        assert!(out.contains("fakeldap_connections_total 1\n"));
        assert!(out.contains("fakeldap_requests_total{op=\"search\"} 1\n"));
        assert!(out.contains("fakeldap_directory_entries{kind=\"user\"} 2\n"));
        assert!(out.contains("fakeldap_directory_entries{kind=\"group\"} 1\n"));
        assert!(out.contains("fakeldap_request_duration_seconds_bucket{op=\"search\",le=\"0.005\"} 1\n"));
        assert!(out.contains("fakeldap_request_duration_seconds_bucket{op=\"search\",le=\"0.05\"} 2\n"));
        assert!(out.contains("fakeldap_request_duration_seconds_count{op=\"search\"} 2\n"));
    }

    #[test]
    fn test_respond_ready_reports_directory_size() {
        let directory = Directory::new();
        directory.add_user("cn=u1,dc=example,dc=com", "pw1", None);
        directory.add_group_member("cn=g,dc=example,dc=com", "cn=u1,dc=example,dc=com");
        let (status, body, content_type) = respond("/ready", &Metrics::new(), &directory);
        assert_eq!(status, "200 OK");
        assert_eq!(content_type, "application/json");
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["ready"], true);
        assert_eq!(json["users"], 1);
        assert_eq!(json["groups"], 1);

        let (status, _, _) = respond("/nope", &Metrics::new(), &directory);
        assert_eq!(status, "404 Not Found");
    }

    #[tokio::test]
    async fn test_serve_health_over_http() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve_metrics(listener, Arc::new(Metrics::new()), Arc::new(Directory::new())));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"GET /health HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.ends_with("\r\n\r\nok"));

        server.abort();
    }
}

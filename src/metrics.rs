//! Prometheus metrics
//!
//! All metrics live in the default registry; [`render`] produces the text
//! exposition served on `METRICS_ADDR`.

use std::convert::Infallible;
use std::net::SocketAddr;

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use lazy_static::lazy_static;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use prometheus::{
    register_counter, register_counter_vec, register_gauge_vec, register_histogram_vec, Counter,
    CounterVec, Encoder, GaugeVec, HistogramVec, TextEncoder,
};
use tracing::{debug, info};

use crate::error::RunnerResult;

lazy_static! {
    // ─────────────────────────────────────────────────────────────────────────────
    // Sandbox operations
    // ─────────────────────────────────────────────────────────────────────────────

    /// Sandbox operations by name and outcome.
    ///
    /// Labels:
    /// - operation: create, destroy, fork, clone, snapshot, restore, ...
    /// - outcome: ok or error
    pub static ref SANDBOX_OPERATIONS: CounterVec = register_counter_vec!(
        "chvisor_sandbox_operations_total",
        "Sandbox operations by operation and outcome",
        &["operation", "outcome"]
    ).expect("failed to register SANDBOX_OPERATIONS metric");

    /// Wall-clock duration of sandbox operations in seconds.
    pub static ref SANDBOX_OPERATION_DURATION: HistogramVec = register_histogram_vec!(
        "chvisor_sandbox_operation_duration_seconds",
        "Duration of sandbox operations",
        &["operation"],
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
    ).expect("failed to register SANDBOX_OPERATION_DURATION metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Resource pools
    // ─────────────────────────────────────────────────────────────────────────────

    /// Free slots per pool (netns, tap, ip).
    pub static ref POOL_AVAILABLE: GaugeVec = register_gauge_vec!(
        "chvisor_pool_available",
        "Free slots in each host resource pool",
        &["pool"]
    ).expect("failed to register POOL_AVAILABLE metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Memory ballooning
    // ─────────────────────────────────────────────────────────────────────────────

    /// Current balloon size per sandbox in bytes.
    pub static ref BALLOON_SIZE_BYTES: GaugeVec = register_gauge_vec!(
        "chvisor_balloon_size_bytes",
        "Balloon size set by the memory controller",
        &["sandbox_id"]
    ).expect("failed to register BALLOON_SIZE_BYTES metric");

    /// Balloon adjustments by direction (reclaim or return).
    pub static ref BALLOON_ADJUSTMENTS: CounterVec = register_counter_vec!(
        "chvisor_balloon_adjustments_total",
        "Balloon resizes issued by the memory controller",
        &["direction"]
    ).expect("failed to register BALLOON_ADJUSTMENTS metric");

    /// Samples dropped because the stats write buffer was full.
    pub static ref STATS_DROPPED: Counter = register_counter!(
        "chvisor_stats_dropped_total",
        "Memory stats samples dropped on a full write buffer"
    ).expect("failed to register STATS_DROPPED metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Recovery
    // ─────────────────────────────────────────────────────────────────────────────

    /// Orphan recoveries by method (restore, cold_boot) and outcome.
    pub static ref RECOVERY_OUTCOMES: CounterVec = register_counter_vec!(
        "chvisor_recovery_total",
        "Orphaned sandbox recoveries by method and outcome",
        &["method", "outcome"]
    ).expect("failed to register RECOVERY_OUTCOMES metric");
}

/// Records the outcome and duration of one sandbox operation
pub fn observe_operation<T, E>(operation: &str, started: std::time::Instant, result: &Result<T, E>) {
    let outcome = if result.is_ok() { "ok" } else { "error" };
    SANDBOX_OPERATIONS
        .with_label_values(&[operation, outcome])
        .inc();
    SANDBOX_OPERATION_DURATION
        .with_label_values(&[operation])
        .observe(started.elapsed().as_secs_f64());
}

/// Text exposition of every registered metric
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

async fn handle(request: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match request.uri().path() {
        "/metrics" => Response::builder()
            .header("Content-Type", "text/plain; version=0.0.4")
            .body(Full::new(Bytes::from(render()))),
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::new())),
    };
    Ok(response.unwrap_or_else(|_| Response::new(Full::new(Bytes::new()))))
}

/// Serves `GET /metrics` on `addr` until `token` is cancelled
pub async fn serve(addr: SocketAddr, token: CancellationToken) -> RunnerResult<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "metrics server listening");

    loop {
        let (stream, _) = tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => accepted?,
        };
        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service_fn(handle))
                .await
            {
                debug!(error = %e, "metrics connection ended with error");
            }
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_operations() {
        let started = std::time::Instant::now();
        let result: Result<(), ()> = Ok(());
        observe_operation("test_render", started, &result);

        let text = render();
        assert!(text.contains("chvisor_sandbox_operations_total"));
        assert!(text.contains("operation=\"test_render\""));
    }

    #[tokio::test]
    async fn test_serve_metrics() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);

        let token = CancellationToken::new();
        let server = tokio::spawn(serve(addr, token.clone()));
        let mut stream = loop {
            match tokio::net::TcpStream::connect(addr).await {
                Ok(stream) => break stream,
                Err(_) => tokio::time::sleep(std::time::Duration::from_millis(10)).await,
            }
        };
        STATS_DROPPED.inc();
        stream
            .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("chvisor_stats_dropped_total"));

        token.cancel();
        server.await.unwrap().unwrap();
    }
}

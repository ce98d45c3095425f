//! Connection observers and Prometheus exposition

use crate::error::Result;
use prometheus::{CounterVec, Encoder, GaugeVec, Opts, Registry, TextEncoder};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Notified when a client session starts and when it ends
pub trait ConnectionObserver: Send + Sync {
    fn opened(&self, client: IpAddr);
    fn closed(&self, client: IpAddr);
}

/// Observer that records nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl ConnectionObserver for NoopObserver {
    fn opened(&self, _client: IpAddr) {}
    fn closed(&self, _client: IpAddr) {}
}

/// Per-client connection metrics
#[derive(Clone)]
pub struct PrometheusObserver {
    /// Current number of active SOCKS5 connections
    pub connect_gauge: GaugeVec,

    /// Total number of SOCKS5 connections
    pub connect_counter: CounterVec,

    registry: Registry,
}

impl PrometheusObserver {
    /// Create new metrics instance with its own registry
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let connect_gauge = GaugeVec::new(
            Opts::new("connect_gauge", "Current number of active SOCKS5 connections"),
            &["host"],
        )?;

        let connect_counter = CounterVec::new(
            Opts::new("connect_counter", "Total number of SOCKS5 connections"),
            &["host"],
        )?;

        registry.register(Box::new(connect_gauge.clone()))?;
        registry.register(Box::new(connect_counter.clone()))?;

        Ok(Self {
            connect_gauge,
            connect_counter,
            registry,
        })
    }

    /// Export metrics in Prometheus format
    pub fn export(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer)
            .map_err(|e| crate::ProxyError::internal(format!("Failed to encode metrics: {}", e)))
    }
}

impl ConnectionObserver for PrometheusObserver {
    fn opened(&self, client: IpAddr) {
        let host = client.to_string();
        self.connect_gauge.with_label_values(&[host.as_str()]).inc();
        self.connect_counter.with_label_values(&[host.as_str()]).inc();
    }

    fn closed(&self, client: IpAddr) {
        let host = client.to_string();
        self.connect_gauge.with_label_values(&[host.as_str()]).dec();
    }
}

/// Bind the metrics listener
pub async fn bind_metrics_listener(bind_address: &str) -> Result<tokio::net::TcpListener> {
    let addr: SocketAddr = bind_address
        .parse()
        .map_err(|e| crate::ProxyError::config(format!("Invalid metrics address: {}", e)))?;

    tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| crate::ProxyError::Bind {
            address: addr.to_string(),
            source,
        })
}

/// Serve `observer`'s metrics over HTTP until `shutdown` fires
pub async fn start_metrics_server(
    observer: Arc<PrometheusObserver>,
    bind_address: &str,
    path: &str,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = bind_metrics_listener(bind_address).await?;
    serve_metrics_on(listener, observer, path, shutdown).await
}

/// Serve metrics on an already bound listener
pub async fn serve_metrics_on(
    listener: tokio::net::TcpListener,
    observer: Arc<PrometheusObserver>,
    path: &str,
    shutdown: CancellationToken,
) -> Result<()> {
    use axum::{routing::get, Router};

    let path = format!("/{}", path.trim_start_matches('/'));

    let app = Router::new().route(
        &path,
        get({
            let observer = observer.clone();
            move || serve_metrics(observer.clone())
        }),
    );

    info!("Starting metrics server on {}{}", listener.local_addr()?, path);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(|e| crate::ProxyError::internal(format!("Metrics server error: {}", e)))?;

    info!("Metrics server has gracefully shut down");
    Ok(())
}

async fn serve_metrics(observer: Arc<PrometheusObserver>) -> axum::response::Response {
    use axum::response::IntoResponse;
    use http::{header, StatusCode};

    match observer.export() {
        Ok(output) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            output,
        )
            .into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_per_client() {
        let metrics = PrometheusObserver::new().unwrap();
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();

        metrics.opened(a);
        metrics.opened(a);
        metrics.opened(b);
        metrics.closed(a);

        assert_eq!(metrics.connect_gauge.with_label_values(&["10.0.0.1"]).get(), 1.0);
        assert_eq!(metrics.connect_counter.with_label_values(&["10.0.0.1"]).get(), 2.0);
        assert_eq!(metrics.connect_gauge.with_label_values(&["10.0.0.2"]).get(), 1.0);

        let output = metrics.export().unwrap();
        assert!(output.contains("connect_gauge"));
        assert!(output.contains("connect_counter"));
        assert!(output.contains("host=\"10.0.0.2\""));
    }

    #[test]
    fn test_independent_registries() {
        // Each observer owns its registry, so several can coexist.
        assert!(PrometheusObserver::new().is_ok());
        assert!(PrometheusObserver::new().is_ok());
    }

    #[tokio::test]
    async fn test_metrics_server_stops_on_cancel() {
        let observer = Arc::new(PrometheusObserver::new().unwrap());
        let shutdown = CancellationToken::new();
        let server = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { start_metrics_server(observer, "127.0.0.1:0", "metrics", shutdown).await }
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        shutdown.cancel();
        let result = tokio::time::timeout(std::time::Duration::from_secs(5), server)
            .await
            .expect("metrics server did not stop")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_metrics_bind_conflict_is_an_error() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap().to_string();

        let result = bind_metrics_listener(&addr).await;
        assert!(matches!(result, Err(crate::ProxyError::Bind { .. })));

        let observer = Arc::new(PrometheusObserver::new().unwrap());
        let result = start_metrics_server(observer, &addr, "metrics", CancellationToken::new()).await;
        assert!(matches!(result, Err(crate::ProxyError::Bind { .. })));
    }
}

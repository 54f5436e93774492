//! Prometheus metrics (Rust `prometheus` crate).
//!
//! One `MetricsContext` is intended per process. The player binary owns its
//! registry and controls which metrics it reports.

use anyhow::Result;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, Opts, Registry, TextEncoder,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Configuration for the built-in Prometheus scrape endpoint.
#[derive(Debug, Clone)]
pub struct MetricsServerConfig {
    // ---
    /// Address to bind, e.g. `127.0.0.1:9100`.
    pub bind: SocketAddr,
}

impl MetricsServerConfig {
    // ---
    pub fn new(bind: SocketAddr) -> Self {
        // ---
        Self { bind }
    }
}

/// Prometheus metrics registry + handles.
///
/// This is a thin, explicit wrapper around the `prometheus` crate so hot-path
/// instrumentation is just counter increments / histogram observations.
#[derive(Clone)]
pub struct MetricsContext {
    // ---
    registry: Registry,

    // Stream ingest counters
    pub chunks_received_total: IntCounter,
    pub bytes_received_total: IntCounter,
    pub granule_pages_total: IntCounter,
    pub metadata_pages_total: IntCounter,

    // Playback counters
    pub blocks_scheduled_total: IntCounter,
    pub scheduler_underruns_total: IntCounter,

    // Reconnection counters
    pub stream_reconnects_total: IntCounter,
    pub control_reconnects_total: IntCounter,
    pub gave_up_total: IntCounter,

    // Latency histograms (seconds)
    pub decode_seconds: Histogram,
    pub schedule_lead_seconds: Histogram,
}

impl MetricsContext {
    // ---
    /// Create a new registry and register the standard metrics.
    ///
    /// `process_name` is applied as a constant label (`process=<name>`).
    pub fn new(process_name: &str) -> Result<Self> {
        // ---
        let registry = Registry::new_custom(
            Some("opus_live_player".into()),
            Some(prometheus::labels! { "process".to_string() => process_name.to_string() }),
        )?;

        let chunks_received_total = IntCounter::with_opts(Opts::new(
            "stream_chunks_received_total",
            "Total media stream chunks received",
        ))?;
        let bytes_received_total = IntCounter::with_opts(Opts::new(
            "stream_bytes_received_total",
            "Total media stream bytes received",
        ))?;
        let granule_pages_total = IntCounter::with_opts(Opts::new(
            "ogg_granule_pages_total",
            "Total chunks from which a granule position was recovered",
        ))?;
        let metadata_pages_total = IntCounter::with_opts(Opts::new(
            "ogg_metadata_pages_total",
            "Total header/tags pages excluded from timing",
        ))?;

        let blocks_scheduled_total = IntCounter::with_opts(Opts::new(
            "audio_blocks_scheduled_total",
            "Total decoded PCM blocks scheduled for playback",
        ))?;
        let scheduler_underruns_total = IntCounter::with_opts(Opts::new(
            "scheduler_underruns_total",
            "Times the scheduling cursor fell behind the device clock",
        ))?;

        let stream_reconnects_total = IntCounter::with_opts(Opts::new(
            "stream_reconnect_attempts_total",
            "Media stream reconnection attempts",
        ))?;
        let control_reconnects_total = IntCounter::with_opts(Opts::new(
            "control_reconnect_attempts_total",
            "Control channel reconnection attempts",
        ))?;
        let gave_up_total = IntCounter::with_opts(Opts::new(
            "reconnect_budget_exhausted_total",
            "Times a connection exhausted its retry budget",
        ))?;

        let decode_seconds = Histogram::with_opts(HistogramOpts::new(
            "chunk_decode_seconds",
            "Per-chunk Opus decode duration in seconds",
        ))?;
        let schedule_lead_seconds = Histogram::with_opts(HistogramOpts::new(
            "schedule_lead_seconds",
            "How far ahead of the device clock blocks are scheduled (seconds)",
        ))?;

        // Register all metrics
        registry.register(Box::new(chunks_received_total.clone()))?;
        registry.register(Box::new(bytes_received_total.clone()))?;
        registry.register(Box::new(granule_pages_total.clone()))?;
        registry.register(Box::new(metadata_pages_total.clone()))?;
        registry.register(Box::new(blocks_scheduled_total.clone()))?;
        registry.register(Box::new(scheduler_underruns_total.clone()))?;
        registry.register(Box::new(stream_reconnects_total.clone()))?;
        registry.register(Box::new(control_reconnects_total.clone()))?;
        registry.register(Box::new(gave_up_total.clone()))?;
        registry.register(Box::new(decode_seconds.clone()))?;
        registry.register(Box::new(schedule_lead_seconds.clone()))?;

        Ok(Self {
            registry,
            chunks_received_total,
            bytes_received_total,
            granule_pages_total,
            metadata_pages_total,
            blocks_scheduled_total,
            scheduler_underruns_total,
            stream_reconnects_total,
            control_reconnects_total,
            gave_up_total,
            decode_seconds,
            schedule_lead_seconds,
        })
    }

    /// Gather metric families from this registry.
    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        // ---
        self.registry.gather()
    }

    /// Spawns a minimal HTTP server that serves `GET /metrics`.
    ///
    /// This is intentionally explicit (callers decide whether to run it).
    pub fn spawn_metrics_server(&self, cfg: MetricsServerConfig) -> JoinHandle<Result<()>> {
        // ---
        let registry = Arc::new(self.registry.clone());
        tokio::spawn(async move {
            // ---
            let make_svc = make_service_fn(move |_conn| {
                let registry = Arc::clone(&registry);
                async move {
                    Ok::<_, hyper::Error>(service_fn(move |req| {
                        let registry = Arc::clone(&registry);
                        async move { handle_metrics_request(req, registry).await }
                    }))
                }
            });

            let server = Server::bind(&cfg.bind).serve(make_svc);
            server.await.map_err(|e| anyhow::anyhow!(e))?;
            Ok(())
        })
    }
}

async fn handle_metrics_request(
    req: Request<Body>,
    registry: Arc<Registry>,
) -> Result<Response<Body>, hyper::Error> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let encoder = TextEncoder::new();
            let metric_families = registry.gather();
            let mut buffer = Vec::new();

            if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
                let mut resp = Response::new(Body::from(format!("encode error: {e}")));
                *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                return Ok(resp);
            }

            let mut resp = Response::new(Body::from(buffer));
            resp.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            Ok(resp)
        }
        _ => {
            let mut resp = Response::new(Body::from("not found"));
            *resp.status_mut() = StatusCode::NOT_FOUND;
            Ok(resp)
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn metrics_context_gathers_something() {
        // ---
        let ctx = MetricsContext::new("test").expect("MetricsContext should init");
        let families = ctx.gather();
        assert!(!families.is_empty());
    }

    #[test]
    fn counters_start_at_zero() {
        // ---
        let ctx = MetricsContext::new("test").expect("MetricsContext should init");
        assert_eq!(ctx.chunks_received_total.get(), 0);
        assert_eq!(ctx.scheduler_underruns_total.get(), 0);
        assert_eq!(ctx.gave_up_total.get(), 0);
    }
}

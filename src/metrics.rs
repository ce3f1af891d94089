use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use prometheus::{
    Encoder, Gauge, Histogram, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::env;
use std::sync::{Arc, Mutex};
use tracing::{error, info};

lazy_static::lazy_static! {
    pub static ref METRIC_NAMESPACE: String =
        env::var("METRIC_NAMESPACE").unwrap_or_else(|_| "rust_apisweep".to_string());

    // === Request Metrics ===

    pub static ref REQUEST_TOTAL: IntCounter =
        IntCounter::with_opts(
            Opts::new("requests_total", "Total number of request outcomes recorded")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref ATTEMPTS_TOTAL: IntCounter =
        IntCounter::with_opts(
            Opts::new("attempts_total", "Total number of HTTP attempts, including retries")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref REQUEST_STATUS_CODES: IntCounterVec =
        IntCounterVec::new(
            Opts::new("requests_status_codes_total", "Number of HTTP attempts by status code")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["status_code"]
        ).unwrap();

    pub static ref REQUEST_FAILURES: IntCounterVec =
        IntCounterVec::new(
            Opts::new("request_failures_total", "Failed request outcomes by error kind")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["error_kind"]
        ).unwrap();

    pub static ref CONCURRENT_REQUESTS: Gauge =
        Gauge::with_opts(
            Opts::new("concurrent_requests", "Number of HTTP requests currently in flight")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref REQUEST_DURATION_SECONDS: Histogram =
        Histogram::with_opts(
            prometheus::HistogramOpts::new(
                "request_duration_seconds",
                "HTTP attempt latencies in seconds."
            ).namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref TOKENS_TOTAL: IntCounter =
        IntCounter::with_opts(
            Opts::new("tokens_total", "Tokens reported by successful responses")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    // === Sweep Metrics ===

    pub static ref CURRENT_CONCURRENCY_LEVEL: IntGauge =
        IntGauge::with_opts(
            Opts::new("concurrency_level", "Concurrency level currently being measured")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    // === Network Probe Metrics ===

    pub static ref PROBE_SAMPLES_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("probe_samples_total", "Network probe samples by reachability")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["reachable"]  // true, false
        ).unwrap();

    pub static ref PROBE_RTT_SECONDS: Histogram =
        Histogram::with_opts(
            prometheus::HistogramOpts::new(
                "probe_rtt_seconds",
                "Round-trip time of successful network probes in seconds."
            ).namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();
}

/// Registers all metrics with the default Prometheus registry.
pub fn register_metrics() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let registry = prometheus::default_registry();

    registry.register(Box::new(REQUEST_TOTAL.clone()))?;
    registry.register(Box::new(ATTEMPTS_TOTAL.clone()))?;
    registry.register(Box::new(REQUEST_STATUS_CODES.clone()))?;
    registry.register(Box::new(REQUEST_FAILURES.clone()))?;
    registry.register(Box::new(CONCURRENT_REQUESTS.clone()))?;
    registry.register(Box::new(REQUEST_DURATION_SECONDS.clone()))?;
    registry.register(Box::new(TOKENS_TOTAL.clone()))?;
    registry.register(Box::new(CURRENT_CONCURRENCY_LEVEL.clone()))?;
    registry.register(Box::new(PROBE_SAMPLES_TOTAL.clone()))?;
    registry.register(Box::new(PROBE_RTT_SECONDS.clone()))?;

    Ok(())
}

fn encode_registry(registry: &Mutex<Registry>) -> Result<(Vec<u8>, String), prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = registry.lock().unwrap().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok((buffer, encoder.format_type().to_string()))
}

/// HTTP handler for the Prometheus metrics endpoint.
pub async fn metrics_handler(
    _req: Request<Body>,
    registry: Arc<Mutex<Registry>>,
) -> Result<Response<Body>, hyper::Error> {
    let response = match encode_registry(&registry) {
        Ok((buffer, content_type)) => {
            let mut response = Response::new(Body::from(buffer));
            if let Ok(value) = content_type.parse() {
                response.headers_mut().insert("Content-Type", value);
            }
            response
        }
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            let mut response = Response::new(Body::from("metrics encoding failed"));
            *response.status_mut() = hyper::StatusCode::INTERNAL_SERVER_ERROR;
            response
        }
    };

    Ok(response)
}

/// Starts the Prometheus metrics HTTP server.
pub async fn start_metrics_server(port: u16, registry: Arc<Mutex<Registry>>) {
    let addr = ([0, 0, 0, 0], port).into();

    let make_svc = make_service_fn(move |_conn| {
        let registry_clone = registry.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |req| {
                let registry_clone_inner = registry_clone.clone();
                async move { metrics_handler(req, registry_clone_inner).await }
            }))
        }
    });

    let server = match Server::try_bind(&addr) {
        Ok(builder) => builder.serve(make_svc),
        Err(e) => {
            error!(port = port, error = %e, "Failed to bind metrics server");
            return;
        }
    };
    info!(
        port = port,
        addr = %addr,
        "Metrics server listening"
    );

    if let Err(e) = server.await {
        error!(error = %e, "Metrics server error");
    }
}

/// Gathers and encodes metrics as a string for final output.
pub fn gather_metrics_string(registry: &Arc<Mutex<Registry>>) -> String {
    match encode_registry(registry) {
        Ok((buffer, _)) => String::from_utf8(buffer)
            .unwrap_or_else(|_| String::from("# ERROR ENCODING METRICS TO UTF-8")),
        Err(e) => format!("# ERROR ENCODING METRICS: {}", e),
    }
}

/// Prometheus metrics for the router and the monitor
///
/// All series live in one registry owned by [`GatewayMetrics`], which is
/// built once at startup and handed to each component.
use async_trait::async_trait;
use http::{header, HeaderValue, Response, StatusCode};
use pingora::apps::http_app::ServeHttp;
use pingora::protocols::http::ServerSession;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

/// Metric handles shared by the gateway components
pub struct GatewayMetrics {
    registry: Registry,
    requests_total: IntCounterVec,
    requests_routed_total: IntCounterVec,
    pre_routing_delay_ms: HistogramVec,
    post_routing_delay_ms: HistogramVec,
    responses_total: IntCounterVec,
    durations_ms: HistogramVec,
    routing_failures_total: IntCounterVec,
    monitor_executions_total: IntCounter,
    monitor_last_run_at: IntGauge,
    monitor_execution_seconds: HistogramVec,
    monitor_backend_load: IntGaugeVec,
}

impl GatewayMetrics {
    /// Register every series with a constant `env` label
    pub fn new(env: &str) -> Result<Self, prometheus::Error> {
        let labels = HashMap::from([("env".to_string(), env.to_string())]);
        let registry = Registry::new_custom(None, Some(labels))?;

        let requests_total = IntCounterVec::new(
            Opts::new(
                "trino_gateway_router_http_requests_total",
                "Number of HTTP requests received from clients.",
            ),
            &["method", "port"],
        )?;
        let requests_routed_total = IntCounterVec::new(
            Opts::new(
                "trino_gateway_router_http_requests_routed_total",
                "Number of HTTP requests routed to a trino server.",
            ),
            &["method", "port", "group", "backend"],
        )?;
        let pre_routing_delay_ms = HistogramVec::new(
            HistogramOpts::new(
                "trino_gateway_router_http_pre_routing_delay_ms_histogram",
                "Delay in routing client request to a Trino server.",
            )
            .buckets(vec![
                5.0, 10.0, 15.0, 20.0, 30.0, 40.0, 60.0, 100.0, 150.0, 500.0,
            ]),
            &["method"],
        )?;
        let post_routing_delay_ms = HistogramVec::new(
            HistogramOpts::new(
                "trino_gateway_router_http_post_routing_delay_ms_histogram",
                "Delay in sending the response to the client after the Trino server answered.",
            )
            .buckets(vec![
                2.0, 5.0, 10.0, 15.0, 20.0, 25.0, 30.0, 40.0, 50.0, 100.0, 500.0,
            ]),
            &["method", "code"],
        )?;
        let responses_total = IntCounterVec::new(
            Opts::new(
                "trino_gateway_router_http_responses_total",
                "Number of HTTP responses sent back to client.",
            ),
            &["method", "code"],
        )?;
        let durations_ms = HistogramVec::new(
            HistogramOpts::new(
                "trino_gateway_router_http_durations_ms_histogram",
                "Router HTTP latency distribution for responses sent to clients.",
            )
            .buckets(vec![
                20.0, 40.0, 60.0, 90.0, 120.0, 150.0, 200.0, 250.0, 300.0, 500.0,
            ]),
            &["method", "code"],
        )?;
        let routing_failures_total = IntCounterVec::new(
            Opts::new(
                "trino_gateway_router_routing_failures_total",
                "Number of requests that failed, by pipeline phase.",
            ),
            &["phase"],
        )?;
        let monitor_executions_total = IntCounter::with_opts(Opts::new(
            "trino_gateway_monitor_executions_total",
            "Number of executions triggered for monitor task.",
        ))?;
        let monitor_last_run_at = IntGauge::with_opts(Opts::new(
            "trino_gateway_monitor_execution_last_run_at",
            "Monitor task last run epoch ts.",
        ))?;
        let monitor_execution_seconds = HistogramVec::new(
            HistogramOpts::new(
                "trino_gateway_monitor_execution_seconds_histogram",
                "Monitor task execution time distribution.",
            )
            .buckets(vec![
                5.0, 15.0, 30.0, 60.0, 90.0, 120.0, 150.0, 180.0, 210.0, 240.0,
            ]),
            &[],
        )?;
        let monitor_backend_load = IntGaugeVec::new(
            Opts::new(
                "trino_gateway_monitor_backend_load",
                "Backend load computed by the last run of the monitor task.",
            ),
            &["backend"],
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(requests_routed_total.clone()))?;
        registry.register(Box::new(pre_routing_delay_ms.clone()))?;
        registry.register(Box::new(post_routing_delay_ms.clone()))?;
        registry.register(Box::new(responses_total.clone()))?;
        registry.register(Box::new(durations_ms.clone()))?;
        registry.register(Box::new(routing_failures_total.clone()))?;
        registry.register(Box::new(monitor_executions_total.clone()))?;
        registry.register(Box::new(monitor_last_run_at.clone()))?;
        registry.register(Box::new(monitor_execution_seconds.clone()))?;
        registry.register(Box::new(monitor_backend_load.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            requests_routed_total,
            pre_routing_delay_ms,
            post_routing_delay_ms,
            responses_total,
            durations_ms,
            routing_failures_total,
            monitor_executions_total,
            monitor_last_run_at,
            monitor_execution_seconds,
            monitor_backend_load,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_request(&self, method: &str, port: u16) {
        self.requests_total
            .with_label_values(&[method, &port.to_string()])
            .inc();
    }

    pub fn record_routed(&self, method: &str, port: u16, group: &str, backend: &str) {
        self.requests_routed_total
            .with_label_values(&[method, &port.to_string(), group, backend])
            .inc();
    }

    pub fn observe_pre_routing(&self, method: &str, delay: Duration) {
        self.pre_routing_delay_ms
            .with_label_values(&[method])
            .observe(millis(delay));
    }

    pub fn observe_post_routing(&self, method: &str, code: u16, delay: Duration) {
        self.post_routing_delay_ms
            .with_label_values(&[method, &code.to_string()])
            .observe(millis(delay));
    }

    /// Count a response sent to the client and its total latency
    pub fn record_response(&self, method: &str, code: u16, duration: Duration) {
        let code = code.to_string();
        self.responses_total
            .with_label_values(&[method, &code])
            .inc();
        self.durations_ms
            .with_label_values(&[method, &code])
            .observe(millis(duration));
    }

    pub fn record_routing_failure(&self, phase: &str) {
        self.routing_failures_total.with_label_values(&[phase]).inc();
    }

    /// Record a finished monitor run
    pub fn record_monitor_run(&self, duration: Duration, finished_at: i64) {
        self.monitor_executions_total.inc();
        self.monitor_last_run_at.set(finished_at);
        self.monitor_execution_seconds
            .with_label_values(&[])
            .observe(duration.as_secs_f64());
    }

    pub fn set_backend_load(&self, backend: &str, load: i32) {
        self.monitor_backend_load
            .with_label_values(&[backend])
            .set(i64::from(load));
    }

    /// Text exposition of the registry
    pub fn render(&self) -> Result<Vec<u8>, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

/// HTTP app serving the registry
pub struct MetricsApp {
    metrics: Arc<GatewayMetrics>,
}

impl MetricsApp {
    pub fn new(metrics: Arc<GatewayMetrics>) -> Self {
        Self { metrics }
    }

    fn exposition(&self) -> Response<Vec<u8>> {
        match self.metrics.render() {
            Ok(body) => {
                let mut response = Response::new(body);
                response.headers_mut().insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("text/plain; version=0.0.4"),
                );
                response
            }
            Err(e) => {
                error!(error = %e, "Unable to encode metrics");
                let mut response = Response::new(Vec::new());
                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                response
            }
        }
    }
}

#[async_trait]
impl ServeHttp for MetricsApp {
    async fn response(&self, _http_session: &mut ServerSession) -> Response<Vec<u8>> {
        self.exposition()
    }
}

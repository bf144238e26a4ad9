use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder,
};

/// Ingest counters, owned by `main` and handed to each component.
pub struct Metrics {
    registry: Registry,
    pub connections_total: IntCounter,
    pub accept_errors_total: IntCounter,
    pub active_connections: IntGauge,
    pub requests_total: IntCounter,
    pub invalid_requests_total: IntCounter,
    pub readings_stored_total: IntCounter,
    pub db_failures_total: IntCounter,
    pub send_failures_total: IntCounter,
    pub receive_timeouts_total: IntCounter,
    pub persist_latency_seconds: Histogram,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let connections_total = IntCounter::with_opts(Opts::new(
            "ingestor_connections_total",
            "Total connections accepted",
        ))?;
        let accept_errors_total = IntCounter::with_opts(Opts::new(
            "ingestor_accept_errors_total",
            "Total errors returned by accept",
        ))?;
        let active_connections = IntGauge::with_opts(Opts::new(
            "ingestor_active_connections",
            "Connections currently being handled",
        ))?;
        let requests_total = IntCounter::with_opts(Opts::new(
            "ingestor_requests_total",
            "Total non-empty requests received",
        ))?;
        let invalid_requests_total = IntCounter::with_opts(Opts::new(
            "ingestor_invalid_requests_total",
            "Total requests rejected by the decoder",
        ))?;
        let readings_stored_total = IntCounter::with_opts(Opts::new(
            "ingestor_readings_stored_total",
            "Total readings persisted",
        ))?;
        let db_failures_total = IntCounter::with_opts(Opts::new(
            "ingestor_db_failures_total",
            "Total failed persist operations",
        ))?;
        let send_failures_total = IntCounter::with_opts(Opts::new(
            "ingestor_send_failures_total",
            "Total acknowledgements that could not be delivered",
        ))?;
        let receive_timeouts_total = IntCounter::with_opts(Opts::new(
            "ingestor_receive_timeouts_total",
            "Total connections closed because no data arrived in time",
        ))?;
        let persist_latency_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "ingestor_persist_latency_seconds",
                "Time taken to persist one reading",
            )
            .buckets(vec![
                0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5,
            ]),
        )?;

        registry.register(Box::new(connections_total.clone()))?;
        registry.register(Box::new(accept_errors_total.clone()))?;
        registry.register(Box::new(active_connections.clone()))?;
        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(invalid_requests_total.clone()))?;
        registry.register(Box::new(readings_stored_total.clone()))?;
        registry.register(Box::new(db_failures_total.clone()))?;
        registry.register(Box::new(send_failures_total.clone()))?;
        registry.register(Box::new(receive_timeouts_total.clone()))?;
        registry.register(Box::new(persist_latency_seconds.clone()))?;

        Ok(Self {
            registry,
            connections_total,
            accept_errors_total,
            active_connections,
            requests_total,
            invalid_requests_total,
            readings_stored_total,
            db_failures_total,
            send_failures_total,
            receive_timeouts_total,
            persist_latency_seconds,
        })
    }

    /// Prometheus text exposition of every registered metric.
    pub fn gather(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

use crate::snapshot::MetricSnapshot;
use prometheus::core::Collector;
use prometheus::{opts, Counter, CounterVec, Encoder, Gauge, GaugeVec, Registry, TextEncoder};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub agent_connected: Gauge,
    pub agent_reports_sent_total: Counter,
    pub agent_report_bytes_total: Counter,
    pub agent_send_failures_total: Counter,
    pub agent_encode_failures_total: Counter,
    pub agent_reconnects_total: CounterVec,
    pub agent_collect_errors_total: CounterVec,
    pub agent_gather_duration_seconds: Gauge,
    pub agent_last_report_timestamp_seconds: Gauge,
    pub agent_cpu_usage_percent: Gauge,
    pub agent_memory_used_bytes: Gauge,
    pub agent_probe_loss_percent: GaugeVec,
    pub agent_probe_latency_ms: GaugeVec,
    pub agent_scrape_count_total: Counter,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let agent_connected = Gauge::with_opts(opts!(
            "agent_connected",
            "1 while a collector session is established"
        ))?;
        let agent_reports_sent_total = Counter::with_opts(opts!(
            "agent_reports_sent_total",
            "Report frames written to the collector"
        ))?;
        let agent_report_bytes_total = Counter::with_opts(opts!(
            "agent_report_bytes_total",
            "Bytes of report frames written to the collector"
        ))?;
        let agent_send_failures_total = Counter::with_opts(opts!(
            "agent_send_failures_total",
            "Report writes that failed and triggered a reconnect"
        ))?;
        let agent_encode_failures_total = Counter::with_opts(opts!(
            "agent_encode_failures_total",
            "Cycles skipped because the snapshot could not be encoded"
        ))?;
        let agent_reconnects_total = CounterVec::new(
            opts!("agent_reconnects_total", "Reconnect attempts by result"),
            &["result"],
        )?;
        let agent_collect_errors_total = CounterVec::new(
            opts!(
                "agent_collect_errors_total",
                "Metric provider failures by provider"
            ),
            &["provider"],
        )?;
        let agent_gather_duration_seconds = Gauge::with_opts(opts!(
            "agent_gather_duration_seconds",
            "Duration of the last snapshot gather"
        ))?;
        let agent_last_report_timestamp_seconds = Gauge::with_opts(opts!(
            "agent_last_report_timestamp_seconds",
            "Unix timestamp of the last successful report"
        ))?;
        let agent_cpu_usage_percent = Gauge::with_opts(opts!(
            "agent_cpu_usage_percent",
            "CPU usage in the last report (0..100)"
        ))?;
        let agent_memory_used_bytes = Gauge::with_opts(opts!(
            "agent_memory_used_bytes",
            "Used memory in the last report"
        ))?;
        let agent_probe_loss_percent = GaugeVec::new(
            opts!(
                "agent_probe_loss_percent",
                "Packet loss per probe target in the last report"
            ),
            &["target"],
        )?;
        let agent_probe_latency_ms = GaugeVec::new(
            opts!(
                "agent_probe_latency_ms",
                "Average probe latency per target in the last report, -1 if unreachable"
            ),
            &["target"],
        )?;
        let agent_scrape_count_total = Counter::with_opts(opts!(
            "agent_scrape_count_total",
            "Scrapes of the /metrics endpoint"
        ))?;

        register(&registry, &agent_connected)?;
        register(&registry, &agent_reports_sent_total)?;
        register(&registry, &agent_report_bytes_total)?;
        register(&registry, &agent_send_failures_total)?;
        register(&registry, &agent_encode_failures_total)?;
        register(&registry, &agent_reconnects_total)?;
        register(&registry, &agent_collect_errors_total)?;
        register(&registry, &agent_gather_duration_seconds)?;
        register(&registry, &agent_last_report_timestamp_seconds)?;
        register(&registry, &agent_cpu_usage_percent)?;
        register(&registry, &agent_memory_used_bytes)?;
        register(&registry, &agent_probe_loss_percent)?;
        register(&registry, &agent_probe_latency_ms)?;
        register(&registry, &agent_scrape_count_total)?;

        Ok(Arc::new(Self {
            registry,
            agent_connected,
            agent_reports_sent_total,
            agent_report_bytes_total,
            agent_send_failures_total,
            agent_encode_failures_total,
            agent_reconnects_total,
            agent_collect_errors_total,
            agent_gather_duration_seconds,
            agent_last_report_timestamp_seconds,
            agent_cpu_usage_percent,
            agent_memory_used_bytes,
            agent_probe_loss_percent,
            agent_probe_latency_ms,
            agent_scrape_count_total,
        }))
    }

    pub fn record_report(&self, snapshot: &MetricSnapshot, probe_targets: &[String], bytes: usize) {
        self.agent_reports_sent_total.inc();
        self.agent_report_bytes_total.inc_by(bytes as f64);
        self.agent_last_report_timestamp_seconds
            .set(now_unix() as f64);
        self.agent_cpu_usage_percent.set(snapshot.cpu);
        self.agent_memory_used_bytes
            .set(snapshot.memory_used as f64);

        self.agent_probe_loss_percent.reset();
        self.agent_probe_latency_ms.reset();
        for target in probe_targets {
            if let Some(loss) = snapshot.probe_loss(target) {
                self.agent_probe_loss_percent
                    .with_label_values(&[target.as_str()])
                    .set(loss);
            }
            if let Some(latency) = snapshot.probe_latency(target) {
                self.agent_probe_latency_ms
                    .with_label_values(&[target.as_str()])
                    .set(latency);
            }
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.agent_connected.set(if connected { 1.0 } else { 0.0 });
    }

    pub fn inc_reconnect(&self, result: &str) {
        self.agent_reconnects_total
            .with_label_values(&[result])
            .inc();
    }

    pub fn inc_scrape_count(&self) {
        self.agent_scrape_count_total.inc();
    }

    pub fn inc_collect_error(&self, provider: &str) {
        self.agent_collect_errors_total
            .with_label_values(&[provider])
            .inc();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

use crate::config::{ProbeTargetConfig, ProtocolFamily};
use crate::snapshot::UNREACHABLE_LATENCY_MS;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::{watch, RwLock};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct ProbeHistory {
    samples: Vec<Option<Duration>>,
    next: usize,
    capacity: usize,
}

impl ProbeHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: Vec::with_capacity(capacity),
            next: 0,
            capacity,
        }
    }

    pub fn push(&mut self, sample: Option<Duration>) {
        if self.samples.len() < self.capacity {
            self.samples.push(sample);
        } else {
            self.samples[self.next] = sample;
        }
        self.next = (self.next + 1) % self.capacity;
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn loss_percent(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let lost = self.samples.iter().filter(|s| s.is_none()).count();
        lost as f64 / self.len() as f64 * 100.0
    }

    pub fn average_latency_ms(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let answered: Vec<Duration> = self.samples.iter().flatten().copied().collect();
        if answered.is_empty() {
            return UNREACHABLE_LATENCY_MS;
        }
        let total: Duration = answered.iter().sum();
        total.as_secs_f64() * 1000.0 / answered.len() as f64
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeReading {
    pub target: String,
    pub loss_percent: f64,
    pub latency_ms: f64,
}

/// The configured probe targets and their rolling histories. Each target's
/// probe loop is the only writer of its entry.
#[derive(Clone)]
pub struct ProbeSet {
    targets: Arc<Vec<ProbeTargetConfig>>,
    histories: Arc<RwLock<HashMap<String, ProbeHistory>>>,
}

impl ProbeSet {
    pub fn new(targets: Vec<ProbeTargetConfig>, history_len: usize) -> Self {
        let histories = targets
            .iter()
            .map(|t| (t.name.clone(), ProbeHistory::new(history_len)))
            .collect();
        Self {
            targets: Arc::new(targets),
            histories: Arc::new(RwLock::new(histories)),
        }
    }

    pub fn targets(&self) -> &[ProbeTargetConfig] {
        &self.targets
    }

    pub async fn record(&self, target: &str, sample: Option<Duration>) {
        let mut guard = self.histories.write().await;
        if let Some(history) = guard.get_mut(target) {
            history.push(sample);
        }
    }

    pub async fn readings(&self) -> Vec<ProbeReading> {
        let guard = self.histories.read().await;
        self.targets
            .iter()
            .map(|t| {
                let (loss_percent, latency_ms) = guard
                    .get(&t.name)
                    .map(|h| (h.loss_percent(), h.average_latency_ms()))
                    .unwrap_or((0.0, 0.0));
                ProbeReading {
                    target: t.name.clone(),
                    loss_percent,
                    latency_ms,
                }
            })
            .collect()
    }
}

pub trait Prober: Send + Sync + 'static {
    fn probe(
        &self,
        target: &ProbeTargetConfig,
    ) -> impl std::future::Future<Output = Option<Duration>> + Send;
}

#[derive(Debug, Clone)]
pub struct TcpProber {
    pub timeout: Duration,
    pub family: ProtocolFamily,
}

impl Prober for TcpProber {
    async fn probe(&self, target: &ProbeTargetConfig) -> Option<Duration> {
        let addr = match time::timeout(self.timeout, resolve(&target.host, target.port, self.family)).await {
            Ok(Some(addr)) => addr,
            Ok(None) | Err(_) => {
                debug!(target = %target.name, host = %target.host, "probe target did not resolve");
                return None;
            }
        };

        // Only the connect is timed; resolution is excluded from latency.
        let start = Instant::now();
        match time::timeout(self.timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_stream)) => Some(start.elapsed()),
            Ok(Err(err)) => {
                debug!(target = %target.name, %addr, error = %err, "probe failed");
                None
            }
            Err(_elapsed) => {
                debug!(target = %target.name, host = %target.host, "probe timeout");
                None
            }
        }
    }
}

async fn resolve(host: &str, port: u16, family: ProtocolFamily) -> Option<SocketAddr> {
    let addrs: Vec<SocketAddr> = lookup_host((host, port)).await.ok()?.collect();
    addrs
        .iter()
        .find(|a| family.matches(a))
        .or_else(|| addrs.first())
        .copied()
}

pub async fn run_probe_loop<P: Prober>(
    set: ProbeSet,
    target: ProbeTargetConfig,
    prober: Arc<P>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!(target = %target.name, "probe loop stopped");
                break;
            }
            _ = ticker.tick() => {
                let sample = prober.probe(&target).await;
                set.record(&target.name, sample).await;
            }
        }
    }
}

pub mod probe;
pub mod rate;
pub mod system;

use crate::metrics::Metrics;
use crate::snapshot::MetricSnapshot;
use probe::ProbeSet;
use rate::{ByteRate, RateMeter};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("not supported on this platform")]
    Unsupported,
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse {what}: {detail}")]
    Parse { what: &'static str, detail: String },
    #[error("{0} unavailable")]
    Unavailable(&'static str),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub used: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ByteCounters {
    pub inbound: u64,
    pub outbound: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LoadAverage {
    pub one: f64,
    pub five: f64,
    pub fifteen: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskCounts {
    pub processes: u64,
    pub threads: u64,
}

pub trait MetricsSource: Send + Sync + 'static {
    fn uptime_secs(&self) -> Result<u64, ProviderError>;
    fn cpu_percent(&self) -> Result<f64, ProviderError>;
    fn memory(&self) -> Result<Usage, ProviderError>;
    fn swap(&self) -> Result<Usage, ProviderError>;
    fn disk(&self) -> Result<Usage, ProviderError>;
    fn network_counters(&self) -> Result<ByteCounters, ProviderError>;
    fn disk_io_counters(&self) -> Result<ByteCounters, ProviderError>;
    fn load_average(&self) -> Result<LoadAverage, ProviderError>;
    fn task_counts(&self) -> Result<TaskCounts, ProviderError>;
    fn user_sessions(&self) -> Result<u64, ProviderError>;
}

pub struct Collector {
    source: Arc<dyn MetricsSource>,
    probes: ProbeSet,
    disk_io: watch::Receiver<ByteRate>,
    network_rate: RateMeter,
    metrics: Arc<Metrics>,
}

impl Collector {
    pub fn new(
        source: Arc<dyn MetricsSource>,
        probes: ProbeSet,
        disk_io: watch::Receiver<ByteRate>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            source,
            probes,
            disk_io,
            network_rate: RateMeter::new(),
            metrics,
        }
    }

    pub async fn gather(&mut self) -> MetricSnapshot {
        let now = Instant::now();

        let (uptime, cpu, memory, swap, disk, network, tasks, users, load, probes) = tokio::join!(
            self.provide("uptime", |s| s.uptime_secs()),
            self.provide("cpu", |s| s.cpu_percent()),
            self.provide("memory", |s| s.memory()),
            self.provide("swap", |s| s.swap()),
            self.provide("disk", |s| s.disk()),
            self.provide("network", |s| s.network_counters().map(Some)),
            self.provide("tasks", |s| s.task_counts()),
            self.provide("users", |s| s.user_sessions()),
            self.provide("load", |s| s.load_average()),
            self.probes.readings(),
        );

        let network_rate = match network {
            Some(counters) => self.network_rate.observe(counters, now),
            None => ByteRate::default(),
        };
        let network = network.unwrap_or_default();
        let disk_io = *self.disk_io.borrow();

        let mut snapshot = MetricSnapshot {
            uptime,
            cpu,
            memory_used: memory.used,
            memory_total: memory.total,
            swap_used: swap.used,
            swap_total: swap.total,
            hdd_used: disk.used,
            hdd_total: disk.total,
            network_in: network.inbound,
            network_out: network.outbound,
            network_rx: network_rate.inbound_per_sec,
            network_tx: network_rate.outbound_per_sec,
            io_read: disk_io.inbound_per_sec,
            io_write: disk_io.outbound_per_sec,
            load_1: load.one,
            load_5: load.five,
            load_15: load.fifteen,
            process: tasks.processes,
            thread: tasks.threads,
            users,
            ip_status: true,
            ..MetricSnapshot::default()
        };
        for reading in probes {
            snapshot.set_probe(&reading.target, reading.loss_percent, reading.latency_ms);
        }
        snapshot
    }

    pub fn probe_targets(&self) -> Vec<String> {
        self.probes.targets().iter().map(|t| t.name.clone()).collect()
    }

    pub fn reset_rates(&mut self) {
        self.network_rate.reset();
    }

    async fn provide<T, F>(&self, provider: &'static str, call: F) -> T
    where
        T: Default + Send + 'static,
        F: FnOnce(&dyn MetricsSource) -> Result<T, ProviderError> + Send + 'static,
    {
        let source = self.source.clone();
        match tokio::task::spawn_blocking(move || call(source.as_ref())).await {
            Ok(Ok(value)) => value,
            Ok(Err(err)) => {
                warn!(provider, error = %err, "metric provider failed");
                self.metrics.inc_collect_error(provider);
                T::default()
            }
            Err(err) => {
                warn!(provider, error = %err, "metric provider task aborted");
                self.metrics.inc_collect_error(provider);
                T::default()
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    /// Provider set with fixed values; named providers fail, `panic` ones panic.
    pub(crate) struct FakeSource {
        pub failing: HashSet<&'static str>,
        pub panicking: HashSet<&'static str>,
        pub network_calls: AtomicU64,
        pub disk_io_calls: AtomicU64,
    }

    impl FakeSource {
        pub(crate) fn healthy() -> Self {
            Self {
                failing: HashSet::new(),
                panicking: HashSet::new(),
                network_calls: AtomicU64::new(0),
                disk_io_calls: AtomicU64::new(0),
            }
        }

        fn check(&self, provider: &'static str) -> Result<(), ProviderError> {
            if self.panicking.contains(provider) {
                panic!("{provider} provider exploded");
            }
            if self.failing.contains(provider) {
                return Err(ProviderError::Unavailable(provider));
            }
            Ok(())
        }
    }

    impl MetricsSource for FakeSource {
        fn uptime_secs(&self) -> Result<u64, ProviderError> {
            self.check("uptime").map(|_| 100)
        }
        fn cpu_percent(&self) -> Result<f64, ProviderError> {
            self.check("cpu").map(|_| 12.5)
        }
        fn memory(&self) -> Result<Usage, ProviderError> {
            self.check("memory").map(|_| Usage {
                used: 2048,
                total: 4096,
            })
        }
        fn swap(&self) -> Result<Usage, ProviderError> {
            self.check("swap").map(|_| Usage {
                used: 10,
                total: 20,
            })
        }
        fn disk(&self) -> Result<Usage, ProviderError> {
            self.check("disk").map(|_| Usage {
                used: 300,
                total: 900,
            })
        }
        fn network_counters(&self) -> Result<ByteCounters, ProviderError> {
            self.check("network")?;
            // 1000/500 on the first call, then +4000/+2000 per call.
            let n = self.network_calls.fetch_add(1, Ordering::SeqCst);
            Ok(ByteCounters {
                inbound: 1_000 + n * 4_000,
                outbound: 500 + n * 2_000,
            })
        }
        fn disk_io_counters(&self) -> Result<ByteCounters, ProviderError> {
            self.check("disk_io")?;
            // 8000/4000 on the first call, then +2000/+1000 per call.
            let n = self.disk_io_calls.fetch_add(1, Ordering::SeqCst);
            Ok(ByteCounters {
                inbound: 8_000 + n * 2_000,
                outbound: 4_000 + n * 1_000,
            })
        }
        fn load_average(&self) -> Result<LoadAverage, ProviderError> {
            self.check("load").map(|_| LoadAverage {
                one: 0.5,
                five: 0.25,
                fifteen: 0.125,
            })
        }
        fn task_counts(&self) -> Result<TaskCounts, ProviderError> {
            self.check("tasks").map(|_| TaskCounts {
                processes: 42,
                threads: 420,
            })
        }
        fn user_sessions(&self) -> Result<u64, ProviderError> {
            self.check("users").map(|_| 2)
        }
    }

    pub(crate) fn collector_with(source: FakeSource) -> Collector {
        let (_tx, disk_io) = watch::channel(ByteRate {
            inbound_per_sec: 7,
            outbound_per_sec: 9,
        });
        Collector::new(
            Arc::new(source),
            ProbeSet::new(Vec::new(), 10),
            disk_io,
            Metrics::new().expect("metrics"),
        )
    }

    #[tokio::test]
    async fn gather_populates_every_field() {
        let mut collector = collector_with(FakeSource::healthy());
        let snapshot = collector.gather().await;

        assert_eq!(snapshot.uptime, 100);
        assert_eq!(snapshot.cpu, 12.5);
        assert_eq!((snapshot.memory_used, snapshot.memory_total), (2048, 4096));
        assert_eq!((snapshot.swap_used, snapshot.swap_total), (10, 20));
        assert_eq!((snapshot.hdd_used, snapshot.hdd_total), (300, 900));
        assert_eq!((snapshot.network_in, snapshot.network_out), (1_000, 500));
        assert_eq!((snapshot.io_read, snapshot.io_write), (7, 9));
        assert_eq!(snapshot.load_15, 0.125);
        assert_eq!((snapshot.process, snapshot.thread), (42, 420));
        assert_eq!(snapshot.users, 2);
        assert!(snapshot.ip_status);
    }

    #[tokio::test]
    async fn failed_providers_degrade_only_their_fields() {
        let mut source = FakeSource::healthy();
        source.failing.extend(["memory", "load", "network"]);
        source.panicking.insert("cpu");
        let mut collector = collector_with(source);

        let snapshot = collector.gather().await;

        assert_eq!(snapshot.cpu, 0.0);
        assert_eq!((snapshot.memory_used, snapshot.memory_total), (0, 0));
        assert_eq!((snapshot.load_1, snapshot.load_5, snapshot.load_15), (0.0, 0.0, 0.0));
        assert_eq!((snapshot.network_in, snapshot.network_rx), (0, 0));

        assert_eq!(snapshot.uptime, 100);
        assert_eq!((snapshot.swap_used, snapshot.swap_total), (10, 20));
        assert_eq!((snapshot.hdd_used, snapshot.hdd_total), (300, 900));
        assert_eq!((snapshot.process, snapshot.thread), (42, 420));
        assert_eq!(snapshot.users, 2);
        assert!(snapshot.ip_status);
    }

    #[tokio::test(start_paused = true)]
    async fn network_rate_needs_two_readings() {
        let mut collector = collector_with(FakeSource::healthy());

        let first = collector.gather().await;
        assert_eq!((first.network_rx, first.network_tx), (0, 0));

        tokio::time::advance(Duration::from_secs(2)).await;
        let second = collector.gather().await;
        assert_eq!(second.network_in, 5_000);
        assert_eq!((second.network_rx, second.network_tx), (2_000, 1_000));

        collector.reset_rates();
        tokio::time::advance(Duration::from_secs(2)).await;
        let after_reset = collector.gather().await;
        assert_eq!((after_reset.network_rx, after_reset.network_tx), (0, 0));
    }
}

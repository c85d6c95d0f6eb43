use super::{ByteCounters, MetricsSource};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ByteRate {
    pub inbound_per_sec: u64,
    pub outbound_per_sec: u64,
}

#[derive(Debug, Default)]
pub struct RateMeter {
    last: Option<(ByteCounters, Instant)>,
}

impl RateMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, counters: ByteCounters, at: Instant) -> ByteRate {
        let rate = match self.last {
            Some((prev, prev_at)) => {
                let secs = at.saturating_duration_since(prev_at).as_secs_f64();
                if secs > 0.0 {
                    ByteRate {
                        inbound_per_sec: per_sec(counters.inbound, prev.inbound, secs),
                        outbound_per_sec: per_sec(counters.outbound, prev.outbound, secs),
                    }
                } else {
                    ByteRate::default()
                }
            }
            None => ByteRate::default(),
        };
        self.last = Some((counters, at));
        rate
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

fn per_sec(current: u64, previous: u64, secs: f64) -> u64 {
    // A counter that went backwards (interface reset) reports zero.
    (current.saturating_sub(previous) as f64 / secs) as u64
}

pub fn spawn_disk_io_sampler(
    source: Arc<dyn MetricsSource>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> (watch::Receiver<ByteRate>, JoinHandle<()>) {
    let (tx, rx) = watch::channel(ByteRate::default());
    let handle = tokio::spawn(async move {
        let mut meter = RateMeter::new();
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("disk io sampler stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let source = source.clone();
                    let reading = tokio::task::spawn_blocking(move || source.disk_io_counters()).await;
                    match reading {
                        Ok(Ok(counters)) => {
                            let rate = meter.observe(counters, Instant::now());
                            let _ = tx.send(rate);
                        }
                        Ok(Err(err)) => {
                            debug!(error = %err, "disk io counters unavailable");
                        }
                        Err(err) => {
                            debug!(error = %err, "disk io sampling task failed");
                        }
                    }
                }
            }
        }
    });
    (rx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::tests::FakeSource;

    fn counters(inbound: u64, outbound: u64) -> ByteCounters {
        ByteCounters { inbound, outbound }
    }

    #[test]
    fn first_reading_reports_zero() {
        let mut meter = RateMeter::new();
        let rate = meter.observe(counters(1_000, 500), Instant::now());
        assert_eq!(rate, ByteRate::default());
    }

    #[test]
    fn second_reading_divides_delta_by_elapsed() {
        let mut meter = RateMeter::new();
        let t0 = Instant::now();
        meter.observe(counters(1_000, 500), t0);
        let rate = meter.observe(counters(7_000, 3_500), t0 + Duration::from_secs(3));
        assert_eq!(rate.inbound_per_sec, 2_000);
        assert_eq!(rate.outbound_per_sec, 1_000);
    }

    #[test]
    fn reset_and_counter_wrap_report_zero() {
        let mut meter = RateMeter::new();
        let t0 = Instant::now();
        meter.observe(counters(10_000, 10_000), t0);
        let rate = meter.observe(counters(5, 20_000), t0 + Duration::from_secs(1));
        assert_eq!(rate.inbound_per_sec, 0);
        assert_eq!(rate.outbound_per_sec, 10_000);

        meter.reset();
        let rate = meter.observe(counters(90_000, 90_000), t0 + Duration::from_secs(2));
        assert_eq!(rate, ByteRate::default());
    }

    #[tokio::test(start_paused = true)]
    async fn disk_io_sampler_publishes_rate_per_period() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let source: Arc<dyn MetricsSource> = Arc::new(FakeSource::healthy());
        let (mut rates, handle) =
            spawn_disk_io_sampler(source, Duration::from_secs(2), shutdown_rx);

        rates.changed().await.expect("first sample");
        assert_eq!(*rates.borrow_and_update(), ByteRate::default());

        rates.changed().await.expect("second sample");
        assert_eq!(
            *rates.borrow_and_update(),
            ByteRate {
                inbound_per_sec: 1_000,
                outbound_per_sec: 500,
            }
        );

        shutdown_tx.send(true).expect("shutdown");
        handle.await.expect("sampler task");
    }
}

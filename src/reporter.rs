use crate::collectors::Collector;
use crate::metrics::{now_unix, Metrics};
use crate::session::{Connector, NetworkError, SendError, Session};
use crate::state::{LinkState, State};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Sent { bytes: usize },
    Skipped,
    Reconnected,
    ReconnectFailed,
}

pub struct ReportingLoop<C: Connector> {
    connector: C,
    collector: Collector,
    session: Session<C::Stream>,
    link: LinkState,
    interval: Duration,
    probe_targets: Vec<String>,
    metrics: Arc<Metrics>,
    state: Arc<RwLock<State>>,
}

impl<C: Connector> ReportingLoop<C> {
    pub async fn start(
        connector: C,
        collector: Collector,
        interval: Duration,
        metrics: Arc<Metrics>,
        state: Arc<RwLock<State>>,
    ) -> Result<Self, NetworkError> {
        let session = connector.connect().await?;
        metrics.set_connected(true);
        state.write().await.mark_connected(session.family());
        let probe_targets = collector.probe_targets();

        Ok(Self {
            connector,
            collector,
            session,
            link: LinkState::Connected,
            interval,
            probe_targets,
            metrics,
            state,
        })
    }

    pub fn link(&self) -> LinkState {
        self.link
    }

    /// Ticks every interval until shutdown. The first cycle runs one interval
    /// after start; ticks missed while a cycle (or its reconnect) is still
    /// running are dropped, keeping the schedule aligned to the start.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            server = %self.connector.describe(),
            interval = %humantime::format_duration(self.interval),
            "reporting loop started"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("shutdown signal received, stopping reporting loop");
                    break;
                }
                _ = ticker.tick() => {
                    self.run_cycle().await;
                }
            }
        }

        info!(link = ?self.link(), "closing collector session");
        self.session.close().await;
        self.metrics.set_connected(false);
    }

    pub async fn run_cycle(&mut self) -> CycleOutcome {
        let started = Instant::now();
        let mut snapshot = self.collector.gather().await;
        snapshot.ip_family = self.session.family();
        let gathered_in = started.elapsed();
        self.metrics
            .agent_gather_duration_seconds
            .set(gathered_in.as_secs_f64());
        debug!(elapsed = %humantime::format_duration(gathered_in), "snapshot gathered");

        if self.session.is_closed() {
            debug!("session closed since last cycle, reconnecting before send");
            return self.reconnect().await;
        }

        match self.session.send(&snapshot).await {
            Ok(bytes) => {
                info!(bytes, "report sent");
                self.metrics
                    .record_report(&snapshot, &self.probe_targets, bytes);
                self.state.write().await.mark_reported(snapshot, now_unix());
                CycleOutcome::Sent { bytes }
            }
            Err(SendError::Encode(err)) => {
                warn!(error = %err, "failed to encode snapshot, skipping cycle");
                self.metrics.agent_encode_failures_total.inc();
                CycleOutcome::Skipped
            }
            Err(SendError::Network(err)) => {
                warn!(
                    server = %self.connector.describe(),
                    error = %err,
                    idle = %humantime::format_duration(self.session.last_activity().elapsed()),
                    "report send failed, reconnecting"
                );
                self.metrics.agent_send_failures_total.inc();
                self.state.write().await.mark_send_failed(err.to_string());
                self.reconnect().await
            }
        }
    }

    async fn reconnect(&mut self) -> CycleOutcome {
        self.link = LinkState::Reconnecting;
        self.metrics.set_connected(false);
        self.session.close().await;

        let started = Instant::now();
        match self.connector.connect().await {
            Ok(session) => {
                let family = session.family();
                info!(
                    server = %self.connector.describe(),
                    %family,
                    elapsed = %humantime::format_duration(started.elapsed()),
                    "reconnected to collector"
                );
                self.session = session;
                self.link = LinkState::Connected;
                self.collector.reset_rates();
                self.metrics.inc_reconnect("success");
                self.metrics.set_connected(true);
                self.state.write().await.mark_connected(family);
                CycleOutcome::Reconnected
            }
            Err(err) => {
                error!(
                    server = %self.connector.describe(),
                    error = %err,
                    elapsed = %humantime::format_duration(started.elapsed()),
                    "reconnect failed, retrying on next tick"
                );
                self.metrics.inc_reconnect("failure");
                self.state
                    .write()
                    .await
                    .mark_reconnect_failed(err.to_string());
                CycleOutcome::ReconnectFailed
            }
        }
    }
}

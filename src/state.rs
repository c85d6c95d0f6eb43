use crate::snapshot::{AddressFamily, MetricSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct State {
    pub started_at_unix: i64,
    pub server: String,
    pub link: LinkState,
    pub ip_family: Option<AddressFamily>,
    pub reports_sent: u64,
    pub send_failures: u64,
    pub reconnect_failures: u64,
    pub last_report_unix: Option<i64>,
    pub last_error: Option<String>,
    pub last_snapshot: Option<MetricSnapshot>,
}

impl State {
    pub fn new(server: impl Into<String>, now_unix: i64) -> Self {
        Self {
            started_at_unix: now_unix,
            server: server.into(),
            link: LinkState::Reconnecting,
            ip_family: None,
            reports_sent: 0,
            send_failures: 0,
            reconnect_failures: 0,
            last_report_unix: None,
            last_error: None,
            last_snapshot: None,
        }
    }

    pub fn mark_connected(&mut self, family: AddressFamily) {
        self.link = LinkState::Connected;
        self.ip_family = Some(family);
        self.last_error = None;
    }

    pub fn mark_reported(&mut self, snapshot: MetricSnapshot, now_unix: i64) {
        self.reports_sent += 1;
        self.last_report_unix = Some(now_unix);
        self.last_snapshot = Some(snapshot);
    }

    pub fn mark_send_failed(&mut self, error: String) {
        self.link = LinkState::Reconnecting;
        self.send_failures += 1;
        self.last_error = Some(error);
    }

    pub fn mark_reconnect_failed(&mut self, error: String) {
        self.link = LinkState::Reconnecting;
        self.reconnect_failures += 1;
        self.last_error = Some(error);
    }
}

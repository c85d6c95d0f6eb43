use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const UPDATE_COMMAND: &str = "update";

pub const UNREACHABLE_LATENCY_MS: f64 = -1.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    #[default]
    Ipv4,
    Ipv6,
}

impl std::fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AddressFamily::Ipv4 => f.write_str("IPv4"),
            AddressFamily::Ipv6 => f.write_str("IPv6"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub uptime: u64,
    pub cpu: f64,
    pub memory_used: u64,
    pub memory_total: u64,
    pub swap_used: u64,
    pub swap_total: u64,
    pub hdd_used: u64,
    pub hdd_total: u64,
    pub network_in: u64,
    pub network_out: u64,
    pub network_rx: u64,
    pub network_tx: u64,
    pub io_read: u64,
    pub io_write: u64,
    pub load_1: f64,
    pub load_5: f64,
    pub load_15: f64,
    pub process: u64,
    pub thread: u64,
    pub users: u64,
    pub ip_status: bool,
    pub ip_family: AddressFamily,
    /// `ping_<target>` loss percent and `time_<target>` latency per probe target.
    #[serde(flatten)]
    pub probes: BTreeMap<String, f64>,
}

impl MetricSnapshot {
    pub fn set_probe(&mut self, target: &str, loss_percent: f64, latency_ms: f64) {
        self.probes.insert(loss_key(target), loss_percent);
        self.probes.insert(latency_key(target), latency_ms);
    }

    pub fn probe_loss(&self, target: &str) -> Option<f64> {
        self.probes.get(&loss_key(target)).copied()
    }

    pub fn probe_latency(&self, target: &str) -> Option<f64> {
        self.probes.get(&latency_key(target)).copied()
    }

    pub fn to_frame(&self) -> Result<Vec<u8>, serde_json::Error> {
        let body = serde_json::to_vec(self)?;
        let mut frame = Vec::with_capacity(UPDATE_COMMAND.len() + body.len() + 2);
        frame.extend_from_slice(UPDATE_COMMAND.as_bytes());
        frame.push(b' ');
        frame.extend_from_slice(&body);
        frame.push(b'\n');
        Ok(frame)
    }
}

fn loss_key(target: &str) -> String {
    format!("ping_{target}")
}

fn latency_key(target: &str) -> String {
    format!("time_{target}")
}

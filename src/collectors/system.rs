use super::{ByteCounters, LoadAverage, MetricsSource, ProviderError, TaskCounts, Usage};
use std::collections::HashSet;
#[cfg(target_os = "linux")]
use std::fs;
#[cfg(target_os = "linux")]
use std::path::Path;
use std::process::Command;
use std::sync::{Mutex, MutexGuard};
use sysinfo::{CpuExt, DiskExt, NetworkExt, NetworksExt, System, SystemExt};

// One System per concern so parallel providers never share a refresh lock.
pub struct SysinfoSource {
    cpu: Mutex<System>,
    memory: Mutex<System>,
    disks: Mutex<System>,
    networks: Mutex<System>,
    processes: Mutex<System>,
    host: Mutex<System>,
}

impl SysinfoSource {
    pub fn new() -> Self {
        Self {
            cpu: Mutex::new(System::new()),
            memory: Mutex::new(System::new()),
            disks: Mutex::new(System::new()),
            networks: Mutex::new(System::new()),
            processes: Mutex::new(System::new()),
            host: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoSource {
    fn default() -> Self {
        Self::new()
    }
}

fn lock(system: &Mutex<System>) -> MutexGuard<'_, System> {
    // A provider that panicked mid-refresh leaves a usable System behind.
    system.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MetricsSource for SysinfoSource {
    fn uptime_secs(&self) -> Result<u64, ProviderError> {
        Ok(lock(&self.host).uptime())
    }

    fn cpu_percent(&self) -> Result<f64, ProviderError> {
        let mut system = lock(&self.cpu);
        system.refresh_cpu();
        if system.cpus().is_empty() {
            return Err(ProviderError::Unavailable("cpu list"));
        }
        Ok(system.global_cpu_info().cpu_usage() as f64)
    }

    fn memory(&self) -> Result<Usage, ProviderError> {
        let mut system = lock(&self.memory);
        system.refresh_memory();
        Ok(Usage {
            used: system.used_memory(),
            total: system.total_memory(),
        })
    }

    fn swap(&self) -> Result<Usage, ProviderError> {
        let mut system = lock(&self.memory);
        system.refresh_memory();
        Ok(Usage {
            used: system.used_swap(),
            total: system.total_swap(),
        })
    }

    fn disk(&self) -> Result<Usage, ProviderError> {
        let mut system = lock(&self.disks);
        system.refresh_disks_list();
        system.refresh_disks();

        // The same device mounted twice (bind mounts) is counted once.
        let mut seen = HashSet::new();
        let mut usage = Usage::default();
        for disk in system.disks() {
            if !seen.insert(disk.name().to_os_string()) {
                continue;
            }
            let total = disk.total_space();
            usage.total += total;
            usage.used += total.saturating_sub(disk.available_space());
        }
        Ok(usage)
    }

    fn network_counters(&self) -> Result<ByteCounters, ProviderError> {
        let mut system = lock(&self.networks);
        system.refresh_networks_list();
        system.refresh_networks();

        let mut counters = ByteCounters::default();
        for (iface, data) in system.networks().iter() {
            if is_virtual_iface(iface) {
                continue;
            }
            counters.inbound += data.total_received();
            counters.outbound += data.total_transmitted();
        }
        Ok(counters)
    }

    fn disk_io_counters(&self) -> Result<ByteCounters, ProviderError> {
        read_disk_io_counters()
    }

    fn load_average(&self) -> Result<LoadAverage, ProviderError> {
        if cfg!(target_os = "windows") {
            return Err(ProviderError::Unsupported);
        }
        let load = lock(&self.host).load_average();
        Ok(LoadAverage {
            one: load.one,
            five: load.five,
            fifteen: load.fifteen,
        })
    }

    fn task_counts(&self) -> Result<TaskCounts, ProviderError> {
        let processes = {
            let mut system = lock(&self.processes);
            system.refresh_processes();
            system.processes().len() as u64
        };
        let threads = read_thread_count().unwrap_or(0);
        Ok(TaskCounts { processes, threads })
    }

    fn user_sessions(&self) -> Result<u64, ProviderError> {
        let output = Command::new("who")
            .output()
            .map_err(|_| ProviderError::Unavailable("who"))?;
        if !output.status.success() {
            return Err(ProviderError::Unavailable("who"));
        }
        let text = String::from_utf8_lossy(&output.stdout);
        Ok(count_sessions(&text))
    }
}

fn is_virtual_iface(name: &str) -> bool {
    const PREFIXES: [&str; 6] = ["lo", "docker", "veth", "br-", "virbr", "tun"];
    PREFIXES.iter().any(|p| name.starts_with(p))
}

fn count_sessions(who_output: &str) -> u64 {
    who_output.lines().filter(|l| !l.trim().is_empty()).count() as u64
}

#[cfg(target_os = "linux")]
fn read_thread_count() -> Result<u64, ProviderError> {
    let text = read_proc("/proc/loadavg")?;
    parse_loadavg_threads(&text)
}

#[cfg(not(target_os = "linux"))]
fn read_thread_count() -> Result<u64, ProviderError> {
    Err(ProviderError::Unsupported)
}

#[cfg(target_os = "linux")]
fn read_disk_io_counters() -> Result<ByteCounters, ProviderError> {
    let text = read_proc("/proc/diskstats")?;
    Ok(parse_diskstats(&text, |name| {
        Path::new("/sys/block").join(name).exists()
    }))
}

#[cfg(not(target_os = "linux"))]
fn read_disk_io_counters() -> Result<ByteCounters, ProviderError> {
    Err(ProviderError::Unsupported)
}

#[cfg(target_os = "linux")]
fn read_proc(path: &str) -> Result<String, ProviderError> {
    fs::read_to_string(path).map_err(|source| ProviderError::Io {
        path: path.to_string(),
        source,
    })
}

// Fourth field of /proc/loadavg is running/total scheduling entities.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_loadavg_threads(text: &str) -> Result<u64, ProviderError> {
    text.split_whitespace()
        .nth(3)
        .and_then(|field| field.split('/').nth(1))
        .and_then(|total| total.parse().ok())
        .ok_or_else(|| ProviderError::Parse {
            what: "/proc/loadavg",
            detail: text.trim().to_string(),
        })
}

const SECTOR_BYTES: u64 = 512;

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_diskstats(text: &str, is_whole_device: impl Fn(&str) -> bool) -> ByteCounters {
    let mut counters = ByteCounters::default();
    for line in text.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 {
            continue;
        }
        let name = fields[2];
        if name.starts_with("loop") || name.starts_with("ram") || !is_whole_device(name) {
            continue;
        }
        let sectors_read = fields[5].parse::<u64>().unwrap_or(0);
        let sectors_written = fields[9].parse::<u64>().unwrap_or(0);
        counters.inbound += sectors_read * SECTOR_BYTES;
        counters.outbound += sectors_written * SECTOR_BYTES;
    }
    counters
}

//! Host resource probe
//!
//! Reads `/proc` and `df` directly. All reads are blocking, so the probe is
//! built on `BlockingProbe` and runs on the blocking pool.

use anyhow::Context;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use vigil_core::{BlockingProbe, HealthLevel, ProbeContext};

/// Cumulative jiffies from the aggregate `cpu` line of `/proc/stat`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuTimes {
    pub idle: u64,
    pub total: u64,
}

pub fn parse_cpu_times(stat: &str) -> Option<CpuTimes> {
    let line = stat.lines().find(|line| line.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .map(str::parse)
        .collect::<Result<_, _>>()
        .ok()?;
    if fields.len() < 4 {
        return None;
    }
    // idle + iowait
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Some(CpuTimes {
        idle,
        total: fields.iter().sum(),
    })
}

/// Busy share between two samples, in percent
pub fn cpu_percent(before: CpuTimes, after: CpuTimes) -> f64 {
    let total = after.total.saturating_sub(before.total);
    if total == 0 {
        return 0.0;
    }
    let idle = after.idle.saturating_sub(before.idle);
    (total.saturating_sub(idle) as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryInfo {
    pub total_kb: u64,
    pub available_kb: u64,
}

impl MemoryInfo {
    pub fn used_kb(&self) -> u64 {
        self.total_kb.saturating_sub(self.available_kb)
    }

    pub fn percent(&self) -> f64 {
        if self.total_kb == 0 {
            0.0
        } else {
            self.used_kb() as f64 / self.total_kb as f64 * 100.0
        }
    }
}

pub fn parse_meminfo(meminfo: &str) -> Option<MemoryInfo> {
    let field = |name: &str| {
        meminfo
            .lines()
            .find_map(|line| line.strip_prefix(name)?.strip_prefix(':'))
            .and_then(|rest| rest.split_whitespace().next())
            .and_then(|kb| kb.parse::<u64>().ok())
    };
    let total_kb = field("MemTotal")?;
    // Kernels before 3.14 lack MemAvailable
    let available_kb = field("MemAvailable").or_else(|| Some(field("MemFree")? + field("Cached").unwrap_or(0)))?;
    Some(MemoryInfo { total_kb, available_kb })
}

pub fn parse_loadavg(loadavg: &str) -> Option<[f64; 3]> {
    let mut fields = loadavg.split_whitespace().map(|f| f.parse::<f64>().ok());
    Some([fields.next()??, fields.next()??, fields.next()??])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskInfo {
    pub total_kb: u64,
    pub used_kb: u64,
    pub available_kb: u64,
}

impl DiskInfo {
    pub fn percent(&self) -> f64 {
        if self.total_kb == 0 {
            0.0
        } else {
            self.used_kb as f64 / self.total_kb as f64 * 100.0
        }
    }
}

/// Parse `df -Pk <path>` output
pub fn parse_df(output: &str) -> Option<DiskInfo> {
    let line = output.lines().nth(1)?;
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 4 {
        return None;
    }
    Some(DiskInfo {
        total_kb: fields[1].parse().ok()?,
        used_kb: fields[2].parse().ok()?,
        available_kb: fields[3].parse().ok()?,
    })
}

/// Where the device probe reads from
#[derive(Debug, Clone)]
pub struct DeviceSource {
    pub proc_root: PathBuf,
    pub disk_path: PathBuf,
    /// Gap between the two `/proc/stat` samples used for CPU usage
    pub cpu_sample: Duration,
}

impl Default for DeviceSource {
    fn default() -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
            disk_path: PathBuf::from("/"),
            cpu_sample: Duration::from_millis(200),
        }
    }
}

impl DeviceSource {
    fn read(&self, name: &str) -> anyhow::Result<String> {
        let path = self.proc_root.join(name);
        std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))
    }

    fn cpu_times(&self) -> anyhow::Result<CpuTimes> {
        parse_cpu_times(&self.read("stat")?).context("unrecognized /proc/stat format")
    }

    /// Take one full reading
    pub fn sample(&self) -> anyhow::Result<Value> {
        let before = self.cpu_times()?;
        std::thread::sleep(self.cpu_sample);
        let cpu = cpu_percent(before, self.cpu_times()?);

        let memory = parse_meminfo(&self.read("meminfo")?).context("unrecognized /proc/meminfo format")?;
        let load = parse_loadavg(&self.read("loadavg")?).unwrap_or_default();
        let cpu_count = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);

        let mut data = json!({
            "cpu_percent": round1(cpu),
            "cpu_count": cpu_count,
            "memory_total_kb": memory.total_kb,
            "memory_available_kb": memory.available_kb,
            "memory_percent": round1(memory.percent()),
            "load_avg_1min": load[0],
            "load_avg_5min": load[1],
            "load_avg_15min": load[2],
        });

        // Disk fields are omitted rather than failing the whole reading
        match read_disk(&self.disk_path) {
            Ok(disk) => {
                data["disk_total_kb"] = json!(disk.total_kb);
                data["disk_used_kb"] = json!(disk.used_kb);
                data["disk_available_kb"] = json!(disk.available_kb);
                data["disk_percent"] = json!(round1(disk.percent()));
                let level = HealthLevel::from_device(cpu, memory.percent(), disk.percent());
                data["status_level"] = json!(level);
            }
            Err(e) => tracing::debug!(error = %e, "disk usage unavailable"),
        }
        Ok(data)
    }
}

fn read_disk(path: &Path) -> anyhow::Result<DiskInfo> {
    let output = Command::new("df").arg("-Pk").arg(path).output().context("running df")?;
    if !output.status.success() {
        anyhow::bail!("df exited with {}", output.status);
    }
    parse_df(&String::from_utf8_lossy(&output.stdout)).context("unrecognized df output")
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// CPU, memory, disk and load of the local host. Payload kind: `device`.
pub fn device_probe(source: DeviceSource) -> BlockingProbe<impl Fn(&ProbeContext) -> anyhow::Result<Value> + Send + Sync + 'static> {
    BlockingProbe::new("device", move |_ctx: &ProbeContext| source.sample())
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAT_1: &str = "cpu  100 0 100 700 100 0 0 0 0 0\ncpu0 50 0 50 350 50 0 0 0 0 0\n";
    const STAT_2: &str = "cpu  150 0 150 750 150 0 0 0 0 0\ncpu0 75 0 75 375 75 0 0 0 0 0\n";

    #[test]
    fn test_parse_cpu_times() {
        let times = parse_cpu_times(STAT_1).unwrap();
        assert_eq!(times, CpuTimes { idle: 800, total: 1000 });
        assert!(parse_cpu_times("intr 1 2 3").is_none());
    }

    #[test]
    fn test_cpu_percent_between_samples() {
        let before = parse_cpu_times(STAT_1).unwrap();
        let after = parse_cpu_times(STAT_2).unwrap();
        // 200 jiffies elapsed, 100 of them idle or iowait
        assert_eq!(cpu_percent(before, after), 50.0);
        assert_eq!(cpu_percent(after, after), 0.0);
    }

    #[test]
    fn test_parse_meminfo() {
        let meminfo = "MemTotal:       16000000 kB\nMemFree:         2000000 kB\nMemAvailable:    4000000 kB\n";
        let memory = parse_meminfo(meminfo).unwrap();
        assert_eq!(memory.total_kb, 16_000_000);
        assert_eq!(memory.available_kb, 4_000_000);
        assert_eq!(memory.percent(), 75.0);

        let old_kernel = "MemTotal: 1000 kB\nMemFree: 200 kB\nCached: 300 kB\n";
        assert_eq!(parse_meminfo(old_kernel).unwrap().available_kb, 500);
    }

    #[test]
    fn test_parse_loadavg() {
        assert_eq!(parse_loadavg("0.52 0.58 0.59 1/467 12345\n"), Some([0.52, 0.58, 0.59]));
        assert_eq!(parse_loadavg("0.52"), None);
    }

    #[test]
    fn test_parse_df() {
        let output = "Filesystem     1024-blocks      Used Available Capacity Mounted on\n\
                      /dev/sda1        100000000  90000000  10000000      90% /\n";
        let disk = parse_df(output).unwrap();
        assert_eq!(disk.used_kb, 90_000_000);
        assert_eq!(disk.percent(), 90.0);
        assert!(parse_df("Filesystem\n").is_none());
    }

    #[test]
    fn test_sample_from_fake_proc() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("stat"), STAT_1).unwrap();
        std::fs::write(dir.path().join("meminfo"), "MemTotal: 1000 kB\nMemAvailable: 250 kB\n").unwrap();
        std::fs::write(dir.path().join("loadavg"), "1.00 0.50 0.25 1/100 42\n").unwrap();

        let source = DeviceSource {
            proc_root: dir.path().to_path_buf(),
            disk_path: PathBuf::from("/"),
            cpu_sample: Duration::ZERO,
        };
        let data = source.sample().unwrap();

        assert_eq!(data["cpu_percent"], 0.0);
        assert_eq!(data["memory_percent"], 75.0);
        assert_eq!(data["load_avg_1min"], 1.0);
    }

    #[test]
    fn test_missing_proc_is_an_error() {
        let source = DeviceSource {
            proc_root: PathBuf::from("/definitely/not/proc"),
            ..DeviceSource::default()
        };
        assert!(source.sample().is_err());
    }
}

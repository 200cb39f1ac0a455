// src/runtime/probe.rs
//! Per-process resource sampling via /proc
//!
//! A probe is created right after spawn and remembers the CPU ticks it saw on
//! the previous call, so each sample reports CPU usage *since the last call*.
//!
//! - CPU: `(utime + stime)` delta in seconds divided by wall time elapsed,
//!   i.e. a fraction of one core
//! - Memory: resident set size divided by `MemTotal`

use std::fs;
use std::io;
use std::time::Instant;
use thiserror::Error;

/// One instantaneous reading, both values are fractions
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSample {
    /// CPU usage as a fraction of one core
    pub cpu: f64,

    /// Resident memory as a fraction of physical memory
    pub mem: f64,
}

impl ResourceSample {
    pub fn new(cpu: f64, mem: f64) -> Self {
        Self { cpu, mem }
    }
}

/// Why a sample could not be taken
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProbeError {
    /// Process exited, was reaped, or is a zombie
    #[error("process is no longer observable")]
    Gone,

    /// Stats exist but could not be read or parsed
    #[error("unreadable process stats: {0}")]
    Unreadable(String),
}

/// Sampling primitive for a single process
pub trait ProcessProbe: Send {
    fn sample(&mut self) -> Result<ResourceSample, ProbeError>;
}

/// Creates a probe for a freshly spawned pid
pub trait ProbeFactory: Send + Sync {
    fn probe(&self, pid: u32) -> Box<dyn ProcessProbe>;
}

/// Fields of `/proc/<pid>/stat` the probe cares about
#[derive(Debug, Clone, Copy, PartialEq)]
struct StatFields {
    state: char,
    cpu_ticks: u64,
    rss_pages: u64,
}

fn parse_stat(content: &str) -> Result<StatFields, ProbeError> {
    // comm (field 2) may contain spaces and parentheses; everything after the
    // last ')' is whitespace separated starting at field 3
    let rest = content
        .rfind(')')
        .map(|idx| &content[idx + 1..])
        .ok_or_else(|| ProbeError::Unreadable("missing comm terminator".to_string()))?;

    let fields: Vec<&str> = rest.split_whitespace().collect();
    if fields.len() < 22 {
        return Err(ProbeError::Unreadable(format!(
            "expected at least 22 stat fields after comm, got {}",
            fields.len()
        )));
    }

    let parse = |idx: usize, name: &str| -> Result<u64, ProbeError> {
        fields[idx]
            .parse::<u64>()
            .map_err(|_| ProbeError::Unreadable(format!("invalid {}: {}", name, fields[idx])))
    };

    let state = fields[0].chars().next().unwrap_or('?');
    let utime = parse(11, "utime")?;
    let stime = parse(12, "stime")?;
    let rss_pages = parse(21, "rss")?;

    Ok(StatFields {
        state,
        cpu_ticks: utime + stime,
        rss_pages,
    })
}

fn parse_mem_total(meminfo: &str) -> Option<u64> {
    meminfo
        .lines()
        .find(|line| line.starts_with("MemTotal:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
}

/// Total physical memory in bytes, from `/proc/meminfo`
pub fn total_memory_bytes() -> Option<u64> {
    fs::read_to_string("/proc/meminfo")
        .ok()
        .and_then(|content| parse_mem_total(&content))
        .filter(|total| *total > 0)
}

fn read_stat(pid: u32) -> Result<StatFields, ProbeError> {
    let path = format!("/proc/{}/stat", pid);
    let content = fs::read_to_string(&path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => ProbeError::Gone,
        // ESRCH surfaces when the task exits between open and read
        _ if e.raw_os_error() == Some(libc::ESRCH) => ProbeError::Gone,
        _ => ProbeError::Unreadable(format!("{}: {}", path, e)),
    })?;

    let stat = parse_stat(&content)?;
    if matches!(stat.state, 'Z' | 'X' | 'x') {
        return Err(ProbeError::Gone);
    }
    Ok(stat)
}

/// Probe backed by `/proc/<pid>/stat` and `/proc/meminfo`
#[derive(Debug)]
pub struct ProcProbe {
    pid: u32,
    clk_tck: f64,
    page_size: u64,
    total_memory: Option<u64>,
    last: Option<(u64, Instant)>,
}

impl ProcProbe {
    /// Create a probe and take the CPU baseline immediately
    pub fn new(pid: u32) -> Self {
        // SAFETY: sysconf has no preconditions
        let clk_tck = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

        let last = read_stat(pid).ok().map(|stat| (stat.cpu_ticks, Instant::now()));

        Self {
            pid,
            clk_tck: if clk_tck > 0 { clk_tck as f64 } else { 100.0 },
            page_size: if page_size > 0 { page_size as u64 } else { 4096 },
            total_memory: total_memory_bytes(),
            last,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

impl ProcessProbe for ProcProbe {
    fn sample(&mut self) -> Result<ResourceSample, ProbeError> {
        let stat = read_stat(self.pid)?;
        let now = Instant::now();

        let cpu = match self.last {
            Some((ticks, at)) => {
                let elapsed = now.duration_since(at).as_secs_f64();
                let used = stat.cpu_ticks.saturating_sub(ticks) as f64 / self.clk_tck;
                if elapsed > 0.0 {
                    used / elapsed
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        self.last = Some((stat.cpu_ticks, now));

        let total = self
            .total_memory
            .ok_or_else(|| ProbeError::Unreadable("MemTotal unavailable".to_string()))?;
        let mem = (stat.rss_pages * self.page_size) as f64 / total as f64;

        Ok(ResourceSample { cpu, mem })
    }
}

/// Factory producing [`ProcProbe`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcProbeFactory;

impl ProbeFactory for ProcProbeFactory {
    fn probe(&self, pid: u32) -> Box<dyn ProcessProbe> {
        Box::new(ProcProbe::new(pid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAT_LINE: &str = "4242 (my (weird) tool) R 1 4242 4242 0 -1 4194304 120 0 0 0 \
                             250 50 0 0 20 0 1 0 100 10485760 2560 18446744073709551615";

    #[test]
    fn test_parse_stat_with_parenthesised_comm() {
        let stat = parse_stat(STAT_LINE).unwrap();
        assert_eq!(stat.state, 'R');
        assert_eq!(stat.cpu_ticks, 300);
        assert_eq!(stat.rss_pages, 2560);
    }

    #[test]
    fn test_parse_stat_rejects_truncated() {
        let result = parse_stat("4242 (tool) R 1 2 3");
        assert!(matches!(result, Err(ProbeError::Unreadable(_))));
    }

    #[test]
    fn test_parse_mem_total() {
        let meminfo = "MemTotal:       16303428 kB\nMemFree:         1234567 kB\n";
        assert_eq!(parse_mem_total(meminfo), Some(16303428 * 1024));
        assert_eq!(parse_mem_total("MemFree: 1 kB"), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_probe_own_process() {
        let mut probe = ProcProbe::new(std::process::id());
        let sample = probe.sample().unwrap();
        assert!(sample.cpu >= 0.0);
        assert!(sample.mem > 0.0 && sample.mem < 1.0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_probe_missing_process_is_gone() {
        // pid_max is at most 2^22 on Linux
        let mut probe = ProcProbe::new(u32::MAX - 1);
        assert_eq!(probe.sample(), Err(ProbeError::Gone));
    }
}

//! Coarse memory/CPU backpressure checked before each unit of work.
//!
//! Readings come from `/proc` on Linux. Where they are unavailable the check
//! passes rather than blocking work.

use std::sync::Arc;

use super::ExtractionError;
use crate::config::PipelineConfig;

/// Point-in-time system load.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSnapshot {
    /// Used memory as a percentage of total, `0.0..=100.0`.
    pub memory_percent: f64,
    /// One-minute load average divided by the number of cores.
    pub load_per_core: f64,
}

pub trait ResourceMonitor: Send + Sync {
    /// Current readings, or `None` when the platform gives none.
    fn snapshot(&self) -> Option<ResourceSnapshot>;
}

/// Reads `/proc/meminfo` and `/proc/loadavg`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcResourceMonitor;

impl ResourceMonitor for ProcResourceMonitor {
    fn snapshot(&self) -> Option<ResourceSnapshot> {
        let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
        let loadavg = std::fs::read_to_string("/proc/loadavg").ok()?;
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Some(ResourceSnapshot {
            memory_percent: parse_memory_percent(&meminfo)?,
            load_per_core: parse_load_average(&loadavg)? / cores as f64,
        })
    }
}

/// Always reports the same readings.
#[derive(Debug, Clone, Copy)]
pub struct FixedResourceMonitor(pub ResourceSnapshot);

impl FixedResourceMonitor {
    pub fn idle() -> Self {
        Self(ResourceSnapshot {
            memory_percent: 10.0,
            load_per_core: 0.1,
        })
    }
}

impl ResourceMonitor for FixedResourceMonitor {
    fn snapshot(&self) -> Option<ResourceSnapshot> {
        Some(self.0)
    }
}

/// Ceilings above which no new work is started.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceLimits {
    pub max_memory_percent: f64,
    pub max_load_per_core: f64,
}

impl ResourceLimits {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            max_memory_percent: config.max_memory_percent,
            max_load_per_core: config.max_load_per_core,
        }
    }

    pub fn check(&self, snapshot: &ResourceSnapshot) -> Result<(), ExtractionError> {
        if snapshot.memory_percent > self.max_memory_percent {
            return Err(ExtractionError::ResourcePressure(format!(
                "memory usage too high ({:.1}%)",
                snapshot.memory_percent
            )));
        }
        if snapshot.load_per_core > self.max_load_per_core {
            return Err(ExtractionError::ResourcePressure(format!(
                "CPU load too high ({:.2} per core)",
                snapshot.load_per_core
            )));
        }
        Ok(())
    }
}

/// A monitor paired with the limits it is checked against.
#[derive(Clone)]
pub struct ResourceGuard {
    monitor: Arc<dyn ResourceMonitor>,
    limits: ResourceLimits,
}

impl ResourceGuard {
    pub fn new(monitor: Arc<dyn ResourceMonitor>, limits: ResourceLimits) -> Self {
        Self { monitor, limits }
    }

    /// `/proc` readings against the configured ceilings.
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(Arc::new(ProcResourceMonitor), ResourceLimits::from_config(config))
    }

    pub fn check(&self) -> Result<(), ExtractionError> {
        check_resources(self.monitor.as_ref(), &self.limits)
    }
}

/// Fails with `ResourcePressure` when `monitor` reads above `limits`.
pub fn check_resources(
    monitor: &dyn ResourceMonitor,
    limits: &ResourceLimits,
) -> Result<(), ExtractionError> {
    match monitor.snapshot() {
        Some(snapshot) => {
            tracing::debug!(
                memory_percent = snapshot.memory_percent,
                load_per_core = snapshot.load_per_core,
                "Resource check"
            );
            limits.check(&snapshot)
        }
        None => {
            tracing::debug!("Resource readings unavailable, skipping check");
            Ok(())
        }
    }
}

/// `(MemTotal - MemAvailable) / MemTotal` as a percentage.
fn parse_memory_percent(meminfo: &str) -> Option<f64> {
    let mut total = None;
    let mut available = None;
    for line in meminfo.lines() {
        // Format: "MemTotal:       16384000 kB"
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("MemTotal:") => total = parts.next().and_then(|v| v.parse::<u64>().ok()),
            Some("MemAvailable:") => available = parts.next().and_then(|v| v.parse::<u64>().ok()),
            _ => {}
        }
    }
    let total = total.filter(|&t| t > 0)?;
    let available = available?.min(total);
    Some((total - available) as f64 * 100.0 / total as f64)
}

fn parse_load_average(loadavg: &str) -> Option<f64> {
    loadavg.split_whitespace().next()?.parse().ok()
}

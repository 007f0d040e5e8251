//! Resource usage derived from two engine stat snapshots.

use serde::Serialize;

/// Usage numbers reported through `server.status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStats {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_bytes: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub pids: u64,
}

/// The raw counters pulled out of a bollard stats response: the current and
/// previous CPU snapshot plus memory, network and pid gauges.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatsSample {
    pub cpu_total: u64,
    pub cpu_system: u64,
    pub precpu_total: u64,
    pub precpu_system: u64,
    pub online_cpus: u64,
    pub memory_usage: u64,
    pub memory_limit: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub pids: u64,
}

impl StatsSample {
    pub fn from_bollard(raw: &bollard::container::Stats) -> Self {
        let (rx, tx) = raw
            .networks
            .as_ref()
            .map(|nets| {
                nets.values()
                    .fold((0u64, 0u64), |(rx, tx), n| (rx + n.rx_bytes, tx + n.tx_bytes))
            })
            .unwrap_or((0, 0));

        Self {
            cpu_total: raw.cpu_stats.cpu_usage.total_usage,
            cpu_system: raw.cpu_stats.system_cpu_usage.unwrap_or(0),
            precpu_total: raw.precpu_stats.cpu_usage.total_usage,
            precpu_system: raw.precpu_stats.system_cpu_usage.unwrap_or(0),
            online_cpus: raw.cpu_stats.online_cpus.unwrap_or(1),
            memory_usage: raw.memory_stats.usage.unwrap_or(0),
            memory_limit: raw.memory_stats.limit.unwrap_or(0),
            rx_bytes: rx,
            tx_bytes: tx,
            pids: raw.pids_stats.current.unwrap_or(0),
        }
    }
}

/// CPU% follows the engine's own formula: the container delta over the
/// system delta, scaled by online CPUs.
pub fn compute(sample: StatsSample) -> ContainerStats {
    let cpu_delta = sample.cpu_total.saturating_sub(sample.precpu_total) as f64;
    let system_delta = sample.cpu_system.saturating_sub(sample.precpu_system) as f64;
    let cpu_percent = if system_delta > 0.0 && cpu_delta > 0.0 {
        (cpu_delta / system_delta) * sample.online_cpus.max(1) as f64 * 100.0
    } else {
        0.0
    };

    let memory_percent = if sample.memory_limit > 0 {
        (sample.memory_usage as f64 / sample.memory_limit as f64) * 100.0
    } else {
        0.0
    };

    ContainerStats {
        cpu_percent,
        memory_percent,
        memory_bytes: sample.memory_usage,
        rx_bytes: sample.rx_bytes,
        tx_bytes: sample.tx_bytes,
        pids: sample.pids,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_is_scaled_by_online_cpus() {
        let stats = compute(StatsSample {
            cpu_total: 400,
            precpu_total: 200,
            cpu_system: 2_000,
            precpu_system: 1_000,
            online_cpus: 4,
            memory_usage: 512,
            memory_limit: 1024,
            rx_bytes: 10,
            tx_bytes: 20,
            pids: 3,
        });
        // (200 / 1000) * 4 cpus * 100 = 80%
        assert!((stats.cpu_percent - 80.0).abs() < f64::EPSILON);
        assert!((stats.memory_percent - 50.0).abs() < f64::EPSILON);
        assert_eq!(stats.pids, 3);
    }

    #[test]
    fn zero_deltas_and_limits_do_not_divide_by_zero() {
        let stats = compute(StatsSample::default());
        assert_eq!(stats.cpu_percent, 0.0);
        assert_eq!(stats.memory_percent, 0.0);
    }

    #[test]
    fn first_sample_after_start_reads_zero_cpu() {
        // precpu above cpu (counter reset) must clamp, not underflow.
        let stats = compute(StatsSample {
            cpu_total: 100,
            precpu_total: 500,
            cpu_system: 1_000,
            precpu_system: 900,
            online_cpus: 2,
            ..Default::default()
        });
        assert_eq!(stats.cpu_percent, 0.0);
    }
}

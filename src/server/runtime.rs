use std::fmt;

/// Where the worker-thread count came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuSource {
    Env,
    CgroupV2,
    CgroupV1,
    Host,
}

impl fmt::Display for CpuSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CpuSource::Env => "BASTION_CPU_LIMIT",
            CpuSource::CgroupV2 => "cgroup v2",
            CpuSource::CgroupV1 => "cgroup v1",
            CpuSource::Host => "host",
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CpuLimit {
    pub threads: usize,
    pub source: CpuSource,
}

/// Container-aware CPU limit for sizing the tokio worker pool.
///
/// Detection order:
/// 1. `BASTION_CPU_LIMIT` env var ("4" or "4000m")
/// 2. cgroup v2: `/sys/fs/cgroup/cpu.max`
/// 3. cgroup v1: `/sys/fs/cgroup/cpu/cpu.cfs_quota_us` + `cpu.cfs_period_us`
/// 4. `std::thread::available_parallelism()`
///
/// Fractional limits round up, so a half-core container still gets a worker.
pub fn container_cpu_limit() -> CpuLimit {
    if let Ok(raw) = std::env::var("BASTION_CPU_LIMIT") {
        if let Some(threads) = parse_cpu_value(&raw) {
            return CpuLimit {
                threads,
                source: CpuSource::Env,
            };
        }
    }

    if let Ok(max) = std::fs::read_to_string("/sys/fs/cgroup/cpu.max") {
        if let Some(threads) = parse_cgroup_v2_cpu(&max) {
            return CpuLimit {
                threads,
                source: CpuSource::CgroupV2,
            };
        }
    }

    if let (Ok(quota), Ok(period)) = (
        std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_quota_us"),
        std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_period_us"),
    ) {
        if let Some(threads) = parse_cgroup_v1_cpu(&quota, &period) {
            return CpuLimit {
                threads,
                source: CpuSource::CgroupV1,
            };
        }
    }

    CpuLimit {
        threads: std::thread::available_parallelism()
            .map(|p| p.get())
            .unwrap_or(1),
        source: CpuSource::Host,
    }
}

fn ceil_div(quota: u64, period: u64) -> usize {
    quota.div_ceil(period).max(1) as usize
}

/// "4" (cores) or "4000m" (millicores).
fn parse_cpu_value(value: &str) -> Option<usize> {
    let value = value.trim();
    if let Some(millis) = value.strip_suffix('m') {
        let millis: u64 = millis.parse().ok()?;
        (millis > 0).then(|| ceil_div(millis, 1000))
    } else {
        let cores: usize = value.parse().ok()?;
        (cores > 0).then_some(cores)
    }
}

/// cgroup v2 `cpu.max`: "quota period" or "max period".
fn parse_cgroup_v2_cpu(content: &str) -> Option<usize> {
    let mut parts = content.split_whitespace();
    let quota = parts.next()?;
    let period = parts.next()?;
    if quota == "max" {
        return None;
    }
    parse_cgroup_v1_cpu(quota, period)
}

fn parse_cgroup_v1_cpu(quota: &str, period: &str) -> Option<usize> {
    let quota: i64 = quota.trim().parse().ok()?;
    let period: i64 = period.trim().parse().ok()?;
    if quota > 0 && period > 0 {
        Some(ceil_div(quota as u64, period as u64))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpu_value_cores() {
        assert_eq!(parse_cpu_value("4"), Some(4));
        assert_eq!(parse_cpu_value("  8  "), Some(8));
        assert_eq!(parse_cpu_value("0"), None);
        assert_eq!(parse_cpu_value("four"), None);
    }

    #[test]
    fn test_parse_cpu_value_millicores() {
        assert_eq!(parse_cpu_value("4000m"), Some(4));
        assert_eq!(parse_cpu_value("1500m"), Some(2));
        assert_eq!(parse_cpu_value("500m"), Some(1));
        assert_eq!(parse_cpu_value("0m"), None);
    }

    #[test]
    fn test_parse_cgroup_v2_cpu() {
        assert_eq!(parse_cgroup_v2_cpu("400000 100000"), Some(4));
        assert_eq!(parse_cgroup_v2_cpu("50000 100000"), Some(1));
        assert_eq!(parse_cgroup_v2_cpu("max 100000"), None);
        assert_eq!(parse_cgroup_v2_cpu(""), None);
    }

    #[test]
    fn test_parse_cgroup_v1_cpu() {
        assert_eq!(parse_cgroup_v1_cpu("400000", "100000"), Some(4));
        assert_eq!(parse_cgroup_v1_cpu("-1", "100000"), None);
        assert_eq!(parse_cgroup_v1_cpu("0", "100000"), None);
    }

    #[test]
    fn test_limit_is_never_zero() {
        assert!(container_cpu_limit().threads >= 1);
    }
}

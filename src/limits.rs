use core::fmt;
use std::str::FromStr;

use nix::unistd::{sysconf, SysconfVar};

use crate::cgroup::{check_name, Error};

const MIN_CPU_PERIOD_US: u64 = 1_000;
const MAX_CPU_PERIOD_US: u64 = 1_000_000;
const MIN_CPU_QUOTA_US: u64 = 1_000;
const FALLBACK_PAGE_SIZE: u64 = 4096;

/// Granularity the kernel stores memory limits in.
pub fn page_size() -> u64 {
    match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(size)) if size > 0 => size as u64,
        _ => FALLBACK_PAGE_SIZE,
    }
}

/// Amount of memory in bytes.
///
/// Parses the same notation the kernel accepts for `memory.limit_in_bytes`:
/// a decimal number with an optional `K`, `M`, `G`, `T`, `P` or `E` suffix,
/// each a power of 1024.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MemorySize(u64);

impl MemorySize {
    pub const fn bytes(&self) -> u64 {
        self.0
    }
}

impl FromStr for MemorySize {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidSize(s.to_string());
        let trimmed = s.trim();
        let split = trimmed
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(trimmed.len());
        let (digits, suffix) = trimmed.split_at(split);
        if digits.is_empty() {
            return Err(invalid());
        }

        let shift = match suffix {
            "" => 0,
            "k" | "K" => 10,
            "m" | "M" => 20,
            "g" | "G" => 30,
            "t" | "T" => 40,
            "p" | "P" => 50,
            "e" | "E" => 60,
            _ => return Err(invalid()),
        };

        let value: u64 = digits.parse().map_err(|_| invalid())?;
        value
            .checked_mul(1u64 << shift)
            .map(MemorySize)
            .ok_or_else(invalid)
    }
}

impl fmt::Display for MemorySize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Desired limits of a named resource group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceGroupSpec {
    pub name: String,
    /// CPU time in microseconds the group may use per period.
    pub cpu_quota_us: u64,
    pub cpu_period_us: u64,
    pub memory_limit: MemorySize,
}

impl ResourceGroupSpec {
    pub fn new(name: impl Into<String>, cpu_quota_us: u64, cpu_period_us: u64, memory_limit: MemorySize) -> Self {
        Self {
            name: name.into(),
            cpu_quota_us,
            cpu_period_us,
            memory_limit,
        }
    }

    /// Checks the spec against a machine with `cores` CPUs.
    ///
    /// A quota larger than `period * cores` can never be consumed, so it is
    /// rejected rather than silently clamped.
    pub fn validate(&self, cores: usize) -> Result<(), Error> {
        check_name(&self.name)?;

        if !(MIN_CPU_PERIOD_US..=MAX_CPU_PERIOD_US).contains(&self.cpu_period_us) {
            return Err(Error::InvalidSpec(format!(
                "cpu period {}us outside [{}, {}]",
                self.cpu_period_us, MIN_CPU_PERIOD_US, MAX_CPU_PERIOD_US
            )));
        }

        if self.cpu_quota_us < MIN_CPU_QUOTA_US {
            return Err(Error::InvalidSpec(format!(
                "cpu quota {}us is below {}us",
                self.cpu_quota_us, MIN_CPU_QUOTA_US
            )));
        }

        let ceiling = self.cpu_period_us.saturating_mul(cores.max(1) as u64);
        if self.cpu_quota_us > ceiling {
            return Err(Error::InvalidSpec(format!(
                "cpu quota {}us exceeds period {}us x {} cores",
                self.cpu_quota_us, self.cpu_period_us, cores
            )));
        }

        if self.memory_limit.bytes() == 0 {
            return Err(Error::InvalidSpec("memory limit must be positive".to_string()));
        }

        Ok(())
    }
}

/// Values currently present in a group's control files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// `-1` when the group has no CPU bandwidth limit.
    pub cpu_quota_us: i64,
    pub cpu_period_us: u64,
    pub memory_limit: u64,
}

impl Limits {
    pub fn matches(&self, spec: &ResourceGroupSpec) -> bool {
        self.matches_in_pages(spec, page_size())
    }

    /// Compares against `spec` the way the kernel applied it. The memory
    /// limit is kept in whole pages of `page_size` bytes, rounded down, while
    /// a plain directory keeps the bytes as written.
    pub fn matches_in_pages(&self, spec: &ResourceGroupSpec, page_size: u64) -> bool {
        let page_size = page_size.max(1);
        let bytes = spec.memory_limit.bytes();
        let memory_matches = self.memory_limit == bytes || self.memory_limit == bytes / page_size * page_size;
        self.cpu_quota_us == spec.cpu_quota_us as i64 && self.cpu_period_us == spec.cpu_period_us && memory_matches
    }
}

#[cfg(test)]
mod tests {
    use super::{page_size, Limits, MemorySize, ResourceGroupSpec};
    use crate::cgroup::Error;

    fn spec(quota: u64, period: u64, mem: &str) -> ResourceGroupSpec {
        ResourceGroupSpec::new("signal_cli_cgroup", quota, period, mem.parse().unwrap())
    }

    #[test]
    fn given_suffixed_sizes_then_binary_multiples() {
        assert_eq!("750M".parse::<MemorySize>().unwrap().bytes(), 786_432_000);
        assert_eq!("512k".parse::<MemorySize>().unwrap().bytes(), 524_288);
        assert_eq!("2G".parse::<MemorySize>().unwrap().bytes(), 2 * 1024 * 1024 * 1024);
        assert_eq!("4096".parse::<MemorySize>().unwrap().bytes(), 4096);
    }

    #[test]
    fn given_malformed_sizes_then_rejected() {
        for input in ["", "M", "750MB", "7.5G", "-1", "16E", "99999999999999999999"] {
            let outcome = input.parse::<MemorySize>();
            assert!(matches!(outcome, Err(Error::InvalidSize(_))), "{:?}", input);
        }
    }

    #[test]
    fn given_default_spec_then_valid_on_single_core() {
        assert!(spec(25_000, 100_000, "750M").validate(1).is_ok());
    }

    #[test]
    fn given_quota_above_all_cores_then_rejected() {
        let quota_for_three = spec(300_000, 100_000, "750M");
        assert!(matches!(quota_for_three.validate(2), Err(Error::InvalidSpec(_))));
        assert!(quota_for_three.validate(3).is_ok());
    }

    #[test]
    fn given_out_of_range_period_or_quota_then_rejected() {
        assert!(spec(25_000, 999, "750M").validate(4).is_err());
        assert!(spec(25_000, 1_000_001, "750M").validate(4).is_err());
        assert!(spec(999, 100_000, "750M").validate(4).is_err());
    }

    #[test]
    fn given_zero_memory_then_rejected() {
        assert!(matches!(spec(25_000, 100_000, "0").validate(1), Err(Error::InvalidSpec(_))));
    }

    #[test]
    fn given_bad_name_then_rejected() {
        let mut bad = spec(25_000, 100_000, "750M");
        bad.name = "../escape".to_string();
        assert!(matches!(bad.validate(1), Err(Error::InvalidName(_))));
    }

    #[test]
    fn given_limits_equal_to_spec_then_matches() {
        let wanted = spec(25_000, 100_000, "750M");
        let mut limits = Limits { cpu_quota_us: 25_000, cpu_period_us: 100_000, memory_limit: 786_432_000 };
        assert!(limits.matches(&wanted));
        limits.cpu_quota_us = -1;
        assert!(!limits.matches(&wanted));
    }

    #[test]
    fn given_limit_off_page_boundary_then_matches_rounded_read_back() {
        let wanted = spec(25_000, 100_000, "1000000");
        let stored = Limits { cpu_quota_us: 25_000, cpu_period_us: 100_000, memory_limit: 999_424 };
        assert!(stored.matches_in_pages(&wanted, 4096));
        assert!(!stored.matches_in_pages(&wanted, 1));

        let verbatim = Limits { memory_limit: 1_000_000, ..stored };
        assert!(verbatim.matches_in_pages(&wanted, 4096));

        let page_short = Limits { memory_limit: 995_328, ..stored };
        assert!(!page_short.matches_in_pages(&wanted, 4096));
    }

    #[test]
    fn given_host_then_page_size_is_power_of_two() {
        assert!(page_size().is_power_of_two());
    }
}

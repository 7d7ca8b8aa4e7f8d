//! Resource vectors and Kubernetes quantity parsing.
//!
//! CPU is tracked in millicores and memory in MiB. Integer units keep
//! packing decisions exact and therefore reproducible across runs.

use std::iter::Sum;
use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const MIB: f64 = 1024.0 * 1024.0;

/// Errors raised while parsing a resource quantity string.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QuantityError {
    #[error("empty quantity")]
    Empty,

    #[error("invalid number in quantity {0:?}")]
    Number(String),

    #[error("unknown suffix in quantity {0:?}")]
    Suffix(String),

    #[error("negative quantity {0:?}")]
    Negative(String),
}

/// A cpu/memory pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resources {
    /// CPU in millicores.
    pub cpu_millis: u64,
    /// Memory in MiB.
    pub memory_mib: u64,
}

impl Resources {
    pub const ZERO: Resources = Resources {
        cpu_millis: 0,
        memory_mib: 0,
    };

    pub const fn new(cpu_millis: u64, memory_mib: u64) -> Self {
        Self {
            cpu_millis,
            memory_mib,
        }
    }

    /// Whole cores and GiB, mostly for tests and config defaults.
    pub const fn cores_gib(cores: u64, gib: u64) -> Self {
        Self::new(cores * 1000, gib * 1024)
    }

    /// True when both dimensions of `self` fit inside `other`.
    pub fn fits_within(&self, other: &Resources) -> bool {
        self.cpu_millis <= other.cpu_millis && self.memory_mib <= other.memory_mib
    }

    pub fn is_zero(&self) -> bool {
        self.cpu_millis == 0 && self.memory_mib == 0
    }

    pub fn saturating_sub(self, other: Resources) -> Resources {
        Resources {
            cpu_millis: self.cpu_millis.saturating_sub(other.cpu_millis),
            memory_mib: self.memory_mib.saturating_sub(other.memory_mib),
        }
    }

    /// Subtract, or `None` if either dimension would go negative.
    pub fn checked_sub(self, other: Resources) -> Option<Resources> {
        Some(Resources {
            cpu_millis: self.cpu_millis.checked_sub(other.cpu_millis)?,
            memory_mib: self.memory_mib.checked_sub(other.memory_mib)?,
        })
    }

    /// Component-wise minimum.
    pub fn min(self, other: Resources) -> Resources {
        Resources {
            cpu_millis: self.cpu_millis.min(other.cpu_millis),
            memory_mib: self.memory_mib.min(other.memory_mib),
        }
    }

    /// Component-wise maximum.
    pub fn max(self, other: Resources) -> Resources {
        Resources {
            cpu_millis: self.cpu_millis.max(other.cpu_millis),
            memory_mib: self.memory_mib.max(other.memory_mib),
        }
    }

    /// Best-fit ordering key: cpu first, memory second.
    pub fn fit_key(&self) -> (u64, u64) {
        (self.cpu_millis, self.memory_mib)
    }
}

impl Add for Resources {
    type Output = Resources;

    fn add(self, rhs: Resources) -> Resources {
        Resources {
            cpu_millis: self.cpu_millis.saturating_add(rhs.cpu_millis),
            memory_mib: self.memory_mib.saturating_add(rhs.memory_mib),
        }
    }
}

impl AddAssign for Resources {
    fn add_assign(&mut self, rhs: Resources) {
        *self = *self + rhs;
    }
}

impl Sum for Resources {
    fn sum<I: Iterator<Item = Resources>>(iter: I) -> Resources {
        iter.fold(Resources::ZERO, |acc, r| acc + r)
    }
}

impl std::fmt::Display for Resources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}m/{}Mi", self.cpu_millis, self.memory_mib)
    }
}

/// Utilization of a node: `max(cpuUsed/cpuCapacity, memUsed/memCapacity)`.
///
/// A zero-capacity dimension contributes nothing.
pub fn utilization(used: Resources, capacity: Resources) -> f64 {
    let ratio = |used: u64, cap: u64| {
        if cap == 0 {
            0.0
        } else {
            used as f64 / cap as f64
        }
    };
    ratio(used.cpu_millis, capacity.cpu_millis).max(ratio(used.memory_mib, capacity.memory_mib))
}

/// Parse a Kubernetes cpu quantity (`"500m"`, `"2"`, `"1.5"`) into millicores.
pub fn parse_cpu_millis(s: &str) -> Result<u64, QuantityError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(QuantityError::Empty);
    }
    let (number, scale) = match s.strip_suffix('m') {
        Some(n) => (n, 1.0),
        None => (s, 1000.0),
    };
    let value = parse_number(number, s)?;
    Ok((value * scale).ceil() as u64)
}

/// Parse a Kubernetes memory quantity into bytes.
///
/// Supports binary (`Ki`, `Mi`, `Gi`, `Ti`) and decimal (`k`, `K`, `M`,
/// `G`, `T`) suffixes; a bare number is bytes.
pub fn parse_memory_bytes(s: &str) -> Result<u64, QuantityError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(QuantityError::Empty);
    }
    let split = s
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);
    let multiplier: f64 = match suffix {
        "" => 1.0,
        "Ki" => 1024.0,
        "Mi" => MIB,
        "Gi" => MIB * 1024.0,
        "Ti" => MIB * 1024.0 * 1024.0,
        "k" | "K" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        _ => return Err(QuantityError::Suffix(s.to_string())),
    };
    let value = parse_number(number, s)?;
    Ok((value * multiplier).round() as u64)
}

/// Memory request in MiB, rounded up so requests are never under-counted.
pub fn parse_memory_mib_ceil(s: &str) -> Result<u64, QuantityError> {
    Ok((parse_memory_bytes(s)? as f64 / MIB).ceil() as u64)
}

/// Memory capacity in MiB, rounded down so capacity is never over-counted.
pub fn parse_memory_mib_floor(s: &str) -> Result<u64, QuantityError> {
    Ok((parse_memory_bytes(s)? as f64 / MIB).floor() as u64)
}

fn parse_number(number: &str, original: &str) -> Result<f64, QuantityError> {
    let value: f64 = number
        .parse()
        .map_err(|_| QuantityError::Number(original.to_string()))?;
    if !value.is_finite() {
        return Err(QuantityError::Number(original.to_string()));
    }
    if value < 0.0 {
        return Err(QuantityError::Negative(original.to_string()));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_quantities() {
        assert_eq!(parse_cpu_millis("500m").unwrap(), 500);
        assert_eq!(parse_cpu_millis("2").unwrap(), 2000);
        assert_eq!(parse_cpu_millis("1.5").unwrap(), 1500);
        assert_eq!(parse_cpu_millis(" 250m ").unwrap(), 250);
        assert_eq!(parse_cpu_millis(""), Err(QuantityError::Empty));
        assert!(matches!(parse_cpu_millis("abc"), Err(QuantityError::Number(_))));
        assert!(matches!(parse_cpu_millis("-1"), Err(QuantityError::Negative(_))));
    }

    #[test]
    fn memory_quantities() {
        assert_eq!(parse_memory_mib_ceil("512Mi").unwrap(), 512);
        assert_eq!(parse_memory_mib_ceil("4Gi").unwrap(), 4096);
        assert_eq!(parse_memory_mib_ceil("1024Ki").unwrap(), 1);
        assert_eq!(parse_memory_mib_ceil("1.5Gi").unwrap(), 1536);
        assert_eq!(parse_memory_bytes("1G").unwrap(), 1_000_000_000);
        assert_eq!(parse_memory_bytes("2048").unwrap(), 2048);
        assert!(matches!(parse_memory_bytes("3Xi"), Err(QuantityError::Suffix(_))));
    }

    #[test]
    fn memory_rounding_direction() {
        // 1G = 953.67 MiB
        assert_eq!(parse_memory_mib_ceil("1G").unwrap(), 954);
        assert_eq!(parse_memory_mib_floor("1G").unwrap(), 953);
    }

    #[test]
    fn fits_and_arithmetic() {
        let node = Resources::cores_gib(2, 4);
        let pod = Resources::new(1000, 1024);
        assert!(pod.fits_within(&node));
        assert!(!Resources::new(2001, 0).fits_within(&node));
        assert_eq!(node.checked_sub(pod), Some(Resources::new(1000, 3072)));
        assert_eq!(pod.checked_sub(node), None);
        assert_eq!(pod.saturating_sub(node), Resources::ZERO);
        let total: Resources = vec![pod, pod].into_iter().sum();
        assert_eq!(total, Resources::new(2000, 2048));
    }

    #[test]
    fn utilization_takes_the_larger_dimension() {
        let cap = Resources::cores_gib(2, 4);
        let used = Resources::new(400, 2048);
        assert!((utilization(used, cap) - 0.5).abs() < 1e-9);
        assert_eq!(utilization(used, Resources::ZERO), 0.0);
    }
}

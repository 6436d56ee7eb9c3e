//! Resource vectors and pricing.
//!
//! A [`ResourceVector`] is used both as an agent's advertised capability and
//! as a job's or bid's requirement. Money is a fixed-point [`Price`] counted
//! in micro-dollars so matching never compares floats.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Micro-dollars per dollar.
pub const MICROS_PER_DOLLAR: u64 = 1_000_000;

const SECS_PER_HOUR: u128 = 3600;
const MB_PER_GB: u128 = 1024;

/// Capacity or requirement vector.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ResourceVector {
    /// CPU cores.
    pub cpu_cores: u32,
    /// Memory in MiB.
    pub memory_mb: u64,
    /// Number of GPUs.
    #[serde(default)]
    pub gpu_count: u32,
    /// GPU model. On a requirement, the capability must carry the same model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_model: Option<String>,
    /// Storage in MiB.
    #[serde(default)]
    pub storage_mb: u64,
    /// Network bandwidth in Mbit/s.
    #[serde(default)]
    pub network_mbps: u32,
}

/// Capacity left over after placing a requirement on a capability.
///
/// Field order is the comparison order used for best-fit: GPUs are the
/// scarcest resource, so wasting them weighs most.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Leftover {
    /// Unused GPUs.
    pub gpu_count: u32,
    /// Unused CPU cores.
    pub cpu_cores: u32,
    /// Unused memory in MiB.
    pub memory_mb: u64,
    /// Unused storage in MiB.
    pub storage_mb: u64,
    /// Unused bandwidth in Mbit/s.
    pub network_mbps: u32,
}

impl ResourceVector {
    /// A CPU/memory-only vector.
    #[must_use]
    pub const fn new(cpu_cores: u32, memory_mb: u64) -> Self {
        Self {
            cpu_cores,
            memory_mb,
            gpu_count: 0,
            gpu_model: None,
            storage_mb: 0,
            network_mbps: 0,
        }
    }

    /// Set GPU count.
    #[must_use]
    pub const fn with_gpus(mut self, count: u32) -> Self {
        self.gpu_count = count;
        self
    }

    /// Set GPU model.
    #[must_use]
    pub fn with_gpu_model(mut self, model: impl Into<String>) -> Self {
        self.gpu_model = Some(model.into());
        self
    }

    /// Set storage.
    #[must_use]
    pub const fn with_storage_mb(mut self, storage_mb: u64) -> Self {
        self.storage_mb = storage_mb;
        self
    }

    /// Set network bandwidth.
    #[must_use]
    pub const fn with_network_mbps(mut self, network_mbps: u32) -> Self {
        self.network_mbps = network_mbps;
        self
    }

    /// Whether this capability satisfies `required` component-wise.
    ///
    /// When `required` names a GPU model, this vector must name the same one.
    #[must_use]
    pub fn dominates(&self, required: &Self) -> bool {
        if let Some(model) = &required.gpu_model {
            if self.gpu_model.as_deref() != Some(model.as_str()) {
                return false;
            }
        }

        self.cpu_cores >= required.cpu_cores
            && self.memory_mb >= required.memory_mb
            && self.gpu_count >= required.gpu_count
            && self.storage_mb >= required.storage_mb
            && self.network_mbps >= required.network_mbps
    }

    /// Capacity left after placing `required`, or `None` if it does not fit.
    #[must_use]
    pub fn leftover(&self, required: &Self) -> Option<Leftover> {
        if !self.dominates(required) {
            return None;
        }
        Some(Leftover {
            gpu_count: self.gpu_count - required.gpu_count,
            cpu_cores: self.cpu_cores - required.cpu_cores,
            memory_mb: self.memory_mb - required.memory_mb,
            storage_mb: self.storage_mb - required.storage_mb,
            network_mbps: self.network_mbps - required.network_mbps,
        })
    }
}

impl fmt::Display for ResourceVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu={} mem={}MiB", self.cpu_cores, self.memory_mb)?;
        if self.gpu_count > 0 {
            write!(f, " gpu={}", self.gpu_count)?;
            if let Some(model) = &self.gpu_model {
                write!(f, "x{model}")?;
            }
        }
        Ok(())
    }
}

/// Amount of money in micro-dollars.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Price(u64);

impl Price {
    /// Zero.
    pub const ZERO: Self = Self(0);

    /// From micro-dollars.
    #[must_use]
    pub const fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    /// From whole cents.
    #[must_use]
    pub const fn from_cents(cents: u64) -> Self {
        Self(cents.saturating_mul(MICROS_PER_DOLLAR / 100))
    }

    /// From whole dollars.
    #[must_use]
    pub const fn from_dollars(dollars: u64) -> Self {
        Self(dollars.saturating_mul(MICROS_PER_DOLLAR))
    }

    /// Value in micro-dollars.
    #[must_use]
    pub const fn as_micros(self) -> u64 {
        self.0
    }

    /// Whether this is zero.
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Saturating addition.
    #[must_use]
    pub const fn saturating_add(self, rhs: Self) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }

    /// Cost of running at this hourly price for `duration`, rounded up to the micro-dollar.
    #[must_use]
    pub fn for_duration(self, duration: Duration) -> Self {
        let micros = u128::from(self.0) * u128::from(duration.as_secs());
        Self::saturating_from_u128(micros.div_ceil(SECS_PER_HOUR))
    }

    fn saturating_from_u128(value: u128) -> Self {
        Self(u64::try_from(value).unwrap_or(u64::MAX))
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0 / MICROS_PER_DOLLAR;
        let frac = self.0 % MICROS_PER_DOLLAR;
        write!(f, "${whole}.{frac:06}")
    }
}

/// Hourly price breakdown per resource unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RateSheet {
    /// Per CPU core per hour.
    #[serde(default)]
    pub per_cpu_core_hour: Price,
    /// Per GiB of memory per hour.
    #[serde(default)]
    pub per_gb_memory_hour: Price,
    /// Per GPU per hour.
    #[serde(default)]
    pub per_gpu_hour: Price,
    /// Per GiB of storage per hour.
    #[serde(default)]
    pub per_gb_storage_hour: Price,
}

impl RateSheet {
    /// Rates used to estimate the escrow for directly submitted jobs:
    /// $0.05/core-hour, $0.01/GiB-hour memory, $0.50/GPU-hour, $0.001/GiB-hour storage.
    pub const REFERENCE: Self = Self {
        per_cpu_core_hour: Price::from_micros(50_000),
        per_gb_memory_hour: Price::from_micros(10_000),
        per_gpu_hour: Price::from_micros(500_000),
        per_gb_storage_hour: Price::from_micros(1_000),
    };

    /// A sheet that only charges for CPU.
    #[must_use]
    pub const fn per_cpu_core(rate: Price) -> Self {
        Self {
            per_cpu_core_hour: rate,
            per_gb_memory_hour: Price::ZERO,
            per_gpu_hour: Price::ZERO,
            per_gb_storage_hour: Price::ZERO,
        }
    }

    /// Whether every rate is zero.
    #[must_use]
    pub const fn is_free(&self) -> bool {
        self.per_cpu_core_hour.is_zero()
            && self.per_gb_memory_hour.is_zero()
            && self.per_gpu_hour.is_zero()
            && self.per_gb_storage_hour.is_zero()
    }

    /// Effective hourly price of the requested quantities.
    #[must_use]
    pub fn hourly_cost(&self, requested: &ResourceVector) -> Price {
        let cpu = u128::from(self.per_cpu_core_hour.0) * u128::from(requested.cpu_cores);
        let gpu = u128::from(self.per_gpu_hour.0) * u128::from(requested.gpu_count);
        let memory = (u128::from(self.per_gb_memory_hour.0) * u128::from(requested.memory_mb))
            .div_ceil(MB_PER_GB);
        let storage = (u128::from(self.per_gb_storage_hour.0) * u128::from(requested.storage_mb))
            .div_ceil(MB_PER_GB);
        Price::saturating_from_u128(cpu + gpu + memory + storage)
    }

    /// Total cost of the requested quantities over `duration`.
    #[must_use]
    pub fn cost_for(&self, requested: &ResourceVector, duration: Duration) -> Price {
        self.hourly_cost(requested).for_duration(duration)
    }
}

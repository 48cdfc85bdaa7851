//! Configuration structures for the exchange coordinator.
//!
//! Supports TOML deserialization with sensible defaults for
//! development and explicit values for production deployment.

use crate::error::{PdxError, PdxResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level exchange configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    /// Index of the bus master to request.
    pub master_index: u32,

    /// Cycle frequency of the periodic task in Hz.
    pub frequency_hz: u32,

    /// Trailing part of each period in which asynchronous lock
    /// requests are refused.
    #[serde(with = "humantime_serde")]
    pub inhibit_time: Duration,

    /// Cycles between status samples (defaults to one second of cycles).
    pub status_interval_cycles: Option<u32>,

    /// Periodic task parameters.
    pub task: TaskConfig,

    /// Real-time thread configuration.
    pub realtime: RealtimeConfig,

    /// Static process-variable mapping table.
    pub bindings: Vec<BindingConfig>,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            master_index: 0,
            frequency_hz: 2000,
            inhibit_time: Duration::from_micros(20),
            status_interval_cycles: None,
            task: TaskConfig::default(),
            realtime: RealtimeConfig::default(),
            bindings: Vec::new(),
        }
    }
}

/// Periodic task parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Thread name of the periodic task.
    pub name: String,

    /// Task priority (1-99, higher is more urgent).
    pub priority: u8,

    /// Stack size of the task thread in bytes.
    pub stack_size: usize,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            name: String::from("pdx-cyclic"),
            priority: 90,
            stack_size: 256 * 1024,
        }
    }
}

/// Real-time scheduling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Enable real-time scheduling (requires privileges).
    pub enabled: bool,

    /// Scheduler policy: "fifo", "rr" (round-robin) or "other".
    pub policy: SchedPolicy,

    /// CPU affinity for the RT thread.
    pub cpu_affinity: CpuAffinity,

    /// Lock all memory pages (mlockall).
    pub lock_memory: bool,

    /// Fail immediately at startup if RT requirements cannot be met.
    pub fail_fast: bool,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            policy: SchedPolicy::Fifo,
            cpu_affinity: CpuAffinity::None,
            lock_memory: true,
            fail_fast: false,
        }
    }
}

/// Scheduler policy for real-time threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SchedPolicy {
    /// SCHED_FIFO: First-in-first-out real-time.
    #[default]
    Fifo,
    /// SCHED_RR: Round-robin real-time.
    Rr,
    /// SCHED_OTHER: Normal time-sharing (non-RT).
    Other,
}

/// CPU affinity specification.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CpuAffinity {
    /// No affinity set (OS chooses).
    #[default]
    None,
    /// Pin to a single CPU core.
    Single(usize),
    /// Pin to a set of CPU cores.
    Set(Vec<usize>),
}

impl Serialize for CpuAffinity {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            CpuAffinity::None => serializer.serialize_none(),
            CpuAffinity::Single(cpu) => serializer.serialize_u64(*cpu as u64),
            CpuAffinity::Set(cpus) => cpus.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for CpuAffinity {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::{self, Visitor};

        struct CpuAffinityVisitor;

        impl<'de> Visitor<'de> for CpuAffinityVisitor {
            type Value = CpuAffinity;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("null, an integer, or an array of integers")
            }

            fn visit_none<E>(self) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(CpuAffinity::None)
            }

            fn visit_unit<E>(self) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(CpuAffinity::None)
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                usize::try_from(value)
                    .map(CpuAffinity::Single)
                    .map_err(|_| de::Error::custom("CPU index out of range"))
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                usize::try_from(value)
                    .map(CpuAffinity::Single)
                    .map_err(|_| de::Error::custom("CPU index cannot be negative"))
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: de::SeqAccess<'de>,
            {
                let mut cpus = Vec::new();
                while let Some(cpu) = seq.next_element::<usize>()? {
                    cpus.push(cpu);
                }
                Ok(CpuAffinity::Set(cpus))
            }
        }

        deserializer.deserialize_any(CpuAffinityVisitor)
    }
}

/// One entry of the static process-variable mapping table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingConfig {
    /// Name the application uses to address the variable.
    pub name: String,

    /// Slave address: `"<position>"` or `"#<alias>:<position>"`.
    pub slave: String,

    /// Expected vendor id of the slave.
    pub vendor_id: u32,

    /// Expected product code of the slave.
    pub product_code: u32,

    /// Object dictionary index of the mapped entry.
    pub index: u16,

    /// Object dictionary subindex of the mapped entry.
    pub subindex: u8,

    /// Width of the entry in bits.
    pub bit_len: u8,
}

impl ExchangeConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(ConfigError::Parse)
    }

    /// Serialize configuration to TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Duration of one cycle.
    ///
    /// Returns zero for a zero frequency; [`validate`](Self::validate) rejects that.
    #[must_use]
    pub fn cycle_period(&self) -> Duration {
        if self.frequency_hz == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(1_000_000_000 / u64::from(self.frequency_hz))
    }

    /// Sub-period counter reset value.
    #[must_use]
    pub fn status_interval(&self) -> u32 {
        self.status_interval_cycles.unwrap_or(self.frequency_hz).max(1)
    }

    /// Check the configuration for values the runtime cannot honour.
    ///
    /// # Errors
    ///
    /// Returns [`PdxError::Config`] describing the first violation.
    pub fn validate(&self) -> PdxResult<()> {
        if self.frequency_hz == 0 {
            return Err(PdxError::Config("frequency_hz must be positive".into()));
        }
        if self.frequency_hz > 1_000_000_000 {
            return Err(PdxError::Config(format!(
                "frequency_hz {} exceeds the nanosecond timebase",
                self.frequency_hz
            )));
        }

        let period = self.cycle_period();
        if self.inhibit_time.is_zero() || self.inhibit_time > period {
            return Err(PdxError::Config(format!(
                "inhibit_time {} must be positive and at most the cycle period {}",
                humantime::format_duration(self.inhibit_time),
                humantime::format_duration(period)
            )));
        }

        if self.status_interval_cycles == Some(0) {
            return Err(PdxError::Config(
                "status_interval_cycles must be positive".into(),
            ));
        }

        if !(1..=99).contains(&self.task.priority) {
            return Err(PdxError::Config(format!(
                "task priority {} outside 1-99",
                self.task.priority
            )));
        }

        let mut names = HashSet::new();
        for binding in &self.bindings {
            if binding.bit_len == 0 || binding.bit_len > 32 {
                return Err(PdxError::Config(format!(
                    "binding {}: bit_len {} outside 1-32",
                    binding.name, binding.bit_len
                )));
            }
            if !names.insert(binding.name.as_str()) {
                return Err(PdxError::Config(format!(
                    "duplicate binding name {}",
                    binding.name
                )));
            }
        }

        Ok(())
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File I/O error.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// TOML parsing error.
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Serde helper module for `Duration` using humantime format.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

//! Topology configuration file
//!
//! Describes the policy-groups of a machine and the frequencies each one
//! can run at. Frequencies get 1-based indices in the order listed.
//!
//! # Example
//!
//! ```toml
//! [engine]
//! max_cpus = 8
//! max_policies = 2
//!
//! [[policy]]
//! id = 0
//! cpus = [0, 1, 2, 3]
//! frequencies = [300000, 576000, 1017600, 1804800]
//!
//! [[policy]]
//! id = 4
//! cpus = [4, 5, 6, 7]
//! frequencies = [652800, 1497600, 2419200]
//! ```

use crate::clock::{MonotonicClock, SystemClock};
use crate::engine::{Engine, EngineConfig};
use crate::topology::{CpuId, FreqKhz, PolicyId, TopologyError, MAX_FREQ_INDEX};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid topology file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("engine.{field} must be > 0")]
    ZeroCapacity { field: &'static str },

    #[error("policy {policy} has no cpus")]
    EmptyPolicy { policy: PolicyId },

    #[error("policy {policy} is listed twice")]
    DuplicatePolicy { policy: PolicyId },

    #[error("cpu {cpu} is assigned to both policy {first} and policy {second}")]
    DuplicateCpu {
        cpu: CpuId,
        first: PolicyId,
        second: PolicyId,
    },

    #[error("policy {policy} lists {count} frequencies, at most {max} are trackable", max = MAX_FREQ_INDEX)]
    TooManyFrequencies { policy: PolicyId, count: usize },

    #[error(transparent)]
    Topology(#[from] TopologyError),
}

/// One policy-group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub id: PolicyId,
    pub cpus: Vec<CpuId>,
    #[serde(default)]
    pub frequencies: Vec<FreqKhz>,
}

/// Contents of a topology file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default, rename = "policy")]
    pub policies: Vec<PolicyConfig>,
}

impl TopologyConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&text)?;
        tracing::debug!(
            path = %path.display(),
            policies = config.policies.len(),
            "loaded topology"
        );
        Ok(config)
    }

    /// Parse and validate
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check capacities and that every CPU belongs to one policy at most
    ///
    /// Range checks against `max_cpus` / `max_policies` happen when the
    /// engine is built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let engine = &self.engine;
        for (field, value) in [
            ("max_cpus", engine.max_cpus),
            ("max_policies", engine.max_policies),
            ("time_in_state_capacity", engine.time_in_state_capacity),
            ("concurrent_capacity", engine.concurrent_capacity),
            ("freq_index_capacity", engine.freq_index_capacity),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroCapacity { field });
            }
        }

        let mut seen_policies = HashSet::new();
        let mut owner: HashMap<CpuId, PolicyId> = HashMap::new();
        for policy in &self.policies {
            if !seen_policies.insert(policy.id) {
                return Err(ConfigError::DuplicatePolicy { policy: policy.id });
            }
            if policy.cpus.is_empty() {
                return Err(ConfigError::EmptyPolicy { policy: policy.id });
            }
            if policy.frequencies.len() > MAX_FREQ_INDEX as usize {
                return Err(ConfigError::TooManyFrequencies {
                    policy: policy.id,
                    count: policy.frequencies.len(),
                });
            }
            for &cpu in &policy.cpus {
                if let Some(&first) = owner.get(&cpu) {
                    if first != policy.id {
                        return Err(ConfigError::DuplicateCpu {
                            cpu,
                            first,
                            second: policy.id,
                        });
                    }
                }
                owner.insert(cpu, policy.id);
            }
        }
        Ok(())
    }

    /// Populate the topology tables of `engine`
    pub fn apply<C: MonotonicClock>(&self, engine: &Engine<C>) -> Result<(), ConfigError> {
        let topology = engine.topology();
        for policy in &self.policies {
            for &cpu in &policy.cpus {
                topology.set_cpu_policy(cpu, policy.id)?;
            }
            topology.set_policy_frequencies(policy.id, &policy.frequencies)?;
        }
        Ok(())
    }

    /// New engine with this topology, timed by the system clock
    pub fn build_engine(&self) -> Result<Engine<SystemClock>, ConfigError> {
        self.build_engine_with_clock(SystemClock::new())
    }

    pub fn build_engine_with_clock<C: MonotonicClock>(
        &self,
        clock: C,
    ) -> Result<Engine<C>, ConfigError> {
        self.validate()?;
        let engine = Engine::with_clock(self.engine.clone(), clock);
        self.apply(&engine)?;
        Ok(engine)
    }
}

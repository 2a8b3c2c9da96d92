use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunProfile {
    Stepper,   // 400ms per cycle, 1K cycle bound
    Classroom, // 100ms per cycle, 10K cycle bound
    Standard,  // unpaced, 100K cycle bound
    Turbo,     // unpaced, unbounded
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLimits {
    pub max_cycles: Option<u64>,
    pub cycle_delay_ms: u64,
}

impl RunLimits {
    pub fn cycle_delay(&self) -> Duration {
        Duration::from_millis(self.cycle_delay_ms)
    }
}

impl RunProfile {
    pub fn get_limits(&self) -> RunLimits {
        match self {
            RunProfile::Stepper => RunLimits {
                max_cycles: Some(1_000),
                cycle_delay_ms: 400,
            },
            RunProfile::Classroom => RunLimits {
                max_cycles: Some(10_000),
                cycle_delay_ms: 100,
            },
            RunProfile::Standard => RunLimits {
                max_cycles: Some(100_000),
                cycle_delay_ms: 0,
            },
            RunProfile::Turbo => RunLimits {
                max_cycles: None,
                cycle_delay_ms: 0,
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunProfile::Stepper => "stepper",
            RunProfile::Classroom => "classroom",
            RunProfile::Standard => "standard",
            RunProfile::Turbo => "turbo",
        }
    }
}

impl Default for RunProfile {
    fn default() -> Self {
        RunProfile::Standard
    }
}

impl std::str::FromStr for RunProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stepper" => Ok(RunProfile::Stepper),
            "classroom" => Ok(RunProfile::Classroom),
            "standard" => Ok(RunProfile::Standard),
            "turbo" => Ok(RunProfile::Turbo),
            other => Err(format!("unknown run profile '{other}'")),
        }
    }
}

/// Engine settings for one execution controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Cycles allowed before the run faults with `CycleLimitExceeded`.
    pub max_cycles: Option<u64>,
    /// Cells shown around the point of interest in memory views.
    #[serde(default = "default_memory_window")]
    pub memory_window: usize,
}

fn default_memory_window() -> usize {
    16
}

impl EngineConfig {
    pub fn from_profile(profile: RunProfile) -> Self {
        Self {
            max_cycles: profile.get_limits().max_cycles,
            memory_window: default_memory_window(),
        }
    }

    pub fn unbounded() -> Self {
        Self {
            max_cycles: None,
            memory_window: default_memory_window(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_profile(RunProfile::default())
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub default_profile: RunProfile,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 3030)),
            default_profile: RunProfile::default(),
        }
    }
}

//! Observer and adapter configuration.

use crate::{ObservationSpec, SignalThreshold};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObserverConfig {
    /// How long signals are watched after a plan finishes.
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default)]
    pub signals: Vec<SignalThreshold>,

    /// Also track the standard host/service thresholds.
    #[serde(default)]
    pub standard_signals: bool,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            signals: Vec::new(),
            standard_signals: false,
        }
    }
}

impl ObserverConfig {
    /// Standard thresholds: cpu/memory/disk usage in percent, response time
    /// in seconds, error rate in percent.
    pub fn standard_thresholds() -> Vec<SignalThreshold> {
        vec![
            SignalThreshold::at_most("cpu_usage", 80.0),
            SignalThreshold::at_most("memory_usage", 85.0),
            SignalThreshold::at_most("disk_usage", 90.0),
            SignalThreshold::at_most("response_time", 2.0),
            SignalThreshold::at_most("error_rate", 5.0),
        ]
    }

    /// Explicit signals first; standard ones are added unless a signal of the
    /// same name is already configured.
    pub fn tracked_signals(&self) -> Vec<SignalThreshold> {
        let mut signals = self.signals.clone();
        if self.standard_signals {
            for standard in Self::standard_thresholds() {
                if !signals.iter().any(|s| s.name == standard.name) {
                    signals.push(standard);
                }
            }
        }
        signals
    }

    /// Observation metadata stamped onto every plan at build time.
    pub fn observation_spec(&self) -> ObservationSpec {
        ObservationSpec {
            window_ms: self.window_ms,
            poll_interval_ms: self.poll_interval_ms,
            signals: self.tracked_signals(),
        }
    }
}

/// What the adapter does with a `degraded` outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DegradedPolicy {
    /// Watch one more window; demote if it is still degraded.
    #[default]
    Reobserve,
    /// Demote the plan's actions to simulate-only right away.
    Demote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterConfig {
    #[serde(default)]
    pub on_degraded: DegradedPolicy,

    /// How long a demotion lasts.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            on_degraded: DegradedPolicy::default(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

fn default_window_ms() -> u64 {
    300_000
}

fn default_poll_interval_ms() -> u64 {
    60_000
}

fn default_cooldown_secs() -> u64 {
    3_600
}

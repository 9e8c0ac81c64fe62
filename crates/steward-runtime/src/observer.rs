//! Post-execution observation.
//!
//! Signals are polled for the plan's observation window, then the collected
//! samples are classified by [`classify`]. A signal the source never
//! answered for counts as a failure; the observer never falls back to
//! `healthy` for missing data.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use steward_core::{
    ObservationSpec, Outcome, OutcomeClass, SignalReport, SignalState, SignalThreshold,
};
use tokio::time::Instant;

use crate::cancel::Cancellation;
use crate::error::SignalError;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub at: DateTime<Utc>,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Source of monitoring signals.
#[async_trait]
pub trait SignalSource: Send + Sync {
    async fn query_signal(
        &self,
        name: &str,
        window: SignalWindow,
    ) -> Result<Vec<Sample>, SignalError>;
}

pub struct Observer {
    source: Arc<dyn SignalSource>,
}

impl Observer {
    pub fn new(source: Arc<dyn SignalSource>) -> Self {
        Self { source }
    }

    /// Watch the signals in `spec` for its window and classify the result.
    ///
    /// Returns `None` if cancelled before the window closed.
    pub async fn observe(&self, spec: &ObservationSpec, cancel: &Cancellation) -> Option<Outcome> {
        let window_start = Utc::now();
        if spec.signals.is_empty() {
            return Some(classify(&spec.signals, &BTreeMap::new(), window_start, window_start));
        }

        let deadline = Instant::now() + Duration::from_millis(spec.window_ms);
        let interval = Duration::from_millis(spec.poll_interval_ms.max(1));
        let mut collected: BTreeMap<String, BTreeMap<DateTime<Utc>, f64>> = BTreeMap::new();

        tracing::info!(
            signals = spec.signals.len(),
            window_ms = spec.window_ms,
            "Observing"
        );

        loop {
            self.poll(&spec.signals, window_start, &mut collected).await;

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let wait = interval.min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        let series = collected
            .into_iter()
            .map(|(name, samples)| {
                let samples = samples
                    .into_iter()
                    .map(|(at, value)| Sample { at, value })
                    .collect();
                (name, samples)
            })
            .collect();
        Some(classify(&spec.signals, &series, window_start, Utc::now()))
    }

    async fn poll(
        &self,
        signals: &[SignalThreshold],
        window_start: DateTime<Utc>,
        collected: &mut BTreeMap<String, BTreeMap<DateTime<Utc>, f64>>,
    ) {
        let window = SignalWindow {
            start: window_start,
            end: Utc::now(),
        };
        let queries = signals
            .iter()
            .map(|s| self.source.query_signal(&s.name, window));
        let results = join_all(queries).await;

        for (signal, result) in signals.iter().zip(results) {
            match result {
                Ok(samples) => {
                    let entry = collected.entry(signal.name.clone()).or_default();
                    for sample in samples {
                        entry.insert(sample.at, sample.value);
                    }
                }
                Err(e) => {
                    tracing::warn!(signal = %signal.name, error = %e, "Signal query failed");
                }
            }
        }
    }
}

/// Classify collected samples against their thresholds.
///
/// Per signal: no samples is `unavailable`, any sample out of bounds is a
/// breach, and a breach whose latest sample is back in bounds `recovered`.
/// The outcome is the worst signal: unavailable or breached fail the plan,
/// a recovered breach degrades it.
pub fn classify(
    thresholds: &[SignalThreshold],
    series: &BTreeMap<String, Vec<Sample>>,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
) -> Outcome {
    let mut reports = Vec::with_capacity(thresholds.len());
    let mut problems = Vec::new();
    let mut class = OutcomeClass::Healthy;

    for threshold in thresholds {
        let mut samples: Vec<Sample> = series.get(&threshold.name).cloned().unwrap_or_default();
        samples.sort_by_key(|s| s.at);

        let breaches = samples.iter().filter(|s| !threshold.within(s.value)).count();
        let last_value = samples.last().map(|s| s.value);
        let state = match last_value {
            None => SignalState::Unavailable,
            Some(_) if breaches == 0 => SignalState::WithinBounds,
            Some(last) if threshold.within(last) => SignalState::Recovered,
            Some(_) => SignalState::Breached,
        };

        let signal_class = match state {
            SignalState::WithinBounds => OutcomeClass::Healthy,
            SignalState::Recovered => OutcomeClass::Degraded,
            SignalState::Breached | SignalState::Unavailable => OutcomeClass::Failed,
        };
        class = class.max(signal_class);

        match state {
            SignalState::WithinBounds => {}
            SignalState::Unavailable => problems.push(format!("{} unavailable", threshold.name)),
            SignalState::Recovered => problems.push(format!(
                "{} breached {} time(s) and recovered",
                threshold.name, breaches
            )),
            SignalState::Breached => problems.push(format!(
                "{} breached (last value {})",
                threshold.name,
                last_value.unwrap_or_default()
            )),
        }

        reports.push(SignalReport {
            threshold: threshold.clone(),
            state,
            samples: samples.len(),
            breaches,
            last_value,
        });
    }

    let reason = if thresholds.is_empty() {
        "no tracked signals".to_string()
    } else if problems.is_empty() {
        format!("{} signal(s) within bounds", thresholds.len())
    } else {
        problems.join("; ")
    };

    Outcome {
        class,
        reason,
        signals: reports,
        window_start,
        window_end,
    }
}

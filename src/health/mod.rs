//! Provider health monitoring, independent of the request path.
//!
//! A background task probes every provider on a fixed interval and drives
//! a three-state machine with hysteresis:
//!
//! - **Healthy**: `degraded_threshold` consecutive bad probes -> Degraded
//! - **Degraded**: `unhealthy_threshold` further bad probes -> Unhealthy
//! - any state -> Healthy only after `recovery_threshold` consecutive clean
//!   probes
//!
//! Healthy never jumps straight to Unhealthy, and a single clean probe
//! never un-trips a degraded provider; sustained evidence is required in
//! both directions. Probe timeouts count as failures, not errors, and the
//! monitor never blocks dispatch: records live in a [`DashMap`] read via
//! cheap snapshots.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::config::HealthConfig;
use crate::transport::{ProviderEndpoint, ProviderTransport};
use crate::weights::WeightManager;

/// The three provider health states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Lowercase string representation for JSON serialization.
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

/// Evidence from one probe or one observed request outcome.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProbeEvidence {
    /// Responded within the slow threshold
    Clean { latency_ms: f64 },
    /// Responded, but slower than `slow_probe_ms`; counts toward degradation
    Slow { latency_ms: f64 },
    /// Explicit failure (connection refused, error status)
    Failed,
    /// Probe exceeded its timeout; recoverable, counted as a failure
    TimedOut,
}

impl ProbeEvidence {
    fn is_clean(&self) -> bool {
        matches!(self, ProbeEvidence::Clean { .. })
    }

    fn latency_ms(&self) -> Option<f64> {
        match self {
            ProbeEvidence::Clean { latency_ms } | ProbeEvidence::Slow { latency_ms } => {
                Some(*latency_ms)
            }
            _ => None,
        }
    }
}

/// Mutable health record for one provider. Mutated only by the monitor.
#[derive(Debug, Clone, Serialize)]
pub struct HealthRecord {
    pub provider_id: usize,
    pub provider: String,
    pub status: HealthStatus,
    pub last_response_time_ms: Option<f64>,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub monitoring_active: bool,
    pub last_probe_at: Option<DateTime<Utc>>,
}

impl HealthRecord {
    fn new(provider_id: usize, provider: String) -> Self {
        Self {
            provider_id,
            provider,
            status: HealthStatus::Healthy,
            last_response_time_ms: None,
            consecutive_failures: 0,
            consecutive_successes: 0,
            monitoring_active: false,
            last_probe_at: None,
        }
    }
}

/// Tracks provider availability from probes and request outcomes.
pub struct HealthMonitor {
    config: HealthConfig,
    records: DashMap<usize, HealthRecord>,
}

impl HealthMonitor {
    /// Create a monitor with one record per provider, all initially healthy.
    pub fn new(provider_names: &[String], config: HealthConfig) -> Self {
        let records = DashMap::with_capacity(provider_names.len());
        for (id, name) in provider_names.iter().enumerate() {
            records.insert(id, HealthRecord::new(id, name.clone()));
        }
        Self { config, records }
    }

    /// Providers not currently `Unhealthy`, in no guaranteed order.
    pub fn available_providers(&self) -> Vec<usize> {
        self.records
            .iter()
            .filter(|e| e.value().status != HealthStatus::Unhealthy)
            .map(|e| *e.key())
            .collect()
    }

    pub fn status(&self, id: usize) -> Option<HealthStatus> {
        self.records.get(&id).map(|e| e.value().status)
    }

    /// Snapshot of every record, in provider id order.
    pub fn snapshot_all(&self) -> Vec<HealthRecord> {
        let mut records: Vec<HealthRecord> =
            self.records.iter().map(|e| e.value().clone()).collect();
        records.sort_by_key(|r| r.provider_id);
        records
    }

    /// Apply probe evidence to a provider's record.
    ///
    /// Returns `Some((from, to))` when the status changed, so the caller
    /// can propagate the transition to the weight manager.
    pub fn record_probe(
        &self,
        id: usize,
        evidence: ProbeEvidence,
    ) -> Option<(HealthStatus, HealthStatus)> {
        let mut entry = self.records.get_mut(&id)?;
        let record = entry.value_mut();
        let from = record.status;

        record.last_probe_at = Some(Utc::now());
        if let Some(latency) = evidence.latency_ms() {
            record.last_response_time_ms = Some(latency);
        }

        if evidence.is_clean() {
            record.consecutive_failures = 0;
            record.consecutive_successes += 1;
            if record.status != HealthStatus::Healthy
                && record.consecutive_successes >= self.config.recovery_threshold
            {
                record.status = HealthStatus::Healthy;
                record.consecutive_successes = 0;
            }
        } else {
            record.consecutive_successes = 0;
            record.consecutive_failures += 1;
            match record.status {
                HealthStatus::Healthy => {
                    if record.consecutive_failures >= self.config.degraded_threshold {
                        record.status = HealthStatus::Degraded;
                        // Fresh count: unhealthy requires sustained evidence on top
                        record.consecutive_failures = 0;
                    }
                }
                HealthStatus::Degraded => {
                    if record.consecutive_failures >= self.config.unhealthy_threshold {
                        record.status = HealthStatus::Unhealthy;
                        record.consecutive_failures = 0;
                    }
                }
                HealthStatus::Unhealthy => {}
            }
        }

        let to = record.status;
        if from != to {
            tracing::warn!(
                provider = %record.provider,
                from = from.as_str(),
                to = to.as_str(),
                "provider health transition"
            );
            Some((from, to))
        } else {
            None
        }
    }

    /// Feed a request outcome into the same state machine as probes, so
    /// live traffic accelerates detection between probe ticks.
    pub fn record_request_outcome(
        &self,
        id: usize,
        success: bool,
        latency_ms: f64,
    ) -> Option<(HealthStatus, HealthStatus)> {
        let evidence = if success {
            if latency_ms > self.config.slow_probe_ms as f64 {
                ProbeEvidence::Slow { latency_ms }
            } else {
                ProbeEvidence::Clean { latency_ms }
            }
        } else {
            ProbeEvidence::Failed
        };
        self.record_probe(id, evidence)
    }

    fn set_monitoring_active(&self, active: bool) {
        for mut entry in self.records.iter_mut() {
            entry.value_mut().monitoring_active = active;
        }
    }
}

/// Run the background probe loop until the process exits.
///
/// Each tick probes every provider with a per-probe timeout and applies
/// the evidence. Health transitions are pushed into the weight manager so
/// the dispatcher's snapshots reflect them without any synchronous probing.
pub async fn run_probe_loop(
    monitor: Arc<HealthMonitor>,
    weights: Arc<WeightManager>,
    transport: Arc<dyn ProviderTransport>,
    endpoints: Vec<ProviderEndpoint>,
) {
    let probe_timeout = Duration::from_millis(monitor.config.probe_timeout_ms);
    let slow_ms = monitor.config.slow_probe_ms as f64;
    let mut ticker = tokio::time::interval(Duration::from_secs(monitor.config.probe_interval_secs));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    monitor.set_monitoring_active(true);
    tracing::info!(
        providers = endpoints.len(),
        interval_secs = monitor.config.probe_interval_secs,
        "health probe loop started"
    );

    loop {
        ticker.tick().await;
        for endpoint in &endpoints {
            let evidence =
                match tokio::time::timeout(probe_timeout, transport.probe(endpoint)).await {
                    Ok(Ok(latency)) => {
                        let latency_ms = latency.as_secs_f64() * 1000.0;
                        if latency_ms > slow_ms {
                            ProbeEvidence::Slow { latency_ms }
                        } else {
                            ProbeEvidence::Clean { latency_ms }
                        }
                    }
                    Ok(Err(e)) => {
                        tracing::debug!(provider = %endpoint.name, error = %e, "probe failed");
                        ProbeEvidence::Failed
                    }
                    Err(_) => {
                        tracing::debug!(
                            provider = %endpoint.name,
                            timeout_ms = probe_timeout.as_millis() as u64,
                            "probe timed out"
                        );
                        ProbeEvidence::TimedOut
                    }
                };

            if let Some((_, to)) = monitor.record_probe(endpoint.id, evidence) {
                weights.set_health(endpoint.id, to);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor_with(config: HealthConfig) -> HealthMonitor {
        HealthMonitor::new(
            &["alpha".to_string(), "beta".to_string()],
            config,
        )
    }

    fn default_monitor() -> HealthMonitor {
        monitor_with(HealthConfig::default())
    }

    fn fail_times(monitor: &HealthMonitor, id: usize, n: u32) {
        for _ in 0..n {
            monitor.record_probe(id, ProbeEvidence::Failed);
        }
    }

    fn clean_times(monitor: &HealthMonitor, id: usize, n: u32) {
        for _ in 0..n {
            monitor.record_probe(id, ProbeEvidence::Clean { latency_ms: 50.0 });
        }
    }

    #[test]
    fn initial_state_is_healthy() {
        let monitor = default_monitor();
        assert_eq!(monitor.status(0), Some(HealthStatus::Healthy));
        assert_eq!(monitor.available_providers().len(), 2);
    }

    #[test]
    fn failures_below_threshold_stay_healthy() {
        let monitor = default_monitor();
        fail_times(&monitor, 0, 2);
        assert_eq!(monitor.status(0), Some(HealthStatus::Healthy));
    }

    #[test]
    fn threshold_failures_degrade() {
        let monitor = default_monitor();
        let transition = {
            fail_times(&monitor, 0, 2);
            monitor.record_probe(0, ProbeEvidence::Failed)
        };
        assert_eq!(monitor.status(0), Some(HealthStatus::Degraded));
        assert_eq!(
            transition,
            Some((HealthStatus::Healthy, HealthStatus::Degraded))
        );
    }

    #[test]
    fn never_skips_degraded() {
        let monitor = default_monitor();
        // A long unbroken failure burst must still pass through Degraded.
        let mut saw_degraded = false;
        for _ in 0..20 {
            monitor.record_probe(0, ProbeEvidence::Failed);
            if monitor.status(0) == Some(HealthStatus::Degraded) {
                saw_degraded = true;
            }
            if monitor.status(0) == Some(HealthStatus::Unhealthy) {
                break;
            }
        }
        assert!(saw_degraded, "healthy -> unhealthy must pass through degraded");
        assert_eq!(monitor.status(0), Some(HealthStatus::Unhealthy));
    }

    #[test]
    fn degraded_needs_further_failures_for_unhealthy() {
        let monitor = default_monitor();
        fail_times(&monitor, 0, 3);
        assert_eq!(monitor.status(0), Some(HealthStatus::Degraded));

        // Two more failures: still below the unhealthy threshold of 3.
        fail_times(&monitor, 0, 2);
        assert_eq!(monitor.status(0), Some(HealthStatus::Degraded));

        fail_times(&monitor, 0, 1);
        assert_eq!(monitor.status(0), Some(HealthStatus::Unhealthy));
    }

    #[test]
    fn single_clean_probe_does_not_recover() {
        let monitor = default_monitor();
        fail_times(&monitor, 0, 3);
        assert_eq!(monitor.status(0), Some(HealthStatus::Degraded));

        clean_times(&monitor, 0, 1);
        assert_eq!(
            monitor.status(0),
            Some(HealthStatus::Degraded),
            "one clean probe must not flip status (hysteresis)"
        );
    }

    #[test]
    fn recovery_threshold_restores_healthy() {
        let monitor = default_monitor();
        fail_times(&monitor, 0, 6);
        assert_eq!(monitor.status(0), Some(HealthStatus::Unhealthy));

        clean_times(&monitor, 0, 2);
        assert_eq!(monitor.status(0), Some(HealthStatus::Healthy));
        assert_eq!(monitor.available_providers().len(), 2);
    }

    #[test]
    fn clean_probe_resets_failure_streak() {
        let monitor = default_monitor();
        fail_times(&monitor, 0, 2);
        clean_times(&monitor, 0, 1);
        fail_times(&monitor, 0, 2);
        // Streak was broken; still healthy.
        assert_eq!(monitor.status(0), Some(HealthStatus::Healthy));
    }

    #[test]
    fn slow_probes_count_toward_degradation() {
        let monitor = default_monitor();
        for _ in 0..3 {
            monitor.record_probe(0, ProbeEvidence::Slow { latency_ms: 4000.0 });
        }
        assert_eq!(monitor.status(0), Some(HealthStatus::Degraded));
        // Slow probes still record a response time.
        let record = monitor.snapshot_all().into_iter().next().unwrap();
        assert_eq!(record.last_response_time_ms, Some(4000.0));
    }

    #[test]
    fn timeouts_count_as_failures() {
        let monitor = default_monitor();
        for _ in 0..3 {
            monitor.record_probe(0, ProbeEvidence::TimedOut);
        }
        assert_eq!(monitor.status(0), Some(HealthStatus::Degraded));
    }

    #[test]
    fn unhealthy_excluded_from_available() {
        let monitor = default_monitor();
        fail_times(&monitor, 0, 6);
        assert_eq!(monitor.status(0), Some(HealthStatus::Unhealthy));

        let available = monitor.available_providers();
        assert_eq!(available, vec![1]);
    }

    #[test]
    fn degraded_remains_available() {
        let monitor = default_monitor();
        fail_times(&monitor, 0, 3);
        assert_eq!(monitor.status(0), Some(HealthStatus::Degraded));
        assert_eq!(monitor.available_providers().len(), 2);
    }

    #[test]
    fn request_outcomes_feed_state_machine() {
        let monitor = default_monitor();
        for _ in 0..3 {
            monitor.record_request_outcome(0, false, 0.0);
        }
        assert_eq!(monitor.status(0), Some(HealthStatus::Degraded));

        // Slow successes also count as bad evidence.
        for _ in 0..3 {
            monitor.record_request_outcome(1, true, 10_000.0);
        }
        assert_eq!(monitor.status(1), Some(HealthStatus::Degraded));
    }

    #[test]
    fn unknown_provider_returns_none() {
        let monitor = default_monitor();
        assert!(monitor.record_probe(9, ProbeEvidence::Failed).is_none());
        assert!(monitor.status(9).is_none());
    }
}

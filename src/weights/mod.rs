//! Adaptive per-provider dispatch weights.
//!
//! Each provider's observed metrics (response time, success rate, cost,
//! availability) are smoothed with independent EMAs and blended into a
//! performance multiplier:
//!
//! `current_weight = clamp(base_weight * performance_multiplier * health_multiplier,
//!                         min_weight, max_weight)`
//!
//! Concurrency model: an arena of per-provider slots, each holding an
//! atomically swapped immutable [`ProviderState`] snapshot. The feedback
//! consumer is the only writer; the dispatcher and the stats endpoints
//! clone the `Arc` and never observe a mid-update state.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::{ProviderConfig, WeightConfig};
use crate::health::HealthStatus;

/// Bounded adjustment history exposed by the stats endpoint.
const ADJUSTMENT_HISTORY: usize = 100;

/// Exponential moving average with a configurable smoothing factor.
///
/// The first sample initializes the value directly so a provider's early
/// estimate is not dragged toward an arbitrary seed.
#[derive(Debug, Clone, Serialize)]
pub struct Ema {
    value: f64,
    alpha: f64,
    samples: u64,
}

impl Ema {
    /// Create an EMA seeded with `initial`, reported until the first sample.
    pub fn new(alpha: f64, initial: f64) -> Self {
        Self {
            value: initial,
            alpha,
            samples: 0,
        }
    }

    /// Fold one observation in: `new = alpha * sample + (1 - alpha) * old`.
    pub fn observe(&mut self, sample: f64) {
        if self.samples == 0 {
            self.value = sample;
        } else {
            self.value = self.alpha * sample + (1.0 - self.alpha) * self.value;
        }
        self.samples += 1;
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }
}

/// Immutable snapshot of one provider's adaptive state.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderState {
    pub id: usize,
    pub name: String,
    pub base_weight: f64,
    pub current_weight: f64,
    pub performance_multiplier: f64,
    pub health_multiplier: f64,
    pub response_time_ms: Ema,
    pub success_rate: Ema,
    pub cost_per_1k_tokens: Ema,
    pub availability: Ema,
    /// Attempts routed to this provider (lifetime), for the load-balance score
    pub attempts: u64,
    pub last_adjustment: Option<DateTime<Utc>>,
    pub adjustment_count: u64,
    /// Weight at the time of the last recorded adjustment
    last_adjusted_weight: f64,
}

/// One observed request outcome, as the weight manager consumes it.
///
/// Decoupled from the dispatcher's event type so this module is testable
/// on its own.
#[derive(Debug, Clone, Copy)]
pub struct OutcomeSample {
    pub success: bool,
    /// Timeouts and connection failures mean the provider was unreachable
    pub reachable: bool,
    pub latency_ms: f64,
    /// Observed cost per 1k tokens, when token usage was reported
    pub cost_per_1k: Option<f64>,
}

/// A recorded weight adjustment, kept in a bounded history.
#[derive(Debug, Clone, Serialize)]
pub struct AdjustmentEvent {
    pub timestamp: DateTime<Utc>,
    pub provider: String,
    pub old_weight: f64,
    pub new_weight: f64,
    /// "performance_drop", "cost_spike", "recovery", or "health_change"
    pub classification: String,
}

struct Slot {
    state: RwLock<Arc<ProviderState>>,
}

/// Maintains adaptive weights for the provider arena.
pub struct WeightManager {
    config: WeightConfig,
    slots: Vec<Slot>,
    total_attempts: AtomicU64,
    adjustments: Mutex<VecDeque<AdjustmentEvent>>,
}

impl WeightManager {
    /// Build the arena from static provider declarations. Slot index is the
    /// provider's stable id for the lifetime of the process.
    pub fn new(providers: &[ProviderConfig], config: WeightConfig) -> Self {
        let slots = providers
            .iter()
            .enumerate()
            .map(|(id, p)| {
                let initial_cost = if p.cost_per_1k_tokens > 0.0 {
                    p.cost_per_1k_tokens
                } else {
                    config.baseline_cost_per_1k
                };
                let base = clamp(p.base_weight, config.min_weight, config.max_weight);
                Slot {
                    state: RwLock::new(Arc::new(ProviderState {
                        id,
                        name: p.name.clone(),
                        base_weight: p.base_weight,
                        current_weight: base,
                        performance_multiplier: 1.0,
                        health_multiplier: 1.0,
                        response_time_ms: Ema::new(
                            config.response_time_alpha,
                            config.baseline_response_ms,
                        ),
                        success_rate: Ema::new(config.success_rate_alpha, 1.0),
                        cost_per_1k_tokens: Ema::new(config.cost_alpha, initial_cost),
                        availability: Ema::new(config.availability_alpha, 1.0),
                        attempts: 0,
                        last_adjustment: None,
                        adjustment_count: 0,
                        last_adjusted_weight: base,
                    })),
                }
            })
            .collect();

        let manager = Self {
            config,
            slots,
            total_attempts: AtomicU64::new(0),
            adjustments: Mutex::new(VecDeque::with_capacity(ADJUSTMENT_HISTORY)),
        };

        // Seed each slot through the same scoring path used at runtime, so
        // the first observation never registers as a spurious adjustment.
        for slot in &manager.slots {
            let mut state = (**slot.state.read().unwrap()).clone();
            manager.recompute(&mut state, 1);
            state.last_adjusted_weight = state.current_weight;
            *slot.state.write().unwrap() = Arc::new(state);
        }

        manager
    }

    pub fn provider_count(&self) -> usize {
        self.slots.len()
    }

    pub fn config(&self) -> &WeightConfig {
        &self.config
    }

    /// Current snapshot for one provider.
    pub fn snapshot(&self, id: usize) -> Option<Arc<ProviderState>> {
        self.slots.get(id).map(|s| s.state.read().unwrap().clone())
    }

    /// Snapshots for every provider, in id order.
    pub fn snapshots(&self) -> Vec<Arc<ProviderState>> {
        self.slots
            .iter()
            .map(|s| s.state.read().unwrap().clone())
            .collect()
    }

    /// Recent adjustment events, newest last.
    pub fn adjustment_history(&self) -> Vec<AdjustmentEvent> {
        self.adjustments.lock().unwrap().iter().cloned().collect()
    }

    /// Fold one observed outcome into a provider's EMAs and recompute its
    /// weight. Called only from the feedback consumer task.
    pub fn observe(&self, id: usize, sample: &OutcomeSample) {
        let Some(slot) = self.slots.get(id) else {
            return;
        };
        let total = self.total_attempts.fetch_add(1, Ordering::Relaxed) + 1;

        let old = slot.state.read().unwrap().clone();
        let mut next = (*old).clone();

        next.attempts += 1;
        next.success_rate
            .observe(if sample.success { 1.0 } else { 0.0 });
        next.availability
            .observe(if sample.reachable { 1.0 } else { 0.0 });
        if sample.success {
            next.response_time_ms.observe(sample.latency_ms);
        }
        if let Some(cost) = sample.cost_per_1k {
            next.cost_per_1k_tokens.observe(cost);
        }

        self.recompute(&mut next, total);
        self.maybe_record_adjustment(&old, &mut next);

        *slot.state.write().unwrap() = Arc::new(next);
    }

    /// Apply a health state change to a provider's multiplier.
    pub fn set_health(&self, id: usize, status: HealthStatus) {
        let Some(slot) = self.slots.get(id) else {
            return;
        };
        let multiplier = match status {
            HealthStatus::Healthy => 1.0,
            HealthStatus::Degraded => 0.5,
            HealthStatus::Unhealthy => 0.0,
        };

        let old = slot.state.read().unwrap().clone();
        if (old.health_multiplier - multiplier).abs() < f64::EPSILON {
            return;
        }

        let mut next = (*old).clone();
        next.health_multiplier = multiplier;
        let total = self.total_attempts.load(Ordering::Relaxed).max(1);
        self.recompute(&mut next, total);
        self.record_adjustment(&mut next, old.current_weight, "health_change");

        let next_name = next.name.clone();
        let next_weight = next.current_weight;
        *slot.state.write().unwrap() = Arc::new(next);

        tracing::info!(
            provider = %next_name,
            status = status.as_str(),
            weight = next_weight,
            "health multiplier applied"
        );
    }

    /// Recompute the performance multiplier and clamped weight in place.
    fn recompute(&self, state: &mut ProviderState, total_attempts: u64) {
        let cfg = &self.config;

        let response_score =
            cfg.baseline_response_ms / (cfg.baseline_response_ms + state.response_time_ms.value());
        let cost_score = cfg.baseline_cost_per_1k
            / (cfg.baseline_cost_per_1k + state.cost_per_1k_tokens.value());
        let share = state.attempts as f64 / total_attempts.max(1) as f64;
        let load_score = (1.0 - share).clamp(0.0, 1.0);

        let blended = cfg.performance_weight * state.success_rate.value()
            + cfg.availability_weight * state.availability.value()
            + cfg.cost_weight * cost_score
            + cfg.response_time_weight * response_score
            + cfg.load_balance_weight * load_score;

        // A blended score of 0.5 is neutral; sensitivity scales the excursion.
        state.performance_multiplier = (1.0 + cfg.sensitivity * (blended - 0.5) * 2.0).max(0.0);
        state.current_weight = clamp(
            state.base_weight * state.performance_multiplier * state.health_multiplier,
            cfg.min_weight,
            cfg.max_weight,
        );
    }

    /// Record an adjustment event if the relative change since the last
    /// recorded adjustment exceeds the rebalance threshold.
    fn maybe_record_adjustment(&self, old: &ProviderState, next: &mut ProviderState) {
        let reference = next.last_adjusted_weight.max(f64::MIN_POSITIVE);
        let relative = (next.current_weight - next.last_adjusted_weight).abs() / reference;
        if relative <= self.config.rebalance_threshold {
            return;
        }

        let classification = classify_adjustment(old, next);
        let previous = next.last_adjusted_weight;
        self.record_adjustment(next, previous, classification);
    }

    fn record_adjustment(&self, next: &mut ProviderState, old_weight: f64, classification: &str) {
        next.adjustment_count += 1;
        next.last_adjustment = Some(Utc::now());
        next.last_adjusted_weight = next.current_weight;

        let event = AdjustmentEvent {
            timestamp: Utc::now(),
            provider: next.name.clone(),
            old_weight,
            new_weight: next.current_weight,
            classification: classification.to_string(),
        };

        tracing::debug!(
            provider = %event.provider,
            old_weight = event.old_weight,
            new_weight = event.new_weight,
            classification = %event.classification,
            "weight adjustment"
        );

        let mut history = self.adjustments.lock().unwrap();
        if history.len() >= ADJUSTMENT_HISTORY {
            history.pop_front();
        }
        history.push_back(event);
    }
}

/// Name the dominant signal behind a weight change.
fn classify_adjustment(old: &ProviderState, next: &ProviderState) -> &'static str {
    if next.current_weight > next.last_adjusted_weight {
        return "recovery";
    }
    let cost_rise = relative_rise(
        old.cost_per_1k_tokens.value(),
        next.cost_per_1k_tokens.value(),
    );
    let success_drop = relative_rise(next.success_rate.value(), old.success_rate.value());
    let latency_rise = relative_rise(
        old.response_time_ms.value(),
        next.response_time_ms.value(),
    );
    if cost_rise > success_drop && cost_rise > latency_rise {
        "cost_spike"
    } else {
        "performance_drop"
    }
}

fn relative_rise(old: f64, new: f64) -> f64 {
    if old <= 0.0 {
        return 0.0;
    }
    ((new - old) / old).max(0.0)
}

fn clamp(value: f64, min: f64, max: f64) -> f64 {
    value.clamp(min, max)
}

//! The dispatcher: single entry point merging all routing signals.
//!
//! Per request it builds a ranked candidate list from cached snapshots
//! (no I/O, no awaits — the decision step stays inside the latency
//! budget), then walks the list with a per-attempt timeout, publishing
//! one feedback event per attempt. Only total exhaustion surfaces to the
//! caller; individual failures advance the chain.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::config::RoutingConfig;
use crate::cost::{arbitrage_reorder, CostEstimator};
use crate::error::{AttemptFailure, Error, Result};
use crate::feedback::{FeedbackSender, RequestOutcomeEvent};
use crate::geo::GeoRouter;
use crate::health::HealthMonitor;
use crate::predict::{Prediction, PredictiveRouter};
use crate::storage;
use crate::transport::{ProviderEndpoint, ProviderTransport};
use crate::weights::WeightManager;

/// In-memory routing decision history exposed to dashboards.
const DECISION_HISTORY: usize = 100;

/// An inbound inference request.
///
/// Only `prompt` and the optional hints are interpreted by the router;
/// everything else is forwarded to the upstream provider verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRequest {
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// One scored candidate in a ranked decision.
#[derive(Debug, Clone, Serialize)]
pub struct RankedCandidate {
    pub provider_id: usize,
    pub provider: String,
    pub composite_score: f64,
    pub current_weight: f64,
    pub geo_score: f64,
    pub cost_score: f64,
    pub predictive_bonus: f64,
    pub estimated_cost: f64,
    pub recent_latency_ms: f64,
}

/// The decision artifact: the full ranked list, not a single choice.
#[derive(Debug, Clone)]
pub struct RankedDecision {
    pub candidates: Vec<RankedCandidate>,
    pub client_region: String,
    /// Prediction confidence when one qualified, else 0.0
    pub confidence: f64,
    pub reason: String,
    pub pattern: Option<crate::predict::PatternId>,
}

/// Append-only audit record of one routing decision.
#[derive(Debug, Clone, Serialize)]
pub struct RoutingDecisionRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub client_region: String,
    pub selected_providers: Vec<String>,
    pub chosen_provider: Option<String>,
    pub confidence: f64,
    pub reason: String,
}

/// A successful dispatch.
#[derive(Debug)]
pub struct RouteResponse {
    pub provider: String,
    pub latency_ms: u64,
    pub body: serde_json::Value,
}

/// Request counters for the advanced-routing dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchCounters {
    pub total_requests: u64,
    pub total_failures: u64,
    pub in_flight: Vec<u64>,
}

/// Merges all signals into one decision and executes with fallback.
pub struct Dispatcher {
    config: RoutingConfig,
    endpoints: Vec<ProviderEndpoint>,
    transport: Arc<dyn ProviderTransport>,
    health: Arc<HealthMonitor>,
    weights: Arc<WeightManager>,
    predictor: Arc<PredictiveRouter>,
    geo: Arc<GeoRouter>,
    cost: Arc<CostEstimator>,
    feedback: FeedbackSender,
    pool: Option<SqlitePool>,
    log_decisions: bool,
    decisions: Mutex<std::collections::VecDeque<RoutingDecisionRecord>>,
    in_flight: Vec<AtomicUsize>,
    total_requests: AtomicU64,
    total_failures: AtomicU64,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: RoutingConfig,
        endpoints: Vec<ProviderEndpoint>,
        transport: Arc<dyn ProviderTransport>,
        health: Arc<HealthMonitor>,
        weights: Arc<WeightManager>,
        predictor: Arc<PredictiveRouter>,
        geo: Arc<GeoRouter>,
        cost: Arc<CostEstimator>,
        feedback: FeedbackSender,
        pool: Option<SqlitePool>,
        log_decisions: bool,
    ) -> Self {
        let in_flight = (0..endpoints.len()).map(|_| AtomicUsize::new(0)).collect();
        Self {
            config,
            endpoints,
            transport,
            health,
            weights,
            predictor,
            geo,
            cost,
            feedback,
            pool,
            log_decisions,
            decisions: Mutex::new(std::collections::VecDeque::with_capacity(DECISION_HISTORY)),
            in_flight,
            total_requests: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &RoutingConfig {
        &self.config
    }

    /// Resolve the client's region from an explicit header override or the
    /// geographic router's best effort.
    pub fn resolve_region(&self, header: Option<&str>, client_ip: Option<IpAddr>) -> String {
        match header {
            Some(region) if !region.is_empty() => region.to_string(),
            _ => self.geo.region_of(client_ip),
        }
    }

    /// Build the ranked candidate list from cached snapshots.
    ///
    /// Synchronous by construction: every signal is a snapshot read, so
    /// the decision holds the sub-20ms budget regardless of upstream
    /// behavior. Ties break by lowest recent latency, then provider id.
    pub fn rank(&self, request: &RouteRequest, client_region: &str) -> Result<RankedDecision> {
        let mut available = self.health.available_providers();
        if available.is_empty() {
            return Err(Error::NoProvidersAvailable);
        }
        available.sort_unstable();

        let mut reasons: Vec<String> = Vec::new();

        // Degenerate mode: adaptive scoring off, declaration order rules.
        if !self.config.load_balancer_enabled {
            let candidates = self.static_candidates(&available, request);
            return Ok(RankedDecision {
                candidates,
                client_region: client_region.to_string(),
                confidence: 0.0,
                reason: "static_order".to_string(),
                pattern: None,
            });
        }

        let pattern = self
            .config
            .predictive_routing_enabled
            .then(|| self.predictor.classify(&request.prompt, request.task_type.as_deref()));
        let prediction: Option<Prediction> =
            pattern.as_ref().and_then(|p| self.predictor.predict(p));
        if let Some(p) = &prediction {
            reasons.push(format!("predictive(confidence={:.2})", p.confidence));
        }

        // A matching rule may pin the region whose latency data we score by.
        let rule = self.geo.active_rule(client_region);
        let scoring_region = rule
            .and_then(|r| r.preferred_region.as_deref())
            .unwrap_or(client_region);
        if let Some(r) = rule {
            reasons.push(format!("rule({})", r.name));
        }

        let estimated_tokens = self
            .cost
            .estimate_tokens(request.prompt.len(), request.max_tokens);
        let max_weight = self.weights.config().max_weight;

        let mut candidates: Vec<RankedCandidate> = available
            .iter()
            .filter_map(|&id| self.weights.snapshot(id))
            .map(|state| {
                let estimated_cost = self
                    .cost
                    .estimate_cost(estimated_tokens, state.cost_per_1k_tokens.value());
                RankedCandidate {
                    provider_id: state.id,
                    provider: state.name.clone(),
                    composite_score: 0.0,
                    current_weight: state.current_weight,
                    geo_score: self.geo.score(state.id, scoring_region),
                    cost_score: 0.0,
                    predictive_bonus: 0.0,
                    estimated_cost,
                    recent_latency_ms: state.response_time_ms.value(),
                }
            })
            .collect();

        // Cost score is relative to the cheapest eligible candidate.
        let min_cost = candidates
            .iter()
            .map(|c| c.estimated_cost)
            .fold(f64::INFINITY, f64::min);
        for candidate in &mut candidates {
            candidate.cost_score = if candidate.estimated_cost > 0.0 && min_cost.is_finite() {
                min_cost / candidate.estimated_cost
            } else {
                1.0
            };
            if let Some(p) = &prediction {
                if p.provider_id == candidate.provider_id {
                    candidate.predictive_bonus = self.config.predictive_bonus * p.confidence;
                }
            }
            candidate.composite_score = self.config.weight_coeff
                * (candidate.current_weight / max_weight)
                + self.config.geo_coeff * candidate.geo_score
                + self.config.cost_coeff * candidate.cost_score
                + candidate.predictive_bonus;
        }

        candidates.sort_by(|a, b| {
            b.composite_score
                .partial_cmp(&a.composite_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    a.recent_latency_ms
                        .partial_cmp(&b.recent_latency_ms)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.provider_id.cmp(&b.provider_id))
        });

        // Among performance peers, the cheaper provider wins outright.
        let reordered = arbitrage_reorder(
            &mut candidates,
            self.cost.parity_band(),
            |c| c.composite_score,
            |c| c.estimated_cost,
        );
        if reordered {
            self.cost.note_arbitrage_applied();
            reasons.push("cost_arbitrage".to_string());
        }

        if reasons.is_empty() {
            reasons.push("weighted".to_string());
        }

        Ok(RankedDecision {
            candidates,
            client_region: client_region.to_string(),
            confidence: prediction.map_or(0.0, |p| p.confidence),
            reason: reasons.join("+"),
            pattern,
        })
    }

    /// Declaration-order candidates for the load-balancer-disabled mode.
    fn static_candidates(
        &self,
        available: &[usize],
        request: &RouteRequest,
    ) -> Vec<RankedCandidate> {
        let estimated_tokens = self
            .cost
            .estimate_tokens(request.prompt.len(), request.max_tokens);
        available
            .iter()
            .filter_map(|&id| self.weights.snapshot(id))
            .map(|state| RankedCandidate {
                provider_id: state.id,
                provider: state.name.clone(),
                composite_score: 0.0,
                current_weight: state.current_weight,
                geo_score: 0.0,
                cost_score: 0.0,
                predictive_bonus: 0.0,
                estimated_cost: self
                    .cost
                    .estimate_cost(estimated_tokens, state.cost_per_1k_tokens.value()),
                recent_latency_ms: state.response_time_ms.value(),
            })
            .collect()
    }

    /// Rank, then attempt candidates in order until one succeeds.
    pub async fn dispatch(
        &self,
        request: &RouteRequest,
        client_region: String,
    ) -> Result<RouteResponse> {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let decision = self.rank(request, &client_region)?;

        let limit = if self.config.fallback_enabled {
            self.config.max_providers_per_request
        } else {
            1
        };
        let attempt_timeout = Duration::from_millis(self.config.attempt_timeout_ms);
        let estimated_tokens = self
            .cost
            .estimate_tokens(request.prompt.len(), request.max_tokens);
        let most_expensive = decision
            .candidates
            .iter()
            .map(|c| c.estimated_cost)
            .fold(0.0, f64::max);

        let mut failures: Vec<AttemptFailure> = Vec::new();

        for candidate in decision.candidates.iter().take(limit) {
            let endpoint = &self.endpoints[candidate.provider_id];
            tracing::info!(
                provider = %candidate.provider,
                score = candidate.composite_score,
                region = %decision.client_region,
                reason = %decision.reason,
                "attempting provider"
            );

            self.in_flight[candidate.provider_id].fetch_add(1, Ordering::Relaxed);
            let start = tokio::time::Instant::now();
            let attempt =
                tokio::time::timeout(attempt_timeout, self.transport.send(endpoint, request))
                    .await;
            let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
            self.in_flight[candidate.provider_id].fetch_sub(1, Ordering::Relaxed);

            match attempt {
                Ok(Ok(response)) => {
                    let actual_tokens = match (response.input_tokens, response.output_tokens) {
                        (Some(input), Some(output)) => Some(input + output),
                        _ => None,
                    };
                    self.feedback.publish(RequestOutcomeEvent {
                        provider_id: candidate.provider_id,
                        pattern: decision.pattern.clone(),
                        region: Some(decision.client_region.clone()),
                        success: true,
                        timed_out: false,
                        reachable: true,
                        latency_ms,
                        cost_per_1k: observed_cost_per_1k(&response.body, actual_tokens),
                        estimated_tokens,
                        actual_tokens,
                    });
                    self.cost
                        .record_savings(candidate.estimated_cost, most_expensive);
                    self.record_decision(&decision, Some(candidate.provider.clone()));

                    return Ok(RouteResponse {
                        provider: candidate.provider.clone(),
                        latency_ms: latency_ms as u64,
                        body: response.body,
                    });
                }
                Ok(Err(e)) => {
                    tracing::warn!(
                        provider = %candidate.provider,
                        error = %e,
                        "attempt failed, advancing to next candidate"
                    );
                    self.feedback.publish(RequestOutcomeEvent {
                        provider_id: candidate.provider_id,
                        pattern: decision.pattern.clone(),
                        region: Some(decision.client_region.clone()),
                        success: false,
                        timed_out: false,
                        reachable: e.reachable(),
                        latency_ms,
                        cost_per_1k: None,
                        estimated_tokens,
                        actual_tokens: None,
                    });
                    failures.push(AttemptFailure {
                        provider: candidate.provider.clone(),
                        kind: e.kind().to_string(),
                        detail: e.to_string(),
                    });
                }
                Err(_elapsed) => {
                    tracing::warn!(
                        provider = %candidate.provider,
                        timeout_ms = self.config.attempt_timeout_ms,
                        "attempt timed out, advancing to next candidate"
                    );
                    self.feedback.publish(RequestOutcomeEvent {
                        provider_id: candidate.provider_id,
                        pattern: decision.pattern.clone(),
                        region: Some(decision.client_region.clone()),
                        success: false,
                        timed_out: true,
                        reachable: false,
                        latency_ms,
                        cost_per_1k: None,
                        estimated_tokens,
                        actual_tokens: None,
                    });
                    failures.push(AttemptFailure {
                        provider: candidate.provider.clone(),
                        kind: "timeout".to_string(),
                        detail: format!(
                            "attempt exceeded {}ms",
                            self.config.attempt_timeout_ms
                        ),
                    });
                }
            }
        }

        self.total_failures.fetch_add(1, Ordering::Relaxed);
        self.record_decision(&decision, None);
        Err(Error::AllProvidersFailed { attempts: failures })
    }

    /// Append the decision to the in-memory ring and, when configured, the
    /// database (fire-and-forget, off the hot path).
    fn record_decision(&self, decision: &RankedDecision, chosen: Option<String>) {
        let record = RoutingDecisionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            client_region: decision.client_region.clone(),
            selected_providers: decision
                .candidates
                .iter()
                .map(|c| c.provider.clone())
                .collect(),
            chosen_provider: chosen,
            confidence: decision.confidence,
            reason: decision.reason.clone(),
        };

        {
            let mut ring = self.decisions.lock().unwrap();
            if ring.len() >= DECISION_HISTORY {
                ring.pop_front();
            }
            ring.push_back(record.clone());
        }

        if self.log_decisions {
            if let Some(pool) = &self.pool {
                storage::decisions::spawn_decision_write(pool, record);
            }
        }
    }

    /// Recent routing decisions, newest last.
    pub fn recent_decisions(&self) -> Vec<RoutingDecisionRecord> {
        self.decisions.lock().unwrap().iter().cloned().collect()
    }

    pub fn counters(&self) -> DispatchCounters {
        DispatchCounters {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            in_flight: self
                .in_flight
                .iter()
                .map(|c| c.load(Ordering::Relaxed) as u64)
                .collect(),
        }
    }
}

/// Derive an observed cost-per-1k-tokens from a provider response that
/// reports its own total cost.
fn observed_cost_per_1k(body: &serde_json::Value, actual_tokens: Option<u32>) -> Option<f64> {
    let total_cost = body.get("usage")?.get("total_cost")?.as_f64()?;
    let tokens = actual_tokens?;
    if tokens == 0 {
        return None;
    }
    Some(total_cost / tokens as f64 * 1000.0)
}

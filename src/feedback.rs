//! Outcome feedback fan-out.
//!
//! Every provider attempt produces one [`RequestOutcomeEvent`]. Events
//! flow over a single mpsc channel to one consumer task that fans each
//! event out to the health monitor, weight manager, predictive router,
//! geographic router, and cost estimator. All subscribers therefore
//! observe a consistent snapshot of the outcome, and per-provider state
//! mutation is serialized through this one writer path.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::cost::CostEstimator;
use crate::geo::GeoRouter;
use crate::health::HealthMonitor;
use crate::predict::{PatternId, PredictiveRouter};
use crate::weights::{OutcomeSample, WeightManager};

/// Feedback channel depth. Outcomes are dropped (with a warning) rather
/// than ever blocking the dispatch path.
const CHANNEL_CAPACITY: usize = 1024;

/// The observed outcome of one provider attempt.
#[derive(Debug, Clone)]
pub struct RequestOutcomeEvent {
    pub provider_id: usize,
    pub pattern: Option<PatternId>,
    pub region: Option<String>,
    pub success: bool,
    /// The attempt hit its per-attempt deadline (recorded distinctly from
    /// an explicit error response)
    pub timed_out: bool,
    /// The provider answered at all, even with an error status
    pub reachable: bool,
    pub latency_ms: f64,
    /// Observed cost per 1k tokens, when the response reported cost
    pub cost_per_1k: Option<f64>,
    pub estimated_tokens: u32,
    pub actual_tokens: Option<u32>,
}

/// Sending half handed to the dispatcher.
#[derive(Clone)]
pub struct FeedbackSender {
    tx: mpsc::Sender<RequestOutcomeEvent>,
}

impl FeedbackSender {
    /// Enqueue an outcome without blocking. A full queue drops the event.
    pub fn publish(&self, event: RequestOutcomeEvent) {
        if let Err(e) = self.tx.try_send(event) {
            tracing::warn!(error = %e, "feedback queue full, outcome dropped");
        }
    }
}

/// Create the feedback channel.
pub fn channel() -> (FeedbackSender, mpsc::Receiver<RequestOutcomeEvent>) {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    (FeedbackSender { tx }, rx)
}

/// Spawn the single consumer task that applies outcomes to every
/// subscriber. Runs until all senders are dropped.
pub fn spawn_feedback_loop(
    mut rx: mpsc::Receiver<RequestOutcomeEvent>,
    health: Arc<HealthMonitor>,
    weights: Arc<WeightManager>,
    predictor: Arc<PredictiveRouter>,
    geo: Arc<GeoRouter>,
    cost: Arc<CostEstimator>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            apply_outcome(&event, &health, &weights, &predictor, &geo, &cost);
        }
        tracing::debug!("feedback channel closed, consumer exiting");
    })
}

/// Fan one outcome out to every subscriber. Synchronous: no subscriber
/// performs I/O, so the consumer keeps up with the dispatch rate.
pub fn apply_outcome(
    event: &RequestOutcomeEvent,
    health: &HealthMonitor,
    weights: &WeightManager,
    predictor: &PredictiveRouter,
    geo: &GeoRouter,
    cost: &CostEstimator,
) {
    weights.observe(
        event.provider_id,
        &OutcomeSample {
            success: event.success,
            reachable: event.reachable,
            latency_ms: event.latency_ms,
            cost_per_1k: event.cost_per_1k,
        },
    );

    if let Some((_, to)) =
        health.record_request_outcome(event.provider_id, event.success, event.latency_ms)
    {
        weights.set_health(event.provider_id, to);
    }

    if let Some(pattern) = &event.pattern {
        predictor.observe(pattern, event.provider_id, event.success);
    }

    if event.success {
        if let Some(region) = &event.region {
            geo.record_latency(event.provider_id, region, event.latency_ms);
        }
    }

    if let Some(actual) = event.actual_tokens {
        cost.record_token_usage(event.estimated_tokens, actual);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        CostConfig, GeoConfig, HealthConfig, PredictionConfig, ProviderConfig, WeightConfig,
    };

    fn components() -> (
        Arc<HealthMonitor>,
        Arc<WeightManager>,
        Arc<PredictiveRouter>,
        Arc<GeoRouter>,
        Arc<CostEstimator>,
    ) {
        let providers = vec![ProviderConfig {
            name: "alpha".to_string(),
            url: "https://alpha.example.com/v1".to_string(),
            api_key: None,
            base_weight: 1.0,
            cost_per_1k_tokens: 0.01,
            regions: vec![],
        }];
        (
            Arc::new(HealthMonitor::new(
                &["alpha".to_string()],
                HealthConfig::default(),
            )),
            Arc::new(WeightManager::new(&providers, WeightConfig::default())),
            Arc::new(PredictiveRouter::new(PredictionConfig::default())),
            Arc::new(GeoRouter::new(&providers, GeoConfig::default())),
            Arc::new(CostEstimator::new(CostConfig::default())),
        )
    }

    fn failed_event(pattern: Option<PatternId>) -> RequestOutcomeEvent {
        RequestOutcomeEvent {
            provider_id: 0,
            pattern,
            region: Some("us-east".to_string()),
            success: false,
            timed_out: true,
            reachable: false,
            latency_ms: 5000.0,
            cost_per_1k: None,
            estimated_tokens: 600,
            actual_tokens: None,
        }
    }

    #[test]
    fn outcome_reaches_every_subscriber() {
        let (health, weights, predictor, geo, cost) = components();
        let pattern = predictor.classify("write a function", None);

        let event = RequestOutcomeEvent {
            provider_id: 0,
            pattern: Some(pattern.clone()),
            region: Some("us-east".to_string()),
            success: true,
            timed_out: false,
            reachable: true,
            latency_ms: 150.0,
            cost_per_1k: Some(0.02),
            estimated_tokens: 600,
            actual_tokens: Some(580),
        };
        apply_outcome(&event, &health, &weights, &predictor, &geo, &cost);

        let state = weights.snapshot(0).unwrap();
        assert_eq!(state.attempts, 1);
        assert_eq!(predictor.stats().total_observations, 1);
        assert_eq!(geo.latency_stats()[0].sample_count, 1);
        assert_eq!(cost.report().accuracy_samples, 1);
    }

    #[test]
    fn repeated_failures_propagate_to_health_and_weights() {
        let (health, weights, predictor, geo, cost) = components();

        for _ in 0..3 {
            apply_outcome(
                &failed_event(None),
                &health,
                &weights,
                &predictor,
                &geo,
                &cost,
            );
        }

        assert_eq!(
            health.status(0),
            Some(crate::health::HealthStatus::Degraded)
        );
        // The health transition flowed into the weight multiplier.
        assert_eq!(weights.snapshot(0).unwrap().health_multiplier, 0.5);
    }

    #[test]
    fn failed_attempts_do_not_record_region_latency() {
        let (health, weights, predictor, geo, cost) = components();
        apply_outcome(
            &failed_event(None),
            &health,
            &weights,
            &predictor,
            &geo,
            &cost,
        );
        assert!(geo.latency_stats().is_empty());
    }

    #[tokio::test]
    async fn consumer_task_drains_channel() {
        let (health, weights, predictor, geo, cost) = components();
        let (sender, rx) = channel();
        let handle = spawn_feedback_loop(
            rx,
            health.clone(),
            weights.clone(),
            predictor,
            geo,
            cost,
        );

        for _ in 0..5 {
            sender.publish(failed_event(None));
        }
        drop(sender);
        handle.await.unwrap();

        assert_eq!(weights.snapshot(0).unwrap().attempts, 5);
    }
}

//! Cost estimation and arbitrage.
//!
//! Predicts per-request cost per provider from a token estimate and the
//! provider's cost EMA, and prefers the cheapest among candidates whose
//! performance scores sit within a configurable parity band. Outside the
//! band, performance signals dominate and cost only breaks near-ties.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;

use crate::config::CostConfig;
use crate::weights::Ema;

/// Smoothing for the token-prediction accuracy EMA.
const ACCURACY_ALPHA: f64 = 0.1;

/// Aggregate cost counters for the cost-optimization endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct CostReport {
    /// EMA of per-request estimate accuracy in [0, 1]
    pub token_prediction_accuracy: f64,
    pub accuracy_samples: u64,
    /// Accumulated (most expensive eligible - chosen) across requests
    pub total_savings: f64,
    /// Requests where the parity band reordered the ranking
    pub arbitrage_applications: u64,
    pub parity_band: f64,
}

/// Predicts request cost and tracks realized savings.
pub struct CostEstimator {
    config: CostConfig,
    total_savings: Mutex<f64>,
    accuracy: Mutex<Ema>,
    accuracy_samples: AtomicU64,
    arbitrage_applications: AtomicU64,
}

impl CostEstimator {
    pub fn new(config: CostConfig) -> Self {
        Self {
            config,
            total_savings: Mutex::new(0.0),
            accuracy: Mutex::new(Ema::new(ACCURACY_ALPHA, 1.0)),
            accuracy_samples: AtomicU64::new(0),
            arbitrage_applications: AtomicU64::new(0),
        }
    }

    /// Estimate total tokens for a request: a character-count heuristic for
    /// the prompt plus the bounded (or assumed) completion size.
    pub fn estimate_tokens(&self, prompt_len: usize, max_tokens: Option<u32>) -> u32 {
        let input = (prompt_len as u32).div_ceil(self.config.chars_per_token.max(1));
        let output = max_tokens.unwrap_or(self.config.expected_output_tokens);
        input + output
    }

    /// Predicted cost of serving `tokens` at a provider's current rate.
    pub fn estimate_cost(&self, tokens: u32, cost_per_1k: f64) -> f64 {
        tokens as f64 / 1000.0 * cost_per_1k
    }

    pub fn parity_band(&self) -> f64 {
        self.config.parity_band
    }

    /// Accumulate realized savings for one dispatched request.
    pub fn record_savings(&self, chosen_cost: f64, most_expensive_cost: f64) {
        let saved = (most_expensive_cost - chosen_cost).max(0.0);
        *self.total_savings.lock().unwrap() += saved;
    }

    /// Fold one observed token count into the accuracy EMA.
    pub fn record_token_usage(&self, estimated: u32, actual: u32) {
        if actual == 0 {
            return;
        }
        let ratio = estimated.min(actual) as f64 / estimated.max(actual) as f64;
        self.accuracy.lock().unwrap().observe(ratio);
        self.accuracy_samples.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_arbitrage_applied(&self) {
        self.arbitrage_applications.fetch_add(1, Ordering::Relaxed);
    }

    pub fn report(&self) -> CostReport {
        CostReport {
            token_prediction_accuracy: self.accuracy.lock().unwrap().value(),
            accuracy_samples: self.accuracy_samples.load(Ordering::Relaxed),
            total_savings: *self.total_savings.lock().unwrap(),
            arbitrage_applications: self.arbitrage_applications.load(Ordering::Relaxed),
            parity_band: self.config.parity_band,
        }
    }
}

/// Reorder the leading parity group of a ranked list by ascending cost.
///
/// `items` must already be sorted by descending score. Every item whose
/// score is within `parity_band` of the best is a performance peer; peers
/// are reordered strictly by cost. Items outside the band keep their
/// performance ordering. Returns true if the order changed.
pub fn arbitrage_reorder<T>(
    items: &mut [T],
    parity_band: f64,
    score: impl Fn(&T) -> f64,
    cost: impl Fn(&T) -> f64,
) -> bool {
    if items.len() < 2 {
        return false;
    }

    let best = score(&items[0]);
    let band_len = items
        .iter()
        .take_while(|item| best - score(item) <= parity_band)
        .count();

    if band_len < 2 {
        return false;
    }

    let before: Vec<f64> = items[..band_len].iter().map(&cost).collect();
    items[..band_len].sort_by(|a, b| {
        cost(a)
            .partial_cmp(&cost(b))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let after: Vec<f64> = items[..band_len].iter().map(&cost).collect();

    before != after
}

#[cfg(test)]
mod tests {
    use super::*;

    fn estimator() -> CostEstimator {
        CostEstimator::new(CostConfig::default())
    }

    #[test]
    fn token_estimate_includes_expected_output() {
        let est = estimator();
        // 400 chars / 4 chars-per-token + 500 assumed output
        assert_eq!(est.estimate_tokens(400, None), 600);
        assert_eq!(est.estimate_tokens(400, Some(100)), 200);
    }

    #[test]
    fn token_estimate_rounds_up() {
        let est = estimator();
        assert_eq!(est.estimate_tokens(1, Some(0)), 1);
    }

    #[test]
    fn cost_scales_with_rate() {
        let est = estimator();
        let cheap = est.estimate_cost(1000, 0.01);
        let pricey = est.estimate_cost(1000, 0.03);
        assert!((cheap - 0.01).abs() < 1e-12);
        assert!(pricey > cheap);
    }

    #[test]
    fn savings_accumulate_and_never_go_negative() {
        let est = estimator();
        est.record_savings(0.01, 0.03);
        est.record_savings(0.05, 0.03); // chosen was the expensive one
        let report = est.report();
        assert!((report.total_savings - 0.02).abs() < 1e-12);
    }

    #[test]
    fn accuracy_tracks_estimate_quality() {
        let est = estimator();
        est.record_token_usage(100, 100);
        assert!((est.report().token_prediction_accuracy - 1.0).abs() < 1e-9);

        for _ in 0..50 {
            est.record_token_usage(100, 200);
        }
        let report = est.report();
        assert!(report.token_prediction_accuracy < 0.6);
        assert_eq!(report.accuracy_samples, 51);
    }

    #[test]
    fn zero_actual_usage_ignored() {
        let est = estimator();
        est.record_token_usage(100, 0);
        assert_eq!(est.report().accuracy_samples, 0);
    }

    // ── arbitrage_reorder ────────────────────────────────────────────

    /// (score, cost) pairs for reorder tests.
    type Item = (f64, f64);

    fn reorder(items: &mut [Item], band: f64) -> bool {
        arbitrage_reorder(items, band, |i| i.0, |i| i.1)
    }

    #[test]
    fn peers_in_band_sorted_by_cost() {
        let mut items: Vec<Item> = vec![(0.90, 0.03), (0.88, 0.01), (0.87, 0.02)];
        let changed = reorder(&mut items, 0.05);
        assert!(changed);
        // All three are within 0.05 of the best; cheapest first.
        assert_eq!(items, vec![(0.88, 0.01), (0.87, 0.02), (0.90, 0.03)]);
    }

    #[test]
    fn out_of_band_keeps_performance_order() {
        let mut items: Vec<Item> = vec![(0.90, 0.03), (0.60, 0.01)];
        let changed = reorder(&mut items, 0.05);
        assert!(!changed);
        assert_eq!(items[0], (0.90, 0.03));
    }

    #[test]
    fn never_picks_costlier_peer() {
        // Property: if two providers are within the band, substituting the
        // cheaper one first must not increase estimated spend.
        let mut items: Vec<Item> = vec![(0.90, 0.05), (0.89, 0.02)];
        reorder(&mut items, 0.05);
        assert!(items[0].1 <= items[1].1);
    }

    #[test]
    fn partial_band_only_reorders_prefix() {
        let mut items: Vec<Item> = vec![(0.90, 0.03), (0.89, 0.01), (0.70, 0.001)];
        reorder(&mut items, 0.05);
        // The distant third stays last despite being cheapest.
        assert_eq!(items[2], (0.70, 0.001));
        assert_eq!(items[0], (0.89, 0.01));
    }

    #[test]
    fn single_item_untouched() {
        let mut items: Vec<Item> = vec![(0.9, 0.01)];
        assert!(!reorder(&mut items, 0.05));
    }
}

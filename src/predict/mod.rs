//! Predictive routing from historical request patterns.
//!
//! Requests are classified into a deterministic pattern id (task type +
//! complexity bucket + content signature). Completed requests feed
//! per-pattern, per-provider success EMAs; `predict` turns those into a
//! provider suggestion with a confidence score. Low-confidence predictions
//! are a routing signal, not an error: they are discarded and the
//! dispatcher falls back to weight and geography signals alone.
//!
//! Patterns are never deleted, only decayed through their EMAs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use regex::Regex;
use serde::Serialize;

use crate::config::PredictionConfig;
use crate::weights::Ema;

/// Broad task category, detected by keyword heuristics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Code,
    Summarization,
    Translation,
    Analysis,
    Chat,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Code => "code",
            TaskType::Summarization => "summarization",
            TaskType::Translation => "translation",
            TaskType::Analysis => "analysis",
            TaskType::Chat => "chat",
        }
    }

    fn from_hint(hint: &str) -> Option<Self> {
        match hint {
            "code" => Some(TaskType::Code),
            "summarization" => Some(TaskType::Summarization),
            "translation" => Some(TaskType::Translation),
            "analysis" => Some(TaskType::Analysis),
            "chat" => Some(TaskType::Chat),
            _ => None,
        }
    }
}

/// Deterministic request fingerprint: task type, length bucket, signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PatternId(String);

impl PatternId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PatternId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A provider suggestion derived from historical patterns.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Prediction {
    pub provider_id: usize,
    pub confidence: f64,
}

#[derive(Debug, Clone)]
struct ProviderOutcomes {
    success: Ema,
    samples: u64,
}

#[derive(Debug, Clone)]
struct PatternStats {
    frequency: u64,
    per_provider: HashMap<usize, ProviderOutcomes>,
}

struct CacheEntry {
    prediction: Option<Prediction>,
    inserted_at: Instant,
}

/// Aggregate counters for the predictive-routing dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct PredictorStats {
    pub pattern_count: usize,
    pub total_observations: u64,
    pub cache_entries: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_rate: f64,
    pub low_confidence_discards: u64,
    pub confidence_threshold: f64,
}

/// Classifies requests and predicts the best provider from history.
pub struct PredictiveRouter {
    config: PredictionConfig,
    patterns: DashMap<String, PatternStats>,
    cache: DashMap<String, CacheEntry>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    low_confidence_discards: AtomicU64,
    total_observations: AtomicU64,
    classifier: Classifier,
}

struct Classifier {
    code: Regex,
    summarization: Regex,
    translation: Regex,
    analysis: Regex,
}

impl Classifier {
    fn new() -> Self {
        // Patterns are fixed strings; construction cannot fail.
        Self {
            code: Regex::new(
                r"(?i)\b(function|code|compile|debug|implement|refactor|struct|class|bug)\b",
            )
            .unwrap(),
            summarization: Regex::new(r"(?i)\b(summariz|summary|tl;?dr|condense|shorten)")
                .unwrap(),
            translation: Regex::new(r"(?i)\btranslat").unwrap(),
            analysis: Regex::new(r"(?i)\b(analy[sz]|compare|evaluate|assess|review)").unwrap(),
        }
    }

    fn detect(&self, prompt: &str) -> TaskType {
        if self.code.is_match(prompt) {
            TaskType::Code
        } else if self.summarization.is_match(prompt) {
            TaskType::Summarization
        } else if self.translation.is_match(prompt) {
            TaskType::Translation
        } else if self.analysis.is_match(prompt) {
            TaskType::Analysis
        } else {
            TaskType::Chat
        }
    }
}

/// FNV-1a over the prompt prefix; stable within a process and cheap.
fn content_signature(prompt: &str) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in prompt.bytes().take(64) {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

fn length_bucket(len: usize) -> &'static str {
    if len < 256 {
        "s"
    } else if len < 2048 {
        "m"
    } else {
        "l"
    }
}

impl PredictiveRouter {
    pub fn new(config: PredictionConfig) -> Self {
        Self {
            config,
            patterns: DashMap::new(),
            cache: DashMap::new(),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            low_confidence_discards: AtomicU64::new(0),
            total_observations: AtomicU64::new(0),
            classifier: Classifier::new(),
        }
    }

    /// Deterministic classification of a request into a pattern id.
    ///
    /// An explicit task hint wins over keyword detection; the rest of the
    /// id comes from prompt length and a hashed prefix.
    pub fn classify(&self, prompt: &str, task_hint: Option<&str>) -> PatternId {
        let task = task_hint
            .and_then(TaskType::from_hint)
            .unwrap_or_else(|| self.classifier.detect(prompt));
        PatternId(format!(
            "{}:{}:{:08x}",
            task.as_str(),
            length_bucket(prompt.len()),
            content_signature(prompt)
        ))
    }

    /// Look up or compute a prediction for a pattern.
    ///
    /// Predictions below the confidence threshold are discarded here, so a
    /// caller never sees a suggestion that must not influence ranking.
    pub fn predict(&self, pattern: &PatternId) -> Option<Prediction> {
        let ttl = Duration::from_secs(self.config.cache_ttl_secs);

        let cached = self.cache.get(pattern.as_str()).and_then(|entry| {
            // Entries past their TTL are treated as absent.
            if entry.inserted_at.elapsed() < ttl {
                Some(entry.prediction)
            } else {
                None
            }
        });

        let prediction = match cached {
            Some(prediction) => {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                prediction
            }
            None => {
                self.cache_misses.fetch_add(1, Ordering::Relaxed);
                let computed = self.compute(pattern);
                self.cache.insert(
                    pattern.as_str().to_string(),
                    CacheEntry {
                        prediction: computed,
                        inserted_at: Instant::now(),
                    },
                );
                computed
            }
        };

        match prediction {
            Some(p) if p.confidence >= self.config.confidence_threshold => Some(p),
            Some(p) => {
                self.low_confidence_discards.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    pattern = %pattern,
                    confidence = p.confidence,
                    threshold = self.config.confidence_threshold,
                    "prediction below confidence threshold, discarded"
                );
                None
            }
            None => None,
        }
    }

    /// Compute the best provider for a pattern from aggregated history.
    ///
    /// Confidence is the top candidate's success EMA discounted by sample
    /// count and penalized for low pattern frequency.
    fn compute(&self, pattern: &PatternId) -> Option<Prediction> {
        let stats = self.patterns.get(pattern.as_str())?;

        let mut best: Option<(usize, f64)> = None;
        for (&provider_id, outcomes) in &stats.per_provider {
            let sample_factor =
                outcomes.samples as f64 / (outcomes.samples + self.config.smoothing_samples) as f64;
            let score = outcomes.success.value() * sample_factor;
            let better = match best {
                None => true,
                Some((best_id, best_score)) => {
                    score > best_score || (score == best_score && provider_id < best_id)
                }
            };
            if better {
                best = Some((provider_id, score));
            }
        }

        let (provider_id, score) = best?;
        let frequency_factor =
            (stats.frequency as f64 / self.config.min_frequency as f64).min(1.0);

        Some(Prediction {
            provider_id,
            confidence: (score * frequency_factor).clamp(0.0, 1.0),
        })
    }

    /// Fold a completed request into the pattern store and refresh the
    /// cache entry so later predictions see the new evidence.
    pub fn observe(&self, pattern: &PatternId, provider_id: usize, success: bool) {
        self.total_observations.fetch_add(1, Ordering::Relaxed);

        {
            let mut stats = self
                .patterns
                .entry(pattern.as_str().to_string())
                .or_insert_with(|| PatternStats {
                    frequency: 0,
                    per_provider: HashMap::new(),
                });
            stats.frequency += 1;
            let outcomes = stats
                .per_provider
                .entry(provider_id)
                .or_insert_with(|| ProviderOutcomes {
                    success: Ema::new(self.config.pattern_alpha, 0.0),
                    samples: 0,
                });
            outcomes.success.observe(if success { 1.0 } else { 0.0 });
            outcomes.samples += 1;
        }

        let refreshed = self.compute(pattern);
        self.cache.insert(
            pattern.as_str().to_string(),
            CacheEntry {
                prediction: refreshed,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Counters for the predictive-routing dashboard.
    pub fn stats(&self) -> PredictorStats {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        PredictorStats {
            pattern_count: self.patterns.len(),
            total_observations: self.total_observations.load(Ordering::Relaxed),
            cache_entries: self.cache.len(),
            cache_hits: hits,
            cache_misses: misses,
            cache_hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
            low_confidence_discards: self.low_confidence_discards.load(Ordering::Relaxed),
            confidence_threshold: self.config.confidence_threshold,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router_with(config: PredictionConfig) -> PredictiveRouter {
        PredictiveRouter::new(config)
    }

    fn default_router() -> PredictiveRouter {
        router_with(PredictionConfig::default())
    }

    /// Feed `n` observations of `success` for one provider on a pattern.
    fn observe_n(router: &PredictiveRouter, pattern: &PatternId, provider: usize, n: usize) {
        for _ in 0..n {
            router.observe(pattern, provider, true);
        }
    }

    #[test]
    fn classification_is_deterministic() {
        let router = default_router();
        let a = router.classify("Write a function to sort a vec", None);
        let b = router.classify("Write a function to sort a vec", None);
        assert_eq!(a, b);
    }

    #[test]
    fn task_detection_from_keywords() {
        let router = default_router();
        assert!(router
            .classify("please refactor this struct", None)
            .as_str()
            .starts_with("code:"));
        assert!(router
            .classify("summarize this article for me", None)
            .as_str()
            .starts_with("summarization:"));
        assert!(router
            .classify("translate this to French", None)
            .as_str()
            .starts_with("translation:"));
        assert!(router
            .classify("how was your day", None)
            .as_str()
            .starts_with("chat:"));
    }

    #[test]
    fn task_hint_overrides_keywords() {
        let router = default_router();
        let id = router.classify("summarize this function", Some("code"));
        assert!(id.as_str().starts_with("code:"));
    }

    #[test]
    fn length_buckets_differ() {
        let router = default_router();
        let short = router.classify("hi", None);
        let long = router.classify(&"hi ".repeat(1000), None);
        assert_ne!(short, long);
    }

    #[test]
    fn unknown_pattern_predicts_nothing() {
        let router = default_router();
        let id = router.classify("never seen before", None);
        assert_eq!(router.predict(&id), None);
    }

    #[test]
    fn strong_history_predicts_with_high_confidence() {
        let router = default_router();
        let id = router.classify("write a function for parsing", None);

        // 50 successful routes to provider 1.
        observe_n(&router, &id, 1, 50);

        let prediction = router.predict(&id).expect("should qualify");
        assert_eq!(prediction.provider_id, 1);
        assert!(
            prediction.confidence > 0.7,
            "confidence {} too low",
            prediction.confidence
        );
    }

    #[test]
    fn low_frequency_penalizes_confidence() {
        let router = default_router();
        let id = router.classify("rare pattern prompt", None);

        // One perfect observation: sample and frequency factors keep it low.
        router.observe(&id, 0, true);
        assert_eq!(router.predict(&id), None);
        assert_eq!(router.stats().low_confidence_discards, 1);
    }

    #[test]
    fn failures_erode_confidence() {
        let router = default_router();
        let id = router.classify("flaky pattern prompt", None);

        observe_n(&router, &id, 0, 30);
        assert!(router.predict(&id).is_some());

        for _ in 0..60 {
            router.observe(&id, 0, false);
        }
        assert_eq!(
            router.predict(&id),
            None,
            "sustained failures must push confidence below threshold"
        );
    }

    #[test]
    fn best_provider_wins_ties_by_lowest_id() {
        let router = default_router();
        let id = router.classify("tie breaking prompt", None);

        observe_n(&router, &id, 2, 40);
        observe_n(&router, &id, 1, 40);

        let prediction = router.predict(&id).expect("should qualify");
        assert_eq!(prediction.provider_id, 1);
    }

    #[test]
    fn expired_cache_entries_are_absent() {
        let config = PredictionConfig {
            cache_ttl_secs: 0,
            ..PredictionConfig::default()
        };
        let router = router_with(config);
        let id = router.classify("ttl test prompt", None);
        observe_n(&router, &id, 0, 50);

        // TTL of zero: every lookup recomputes.
        router.predict(&id);
        router.predict(&id);
        let stats = router.stats();
        assert_eq!(stats.cache_hits, 0);
        assert_eq!(stats.cache_misses, 2);
    }

    #[test]
    fn observed_patterns_are_served_from_cache() {
        let router = default_router();
        let id = router.classify("cache hit prompt", None);
        // observe() refreshes the cache entry, so lookups hit immediately.
        observe_n(&router, &id, 0, 50);

        router.predict(&id);
        router.predict(&id);
        let stats = router.stats();
        assert_eq!(stats.cache_hits, 2);
        assert_eq!(stats.cache_misses, 0);
        assert!((stats.cache_hit_rate - 1.0).abs() < 1e-9);
    }

    #[test]
    fn observe_refreshes_cache() {
        let router = default_router();
        let id = router.classify("refresh prompt", None);
        observe_n(&router, &id, 0, 50);

        let before = router.predict(&id).unwrap();
        // New evidence flows into the cached prediction without waiting for TTL.
        for _ in 0..40 {
            router.observe(&id, 0, false);
        }
        let after = router.predict(&id);
        assert!(after.is_none() || after.unwrap().confidence < before.confidence);
    }

    #[test]
    fn stats_counts_patterns() {
        let router = default_router();
        router.observe(&router.classify("prompt one", None), 0, true);
        router.observe(&router.classify("a completely different prompt", None), 1, true);

        let stats = router.stats();
        assert_eq!(stats.pattern_count, 2);
        assert_eq!(stats.total_observations, 2);
    }
}

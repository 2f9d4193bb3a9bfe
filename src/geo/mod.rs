//! Geographic routing signals.
//!
//! Biases selection toward providers with lower observed latency to the
//! caller's region. Geography only narrows preference, never eligibility:
//! the score is a [0, 1] adjustment merged into the composite rank, and a
//! provider with no regional data scores neutral rather than being
//! excluded. Region resolution is best-effort and never fails a request.

use std::collections::HashSet;
use std::net::IpAddr;

use dashmap::DashMap;
use serde::Serialize;

use crate::config::{GeoConfig, ProviderConfig, RoutingRule};

/// Neutral score for providers without enough regional samples.
const NEUTRAL_SCORE: f64 = 0.5;

#[derive(Debug, Clone, Copy)]
struct RegionLatency {
    total_ms: f64,
    samples: u64,
}

/// Observed latency for one provider in one region, for dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct RegionLatencyStat {
    pub provider: String,
    pub region: String,
    pub avg_latency_ms: f64,
    pub sample_count: u64,
}

/// Scores providers by proximity to the caller's region.
pub struct GeoRouter {
    config: GeoConfig,
    provider_names: Vec<String>,
    /// Static capability declarations, by provider id
    provider_regions: Vec<HashSet<String>>,
    stats: DashMap<(usize, String), RegionLatency>,
    /// Enabled rules sorted by priority, highest first
    rules: Vec<RoutingRule>,
}

impl GeoRouter {
    pub fn new(providers: &[ProviderConfig], config: GeoConfig) -> Self {
        let provider_names = providers.iter().map(|p| p.name.clone()).collect();
        let provider_regions = providers
            .iter()
            .map(|p| p.regions.iter().cloned().collect())
            .collect();

        let mut rules: Vec<RoutingRule> =
            config.rules.iter().filter(|r| r.enabled).cloned().collect();
        rules.sort_by_key(|r| std::cmp::Reverse(r.priority));

        Self {
            config,
            provider_names,
            provider_regions,
            stats: DashMap::new(),
            rules,
        }
    }

    /// Best-effort region of a client IP.
    ///
    /// Matches the configured prefix table textually; unknown or absent IPs
    /// fall back to the default region.
    pub fn region_of(&self, client_ip: Option<IpAddr>) -> String {
        if let Some(ip) = client_ip {
            let text = ip.to_string();
            for rule in &self.config.ip_prefixes {
                if text.starts_with(&rule.prefix) {
                    return rule.region.clone();
                }
            }
        }
        self.config.default_region.clone()
    }

    /// Latency-proximity score for a provider in a region, in [0, 1].
    ///
    /// Below `min_samples` the observed data is ignored and the provider
    /// scores neutral. Declared coverage of the region adds a bonus either
    /// way, so providers with explicit presence are preferred over ones
    /// with none.
    pub fn score(&self, provider_id: usize, region: &str) -> f64 {
        let base = self
            .stats
            .get(&(provider_id, region.to_string()))
            .filter(|entry| entry.samples >= self.config.min_samples)
            .map(|entry| {
                let avg = entry.total_ms / entry.samples as f64;
                self.config.baseline_latency_ms / (self.config.baseline_latency_ms + avg)
            })
            .unwrap_or(NEUTRAL_SCORE);

        let bonus = if self.declares_region(provider_id, region) {
            self.config.coverage_bonus
        } else {
            0.0
        };

        (base + bonus).clamp(0.0, 1.0)
    }

    /// Whether a provider statically declares coverage of a region.
    pub fn declares_region(&self, provider_id: usize, region: &str) -> bool {
        self.provider_regions
            .get(provider_id)
            .is_some_and(|regions| regions.contains(region))
    }

    /// Highest-priority enabled rule matching the client region, if any.
    ///
    /// A matching rule may pin a preferred region whose latency statistics
    /// drive scoring instead of the client's own.
    pub fn active_rule(&self, client_region: &str) -> Option<&RoutingRule> {
        self.rules.iter().find(|rule| {
            rule.client_region
                .as_deref()
                .map_or(true, |r| r == client_region)
        })
    }

    /// Fold one completed-request latency sample into the region table.
    pub fn record_latency(&self, provider_id: usize, region: &str, latency_ms: f64) {
        let mut entry = self
            .stats
            .entry((provider_id, region.to_string()))
            .or_insert(RegionLatency {
                total_ms: 0.0,
                samples: 0,
            });
        entry.total_ms += latency_ms;
        entry.samples += 1;
    }

    /// All observed region latency rows, for the geo stats endpoint.
    pub fn latency_stats(&self) -> Vec<RegionLatencyStat> {
        let mut rows: Vec<RegionLatencyStat> = self
            .stats
            .iter()
            .map(|entry| {
                let (provider_id, region) = entry.key();
                RegionLatencyStat {
                    provider: self
                        .provider_names
                        .get(*provider_id)
                        .cloned()
                        .unwrap_or_else(|| format!("provider-{}", provider_id)),
                    region: region.clone(),
                    avg_latency_ms: entry.total_ms / entry.samples as f64,
                    sample_count: entry.samples,
                }
            })
            .collect();
        rows.sort_by(|a, b| a.provider.cmp(&b.provider).then(a.region.cmp(&b.region)));
        rows
    }

    /// Declared regions per provider, for the geo stats endpoint.
    pub fn provider_regions(&self) -> Vec<(String, Vec<String>)> {
        self.provider_names
            .iter()
            .zip(&self.provider_regions)
            .map(|(name, regions)| {
                let mut sorted: Vec<String> = regions.iter().cloned().collect();
                sorted.sort();
                (name.clone(), sorted)
            })
            .collect()
    }

    /// The enabled rules in evaluation order.
    pub fn rules(&self) -> &[RoutingRule] {
        &self.rules
    }

    pub fn default_region(&self) -> &str {
        &self.config.default_region
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IpPrefixRule;

    fn providers() -> Vec<ProviderConfig> {
        vec![
            ProviderConfig {
                name: "alpha".to_string(),
                url: "https://alpha.example.com/v1".to_string(),
                api_key: None,
                base_weight: 1.0,
                cost_per_1k_tokens: 0.01,
                regions: vec!["us-east".to_string(), "eu-west".to_string()],
            },
            ProviderConfig {
                name: "beta".to_string(),
                url: "https://beta.example.com/v1".to_string(),
                api_key: None,
                base_weight: 1.0,
                cost_per_1k_tokens: 0.01,
                regions: vec![],
            },
        ]
    }

    fn geo_config() -> GeoConfig {
        GeoConfig {
            ip_prefixes: vec![
                IpPrefixRule {
                    prefix: "10.1.".to_string(),
                    region: "us-east".to_string(),
                },
                IpPrefixRule {
                    prefix: "10.2.".to_string(),
                    region: "eu-west".to_string(),
                },
            ],
            ..GeoConfig::default()
        }
    }

    #[test]
    fn unknown_ip_falls_back_to_default_region() {
        let router = GeoRouter::new(&providers(), geo_config());
        assert_eq!(router.region_of(None), "global");
        assert_eq!(
            router.region_of(Some("192.168.1.1".parse().unwrap())),
            "global"
        );
    }

    #[test]
    fn prefix_match_resolves_region() {
        let router = GeoRouter::new(&providers(), geo_config());
        assert_eq!(
            router.region_of(Some("10.1.4.7".parse().unwrap())),
            "us-east"
        );
        assert_eq!(
            router.region_of(Some("10.2.0.1".parse().unwrap())),
            "eu-west"
        );
    }

    #[test]
    fn no_samples_scores_neutral_plus_coverage() {
        let router = GeoRouter::new(&providers(), geo_config());
        // alpha declares us-east: neutral + bonus. beta declares nothing: neutral.
        assert!((router.score(0, "us-east") - 0.7).abs() < 1e-9);
        assert!((router.score(1, "us-east") - 0.5).abs() < 1e-9);
    }

    #[test]
    fn below_min_samples_stays_neutral() {
        let router = GeoRouter::new(&providers(), geo_config());
        // 4 samples < min_samples of 5: data ignored.
        for _ in 0..4 {
            router.record_latency(1, "us-east", 10_000.0);
        }
        assert!((router.score(1, "us-east") - 0.5).abs() < 1e-9);
    }

    #[test]
    fn low_latency_beats_high_latency() {
        let router = GeoRouter::new(&providers(), geo_config());
        for _ in 0..10 {
            router.record_latency(0, "eu-west", 50.0);
            router.record_latency(1, "eu-west", 2000.0);
        }
        // Even without alpha's coverage bonus the latency gap dominates.
        let fast = router.score(0, "eu-west");
        let slow = router.score(1, "eu-west");
        assert!(fast > slow, "{} !> {}", fast, slow);
    }

    #[test]
    fn score_is_never_an_exclusion() {
        let router = GeoRouter::new(&providers(), geo_config());
        for _ in 0..100 {
            router.record_latency(1, "us-east", 60_000.0);
        }
        assert!(router.score(1, "us-east") > 0.0);
    }

    #[test]
    fn rules_match_by_priority() {
        let mut config = geo_config();
        config.rules = vec![
            RoutingRule {
                rule_id: "low".to_string(),
                name: "catch-all".to_string(),
                enabled: true,
                priority: 1,
                client_region: None,
                preferred_region: None,
                description: String::new(),
            },
            RoutingRule {
                rule_id: "high".to_string(),
                name: "pin-eu".to_string(),
                enabled: true,
                priority: 10,
                client_region: Some("eu-west".to_string()),
                preferred_region: Some("eu-west".to_string()),
                description: String::new(),
            },
        ];
        let router = GeoRouter::new(&providers(), config);

        assert_eq!(router.active_rule("eu-west").unwrap().rule_id, "high");
        assert_eq!(router.active_rule("us-east").unwrap().rule_id, "low");
    }

    #[test]
    fn disabled_rules_are_skipped() {
        let mut config = geo_config();
        config.rules = vec![RoutingRule {
            rule_id: "off".to_string(),
            name: "disabled".to_string(),
            enabled: false,
            priority: 100,
            client_region: None,
            preferred_region: None,
            description: String::new(),
        }];
        let router = GeoRouter::new(&providers(), config);
        assert!(router.active_rule("us-east").is_none());
    }

    #[test]
    fn latency_stats_aggregate() {
        let router = GeoRouter::new(&providers(), geo_config());
        router.record_latency(0, "us-east", 100.0);
        router.record_latency(0, "us-east", 200.0);

        let stats = router.latency_stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].provider, "alpha");
        assert_eq!(stats[0].sample_count, 2);
        assert!((stats[0].avg_latency_ms - 150.0).abs() < 1e-9);
    }
}

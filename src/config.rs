//! Configuration parsing and validation for polyroute.
//!
//! All feature flags and tuning knobs live in one immutable [`Config`]
//! loaded at startup and injected into each component. Validation is
//! fail-fast: a malformed config blocks service start and can never
//! surface at request time.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::path::Path;

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: Option<DatabaseConfig>,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub weights: WeightConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub prediction: PredictionConfig,
    #[serde(default)]
    pub geo: GeoConfig,
    #[serde(default)]
    pub cost: CostConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on (e.g., "127.0.0.1:8080")
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

/// Database configuration for the routing decision log.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    "./polyroute.db".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// API key wrapper that redacts in Debug/Display/Serialize and zeroizes on drop.
#[derive(Clone)]
pub struct ApiKey(SecretString);

impl ApiKey {
    /// Access the raw key value. Every call site is auditable via `grep expose_secret`.
    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl std::fmt::Display for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl Serialize for ApiKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("[REDACTED]")
    }
}

impl<'de> Deserialize<'de> for ApiKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(|s| ApiKey(SecretString::from(s)))
    }
}

impl From<&str> for ApiKey {
    fn from(s: &str) -> Self {
        ApiKey(SecretString::from(s))
    }
}

/// Upstream provider configuration.
///
/// Runtime state (weights, EMAs, health) is derived from observed traffic;
/// this struct only declares what is known statically.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    /// Unique name for this provider
    pub name: String,
    /// Base URL for the provider's API
    pub url: String,
    /// Optional API key, expanded from `${VAR}` references
    pub api_key: Option<ApiKey>,
    /// Starting dispatch weight before any feedback is observed
    #[serde(default = "default_base_weight")]
    pub base_weight: f64,
    /// Initial cost in USD per 1000 tokens, refined by the cost EMA
    #[serde(default)]
    pub cost_per_1k_tokens: f64,
    /// Regions this provider declares coverage for
    #[serde(default)]
    pub regions: Vec<String>,
}

fn default_base_weight() -> f64 {
    1.0
}

/// Dispatcher configuration: feature flags and the composite-rank blend.
#[derive(Debug, Clone, Deserialize)]
pub struct RoutingConfig {
    #[serde(default = "default_true")]
    pub load_balancer_enabled: bool,
    #[serde(default = "default_true")]
    pub predictive_routing_enabled: bool,
    /// When false, only the top-ranked candidate is ever attempted.
    #[serde(default = "default_true")]
    pub fallback_enabled: bool,
    /// Upper bound on candidates attempted for one request
    #[serde(default = "default_max_providers")]
    pub max_providers_per_request: usize,
    /// Per-attempt upstream timeout in milliseconds
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
    /// Coefficient on the normalized current weight
    #[serde(default = "default_weight_coeff")]
    pub weight_coeff: f64,
    /// Coefficient on the geographic score
    #[serde(default = "default_geo_coeff")]
    pub geo_coeff: f64,
    /// Coefficient on the cost score
    #[serde(default = "default_cost_coeff")]
    pub cost_coeff: f64,
    /// Bonus added to a provider suggested with qualifying confidence
    #[serde(default = "default_predictive_bonus")]
    pub predictive_bonus: f64,
}

fn default_max_providers() -> usize {
    3
}

fn default_attempt_timeout_ms() -> u64 {
    30_000
}

fn default_weight_coeff() -> f64 {
    0.5
}

fn default_geo_coeff() -> f64 {
    0.25
}

fn default_cost_coeff() -> f64 {
    0.25
}

fn default_predictive_bonus() -> f64 {
    0.5
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            load_balancer_enabled: true,
            predictive_routing_enabled: true,
            fallback_enabled: true,
            max_providers_per_request: default_max_providers(),
            attempt_timeout_ms: default_attempt_timeout_ms(),
            weight_coeff: default_weight_coeff(),
            geo_coeff: default_geo_coeff(),
            cost_coeff: default_cost_coeff(),
            predictive_bonus: default_predictive_bonus(),
        }
    }
}

/// Weight manager configuration: EMA smoothing and the performance blend.
///
/// The five component weights must sum to 1.0; this is checked at load.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WeightConfig {
    #[serde(default = "default_min_weight")]
    pub min_weight: f64,
    #[serde(default = "default_max_weight")]
    pub max_weight: f64,
    /// How strongly the performance score moves the multiplier away from 1.0
    #[serde(default = "default_sensitivity")]
    pub sensitivity: f64,
    /// Relative weight change that triggers a recorded adjustment
    #[serde(default = "default_rebalance_threshold")]
    pub rebalance_threshold: f64,

    #[serde(default = "default_response_alpha")]
    pub response_time_alpha: f64,
    #[serde(default = "default_success_alpha")]
    pub success_rate_alpha: f64,
    #[serde(default = "default_cost_alpha")]
    pub cost_alpha: f64,
    #[serde(default = "default_availability_alpha")]
    pub availability_alpha: f64,

    // Component weights of the performance score; must sum to 1.0.
    #[serde(default = "default_performance_weight")]
    pub performance_weight: f64,
    #[serde(default = "default_availability_weight")]
    pub availability_weight: f64,
    #[serde(default = "default_cost_weight")]
    pub cost_weight: f64,
    #[serde(default = "default_response_time_weight")]
    pub response_time_weight: f64,
    #[serde(default = "default_load_balance_weight")]
    pub load_balance_weight: f64,

    /// Response-time normalization anchor: an EMA at this value scores 0.5
    #[serde(default = "default_baseline_response_ms")]
    pub baseline_response_ms: f64,
    /// Cost normalization anchor: an EMA at this value scores 0.5
    #[serde(default = "default_baseline_cost_per_1k")]
    pub baseline_cost_per_1k: f64,
}

fn default_min_weight() -> f64 {
    0.05
}

fn default_max_weight() -> f64 {
    2.0
}

fn default_sensitivity() -> f64 {
    1.0
}

fn default_rebalance_threshold() -> f64 {
    0.15
}

fn default_response_alpha() -> f64 {
    0.2
}

fn default_success_alpha() -> f64 {
    0.1
}

fn default_cost_alpha() -> f64 {
    0.1
}

fn default_availability_alpha() -> f64 {
    0.1
}

fn default_performance_weight() -> f64 {
    0.3
}

fn default_availability_weight() -> f64 {
    0.2
}

fn default_cost_weight() -> f64 {
    0.2
}

fn default_response_time_weight() -> f64 {
    0.2
}

fn default_load_balance_weight() -> f64 {
    0.1
}

fn default_baseline_response_ms() -> f64 {
    1500.0
}

fn default_baseline_cost_per_1k() -> f64 {
    0.01
}

impl Default for WeightConfig {
    fn default() -> Self {
        Self {
            min_weight: default_min_weight(),
            max_weight: default_max_weight(),
            sensitivity: default_sensitivity(),
            rebalance_threshold: default_rebalance_threshold(),
            response_time_alpha: default_response_alpha(),
            success_rate_alpha: default_success_alpha(),
            cost_alpha: default_cost_alpha(),
            availability_alpha: default_availability_alpha(),
            performance_weight: default_performance_weight(),
            availability_weight: default_availability_weight(),
            cost_weight: default_cost_weight(),
            response_time_weight: default_response_time_weight(),
            load_balance_weight: default_load_balance_weight(),
            baseline_response_ms: default_baseline_response_ms(),
            baseline_cost_per_1k: default_baseline_cost_per_1k(),
        }
    }
}

impl WeightConfig {
    /// Sum of the five performance-score component weights.
    pub fn component_weight_sum(&self) -> f64 {
        self.performance_weight
            + self.availability_weight
            + self.cost_weight
            + self.response_time_weight
            + self.load_balance_weight
    }
}

/// Health monitor configuration: probe cadence and hysteresis thresholds.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,
    /// Probe timeout; exceeding it counts as a failed probe
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// A successful probe slower than this counts toward degradation
    #[serde(default = "default_slow_probe_ms")]
    pub slow_probe_ms: u64,
    /// Consecutive bad probes before healthy -> degraded
    #[serde(default = "default_degraded_threshold")]
    pub degraded_threshold: u32,
    /// Further consecutive bad probes before degraded -> unhealthy
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,
    /// Consecutive clean probes required to return to healthy
    #[serde(default = "default_recovery_threshold")]
    pub recovery_threshold: u32,
}

fn default_probe_interval_secs() -> u64 {
    30
}

fn default_probe_timeout_ms() -> u64 {
    5_000
}

fn default_slow_probe_ms() -> u64 {
    3_000
}

fn default_degraded_threshold() -> u32 {
    3
}

fn default_unhealthy_threshold() -> u32 {
    3
}

fn default_recovery_threshold() -> u32 {
    2
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval_secs: default_probe_interval_secs(),
            probe_timeout_ms: default_probe_timeout_ms(),
            slow_probe_ms: default_slow_probe_ms(),
            degraded_threshold: default_degraded_threshold(),
            unhealthy_threshold: default_unhealthy_threshold(),
            recovery_threshold: default_recovery_threshold(),
        }
    }
}

/// Predictive router configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PredictionConfig {
    /// Predictions below this confidence are discarded
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// EMA alpha for per-pattern success-rate decay
    #[serde(default = "default_pattern_alpha")]
    pub pattern_alpha: f64,
    /// Sample count at which the sample-size discount reaches 0.5
    #[serde(default = "default_smoothing_samples")]
    pub smoothing_samples: u64,
    /// Pattern frequency below this penalizes confidence proportionally
    #[serde(default = "default_min_frequency")]
    pub min_frequency: u64,
}

fn default_confidence_threshold() -> f64 {
    0.7
}

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_pattern_alpha() -> f64 {
    0.1
}

fn default_smoothing_samples() -> u64 {
    10
}

fn default_min_frequency() -> u64 {
    5
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
            cache_ttl_secs: default_cache_ttl_secs(),
            pattern_alpha: default_pattern_alpha(),
            smoothing_samples: default_smoothing_samples(),
            min_frequency: default_min_frequency(),
        }
    }
}

/// Geographic router configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct GeoConfig {
    /// Region assumed for clients that cannot be located
    #[serde(default = "default_region")]
    pub default_region: String,
    /// Samples required before region latency influences scoring
    #[serde(default = "default_geo_min_samples")]
    pub min_samples: u64,
    /// Score bonus for providers declaring coverage of the client region
    #[serde(default = "default_coverage_bonus")]
    pub coverage_bonus: f64,
    /// Latency normalization anchor: a region average at this value scores 0.5
    #[serde(default = "default_geo_baseline_ms")]
    pub baseline_latency_ms: f64,
    /// Static mapping from client IP prefix to region
    #[serde(default)]
    pub ip_prefixes: Vec<IpPrefixRule>,
    /// Region routing rules, consulted highest priority first
    #[serde(default)]
    pub rules: Vec<RoutingRule>,
}

fn default_region() -> String {
    "global".to_string()
}

fn default_geo_min_samples() -> u64 {
    5
}

fn default_coverage_bonus() -> f64 {
    0.2
}

fn default_geo_baseline_ms() -> f64 {
    250.0
}

impl Default for GeoConfig {
    fn default() -> Self {
        Self {
            default_region: default_region(),
            min_samples: default_geo_min_samples(),
            coverage_bonus: default_coverage_bonus(),
            baseline_latency_ms: default_geo_baseline_ms(),
            ip_prefixes: Vec::new(),
            rules: Vec::new(),
        }
    }
}

/// Maps a textual IP prefix (e.g. "10.1.") to a region.
#[derive(Debug, Clone, Deserialize)]
pub struct IpPrefixRule {
    pub prefix: String,
    pub region: String,
}

/// A static region routing rule. Consulted but never mutated by the hot path.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RoutingRule {
    pub rule_id: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: i32,
    /// Client region this rule applies to; None matches every region
    pub client_region: Option<String>,
    /// Region whose latency statistics should drive scoring when this rule fires
    pub preferred_region: Option<String>,
    #[serde(default)]
    pub description: String,
}

/// Cost estimator configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CostConfig {
    /// Composite-score distance within which providers count as performance peers
    #[serde(default = "default_parity_band")]
    pub parity_band: f64,
    /// Characters per token for the input estimate
    #[serde(default = "default_chars_per_token")]
    pub chars_per_token: u32,
    /// Assumed completion size when the request does not bound it
    #[serde(default = "default_expected_output_tokens")]
    pub expected_output_tokens: u32,
}

fn default_parity_band() -> f64 {
    0.05
}

fn default_chars_per_token() -> u32 {
    4
}

fn default_expected_output_tokens() -> u32 {
    500
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            parity_band: default_parity_band(),
            chars_per_token: default_chars_per_token(),
            expected_output_tokens: default_expected_output_tokens(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Whether to persist routing decisions to the database
    #[serde(default = "default_true")]
    pub log_decisions: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_decisions: true,
        }
    }
}

/// Configuration errors. Fatal at startup, never at request time.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Configuration validation error: {0}")]
    Validation(String),

    #[error("Environment variable '{var}' not set for provider '{provider}': {message}")]
    EnvVar {
        var: String,
        provider: String,
        message: String,
    },
}

/// Tolerance for the component-weight sum check.
const WEIGHT_SUM_EPSILON: f64 = 1e-6;

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;
        Self::parse_str(&content)
    }

    /// Parse configuration from a TOML string, expanding `${VAR}` references
    /// in provider API keys from the environment.
    pub fn parse_str(content: &str) -> Result<Self, ConfigError> {
        Self::parse_str_with(content, |name| std::env::var(name).ok())
    }

    /// Parse with a custom env lookup. The closure-based design keeps env
    /// expansion testable without touching global state.
    pub fn parse_str_with<F>(content: &str, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config: Config = toml::from_str(content)?;
        for provider in &mut config.providers {
            if let Some(key) = &provider.api_key {
                let raw = key.expose_secret();
                if raw.contains("${") {
                    let expanded = expand_env_vars(raw, &provider.name, &lookup)?;
                    provider.api_key = Some(ApiKey::from(expanded.as_str()));
                }
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration. Any failure here blocks service start.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.providers.is_empty() {
            tracing::warn!("No providers configured - router will reject all requests");
        }

        let mut seen = std::collections::HashSet::new();
        for provider in &self.providers {
            if provider.url.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "Provider '{}' has empty URL",
                    provider.name
                )));
            }
            if !seen.insert(provider.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate provider name '{}'",
                    provider.name
                )));
            }
            if provider.base_weight <= 0.0 {
                return Err(ConfigError::Validation(format!(
                    "Provider '{}' base_weight must be positive",
                    provider.name
                )));
            }
        }

        let sum = self.weights.component_weight_sum();
        if (sum - 1.0).abs() > WEIGHT_SUM_EPSILON {
            return Err(ConfigError::Validation(format!(
                "Weight components must sum to 1.0, got {:.6} \
                 (performance + availability + cost + response_time + load_balance)",
                sum
            )));
        }

        for (name, alpha) in [
            ("response_time_alpha", self.weights.response_time_alpha),
            ("success_rate_alpha", self.weights.success_rate_alpha),
            ("cost_alpha", self.weights.cost_alpha),
            ("availability_alpha", self.weights.availability_alpha),
            ("pattern_alpha", self.prediction.pattern_alpha),
        ] {
            if !(alpha > 0.0 && alpha <= 1.0) {
                return Err(ConfigError::Validation(format!(
                    "{} must be in (0.0, 1.0], got {}",
                    name, alpha
                )));
            }
        }

        if self.weights.min_weight > self.weights.max_weight {
            return Err(ConfigError::Validation(format!(
                "min_weight {} exceeds max_weight {}",
                self.weights.min_weight, self.weights.max_weight
            )));
        }

        if !(0.0..=1.0).contains(&self.prediction.confidence_threshold) {
            return Err(ConfigError::Validation(format!(
                "confidence_threshold must be in [0.0, 1.0], got {}",
                self.prediction.confidence_threshold
            )));
        }

        if self.routing.max_providers_per_request == 0 {
            return Err(ConfigError::Validation(
                "max_providers_per_request must be at least 1".to_string(),
            ));
        }

        let mut rule_ids = std::collections::HashSet::new();
        for rule in &self.geo.rules {
            if !rule_ids.insert(rule.rule_id.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate routing rule id '{}'",
                    rule.rule_id
                )));
            }
        }

        Ok(())
    }

    /// Get database config with defaults.
    pub fn database(&self) -> DatabaseConfig {
        self.database.clone().unwrap_or_default()
    }
}

/// Expand all `${VAR}` references in a string using a lookup function.
///
/// Supports multiple `${VAR}` in one value. Fails on the first missing
/// variable, unclosed `${`, or empty variable name.
fn expand_env_vars<F>(input: &str, provider_name: &str, lookup: &F) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];

        let end = after.find('}').ok_or_else(|| ConfigError::EnvVar {
            var: "<unclosed>".to_string(),
            provider: provider_name.to_string(),
            message: format!("Unclosed '${{' in config value: {}", input),
        })?;

        let var_name = &after[..end];
        if var_name.is_empty() {
            return Err(ConfigError::EnvVar {
                var: String::new(),
                provider: provider_name.to_string(),
                message: "Empty variable name in '${}' reference".to_string(),
            });
        }

        let value = lookup(var_name).ok_or_else(|| ConfigError::EnvVar {
            var: var_name.to_string(),
            provider: provider_name.to_string(),
            message: format!(
                "Environment variable '{}' is not set (referenced in provider '{}')",
                var_name, provider_name
            ),
        })?;

        result.push_str(&value);
        rest = &after[end + 1..];
    }

    result.push_str(rest);
    Ok(result)
}

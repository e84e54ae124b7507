//! Router configuration types.
//!
//! The shapes here mirror the language-agnostic configuration surface the
//! surrounding product ships: a list of strategy definitions plus routing,
//! adaptive, retry, and load-balance settings. Loaded once at startup.

use std::collections::HashMap;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("duplicate strategy name `{0}`")]
    DuplicateStrategy(String),
    #[error("strategy `{strategy}` references unknown fallback `{fallback}`")]
    UnknownFallback { strategy: String, fallback: String },
    #[error("strategy `{0}` has maxConcurrency of zero")]
    ZeroConcurrency(String),
    #[error("load balance weights reference unknown strategy `{0}`")]
    UnknownWeight(String),
    #[error("no strategies configured")]
    Empty,
}

/// Routing policy used to order strategies for each request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingPolicy {
    Priority,
    Adaptive,
    LoadBalance,
    Failover,
}

impl Default for RoutingPolicy {
    fn default() -> Self {
        RoutingPolicy::Adaptive
    }
}

/// Sub-policy used when `RoutingPolicy::LoadBalance` is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceAlgorithm {
    RoundRobin,
    Weighted,
    LeastConnections,
    ResponseTime,
}

impl Default for LoadBalanceAlgorithm {
    fn default() -> Self {
        LoadBalanceAlgorithm::RoundRobin
    }
}

/// One configured acquisition strategy. Immutable after load.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyDefinition {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: u8,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: u32,
    #[serde(default)]
    pub prerequisites: Vec<String>,
    #[serde(default)]
    pub fallback_methods: Vec<String>,
}

impl StrategyDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            priority: 0,
            weight: default_weight(),
            timeout_ms: default_timeout_ms(),
            max_concurrency: default_max_concurrency(),
            prerequisites: Vec::new(),
            fallback_methods: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_concurrency(mut self, max: u32) -> Self {
        self.max_concurrency = max;
        self
    }

    pub fn with_prerequisites<I, S>(mut self, prerequisites: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.prerequisites = prerequisites.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_fallbacks<I, S>(mut self, fallbacks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fallback_methods = fallbacks.into_iter().map(Into::into).collect();
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_enabled() -> bool {
    true
}

fn default_weight() -> u32 {
    1
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_max_concurrency() -> u32 {
    4
}

/// Tuning knobs for rolling evaluation and adaptive scoring.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AdaptiveSettings {
    /// Attempts required before the breaker may judge a strategy.
    pub min_sample_size: u32,
    /// Success-rate floor used by the failover policy.
    pub success_rate_threshold: f64,
    /// Load times above this are flagged as slow by risk evaluation.
    pub response_time_threshold_ms: u64,
    /// Interval between evaluation/health passes.
    pub evaluation_interval_ms: u64,
}

impl Default for AdaptiveSettings {
    fn default() -> Self {
        Self {
            min_sample_size: 5,
            success_rate_threshold: 0.7,
            response_time_threshold_ms: 10_000,
            evaluation_interval_ms: 30_000,
        }
    }
}

impl AdaptiveSettings {
    pub fn evaluation_interval(&self) -> Duration {
        Duration::from_millis(self.evaluation_interval_ms)
    }

    pub fn response_time_threshold(&self) -> Duration {
        Duration::from_millis(self.response_time_threshold_ms)
    }
}

/// Retry and circuit-breaker tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub exponential_backoff: bool,
    /// Failure-rate tolerance: the breaker opens once
    /// `success_rate < 1 - circuit_breaker_threshold`.
    pub circuit_breaker_threshold: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_delay_ms: 1_000,
            exponential_backoff: true,
            circuit_breaker_threshold: 0.5,
        }
    }
}

impl RetrySettings {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Load-balance sub-policy configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoadBalanceSettings {
    pub algorithm: LoadBalanceAlgorithm,
    /// Optional per-strategy weight overrides for the weighted algorithm.
    pub weights: Option<HashMap<String, u32>>,
}

/// Top-level router configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RouterConfig {
    pub strategies: Vec<StrategyDefinition>,
    pub strategy: RoutingPolicy,
    pub adaptive_settings: AdaptiveSettings,
    pub retry_settings: RetrySettings,
    pub load_balance_settings: LoadBalanceSettings,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            strategies: Vec::new(),
            strategy: RoutingPolicy::default(),
            adaptive_settings: AdaptiveSettings::default(),
            retry_settings: RetrySettings::default(),
            load_balance_settings: LoadBalanceSettings::default(),
        }
    }
}

impl RouterConfig {
    pub fn builder() -> RouterConfigBuilder {
        RouterConfigBuilder::new()
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: RouterConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Check internal consistency. Called by the loaders and the router
    /// builder; callers constructing configs by hand may invoke it directly.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.strategies.is_empty() {
            return Err(ConfigError::Empty);
        }

        let mut names = HashSet::new();
        for definition in &self.strategies {
            if !names.insert(definition.name.clone()) {
                return Err(ConfigError::DuplicateStrategy(definition.name.clone()));
            }
            if definition.max_concurrency == 0 {
                return Err(ConfigError::ZeroConcurrency(definition.name.clone()));
            }
        }

        for definition in &self.strategies {
            for fallback in &definition.fallback_methods {
                if !names.contains(fallback) {
                    return Err(ConfigError::UnknownFallback {
                        strategy: definition.name.clone(),
                        fallback: fallback.clone(),
                    });
                }
            }
        }

        if let Some(weights) = &self.load_balance_settings.weights {
            for name in weights.keys() {
                if !names.contains(name) {
                    return Err(ConfigError::UnknownWeight(name.clone()));
                }
            }
        }

        Ok(())
    }

    /// Effective weight for a strategy, honoring load-balance overrides.
    pub fn weight_for(&self, definition: &StrategyDefinition) -> u32 {
        self.load_balance_settings
            .weights
            .as_ref()
            .and_then(|weights| weights.get(&definition.name).copied())
            .unwrap_or(definition.weight)
    }
}

/// Fluent builder for [`RouterConfig`].
#[derive(Debug, Default)]
pub struct RouterConfigBuilder {
    config: RouterConfig,
}

impl RouterConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: RouterConfig::default(),
        }
    }

    pub fn with_strategy(mut self, definition: StrategyDefinition) -> Self {
        self.config.strategies.push(definition);
        self
    }

    pub fn with_policy(mut self, policy: RoutingPolicy) -> Self {
        self.config.strategy = policy;
        self
    }

    pub fn with_adaptive_settings(mut self, settings: AdaptiveSettings) -> Self {
        self.config.adaptive_settings = settings;
        self
    }

    pub fn with_retry_settings(mut self, settings: RetrySettings) -> Self {
        self.config.retry_settings = settings;
        self
    }

    pub fn with_load_balance_settings(mut self, settings: LoadBalanceSettings) -> Self {
        self.config.load_balance_settings = settings;
        self
    }

    pub fn build(self) -> Result<RouterConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_camel_case_json() {
        let raw = r#"{
            "strategies": [
                {"name": "browser", "priority": 8, "timeoutMs": 45000, "maxConcurrency": 2},
                {"name": "unblocker", "priority": 5, "fallbackMethods": ["browser"]}
            ],
            "strategy": "adaptive",
            "retrySettings": {"maxRetries": 3, "retryDelayMs": 500, "exponentialBackoff": true},
            "loadBalanceSettings": {"algorithm": "least_connections"}
        }"#;

        let config = RouterConfig::from_json_str(raw).expect("valid config");
        assert_eq!(config.strategies.len(), 2);
        assert_eq!(config.strategy, RoutingPolicy::Adaptive);
        assert_eq!(config.retry_settings.max_retries, 3);
        assert_eq!(
            config.load_balance_settings.algorithm,
            LoadBalanceAlgorithm::LeastConnections
        );
        assert_eq!(config.strategies[0].timeout(), Duration::from_secs(45));
    }

    #[test]
    fn rejects_unknown_fallback() {
        let config = RouterConfig::builder()
            .with_strategy(StrategyDefinition::new("browser").with_fallbacks(["ghost"]))
            .build();
        assert!(matches!(config, Err(ConfigError::UnknownFallback { .. })));
    }

    #[test]
    fn rejects_duplicate_names() {
        let config = RouterConfig::builder()
            .with_strategy(StrategyDefinition::new("direct"))
            .with_strategy(StrategyDefinition::new("direct"))
            .build();
        assert!(matches!(config, Err(ConfigError::DuplicateStrategy(_))));
    }

    #[test]
    fn weight_overrides_apply() {
        let mut weights = HashMap::new();
        weights.insert("direct".to_string(), 7);
        let config = RouterConfig::builder()
            .with_strategy(StrategyDefinition::new("direct").with_weight(2))
            .with_load_balance_settings(LoadBalanceSettings {
                algorithm: LoadBalanceAlgorithm::Weighted,
                weights: Some(weights),
            })
            .build()
            .expect("valid");
        assert_eq!(config.weight_for(&config.strategies[0]), 7);
    }
}

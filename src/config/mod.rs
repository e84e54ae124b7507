//! Settings and configuration module
//!
//! Provides unified configuration with:
//! - Builder pattern
//! - JSON loading
//! - Validation of strategy definitions and cross-references

pub mod config;

pub use config::{
    AdaptiveSettings, ConfigError, LoadBalanceAlgorithm, LoadBalanceSettings, RetrySettings,
    RouterConfig, RouterConfigBuilder, RoutingPolicy, StrategyDefinition,
};

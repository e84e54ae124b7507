//! # routeshield-rs
//!
//! Adaptive multi-strategy request routing for scraping infrastructure that
//! has to survive bot-resistant targets.
//!
//! A `route()` call picks the most promising acquisition strategy from a
//! configured set (direct HTTP, headless browser, unblocker proxies, and so
//! on), falls back down the chain on failure, and feeds every outcome back
//! into rolling per-strategy statistics. Around that core sit circuit
//! breakers with timed cooldowns, per-strategy concurrency caps, a
//! detection-signal monitor with layered CAPTCHA classification, a behavior
//! adaptor that folds signals into pacing guidance, and a proxy pool with
//! health checks and sticky sessions.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use routeshield_rs::{
//!     AdaptiveRouter, FetchOutcome, RouteRequest, RouterConfig, StrategyDefinition,
//!     StrategyError, StrategyImplementation,
//! };
//!
//! struct DirectHttp;
//!
//! #[async_trait::async_trait]
//! impl StrategyImplementation for DirectHttp {
//!     async fn execute(&self, _request: &RouteRequest) -> Result<FetchOutcome, StrategyError> {
//!         Ok(FetchOutcome::new(200, "<html>listings</html>"))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RouterConfig::builder()
//!         .with_strategy(StrategyDefinition::new("direct").with_priority(5))
//!         .build()?;
//!     let router = AdaptiveRouter::builder(config)
//!         .with_implementation("direct", Arc::new(DirectHttp))
//!         .build()?;
//!     router.start().await;
//!
//!     let result = router
//!         .route(RouteRequest::get("https://marketplace.example/item/1")?)
//!         .await?;
//!     println!("success={} via {:?}", result.success, result.final_strategy);
//!
//!     router.shutdown().await;
//!     Ok(())
//! }
//! ```

mod router;

pub mod config;
pub mod modules;
pub mod routing;

pub use crate::router::{
    AdaptiveRouter,
    AdaptiveRouterBuilder,
    RouterError,
    RouterResult,
    RouterStatistics,
    StrategyImplementation,
    StrategyStatistics,
};

pub use crate::config::{
    AdaptiveSettings,
    ConfigError,
    LoadBalanceAlgorithm,
    LoadBalanceSettings,
    RetrySettings,
    RouterConfig,
    RouterConfigBuilder,
    RoutingPolicy,
    StrategyDefinition,
};

pub use crate::routing::{
    AttemptError,
    BreakerEvaluator,
    BreakerTransition,
    ConcurrencyPermit,
    EvaluationParams,
    FetchOutcome,
    RouteAttempt,
    RouteRequest,
    RouteResult,
    SkipReason,
    StrategyError,
    StrategyRegistry,
    StrategySnapshot,
    BREAKER_COOLDOWN,
};

pub use crate::modules::{
    AttemptFinishedEvent,
    AttemptStartedEvent,
    BehaviorAdaptation,
    BehaviorAdaptor,
    BreakerEvent,
    CaptchaDetection,
    CaptchaKind,
    DetectionSignal,
    EndpointFilter,
    EndpointProber,
    EventDispatcher,
    EventHandler,
    LoggingHandler,
    PoolConfig,
    PoolHealthReport,
    PoolHealthTask,
    ProxyCredentials,
    ProxyEndpoint,
    ProxyPoolManager,
    ProxyProtocol,
    RetryScheduledEvent,
    RouterEvent,
    Severity,
    SignalMonitor,
    SignalType,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

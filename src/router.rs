//! High level routing orchestration.
//!
//! Wires together the strategy registry, ordering policies, circuit-breaker
//! evaluator, signal monitor, behavior adaptor, and proxy pool to expose a
//! single `route()` entry point that picks the best acquisition strategy for
//! each outbound fetch against a bot-resistant target.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use thiserror::Error;
use tokio::time::{sleep, timeout};

use crate::config::{ConfigError, RouterConfig};
use crate::modules::behavior::{BehaviorAdaptation, BehaviorAdaptor};
use crate::modules::events::{
    AttemptFinishedEvent, AttemptStartedEvent, EventDispatcher, EventHandler, LoggingHandler,
    RetryScheduledEvent, RouterEvent,
};
use crate::modules::pool::{
    EndpointFilter, EndpointProber, PoolHealthReport, PoolHealthTask, ProxyEndpoint,
    ProxyPoolManager,
};
use crate::modules::signals::{DetectionSignal, SignalMonitor, SignalType};
use crate::routing::breaker::BreakerEvaluator;
use crate::routing::registry::{ConcurrencyPermit, StrategyRegistry};
use crate::routing::types::{
    AttemptError, FetchOutcome, RouteAttempt, RouteRequest, RouteResult, SkipReason,
    StrategyError,
};
use crate::routing::policy;

/// Result alias used across the orchestration layer.
pub type RouterResult<T> = Result<T, RouterError>;

/// Escalated adaptations at or above this backoff abort the whole call so
/// the caller can cool off instead of burning remaining strategies.
const COOLDOWN_ABORT_THRESHOLD: Duration = Duration::from_millis(600_000);

/// Jitter applied to retry backoff delays.
const RETRY_JITTER: (f64, f64) = (0.7, 1.3);

/// High-level error surfaced by the orchestrator.
///
/// Per-attempt failures are absorbed into statistics and the attempt log;
/// only caller misuse and total pool exhaustion surface here.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("unknown strategy `{0}`")]
    UnknownStrategy(String),
    #[error("strategy `{0}` is disabled")]
    StrategyDisabled(String),
    #[error("no implementation registered for strategy `{0}`")]
    MissingImplementation(String),
    #[error("resource pool exhausted: {0}")]
    ResourcePoolExhausted(String),
}

/// Contract implemented by each acquisition strategy adapter.
///
/// Implementations perform exactly one fetch and return within the
/// caller-imposed timeout; they must not retry or consult circuit-breaker
/// state, both of which belong to the router.
#[async_trait]
pub trait StrategyImplementation: Send + Sync {
    async fn execute(&self, request: &RouteRequest) -> Result<FetchOutcome, StrategyError>;
}

/// Per-strategy slice of the observability surface.
#[derive(Debug, Clone)]
pub struct StrategyStatistics {
    pub name: String,
    pub attempts: u64,
    pub success_rate: f64,
    pub avg_response_time: Duration,
    pub concurrent_requests: u32,
    pub circuit_breaker_open: bool,
}

/// Snapshot returned by [`AdaptiveRouter::statistics`].
#[derive(Debug, Clone)]
pub struct RouterStatistics {
    pub strategies: Vec<StrategyStatistics>,
    pub pool: Option<PoolHealthReport>,
}

/// Fluent builder for [`AdaptiveRouter`].
pub struct AdaptiveRouterBuilder {
    config: RouterConfig,
    implementations: HashMap<String, Arc<dyn StrategyImplementation>>,
    pool: Option<ProxyPoolManager>,
    prober: Option<Arc<dyn EndpointProber>>,
    handlers: Vec<Arc<dyn EventHandler>>,
    available_services: HashSet<String>,
}

impl AdaptiveRouterBuilder {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            config,
            implementations: HashMap::new(),
            pool: None,
            prober: None,
            handlers: Vec::new(),
            available_services: HashSet::new(),
        }
    }

    pub fn with_implementation(
        mut self,
        name: impl Into<String>,
        implementation: Arc<dyn StrategyImplementation>,
    ) -> Self {
        self.implementations.insert(name.into(), implementation);
        self
    }

    pub fn with_pool(mut self, pool: ProxyPoolManager) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn with_prober(mut self, prober: Arc<dyn EndpointProber>) -> Self {
        self.prober = Some(prober);
        self
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Declare prerequisite services that are currently reachable.
    pub fn with_available_services<I, S>(mut self, services: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.available_services
            .extend(services.into_iter().map(Into::into));
        self
    }

    pub fn build(self) -> RouterResult<AdaptiveRouter> {
        self.config.validate()?;

        let registry = Arc::new(StrategyRegistry::from_config(&self.config));
        let slow_load = self.config.adaptive_settings.response_time_threshold();

        let mut events = EventDispatcher::new();
        events.register_handler(Arc::new(LoggingHandler));
        for handler in self.handlers {
            events.register_handler(handler);
        }

        Ok(AdaptiveRouter {
            config: self.config,
            registry,
            implementations: RwLock::new(self.implementations),
            available_services: RwLock::new(self.available_services),
            pool: self.pool,
            prober: self.prober,
            monitor: SignalMonitor::new().with_slow_load_threshold(slow_load),
            adaptor: Mutex::new(BehaviorAdaptor::new().with_slow_load_threshold(slow_load)),
            events: Arc::new(events),
            background: tokio::sync::Mutex::new(BackgroundTasks::default()),
        })
    }
}

#[derive(Default)]
struct BackgroundTasks {
    evaluator: Option<BreakerEvaluator>,
    pool_health: Option<PoolHealthTask>,
}

/// Main routing orchestrator.
///
/// Serves many concurrent `route()` calls; only the shared counters and the
/// attempt logs are synchronized, never the calls against each other.
pub struct AdaptiveRouter {
    config: RouterConfig,
    registry: Arc<StrategyRegistry>,
    implementations: RwLock<HashMap<String, Arc<dyn StrategyImplementation>>>,
    available_services: RwLock<HashSet<String>>,
    pool: Option<ProxyPoolManager>,
    prober: Option<Arc<dyn EndpointProber>>,
    monitor: SignalMonitor,
    adaptor: Mutex<BehaviorAdaptor>,
    events: Arc<EventDispatcher>,
    background: tokio::sync::Mutex<BackgroundTasks>,
}

impl AdaptiveRouter {
    pub fn builder(config: RouterConfig) -> AdaptiveRouterBuilder {
        AdaptiveRouterBuilder::new(config)
    }

    pub fn registry(&self) -> &Arc<StrategyRegistry> {
        &self.registry
    }

    pub fn pool(&self) -> Option<&ProxyPoolManager> {
        self.pool.as_ref()
    }

    /// Register a strategy implementation after construction.
    pub fn register_implementation(
        &self,
        name: impl Into<String>,
        implementation: Arc<dyn StrategyImplementation>,
    ) {
        self.implementations
            .write()
            .expect("implementations lock poisoned")
            .insert(name.into(), implementation);
    }

    /// Mark a prerequisite service reachable or unreachable.
    pub fn set_service_available(&self, name: &str, available: bool) {
        let mut services = self
            .available_services
            .write()
            .expect("services lock poisoned");
        if available {
            services.insert(name.to_string());
        } else {
            services.remove(name);
        }
    }

    /// Start the breaker-evaluation and pool health-check loops. Must run
    /// inside a tokio runtime; idempotent.
    pub async fn start(&self) {
        let mut background = self.background.lock().await;
        if background.evaluator.is_none() {
            background.evaluator = Some(BreakerEvaluator::spawn(
                self.registry.clone(),
                &self.config.adaptive_settings,
                &self.config.retry_settings,
                self.events.clone(),
            ));
        }
        if background.pool_health.is_none()
            && let (Some(pool), Some(prober)) = (&self.pool, &self.prober)
        {
            background.pool_health = Some(pool.spawn_health_task(prober.clone()));
        }
    }

    /// Stop and join the background loops.
    pub async fn shutdown(&self) {
        let mut background = self.background.lock().await;
        if let Some(evaluator) = background.evaluator.take() {
            evaluator.stop().await;
        }
        if let Some(health) = background.pool_health.take() {
            health.stop().await;
        }
    }

    /// Pull an egress endpoint for a strategy that needs one. The pool's
    /// recovery reset runs first; escalates only if that also yields nothing.
    pub fn acquire_endpoint(&self, filter: &EndpointFilter) -> RouterResult<ProxyEndpoint> {
        let pool = self
            .pool
            .as_ref()
            .ok_or_else(|| RouterError::ResourcePoolExhausted("no pool configured".into()))?;
        pool.next_endpoint(filter).ok_or_else(|| {
            RouterError::ResourcePoolExhausted("no endpoint matched the filter".into())
        })
    }

    /// Route one request across the configured strategies.
    ///
    /// All per-attempt errors are absorbed into the attempt log; the only
    /// failure surfaced in `RouteResult.error` is total exhaustion (or an
    /// escalated cooldown abort). `Err` is reserved for caller misuse.
    pub async fn route(&self, request: RouteRequest) -> RouterResult<RouteResult> {
        let started = Instant::now();
        let forced = request.force_strategy.is_some();
        let base_order = self.compute_base_order(&request)?;

        let mut attempts: Vec<RouteAttempt> = Vec::new();
        let mut last_error = String::from("no eligible strategies");

        // Surface breaker-skipped strategies for observability without
        // touching their statistics.
        if !forced && !request.bypass_circuit_breaker {
            for snapshot in self.registry.snapshots() {
                if snapshot.enabled && snapshot.circuit_breaker_open {
                    attempts.push(RouteAttempt::skipped(
                        snapshot.name,
                        SkipReason::BreakerOpen,
                        0,
                    ));
                }
            }
        }

        let max_retries = self.config.retry_settings.max_retries;
        for retry_round in 0..=max_retries {
            let mut round_order = base_order.clone();
            let mut index = 0;

            while index < round_order.len() {
                let name = round_order[index].clone();
                index += 1;

                let Some(entry) = self.registry.get(&name).cloned() else {
                    continue;
                };
                let definition = entry.definition().clone();

                if !definition.enabled {
                    attempts.push(RouteAttempt::skipped(&name, SkipReason::Disabled, retry_round));
                    continue;
                }

                // Catches fallback-appended strategies and breakers that
                // opened after the order was computed.
                if !forced && !request.bypass_circuit_breaker && entry.circuit_breaker_open() {
                    attempts.push(RouteAttempt::skipped(
                        &name,
                        SkipReason::BreakerOpen,
                        retry_round,
                    ));
                    continue;
                }

                if !self.prerequisites_met(&definition.prerequisites) {
                    attempts.push(RouteAttempt::skipped(
                        &name,
                        SkipReason::PrerequisiteUnmet,
                        retry_round,
                    ));
                    continue;
                }

                let Some(implementation) = self.implementation(&name) else {
                    if forced {
                        return Err(RouterError::MissingImplementation(name));
                    }
                    attempts.push(RouteAttempt::skipped(
                        &name,
                        SkipReason::NotRegistered,
                        retry_round,
                    ));
                    continue;
                };

                let Some(permit) = self.registry.try_acquire(&name, retry_round) else {
                    attempts.push(RouteAttempt::skipped(
                        &name,
                        SkipReason::AtCapacity,
                        retry_round,
                    ));
                    continue;
                };

                self.events
                    .dispatch(RouterEvent::AttemptStarted(AttemptStartedEvent {
                        strategy: name.clone(),
                        url: request.url.clone(),
                        retry_round,
                        timestamp: Utc::now(),
                    }));

                let limit = request.timeout.unwrap_or_else(|| definition.timeout());
                let attempt_started = Instant::now();
                let outcome = timeout(limit, implementation.execute(&request)).await;
                let response_time = attempt_started.elapsed();

                match outcome {
                    Ok(Ok(fetch)) => {
                        let signals = self.monitor.detect_signals(&fetch);
                        let adaptation = self.adapt(&signals);
                        let blocked = blocking_signal(&signals);

                        match blocked {
                            None => {
                                let attempt = RouteAttempt::completed(
                                    &name,
                                    permit.started_at(),
                                    response_time,
                                    Some(fetch.status_code),
                                    None,
                                    retry_round,
                                );
                                self.finish_attempt(permit, &attempt);
                                attempts.push(attempt);
                                return Ok(RouteResult::succeeded(
                                    name,
                                    attempts,
                                    started.elapsed(),
                                    fetch,
                                    signals,
                                    adaptation,
                                ));
                            }
                            Some(description) => {
                                last_error = format!("blocked: {description}");
                                let attempt = RouteAttempt::completed(
                                    &name,
                                    permit.started_at(),
                                    response_time,
                                    Some(fetch.status_code),
                                    Some(AttemptError::Blocked(description)),
                                    retry_round,
                                );
                                self.finish_attempt(permit, &attempt);
                                attempts.push(attempt);

                                if let Some(ref adaptation) = adaptation
                                    && adaptation.backoff_duration >= COOLDOWN_ABORT_THRESHOLD
                                {
                                    return Ok(RouteResult::failed(
                                        attempts,
                                        started.elapsed(),
                                        format!(
                                            "aborted for cooldown after detection escalation ({last_error})"
                                        ),
                                        signals,
                                        Some(adaptation.clone()),
                                    ));
                                }

                                if !forced {
                                    append_fallbacks(&definition.fallback_methods, &mut round_order);
                                }
                            }
                        }
                    }
                    Ok(Err(err)) => {
                        last_error = err.to_string();
                        let attempt = RouteAttempt::completed(
                            &name,
                            permit.started_at(),
                            response_time,
                            None,
                            Some(AttemptError::Execution(last_error.clone())),
                            retry_round,
                        );
                        self.finish_attempt(permit, &attempt);
                        attempts.push(attempt);
                        if !forced {
                            append_fallbacks(&definition.fallback_methods, &mut round_order);
                        }
                    }
                    Err(_elapsed) => {
                        last_error = format!("timed out after {:.2}s", limit.as_secs_f64());
                        let attempt = RouteAttempt::completed(
                            &name,
                            permit.started_at(),
                            response_time,
                            None,
                            Some(AttemptError::Timeout { limit }),
                            retry_round,
                        );
                        self.finish_attempt(permit, &attempt);
                        attempts.push(attempt);
                        if !forced {
                            append_fallbacks(&definition.fallback_methods, &mut round_order);
                        }
                    }
                }
            }

            if retry_round < max_retries {
                let delay = self.retry_delay(retry_round);
                self.events
                    .dispatch(RouterEvent::RetryScheduled(RetryScheduledEvent {
                        retry_round: retry_round + 1,
                        delay,
                        timestamp: Utc::now(),
                    }));
                sleep(delay).await;
            }
        }

        let invocations = attempts.iter().filter(|a| a.counts_for_stats()).count();
        Ok(RouteResult::failed(
            attempts,
            started.elapsed(),
            format!("all strategies exhausted after {invocations} attempts: {last_error}"),
            Vec::new(),
            None,
        ))
    }

    /// Observability surface consumed by the surrounding product.
    pub fn statistics(&self) -> RouterStatistics {
        let strategies = self
            .registry
            .snapshots()
            .into_iter()
            .map(|snapshot| StrategyStatistics {
                name: snapshot.name,
                attempts: snapshot.total_attempts,
                success_rate: snapshot.success_rate,
                avg_response_time: snapshot.avg_response_time,
                concurrent_requests: snapshot.concurrent_requests,
                circuit_breaker_open: snapshot.circuit_breaker_open,
            })
            .collect();
        RouterStatistics {
            strategies,
            pool: self.pool.as_ref().map(|pool| pool.health_report()),
        }
    }

    /// Advisory risk score over the recent signal history.
    pub fn evaluate_risk(&self, captcha_detected: bool, load_time: Duration) -> u8 {
        self.adaptor
            .lock()
            .expect("adaptor lock poisoned")
            .evaluate_risk(captcha_detected, load_time)
    }

    fn compute_base_order(&self, request: &RouteRequest) -> RouterResult<Vec<String>> {
        if let Some(forced) = &request.force_strategy {
            let definition = self
                .registry
                .definition(forced)
                .ok_or_else(|| RouterError::UnknownStrategy(forced.clone()))?;
            if !definition.enabled {
                return Err(RouterError::StrategyDisabled(forced.clone()));
            }
            return Ok(vec![forced.clone()]);
        }

        let eligible: Vec<_> = self
            .registry
            .snapshots()
            .into_iter()
            .filter(|s| s.enabled && (request.bypass_circuit_breaker || !s.circuit_breaker_open))
            .collect();

        Ok(policy::compute_order(
            self.config.strategy,
            self.config.load_balance_settings.algorithm,
            eligible,
            self.registry.rr_cursor(),
            self.config.adaptive_settings.success_rate_threshold,
        ))
    }

    fn implementation(&self, name: &str) -> Option<Arc<dyn StrategyImplementation>> {
        self.implementations
            .read()
            .expect("implementations lock poisoned")
            .get(name)
            .cloned()
    }

    fn prerequisites_met(&self, prerequisites: &[String]) -> bool {
        if prerequisites.is_empty() {
            return true;
        }
        let services = self
            .available_services
            .read()
            .expect("services lock poisoned");
        prerequisites.iter().all(|p| services.contains(p))
    }

    fn adapt(&self, signals: &[DetectionSignal]) -> Option<BehaviorAdaptation> {
        if signals.is_empty() {
            return None;
        }
        for signal in signals {
            self.events
                .dispatch(RouterEvent::SignalDetected(signal.clone()));
        }
        let adaptation = self
            .adaptor
            .lock()
            .expect("adaptor lock poisoned")
            .adapt_behavior(signals);
        Some(adaptation)
    }

    fn finish_attempt(&self, permit: ConcurrencyPermit, attempt: &RouteAttempt) {
        self.events
            .dispatch(RouterEvent::AttemptFinished(AttemptFinishedEvent {
                strategy: attempt.strategy.clone(),
                success: attempt.success,
                status_code: attempt.status_code,
                response_time: attempt.response_time,
                error: attempt.error.clone(),
                timestamp: Utc::now(),
            }));
        permit.finish(attempt.clone());
    }

    fn retry_delay(&self, retry_round: u32) -> Duration {
        let settings = &self.config.retry_settings;
        let base = if settings.exponential_backoff {
            settings
                .retry_delay()
                .saturating_mul(2u32.saturating_pow(retry_round))
        } else {
            settings.retry_delay()
        };
        let jitter = rand::thread_rng().gen_range(RETRY_JITTER.0..=RETRY_JITTER.1);
        Duration::from_secs_f64(base.as_secs_f64() * jitter)
    }
}

/// First high-or-worse blocking/rate-limit signal in the batch, if any.
fn blocking_signal(signals: &[DetectionSignal]) -> Option<String> {
    use crate::modules::signals::Severity;
    signals
        .iter()
        .find(|signal| {
            matches!(
                signal.signal_type,
                SignalType::Challenge | SignalType::RateLimit
            ) && signal.severity >= Severity::High
        })
        .map(|signal| signal.description.clone())
}

fn append_fallbacks(fallbacks: &[String], round_order: &mut Vec<String>) {
    for fallback in fallbacks {
        if !round_order.contains(fallback) {
            round_order.push(fallback.clone());
        }
    }
}

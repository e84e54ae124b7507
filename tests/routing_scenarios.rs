//! End-to-end routing scenarios against scripted strategy implementations.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use routeshield_rs::{
    AdaptiveRouter, EndpointFilter, FetchOutcome, LoadBalanceAlgorithm, LoadBalanceSettings,
    PoolConfig, ProxyEndpoint, ProxyPoolManager, RetrySettings, RouteRequest, RouterConfig,
    RouterError, RouterEvent, RoutingPolicy, SkipReason, StrategyDefinition, StrategyError,
    StrategyImplementation,
};

/// Succeeds with a fixed status and body, counting invocations.
struct Scripted {
    status: u16,
    body: &'static str,
    calls: AtomicUsize,
}

impl Scripted {
    fn new(status: u16, body: &'static str) -> Arc<Self> {
        Arc::new(Self {
            status,
            body,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StrategyImplementation for Scripted {
    async fn execute(&self, _request: &RouteRequest) -> Result<FetchOutcome, StrategyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(FetchOutcome::new(self.status, self.body))
    }
}

/// Always fails with an http-level error.
struct AlwaysFails;

#[async_trait]
impl StrategyImplementation for AlwaysFails {
    async fn execute(&self, _request: &RouteRequest) -> Result<FetchOutcome, StrategyError> {
        Err(StrategyError::Http("connection reset by peer".into()))
    }
}

/// Sleeps long enough to trip the per-attempt timeout, and tracks peak
/// concurrency so the cap can be asserted.
struct Slow {
    delay: Duration,
    in_flight: AtomicU32,
    peak: AtomicU32,
}

impl Slow {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            in_flight: AtomicU32::new(0),
            peak: AtomicU32::new(0),
        })
    }

    fn peak(&self) -> u32 {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StrategyImplementation for Slow {
    async fn execute(&self, _request: &RouteRequest) -> Result<FetchOutcome, StrategyError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(current, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(FetchOutcome::new(200, "<html>slow but fine</html>"))
    }
}

fn fast_retries(max_retries: u32) -> RetrySettings {
    RetrySettings {
        max_retries,
        retry_delay_ms: 10,
        exponential_backoff: true,
        circuit_breaker_threshold: 0.5,
    }
}

fn request() -> RouteRequest {
    RouteRequest::get("https://marketplace.example/listing/42").unwrap()
}

#[tokio::test]
async fn falls_back_to_secondary_when_primary_fails() {
    let config = RouterConfig::builder()
        .with_policy(RoutingPolicy::Priority)
        .with_strategy(StrategyDefinition::new("primary").with_priority(9))
        .with_strategy(StrategyDefinition::new("secondary").with_priority(5))
        .with_retry_settings(fast_retries(1))
        .build()
        .unwrap();

    let secondary = Scripted::new(200, "<html>listings</html>");
    let router = AdaptiveRouter::builder(config)
        .with_implementation("primary", Arc::new(AlwaysFails))
        .with_implementation("secondary", secondary.clone())
        .build()
        .unwrap();

    let result = router.route(request()).await.unwrap();

    assert!(result.success);
    assert_eq!(result.final_strategy.as_deref(), Some("secondary"));
    assert_eq!(result.invocation_count(), 2);
    assert_eq!(result.attempts[0].strategy, "primary");
    assert!(!result.attempts[0].success);
    assert_eq!(result.attempts[1].strategy, "secondary");
    assert!(result.attempts[1].success);
    assert_eq!(secondary.calls(), 1);

    let stats = router.statistics();
    let primary = stats
        .strategies
        .iter()
        .find(|s| s.name == "primary")
        .unwrap();
    assert_eq!(primary.attempts, 1);
    assert_eq!(primary.success_rate, 0.0);
}

#[tokio::test]
async fn exhaustion_after_timeouts_across_retry_rounds() {
    let config = RouterConfig::builder()
        .with_strategy(
            StrategyDefinition::new("sluggish").with_timeout(Duration::from_millis(50)),
        )
        .with_retry_settings(fast_retries(2))
        .build()
        .unwrap();

    struct RetryCounter(Mutex<u32>);
    impl routeshield_rs::EventHandler for RetryCounter {
        fn handle(&self, event: &RouterEvent) {
            if matches!(event, RouterEvent::RetryScheduled(_)) {
                *self.0.lock().unwrap() += 1;
            }
        }
    }
    let retries = Arc::new(RetryCounter(Mutex::new(0)));

    let router = AdaptiveRouter::builder(config)
        .with_implementation("sluggish", Slow::new(Duration::from_millis(400)))
        .with_event_handler(retries.clone())
        .build()
        .unwrap();

    let result = router.route(request()).await.unwrap();

    assert!(!result.success);
    assert_eq!(result.invocation_count(), 3);
    assert!(result.error.as_deref().unwrap().contains("exhausted"));
    assert!(result
        .attempts
        .iter()
        .all(|a| a.error.as_deref().unwrap_or("").contains("timed out")));
    assert_eq!(*retries.0.lock().unwrap(), 2);
}

#[tokio::test]
async fn forced_strategy_skips_the_rest_of_the_chain() {
    let config = RouterConfig::builder()
        .with_policy(RoutingPolicy::Priority)
        .with_strategy(StrategyDefinition::new("primary").with_priority(9))
        .with_strategy(StrategyDefinition::new("secondary").with_priority(1))
        .with_retry_settings(fast_retries(0))
        .build()
        .unwrap();

    let primary = Scripted::new(200, "primary body");
    let secondary = Scripted::new(200, "secondary body");
    let router = AdaptiveRouter::builder(config)
        .with_implementation("primary", primary.clone())
        .with_implementation("secondary", secondary.clone())
        .build()
        .unwrap();

    let result = router
        .route(request().with_forced_strategy("secondary"))
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.final_strategy.as_deref(), Some("secondary"));
    assert_eq!(result.invocation_count(), 1);
    assert_eq!(primary.calls(), 0);
    assert_eq!(secondary.calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrency_cap_holds_under_parallel_load() {
    let config = RouterConfig::builder()
        .with_strategy(StrategyDefinition::new("capped").with_max_concurrency(2))
        .with_retry_settings(fast_retries(0))
        .build()
        .unwrap();

    let slow = Slow::new(Duration::from_millis(100));
    let router = Arc::new(
        AdaptiveRouter::builder(config)
            .with_implementation("capped", slow.clone())
            .build()
            .unwrap(),
    );

    let mut handles = Vec::new();
    for _ in 0..6 {
        let router = router.clone();
        handles.push(tokio::spawn(async move { router.route(request()).await }));
    }

    let mut successes = 0;
    let mut capacity_skips = 0;
    for handle in handles {
        let result = handle.await.unwrap().unwrap();
        if result.success {
            successes += 1;
        } else {
            assert!(result
                .attempts
                .iter()
                .any(|a| a.skipped == Some(SkipReason::AtCapacity)));
            capacity_skips += 1;
        }
    }

    assert!(slow.peak() <= 2, "peak concurrency {} exceeded cap", slow.peak());
    assert!(successes >= 2);
    assert_eq!(successes + capacity_skips, 6);
}

#[tokio::test]
async fn open_breaker_excludes_strategy_until_bypassed() {
    let config = RouterConfig::builder()
        .with_policy(RoutingPolicy::Priority)
        .with_strategy(StrategyDefinition::new("primary").with_priority(9))
        .with_strategy(StrategyDefinition::new("secondary").with_priority(5))
        .with_retry_settings(fast_retries(0))
        .build()
        .unwrap();

    let primary = Scripted::new(200, "primary body");
    let router = AdaptiveRouter::builder(config)
        .with_implementation("primary", primary.clone())
        .with_implementation("secondary", Scripted::new(200, "secondary body"))
        .build()
        .unwrap();

    router.registry().get("primary").unwrap().trip_breaker();

    let routed_around = router.route(request()).await.unwrap();
    assert!(routed_around.success);
    assert_eq!(routed_around.final_strategy.as_deref(), Some("secondary"));
    assert!(routed_around
        .attempts
        .iter()
        .any(|a| a.strategy == "primary" && a.skipped == Some(SkipReason::BreakerOpen)));
    assert_eq!(primary.calls(), 0);

    let bypassed = router
        .route(request().with_bypass_circuit_breaker(true))
        .await
        .unwrap();
    assert!(bypassed.success);
    assert_eq!(bypassed.final_strategy.as_deref(), Some("primary"));
    assert_eq!(primary.calls(), 1);
}

#[tokio::test]
async fn blocked_page_falls_back_to_clean_strategy() {
    let config = RouterConfig::builder()
        .with_policy(RoutingPolicy::Priority)
        .with_strategy(StrategyDefinition::new("direct").with_priority(9))
        .with_strategy(StrategyDefinition::new("browser").with_priority(5))
        .with_retry_settings(fast_retries(0))
        .build()
        .unwrap();

    let router = AdaptiveRouter::builder(config)
        .with_implementation(
            "direct",
            Scripted::new(200, "Checking your browser before accessing the site"),
        )
        .with_implementation("browser", Scripted::new(200, "<html>real listings</html>"))
        .build()
        .unwrap();

    let result = router.route(request()).await.unwrap();

    assert!(result.success);
    assert_eq!(result.final_strategy.as_deref(), Some("browser"));
    assert_eq!(result.invocation_count(), 2);
    assert!(result.attempts[0]
        .error
        .as_deref()
        .unwrap_or("")
        .contains("blocked"));
    // Final outcome was clean, so no signals ride along.
    assert!(result.signals.is_empty());
}

#[tokio::test]
async fn heavy_detection_aborts_for_cooldown() {
    let config = RouterConfig::builder()
        .with_policy(RoutingPolicy::Priority)
        .with_strategy(StrategyDefinition::new("direct").with_priority(9))
        .with_strategy(StrategyDefinition::new("browser").with_priority(5))
        .with_retry_settings(fast_retries(2))
        .build()
        .unwrap();

    // 429 plus an interstitial, blocking keywords, a fingerprinting script,
    // and a honeypot field: enough folded backoff to cross the abort floor.
    let hostile = r#"
        Checking your browser before accessing the site.
        Access denied.
        <script src="/fp/fingerprintjs.min.js"></script>
        <form><input name="email_confirm" style="display: none"></form>
    "#;

    let browser = Scripted::new(200, "never reached");
    let router = AdaptiveRouter::builder(config)
        .with_implementation("direct", Scripted::new(429, hostile))
        .with_implementation("browser", browser.clone())
        .build()
        .unwrap();

    let result = router.route(request()).await.unwrap();

    assert!(!result.success);
    assert!(result.error.as_deref().unwrap().contains("cooldown"));
    assert_eq!(result.invocation_count(), 1);
    assert_eq!(browser.calls(), 0);
    assert!(result
        .adaptation
        .as_ref()
        .is_some_and(|a| a.backoff_duration >= Duration::from_secs(600)));
}

#[tokio::test]
async fn round_robin_rotates_across_calls() {
    let config = RouterConfig::builder()
        .with_policy(RoutingPolicy::LoadBalance)
        .with_load_balance_settings(LoadBalanceSettings {
            algorithm: LoadBalanceAlgorithm::RoundRobin,
            weights: None,
        })
        .with_strategy(StrategyDefinition::new("alpha"))
        .with_strategy(StrategyDefinition::new("beta"))
        .with_retry_settings(fast_retries(0))
        .build()
        .unwrap();

    let router = AdaptiveRouter::builder(config)
        .with_implementation("alpha", Scripted::new(200, "a"))
        .with_implementation("beta", Scripted::new(200, "b"))
        .build()
        .unwrap();

    let first = router.route(request()).await.unwrap();
    let second = router.route(request()).await.unwrap();

    assert_eq!(first.final_strategy.as_deref(), Some("alpha"));
    assert_eq!(second.final_strategy.as_deref(), Some("beta"));
}

#[tokio::test]
async fn pool_backed_router_hands_out_and_recovers_endpoints() {
    let config = RouterConfig::builder()
        .with_strategy(StrategyDefinition::new("direct"))
        .build()
        .unwrap();

    let pool = ProxyPoolManager::new(PoolConfig::default());
    pool.load([
        ProxyEndpoint::new("10.0.0.1", 8080, "residential"),
        ProxyEndpoint::new("10.0.0.2", 8080, "residential"),
    ]);

    let router = AdaptiveRouter::builder(config)
        .with_implementation("direct", Scripted::new(200, "ok"))
        .with_pool(pool.clone())
        .build()
        .unwrap();

    let endpoint = router.acquire_endpoint(&EndpointFilter::any()).unwrap();
    assert_eq!(endpoint.provider, "residential");

    let miss = router.acquire_endpoint(&EndpointFilter::any().with_provider("datacenter"));
    assert!(matches!(miss, Err(RouterError::ResourcePoolExhausted(_))));

    // Drive both endpoints below the health floor; the next draw must hit
    // the recovery reset rather than coming back empty.
    for endpoint in pool.endpoints() {
        for _ in 0..4 {
            pool.report_failure(&endpoint.id(), "connect timeout");
        }
    }
    assert!(router.acquire_endpoint(&EndpointFilter::any()).is_ok());
}

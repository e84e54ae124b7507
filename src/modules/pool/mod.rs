//! Proxy endpoint pool with health tracking and rotation.
//!
//! Tracks per-endpoint performance, excludes endpoints that exceed the
//! failure budget, rehabilitates them through health checks, and selects the
//! next candidate by score. Endpoints are never deleted, only deprioritized.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Wire protocol spoken toward the proxy endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyProtocol {
    Http,
    Https,
    Socks5,
}

/// Credentials attached to an endpoint. For sticky sessions the effective
/// username carries the session id suffix, vendor-style.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyCredentials {
    pub username: String,
    pub password: String,
}

/// One egress endpoint with live health statistics.
#[derive(Debug, Clone)]
pub struct ProxyEndpoint {
    pub host: String,
    pub port: u16,
    pub credentials: Option<ProxyCredentials>,
    pub protocol: ProxyProtocol,
    pub provider: String,
    pub country: Option<String>,
    pub session_id: Option<String>,
    pub is_sticky: bool,
    pub success_rate: f64,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failures: u32,
    pub avg_response_time: Duration,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl ProxyEndpoint {
    pub fn new(host: impl Into<String>, port: u16, provider: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            credentials: None,
            protocol: ProxyProtocol::Http,
            provider: provider.into(),
            country: None,
            session_id: None,
            is_sticky: false,
            success_rate: 1.0,
            total_requests: 0,
            successful_requests: 0,
            failures: 0,
            avg_response_time: Duration::ZERO,
            last_used_at: None,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(ProxyCredentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    pub fn with_protocol(mut self, protocol: ProxyProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_country(mut self, country: impl Into<String>) -> Self {
        self.country = Some(country.into());
        self
    }

    pub fn sticky(mut self) -> Self {
        self.is_sticky = true;
        self.session_id = Some(random_session_id());
        self
    }

    /// Stable identity used by reporting calls.
    pub fn id(&self) -> String {
        format!("{}://{}:{}", self.provider, self.host, self.port)
    }
}

/// Selection constraints passed to [`ProxyPoolManager::next_endpoint`].
#[derive(Debug, Clone, Default)]
pub struct EndpointFilter {
    pub provider: Option<String>,
    pub country: Option<String>,
    pub sticky_only: bool,
}

impl EndpointFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_country(mut self, country: impl Into<String>) -> Self {
        self.country = Some(country.into());
        self
    }

    pub fn sticky_only(mut self) -> Self {
        self.sticky_only = true;
        self
    }

    fn accepts(&self, endpoint: &ProxyEndpoint) -> bool {
        if let Some(provider) = &self.provider
            && endpoint.provider != *provider
        {
            return false;
        }
        if let Some(country) = &self.country
            && endpoint.country.as_deref() != Some(country.as_str())
        {
            return false;
        }
        if self.sticky_only && !endpoint.is_sticky {
            return false;
        }
        true
    }
}

/// Pool tuning knobs.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Endpoints below this success rate are excluded from selection.
    pub min_success_rate: f64,
    /// Endpoints at or above this failure count are excluded from selection.
    pub max_failures: u32,
    /// Window over which recent use is penalized during ranking.
    pub recency_window: Duration,
    /// Success rate assigned to every endpoint after a full-pool reset.
    pub neutral_success_rate: f64,
    /// Endpoints below this success rate are re-tested by health checks.
    pub health_floor: f64,
    pub health_check_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_success_rate: 0.3,
            max_failures: 3,
            recency_window: Duration::from_secs(30),
            neutral_success_rate: 0.5,
            health_floor: 0.6,
            health_check_interval: Duration::from_secs(30),
        }
    }
}

/// Pool-wide health snapshot for the observability surface.
#[derive(Debug, Clone)]
pub struct PoolHealthReport {
    pub total_endpoints: usize,
    pub working_endpoints: usize,
    pub overall_success_rate: f64,
}

/// Probes one endpoint for liveness. Injected so callers control how a
/// test request is actually issued.
#[async_trait]
pub trait EndpointProber: Send + Sync {
    /// Returns the observed latency on success, or a failure description.
    async fn probe(&self, endpoint: &ProxyEndpoint) -> Result<Duration, String>;
}

#[derive(Debug, Default)]
struct PoolState {
    endpoints: Vec<ProxyEndpoint>,
}

/// Thread-safe proxy pool manager. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct ProxyPoolManager {
    config: PoolConfig,
    inner: Arc<Mutex<PoolState>>,
}

impl ProxyPoolManager {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            inner: Arc::new(Mutex::new(PoolState::default())),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn add_endpoint(&self, endpoint: ProxyEndpoint) {
        let mut state = self.inner.lock().expect("pool lock poisoned");
        if state.endpoints.iter().any(|e| e.id() == endpoint.id()) {
            return;
        }
        state.endpoints.push(endpoint);
    }

    pub fn load<I>(&self, endpoints: I)
    where
        I: IntoIterator<Item = ProxyEndpoint>,
    {
        for endpoint in endpoints {
            self.add_endpoint(endpoint);
        }
    }

    /// Select the healthiest eligible endpoint matching the filter.
    ///
    /// If every endpoint is excluded, the pool performs a one-shot recovery
    /// reset (failures zeroed, success rates set to the neutral floor) and
    /// retries once before giving up.
    pub fn next_endpoint(&self, filter: &EndpointFilter) -> Option<ProxyEndpoint> {
        let mut state = self.inner.lock().expect("pool lock poisoned");

        if let Some(index) = self.select_index(&state, filter) {
            state.endpoints[index].last_used_at = Some(Utc::now());
            return Some(state.endpoints[index].clone());
        }

        let matching_any = state.endpoints.iter().any(|e| filter.accepts(e));
        if !matching_any {
            return None;
        }

        // Recovery from total outage: reset and re-rank once.
        log::warn!(
            "proxy pool exhausted ({} endpoints all excluded), resetting failure counts",
            state.endpoints.len()
        );
        for endpoint in state.endpoints.iter_mut() {
            endpoint.failures = 0;
            endpoint.success_rate = self.config.neutral_success_rate;
        }

        let index = self.select_index(&state, filter)?;
        state.endpoints[index].last_used_at = Some(Utc::now());
        Some(state.endpoints[index].clone())
    }

    fn select_index(&self, state: &PoolState, filter: &EndpointFilter) -> Option<usize> {
        let now = Utc::now();
        state
            .endpoints
            .iter()
            .enumerate()
            .filter(|(_, e)| {
                filter.accepts(e)
                    && e.success_rate >= self.config.min_success_rate
                    && e.failures < self.config.max_failures
            })
            .max_by(|(_, a), (_, b)| {
                let lhs = self.rank(a, now);
                let rhs = self.rank(b, now);
                lhs.partial_cmp(&rhs).unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(index, _)| index)
    }

    /// Score = success-rate points minus a penalty for very recent use, so
    /// traffic spreads across equally healthy endpoints.
    fn rank(&self, endpoint: &ProxyEndpoint, now: DateTime<Utc>) -> f64 {
        let window = self.config.recency_window.as_secs_f64().max(1.0);
        let penalty = match endpoint.last_used_at {
            None => 0.0,
            Some(last) => {
                let age = (now - last).num_milliseconds().max(0) as f64 / 1000.0;
                ((window - age) / window).clamp(0.0, 1.0) * 50.0
            }
        };
        endpoint.success_rate * 100.0 - penalty
    }

    pub fn report_success(&self, endpoint_id: &str, response_time: Duration) {
        let mut state = self.inner.lock().expect("pool lock poisoned");
        if let Some(endpoint) = state.endpoints.iter_mut().find(|e| e.id() == endpoint_id) {
            endpoint.total_requests += 1;
            endpoint.successful_requests += 1;
            endpoint.failures = 0;
            let alpha = 0.1;
            endpoint.success_rate = (1.0 - alpha) * endpoint.success_rate + alpha;
            endpoint.avg_response_time = if endpoint.avg_response_time.is_zero() {
                response_time
            } else {
                let blended = (1.0 - alpha) * endpoint.avg_response_time.as_secs_f64()
                    + alpha * response_time.as_secs_f64();
                Duration::from_secs_f64(blended)
            };
        }
    }

    pub fn report_failure(&self, endpoint_id: &str, reason: &str) {
        let mut state = self.inner.lock().expect("pool lock poisoned");
        if let Some(endpoint) = state.endpoints.iter_mut().find(|e| e.id() == endpoint_id) {
            endpoint.total_requests += 1;
            endpoint.failures = endpoint.failures.saturating_add(1);
            let alpha = 0.1;
            endpoint.success_rate = (1.0 - alpha) * endpoint.success_rate;
            log::debug!(
                "endpoint {} failed ({}), failures={} success_rate={:.2}",
                endpoint_id,
                reason,
                endpoint.failures,
                endpoint.success_rate
            );
        }
    }

    /// Rotate a sticky endpoint's session identifier, changing its effective
    /// credentials. Rotation is explicit; it never happens per request.
    pub fn rotate_session(&self, endpoint_id: &str) -> Option<String> {
        let mut state = self.inner.lock().expect("pool lock poisoned");
        let endpoint = state
            .endpoints
            .iter_mut()
            .find(|e| e.id() == endpoint_id && e.is_sticky)?;
        let session = random_session_id();
        endpoint.session_id = Some(session.clone());
        Some(session)
    }

    /// Re-test endpoints below the health floor and fold the results back
    /// into their statistics. Probed endpoints that pass get their failure
    /// count reset, rehabilitating them for selection.
    pub async fn run_health_check(&self, prober: &dyn EndpointProber) {
        let candidates: Vec<ProxyEndpoint> = {
            let state = self.inner.lock().expect("pool lock poisoned");
            state
                .endpoints
                .iter()
                .filter(|e| {
                    e.success_rate < self.config.health_floor
                        || e.failures >= self.config.max_failures
                })
                .cloned()
                .collect()
        };

        for endpoint in candidates {
            let id = endpoint.id();
            match prober.probe(&endpoint).await {
                Ok(latency) => {
                    log::info!("health check passed for {id} ({:.0}ms)", latency.as_millis());
                    self.report_success(&id, latency);
                }
                Err(reason) => {
                    self.report_failure(&id, &reason);
                }
            }
        }
    }

    /// Spawn the background health-check loop. Stop it via the returned
    /// handle, which joins the task.
    pub fn spawn_health_task(&self, prober: Arc<dyn EndpointProber>) -> PoolHealthTask {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let pool = self.clone();
        let interval = self.config.health_check_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        pool.run_health_check(prober.as_ref()).await;
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        PoolHealthTask {
            shutdown: shutdown_tx,
            handle,
        }
    }

    pub fn health_report(&self) -> PoolHealthReport {
        let state = self.inner.lock().expect("pool lock poisoned");
        let total = state.endpoints.len();
        let working = state
            .endpoints
            .iter()
            .filter(|e| {
                e.success_rate >= self.config.min_success_rate
                    && e.failures < self.config.max_failures
            })
            .count();
        let overall = if total == 0 {
            0.0
        } else {
            state.endpoints.iter().map(|e| e.success_rate).sum::<f64>() / total as f64
        };
        PoolHealthReport {
            total_endpoints: total,
            working_endpoints: working,
            overall_success_rate: overall,
        }
    }

    /// Snapshot of every endpoint, for dashboards.
    pub fn endpoints(&self) -> Vec<ProxyEndpoint> {
        self.inner
            .lock()
            .expect("pool lock poisoned")
            .endpoints
            .clone()
    }
}

/// Running background health-check loop.
pub struct PoolHealthTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl PoolHealthTask {
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

fn random_session_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysUp;

    #[async_trait]
    impl EndpointProber for AlwaysUp {
        async fn probe(&self, _endpoint: &ProxyEndpoint) -> Result<Duration, String> {
            Ok(Duration::from_millis(80))
        }
    }

    fn pool_with(endpoints: Vec<ProxyEndpoint>) -> ProxyPoolManager {
        let pool = ProxyPoolManager::new(PoolConfig::default());
        pool.load(endpoints);
        pool
    }

    #[test]
    fn excludes_endpoints_past_failure_budget() {
        let pool = pool_with(vec![
            ProxyEndpoint::new("10.0.0.1", 8080, "vendor"),
            ProxyEndpoint::new("10.0.0.2", 8080, "vendor"),
        ]);
        let bad = "vendor://10.0.0.1:8080";
        for _ in 0..3 {
            pool.report_failure(bad, "connect refused");
        }

        for _ in 0..5 {
            let picked = pool.next_endpoint(&EndpointFilter::any()).unwrap();
            assert_eq!(picked.host, "10.0.0.2");
        }
    }

    #[test]
    fn full_outage_triggers_recovery_reset() {
        let pool = pool_with(vec![ProxyEndpoint::new("10.0.0.1", 8080, "vendor")]);
        for _ in 0..5 {
            pool.report_failure("vendor://10.0.0.1:8080", "timeout");
        }

        // All endpoints excluded, so selection resets the pool and retries.
        let picked = pool.next_endpoint(&EndpointFilter::any());
        assert!(picked.is_some());
        let endpoint = &pool.endpoints()[0];
        assert_eq!(endpoint.failures, 0);
        assert!((endpoint.success_rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn filter_constrains_selection() {
        let pool = pool_with(vec![
            ProxyEndpoint::new("10.0.0.1", 8080, "vendor-a").with_country("de"),
            ProxyEndpoint::new("10.0.0.2", 8080, "vendor-b").with_country("us"),
        ]);

        let filter = EndpointFilter {
            country: Some("us".into()),
            ..Default::default()
        };
        let picked = pool.next_endpoint(&filter).unwrap();
        assert_eq!(picked.provider, "vendor-b");

        let filter = EndpointFilter {
            provider: Some("vendor-c".into()),
            ..Default::default()
        };
        assert!(pool.next_endpoint(&filter).is_none());
    }

    #[test]
    fn sticky_sessions_rotate_only_on_request() {
        let pool = pool_with(vec![ProxyEndpoint::new("10.0.0.1", 8080, "vendor").sticky()]);
        let id = "vendor://10.0.0.1:8080";

        let before = pool.endpoints()[0].session_id.clone().unwrap();
        // Ordinary selection must not rotate the session.
        let _ = pool.next_endpoint(&EndpointFilter::any()).unwrap();
        assert_eq!(pool.endpoints()[0].session_id.as_deref(), Some(before.as_str()));

        let rotated = pool.rotate_session(id).unwrap();
        assert_ne!(rotated, before);
    }

    #[tokio::test]
    async fn health_check_rehabilitates_failed_endpoints() {
        let pool = pool_with(vec![ProxyEndpoint::new("10.0.0.1", 8080, "vendor")]);
        let id = "vendor://10.0.0.1:8080";
        for _ in 0..4 {
            pool.report_failure(id, "timeout");
        }
        assert!(pool.endpoints()[0].failures >= 3);

        pool.run_health_check(&AlwaysUp).await;
        assert_eq!(pool.endpoints()[0].failures, 0);
        assert!(pool.next_endpoint(&EndpointFilter::any()).is_some());
    }

    #[test]
    fn health_report_counts_working_endpoints() {
        let pool = pool_with(vec![
            ProxyEndpoint::new("10.0.0.1", 8080, "vendor"),
            ProxyEndpoint::new("10.0.0.2", 8080, "vendor"),
        ]);
        for _ in 0..3 {
            pool.report_failure("vendor://10.0.0.1:8080", "refused");
        }

        let report = pool.health_report();
        assert_eq!(report.total_endpoints, 2);
        assert_eq!(report.working_endpoints, 1);
        assert!(report.overall_success_rate > 0.0);
    }
}

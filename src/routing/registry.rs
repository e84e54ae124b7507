//! Strategy registry and rolling statistics.
//!
//! Owns one entry per configured strategy: immutable definition plus mutable
//! stats recomputed strictly from a time-windowed attempt log, a live
//! concurrency counter, and the circuit-breaker flag. Counter mutations are
//! lock-free; the attempt log sits behind a short mutex-guarded section.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::config::{RouterConfig, StrategyDefinition};
use crate::routing::types::RouteAttempt;

/// Read-only view of one strategy's live state, used by ordering policies
/// and the observability surface.
#[derive(Debug, Clone)]
pub struct StrategySnapshot {
    pub name: String,
    pub enabled: bool,
    pub priority: u8,
    pub weight: u32,
    pub success_rate: f64,
    pub avg_response_time: Duration,
    pub concurrent_requests: u32,
    pub max_concurrency: u32,
    pub circuit_breaker_open: bool,
    pub total_attempts: u64,
    pub successful_attempts: u64,
}

/// Breaker state change produced by one evaluation pass.
#[derive(Debug, Clone)]
pub struct BreakerTransition {
    pub strategy: String,
    pub opened: bool,
    pub success_rate: f64,
}

/// Thresholds applied by [`StrategyRegistry::evaluate`].
#[derive(Debug, Clone, Copy)]
pub struct EvaluationParams {
    pub min_sample_size: u32,
    /// Breaker opens once `success_rate < 1 - circuit_breaker_threshold`.
    pub circuit_breaker_threshold: f64,
    /// Breaker closes after this much time open, regardless of improvement.
    pub breaker_cooldown: Duration,
}

#[derive(Debug)]
struct StatsInner {
    total_attempts: u64,
    successful_attempts: u64,
    failed_attempts: u64,
    success_rate: f64,
    avg_response_time: Duration,
    recent: VecDeque<RouteAttempt>,
    breaker_opened_at: Option<Instant>,
}

impl StatsInner {
    fn new() -> Self {
        Self {
            total_attempts: 0,
            successful_attempts: 0,
            failed_attempts: 0,
            success_rate: 1.0,
            avg_response_time: Duration::ZERO,
            recent: VecDeque::with_capacity(64),
            breaker_opened_at: None,
        }
    }

    /// Drop entries older than the window and recompute the rolling rates
    /// from what remains. An empty window keeps the last computed values so
    /// an idle strategy is not mistaken for a broken one.
    fn recompute(&mut self, window: Duration, now: DateTime<Utc>) {
        let cutoff = now - chrono::Duration::from_std(window).unwrap_or_default();
        while matches!(self.recent.front(), Some(a) if a.finished_at < cutoff) {
            self.recent.pop_front();
        }

        if self.recent.is_empty() {
            return;
        }

        let total = self.recent.len() as f64;
        let successes = self.recent.iter().filter(|a| a.success).count() as f64;
        self.success_rate = successes / total;
        let avg_secs = self
            .recent
            .iter()
            .map(|a| a.response_time.as_secs_f64())
            .sum::<f64>()
            / total;
        self.avg_response_time = Duration::from_secs_f64(avg_secs);
    }
}

/// One registered strategy: immutable definition plus synchronized stats.
pub struct StrategyEntry {
    definition: StrategyDefinition,
    effective_weight: u32,
    window: Duration,
    concurrent: AtomicU32,
    breaker_open: AtomicBool,
    stats: Mutex<StatsInner>,
}

impl StrategyEntry {
    fn new(definition: StrategyDefinition, effective_weight: u32, window: Duration) -> Self {
        Self {
            definition,
            effective_weight,
            window,
            concurrent: AtomicU32::new(0),
            breaker_open: AtomicBool::new(false),
            stats: Mutex::new(StatsInner::new()),
        }
    }

    pub fn definition(&self) -> &StrategyDefinition {
        &self.definition
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn circuit_breaker_open(&self) -> bool {
        self.breaker_open.load(Ordering::Acquire)
    }

    pub fn concurrent_requests(&self) -> u32 {
        self.concurrent.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> StrategySnapshot {
        let stats = self.stats.lock().expect("stats lock poisoned");
        StrategySnapshot {
            name: self.definition.name.clone(),
            enabled: self.definition.enabled,
            priority: self.definition.priority,
            weight: self.effective_weight,
            success_rate: stats.success_rate,
            avg_response_time: stats.avg_response_time,
            concurrent_requests: self.concurrent_requests(),
            max_concurrency: self.definition.max_concurrency,
            circuit_breaker_open: self.circuit_breaker_open(),
            total_attempts: stats.total_attempts,
            successful_attempts: stats.successful_attempts,
        }
    }

    fn record(&self, attempt: RouteAttempt) {
        if !attempt.counts_for_stats() {
            return;
        }
        let mut stats = self.stats.lock().expect("stats lock poisoned");
        stats.total_attempts += 1;
        if attempt.success {
            stats.successful_attempts += 1;
        } else {
            stats.failed_attempts += 1;
        }
        stats.recent.push_back(attempt);
        stats.recompute(self.window, Utc::now());
    }

    /// Force the breaker open. Exposed for tests and operational tooling;
    /// normal transitions come from [`StrategyRegistry::evaluate`].
    pub fn trip_breaker(&self) {
        let mut stats = self.stats.lock().expect("stats lock poisoned");
        stats.breaker_opened_at = Some(Instant::now());
        self.breaker_open.store(true, Ordering::Release);
    }
}

/// RAII concurrency slot for one attempt.
///
/// Acquired before dispatch; the slot is released on drop no matter how the
/// attempt ends. A permit dropped without [`finish`](Self::finish) records a
/// cancelled attempt so shared stats stay truthful under caller cancellation.
pub struct ConcurrencyPermit {
    entry: Arc<StrategyEntry>,
    started_at: DateTime<Utc>,
    retry_round: u32,
    finished: bool,
}

impl ConcurrencyPermit {
    pub fn strategy(&self) -> &str {
        self.entry.name()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Record the attempt outcome and release the slot.
    pub fn finish(mut self, attempt: RouteAttempt) {
        self.entry.record(attempt);
        self.finished = true;
    }
}

impl Drop for ConcurrencyPermit {
    fn drop(&mut self) {
        if !self.finished {
            let attempt =
                RouteAttempt::cancelled(self.entry.name(), self.started_at, self.retry_round);
            self.entry.record(attempt);
        }
        self.entry.concurrent.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Registry of all configured strategies.
pub struct StrategyRegistry {
    entries: Vec<Arc<StrategyEntry>>,
    by_name: HashMap<String, usize>,
    rr_cursor: AtomicUsize,
}

impl StrategyRegistry {
    /// Build the registry from validated configuration. The stats window is
    /// twice the evaluation interval so stale history cannot mask a newly
    /// broken strategy.
    pub fn from_config(config: &RouterConfig) -> Self {
        let window = config.adaptive_settings.evaluation_interval() * 2;
        let mut entries = Vec::with_capacity(config.strategies.len());
        let mut by_name = HashMap::with_capacity(config.strategies.len());
        for definition in &config.strategies {
            let weight = config.weight_for(definition);
            by_name.insert(definition.name.clone(), entries.len());
            entries.push(Arc::new(StrategyEntry::new(
                definition.clone(),
                weight,
                window,
            )));
        }
        Self {
            entries,
            by_name,
            rr_cursor: AtomicUsize::new(0),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<StrategyEntry>> {
        self.by_name.get(name).map(|&index| &self.entries[index])
    }

    pub fn definition(&self, name: &str) -> Option<&StrategyDefinition> {
        self.get(name).map(|entry| entry.definition())
    }

    pub fn snapshot(&self, name: &str) -> Option<StrategySnapshot> {
        self.get(name).map(|entry| entry.snapshot())
    }

    /// Snapshots in configuration order.
    pub fn snapshots(&self) -> Vec<StrategySnapshot> {
        self.entries.iter().map(|entry| entry.snapshot()).collect()
    }

    pub fn rr_cursor(&self) -> &AtomicUsize {
        &self.rr_cursor
    }

    /// Claim a concurrency slot for the named strategy. Fails when the
    /// strategy is unknown or already at `max_concurrency`; the counter is
    /// raised with a compare-exchange so the cap holds under contention.
    pub fn try_acquire(&self, name: &str, retry_round: u32) -> Option<ConcurrencyPermit> {
        let entry = self.get(name)?.clone();
        let max = entry.definition.max_concurrency;
        let mut current = entry.concurrent.load(Ordering::Acquire);
        loop {
            if current >= max {
                return None;
            }
            match entry.concurrent.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(ConcurrencyPermit {
                        entry,
                        started_at: Utc::now(),
                        retry_round,
                        finished: false,
                    });
                }
                Err(observed) => current = observed,
            }
        }
    }

    /// One evaluation pass: prune windows, recompute rates, and drive the
    /// breaker state machine. Returns every transition that occurred so the
    /// caller can surface events.
    pub fn evaluate(&self, params: &EvaluationParams) -> Vec<BreakerTransition> {
        let now = Utc::now();
        let mut transitions = Vec::new();

        for entry in &self.entries {
            let mut stats = entry.stats.lock().expect("stats lock poisoned");
            stats.recompute(entry.window, now);

            if entry.breaker_open.load(Ordering::Acquire) {
                let expired = stats
                    .breaker_opened_at
                    .is_some_and(|opened| opened.elapsed() >= params.breaker_cooldown);
                if expired {
                    stats.breaker_opened_at = None;
                    entry.breaker_open.store(false, Ordering::Release);
                    transitions.push(BreakerTransition {
                        strategy: entry.name().to_string(),
                        opened: false,
                        success_rate: stats.success_rate,
                    });
                }
            } else {
                let sampled = stats.total_attempts >= params.min_sample_size as u64;
                let unhealthy =
                    stats.success_rate < 1.0 - params.circuit_breaker_threshold;
                if sampled && unhealthy {
                    stats.breaker_opened_at = Some(Instant::now());
                    entry.breaker_open.store(true, Ordering::Release);
                    transitions.push(BreakerTransition {
                        strategy: entry.name().to_string(),
                        opened: true,
                        success_rate: stats.success_rate,
                    });
                }
            }
        }

        transitions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RouterConfig, StrategyDefinition};

    fn registry_with(definitions: Vec<StrategyDefinition>) -> StrategyRegistry {
        let mut builder = RouterConfig::builder();
        for definition in definitions {
            builder = builder.with_strategy(definition);
        }
        StrategyRegistry::from_config(&builder.build().expect("valid config"))
    }

    fn failed_attempt(name: &str) -> RouteAttempt {
        RouteAttempt::completed(
            name,
            Utc::now(),
            Duration::from_millis(100),
            Some(503),
            Some(crate::routing::types::AttemptError::Execution("boom".into())),
            0,
        )
    }

    fn ok_attempt(name: &str) -> RouteAttempt {
        RouteAttempt::completed(name, Utc::now(), Duration::from_millis(100), Some(200), None, 0)
    }

    #[test]
    fn permits_enforce_max_concurrency() {
        let registry = registry_with(vec![
            StrategyDefinition::new("browser").with_max_concurrency(2)
        ]);

        let first = registry.try_acquire("browser", 0).unwrap();
        let second = registry.try_acquire("browser", 0).unwrap();
        assert!(registry.try_acquire("browser", 0).is_none());

        first.finish(ok_attempt("browser"));
        assert!(registry.try_acquire("browser", 0).is_some());
        drop(second);
    }

    #[test]
    fn dropped_permit_records_cancelled_attempt() {
        let registry = registry_with(vec![StrategyDefinition::new("browser")]);
        let permit = registry.try_acquire("browser", 0).unwrap();
        drop(permit);

        let snapshot = registry.snapshot("browser").unwrap();
        assert_eq!(snapshot.concurrent_requests, 0);
        assert_eq!(snapshot.total_attempts, 1);
        assert_eq!(snapshot.successful_attempts, 0);
    }

    #[test]
    fn breaker_opens_after_min_sample_and_low_rate() {
        let registry = registry_with(vec![StrategyDefinition::new("flaky")]);
        let entry = registry.get("flaky").unwrap();
        for _ in 0..5 {
            entry.record(failed_attempt("flaky"));
        }

        let params = EvaluationParams {
            min_sample_size: 5,
            circuit_breaker_threshold: 0.5,
            breaker_cooldown: Duration::from_secs(300),
        };
        let transitions = registry.evaluate(&params);
        assert_eq!(transitions.len(), 1);
        assert!(transitions[0].opened);
        assert!(registry.snapshot("flaky").unwrap().circuit_breaker_open);
    }

    #[test]
    fn breaker_stays_closed_below_min_sample() {
        let registry = registry_with(vec![StrategyDefinition::new("flaky")]);
        let entry = registry.get("flaky").unwrap();
        for _ in 0..3 {
            entry.record(failed_attempt("flaky"));
        }

        let params = EvaluationParams {
            min_sample_size: 5,
            circuit_breaker_threshold: 0.5,
            breaker_cooldown: Duration::from_secs(300),
        };
        assert!(registry.evaluate(&params).is_empty());
    }

    #[test]
    fn breaker_closes_after_cooldown_regardless_of_health() {
        let registry = registry_with(vec![StrategyDefinition::new("flaky")]);
        let entry = registry.get("flaky").unwrap();
        for _ in 0..5 {
            entry.record(failed_attempt("flaky"));
        }
        entry.trip_breaker();

        // Zero cooldown: the next evaluation must close it even though the
        // strategy has not improved.
        let params = EvaluationParams {
            min_sample_size: 5,
            circuit_breaker_threshold: 0.5,
            breaker_cooldown: Duration::ZERO,
        };
        let transitions = registry.evaluate(&params);
        assert!(transitions.iter().any(|t| !t.opened));
        assert!(!registry.snapshot("flaky").unwrap().circuit_breaker_open);
    }

    #[test]
    fn rolling_rate_tracks_recent_attempts_only() {
        let registry = registry_with(vec![StrategyDefinition::new("mixed")]);
        let entry = registry.get("mixed").unwrap();
        entry.record(ok_attempt("mixed"));
        entry.record(ok_attempt("mixed"));
        entry.record(failed_attempt("mixed"));
        entry.record(failed_attempt("mixed"));

        let snapshot = registry.snapshot("mixed").unwrap();
        assert!((snapshot.success_rate - 0.5).abs() < 1e-9);
        assert_eq!(snapshot.total_attempts, 4);
    }
}

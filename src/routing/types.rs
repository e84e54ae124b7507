//! Core request/attempt/result vocabulary shared by the router.
//!
//! Everything here is either immutable once constructed (`RouteAttempt`,
//! `RouteResult`) or built fluently by the caller before submission
//! (`RouteRequest`).

use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::{HeaderMap, Method};
use thiserror::Error;
use url::Url;

use crate::modules::behavior::BehaviorAdaptation;
use crate::modules::signals::DetectionSignal;

/// Error returned by a strategy implementation.
///
/// Implementations must not retry or consult circuit-breaker state
/// themselves; they surface a single failure and let the router decide.
#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("http error: {0}")]
    Http(String),
    #[error("navigation error: {0}")]
    Navigation(String),
    #[error("no egress resource available: {0}")]
    Resource(String),
    #[error("{0}")]
    Other(String),
}

/// Classified failure recorded against one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptError {
    /// The attempt exceeded the strategy's configured timeout.
    Timeout { limit: Duration },
    /// The implementation returned an error.
    Execution(String),
    /// The surrounding `route()` future was cancelled mid-attempt.
    Cancelled,
    /// The response came back but carried blocking content.
    Blocked(String),
}

impl std::fmt::Display for AttemptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptError::Timeout { limit } => {
                write!(f, "timed out after {:.2}s", limit.as_secs_f64())
            }
            AttemptError::Execution(msg) => write!(f, "execution failed: {msg}"),
            AttemptError::Cancelled => write!(f, "cancelled"),
            AttemptError::Blocked(msg) => write!(f, "blocked: {msg}"),
        }
    }
}

/// Why a strategy was skipped without being invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    BreakerOpen,
    PrerequisiteUnmet,
    AtCapacity,
    NotRegistered,
    Disabled,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            SkipReason::BreakerOpen => "circuit breaker open",
            SkipReason::PrerequisiteUnmet => "prerequisite unmet",
            SkipReason::AtCapacity => "at concurrency capacity",
            SkipReason::NotRegistered => "no implementation registered",
            SkipReason::Disabled => "disabled",
        };
        f.write_str(label)
    }
}

/// One outbound fetch submitted to the router.
#[derive(Debug, Clone)]
pub struct RouteRequest {
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub force_strategy: Option<String>,
    pub bypass_circuit_breaker: bool,
    pub timeout: Option<Duration>,
    pub priority: Option<u8>,
}

impl RouteRequest {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            body: None,
            force_strategy: None,
            bypass_circuit_breaker: false,
            timeout: None,
            priority: None,
        }
    }

    /// Parse-and-build convenience for string URLs.
    pub fn get(url: &str) -> Result<Self, url::ParseError> {
        Ok(Self::new(Url::parse(url)?))
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Pin the request to a single named strategy.
    pub fn with_forced_strategy(mut self, name: impl Into<String>) -> Self {
        self.force_strategy = Some(name.into());
        self
    }

    pub fn with_bypass_circuit_breaker(mut self, bypass: bool) -> Self {
        self.bypass_circuit_breaker = bypass;
        self
    }

    /// Override the per-attempt timeout for this request only.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// Success value a strategy implementation hands back to the router.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub status_code: u16,
    pub headers: HeaderMap,
    pub content: String,
    pub cookies: Vec<String>,
    /// Wall time the strategy spent producing this outcome, as observed by
    /// the implementation itself (navigation + load).
    pub load_time: Duration,
}

impl FetchOutcome {
    pub fn new(status_code: u16, content: impl Into<String>) -> Self {
        Self {
            status_code,
            headers: HeaderMap::new(),
            content: content.into(),
            cookies: Vec::new(),
            load_time: Duration::ZERO,
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_cookies(mut self, cookies: Vec<String>) -> Self {
        self.cookies = cookies;
        self
    }

    pub fn with_load_time(mut self, load_time: Duration) -> Self {
        self.load_time = load_time;
        self
    }
}

/// Immutable record of one strategy invocation (or skip).
///
/// Skipped entries carry zero duration and are never counted into strategy
/// statistics; they exist purely for caller observability.
#[derive(Debug, Clone)]
pub struct RouteAttempt {
    pub strategy: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub response_time: Duration,
    pub status_code: Option<u16>,
    pub error: Option<String>,
    pub retry_round: u32,
    pub skipped: Option<SkipReason>,
}

impl RouteAttempt {
    pub fn completed(
        strategy: impl Into<String>,
        started_at: DateTime<Utc>,
        response_time: Duration,
        status_code: Option<u16>,
        error: Option<AttemptError>,
        retry_round: u32,
    ) -> Self {
        Self {
            strategy: strategy.into(),
            started_at,
            finished_at: Utc::now(),
            success: error.is_none(),
            response_time,
            status_code,
            error: error.map(|e| e.to_string()),
            retry_round,
            skipped: None,
        }
    }

    pub fn skipped(strategy: impl Into<String>, reason: SkipReason, retry_round: u32) -> Self {
        let now = Utc::now();
        Self {
            strategy: strategy.into(),
            started_at: now,
            finished_at: now,
            success: false,
            response_time: Duration::ZERO,
            status_code: None,
            error: Some(format!("skipped: {reason}")),
            retry_round,
            skipped: Some(reason),
        }
    }

    pub fn cancelled(
        strategy: impl Into<String>,
        started_at: DateTime<Utc>,
        retry_round: u32,
    ) -> Self {
        let now = Utc::now();
        let response_time = (now - started_at).to_std().unwrap_or(Duration::ZERO);
        Self {
            strategy: strategy.into(),
            started_at,
            finished_at: now,
            success: false,
            response_time,
            status_code: None,
            error: Some(AttemptError::Cancelled.to_string()),
            retry_round,
            skipped: None,
        }
    }

    /// True for real invocations that should feed statistics.
    pub fn counts_for_stats(&self) -> bool {
        self.skipped.is_none()
    }
}

/// Terminal, immutable outcome of one `route()` call.
#[derive(Debug, Clone)]
pub struct RouteResult {
    pub success: bool,
    pub final_strategy: Option<String>,
    pub attempts: Vec<RouteAttempt>,
    pub total_time: Duration,
    pub outcome: Option<FetchOutcome>,
    pub error: Option<String>,
    /// Detection signals observed on the final outcome, if any.
    pub signals: Vec<DetectionSignal>,
    /// Advisory pacing guidance derived from those signals.
    pub adaptation: Option<BehaviorAdaptation>,
}

impl RouteResult {
    pub fn succeeded(
        final_strategy: String,
        attempts: Vec<RouteAttempt>,
        total_time: Duration,
        outcome: FetchOutcome,
        signals: Vec<DetectionSignal>,
        adaptation: Option<BehaviorAdaptation>,
    ) -> Self {
        Self {
            success: true,
            final_strategy: Some(final_strategy),
            attempts,
            total_time,
            outcome: Some(outcome),
            error: None,
            signals,
            adaptation,
        }
    }

    pub fn failed(
        attempts: Vec<RouteAttempt>,
        total_time: Duration,
        error: String,
        signals: Vec<DetectionSignal>,
        adaptation: Option<BehaviorAdaptation>,
    ) -> Self {
        Self {
            success: false,
            final_strategy: None,
            attempts,
            total_time,
            outcome: None,
            error: Some(error),
            signals,
            adaptation,
        }
    }

    /// Count of real (non-skipped) invocations.
    pub fn invocation_count(&self) -> usize {
        self.attempts.iter().filter(|a| a.counts_for_stats()).count()
    }
}

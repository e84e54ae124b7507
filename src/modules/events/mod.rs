//! Event system for routing activity.
//!
//! Replaces callback-style reporting with a typed observer: subscribers
//! register handlers and receive structured events around attempts, breaker
//! transitions, retries, and detection signals.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use url::Url;

use crate::modules::signals::DetectionSignal;

/// Emitted just before a strategy implementation is invoked.
#[derive(Debug, Clone)]
pub struct AttemptStartedEvent {
    pub strategy: String,
    pub url: Url,
    pub retry_round: u32,
    pub timestamp: DateTime<Utc>,
}

/// Emitted after an attempt resolves (success, failure, or timeout).
#[derive(Debug, Clone)]
pub struct AttemptFinishedEvent {
    pub strategy: String,
    pub success: bool,
    pub status_code: Option<u16>,
    pub response_time: Duration,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct BreakerEvent {
    pub strategy: String,
    pub success_rate: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RetryScheduledEvent {
    pub retry_round: u32,
    pub delay: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum RouterEvent {
    AttemptStarted(AttemptStartedEvent),
    AttemptFinished(AttemptFinishedEvent),
    BreakerOpened(BreakerEvent),
    BreakerClosed(BreakerEvent),
    SignalDetected(DetectionSignal),
    RetryScheduled(RetryScheduledEvent),
}

/// Trait implemented by event handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &RouterEvent);
}

/// Dispatcher that broadcasts events to registered handlers.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn dispatch(&self, event: RouterEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }
}

/// Logs events using the `log` crate.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &RouterEvent) {
        match event {
            RouterEvent::AttemptStarted(started) => {
                log::debug!(
                    "-> {} via {} (round {})",
                    started.url,
                    started.strategy,
                    started.retry_round
                );
            }
            RouterEvent::AttemptFinished(finished) => {
                log::debug!(
                    "<- {} success={} status={:?} ({:.2}s)",
                    finished.strategy,
                    finished.success,
                    finished.status_code,
                    finished.response_time.as_secs_f64()
                );
            }
            RouterEvent::BreakerOpened(breaker) => {
                log::warn!(
                    "circuit breaker opened for {} (success_rate {:.2})",
                    breaker.strategy,
                    breaker.success_rate
                );
            }
            RouterEvent::BreakerClosed(breaker) => {
                log::info!("circuit breaker closed for {}", breaker.strategy);
            }
            RouterEvent::SignalDetected(signal) => {
                log::info!(
                    "detection signal {:?}/{:?}: {}",
                    signal.signal_type,
                    signal.severity,
                    signal.description
                );
            }
            RouterEvent::RetryScheduled(retry) => {
                log::info!(
                    "retry round {} after {:.2}s",
                    retry.retry_round,
                    retry.delay.as_secs_f64()
                );
            }
        }
    }
}

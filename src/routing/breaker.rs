//! Background circuit-breaker evaluation.
//!
//! Runs on its own timer, independent of individual requests: each tick
//! prunes attempt windows, recomputes rolling rates, opens breakers on
//! persistently failing strategies, and closes any breaker whose cooldown
//! has elapsed. Shut down explicitly; the handle joins the task.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::{AdaptiveSettings, RetrySettings};
use crate::modules::events::{BreakerEvent, EventDispatcher, RouterEvent};
use crate::routing::registry::{EvaluationParams, StrategyRegistry};

/// Fixed open-state cooldown. Deliberately independent of the evaluation
/// interval: closing resumes normal routing and lets the next evaluation
/// reopen the breaker if the strategy is still unhealthy.
pub const BREAKER_COOLDOWN: Duration = Duration::from_secs(300);

/// Handle to the running evaluation loop.
pub struct BreakerEvaluator {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl BreakerEvaluator {
    /// Spawn the evaluation loop. Must be called from within a tokio
    /// runtime.
    pub fn spawn(
        registry: Arc<StrategyRegistry>,
        adaptive: &AdaptiveSettings,
        retry: &RetrySettings,
        events: Arc<EventDispatcher>,
    ) -> Self {
        let params = EvaluationParams {
            min_sample_size: adaptive.min_sample_size,
            circuit_breaker_threshold: retry.circuit_breaker_threshold,
            breaker_cooldown: BREAKER_COOLDOWN,
        };
        let interval = adaptive.evaluation_interval();

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        run_evaluation(&registry, &params, &events);
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        Self {
            shutdown: shutdown_tx,
            handle,
        }
    }

    /// Stop the loop and wait for it to exit.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

/// One evaluation pass, factored out so callers (and tests) can force a
/// pass without waiting for the timer.
pub fn run_evaluation(
    registry: &StrategyRegistry,
    params: &EvaluationParams,
    events: &EventDispatcher,
) {
    for transition in registry.evaluate(params) {
        let event = BreakerEvent {
            strategy: transition.strategy,
            success_rate: transition.success_rate,
            timestamp: Utc::now(),
        };
        if transition.opened {
            events.dispatch(RouterEvent::BreakerOpened(event));
        } else {
            events.dispatch(RouterEvent::BreakerClosed(event));
        }
    }
}

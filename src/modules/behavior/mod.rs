//! Behavior adaptation from detection signals.
//!
//! Folds a batch of signals into pacing guidance and maintains a rolling,
//! time-bounded signal history used for advisory risk scoring. All outputs
//! are advisory; the caller decides whether to honor them.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::modules::signals::{DetectionSignal, Severity};

const MIN_SPEED_REDUCTION: f64 = 0.1;
const MAX_PAUSE_INCREASE: f64 = 5.0;
const MAX_BACKOFF: Duration = Duration::from_millis(1_800_000);
const ESCALATION_BACKOFF_FLOOR: Duration = Duration::from_millis(600_000);

/// Pacing and identity guidance derived from one signal batch.
///
/// Stateless output; recomputed from scratch on every call.
#[derive(Debug, Clone, PartialEq)]
pub struct BehaviorAdaptation {
    /// Multiplier applied to request speed, clamped to [0.1, 1.0].
    pub speed_reduction: f64,
    /// Multiplier applied to inter-request pauses, capped at 5x.
    pub pause_increase: f64,
    /// Extra jitter to mix into timing, in [0, 1].
    pub randomization_factor: f64,
    /// Recommended cool-off before the next request, capped at 30 minutes.
    pub backoff_duration: Duration,
    /// Whether the current fingerprint/identity should be replaced.
    pub switch_persona: bool,
}

impl Default for BehaviorAdaptation {
    fn default() -> Self {
        Self {
            speed_reduction: 1.0,
            pause_increase: 1.0,
            randomization_factor: 0.0,
            backoff_duration: Duration::ZERO,
            switch_persona: false,
        }
    }
}

impl BehaviorAdaptation {
    /// True when the batch produced no guidance beyond business as usual.
    pub fn is_neutral(&self) -> bool {
        *self == Self::default()
    }
}

/// Rolling risk evaluator and adaptation calculator.
#[derive(Debug)]
pub struct BehaviorAdaptor {
    history: VecDeque<DetectionSignal>,
    /// Signals older than this are discarded entirely.
    retention: Duration,
    /// Only signals inside this window count toward the risk score.
    risk_window: Duration,
    /// Load times above this add risk points.
    slow_load_threshold: Duration,
}

impl Default for BehaviorAdaptor {
    fn default() -> Self {
        Self::new()
    }
}

impl BehaviorAdaptor {
    pub fn new() -> Self {
        Self {
            history: VecDeque::with_capacity(128),
            retention: Duration::from_secs(3600),
            risk_window: Duration::from_secs(300),
            slow_load_threshold: Duration::from_secs(10),
        }
    }

    pub fn with_slow_load_threshold(mut self, threshold: Duration) -> Self {
        self.slow_load_threshold = threshold;
        self
    }

    /// Fold a signal batch into pacing guidance and record it in the rolling
    /// history for later risk evaluation.
    pub fn adapt_behavior(&mut self, signals: &[DetectionSignal]) -> BehaviorAdaptation {
        self.observe(signals.iter().cloned());
        Self::fold(signals)
    }

    /// Pure folding rule; exposed for callers that manage history themselves.
    pub fn fold(signals: &[DetectionSignal]) -> BehaviorAdaptation {
        let mut adaptation = BehaviorAdaptation::default();
        let mut criticals = 0usize;
        let mut highs = 0usize;

        for signal in signals {
            match signal.severity {
                Severity::Critical => {
                    criticals += 1;
                    adaptation.speed_reduction *= 0.3;
                    adaptation.pause_increase *= 3.0;
                    adaptation.randomization_factor += 0.5;
                    adaptation.backoff_duration += Duration::from_millis(300_000);
                    adaptation.switch_persona = true;
                }
                Severity::High => {
                    highs += 1;
                    adaptation.speed_reduction *= 0.5;
                    adaptation.pause_increase *= 2.0;
                    adaptation.randomization_factor += 0.3;
                    adaptation.backoff_duration += Duration::from_millis(120_000);
                }
                Severity::Medium => {
                    adaptation.speed_reduction *= 0.7;
                    adaptation.pause_increase *= 1.5;
                    adaptation.randomization_factor += 0.2;
                    adaptation.backoff_duration += Duration::from_millis(60_000);
                }
                Severity::Low => {
                    adaptation.speed_reduction *= 0.9;
                    adaptation.pause_increase *= 1.2;
                    adaptation.randomization_factor += 0.1;
                    adaptation.backoff_duration += Duration::from_millis(30_000);
                }
            }
        }

        if criticals > 1 || highs > 2 {
            adaptation.switch_persona = true;
            adaptation.backoff_duration = adaptation.backoff_duration.max(ESCALATION_BACKOFF_FLOOR);
        }

        adaptation.speed_reduction = adaptation.speed_reduction.max(MIN_SPEED_REDUCTION);
        adaptation.pause_increase = adaptation.pause_increase.min(MAX_PAUSE_INCREASE);
        adaptation.randomization_factor = adaptation.randomization_factor.min(1.0);
        adaptation.backoff_duration = adaptation.backoff_duration.min(MAX_BACKOFF);

        adaptation
    }

    /// Append signals to the rolling history, pruning expired entries.
    pub fn observe<I>(&mut self, signals: I)
    where
        I: IntoIterator<Item = DetectionSignal>,
    {
        for signal in signals {
            self.history.push_back(signal);
        }
        self.prune(Utc::now());
    }

    /// Advisory risk score in [0, 100] over the recent signal window.
    pub fn evaluate_risk(&mut self, captcha_detected: bool, load_time: Duration) -> u8 {
        let now = Utc::now();
        self.prune(now);

        let cutoff = now - chrono::Duration::from_std(self.risk_window).unwrap_or_default();
        let mut score: f64 = self
            .history
            .iter()
            .filter(|signal| signal.timestamp >= cutoff)
            .map(|signal| match signal.severity {
                Severity::Critical => 40.0,
                Severity::High => 25.0,
                Severity::Medium => 15.0,
                Severity::Low => 5.0,
            })
            .sum();

        if captcha_detected {
            score += 50.0;
        }
        if load_time > self.slow_load_threshold {
            score += 20.0;
        }

        score.clamp(0.0, 100.0) as u8
    }

    /// Number of signals currently retained.
    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - chrono::Duration::from_std(self.retention).unwrap_or_default();
        while matches!(self.history.front(), Some(signal) if signal.timestamp < cutoff) {
            self.history.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::signals::SignalType;

    fn signal(severity: Severity) -> DetectionSignal {
        DetectionSignal::new(SignalType::Challenge, severity, "test", "test")
    }

    fn aged_signal(severity: Severity, age: Duration) -> DetectionSignal {
        let mut s = signal(severity);
        s.timestamp = Utc::now() - chrono::Duration::from_std(age).unwrap();
        s
    }

    #[test]
    fn single_critical_forces_persona_switch() {
        let adaptation = BehaviorAdaptor::fold(&[signal(Severity::Critical)]);
        assert!(adaptation.switch_persona);
        assert!(adaptation.backoff_duration >= Duration::from_millis(300_000));
        assert!((adaptation.speed_reduction - 0.3).abs() < 1e-9);
    }

    #[test]
    fn two_criticals_raise_backoff_floor() {
        let adaptation =
            BehaviorAdaptor::fold(&[signal(Severity::Critical), signal(Severity::Critical)]);
        assert!(adaptation.switch_persona);
        assert!(adaptation.backoff_duration >= Duration::from_millis(600_000));
    }

    #[test]
    fn three_highs_escalate() {
        let adaptation = BehaviorAdaptor::fold(&[
            signal(Severity::High),
            signal(Severity::High),
            signal(Severity::High),
        ]);
        assert!(adaptation.switch_persona);
        assert!(adaptation.backoff_duration >= Duration::from_millis(600_000));
    }

    #[test]
    fn folding_respects_clamps() {
        let batch: Vec<_> = (0..10).map(|_| signal(Severity::Critical)).collect();
        let adaptation = BehaviorAdaptor::fold(&batch);
        assert!(adaptation.speed_reduction >= MIN_SPEED_REDUCTION);
        assert!(adaptation.pause_increase <= MAX_PAUSE_INCREASE);
        assert!(adaptation.randomization_factor <= 1.0);
        assert!(adaptation.backoff_duration <= MAX_BACKOFF);
    }

    #[test]
    fn empty_batch_is_neutral() {
        assert!(BehaviorAdaptor::fold(&[]).is_neutral());
    }

    #[test]
    fn risk_is_non_decreasing_with_more_signals() {
        let mut adaptor = BehaviorAdaptor::new();
        let base = adaptor.evaluate_risk(false, Duration::from_secs(1));

        adaptor.observe([signal(Severity::High)]);
        let one = adaptor.evaluate_risk(false, Duration::from_secs(1));
        assert!(one >= base);

        adaptor.observe([signal(Severity::Critical)]);
        let two = adaptor.evaluate_risk(false, Duration::from_secs(1));
        assert!(two >= one);
    }

    #[test]
    fn risk_decays_as_signals_age_out() {
        let mut adaptor = BehaviorAdaptor::new();
        adaptor.observe([aged_signal(Severity::High, Duration::from_secs(10))]);
        let fresh = adaptor.evaluate_risk(false, Duration::from_secs(1));

        let mut aged = BehaviorAdaptor::new();
        aged.observe([aged_signal(Severity::High, Duration::from_secs(600))]);
        let stale = aged.evaluate_risk(false, Duration::from_secs(1));

        assert!(fresh > stale);
        assert_eq!(stale, 0);
    }

    #[test]
    fn captcha_and_slow_load_add_points() {
        let mut adaptor = BehaviorAdaptor::new();
        assert_eq!(adaptor.evaluate_risk(false, Duration::from_secs(1)), 0);
        assert_eq!(adaptor.evaluate_risk(true, Duration::from_secs(1)), 50);
        assert_eq!(adaptor.evaluate_risk(true, Duration::from_secs(15)), 70);
    }

    #[test]
    fn risk_is_clamped_to_100() {
        let mut adaptor = BehaviorAdaptor::new();
        adaptor.observe((0..10).map(|_| signal(Severity::Critical)));
        assert_eq!(adaptor.evaluate_risk(true, Duration::from_secs(20)), 100);
    }
}

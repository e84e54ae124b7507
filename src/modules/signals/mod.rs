//! Bot-detection signal monitoring.
//!
//! Inspects a fetch outcome (body, headers, timing) and classifies the
//! observable anti-bot artifacts into typed signals, plus a layered CAPTCHA
//! detector with graded confidence.

use std::time::Duration;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::routing::types::FetchOutcome;

/// Broad category of a detection signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalType {
    Behavioral,
    Technical,
    RateLimit,
    Challenge,
}

/// Severity ladder. Ordering matters: `Critical > High > Medium > Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// One classified detection signal. Ephemeral; retained only inside the
/// behavior adaptor's rolling history.
#[derive(Debug, Clone)]
pub struct DetectionSignal {
    pub signal_type: SignalType,
    pub severity: Severity,
    pub description: String,
    pub timestamp: DateTime<Utc>,
    pub adaptation_suggestion: String,
}

impl DetectionSignal {
    pub fn new(
        signal_type: SignalType,
        severity: Severity,
        description: impl Into<String>,
        adaptation_suggestion: impl Into<String>,
    ) -> Self {
        Self {
            signal_type,
            severity,
            description: description.into(),
            timestamp: Utc::now(),
            adaptation_suggestion: adaptation_suggestion.into(),
        }
    }
}

/// CAPTCHA family identified by [`SignalMonitor::detect_captcha`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptchaKind {
    Recaptcha,
    Hcaptcha,
    GenericChallenge,
    Unknown,
}

/// Result of layered CAPTCHA classification.
#[derive(Debug, Clone, Copy)]
pub struct CaptchaDetection {
    pub kind: CaptchaKind,
    pub detected: bool,
    pub confidence: f32,
}

impl CaptchaDetection {
    fn none() -> Self {
        Self {
            kind: CaptchaKind::Unknown,
            detected: false,
            confidence: 0.0,
        }
    }
}

struct SignalPattern {
    signal_type: SignalType,
    severity: Severity,
    description: &'static str,
    suggestion: &'static str,
    patterns: Vec<Regex>,
}

impl SignalPattern {
    fn new(
        signal_type: SignalType,
        severity: Severity,
        description: &'static str,
        suggestion: &'static str,
        raw_patterns: &[&str],
    ) -> Self {
        Self {
            signal_type,
            severity,
            description,
            suggestion,
            patterns: raw_patterns.iter().map(|p| build_regex(p)).collect(),
        }
    }

    fn matches(&self, body: &str) -> bool {
        self.patterns.iter().any(|regex| regex.is_match(body))
    }
}

/// Static signature table for body-based classification.
static BODY_SIGNATURES: Lazy<Vec<SignalPattern>> = Lazy::new(|| {
    vec![
        SignalPattern::new(
            SignalType::RateLimit,
            Severity::High,
            "challenge or verification interstitial",
            "reduce request rate and back off before retrying",
            &[
                r"checking your browser",
                r"verify (?:that )?you are (?:a )?human",
                r"please wait while we verify",
                r#"<meta[^>]*http-equiv=["']refresh["']"#,
                r#"<meta[^>]*http-equiv=["']content-security-policy["']"#,
                r"unusual traffic from your (?:computer )?network",
            ],
        ),
        SignalPattern::new(
            SignalType::Behavioral,
            Severity::Medium,
            "behavioral analysis script present",
            "randomize timing and interaction fingerprint",
            &[
                r"fingerprint(?:js|2)?",
                r"navigator\.webdriver",
                r"(?:mousemove|keystroke)\s*(?:tracking|dynamics)",
                r"datadome",
                r"perimeterx|px-captcha",
                r"distil_r_captcha",
            ],
        ),
        SignalPattern::new(
            SignalType::Technical,
            Severity::Medium,
            "hidden interactive elements (honeypot risk)",
            "avoid interacting with invisible form fields",
            &[
                r#"<input[^>]*style=["'][^"']*display:\s*none"#,
                r#"<input[^>]*style=["'][^"']*visibility:\s*hidden"#,
                r#"<button[^>]*style=["'][^"']*display:\s*none"#,
                r#"<input[^>]*type=["']text["'][^>]*hidden[\s>]"#,
            ],
        ),
        SignalPattern::new(
            SignalType::Challenge,
            Severity::High,
            "explicit blocking response",
            "rotate identity before the next request",
            &[
                r"access denied",
                r"403 forbidden",
                r"rate limit exceeded",
                r"you have been blocked",
                r"your ip has been banned",
            ],
        ),
    ]
});

struct CaptchaSignature {
    kind: CaptchaKind,
    confidence: f32,
    patterns: Vec<Regex>,
}

/// Markup signatures: the strongest evidence tier.
static CAPTCHA_MARKUP: Lazy<Vec<CaptchaSignature>> = Lazy::new(|| {
    vec![
        CaptchaSignature {
            kind: CaptchaKind::Recaptcha,
            confidence: 0.9,
            patterns: vec![
                build_regex(r#"class=["']g-recaptcha["']"#),
                build_regex(r"www\.google\.com/recaptcha/api\.js"),
                build_regex(r"g-recaptcha-response"),
            ],
        },
        CaptchaSignature {
            kind: CaptchaKind::Hcaptcha,
            confidence: 0.9,
            patterns: vec![
                build_regex(r#"class=["']h-captcha["']"#),
                build_regex(r"hcaptcha\.com/1/api\.js"),
                build_regex(r"h-captcha-response"),
            ],
        },
    ]
});

static CHALLENGE_PHRASES: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        build_regex(r"complete the (?:captcha|security check)"),
        build_regex(r"prove (?:that )?you(?:'re| are) (?:not a robot|human)"),
        build_regex(r"solve the challenge below"),
        build_regex(r"select all (?:images|squares) (?:with|containing)"),
    ]
});

static CHALLENGE_TITLES: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        build_regex(r"<title>[^<]*attention required[^<]*</title>"),
        build_regex(r"<title>[^<]*just a moment[^<]*</title>"),
        build_regex(r"<title>[^<]*security check[^<]*</title>"),
    ]
});

/// Stateless classifier over fetch outcomes.
///
/// Pure function of one fetch's observable artifacts; any rolling history
/// belongs to the behavior adaptor.
#[derive(Debug, Default)]
pub struct SignalMonitor {
    /// Load times above this emit a low-severity technical signal.
    slow_load_threshold: Duration,
}

impl SignalMonitor {
    pub fn new() -> Self {
        Self {
            slow_load_threshold: Duration::from_secs(10),
        }
    }

    pub fn with_slow_load_threshold(mut self, threshold: Duration) -> Self {
        self.slow_load_threshold = threshold;
        self
    }

    /// Classify an outcome into zero or more detection signals.
    pub fn detect_signals(&self, outcome: &FetchOutcome) -> Vec<DetectionSignal> {
        let mut signals = Vec::new();
        let body = outcome.content.to_lowercase();

        for signature in BODY_SIGNATURES.iter() {
            if signature.matches(&body) {
                signals.push(DetectionSignal::new(
                    signature.signal_type,
                    signature.severity,
                    signature.description,
                    signature.suggestion,
                ));
            }
        }

        if outcome.load_time > self.slow_load_threshold {
            signals.push(DetectionSignal::new(
                SignalType::Technical,
                Severity::Low,
                format!(
                    "slow navigation ({:.1}s)",
                    outcome.load_time.as_secs_f64()
                ),
                "allow longer timeouts and reduce pressure on the target",
            ));
        }

        if matches!(outcome.status_code, 429) {
            signals.push(DetectionSignal::new(
                SignalType::RateLimit,
                Severity::Critical,
                "explicit 429 rate-limit response",
                "honor retry-after and pause the campaign",
            ));
        }

        if let Some(captcha) = self.captcha_signal(outcome) {
            signals.push(captcha);
        }

        signals
    }

    /// Layered CAPTCHA classification: markup signatures beat page phrases,
    /// which beat title heuristics.
    pub fn detect_captcha(&self, outcome: &FetchOutcome) -> CaptchaDetection {
        let body = outcome.content.to_lowercase();

        for signature in CAPTCHA_MARKUP.iter() {
            if signature.patterns.iter().any(|regex| regex.is_match(&body)) {
                return CaptchaDetection {
                    kind: signature.kind,
                    detected: true,
                    confidence: signature.confidence,
                };
            }
        }

        if CHALLENGE_PHRASES.iter().any(|regex| regex.is_match(&body)) {
            return CaptchaDetection {
                kind: CaptchaKind::GenericChallenge,
                detected: true,
                confidence: 0.7,
            };
        }

        if CHALLENGE_TITLES.iter().any(|regex| regex.is_match(&body)) {
            return CaptchaDetection {
                kind: CaptchaKind::GenericChallenge,
                detected: true,
                confidence: 0.6,
            };
        }

        CaptchaDetection::none()
    }

    fn captcha_signal(&self, outcome: &FetchOutcome) -> Option<DetectionSignal> {
        let detection = self.detect_captcha(outcome);
        if !detection.detected {
            return None;
        }
        let severity = if detection.confidence >= 0.9 {
            Severity::Critical
        } else {
            Severity::High
        };
        Some(DetectionSignal::new(
            SignalType::Challenge,
            severity,
            format!(
                "captcha detected ({:?}, confidence {:.2})",
                detection.kind, detection.confidence
            ),
            "switch persona and solve or route around the challenge",
        ))
    }
}

fn build_regex(pattern: &str) -> Regex {
    regex::RegexBuilder::new(pattern)
        .case_insensitive(true)
        .multi_line(true)
        .dot_matches_new_line(true)
        .build()
        .unwrap_or_else(|err| panic!("invalid detection signature `{}`: {}", pattern, err))
}

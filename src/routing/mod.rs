//! Routing core.
//!
//! Request/attempt vocabulary, the strategy registry with rolling
//! statistics, ordering policies, and the circuit-breaker evaluator.

pub mod breaker;
pub mod policy;
pub mod registry;
pub mod types;

pub use breaker::{BreakerEvaluator, BREAKER_COOLDOWN};
pub use registry::{
    BreakerTransition, ConcurrencyPermit, EvaluationParams, StrategyEntry, StrategyRegistry,
    StrategySnapshot,
};
pub use types::{
    AttemptError, FetchOutcome, RouteAttempt, RouteRequest, RouteResult, SkipReason,
    StrategyError,
};

//! Cross-cutting services module
//!
//! Detection-signal classification, behavior adaptation, proxy pool
//! management, and the routing event system.

pub mod behavior;
pub mod events;
pub mod pool;
pub mod signals;

// Re-export commonly used types
pub use behavior::{BehaviorAdaptation, BehaviorAdaptor};
pub use events::{
    AttemptFinishedEvent, AttemptStartedEvent, BreakerEvent, EventDispatcher, EventHandler,
    LoggingHandler, RetryScheduledEvent, RouterEvent,
};
pub use pool::{
    EndpointFilter, EndpointProber, PoolConfig, PoolHealthReport, PoolHealthTask, ProxyCredentials,
    ProxyEndpoint, ProxyPoolManager, ProxyProtocol,
};
pub use signals::{
    CaptchaDetection, CaptchaKind, DetectionSignal, Severity, SignalMonitor, SignalType,
};

//! Risk Manager
//!
//! The risk gate that authorizes every trade, named circuit breakers for
//! remote dependencies, and the notifier seam for kill-switch alerts.

pub mod circuit_breaker;
pub mod notifier;
pub mod risk_gate;

pub use circuit_breaker::{
    BreakerConfig, BreakerError, BreakerRegistry, BreakerState, CircuitBreaker, CircuitState,
    EXCHANGE_API,
};
pub use notifier::{LogNotifier, Notifier, NotifyError};
pub use risk_gate::{
    Decision, DecisionReason, RiskConfig, RiskError, RiskGate, RiskSnapshot, SyncReport,
};

#[cfg(any(test, feature = "mocks"))]
pub use notifier::MockNotifier;

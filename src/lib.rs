//! Trade Guard: the safety and execution core of an automated trading client.
//!
//! This is the root crate that provides benchmark and integration-test access
//! to the workspace. For actual functionality, use the individual crates:
//!
//! - `trading-core`: Shared types, exchange client trait, clock, configuration
//! - `audit-ledger`: Append-only JSON-lines record of risk decisions
//! - `risk-manager`: Risk gate, kill-switch, named circuit breakers
//! - `trading-engine`: Feed supervisor, cycle scheduler, executor, paper exchange

pub use audit_ledger as audit;
pub use risk_manager as risk;
pub use trading_core as core;
pub use trading_engine as engine;

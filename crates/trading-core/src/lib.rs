//! Trading Core Library
//!
//! Shared types, the exchange client seam, time source, and configuration for
//! the risk gate, audit ledger, feed supervisor, and cycle scheduler.

pub mod clock;
pub mod config;
pub mod error;
pub mod exchange;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DependencyFailure, Error, Result};
pub use exchange::{ExchangeClient, FeedStream};
pub use types::*;

//! Core domain types shared by the risk and execution crates.

pub mod intent;
pub mod market;
pub mod order;
pub mod position;

pub use intent::*;
pub use market::*;
pub use order::*;
pub use position::*;

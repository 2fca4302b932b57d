//! Domain layer - port definitions
//!
//! Traits the reconciliation engine talks through; adapters in `cloud` and
//! `store` implement them.

pub mod ports;

pub use ports::*;

//! Per-symbol edge signals.
//!
//! The predictive model lives outside this crate; the engine consumes its
//! output through [`SignalProvider`].

mod provider;

pub use provider::{HttpSignalProvider, Signal, SignalProvider, StaticSignalProvider};

#[cfg(test)]
pub use provider::MockSignalProvider;

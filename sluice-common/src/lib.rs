//! Plumbing shared by every sluice crate: the shutdown signal, logging
//! initialisation and the audit trail.

pub mod audit;
pub mod logging;

pub use tracing;

/// Broadcast to long-running tasks (dispatch workers, the controller) to
/// ask them to wind down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
    Finalised,
}

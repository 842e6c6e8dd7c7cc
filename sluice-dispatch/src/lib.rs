//! Priority and connection-state driven dispatch for sluice destinations
//!
//! This crate provides:
//! - The dispatch policy engine: rule sets keyed on connection state and
//!   status token, with priority overrides and atomic hot reload
//! - The collaborator traits the core calls out to ([`Transport`],
//!   [`ErrorHandler`])
//! - A per-destination [`DispatchManager`] that drains a queue in priority
//!   order
//! - A [`Broker`] that opens destinations on demand and routes calls to them

mod broker;
mod config;
mod error;
mod manager;
pub mod policy;
mod state;
mod transport;

pub use broker::Broker;
pub use config::DispatchConfig;
pub use error::{DispatchError, Result, TransportError};
pub use manager::{DispatchManager, DispatchPass};
pub use policy::{
    Decision, DispatchAction, DispatchPolicy, PriorityOverride, PriorityRange, RuleSet,
    StatusRule, WILDCARD,
};
pub use state::ConnectionState;
pub use transport::{DestroyReason, ErrorHandler, LoggingErrorHandler, Transport};

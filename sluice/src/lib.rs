//! The sluice broker: a controller that opens the configured destinations,
//! drains them through their transports and shuts them down cleanly.

pub mod controller;
pub mod sink;

use std::fmt;

use serde::{Deserialize, Serialize};

/// Health of a destination's delivery channel, as reported by its transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Connected, entries can be sent
    #[default]
    #[serde(alias = "ALIVE")]
    Alive,
    /// Connection lost, the transport is trying to re-establish it
    #[serde(alias = "POLLING")]
    Polling,
    /// The transport gave up, or the destination was stopped
    #[serde(alias = "DEAD")]
    Dead,
}

impl ConnectionState {
    pub const ALL: [Self; 3] = [Self::Alive, Self::Polling, Self::Dead];

    #[must_use]
    pub const fn is_alive(self) -> bool {
        matches!(self, Self::Alive)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Alive => "ALIVE",
            Self::Polling => "POLLING",
            Self::Dead => "DEAD",
        })
    }
}

//! Rule sets mapping connection state, status token and priority to an action.
//!
//! A rule set is an ordered list of status rules. The first rule whose
//! connection state and status token match is used; inside it, the
//! narrowest priority override covering the entry's priority decides, and
//! the rule's own action applies when none does.
//!
//! ```ron
//! (
//!     default_status: Some("64k"),
//!     rules: [
//!         (state: Some(Alive), action: Send),
//!         (
//!             state: Some(Polling),
//!             action: Queue,
//!             overrides: [
//!                 (priority: "0-3", action: Destroy),
//!                 (priority: "9", action: Queue, notify_sender: true),
//!             ],
//!         ),
//!         (state: Some(Dead), action: Queue),
//!     ],
//! )
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use sluice_common::tracing::warn;
use sluice_store::Priority;

use super::{Decision, DispatchAction};
use crate::{ConnectionState, DispatchError};

/// Matches any status token.
pub const WILDCARD: &str = "*";

fn wildcard() -> String {
    WILDCARD.to_string()
}

/// Inclusive priority range, written `"4-9"` or `"7"` in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PriorityRange {
    lo: u8,
    hi: u8,
}

impl PriorityRange {
    /// # Errors
    /// If `lo > hi` or either bound is above 9
    pub fn new(lo: u8, hi: u8) -> Result<Self, DispatchError> {
        if lo > hi || hi > Priority::MAX.get() {
            return Err(DispatchError::InvalidConfig(format!(
                "Priority range {lo}-{hi} must satisfy lo <= hi <= {}",
                Priority::MAX
            )));
        }
        Ok(Self { lo, hi })
    }

    #[must_use]
    pub const fn contains(self, priority: Priority) -> bool {
        self.lo <= priority.get() && priority.get() <= self.hi
    }

    #[must_use]
    pub const fn width(self) -> u8 {
        self.hi - self.lo
    }
}

impl std::str::FromStr for PriorityRange {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |bound: &str| {
            bound.trim().parse::<u8>().map_err(|e| {
                DispatchError::InvalidConfig(format!("Malformed priority range {s:?}: {e}"))
            })
        };

        match s.split_once('-') {
            Some((lo, hi)) => Self::new(parse(lo)?, parse(hi)?),
            None => {
                let single = parse(s)?;
                Self::new(single, single)
            }
        }
    }
}

impl TryFrom<String> for PriorityRange {
    type Error = DispatchError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PriorityRange> for String {
    fn from(range: PriorityRange) -> Self {
        range.to_string()
    }
}

impl fmt::Display for PriorityRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.lo == self.hi {
            write!(f, "{}", self.lo)
        } else {
            write!(f, "{}-{}", self.lo, self.hi)
        }
    }
}

/// Action for the entries of one priority range within a rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityOverride {
    pub priority: PriorityRange,
    pub action: DispatchAction,
    #[serde(default)]
    pub notify_sender: bool,
}

/// One entry of a rule set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRule {
    /// Connection state this rule applies to (`None` = any)
    #[serde(default)]
    pub state: Option<ConnectionState>,

    /// Status token this rule applies to (`"*"` = any)
    #[serde(default = "wildcard")]
    pub status: String,

    /// Action when no override covers the priority
    pub action: DispatchAction,

    #[serde(default)]
    pub notify_sender: bool,

    #[serde(default)]
    pub overrides: Vec<PriorityOverride>,
}

impl StatusRule {
    /// A rule for `state` under any status token, with no overrides.
    #[must_use]
    pub fn new(state: ConnectionState, action: DispatchAction) -> Self {
        Self {
            state: Some(state),
            status: wildcard(),
            action,
            notify_sender: false,
            overrides: Vec::new(),
        }
    }

    /// Add a priority override.
    #[must_use]
    pub fn with_override(mut self, priority: PriorityRange, action: DispatchAction) -> Self {
        self.overrides.push(PriorityOverride {
            priority,
            action,
            notify_sender: false,
        });
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }

    /// Whether this rule applies to `state` with the given status token.
    ///
    /// A wildcard rule applies to any token. A token of `"*"` means no
    /// token is set, so only wildcard rules apply to it.
    fn matches(&self, state: ConnectionState, status: &str) -> bool {
        self.state.is_none_or(|s| s == state) && (self.status == WILDCARD || self.status == status)
    }

    fn decide(&self, priority: Priority) -> Decision {
        // Narrowest range wins; min_by_key keeps the first of equals
        self.overrides
            .iter()
            .filter(|o| o.priority.contains(priority))
            .min_by_key(|o| o.priority.width())
            .map_or(
                Decision {
                    action: self.action,
                    notify_sender: self.notify_sender,
                },
                |o| Decision {
                    action: o.action,
                    notify_sender: o.notify_sender,
                },
            )
    }

    /// Whether this rule applies to everything `other` applies to.
    fn shadows(&self, other: &Self) -> bool {
        (self.state.is_none() || self.state == other.state)
            && (self.status == WILDCARD || self.status == other.status)
    }
}

/// An ordered list of status rules plus fallbacks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSet {
    /// Status token in force until an administrator sets another
    #[serde(default)]
    pub default_status: Option<String>,

    /// Action when no rule matches
    #[serde(default)]
    pub default_action: Option<DispatchAction>,

    #[serde(default)]
    pub rules: Vec<StatusRule>,
}

impl RuleSet {
    /// Always send while alive, queue otherwise.
    #[must_use]
    pub fn send_when_alive() -> Self {
        Self {
            default_status: None,
            default_action: Some(DispatchAction::Queue),
            rules: vec![StatusRule::new(ConnectionState::Alive, DispatchAction::Send)],
        }
    }

    /// Check the rule set before it is put into service.
    ///
    /// A rule set is rejected when some connection state could go unhandled
    /// (no rule for it under every status token and no default action), or
    /// when a status token is empty. Rules that can never match because an
    /// earlier rule covers them are only warned about.
    ///
    /// # Errors
    /// [`DispatchError::InvalidConfig`] describing the problem
    pub fn validate(&self) -> Result<(), DispatchError> {
        if let Some(index) = self.rules.iter().position(|rule| rule.status.is_empty()) {
            return Err(DispatchError::InvalidConfig(format!(
                "Rule {index} has an empty status token, use \"*\" to match any"
            )));
        }

        if matches!(self.default_status.as_deref(), Some("")) {
            return Err(DispatchError::InvalidConfig(
                "Default status token may not be empty".to_string(),
            ));
        }

        if self.default_action.is_none() {
            let unhandled: Vec<String> = ConnectionState::ALL
                .into_iter()
                .filter(|&state| {
                    !self
                        .rules
                        .iter()
                        .any(|rule| rule.status == WILDCARD && rule.state.is_none_or(|s| s == state))
                })
                .map(|state| state.to_string())
                .collect();

            if !unhandled.is_empty() {
                return Err(DispatchError::InvalidConfig(format!(
                    "No rule handles {} for every status token and no default action is set",
                    unhandled.join(", ")
                )));
            }
        }

        for (index, rule) in self.rules.iter().enumerate() {
            if let Some(earlier) = self.rules[..index].iter().position(|r| r.shadows(rule)) {
                warn!(
                    rule = index,
                    shadowed_by = earlier,
                    "Dispatch rule can never match, an earlier rule covers it"
                );
            }
        }

        Ok(())
    }

    /// Decide what to do with an entry of `priority`.
    #[must_use]
    pub fn decide(&self, priority: Priority, state: ConnectionState, status: &str) -> Decision {
        self.rules
            .iter()
            .find(|rule| rule.matches(state, status))
            .map_or_else(
                || Decision {
                    action: self.default_action.unwrap_or(DispatchAction::Queue),
                    notify_sender: false,
                },
                |rule| rule.decide(priority),
            )
    }
}

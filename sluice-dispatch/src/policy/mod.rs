//! Dispatch policy: what happens to an entry given the destination's state.
//!
//! ## Policies
//!
//! - [`RuleSet`]: ordered status rules with priority overrides
//! - [`DispatchPolicy`]: the live rule set and status token, shared by every
//!   destination and replaceable at runtime

pub mod rules;

use std::sync::Arc;

use parking_lot::RwLock;
pub use rules::{PriorityOverride, PriorityRange, RuleSet, StatusRule, WILDCARD};
use serde::{Deserialize, Serialize};
use sluice_common::internal;
use sluice_store::Priority;

use crate::{ConnectionState, error::Result};

/// What to do with an entry taken from the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DispatchAction {
    /// Hand it to the transport now
    #[serde(alias = "SEND")]
    Send,
    /// Leave it queued until the next pass
    #[serde(alias = "QUEUE")]
    Queue,
    /// Drop it and report the loss
    #[serde(alias = "DESTROY")]
    Destroy,
}

/// The outcome of evaluating the rules for one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub action: DispatchAction,
    /// Whether the entry's sender asked to hear about this action
    pub notify_sender: bool,
}

/// The rules in force plus the administrator's status token.
///
/// Evaluation is pure: the same priority, state and token always produce
/// the same decision for a given rule set. Rule sets are swapped whole, so a
/// pass sees either the old rules or the new ones, never a mixture.
#[derive(Debug)]
pub struct DispatchPolicy {
    rules: RwLock<Arc<RuleSet>>,
    status: RwLock<Arc<str>>,
}

impl DispatchPolicy {
    /// # Errors
    /// If `rules` fails validation
    pub fn new(rules: RuleSet) -> Result<Self> {
        rules.validate()?;

        let status: Arc<str> = rules.default_status.as_deref().unwrap_or(WILDCARD).into();
        Ok(Self {
            rules: RwLock::new(Arc::new(rules)),
            status: RwLock::new(status),
        })
    }

    /// Evaluate the current rules for an explicit status token.
    #[must_use]
    pub fn decision(&self, priority: Priority, state: ConnectionState, status: &str) -> Decision {
        self.snapshot().decide(priority, state, status)
    }

    #[must_use]
    pub fn decide(&self, priority: Priority, state: ConnectionState, status: &str) -> DispatchAction {
        self.decision(priority, state, status).action
    }

    /// Evaluate the current rules under the current status token.
    #[must_use]
    pub fn current_decision(&self, priority: Priority, state: ConnectionState) -> Decision {
        let status = self.status_token();
        self.decision(priority, state, &status)
    }

    /// Replace the rule set.
    ///
    /// # Errors
    /// If `rules` fails validation, in which case the previous rules stay in force
    pub fn reconfigure(&self, rules: RuleSet) -> Result<()> {
        if let Err(e) = rules.validate() {
            internal!(level = ERROR, "Rejected dispatch rules, keeping previous rules: {e}");
            return Err(e);
        }

        let count = rules.rules.len();
        *self.rules.write() = Arc::new(rules);
        internal!(level = INFO, "Dispatch rules replaced ({count} rules)");
        Ok(())
    }

    /// The rule set currently in force.
    #[must_use]
    pub fn snapshot(&self) -> Arc<RuleSet> {
        Arc::clone(&self.rules.read())
    }

    #[must_use]
    pub fn status_token(&self) -> Arc<str> {
        Arc::clone(&self.status.read())
    }

    /// Set the administrator's status token. `"*"` clears it.
    pub fn set_status_token(&self, token: &str) {
        *self.status.write() = token.into();
        internal!(level = INFO, "Dispatch status token set to {token:?}");
    }
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        let rules = RuleSet::send_when_alive();
        Self {
            rules: RwLock::new(Arc::new(rules)),
            status: RwLock::new(WILDCARD.into()),
        }
    }
}

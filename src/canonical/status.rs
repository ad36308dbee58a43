//! Canonical Transfer Status
//!
//! The core's own lifecycle vocabulary. Nothing outside `canonical`
//! should ever compare against custodian state strings.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Canonical transfer states
///
/// ```text
/// building → signing → submitting → waiting_approval → broadcast → pending
///     → confirmed | failed | rejected | canceled
/// ```
///
/// `unknown` sits outside the chain: it is what an unmapped custodian state
/// degrades to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalStatus {
    Building,
    Signing,
    Submitting,
    WaitingApproval,
    Broadcast,
    Pending,
    /// Terminal: on-chain and confirmed
    Confirmed,
    /// Terminal
    Failed,
    /// Terminal: an approver declined
    Rejected,
    /// Terminal
    Canceled,
    Unknown,
}

impl CanonicalStatus {
    pub const ALL: [CanonicalStatus; 11] = [
        CanonicalStatus::Building,
        CanonicalStatus::Signing,
        CanonicalStatus::Submitting,
        CanonicalStatus::WaitingApproval,
        CanonicalStatus::Broadcast,
        CanonicalStatus::Pending,
        CanonicalStatus::Confirmed,
        CanonicalStatus::Failed,
        CanonicalStatus::Rejected,
        CanonicalStatus::Canceled,
        CanonicalStatus::Unknown,
    ];

    /// States the reconciliation loop keeps polling
    pub const NON_TERMINAL: [CanonicalStatus; 7] = [
        CanonicalStatus::Building,
        CanonicalStatus::Signing,
        CanonicalStatus::Submitting,
        CanonicalStatus::WaitingApproval,
        CanonicalStatus::Broadcast,
        CanonicalStatus::Pending,
        CanonicalStatus::Unknown,
    ];

    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CanonicalStatus::Confirmed
                | CanonicalStatus::Failed
                | CanonicalStatus::Rejected
                | CanonicalStatus::Canceled
        )
    }

    /// Terminal outcomes that did not move funds
    #[inline]
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            CanonicalStatus::Failed | CanonicalStatus::Rejected | CanonicalStatus::Canceled
        )
    }

    /// Position along the lifecycle. `None` for `unknown`.
    fn rank(&self) -> Option<u8> {
        match self {
            CanonicalStatus::Building => Some(0),
            CanonicalStatus::Signing => Some(1),
            CanonicalStatus::Submitting => Some(2),
            CanonicalStatus::WaitingApproval => Some(3),
            CanonicalStatus::Broadcast => Some(4),
            CanonicalStatus::Pending => Some(5),
            CanonicalStatus::Confirmed
            | CanonicalStatus::Failed
            | CanonicalStatus::Rejected
            | CanonicalStatus::Canceled => Some(6),
            CanonicalStatus::Unknown => None,
        }
    }

    /// Whether moving from `self` to `next` keeps the lifecycle monotonic.
    ///
    /// - terminal states never change
    /// - any non-terminal state may end in any terminal state
    /// - `unknown` never replaces a known state
    /// - otherwise the lifecycle position must strictly increase
    pub fn can_transition_to(&self, next: CanonicalStatus) -> bool {
        if *self == next || self.is_terminal() {
            return false;
        }
        if next.is_terminal() {
            return true;
        }
        match (self.rank(), next.rank()) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some(from), Some(to)) => to > from,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CanonicalStatus::Building => "building",
            CanonicalStatus::Signing => "signing",
            CanonicalStatus::Submitting => "submitting",
            CanonicalStatus::WaitingApproval => "waiting_approval",
            CanonicalStatus::Broadcast => "broadcast",
            CanonicalStatus::Pending => "pending",
            CanonicalStatus::Confirmed => "confirmed",
            CanonicalStatus::Failed => "failed",
            CanonicalStatus::Rejected => "rejected",
            CanonicalStatus::Canceled => "canceled",
            CanonicalStatus::Unknown => "unknown",
        }
    }

    /// Human-readable description for operators
    pub fn description(&self) -> &'static str {
        match self {
            CanonicalStatus::Building => "Transaction is being built",
            CanonicalStatus::Signing => "Transaction is awaiting signatures",
            CanonicalStatus::Submitting => "Signed transaction is being submitted to the custodian",
            CanonicalStatus::WaitingApproval => "Transfer is waiting for approvals",
            CanonicalStatus::Broadcast => "Transaction has been broadcast to the network",
            CanonicalStatus::Pending => "Transaction is pending confirmation",
            CanonicalStatus::Confirmed => "Transfer confirmed on-chain",
            CanonicalStatus::Failed => "Transfer failed",
            CanonicalStatus::Rejected => "Transfer was rejected by an approver",
            CanonicalStatus::Canceled => "Transfer was canceled",
            CanonicalStatus::Unknown => "Custodian reported an unrecognized state",
        }
    }
}

impl fmt::Display for CanonicalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for CanonicalStatus {
    type Err = ();

    /// Parse a canonical name (as persisted). Custodian strings go through
    /// [`crate::canonical::normalize`] instead.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CanonicalStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or(())
    }
}

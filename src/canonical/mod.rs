//! Status Canonicalizer
//!
//! Maps the custodian's transfer and wallet vocabulary onto the core's own
//! state machine, and derives risk, SLA and staleness from it.
//!
//! Every function here is deterministic and side-effect free, so the same
//! canonicalizer is shared by the request path and the reconciliation loop.

pub mod normalize;
pub mod risk;
pub mod sla;
pub mod status;
pub mod wallet;

pub use normalize::normalize;
pub use risk::{ApprovalCounts, RiskLevel, RiskPolicy, ValueThresholds};
pub use sla::{SlaPolicy, SlaProfile, SlaTier};
pub use status::CanonicalStatus;
pub use wallet::WalletClass;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::custodian::{CustodianTransfer, Recipient};

/// A raw custodian transfer plus everything derived from it. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedTransfer {
    pub transfer: CustodianTransfer,
    pub status: CanonicalStatus,
    pub status_description: String,
    pub is_stale: bool,
    pub risk: RiskLevel,
    pub sla: SlaProfile,
    pub wallet_class: WalletClass,
}

/// Approval progress for a transfer waiting on approvers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalSummary {
    pub received: u32,
    pub required: u32,
    /// End of the approval SLA window, if the profile has one
    pub expires_at: Option<DateTime<Utc>>,
    /// Whole seconds left in the window; zero once it has passed
    pub seconds_remaining: Option<i64>,
}

impl ApprovalSummary {
    pub fn outstanding(&self) -> u32 {
        self.required.saturating_sub(self.received)
    }
}

#[derive(Debug, Clone, Default)]
pub struct StatusCanonicalizer {
    risk: RiskPolicy,
    sla: SlaPolicy,
}

impl StatusCanonicalizer {
    pub fn new(risk: RiskPolicy, sla: SlaPolicy) -> Self {
        Self { risk, sla }
    }

    pub fn normalize(&self, custodian_state: &str, detail: &CustodianTransfer) -> CanonicalStatus {
        normalize(custodian_state, detail)
    }

    pub fn assess_risk(&self, coin: &str, recipients: &[Recipient], class: WalletClass) -> RiskLevel {
        self.risk.assess(coin, recipients, class)
    }

    pub fn required_approvals(&self, risk: RiskLevel, class: WalletClass) -> u32 {
        self.risk.required_approvals(risk, class)
    }

    pub fn get_sla(&self, class: WalletClass, risk: RiskLevel) -> SlaProfile {
        self.sla.get_sla(class, risk)
    }

    pub fn is_stale(
        &self,
        class: WalletClass,
        risk: RiskLevel,
        started_at: DateTime<Utc>,
        status: CanonicalStatus,
        now: DateTime<Utc>,
    ) -> bool {
        self.get_sla(class, risk).is_stale(started_at, status, now)
    }

    /// Full derivation for one custodian transfer.
    ///
    /// The transfer's own creation time anchors staleness; without one the
    /// transfer is never reported stale.
    pub fn normalize_transfer(
        &self,
        transfer: &CustodianTransfer,
        wallet_type: &str,
        now: DateTime<Utc>,
    ) -> NormalizedTransfer {
        let status = self.normalize(&transfer.state, transfer);
        let wallet_class = WalletClass::from_wallet_type(wallet_type);
        let risk = self.assess_risk(&transfer.coin, &transfer.recipients, wallet_class);
        let sla = self.get_sla(wallet_class, risk);
        let is_stale = transfer
            .created_time
            .is_some_and(|created| sla.is_stale(created, status, now));

        NormalizedTransfer {
            transfer: transfer.clone(),
            status,
            status_description: status.description().to_string(),
            is_stale,
            risk,
            sla,
            wallet_class,
        }
    }

    /// Progress against the approval SLA window that opened at `requested_at`.
    pub fn approval_summary(
        &self,
        received: u32,
        required: u32,
        sla: &SlaProfile,
        requested_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> ApprovalSummary {
        let expires_at = sla
            .approval_sla
            .and_then(|window| chrono::Duration::from_std(window).ok())
            .and_then(|window| requested_at.checked_add_signed(window));
        let seconds_remaining = expires_at.map(|at| (at - now).num_seconds().max(0));

        ApprovalSummary {
            received: received.min(required),
            required,
            expires_at,
            seconds_remaining,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cold_transfer(hours_ago: i64, state: &str) -> CustodianTransfer {
        CustodianTransfer {
            id: "t-cold".into(),
            coin: "btc".into(),
            state: state.into(),
            recipients: vec![Recipient {
                address: "bc1q".into(),
                amount: "250000".into(),
            }],
            created_time: Some(Utc::now() - chrono::Duration::hours(hours_ago)),
            ..Default::default()
        }
    }

    #[test]
    fn test_stale_cold_transfer() {
        let canonicalizer = StatusCanonicalizer::default();
        let now = Utc::now();
        let normalized =
            canonicalizer.normalize_transfer(&cold_transfer(80, "pendingApproval"), "cold", now);

        assert_eq!(normalized.wallet_class, WalletClass::Cold);
        assert_eq!(normalized.status, CanonicalStatus::WaitingApproval);
        assert_eq!(normalized.sla.max_wait_time.as_secs(), 72 * 3600);
        assert!(normalized.is_stale);
        assert_ne!(normalized.risk, RiskLevel::Low);
    }

    #[test]
    fn test_terminal_transfer_is_never_stale() {
        let canonicalizer = StatusCanonicalizer::default();
        let normalized =
            canonicalizer.normalize_transfer(&cold_transfer(500, "confirmed"), "cold", Utc::now());
        assert!(!normalized.is_stale);
        assert_eq!(normalized.status_description, "Transfer confirmed on-chain");
    }

    #[test]
    fn test_unknown_state_through_canonicalizer() {
        let canonicalizer = StatusCanonicalizer::default();
        let normalized =
            canonicalizer.normalize_transfer(&cold_transfer(1, "teleporting"), "warm", Utc::now());
        assert_eq!(normalized.status, CanonicalStatus::Unknown);
    }

    #[test]
    fn test_normalize_transfer_is_pure() {
        let canonicalizer = StatusCanonicalizer::default();
        let transfer = cold_transfer(10, "unconfirmed");
        let now = Utc::now();
        let a = canonicalizer.normalize_transfer(&transfer, "hot", now);
        let b = canonicalizer.normalize_transfer(&transfer, "hot", now);
        assert_eq!(a, b);
    }

    #[test]
    fn test_approval_summary() {
        let canonicalizer = StatusCanonicalizer::default();
        let sla = canonicalizer.get_sla(WalletClass::Cold, RiskLevel::Medium);
        let now = Utc::now();
        let requested = now - chrono::Duration::hours(20);

        let summary = canonicalizer.approval_summary(1, 2, &sla, requested, now);
        assert_eq!(summary.outstanding(), 1);
        assert_eq!(summary.seconds_remaining, Some(4 * 3600));

        let late = canonicalizer.approval_summary(5, 2, &sla, now - chrono::Duration::hours(30), now);
        assert_eq!(late.received, 2);
        assert_eq!(late.seconds_remaining, Some(0));
    }

    #[test]
    fn test_approval_summary_without_window() {
        let canonicalizer = StatusCanonicalizer::default();
        let sla = canonicalizer.get_sla(WalletClass::Warm, RiskLevel::Low);
        let summary = canonicalizer.approval_summary(0, 1, &sla, Utc::now(), Utc::now());
        assert_eq!(summary.expires_at, None);
        assert_eq!(summary.seconds_remaining, None);
    }
}

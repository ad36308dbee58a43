//! Custodian state → canonical status mapping.
//!
//! Pure functions only: no I/O, no shared state.

use super::status::CanonicalStatus;
use crate::custodian::CustodianTransfer;

/// Lowercase and drop separators so `pendingApproval`, `pending_approval`
/// and `PENDING-APPROVAL` compare equal.
fn fold(state: &str) -> String {
    state
        .chars()
        .filter(|c| !matches!(c, '_' | '-' | ' '))
        .flat_map(char::to_lowercase)
        .collect()
}

/// Vocabulary table. Anything missing maps to `unknown`.
fn map_state(folded: &str) -> CanonicalStatus {
    match folded {
        "building" | "initialized" | "initializing" | "created" | "draft" => {
            CanonicalStatus::Building
        }
        "signing" | "pendingsignature" | "halfsigned" | "awaitingsignature" => {
            CanonicalStatus::Signing
        }
        "submitting" | "signed" | "pendingdelivery" | "delivering" => CanonicalStatus::Submitting,
        "waitingapproval" | "pendingapproval" | "awaitingapproval" | "approvalpending" => {
            CanonicalStatus::WaitingApproval
        }
        "broadcast" | "broadcasted" | "unconfirmed" | "sent" => CanonicalStatus::Broadcast,
        "pending" | "confirming" => CanonicalStatus::Pending,
        "confirmed" | "completed" | "complete" | "settled" => CanonicalStatus::Confirmed,
        "failed" | "error" | "invalid" => CanonicalStatus::Failed,
        "rejected" | "denied" | "declined" => CanonicalStatus::Rejected,
        "canceled" | "cancelled" | "removed" | "replaced" | "voided" => CanonicalStatus::Canceled,
        _ => CanonicalStatus::Unknown,
    }
}

fn has_pending_approval_entry(detail: &CustodianTransfer) -> bool {
    detail.history.iter().any(|entry| {
        let action = fold(&entry.action);
        action.contains("approval") && action.contains("pending")
    })
}

/// Map a custodian state plus transfer detail onto a canonical status.
///
/// Tie-breaks for the custodian's `pending` state:
/// - zero confirmations with a transaction id: it already left the
///   approval stage, so `broadcast`
/// - an `approval…pending` history entry: `waiting_approval`
///
/// Unrecognized states return `unknown`; this never fails.
pub fn normalize(custodian_state: &str, detail: &CustodianTransfer) -> CanonicalStatus {
    let folded = fold(custodian_state);
    let status = map_state(&folded);

    if folded != "pending" {
        return status;
    }
    if detail.confirmations == 0 && detail.has_txid() {
        return CanonicalStatus::Broadcast;
    }
    if has_pending_approval_entry(detail) {
        return CanonicalStatus::WaitingApproval;
    }
    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::custodian::HistoryEntry;

    fn detail(state: &str) -> CustodianTransfer {
        CustodianTransfer {
            id: "t1".into(),
            state: state.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_vocabulary() {
        let cases = [
            ("initialized", CanonicalStatus::Building),
            ("halfSigned", CanonicalStatus::Signing),
            ("signed", CanonicalStatus::Submitting),
            ("pendingApproval", CanonicalStatus::WaitingApproval),
            ("PENDING_APPROVAL", CanonicalStatus::WaitingApproval),
            ("unconfirmed", CanonicalStatus::Broadcast),
            ("confirmed", CanonicalStatus::Confirmed),
            ("failed", CanonicalStatus::Failed),
            ("rejected", CanonicalStatus::Rejected),
            ("removed", CanonicalStatus::Canceled),
            ("cancelled", CanonicalStatus::Canceled),
            ("waiting_approval", CanonicalStatus::WaitingApproval),
        ];
        for (state, expected) in cases {
            assert_eq!(normalize(state, &detail(state)), expected, "state {}", state);
        }
    }

    #[test]
    fn test_unknown_state_degrades() {
        let d = detail("quantumEntangled");
        assert_eq!(normalize("quantumEntangled", &d), CanonicalStatus::Unknown);
        assert_eq!(normalize("", &d), CanonicalStatus::Unknown);
    }

    #[test]
    fn test_pending_with_txid_is_broadcast() {
        let mut d = detail("pending");
        d.txid = Some("deadbeef".into());
        assert_eq!(normalize("pending", &d), CanonicalStatus::Broadcast);

        d.confirmations = 2;
        assert_eq!(normalize("pending", &d), CanonicalStatus::Pending);

        d.confirmations = 0;
        d.txid = Some("  ".into());
        assert_eq!(normalize("pending", &d), CanonicalStatus::Pending);
    }

    #[test]
    fn test_pending_with_approval_history_is_waiting_approval() {
        let mut d = detail("pending");
        d.history.push(HistoryEntry {
            action: "approvalPending".into(),
            ..Default::default()
        });
        assert_eq!(normalize("pending", &d), CanonicalStatus::WaitingApproval);

        // A broadcast transaction wins over old approval history
        d.txid = Some("deadbeef".into());
        assert_eq!(normalize("pending", &d), CanonicalStatus::Broadcast);
    }

    #[test]
    fn test_normalize_is_deterministic() {
        let mut d = detail("pending");
        d.history.push(HistoryEntry {
            action: "approval_pending".into(),
            ..Default::default()
        });
        let first = normalize(&d.state, &d);
        for _ in 0..10 {
            assert_eq!(normalize(&d.state, &d), first);
        }
    }
}

//! Custodian wire types.
//!
//! Optional fields default so new or missing custodian fields never break
//! decoding.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub address: String,
    /// Base units, decimal string
    pub amount: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildTransferRequest {
    pub recipients: Vec<Recipient>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee_rate: Option<String>,
    /// Client-generated id; doubles as the idempotency key when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeInfo {
    #[serde(default)]
    pub fee: Option<String>,
    #[serde(default)]
    pub fee_rate: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildTransferResult {
    #[serde(default)]
    pub tx_hex: Option<String>,
    #[serde(default)]
    pub tx_info: Value,
    #[serde(default)]
    pub fee_info: Option<FeeInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitTransferRequest {
    /// Half-signed transaction produced by the signing collaborator
    pub tx_hex: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub otp: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitTransferResponse {
    #[serde(default)]
    pub transfer: Option<CustodianTransfer>,
    #[serde(default)]
    pub txid: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    /// Id of the approval request when the submission needs approvals
    #[serde(default)]
    pub pending_approval: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub action: String,
    #[serde(default)]
    pub date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
}

/// Raw transfer as the custodian reports it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustodianTransfer {
    pub id: String,
    #[serde(default)]
    pub coin: String,
    #[serde(default)]
    pub wallet: String,
    #[serde(default)]
    pub txid: Option<String>,
    pub state: String,
    #[serde(default)]
    pub confirmations: u32,
    #[serde(default, alias = "outputs")]
    pub recipients: Vec<Recipient>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default, alias = "date")]
    pub created_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub fee_string: Option<String>,
    #[serde(default)]
    pub pending_approval: Option<String>,
}

impl CustodianTransfer {
    pub fn has_txid(&self) -> bool {
        self.txid.as_deref().is_some_and(|t| !t.trim().is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustodianWallet {
    pub id: String,
    #[serde(default)]
    pub coin: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(rename = "type", default)]
    pub wallet_type: String,
    #[serde(default)]
    pub approvals_required: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingApproval {
    pub id: String,
    #[serde(default)]
    pub wallet_id: Option<String>,
    #[serde(default)]
    pub transfer_id: Option<String>,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub approvals_required: u32,
    #[serde(default)]
    pub approvals_received: u32,
    #[serde(default)]
    pub create_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingApprovalList {
    #[serde(default)]
    pub pending_approvals: Vec<PendingApproval>,
}

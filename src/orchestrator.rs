//! Transfer Orchestrator
//!
//! Entry point for request-handling collaborators. Build and submit always
//! go through the idempotency service; nothing here talks to the custodian
//! around it.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

use crate::canonical::{
    CanonicalStatus, NormalizedTransfer, RiskLevel, SlaProfile, StatusCanonicalizer, WalletClass,
};
use crate::custodian::{
    BuildTransferRequest, BuildTransferResult, CustodianApi, CustodianTransfer, Recipient,
    SubmitTransferRequest, SubmitTransferResponse,
};
use crate::error::OrchestratorError;
use crate::idempotency::{IdempotencyKey, IdempotencyService};

pub const BUILD_OPERATION: &str = "build_transfer";
pub const SUBMIT_OPERATION: &str = "submit_transfer";

/// Risk, approvals and SLA for a prospective transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildAssessment {
    pub wallet_class: WalletClass,
    pub risk: RiskLevel,
    pub required_approvals: u32,
    pub sla: SlaProfile,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildOutcome {
    pub wallet_id: String,
    pub coin: String,
    pub result: BuildTransferResult,
    pub assessment: BuildAssessment,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitOutcome {
    pub wallet_id: String,
    pub coin: String,
    pub custodian_transfer_id: Option<String>,
    pub txid: Option<String>,
    pub status: CanonicalStatus,
    pub status_description: String,
    pub pending_approval: Option<String>,
}

#[derive(Clone)]
pub struct TransferOrchestrator {
    custodian: Arc<dyn CustodianApi>,
    idempotency: IdempotencyService,
    canonicalizer: StatusCanonicalizer,
}

impl TransferOrchestrator {
    pub fn new(
        custodian: Arc<dyn CustodianApi>,
        idempotency: IdempotencyService,
        canonicalizer: StatusCanonicalizer,
    ) -> Self {
        Self {
            custodian,
            idempotency,
            canonicalizer,
        }
    }

    pub fn canonicalizer(&self) -> &StatusCanonicalizer {
        &self.canonicalizer
    }

    pub fn idempotency(&self) -> &IdempotencyService {
        &self.idempotency
    }

    /// Build a transaction at most once per request.
    ///
    /// A `sequence_id` on the request is used as the idempotency key;
    /// otherwise the key is derived from wallet, coin and request body.
    pub async fn build_transfer_idempotent(
        &self,
        wallet_id: &str,
        coin: &str,
        request: &BuildTransferRequest,
    ) -> Result<BuildOutcome, OrchestratorError> {
        validate_recipients(&request.recipients)?;

        let envelope = json!({ "wallet_id": wallet_id, "coin": coin, "request": request });
        let key = match &request.sequence_id {
            Some(seq) => IdempotencyKey::from_client(BUILD_OPERATION, &scope(coin, wallet_id), seq),
            None => IdempotencyKey::derive(BUILD_OPERATION, &envelope)?,
        };

        self.idempotency
            .execute_idempotent(&key, BUILD_OPERATION, &envelope, || async {
                let wallet = self.custodian.get_wallet(coin, wallet_id).await?;
                let result = self.custodian.build_transfer(coin, wallet_id, request).await?;
                let assessment = self.assess_build(coin, &wallet.wallet_type, &request.recipients);
                info!(
                    wallet_id,
                    coin,
                    risk = %assessment.risk,
                    wallet_class = %assessment.wallet_class,
                    required_approvals = assessment.required_approvals,
                    "Transfer built"
                );
                Ok::<_, OrchestratorError>(BuildOutcome {
                    wallet_id: wallet_id.to_string(),
                    coin: coin.to_string(),
                    result,
                    assessment,
                })
            })
            .await
    }

    /// Submit a half-signed transaction at most once.
    ///
    /// The OTP is not part of the derived key: a retry carrying a fresh OTP
    /// is still the same submission.
    pub async fn submit_transfer_idempotent(
        &self,
        wallet_id: &str,
        coin: &str,
        request: &SubmitTransferRequest,
    ) -> Result<SubmitOutcome, OrchestratorError> {
        if request.tx_hex.trim().is_empty() {
            return Err(OrchestratorError::InvalidRequest("tx_hex is empty".into()));
        }

        let identity = json!({
            "wallet_id": wallet_id,
            "coin": coin,
            "tx_hex": request.tx_hex,
            "sequence_id": request.sequence_id,
            "comment": request.comment,
        });
        let key = match &request.sequence_id {
            Some(seq) => IdempotencyKey::from_client(SUBMIT_OPERATION, &scope(coin, wallet_id), seq),
            None => IdempotencyKey::derive(SUBMIT_OPERATION, &identity)?,
        };
        let snapshot = json!({ "wallet_id": wallet_id, "coin": coin, "request": request });

        self.idempotency
            .execute_idempotent(&key, SUBMIT_OPERATION, &snapshot, || async {
                let response = self.custodian.submit_transfer(coin, wallet_id, request).await?;
                let outcome = self.submit_outcome(wallet_id, coin, response);
                info!(
                    wallet_id,
                    coin,
                    custodian_transfer_id = outcome.custodian_transfer_id.as_deref().unwrap_or("-"),
                    status = %outcome.status,
                    "Transfer submitted"
                );
                Ok::<_, OrchestratorError>(outcome)
            })
            .await
    }

    pub fn get_canonical_status(&self, transfer: &CustodianTransfer) -> CanonicalStatus {
        self.canonicalizer.normalize(&transfer.state, transfer)
    }

    pub fn normalize_transfer(
        &self,
        transfer: &CustodianTransfer,
        wallet_type: &str,
    ) -> NormalizedTransfer {
        self.canonicalizer
            .normalize_transfer(transfer, wallet_type, chrono::Utc::now())
    }

    pub fn assess_build(
        &self,
        coin: &str,
        wallet_type: &str,
        recipients: &[Recipient],
    ) -> BuildAssessment {
        let wallet_class = WalletClass::from_wallet_type(wallet_type);
        let risk = self.canonicalizer.assess_risk(coin, recipients, wallet_class);
        BuildAssessment {
            wallet_class,
            risk,
            required_approvals: self.canonicalizer.required_approvals(risk, wallet_class),
            sla: self.canonicalizer.get_sla(wallet_class, risk),
        }
    }

    fn submit_outcome(
        &self,
        wallet_id: &str,
        coin: &str,
        response: SubmitTransferResponse,
    ) -> SubmitOutcome {
        let detail = response.transfer.unwrap_or_else(|| CustodianTransfer {
            state: response.status.clone().unwrap_or_default(),
            txid: response.txid.clone(),
            pending_approval: response.pending_approval.clone(),
            ..Default::default()
        });

        let mut status = if detail.state.trim().is_empty() {
            CanonicalStatus::Submitting
        } else {
            self.canonicalizer.normalize(&detail.state, &detail)
        };
        if status == CanonicalStatus::Unknown && response.pending_approval.is_some() {
            status = CanonicalStatus::WaitingApproval;
        }

        SubmitOutcome {
            wallet_id: wallet_id.to_string(),
            coin: coin.to_string(),
            custodian_transfer_id: (!detail.id.is_empty()).then(|| detail.id.clone()),
            txid: response.txid.or(detail.txid),
            status,
            status_description: status.description().to_string(),
            pending_approval: response.pending_approval.or(detail.pending_approval),
        }
    }
}

fn scope(coin: &str, wallet_id: &str) -> String {
    format!("{}/{}", coin, wallet_id)
}

fn validate_recipients(recipients: &[Recipient]) -> Result<(), OrchestratorError> {
    if recipients.is_empty() {
        return Err(OrchestratorError::InvalidRequest(
            "at least one recipient is required".into(),
        ));
    }
    for r in recipients {
        if r.address.trim().is_empty() {
            return Err(OrchestratorError::InvalidRequest(
                "recipient address is empty".into(),
            ));
        }
        match Decimal::from_str(r.amount.trim()) {
            Ok(amount) if amount > Decimal::ZERO => {}
            _ => {
                return Err(OrchestratorError::InvalidRequest(format!(
                    "invalid amount {:?} for {}",
                    r.amount, r.address
                )));
            }
        }
    }
    Ok(())
}

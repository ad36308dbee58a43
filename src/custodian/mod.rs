//! Custodian API
//!
//! The only way the core talks to the custodian. Everything goes through
//! the [`RemoteClient`], so every call inherits its timeout, retry policy,
//! correlation ids and redaction.

pub mod types;

pub use types::{
    BuildTransferRequest, BuildTransferResult, CustodianTransfer, CustodianWallet, FeeInfo,
    HistoryEntry, PendingApproval, PendingApprovalList, Recipient, SubmitTransferRequest,
    SubmitTransferResponse,
};

use async_trait::async_trait;

use crate::client::{ClientError, RemoteClient};

#[async_trait]
pub trait CustodianApi: Send + Sync {
    /// Build (but do not sign) a transaction
    async fn build_transfer(
        &self,
        coin: &str,
        wallet_id: &str,
        request: &BuildTransferRequest,
    ) -> Result<BuildTransferResult, ClientError>;

    /// Submit a half-signed transaction. Moves money: callers must go
    /// through the idempotency service.
    async fn submit_transfer(
        &self,
        coin: &str,
        wallet_id: &str,
        request: &SubmitTransferRequest,
    ) -> Result<SubmitTransferResponse, ClientError>;

    async fn get_transfer(
        &self,
        coin: &str,
        wallet_id: &str,
        transfer_id: &str,
    ) -> Result<CustodianTransfer, ClientError>;

    async fn get_wallet(&self, coin: &str, wallet_id: &str)
    -> Result<CustodianWallet, ClientError>;

    async fn list_pending_approvals(
        &self,
        wallet_id: &str,
    ) -> Result<Vec<PendingApproval>, ClientError>;
}

/// Custodian API over HTTP
#[derive(Debug, Clone)]
pub struct HttpCustodian {
    client: RemoteClient,
}

impl HttpCustodian {
    pub fn new(client: RemoteClient) -> Self {
        Self { client }
    }
}

/// Reject identifiers that would change the shape of the request path.
fn segment(id: &str) -> Result<&str, ClientError> {
    if id.is_empty()
        || id
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '/' | '?' | '#' | '%' | '&'))
    {
        return Err(ClientError::InvalidRequest(format!(
            "Invalid path identifier: {:?}",
            id
        )));
    }
    Ok(id)
}

#[async_trait]
impl CustodianApi for HttpCustodian {
    async fn build_transfer(
        &self,
        coin: &str,
        wallet_id: &str,
        request: &BuildTransferRequest,
    ) -> Result<BuildTransferResult, ClientError> {
        let path = format!(
            "/api/v2/{}/wallet/{}/tx/build",
            segment(coin)?,
            segment(wallet_id)?
        );
        self.client.post_json(&path, request).await
    }

    async fn submit_transfer(
        &self,
        coin: &str,
        wallet_id: &str,
        request: &SubmitTransferRequest,
    ) -> Result<SubmitTransferResponse, ClientError> {
        let path = format!(
            "/api/v2/{}/wallet/{}/tx/send",
            segment(coin)?,
            segment(wallet_id)?
        );
        self.client.post_json(&path, request).await
    }

    async fn get_transfer(
        &self,
        coin: &str,
        wallet_id: &str,
        transfer_id: &str,
    ) -> Result<CustodianTransfer, ClientError> {
        let path = format!(
            "/api/v2/{}/wallet/{}/transfer/{}",
            segment(coin)?,
            segment(wallet_id)?,
            segment(transfer_id)?
        );
        self.client.get_json(&path).await
    }

    async fn get_wallet(
        &self,
        coin: &str,
        wallet_id: &str,
    ) -> Result<CustodianWallet, ClientError> {
        let path = format!("/api/v2/{}/wallet/{}", segment(coin)?, segment(wallet_id)?);
        self.client.get_json(&path).await
    }

    async fn list_pending_approvals(
        &self,
        wallet_id: &str,
    ) -> Result<Vec<PendingApproval>, ClientError> {
        let path = format!("/api/v2/pendingapprovals?walletId={}", segment(wallet_id)?);
        let list: PendingApprovalList = self.client.get_json(&path).await?;
        Ok(list.pending_approvals)
    }
}

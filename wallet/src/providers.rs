// Contracts consumed from external collaborators. The wallet core never
// implements these beyond test doubles; it only honors their semantics.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sphere_common::{
    api::{
        txf::TxfArchive, Commitment, IncomingPaymentRequest, IncomingTokenTransfer,
        PaymentRequestEnvelope, PaymentRequestResponse, PeerInfo,
    },
    crypto::PublicKey,
    token::TokenBlob,
};
use std::sync::Arc;
use tokio::sync::broadcast;

// Aggregator answer to a commitment submission
// A duplicate request id is an accepted status: submissions are
// idempotent and re-submission on receive is expected
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubmitStatus {
    Success,
    RequestIdExists,
    Other(String),
}

impl SubmitStatus {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Success | Self::RequestIdExists)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResult {
    pub status: SubmitStatus,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TokenValidity {
    pub valid: bool,
    pub spent: bool,
}

// Cryptographic state transitions: commitment submission and token
// finalization. Construction of the underlying proofs is not wallet
// business.
#[async_trait]
pub trait StateTransitionClient: Send + Sync {
    async fn submit_mint_commitment(&self, commitment: &Commitment) -> Result<SubmitResult>;

    async fn submit_transfer_commitment(&self, commitment: &Commitment) -> Result<SubmitResult>;

    // Combine a source token, a transfer transaction and the recipient
    // state (plus nametag witnesses for proxy addresses) into a new
    // token owned by the recipient
    async fn finalize(
        &self,
        trust_base: &Value,
        source_token: &TokenBlob,
        recipient_state: &Value,
        transfer_tx: &Value,
        nametag_witnesses: &[TokenBlob],
    ) -> Result<TokenBlob>;
}

// Aggregator network access: validity, spent status and inclusion proofs
#[async_trait]
pub trait OracleProvider: Send + Sync {
    async fn validate_token(&self, token: &TokenBlob) -> Result<TokenValidity>;

    // Block until the aggregator anchors the commitment
    async fn wait_for_proof(&self, commitment: &Commitment) -> Result<Value>;

    // Non-blocking single lookup by request id
    async fn get_proof(&self, request_id: &str) -> Result<Option<Value>>;

    fn state_transition_client(&self) -> Arc<dyn StateTransitionClient>;

    fn trust_base(&self) -> Option<Value>;
}

// Peer-to-peer message bus carrying token payloads and payment requests
#[async_trait]
pub trait TransportProvider: Send + Sync {
    // Resolve a recipient string to peer info (transport public key,
    // optional direct address, optional nametag)
    async fn resolve(&self, recipient: &str) -> Result<Option<PeerInfo>>;

    // Fire-and-forget token envelope
    async fn send_token_transfer(&self, to: &PublicKey, payload: &Value) -> Result<()>;

    async fn on_token_transfer(&self) -> broadcast::Receiver<IncomingTokenTransfer>;

    async fn send_payment_request(
        &self,
        to: &PublicKey,
        request: &PaymentRequestEnvelope,
    ) -> Result<()>;

    async fn send_payment_request_response(
        &self,
        to: &PublicKey,
        response: &PaymentRequestResponse,
    ) -> Result<()>;

    async fn on_payment_request(&self) -> broadcast::Receiver<IncomingPaymentRequest>;

    async fn on_payment_request_response(&self) -> broadcast::Receiver<PaymentRequestResponse>;

    // Batch receive of envelopes queued while the wallet was offline
    async fn fetch_pending_events(&self) -> Result<Vec<IncomingTokenTransfer>>;
}

// Raw string key-value storage
#[async_trait]
pub trait StorageProvider: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    async fn remove(&self, key: &str) -> Result<()>;

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

// Outcome of one provider's sync pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSyncResult {
    pub success: bool,
    // Merge arbitration happens upstream in the provider; a returned
    // archive replaces the local portable state
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merged: Option<TxfArchive>,
    pub added: u32,
    pub removed: u32,
    pub conflicts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteUpdateEvent {
    pub provider: String,
}

// Object storage holding whole portable archives
#[async_trait]
pub trait TokenStorageProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn save(&self, archive: &TxfArchive) -> Result<()>;

    async fn load(&self) -> Result<Option<TxfArchive>>;

    async fn sync(&self, local: &TxfArchive) -> Result<ProviderSyncResult>;

    // Providers that can observe remote mutations push update events;
    // the default is a provider without change notification
    async fn subscribe_events(&self) -> Option<broadcast::Receiver<RemoteUpdateEvent>> {
        None
    }
}

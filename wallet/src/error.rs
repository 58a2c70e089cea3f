use primitive_types::U256;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("wallet has been destroyed")]
    Destroyed,
    #[error("trust base is not available from the oracle")]
    TrustBaseMissing,
    #[error("insufficient funds: need {need}, have {have}")]
    InsufficientFunds { need: U256, have: U256 },
    #[error("commitment rejected by aggregator: {0}")]
    SubmissionRejected(String),
    #[error("cannot resolve recipient '{0}'")]
    RecipientNotFound(String),
    #[error("recipient has no direct address")]
    NoDirectAddress,
    #[error("no nametag matches proxy address {0}")]
    NametagMissing(String),
    #[error("nametag '{0}' is already registered in this wallet")]
    NametagTaken(String),
    #[error("incoming token rejected: {0}")]
    TokenRejected(String),
    #[error("token {0} not found")]
    TokenNotFound(String),
    #[error("payment request timed out")]
    PaymentRequestTimeout,
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("sync failed: {0}")]
    Sync(String),
    #[error(transparent)]
    Any(#[from] anyhow::Error),
}

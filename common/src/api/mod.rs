pub mod txf;

use crate::{
    crypto::{hash, Hash, PublicKey},
    time::TimestampMillis,
    utils::serde_amount,
};
use primitive_types::U256;
use serde::de::Error as SerdeError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{
    fmt::{Display, Error, Formatter},
    str::FromStr,
};

pub const DIRECT_ADDRESS_PREFIX: &str = "DIRECT://";
pub const PROXY_ADDRESS_PREFIX: &str = "PROXY://";

// On-chain targeting address for a transfer
// A direct address is bound to a specific public key; a proxy address
// resolves to its current owner through a nametag
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Direct(Hash),
    Proxy(Hash),
}

impl Address {
    pub fn direct_from_pubkey(pubkey: &PublicKey) -> Self {
        Self::Direct(hash(pubkey.as_bytes()))
    }

    // Proxy addresses derive from the normalized nametag name, so any
    // holder of the nametag token can claim transfers sent to it
    pub fn proxy_from_nametag(name: &str) -> Self {
        let normalized = name.trim().trim_start_matches('@').to_lowercase();
        Self::Proxy(hash(format!("nametag:{}", normalized).as_bytes()))
    }

    pub fn is_proxy(&self) -> bool {
        matches!(self, Self::Proxy(_))
    }

    pub fn digest(&self) -> &Hash {
        match self {
            Self::Direct(digest) | Self::Proxy(digest) => digest,
        }
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        match self {
            Self::Direct(digest) => write!(f, "{}{}", DIRECT_ADDRESS_PREFIX, digest),
            Self::Proxy(digest) => write!(f, "{}{}", PROXY_ADDRESS_PREFIX, digest),
        }
    }
}

impl FromStr for Address {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix(DIRECT_ADDRESS_PREFIX) {
            return Ok(Self::Direct(Hash::from_str(rest)?));
        }
        if let Some(rest) = s.strip_prefix(PROXY_ADDRESS_PREFIX) {
            return Ok(Self::Proxy(Hash::from_str(rest)?));
        }
        Err("Missing address prefix")
    }
}

impl Serialize for Address {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'a> Deserialize<'a> for Address {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'a>,
    {
        let raw = String::deserialize(deserializer)?;
        Address::from_str(&raw).map_err(SerdeError::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitmentKind {
    Mint,
    Transfer,
    Burn,
}

// A cryptographically bound intent to transition a token
// Becomes a transaction once an inclusion proof is attached
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commitment {
    pub kind: CommitmentKind,
    // Genesis token id of the source (or the id being minted)
    pub token_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_state_hash: Option<String>,
    pub recipient: Address,
    pub salt_hex: String,
    // Aggregator lookup key, derived from the other fields
    pub request_id: String,
}

impl Commitment {
    pub fn new(
        kind: CommitmentKind,
        token_id: impl Into<String>,
        source_state_hash: Option<String>,
        recipient: Address,
        salt_hex: impl Into<String>,
    ) -> Self {
        let token_id = token_id.into();
        let salt_hex = salt_hex.into();
        let request_id = Self::derive_request_id(
            kind,
            &token_id,
            source_state_hash.as_deref(),
            &recipient,
            &salt_hex,
        );
        Self {
            kind,
            token_id,
            source_state_hash,
            recipient,
            salt_hex,
            request_id,
        }
    }

    fn derive_request_id(
        kind: CommitmentKind,
        token_id: &str,
        source_state_hash: Option<&str>,
        recipient: &Address,
        salt_hex: &str,
    ) -> String {
        let tag = match kind {
            CommitmentKind::Mint => "mint",
            CommitmentKind::Transfer => "transfer",
            CommitmentKind::Burn => "burn",
        };
        let preimage = format!(
            "{}|{}|{}|{}|{}",
            tag,
            token_id,
            source_state_hash.unwrap_or(""),
            recipient,
            salt_hex
        );
        hash(preimage.as_bytes()).to_hex()
    }
}

// A commitment combined with its inclusion proof
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferTransaction {
    pub commitment: Commitment,
    #[serde(rename = "inclusionProof")]
    pub inclusion_proof: Value,
}

// The predicate locking a received token to the recipient's signing key,
// masked with the transfer salt
pub fn recipient_predicate(pubkey: &PublicKey, salt_hex: &str) -> Value {
    json!({
        "type": "MASKED",
        "pubkey": pubkey.to_hex(),
        "nonce": salt_hex,
    })
}

// The state object a predicate produces, content-addressed by its hash
pub fn predicate_state(predicate: &Value) -> Value {
    let serialized = predicate.to_string();
    json!({
        "hash": hash(serialized.as_bytes()).to_hex(),
        "unlockPredicate": predicate,
    })
}

// Token transfer envelope dispatched over the transport bus
// Commitment-only transfers carry commitment_data; fully-proven transfers
// carry transfer_tx
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferEnvelope {
    pub source_token: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commitment_data: Option<Commitment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_tx: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
}

pub const SPLIT_BUNDLE_TYPE: &str = "INSTANT_SPLIT";
pub const SPLIT_BUNDLE_VERSION_V4: u8 = 4;
pub const SPLIT_BUNDLE_VERSION_V5: u8 = 5;

// Instant-split bundle, version 5
// Sent to the recipient once the sender's burn proof exists; the
// recipient drives mint and transfer finalization itself
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitBundleV5 {
    #[serde(rename = "type")]
    pub bundle_type: String,
    pub version: u8,
    pub split_group_id: String,
    pub coin_id: String,
    #[serde(with = "serde_amount")]
    pub amount: U256,
    pub recipient_mint_data: Value,
    pub mint_commitment: Commitment,
    pub transfer_commitment: Commitment,
    pub transfer_salt_hex: String,
    pub minted_token_state: Value,
    pub token_type_hex: String,
    pub recipient_address: Address,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nametag_token: Option<Value>,
}

// Instant-split bundle, version 4: carries a fully finalized recipient
// token and is processed synchronously on receive
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitBundleV4 {
    #[serde(rename = "type")]
    pub bundle_type: String,
    pub version: u8,
    pub split_group_id: String,
    pub coin_id: String,
    #[serde(with = "serde_amount")]
    pub amount: U256,
    pub recipient_token: Value,
    pub transfer_tx: Value,
}

// A token transfer as delivered by the transport subscription
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingTokenTransfer {
    pub sender: PublicKey,
    pub payload: Value,
    pub received_at: TimestampMillis,
}

// Peer info returned by transport resolution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    pub pubkey: PublicKey,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direct_address: Option<Address>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nametag: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentRequestStatus {
    Accepted,
    Rejected,
    Paid,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRequestEnvelope {
    pub request_id: String,
    pub coin_id: String,
    #[serde(with = "serde_amount")]
    pub amount: U256,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
    pub requester_pubkey: PublicKey,
    pub created_at: TimestampMillis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRequestResponse {
    pub request_id: String,
    pub status: PaymentRequestStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingPaymentRequest {
    pub sender: PublicKey,
    pub request: PaymentRequestEnvelope,
}

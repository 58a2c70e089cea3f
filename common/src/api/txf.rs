// TXF — the portable archive format exchanged with token storage
// providers. Everything in here must survive a JSON round-trip through
// storage backends that know nothing about the wallet internals.

use crate::{
    api::Address,
    time::TimestampMillis,
    token::{Token, TokenBlob, TokenPayload, TokenStatus},
    utils::serde_amount,
};
use indexmap::IndexMap;
use primitive_types::U256;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const TXF_FORMAT_VERSION: u32 = 2;

// Proof that a (genesis id, state hash) pair has been spent and must not
// be restored as an active token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TombstoneEntry {
    pub token_id: String,
    pub state_hash: String,
    pub timestamp_ms: TimestampMillis,
}

impl TombstoneEntry {
    pub fn new(token_id: String, state_hash: String, timestamp_ms: TimestampMillis) -> Self {
        Self {
            token_id,
            state_hash,
            timestamp_ms,
        }
    }

    pub fn matches(&self, token_id: &str, state_hash: &str) -> bool {
        self.token_id == token_id && self.state_hash == state_hash
    }

    // Dedup identity for union merges
    pub fn dedup_key(&self) -> (String, String) {
        (self.token_id.clone(), self.state_hash.clone())
    }
}

// Full transaction history of a token, keyed by genesis id
// Kept for recovery and for merge arbitration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedToken {
    pub token_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_hash: Option<String>,
    pub token: TokenBlob,
    pub archived_at: TimestampMillis,
}

impl ArchivedToken {
    // The committed transitions plus a possibly uncommitted tail
    pub fn history(&self) -> Vec<Value> {
        self.token
            .as_value()
            .and_then(|doc| {
                doc.get("transactions")
                    .and_then(|t| t.as_array())
                    .map(|t| t.to_vec())
            })
            .unwrap_or_default()
    }
}

// An alternative history whose divergence point is in a committed
// transition, not reconcilable as an incremental update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForkedToken {
    pub token_id: String,
    pub state_hash: String,
    pub token: TokenBlob,
    pub forked_at: TimestampMillis,
}

impl ForkedToken {
    pub fn fork_key(&self) -> String {
        fork_key(&self.token_id, &self.state_hash)
    }
}

pub fn fork_key(token_id: &str, state_hash: &str) -> String {
    format!("{}_{}", token_id, state_hash)
}

// A minted identity token binding a human-readable name to this wallet,
// used to resolve proxy addresses during finalization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NametagToken {
    pub name: String,
    pub token: TokenBlob,
    pub minted_at: TimestampMillis,
}

impl NametagToken {
    pub fn proxy_address(&self) -> Address {
        Address::proxy_from_nametag(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxfMeta {
    // Monotone counter bumped on every save, used by providers for
    // last-writer arbitration
    pub version: u64,
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipns_name: Option<String>,
    pub format_version: u32,
    pub updated_at: TimestampMillis,
}

// A live token flattened into its portable record
// Pending-finalization tokens have no representation here and live in a
// dedicated persistence slot instead
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxfToken {
    pub local_id: String,
    pub coin_id: String,
    pub symbol: String,
    pub name: String,
    pub decimals: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,
    #[serde(with = "serde_amount")]
    pub amount: U256,
    pub status: TokenStatus,
    pub created_at: TimestampMillis,
    pub updated_at: TimestampMillis,
    pub token: TokenBlob,
}

impl TxfToken {
    pub fn from_token(token: &Token) -> Option<Self> {
        let blob = token.payload.blob()?;
        Some(Self {
            local_id: token.local_id.clone(),
            coin_id: token.coin_id.clone(),
            symbol: token.symbol.clone(),
            name: token.name.clone(),
            decimals: token.decimals,
            icon_url: token.icon_url.clone(),
            amount: token.amount,
            status: token.status,
            created_at: token.created_at,
            updated_at: token.updated_at,
            token: blob.clone(),
        })
    }

    pub fn into_token(self) -> Token {
        Token {
            local_id: self.local_id,
            coin_id: self.coin_id,
            symbol: self.symbol,
            name: self.name,
            decimals: self.decimals,
            icon_url: self.icon_url,
            amount: self.amount,
            status: self.status,
            created_at: self.created_at,
            updated_at: self.updated_at,
            payload: TokenPayload::Finalized(self.token),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxfArchive {
    #[serde(rename = "_meta")]
    pub meta: TxfMeta,
    pub tokens: Vec<TxfToken>,
    #[serde(rename = "_tombstones", default)]
    pub tombstones: Vec<TombstoneEntry>,
    #[serde(rename = "_archived", default)]
    pub archived: IndexMap<String, ArchivedToken>,
    #[serde(rename = "_forked", default)]
    pub forked: IndexMap<String, ForkedToken>,
    #[serde(rename = "_nametags", default)]
    pub nametags: IndexMap<String, NametagToken>,
}

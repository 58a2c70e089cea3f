mod registry;

pub use registry::{register_coin, registry_metadata, CoinMetadata};

use crate::{
    api::SplitBundleV5,
    config::COIN_ID_PREFIX_LEN,
    crypto::PublicKey,
    time::TimestampMillis,
    utils::serde_amount,
};
use log::trace;
use primitive_types::U256;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;

// An opaque SDK token payload
// The SDK emits both raw JSON documents and their string serialization,
// so extraction must accept either arm
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TokenBlob {
    Structured(Value),
    Text(String),
}

impl TokenBlob {
    // View the blob as a JSON document, parsing the textual arm on demand
    // Parse failures are a typed absence, never an error
    pub fn as_value(&self) -> Option<Cow<'_, Value>> {
        match self {
            Self::Structured(value) => Some(Cow::Borrowed(value)),
            Self::Text(raw) => match serde_json::from_str(raw) {
                Ok(value) => Some(Cow::Owned(value)),
                Err(e) => {
                    trace!("token blob is not valid json: {}", e);
                    None
                }
            },
        }
    }

    pub fn into_value(self) -> Option<Value> {
        match self {
            Self::Structured(value) => Some(value),
            Self::Text(raw) => serde_json::from_str(&raw).ok(),
        }
    }
}

impl From<Value> for TokenBlob {
    fn from(value: Value) -> Self {
        Self::Structured(value)
    }
}

// Some senders wrap the whole token document under a "token" key
fn unwrap_document(value: &Value) -> &Value {
    match value.get("token") {
        Some(inner) if inner.is_object() => inner,
        _ => value,
    }
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    value
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_owned())
}

// Pull the genesis token id out of a blob
// Stable across all states of the token
pub fn extract_genesis_id(blob: &TokenBlob) -> Option<String> {
    let value = blob.as_value()?;
    let doc = unwrap_document(&value);

    non_empty_str(doc.pointer("/genesis/tokenId"))
        .or_else(|| non_empty_str(doc.get("tokenId")))
}

// Pull the current state hash out of a blob
// Three structural layouts exist in the wild: the primary location, the
// same document nested under a "token" key, and a flat top-level field.
// The first non-empty match wins.
pub fn extract_state_hash(blob: &TokenBlob) -> Option<String> {
    let value = blob.as_value()?;
    let doc = &*value;

    non_empty_str(doc.pointer("/state/hash"))
        .or_else(|| non_empty_str(doc.pointer("/token/state/hash")))
        .or_else(|| non_empty_str(doc.get("stateHash")))
}

// Display and accounting data extracted from a token blob
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenInfo {
    pub coin_id: String,
    pub symbol: String,
    pub name: String,
    pub decimals: u8,
    pub icon_url: Option<String>,
    #[serde(with = "serde_amount")]
    pub amount: U256,
    pub token_id: Option<String>,
}

// Structured SDK layouts tried before falling back to manual extraction

#[derive(Deserialize)]
struct SdkDocument {
    genesis: SdkGenesis,
}

#[derive(Deserialize)]
struct SdkGenesis {
    #[serde(rename = "tokenId")]
    token_id: Option<String>,
    data: SdkGenesisData,
}

#[derive(Deserialize)]
struct SdkGenesisData {
    coins: CoinEntries,
}

// Coin data appears as an array of pairs [[coinId, amount]] or as a
// mapping {coinId: amount}; both forms must be handled
#[derive(Deserialize)]
#[serde(untagged)]
enum CoinEntries {
    Pairs(Vec<(String, AmountField)>),
    Map(indexmap::IndexMap<String, AmountField>),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AmountField {
    Text(String),
    Number(u64),
}

impl AmountField {
    fn to_amount(&self) -> Option<U256> {
        match self {
            Self::Text(s) => U256::from_dec_str(s).ok(),
            Self::Number(n) => Some(U256::from(*n)),
        }
    }
}

impl CoinEntries {
    fn first(&self) -> Option<(String, U256)> {
        match self {
            Self::Pairs(pairs) => pairs
                .first()
                .and_then(|(id, amount)| Some((id.clone(), amount.to_amount()?))),
            Self::Map(map) => map
                .first()
                .and_then(|(id, amount)| Some((id.clone(), amount.to_amount()?))),
        }
    }
}

fn first_coin_of(value: &Value) -> Option<(String, U256)> {
    let entries: CoinEntries = serde_json::from_value(value.clone()).ok()?;
    entries.first()
}

// Parse display and accounting data out of an opaque token blob
// A structured SDK parse is tried first; on failure coin data is pulled
// manually from the genesis section, then the state section, then the
// flat layout. Metadata is enriched from the global coin registry.
pub fn parse_token_info(blob: &TokenBlob) -> Option<TokenInfo> {
    let value = blob.as_value()?;
    let doc = unwrap_document(&value);

    let (coin_id, amount, token_id) = match serde_json::from_value::<SdkDocument>(doc.clone()) {
        Ok(parsed) => {
            let (coin_id, amount) = parsed.genesis.data.coins.first()?;
            (coin_id, amount, parsed.genesis.token_id)
        }
        Err(e) => {
            trace!("structured token parse failed, trying manual extraction: {}", e);
            manual_coin_extraction(doc)?
        }
    };

    let metadata = registry::metadata_or_fallback(&coin_id);
    Some(TokenInfo {
        coin_id,
        symbol: metadata.symbol,
        name: metadata.name,
        decimals: metadata.decimals,
        icon_url: metadata.icon_url,
        amount,
        token_id: token_id.or_else(|| extract_genesis_id(blob)),
    })
}

fn manual_coin_extraction(doc: &Value) -> Option<(String, U256, Option<String>)> {
    // genesis section first, then the state section
    for section in ["/genesis/data/coins", "/state/data/coins"] {
        if let Some((coin_id, amount)) = doc.pointer(section).and_then(first_coin_of) {
            return Some((coin_id, amount, None));
        }
    }

    // flat layout: {coinId, amount}
    let coin_id = non_empty_str(doc.get("coinId"))?;
    let amount = match doc.get("amount") {
        Some(Value::String(s)) => U256::from_dec_str(s).ok()?,
        Some(Value::Number(n)) => U256::from(n.as_u64()?),
        _ => return None,
    };
    Some((coin_id, amount, None))
}

// Display fallback when a coin is not in the registry: the first eight
// hex chars of the coin id
pub fn fallback_coin_label(coin_id: &str) -> String {
    coin_id.chars().take(COIN_ID_PREFIX_LEN).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenStatus {
    Pending,
    Submitted,
    Transferring,
    Confirmed,
    Spent,
    Invalid,
}

impl TokenStatus {
    // Spent and invalid entries may be displaced by a new state of the
    // same genesis without archiving
    pub fn is_replaceable(self) -> bool {
        matches!(self, Self::Spent | Self::Invalid)
    }
}

// Stage of the lazy finalization pipeline for an unconfirmed V5 token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PendingStage {
    Received,
    MintSubmitted,
    MintProven,
    TransferSubmitted,
}

// An unconfirmed token received as a V5 split bundle, parked in the
// token's payload slot until the aggregator exposes its proofs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingFinalization {
    pub stage: PendingStage,
    pub bundle: SplitBundleV5,
    pub sender_pubkey: PublicKey,
    pub saved_at: TimestampMillis,
    pub attempt_count: u32,
    pub last_attempt_at: TimestampMillis,
    // Present once stage >= MINT_PROVEN
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mint_proof: Option<Value>,
}

// What lives in a token's serialized-blob slot
// Pending tokens cannot be represented in the portable archive format and
// are persisted in a dedicated storage slot instead
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum TokenPayload {
    Finalized(TokenBlob),
    Pending(Box<PendingFinalization>),
}

impl TokenPayload {
    pub fn blob(&self) -> Option<&TokenBlob> {
        match self {
            Self::Finalized(blob) => Some(blob),
            Self::Pending(_) => None,
        }
    }

    pub fn pending(&self) -> Option<&PendingFinalization> {
        match self {
            Self::Pending(pending) => Some(pending),
            Self::Finalized(_) => None,
        }
    }

    pub fn pending_mut(&mut self) -> Option<&mut PendingFinalization> {
        match self {
            Self::Pending(pending) => Some(pending),
            Self::Finalized(_) => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }
}

// One owned state of a token in the wallet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
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
    pub payload: TokenPayload,
}

impl Token {
    // Build a token from a finalized blob, enriching display metadata
    // from the coin registry
    pub fn from_blob(blob: TokenBlob, status: TokenStatus, now: TimestampMillis) -> Option<Self> {
        let info = parse_token_info(&blob)?;
        Some(Self {
            local_id: generate_local_id(),
            coin_id: info.coin_id,
            symbol: info.symbol,
            name: info.name,
            decimals: info.decimals,
            icon_url: info.icon_url,
            amount: info.amount,
            status,
            created_at: now,
            updated_at: now,
            payload: TokenPayload::Finalized(blob),
        })
    }

    pub fn genesis_id(&self) -> Option<String> {
        self.payload.blob().and_then(extract_genesis_id)
    }

    pub fn state_hash(&self) -> Option<String> {
        self.payload.blob().and_then(extract_state_hash)
    }

    // The identity a tombstone binds to, defined only when both parts are
    // extractable
    pub fn key_pair(&self) -> Option<(String, String)> {
        Some((self.genesis_id()?, self.state_hash()?))
    }

    pub fn is_pending_finalization(&self) -> bool {
        self.status == TokenStatus::Submitted && self.payload.is_pending()
    }

    pub fn touch(&mut self, now: TimestampMillis) {
        self.updated_at = now;
    }
}

// Wallet-assigned opaque identifier, stable across state changes
pub fn generate_local_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("tok_{}", hex::encode(bytes))
}

// Deterministic local id for a token received through a V5 split bundle,
// so that transport re-delivery of the same bundle deduplicates
pub fn split_bundle_local_id(split_group_id: &str) -> String {
    format!("recv_{}", split_group_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_COIN_DECIMALS;
    use serde_json::json;

    fn blob(value: Value) -> TokenBlob {
        TokenBlob::Structured(value)
    }

    #[test]
    fn test_extract_genesis_id_layouts() {
        let primary = blob(json!({"genesis": {"tokenId": "aa11"}, "state": {"hash": "bb22"}}));
        assert_eq!(extract_genesis_id(&primary).as_deref(), Some("aa11"));

        let nested = blob(json!({"token": {"genesis": {"tokenId": "cc33"}}}));
        assert_eq!(extract_genesis_id(&nested).as_deref(), Some("cc33"));

        let flat = blob(json!({"tokenId": "dd44", "stateHash": "ee55"}));
        assert_eq!(extract_genesis_id(&flat).as_deref(), Some("dd44"));
    }

    #[test]
    fn test_extract_state_hash_layouts() {
        let primary = blob(json!({"state": {"hash": "aa"}}));
        assert_eq!(extract_state_hash(&primary).as_deref(), Some("aa"));

        let nested = blob(json!({"token": {"state": {"hash": "bb"}}}));
        assert_eq!(extract_state_hash(&nested).as_deref(), Some("bb"));

        let flat = blob(json!({"stateHash": "cc"}));
        assert_eq!(extract_state_hash(&flat).as_deref(), Some("cc"));

        // empty strings never match
        let empty = blob(json!({"state": {"hash": ""}, "stateHash": "dd"}));
        assert_eq!(extract_state_hash(&empty).as_deref(), Some("dd"));
    }

    #[test]
    fn test_extract_from_text_blob() {
        let raw = r#"{"genesis": {"tokenId": "aa"}, "state": {"hash": "bb"}}"#;
        let text = TokenBlob::Text(raw.to_owned());
        assert_eq!(extract_genesis_id(&text).as_deref(), Some("aa"));
        assert_eq!(extract_state_hash(&text).as_deref(), Some("bb"));

        let garbage = TokenBlob::Text("not json".to_owned());
        assert_eq!(extract_genesis_id(&garbage), None);
        assert_eq!(extract_state_hash(&garbage), None);
    }

    #[test]
    fn test_parse_token_info_pairs_form() {
        let b = blob(json!({
            "genesis": {"tokenId": "aa", "data": {"coins": [["c0ffee00", "150"]]}},
            "state": {"hash": "bb"}
        }));
        let info = parse_token_info(&b).unwrap();
        assert_eq!(info.coin_id, "c0ffee00");
        assert_eq!(info.amount, U256::from(150u64));
        assert_eq!(info.token_id.as_deref(), Some("aa"));
        // unknown coin falls back to the first eight hex chars
        assert_eq!(info.symbol, "c0ffee00");
        assert_eq!(info.decimals, DEFAULT_COIN_DECIMALS);
    }

    #[test]
    fn test_parse_token_info_map_form() {
        let b = blob(json!({
            "genesis": {"tokenId": "aa", "data": {"coins": {"deadbeef01": "25"}}},
            "state": {"hash": "bb"}
        }));
        let info = parse_token_info(&b).unwrap();
        assert_eq!(info.coin_id, "deadbeef01");
        assert_eq!(info.amount, U256::from(25u64));
    }

    #[test]
    fn test_parse_token_info_state_section_fallback() {
        let b = blob(json!({
            "genesis": {"tokenId": "aa"},
            "state": {"hash": "bb", "data": {"coins": [["cafe", "7"]]}}
        }));
        let info = parse_token_info(&b).unwrap();
        assert_eq!(info.coin_id, "cafe");
        assert_eq!(info.amount, U256::from(7u64));
    }

    #[test]
    fn test_parse_token_info_flat_fallback() {
        let b = blob(json!({"coinId": "beef", "amount": 12}));
        let info = parse_token_info(&b).unwrap();
        assert_eq!(info.coin_id, "beef");
        assert_eq!(info.amount, U256::from(12u64));
    }

    #[test]
    fn test_parse_token_info_absent() {
        assert!(parse_token_info(&blob(json!({"state": {"hash": "bb"}}))).is_none());
    }

    #[test]
    fn test_token_key_pair() {
        let now = 1_000;
        let token = Token::from_blob(
            blob(json!({
                "genesis": {"tokenId": "aa", "data": {"coins": [["cafe", "5"]]}},
                "state": {"hash": "bb"}
            })),
            TokenStatus::Confirmed,
            now,
        )
        .unwrap();
        assert_eq!(
            token.key_pair(),
            Some(("aa".to_owned(), "bb".to_owned()))
        );
    }
}

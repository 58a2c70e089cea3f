use chrono::DateTime;
use primitive_types::U256;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sphere_common::{
    time::TimestampMillis,
    utils::{format_coin, serde_amount},
};

// User-facing history entry payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryData {
    Sent {
        coin_id: String,
        #[serde(with = "serde_amount")]
        amount: U256,
        #[serde(skip_serializing_if = "Option::is_none")]
        recipient_nametag: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        recipient: Option<String>,
        transfer_id: String,
    },
    Received {
        coin_id: String,
        #[serde(with = "serde_amount")]
        amount: U256,
        #[serde(skip_serializing_if = "Option::is_none")]
        sender: Option<String>,
        // Local token id, or the split-group id for bundle receives
        reference: String,
    },
    Split {
        coin_id: String,
        #[serde(with = "serde_amount")]
        amount: U256,
        token_id: String,
    },
    Mint {
        coin_id: String,
        #[serde(with = "serde_amount")]
        amount: U256,
        reference: String,
    },
}

impl EntryData {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Sent { .. } => "SENT",
            Self::Received { .. } => "RECEIVED",
            Self::Split { .. } => "SPLIT",
            Self::Mint { .. } => "MINT",
        }
    }

    // The identity an upsert deduplicates on
    pub fn reference(&self) -> &str {
        match self {
            Self::Sent { transfer_id, .. } => transfer_id,
            Self::Received { reference, .. } => reference,
            Self::Split { token_id, .. } => token_id,
            Self::Mint { reference, .. } => reference,
        }
    }

    pub fn coin_id(&self) -> &str {
        match self {
            Self::Sent { coin_id, .. }
            | Self::Received { coin_id, .. }
            | Self::Split { coin_id, .. }
            | Self::Mint { coin_id, .. } => coin_id,
        }
    }

    pub fn amount(&self) -> U256 {
        match self {
            Self::Sent { amount, .. }
            | Self::Received { amount, .. }
            | Self::Split { amount, .. }
            | Self::Mint { amount, .. } => *amount,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionEntry {
    // Wallet-assigned entry id
    id: String,
    timestamp: TimestampMillis,
    entry: EntryData,
    // Derived from {type, reference}; entries sharing it upsert
    #[serde(default)]
    dedup_key: Option<String>,
}

impl TransactionEntry {
    pub fn new(entry: EntryData, timestamp: TimestampMillis) -> Self {
        let dedup_key = Some(derive_dedup_key(&entry));
        Self {
            id: generate_entry_id(),
            timestamp,
            entry,
            dedup_key,
        }
    }

    pub fn get_id(&self) -> &str {
        &self.id
    }

    pub fn get_timestamp(&self) -> TimestampMillis {
        self.timestamp
    }

    pub fn get_entry(&self) -> &EntryData {
        &self.entry
    }

    pub fn get_dedup_key(&self) -> Option<&str> {
        self.dedup_key.as_deref()
    }

    // Entries restored from the legacy flat list have no dedup key yet
    pub fn ensure_dedup_key(&mut self) {
        if self.dedup_key.is_none() {
            self.dedup_key = Some(derive_dedup_key(&self.entry));
        }
    }

    pub fn summary(&self, decimals: u8) -> String {
        let when = DateTime::from_timestamp_millis(self.timestamp as i64)
            .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| self.timestamp.to_string());
        let amount = format_coin(self.entry.amount(), decimals);
        match &self.entry {
            EntryData::Sent {
                recipient_nametag, ..
            } => match recipient_nametag {
                Some(name) => format!("[{}] Sent {} to @{}", when, amount, name),
                None => format!("[{}] Sent {}", when, amount),
            },
            EntryData::Received { sender, .. } => match sender {
                Some(sender) => format!("[{}] Received {} from {}", when, amount, sender),
                None => format!("[{}] Received {}", when, amount),
            },
            EntryData::Split { token_id, .. } => {
                format!("[{}] Split {} of token {}", when, amount, token_id)
            }
            EntryData::Mint { reference, .. } => {
                format!("[{}] Minted {} ({})", when, amount, reference)
            }
        }
    }
}

pub fn derive_dedup_key(entry: &EntryData) -> String {
    format!("{}:{}", entry.kind(), entry.reference())
}

fn generate_entry_id() -> String {
    let mut bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("hist_{}", hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup_key_derivation() {
        let entry = EntryData::Sent {
            coin_id: "cafe".into(),
            amount: U256::from(50u64),
            recipient_nametag: Some("alice".into()),
            recipient: None,
            transfer_id: "tr_1".into(),
        };
        assert_eq!(derive_dedup_key(&entry), "SENT:tr_1");

        let entry = EntryData::Received {
            coin_id: "cafe".into(),
            amount: U256::from(10u64),
            sender: None,
            reference: "recv_g1".into(),
        };
        assert_eq!(derive_dedup_key(&entry), "RECEIVED:recv_g1");
    }

    #[test]
    fn test_legacy_entry_gets_dedup_key() {
        let raw = r#"{
            "id": "hist_00",
            "timestamp": 1,
            "entry": {"type": "MINT", "coin_id": "", "amount": "0", "reference": "alice"}
        }"#;
        let mut entry: TransactionEntry = serde_json::from_str(raw).unwrap();
        assert!(entry.get_dedup_key().is_none());
        entry.ensure_dedup_key();
        assert_eq!(entry.get_dedup_key(), Some("MINT:alice"));
    }

    #[test]
    fn test_entry_serialization_tag() {
        let entry = TransactionEntry::new(
            EntryData::Split {
                coin_id: "cafe".into(),
                amount: U256::from(100u64),
                token_id: "aa".into(),
            },
            5,
        );
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["entry"]["type"], "SPLIT");
    }
}

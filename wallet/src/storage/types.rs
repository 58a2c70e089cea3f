use crate::transfer::TransferResult;
use serde::{Deserialize, Serialize};
use sphere_common::{crypto::PublicKey, time::TimestampMillis};

// An in-flight send, persisted for crash recovery
// Added when tokens are marked transferring, cleared on completion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub transfer: TransferResult,
    pub recipient_pubkey: PublicKey,
    pub created_at: TimestampMillis,
}

impl OutboxEntry {
    pub fn new(
        transfer: TransferResult,
        recipient_pubkey: PublicKey,
        created_at: TimestampMillis,
    ) -> Self {
        Self {
            transfer,
            recipient_pubkey,
            created_at,
        }
    }

    pub fn transfer_id(&self) -> &str {
        &self.transfer.transfer_id
    }

    // Local ids of the tokens this send holds in transferring state
    pub fn local_ids(&self) -> &[String] {
        &self.transfer.local_ids
    }
}

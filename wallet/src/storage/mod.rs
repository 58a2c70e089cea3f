mod backend;
mod types;

pub use backend::{MemoryStorageProvider, SledStorageProvider};
pub use types::OutboxEntry;

use crate::{
    config::{
        ARCHIVED_MAX_COUNT, FORKED_MAX_COUNT, TOMBSTONE_MAX_AGE_MILLIS, TOMBSTONE_MAX_COUNT,
    },
    entry::TransactionEntry,
    error::WalletError,
    providers::StorageProvider,
};
use indexmap::IndexMap;
use log::{debug, trace, warn};
use primitive_types::U256;
use sphere_common::{
    api::txf::{
        ArchivedToken, ForkedToken, NametagToken, TombstoneEntry, TxfArchive, TxfMeta, TxfToken,
        TXF_FORMAT_VERSION,
    },
    time::{get_current_time_in_millis, TimestampMillis},
    token::{Token, TokenStatus},
};
use std::collections::HashSet;

// Keys used to persist the repository through the primary provider
const TXF_KEY: &str = "sphere:txf";
// Pending-finalization tokens cannot be represented in the portable
// archive format and live in their own slot
const PENDING_TOKENS_KEY: &str = "sphere:pending";
const HISTORY_KEY: &str = "sphere:history:v2";
// Flat list without dedup keys, migrated once on load
const LEGACY_HISTORY_KEY: &str = "sphere:history";
const OUTBOX_KEY: &str = "sphere:outbox";

// In-memory repository of the wallet's unspent tokens and the records
// that protect them: tombstones, archived histories, forked histories.
// The repository exclusively owns all entries; readers get defensive
// copies.
pub struct Repository {
    // Wallet address carried in the TXF meta header
    address: String,
    // Monotone counter bumped on every save
    version: u64,
    // Active set, local id -> token
    tokens: IndexMap<String, Token>,
    tombstones: Vec<TombstoneEntry>,
    // Keyed by genesis token id
    archived: IndexMap<String, ArchivedToken>,
    // Keyed by genesis id + "_" + state hash
    forked: IndexMap<String, ForkedToken>,
    // Keyed by nametag name
    nametags: IndexMap<String, NametagToken>,
    history: Vec<TransactionEntry>,
    outbox: Vec<OutboxEntry>,
}

impl Repository {
    pub fn new(address: String) -> Self {
        Self {
            address,
            version: 0,
            tokens: IndexMap::new(),
            tombstones: Vec::new(),
            archived: IndexMap::new(),
            forked: IndexMap::new(),
            nametags: IndexMap::new(),
            history: Vec::new(),
            outbox: Vec::new(),
        }
    }

    // Queries

    pub fn get_address(&self) -> &str {
        &self.address
    }

    pub fn get_version(&self) -> u64 {
        self.version
    }

    pub fn get_token(&self, local_id: &str) -> Option<&Token> {
        self.tokens.get(local_id)
    }

    pub fn get_token_mut(&mut self, local_id: &str) -> Option<&mut Token> {
        self.tokens.get_mut(local_id)
    }

    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }

    // Snapshot of the active set
    pub fn get_tokens(&self) -> Vec<Token> {
        self.tokens.values().cloned().collect()
    }

    pub fn confirmed_tokens(&self, coin_id: &str) -> Vec<Token> {
        self.tokens
            .values()
            .filter(|t| t.status == TokenStatus::Confirmed && t.coin_id == coin_id)
            .cloned()
            .collect()
    }

    pub fn balance(&self, coin_id: &str) -> U256 {
        self.tokens
            .values()
            .filter(|t| t.status == TokenStatus::Confirmed && t.coin_id == coin_id)
            .fold(U256::zero(), |acc, t| acc.saturating_add(t.amount))
    }

    pub fn pending_finalization_tokens(&self) -> Vec<Token> {
        self.tokens
            .values()
            .filter(|t| t.is_pending_finalization())
            .cloned()
            .collect()
    }

    pub fn get_tombstones(&self) -> &[TombstoneEntry] {
        &self.tombstones
    }

    pub fn get_archived(&self) -> &IndexMap<String, ArchivedToken> {
        &self.archived
    }

    pub fn get_forked(&self) -> &IndexMap<String, ForkedToken> {
        &self.forked
    }

    pub fn is_tombstoned(&self, token_id: &str, state_hash: &str) -> bool {
        self.tombstones
            .iter()
            .any(|t| t.matches(token_id, state_hash))
    }

    pub fn find_by_pair(&self, token_id: &str, state_hash: &str) -> Option<String> {
        self.tokens
            .values()
            .find(|t| {
                t.key_pair()
                    .map(|(id, state)| id == token_id && state == state_hash)
                    .unwrap_or(false)
            })
            .map(|t| t.local_id.clone())
    }

    fn find_by_genesis(&self, token_id: &str) -> Option<String> {
        self.tokens
            .values()
            .find(|t| t.genesis_id().as_deref() == Some(token_id))
            .map(|t| t.local_id.clone())
    }

    // Mutations

    // Insert a token into the active set, honoring the duplicate and
    // state-replacement rules. Returns false when the token is rejected.
    pub fn add_token(&mut self, token: Token, skip_history: bool) -> bool {
        if self.tokens.contains_key(&token.local_id) {
            debug!("token {} already present, skipping", token.local_id);
            return false;
        }

        if let Some((token_id, state_hash)) = token.key_pair() {
            if self.is_tombstoned(&token_id, &state_hash) {
                warn!(
                    "rejecting token {}: ({}, {}) is tombstoned",
                    token.local_id, token_id, state_hash
                );
                return false;
            }

            if self.find_by_pair(&token_id, &state_hash).is_some() {
                debug!(
                    "token with state ({}, {}) already in active set",
                    token_id, state_hash
                );
                return false;
            }

            // Same genesis under a different state: the new state
            // displaces the old entry
            if let Some(existing_local) = self.find_by_genesis(&token_id) {
                let existing = self.tokens.get(&existing_local).cloned();
                if let Some(existing) = existing {
                    if !existing.status.is_replaceable() {
                        self.archive_token(&existing);
                    }
                    debug!(
                        "replacing token {} with new state of {}",
                        existing_local, token_id
                    );
                    self.tokens.shift_remove(&existing_local);
                }
            }
        }

        self.archive_token(&token);

        if !skip_history && !token.coin_id.is_empty() {
            let entry = crate::entry::EntryData::Received {
                coin_id: token.coin_id.clone(),
                amount: token.amount,
                sender: None,
                reference: token.local_id.clone(),
            };
            self.push_history(TransactionEntry::new(entry, get_current_time_in_millis()));
        }

        self.tokens.insert(token.local_id.clone(), token);
        true
    }

    // Remove a spent token: archive, tombstone, delete
    pub fn remove_token(
        &mut self,
        local_id: &str,
        recipient_label: Option<&str>,
        skip_history: bool,
    ) -> Option<Token> {
        let token = self.tokens.get(local_id)?.clone();
        self.archive_token(&token);

        match token.key_pair() {
            Some((token_id, state_hash)) => {
                if !self.is_tombstoned(&token_id, &state_hash) {
                    self.tombstones.push(TombstoneEntry::new(
                        token_id,
                        state_hash,
                        get_current_time_in_millis(),
                    ));
                }
            }
            None => warn!(
                "cannot build tombstone for {}: missing genesis id or state hash",
                local_id
            ),
        }

        self.tokens.shift_remove(local_id);

        if !skip_history && !token.coin_id.is_empty() {
            let entry = crate::entry::EntryData::Sent {
                coin_id: token.coin_id.clone(),
                amount: token.amount,
                recipient_nametag: recipient_label.map(|s| s.to_owned()),
                recipient: None,
                transfer_id: token.local_id.clone(),
            };
            self.push_history(TransactionEntry::new(entry, get_current_time_in_millis()));
        }

        Some(token)
    }

    // Record a token's current history in the archive map
    pub fn archive_token(&mut self, token: &Token) {
        let Some(blob) = token.payload.blob() else {
            trace!("token {} is pending finalization, not archived", token.local_id);
            return;
        };
        let Some(token_id) = token.genesis_id() else {
            warn!("cannot archive token {}: missing genesis id", token.local_id);
            return;
        };

        let incoming = ArchivedToken {
            token_id,
            state_hash: token.state_hash(),
            token: blob.clone(),
            archived_at: get_current_time_in_millis(),
        };
        self.insert_archive(incoming);
    }

    fn insert_archive(&mut self, incoming: ArchivedToken) -> bool {
        match self.archived.get(&incoming.token_id) {
            None => {
                self.archived.insert(incoming.token_id.clone(), incoming);
                true
            }
            Some(existing) if existing.token == incoming.token => false,
            Some(existing) if is_incremental_update(existing, &incoming) => {
                self.archived.insert(incoming.token_id.clone(), incoming);
                true
            }
            Some(_) => {
                // Divergence in a committed position: keep both lineages
                self.store_fork(incoming);
                false
            }
        }
    }

    fn store_fork(&mut self, incoming: ArchivedToken) {
        let Some(state_hash) = incoming.state_hash.clone() else {
            warn!(
                "divergent history of {} has no state hash, dropping",
                incoming.token_id
            );
            return;
        };
        let fork = ForkedToken {
            token_id: incoming.token_id,
            state_hash,
            token: incoming.token,
            forked_at: incoming.archived_at,
        };
        debug!("storing fork {}", fork.fork_key());
        self.forked.insert(fork.fork_key(), fork);
    }

    // Apply remote tombstones: delete matching active tokens, then
    // union-merge with dedup. Returns the number of removed tokens.
    pub fn merge_tombstones(&mut self, remote: &[TombstoneEntry]) -> usize {
        let mut removed = 0;
        for entry in remote {
            if let Some(local_id) = self.find_by_pair(&entry.token_id, &entry.state_hash) {
                warn!(
                    "removing token {} spent elsewhere ({}, {})",
                    local_id, entry.token_id, entry.state_hash
                );
                self.tokens.shift_remove(&local_id);
                removed += 1;
            }
        }

        let mut seen: HashSet<(String, String)> =
            self.tombstones.iter().map(|t| t.dedup_key()).collect();
        for entry in remote {
            if seen.insert(entry.dedup_key()) {
                self.tombstones.push(entry.clone());
            }
        }

        removed
    }

    // Merge remote archives: insert missing keys, replace when the
    // remote history is an incremental update of the local one, fork
    // when neither direction is incremental
    pub fn merge_archives(&mut self, remote: &IndexMap<String, ArchivedToken>) -> usize {
        let mut merged = 0;
        for (key, incoming) in remote {
            match self.archived.get(key) {
                None => {
                    self.archived.insert(key.clone(), incoming.clone());
                    merged += 1;
                }
                Some(existing) if existing.token == incoming.token => {}
                Some(existing) if is_incremental_update(existing, incoming) => {
                    self.archived.insert(key.clone(), incoming.clone());
                    merged += 1;
                }
                Some(existing) if is_incremental_update(incoming, existing) => {
                    // Local already has the longer committed history
                }
                Some(_) => self.store_fork(incoming.clone()),
            }
        }
        merged
    }

    // Drop every active token whose exact (genesis id, state hash) pair
    // is tombstoned. A shared genesis id with a different state stays.
    pub fn enforce_tombstones(&mut self) -> usize {
        let doomed: Vec<String> = self
            .tokens
            .values()
            .filter_map(|t| {
                let (token_id, state_hash) = t.key_pair()?;
                self.is_tombstoned(&token_id, &state_hash)
                    .then(|| t.local_id.clone())
            })
            .collect();

        for local_id in &doomed {
            warn!("dropping tombstoned token {}", local_id);
            self.tokens.shift_remove(local_id);
        }
        doomed.len()
    }

    // Age- and count-based pruning of the protective records
    pub fn prune(&mut self, now: TimestampMillis) {
        let cutoff = now.saturating_sub(TOMBSTONE_MAX_AGE_MILLIS);
        self.tombstones.retain(|t| t.timestamp_ms >= cutoff);

        if self.tombstones.len() > TOMBSTONE_MAX_COUNT {
            self.tombstones.sort_by_key(|t| t.timestamp_ms);
            let excess = self.tombstones.len() - TOMBSTONE_MAX_COUNT;
            self.tombstones.drain(..excess);
        }

        prune_map_by_age(&mut self.archived, ARCHIVED_MAX_COUNT, |a| a.archived_at);
        prune_map_by_age(&mut self.forked, FORKED_MAX_COUNT, |f| f.forked_at);
    }

    // History

    // Append-only with upsert semantics on the dedup key
    pub fn push_history(&mut self, entry: TransactionEntry) {
        if let Some(key) = entry.get_dedup_key() {
            if let Some(existing) = self
                .history
                .iter_mut()
                .find(|e| e.get_dedup_key() == Some(key))
            {
                *existing = entry;
                return;
            }
        }
        self.history.push(entry);
    }

    pub fn history_newest_first(&self) -> Vec<TransactionEntry> {
        let mut entries = self.history.clone();
        entries.sort_by(|a, b| b.get_timestamp().cmp(&a.get_timestamp()));
        entries
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    // Outbox

    pub fn add_outbox(&mut self, entry: OutboxEntry) {
        self.outbox.push(entry);
    }

    pub fn remove_outbox(&mut self, transfer_id: &str) -> Option<OutboxEntry> {
        let index = self
            .outbox
            .iter()
            .position(|e| e.transfer_id() == transfer_id)?;
        Some(self.outbox.remove(index))
    }

    pub fn get_outbox(&self) -> &[OutboxEntry] {
        &self.outbox
    }

    // Nametags

    pub fn add_nametag(&mut self, nametag: NametagToken) {
        self.nametags.insert(nametag.name.clone(), nametag);
    }

    pub fn get_nametag(&self, name: &str) -> Option<&NametagToken> {
        self.nametags.get(name)
    }

    pub fn get_nametags(&self) -> &IndexMap<String, NametagToken> {
        &self.nametags
    }

    pub fn find_nametag_for_address(
        &self,
        address: &sphere_common::api::Address,
    ) -> Option<&NametagToken> {
        self.nametags
            .values()
            .find(|n| &n.proxy_address() == address)
    }

    // Portable state

    pub fn to_txf(&self) -> TxfArchive {
        TxfArchive {
            meta: TxfMeta {
                version: self.version,
                address: self.address.clone(),
                ipns_name: None,
                format_version: TXF_FORMAT_VERSION,
                updated_at: get_current_time_in_millis(),
            },
            tokens: self.tokens.values().filter_map(TxfToken::from_token).collect(),
            tombstones: self.tombstones.clone(),
            archived: self.archived.clone(),
            forked: self.forked.clone(),
            nametags: self.nametags.clone(),
        }
    }

    // Re-hydrate from a merged archive. Local pending-finalization
    // tokens survive; everything representable is replaced. Returns the
    // number of tokens dropped by tombstone enforcement.
    pub fn apply_txf(&mut self, archive: TxfArchive) -> usize {
        let pending: Vec<Token> = self
            .tokens
            .values()
            .filter(|t| t.payload.is_pending())
            .cloned()
            .collect();

        self.tokens.clear();
        for record in archive.tokens {
            let token = record.into_token();
            self.tokens.insert(token.local_id.clone(), token);
        }
        for token in pending {
            if !self.tokens.contains_key(&token.local_id) {
                self.tokens.insert(token.local_id.clone(), token);
            }
        }

        self.tombstones.clear();
        let mut seen: HashSet<(String, String)> = HashSet::new();
        for entry in archive.tombstones {
            if seen.insert(entry.dedup_key()) {
                self.tombstones.push(entry);
            }
        }

        self.archived = archive.archived;
        self.forked = archive.forked;
        self.nametags = archive.nametags;
        if archive.meta.version > self.version {
            self.version = archive.meta.version;
        }

        self.enforce_tombstones()
    }

    // Persistence

    pub async fn save(&mut self, provider: &dyn StorageProvider) -> Result<(), WalletError> {
        trace!("saving repository (version {})", self.version + 1);
        self.version += 1;

        let archive = serde_json::to_string(&self.to_txf())?;
        provider
            .set(TXF_KEY, &archive)
            .await
            .map_err(|e| WalletError::Storage(e.to_string()))?;

        let pending: Vec<&Token> = self
            .tokens
            .values()
            .filter(|t| t.payload.is_pending())
            .collect();
        provider
            .set(PENDING_TOKENS_KEY, &serde_json::to_string(&pending)?)
            .await
            .map_err(|e| WalletError::Storage(e.to_string()))?;

        provider
            .set(HISTORY_KEY, &serde_json::to_string(&self.history)?)
            .await
            .map_err(|e| WalletError::Storage(e.to_string()))?;

        provider
            .set(OUTBOX_KEY, &serde_json::to_string(&self.outbox)?)
            .await
            .map_err(|e| WalletError::Storage(e.to_string()))?;

        Ok(())
    }

    pub async fn load(
        provider: &dyn StorageProvider,
        address: String,
    ) -> Result<Self, WalletError> {
        let mut repository = Self::new(address);

        if let Some(raw) = provider
            .get(TXF_KEY)
            .await
            .map_err(|e| WalletError::Storage(e.to_string()))?
        {
            match serde_json::from_str::<TxfArchive>(&raw) {
                Ok(archive) => {
                    let dropped = repository.apply_txf(archive);
                    if dropped > 0 {
                        debug!("dropped {} tombstoned tokens on load", dropped);
                    }
                }
                Err(e) => warn!("stored archive is unreadable, starting empty: {}", e),
            }
        }

        if let Some(raw) = provider
            .get(PENDING_TOKENS_KEY)
            .await
            .map_err(|e| WalletError::Storage(e.to_string()))?
        {
            match serde_json::from_str::<Vec<Token>>(&raw) {
                Ok(pending) => {
                    for token in pending {
                        repository.tokens.entry(token.local_id.clone()).or_insert(token);
                    }
                }
                Err(e) => warn!("pending token slot is unreadable: {}", e),
            }
        }

        repository.load_history(provider).await?;

        if let Some(raw) = provider
            .get(OUTBOX_KEY)
            .await
            .map_err(|e| WalletError::Storage(e.to_string()))?
        {
            match serde_json::from_str::<Vec<OutboxEntry>>(&raw) {
                Ok(outbox) => repository.outbox = outbox,
                Err(e) => warn!("outbox slot is unreadable: {}", e),
            }
        }

        repository.enforce_tombstones();
        repository.prune(get_current_time_in_millis());
        Ok(repository)
    }

    async fn load_history(&mut self, provider: &dyn StorageProvider) -> Result<(), WalletError> {
        if let Some(raw) = provider
            .get(HISTORY_KEY)
            .await
            .map_err(|e| WalletError::Storage(e.to_string()))?
        {
            match serde_json::from_str::<Vec<TransactionEntry>>(&raw) {
                Ok(history) => self.history = history,
                Err(e) => warn!("history slot is unreadable: {}", e),
            }
            return Ok(());
        }

        // One-time migration from the legacy flat-list key
        if let Some(raw) = provider
            .get(LEGACY_HISTORY_KEY)
            .await
            .map_err(|e| WalletError::Storage(e.to_string()))?
        {
            match serde_json::from_str::<Vec<TransactionEntry>>(&raw) {
                Ok(mut legacy) => {
                    debug!("migrating {} legacy history entries", legacy.len());
                    for entry in &mut legacy {
                        entry.ensure_dedup_key();
                    }
                    for entry in legacy {
                        self.push_history(entry);
                    }
                    provider
                        .set(HISTORY_KEY, &serde_json::to_string(&self.history)?)
                        .await
                        .map_err(|e| WalletError::Storage(e.to_string()))?;
                    provider
                        .remove(LEGACY_HISTORY_KEY)
                        .await
                        .map_err(|e| WalletError::Storage(e.to_string()))?;
                }
                Err(e) => warn!("legacy history is unreadable, skipping migration: {}", e),
            }
        }
        Ok(())
    }
}

// An incoming history is an incremental update of the existing one when
// the existing committed transitions form an exact prefix of it. An
// uncommitted tail in the existing history blocks replacement; the
// diverging copy becomes a fork instead.
pub fn is_incremental_update(existing: &ArchivedToken, incoming: &ArchivedToken) -> bool {
    if existing.token_id != incoming.token_id {
        return false;
    }

    let old = existing.history();
    let new = incoming.history();
    if new.len() < old.len() {
        return false;
    }

    for (index, entry) in old.iter().enumerate() {
        let committed = entry
            .get("inclusionProof")
            .map(|p| !p.is_null())
            .unwrap_or(false);
        if !committed {
            return false;
        }
        if new.get(index) != Some(entry) {
            return false;
        }
    }

    true
}

fn prune_map_by_age<V>(
    map: &mut IndexMap<String, V>,
    cap: usize,
    age: impl Fn(&V) -> TimestampMillis,
) {
    if map.len() <= cap {
        return;
    }

    let mut keys: Vec<(String, TimestampMillis)> = map
        .iter()
        .map(|(key, value)| (key.clone(), age(value)))
        .collect();
    keys.sort_by_key(|(_, at)| *at);

    let excess = map.len() - cap;
    for (key, _) in keys.into_iter().take(excess) {
        map.shift_remove(&key);
    }
}

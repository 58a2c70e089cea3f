// End-to-end wallet flows driven through mock providers.

use anyhow::Result;
use async_trait::async_trait;
use primitive_types::U256;
use serde_json::{json, Value};
use sphere_common::{
    api::{
        predicate_state, recipient_predicate, txf::TxfArchive, Address, Commitment,
        CommitmentKind, IncomingPaymentRequest, IncomingTokenTransfer, PaymentRequestEnvelope,
        PaymentRequestResponse, PaymentRequestStatus, PeerInfo, SplitBundleV5,
        SPLIT_BUNDLE_TYPE, SPLIT_BUNDLE_VERSION_V5,
    },
    crypto::{PublicKey, PUBLIC_KEY_SIZE},
    time::get_current_time_in_millis,
    token::{split_bundle_local_id, PendingStage, Token, TokenBlob, TokenStatus},
};
use sphere_wallet::{
    providers::{
        OracleProvider, ProviderSyncResult, StateTransitionClient, StorageProvider, SubmitResult,
        SubmitStatus, TokenStorageProvider, TokenValidity, TransportProvider,
    },
    storage::MemoryStorageProvider,
    transfer::{AddressMode, SendRequest, TransferMode, TransferStatus},
    wallet::{SharedWallet, Wallet},
};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::{sync::broadcast, time::sleep};

// Mock state-transition client: submissions always accepted, finalize
// rewrites the source state and appends the transfer transaction

struct MockClient {
    submissions: Mutex<Vec<String>>,
}

impl MockClient {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            submissions: Mutex::new(Vec::new()),
        })
    }

    fn submission_count(&self) -> usize {
        self.submissions.lock().unwrap().len()
    }
}

#[async_trait]
impl StateTransitionClient for MockClient {
    async fn submit_mint_commitment(&self, commitment: &Commitment) -> Result<SubmitResult> {
        self.submissions
            .lock()
            .unwrap()
            .push(commitment.request_id.clone());
        Ok(SubmitResult {
            status: SubmitStatus::Success,
        })
    }

    async fn submit_transfer_commitment(&self, commitment: &Commitment) -> Result<SubmitResult> {
        let mut submissions = self.submissions.lock().unwrap();
        let status = if submissions.contains(&commitment.request_id) {
            SubmitStatus::RequestIdExists
        } else {
            SubmitStatus::Success
        };
        submissions.push(commitment.request_id.clone());
        Ok(SubmitResult { status })
    }

    async fn finalize(
        &self,
        _trust_base: &Value,
        source_token: &TokenBlob,
        recipient_state: &Value,
        transfer_tx: &Value,
        _nametag_witnesses: &[TokenBlob],
    ) -> Result<TokenBlob> {
        let mut doc = source_token
            .as_value()
            .map(|v| v.into_owned())
            .unwrap_or_else(|| json!({}));
        doc["state"] = recipient_state.clone();
        match doc.get_mut("transactions").and_then(|t| t.as_array_mut()) {
            Some(transactions) => transactions.push(transfer_tx.clone()),
            None => doc["transactions"] = json!([transfer_tx]),
        }
        Ok(TokenBlob::Structured(doc))
    }
}

// Mock oracle: proofs are exposed explicitly, or automatically after an
// optional delay

struct MockOracle {
    client: Arc<MockClient>,
    proofs: Mutex<HashMap<String, Value>>,
    auto: bool,
    delay: Duration,
}

impl MockOracle {
    fn new(auto: bool, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            client: MockClient::new(),
            proofs: Mutex::new(HashMap::new()),
            auto,
            delay,
        })
    }

    fn expose(&self, request_id: &str) {
        self.proofs.lock().unwrap().insert(
            request_id.to_owned(),
            json!({"requestId": request_id, "anchored": true}),
        );
    }
}

#[async_trait]
impl OracleProvider for MockOracle {
    async fn validate_token(&self, _token: &TokenBlob) -> Result<TokenValidity> {
        Ok(TokenValidity {
            valid: true,
            spent: false,
        })
    }

    async fn wait_for_proof(&self, commitment: &Commitment) -> Result<Value> {
        if self.auto {
            sleep(self.delay).await;
            self.expose(&commitment.request_id);
        }
        loop {
            if let Some(proof) = self.proofs.lock().unwrap().get(&commitment.request_id) {
                return Ok(proof.clone());
            }
            sleep(Duration::from_millis(5)).await;
        }
    }

    async fn get_proof(&self, request_id: &str) -> Result<Option<Value>> {
        Ok(self.proofs.lock().unwrap().get(request_id).cloned())
    }

    fn state_transition_client(&self) -> Arc<dyn StateTransitionClient> {
        self.client.clone()
    }

    fn trust_base(&self) -> Option<Value> {
        Some(json!({"epoch": 1}))
    }
}

// Mock transport: peers registered by recipient string, sends recorded

struct MockTransport {
    peers: Mutex<HashMap<String, PeerInfo>>,
    sent: Mutex<Vec<(PublicKey, Value)>>,
    requests_sent: Mutex<Vec<PaymentRequestEnvelope>>,
    transfers: broadcast::Sender<IncomingTokenTransfer>,
    requests: broadcast::Sender<IncomingPaymentRequest>,
    responses: broadcast::Sender<PaymentRequestResponse>,
    queued: Mutex<Vec<IncomingTokenTransfer>>,
    fail_sends: AtomicBool,
}

impl MockTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            peers: Mutex::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
            requests_sent: Mutex::new(Vec::new()),
            transfers: broadcast::channel(64).0,
            requests: broadcast::channel(64).0,
            responses: broadcast::channel(64).0,
            queued: Mutex::new(Vec::new()),
            fail_sends: AtomicBool::new(false),
        })
    }

    fn register_peer(&self, recipient: &str, peer: PeerInfo) {
        self.peers
            .lock()
            .unwrap()
            .insert(recipient.to_owned(), peer);
    }

    fn sent_envelopes(&self) -> Vec<(PublicKey, Value)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl TransportProvider for MockTransport {
    async fn resolve(&self, recipient: &str) -> Result<Option<PeerInfo>> {
        Ok(self.peers.lock().unwrap().get(recipient).cloned())
    }

    async fn send_token_transfer(&self, to: &PublicKey, payload: &Value) -> Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            anyhow::bail!("transport unavailable");
        }
        self.sent.lock().unwrap().push((to.clone(), payload.clone()));
        Ok(())
    }

    async fn on_token_transfer(&self) -> broadcast::Receiver<IncomingTokenTransfer> {
        self.transfers.subscribe()
    }

    async fn send_payment_request(
        &self,
        _to: &PublicKey,
        request: &PaymentRequestEnvelope,
    ) -> Result<()> {
        self.requests_sent.lock().unwrap().push(request.clone());
        Ok(())
    }

    async fn send_payment_request_response(
        &self,
        _to: &PublicKey,
        _response: &PaymentRequestResponse,
    ) -> Result<()> {
        Ok(())
    }

    async fn on_payment_request(&self) -> broadcast::Receiver<IncomingPaymentRequest> {
        self.requests.subscribe()
    }

    async fn on_payment_request_response(&self) -> broadcast::Receiver<PaymentRequestResponse> {
        self.responses.subscribe()
    }

    async fn fetch_pending_events(&self) -> Result<Vec<IncomingTokenTransfer>> {
        Ok(self.queued.lock().unwrap().drain(..).collect())
    }
}

struct MockTokenProvider {
    name: String,
    merged: Mutex<Option<TxfArchive>>,
}

impl MockTokenProvider {
    fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_owned(),
            merged: Mutex::new(None),
        })
    }

    fn set_merged(&self, archive: TxfArchive) {
        *self.merged.lock().unwrap() = Some(archive);
    }
}

#[async_trait]
impl TokenStorageProvider for MockTokenProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn save(&self, _archive: &TxfArchive) -> Result<()> {
        Ok(())
    }

    async fn load(&self) -> Result<Option<TxfArchive>> {
        Ok(self.merged.lock().unwrap().clone())
    }

    async fn sync(&self, _local: &TxfArchive) -> Result<ProviderSyncResult> {
        let merged = self.merged.lock().unwrap().take();
        let added = merged.is_some() as u32;
        Ok(ProviderSyncResult {
            success: true,
            merged,
            added,
            removed: 0,
            conflicts: 0,
        })
    }
}

// Helpers

fn pubkey(byte: u8) -> PublicKey {
    PublicKey::new([byte; PUBLIC_KEY_SIZE])
}

fn coin_blob(token_id: &str, state_hash: &str, amount: u64) -> TokenBlob {
    TokenBlob::Structured(json!({
        "genesis": {"tokenId": token_id, "data": {"coins": [["cafe", amount.to_string()]]}},
        "state": {"hash": state_hash},
        "transactions": []
    }))
}

struct Harness {
    wallet: SharedWallet,
    transport: Arc<MockTransport>,
    oracle: Arc<MockOracle>,
}

async fn harness_with(oracle: Arc<MockOracle>, providers: Vec<Arc<dyn TokenStorageProvider>>) -> Harness {
    let transport = MockTransport::new();
    let primary: Arc<dyn StorageProvider> = Arc::new(MemoryStorageProvider::new());
    let wallet = Wallet::new(
        pubkey(1),
        oracle.clone(),
        transport.clone(),
        primary,
        providers,
    );
    wallet.load().await.unwrap();
    Harness {
        wallet,
        transport,
        oracle,
    }
}

async fn harness() -> Harness {
    harness_with(MockOracle::new(true, Duration::ZERO), Vec::new()).await
}

fn send_request(amount: u64, recipient: &str, mode: TransferMode) -> SendRequest {
    SendRequest {
        coin_id: "cafe".to_owned(),
        amount: U256::from(amount),
        recipient: recipient.to_owned(),
        memo: None,
        transfer_mode: mode,
        address_mode: AddressMode::Auto,
    }
}

fn register_alice(transport: &MockTransport) {
    transport.register_peer(
        "@alice",
        PeerInfo {
            pubkey: pubkey(2),
            direct_address: None,
            nametag: Some("alice".to_owned()),
        },
    );
}

fn sent_entries(history: &[sphere_wallet::entry::TransactionEntry]) -> Vec<(U256, Option<String>)> {
    history
        .iter()
        .filter_map(|e| match e.get_entry() {
            sphere_wallet::entry::EntryData::Sent {
                amount,
                recipient_nametag,
                ..
            } => Some((*amount, recipient_nametag.clone())),
            _ => None,
        })
        .collect()
}

// S1: conservative send with an exact-amount split

#[tokio::test]
async fn test_conservative_split_send() {
    let h = harness().await;
    register_alice(&h.transport);

    let blob = coin_blob("t1g", "t1s", 100);
    let local_id = h.wallet.import_token(blob.clone()).await.unwrap().unwrap();

    let result = h
        .wallet
        .send(send_request(50, "@alice", TransferMode::Conservative))
        .await
        .unwrap();
    assert_eq!(result.status, TransferStatus::Confirmed);

    // original removed, change of 50 confirmed
    let tokens = h.wallet.get_tokens().await;
    assert!(tokens.iter().all(|t| t.local_id != local_id));
    let confirmed: Vec<&Token> = tokens
        .iter()
        .filter(|t| t.status == TokenStatus::Confirmed && t.coin_id == "cafe")
        .collect();
    assert_eq!(confirmed.len(), 1);
    assert_eq!(confirmed[0].amount, U256::from(50u64));

    // tombstone blocks re-adding the spent state
    assert_eq!(h.wallet.import_token(blob).await.unwrap(), None);

    // exactly one SENT entry, for the user-requested amount
    let history = h.wallet.get_history().await;
    let sent = sent_entries(&history);
    assert_eq!(sent, vec![(U256::from(50u64), Some("alice".to_owned()))]);

    // the recipient got one fully-proven envelope
    let envelopes = h.transport.sent_envelopes();
    assert_eq!(envelopes.len(), 1);
    assert_eq!(envelopes[0].0, pubkey(2));
    assert!(envelopes[0].1.get("transfer_tx").is_some());

    // outbox cleared on completion
    assert!(h.wallet.get_outbox().await.is_empty());
}

// S2: instant send returns after the burn proof; the change token only
// lands once pending operations are joined

#[tokio::test]
async fn test_instant_split_send() {
    let oracle = MockOracle::new(true, Duration::from_millis(200));
    let h = harness_with(oracle, Vec::new()).await;
    register_alice(&h.transport);

    h.wallet
        .import_token(coin_blob("t1g", "t1s", 100))
        .await
        .unwrap()
        .unwrap();

    let result = h
        .wallet
        .send(send_request(50, "@alice", TransferMode::Instant))
        .await
        .unwrap();
    assert_eq!(result.status, TransferStatus::Confirmed);

    // the V5 bundle left immediately
    let envelopes = h.transport.sent_envelopes();
    assert_eq!(envelopes.len(), 1);
    assert_eq!(
        envelopes[0].1.get("type").and_then(|t| t.as_str()),
        Some(SPLIT_BUNDLE_TYPE)
    );

    // the change mint is still running in the background
    assert_eq!(h.wallet.get_balance("cafe").await, U256::zero());

    h.wallet.wait_for_pending_operations().await;
    assert_eq!(h.wallet.get_balance("cafe").await, U256::from(50u64));
}

// S3: incoming fully-proven DIRECT transfer

#[tokio::test]
async fn test_receive_fully_proven_direct() {
    let h = harness().await;

    let salt = "ab01";
    let own_direct = Address::direct_from_pubkey(h.wallet.get_public_key());
    let commitment = Commitment::new(
        CommitmentKind::Transfer,
        "r1g",
        Some("r1s".to_owned()),
        own_direct,
        salt,
    );
    let payload = json!({
        "source_token": {
            "genesis": {"tokenId": "r1g", "data": {"coins": [["cafe", "25"]]}},
            "state": {"hash": "r1s"},
            "transactions": []
        },
        "transfer_tx": {
            "commitment": serde_json::to_value(&commitment).unwrap(),
            "inclusionProof": {"anchored": true},
        },
    });

    let local_id = h
        .wallet
        .handle_incoming_transfer(IncomingTokenTransfer {
            sender: pubkey(3),
            payload,
            received_at: get_current_time_in_millis(),
        })
        .await
        .unwrap()
        .unwrap();

    let tokens = h.wallet.get_tokens().await;
    let token = tokens.iter().find(|t| t.local_id == local_id).unwrap();
    assert_eq!(token.status, TokenStatus::Confirmed);
    assert_eq!(token.amount, U256::from(25u64));

    let received: Vec<_> = h
        .wallet
        .get_history()
        .await
        .into_iter()
        .filter(|e| e.get_entry().kind() == "RECEIVED")
        .collect();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].get_entry().amount(), U256::from(25u64));
}

fn build_v5_bundle(wallet: &Wallet, group: &str, amount: u64) -> SplitBundleV5 {
    let recipient_address = Address::direct_from_pubkey(wallet.get_public_key());
    let transfer_salt = "55aa".to_owned();
    let predicate = recipient_predicate(wallet.get_public_key(), &transfer_salt);
    let minted_token_state = predicate_state(&predicate);
    let minted_state_hash = minted_token_state
        .get("hash")
        .and_then(|h| h.as_str())
        .map(|h| h.to_owned());

    let mint_commitment = Commitment::new(
        CommitmentKind::Mint,
        format!("minted_{}", group),
        None,
        recipient_address.clone(),
        "11",
    );
    let transfer_commitment = Commitment::new(
        CommitmentKind::Transfer,
        format!("minted_{}", group),
        minted_state_hash,
        recipient_address.clone(),
        transfer_salt.clone(),
    );

    SplitBundleV5 {
        bundle_type: SPLIT_BUNDLE_TYPE.to_owned(),
        version: SPLIT_BUNDLE_VERSION_V5,
        split_group_id: group.to_owned(),
        coin_id: "cafe".to_owned(),
        amount: U256::from(amount),
        recipient_mint_data: json!({"tokenId": format!("minted_{}", group)}),
        mint_commitment,
        transfer_commitment,
        transfer_salt_hex: transfer_salt,
        minted_token_state,
        token_type_hex: "cafe".to_owned(),
        recipient_address,
        nametag_token: None,
    }
}

async fn deliver_bundle(h: &Harness, bundle: &SplitBundleV5) -> Option<String> {
    h.wallet
        .handle_incoming_transfer(IncomingTokenTransfer {
            sender: pubkey(4),
            payload: serde_json::to_value(bundle).unwrap(),
            received_at: get_current_time_in_millis(),
        })
        .await
        .unwrap()
}

fn pending_stage(tokens: &[Token], local_id: &str) -> Option<PendingStage> {
    tokens
        .iter()
        .find(|t| t.local_id == local_id)?
        .payload
        .pending()
        .map(|p| p.stage)
}

// S4: a V5 bundle walks the finalization stages as the aggregator
// exposes the mint proof, then the transfer proof

#[tokio::test]
async fn test_v5_bundle_lazy_finalization() {
    let oracle = MockOracle::new(false, Duration::ZERO);
    let h = harness_with(oracle, Vec::new()).await;

    let bundle = build_v5_bundle(&h.wallet, "g1", 10);
    let local_id = deliver_bundle(&h, &bundle).await.unwrap();
    assert_eq!(local_id, split_bundle_local_id("g1"));

    let tokens = h.wallet.get_tokens().await;
    assert_eq!(pending_stage(&tokens, &local_id), Some(PendingStage::Received));

    // RECEIVED -> MINT_SUBMITTED
    h.wallet.resolve_unconfirmed().await.unwrap();
    let tokens = h.wallet.get_tokens().await;
    assert_eq!(
        pending_stage(&tokens, &local_id),
        Some(PendingStage::MintSubmitted)
    );

    // no mint proof yet: the token stays, attempts grow
    h.wallet.resolve_unconfirmed().await.unwrap();
    let tokens = h.wallet.get_tokens().await;
    assert_eq!(
        pending_stage(&tokens, &local_id),
        Some(PendingStage::MintSubmitted)
    );
    let attempts = tokens
        .iter()
        .find(|t| t.local_id == local_id)
        .and_then(|t| t.payload.pending())
        .map(|p| p.attempt_count)
        .unwrap();
    assert_eq!(attempts, 2);

    // mint proof appears
    h.oracle.expose(&bundle.mint_commitment.request_id);
    h.wallet.resolve_unconfirmed().await.unwrap();
    let tokens = h.wallet.get_tokens().await;
    assert_eq!(
        pending_stage(&tokens, &local_id),
        Some(PendingStage::MintProven)
    );

    // MINT_PROVEN -> TRANSFER_SUBMITTED
    h.wallet.resolve_unconfirmed().await.unwrap();
    let tokens = h.wallet.get_tokens().await;
    assert_eq!(
        pending_stage(&tokens, &local_id),
        Some(PendingStage::TransferSubmitted)
    );

    // transfer proof appears: finalized
    h.oracle.expose(&bundle.transfer_commitment.request_id);
    let summary = h.wallet.resolve_unconfirmed().await.unwrap();
    assert_eq!(summary.finalized, 1);
    assert_eq!(summary.remaining, 0);

    let tokens = h.wallet.get_tokens().await;
    let token = tokens.iter().find(|t| t.local_id == local_id).unwrap();
    assert_eq!(token.status, TokenStatus::Confirmed);
    assert_eq!(token.amount, U256::from(10u64));

    // exactly one RECEIVED entry for the split group
    let received: Vec<_> = h
        .wallet
        .get_history()
        .await
        .into_iter()
        .filter(|e| e.get_entry().kind() == "RECEIVED")
        .collect();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].get_entry().reference(), local_id);
}

// S5 / B4: re-delivery of the same bundle deduplicates

#[tokio::test]
async fn test_v5_bundle_redelivery_deduplicates() {
    let oracle = MockOracle::new(false, Duration::ZERO);
    let h = harness_with(oracle, Vec::new()).await;

    let bundle = build_v5_bundle(&h.wallet, "g2", 10);
    assert!(deliver_bundle(&h, &bundle).await.is_some());
    // second delivery while unconfirmed
    assert!(deliver_bundle(&h, &bundle).await.is_none());
    assert_eq!(h.wallet.get_tokens().await.len(), 1);

    // finalize, then redeliver again
    h.oracle.expose(&bundle.mint_commitment.request_id);
    h.oracle.expose(&bundle.transfer_commitment.request_id);
    for _ in 0..4 {
        h.wallet.resolve_unconfirmed().await.unwrap();
    }
    assert_eq!(h.wallet.get_pending_count().await, 0);

    assert!(deliver_bundle(&h, &bundle).await.is_none());
    assert_eq!(h.wallet.get_tokens().await.len(), 1);
}

// Commitment-only transfer resolves through the background poller

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_commitment_only_receive_polls_to_confirmed() {
    let oracle = MockOracle::new(false, Duration::ZERO);
    let h = harness_with(oracle, Vec::new()).await;

    let own_direct = Address::direct_from_pubkey(h.wallet.get_public_key());
    let commitment = Commitment::new(
        CommitmentKind::Transfer,
        "c1g",
        Some("c1s".to_owned()),
        own_direct,
        "77",
    );
    let payload = json!({
        "source_token": {
            "genesis": {"tokenId": "c1g", "data": {"coins": [["cafe", "15"]]}},
            "state": {"hash": "c1s"},
            "transactions": []
        },
        "commitment_data": serde_json::to_value(&commitment).unwrap(),
    });

    let local_id = h
        .wallet
        .handle_incoming_transfer(IncomingTokenTransfer {
            sender: pubkey(5),
            payload,
            received_at: get_current_time_in_millis(),
        })
        .await
        .unwrap()
        .unwrap();

    let tokens = h.wallet.get_tokens().await;
    assert_eq!(
        tokens.iter().find(|t| t.local_id == local_id).unwrap().status,
        TokenStatus::Submitted
    );

    // the proof shows up; the next poll tick finalizes
    h.oracle.expose(&commitment.request_id);
    let mut confirmed = false;
    for _ in 0..40 {
        sleep(Duration::from_millis(200)).await;
        let tokens = h.wallet.get_tokens().await;
        if tokens
            .iter()
            .any(|t| t.local_id == local_id && t.status == TokenStatus::Confirmed)
        {
            confirmed = true;
            break;
        }
    }
    assert!(confirmed, "token never confirmed through the poller");

    let received: Vec<_> = h
        .wallet
        .get_history()
        .await
        .into_iter()
        .filter(|e| e.get_entry().kind() == "RECEIVED")
        .collect();
    assert_eq!(received.len(), 1);
}

// P5: a failed send restores marked tokens and clears the outbox

#[tokio::test]
async fn test_failed_send_rolls_back() {
    let h = harness().await;
    register_alice(&h.transport);

    let local_id = h
        .wallet
        .import_token(coin_blob("t1g", "t1s", 50))
        .await
        .unwrap()
        .unwrap();

    h.transport.fail_sends.store(true, Ordering::SeqCst);
    let err = h
        .wallet
        .send(send_request(50, "@alice", TransferMode::Conservative))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("transport unavailable"));

    let tokens = h.wallet.get_tokens().await;
    let token = tokens.iter().find(|t| t.local_id == local_id).unwrap();
    assert_eq!(token.status, TokenStatus::Confirmed);
    assert!(h.wallet.get_outbox().await.is_empty());
    assert!(sent_entries(&h.wallet.get_history().await).is_empty());
}

// Insufficient funds fails before anything is marked

#[tokio::test]
async fn test_insufficient_funds() {
    let h = harness().await;
    register_alice(&h.transport);

    h.wallet
        .import_token(coin_blob("t1g", "t1s", 10))
        .await
        .unwrap();

    let err = h
        .wallet
        .send(send_request(50, "@alice", TransferMode::Conservative))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        sphere_wallet::error::WalletError::InsufficientFunds { .. }
    ));
    assert!(h.wallet.get_outbox().await.is_empty());
}

// R3 and merge-driven tombstone enforcement through sync

#[tokio::test]
async fn test_sync_merge_and_idempotence() {
    let provider = MockTokenProvider::new("mock-store");
    let providers: Vec<Arc<dyn TokenStorageProvider>> = vec![provider.clone()];
    let h = harness_with(MockOracle::new(true, Duration::ZERO), providers).await;

    let local_id = h
        .wallet
        .import_token(coin_blob("t1g", "t1s", 30))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(h.wallet.get_tokens().await.len(), 1);

    // remote knows this token was spent elsewhere
    let merged = serde_json::from_value::<TxfArchive>(json!({
        "_meta": {
            "version": 99,
            "address": h.wallet.get_address().to_string(),
            "format_version": 2,
            "updated_at": 0
        },
        "tokens": [],
        "_tombstones": [{"token_id": "t1g", "state_hash": "t1s", "timestamp_ms": 1}],
    }))
    .unwrap();
    provider.set_merged(merged);

    let summary = h.wallet.sync().await.unwrap();
    assert!(summary.added >= 1);
    let tokens = h.wallet.get_tokens().await;
    assert!(tokens.iter().all(|t| t.local_id != local_id));

    // spent state cannot come back
    assert_eq!(
        h.wallet.import_token(coin_blob("t1g", "t1s", 30)).await.unwrap(),
        None
    );

    // second sync with an empty delta reports nothing
    let summary = h.wallet.sync().await.unwrap();
    assert_eq!(summary.added, 0);
    assert_eq!(summary.removed, 0);
}

// Payment request resolves when the peer responds

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_payment_request_response() {
    let h = harness().await;
    h.transport.register_peer(
        "@bob",
        PeerInfo {
            pubkey: pubkey(6),
            direct_address: None,
            nametag: Some("bob".to_owned()),
        },
    );

    let transport = h.transport.clone();
    let responder = tokio::spawn(async move {
        loop {
            let request = transport.requests_sent.lock().unwrap().first().cloned();
            if let Some(request) = request {
                let _ = transport.responses.send(PaymentRequestResponse {
                    request_id: request.request_id,
                    status: PaymentRequestStatus::Accepted,
                    memo: None,
                });
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
    });

    let response = h
        .wallet
        .request_payment("@bob", "cafe", U256::from(5u64), None)
        .await
        .unwrap();
    assert_eq!(response.status, PaymentRequestStatus::Accepted);
    responder.await.unwrap();
}

// A PROXY transfer needs a matching local nametag; without one the
// token is rejected outright

#[tokio::test]
async fn test_receive_proxy_transfer_requires_matching_nametag() {
    let h = harness().await;

    let proxy = Address::proxy_from_nametag("carol");
    let commitment = Commitment::new(
        CommitmentKind::Transfer,
        "p1g",
        Some("p1s".to_owned()),
        proxy,
        "cc",
    );
    let payload = json!({
        "source_token": {
            "genesis": {"tokenId": "p1g", "data": {"coins": [["cafe", "40"]]}},
            "state": {"hash": "p1s"},
            "transactions": []
        },
        "transfer_tx": {
            "commitment": serde_json::to_value(&commitment).unwrap(),
            "inclusionProof": {"anchored": true},
        },
    });
    let incoming = |payload: Value| IncomingTokenTransfer {
        sender: pubkey(7),
        payload,
        received_at: get_current_time_in_millis(),
    };

    let err = h
        .wallet
        .handle_incoming_transfer(incoming(payload.clone()))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        sphere_wallet::error::WalletError::NametagMissing(_)
    ));
    assert!(h.wallet.get_tokens().await.is_empty());

    // with the nametag minted, the same envelope finalizes
    h.wallet.register_nametag("carol").await.unwrap();
    let local_id = h
        .wallet
        .handle_incoming_transfer(incoming(payload))
        .await
        .unwrap()
        .unwrap();
    let tokens = h.wallet.get_tokens().await;
    let token = tokens.iter().find(|t| t.local_id == local_id).unwrap();
    assert_eq!(token.status, TokenStatus::Confirmed);
    assert_eq!(token.amount, U256::from(40u64));

    // the name is taken now
    assert!(matches!(
        h.wallet.register_nametag("carol").await,
        Err(sphere_wallet::error::WalletError::NametagTaken(_))
    ));
}

// Destroyed wallets refuse operations

#[tokio::test]
async fn test_destroy_blocks_operations() {
    let h = harness().await;
    h.wallet.destroy().await;

    assert_eq!(h.wallet.get_tokens().await.len(), 0);
    let err = h
        .wallet
        .import_token(coin_blob("t1g", "t1s", 10))
        .await
        .unwrap_err();
    assert!(matches!(err, sphere_wallet::error::WalletError::Destroyed));
}

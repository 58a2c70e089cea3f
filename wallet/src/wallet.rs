use crate::{
    config::PAYMENT_REQUEST_TIMEOUT,
    entry::{EntryData, TransactionEntry},
    error::WalletError,
    poller::{ProofEvent, ProofPoller},
    providers::{OracleProvider, StorageProvider, TokenStorageProvider, TransportProvider},
    storage::{OutboxEntry, Repository},
    sync::SyncSummary,
};
use futures::future::join_all;
use indexmap::IndexMap;
use log::{debug, trace, warn};
use primitive_types::U256;
use rand::RngCore;
use serde::Serialize;
use serde_json::json;
use sphere_common::{
    api::{
        txf::NametagToken, Address, PaymentRequestEnvelope, PaymentRequestResponse,
        PaymentRequestStatus,
    },
    crypto::{hash, PublicKey},
    time::get_current_time_in_millis,
    token::{Token, TokenBlob, TokenStatus},
    utils::serde_amount,
};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use tokio::{
    sync::{broadcast, mpsc, oneshot, Mutex},
    task::JoinHandle,
    time::timeout,
};

// Wallet must be behind an Arc so background tasks can reach it
pub type SharedWallet = Arc<Wallet>;

const EVENT_CHANNEL_CAPACITY: usize = 256;

// Observable side effects of the wallet core
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WalletEvent {
    TransferConfirmed {
        transfer_id: String,
        coin_id: String,
        #[serde(with = "serde_amount")]
        amount: U256,
        recipient_nametag: Option<String>,
    },
    TransferFailed {
        transfer_id: String,
        message: String,
    },
    TransferIncoming {
        local_id: String,
        coin_id: String,
        #[serde(with = "serde_amount")]
        amount: U256,
    },
    PaymentRequestIncoming {
        request_id: String,
        coin_id: String,
        #[serde(with = "serde_amount")]
        amount: U256,
        requester: String,
    },
    PaymentRequestResponded {
        request_id: String,
        status: PaymentRequestStatus,
    },
    SyncStarted,
    SyncCompleted {
        added: u32,
        removed: u32,
        conflicts: u32,
    },
    SyncProvider {
        provider: String,
        success: bool,
        added: u32,
        removed: u32,
        conflicts: u32,
    },
    SyncRemoteUpdate {
        provider: String,
    },
    SyncError {
        message: String,
    },
    NametagRegistered {
        name: String,
    },
}

impl WalletEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TransferConfirmed { .. } => "transfer:confirmed",
            Self::TransferFailed { .. } => "transfer:failed",
            Self::TransferIncoming { .. } => "transfer:incoming",
            Self::PaymentRequestIncoming { .. } => "payment_request:incoming",
            Self::PaymentRequestResponded { status, .. } => match status {
                PaymentRequestStatus::Accepted => "payment_request:accepted",
                PaymentRequestStatus::Rejected => "payment_request:rejected",
                PaymentRequestStatus::Paid => "payment_request:paid",
                PaymentRequestStatus::Expired => "payment_request:response",
            },
            Self::SyncStarted => "sync:started",
            Self::SyncCompleted { .. } => "sync:completed",
            Self::SyncProvider { .. } => "sync:provider",
            Self::SyncRemoteUpdate { .. } => "sync:remote-update",
            Self::SyncError { .. } => "sync:error",
            Self::NametagRegistered { .. } => "nametag:registered",
        }
    }
}

pub struct Wallet {
    // The wallet's signing key, also its transport identity
    pub(crate) pubkey: PublicKey,
    pub(crate) address: Address,
    pub(crate) oracle: Arc<dyn OracleProvider>,
    pub(crate) transport: Arc<dyn TransportProvider>,
    // Primary storage every mutation persists through
    pub(crate) primary: Arc<dyn StorageProvider>,
    pub(crate) token_providers: Vec<Arc<dyn TokenStorageProvider>>,
    pub(crate) repository: Mutex<Repository>,
    pub(crate) poller: Arc<ProofPoller>,
    // Taken by the proof event loop on load
    proof_events: Mutex<Option<mpsc::UnboundedReceiver<ProofEvent>>>,
    event_sender: broadcast::Sender<WalletEvent>,
    // Joinable background operations (instant splits, fire-and-forget
    // submissions); wait_for_pending_operations drains this
    pending_tasks: Mutex<Vec<JoinHandle<()>>>,
    // Long-lived subscription loops, aborted on destroy
    service_tasks: Mutex<Vec<JoinHandle<()>>>,
    // Outstanding payment-request resolvers keyed by request id
    pending_payments: Mutex<IndexMap<String, oneshot::Sender<PaymentRequestResponse>>>,
    outgoing_requests: Mutex<IndexMap<String, PaymentRequestStatus>>,
    pub(crate) sync_inflight: Mutex<Option<broadcast::Sender<Result<SyncSummary, String>>>>,
    pub(crate) sync_generation: AtomicU64,
    destroyed: AtomicBool,
}

impl Wallet {
    pub fn new(
        pubkey: PublicKey,
        oracle: Arc<dyn OracleProvider>,
        transport: Arc<dyn TransportProvider>,
        primary: Arc<dyn StorageProvider>,
        token_providers: Vec<Arc<dyn TokenStorageProvider>>,
    ) -> SharedWallet {
        let address = Address::direct_from_pubkey(&pubkey);
        let (proof_sender, proof_receiver) = mpsc::unbounded_channel();
        let (event_sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let poller = ProofPoller::new(Arc::clone(&oracle), proof_sender);

        Arc::new(Self {
            pubkey,
            address: address.clone(),
            oracle,
            transport,
            primary,
            token_providers,
            repository: Mutex::new(Repository::new(address.to_string())),
            poller,
            proof_events: Mutex::new(Some(proof_receiver)),
            event_sender,
            pending_tasks: Mutex::new(Vec::new()),
            service_tasks: Mutex::new(Vec::new()),
            pending_payments: Mutex::new(IndexMap::new()),
            outgoing_requests: Mutex::new(IndexMap::new()),
            sync_inflight: Mutex::new(None),
            sync_generation: AtomicU64::new(0),
            destroyed: AtomicBool::new(false),
        })
    }

    // Restore persisted state and start the service loops
    pub async fn load(self: &Arc<Self>) -> Result<(), WalletError> {
        self.ensure_active()?;
        {
            let mut repo = self.repository.lock().await;
            *repo = Repository::load(&*self.primary, self.address.to_string()).await?;
            debug!(
                "loaded {} tokens, {} history entries",
                repo.token_count(),
                repo.history_len()
            );
        }

        self.start_service_loops().await;

        // Unconfirmed tokens resolve lazily, fire-and-forget
        let zelf = Arc::clone(self);
        self.track_task(tokio::spawn(async move {
            if let Err(e) = zelf.resolve_unconfirmed().await {
                debug!("initial finalization pass failed: {}", e);
            }
        }))
        .await;
        Ok(())
    }

    async fn start_service_loops(self: &Arc<Self>) {
        let mut service = self.service_tasks.lock().await;

        if let Some(mut events) = self.proof_events.lock().await.take() {
            let zelf = Arc::clone(self);
            service.push(tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    zelf.handle_proof_event(event).await;
                }
            }));
        }

        let mut transfers = self.transport.on_token_transfer().await;
        let zelf = Arc::clone(self);
        service.push(tokio::spawn(async move {
            loop {
                match transfers.recv().await {
                    Ok(incoming) => {
                        if let Err(e) = zelf.handle_incoming_transfer(incoming).await {
                            warn!("failed to process incoming transfer: {}", e);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("transfer subscription lagged by {} envelopes", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        let mut requests = self.transport.on_payment_request().await;
        let zelf = Arc::clone(self);
        service.push(tokio::spawn(async move {
            loop {
                match requests.recv().await {
                    Ok(incoming) => {
                        zelf.propagate_event(WalletEvent::PaymentRequestIncoming {
                            request_id: incoming.request.request_id.clone(),
                            coin_id: incoming.request.coin_id.clone(),
                            amount: incoming.request.amount,
                            requester: incoming.sender.to_hex(),
                        });
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        let mut responses = self.transport.on_payment_request_response().await;
        let zelf = Arc::clone(self);
        service.push(tokio::spawn(async move {
            loop {
                match responses.recv().await {
                    Ok(response) => zelf.handle_payment_response(response).await,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        for provider in &self.token_providers {
            if let Some(mut events) = provider.subscribe_events().await {
                let zelf = Arc::clone(self);
                service.push(tokio::spawn(async move {
                    loop {
                        match events.recv().await {
                            Ok(event) => {
                                zelf.propagate_event(WalletEvent::SyncRemoteUpdate {
                                    provider: event.provider,
                                });
                                zelf.schedule_debounced_sync();
                            }
                            Err(broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }));
            }
        }
    }

    // Accessors

    pub fn get_public_key(&self) -> &PublicKey {
        &self.pubkey
    }

    pub fn get_address(&self) -> &Address {
        &self.address
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<WalletEvent> {
        self.event_sender.subscribe()
    }

    pub(crate) fn propagate_event(&self, event: WalletEvent) {
        trace!("event {}", event.kind());
        // No subscribers is not an error
        let _ = self.event_sender.send(event);
    }

    pub(crate) fn ensure_active(&self) -> Result<(), WalletError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(WalletError::Destroyed);
        }
        Ok(())
    }

    pub(crate) async fn track_task(&self, handle: JoinHandle<()>) {
        self.pending_tasks.lock().await.push(handle);
    }

    // Join every tracked background operation (instant-split executors,
    // fire-and-forget submissions, debounced syncs)
    pub async fn wait_for_pending_operations(&self) {
        loop {
            let drained: Vec<JoinHandle<()>> = {
                let mut tasks = self.pending_tasks.lock().await;
                tasks.drain(..).collect()
            };
            if drained.is_empty() {
                break;
            }
            // Joined tasks may have tracked further work, so drain again
            for result in join_all(drained).await {
                if let Err(e) = result {
                    if !e.is_cancelled() {
                        warn!("background task failed: {}", e);
                    }
                }
            }
        }
    }

    // Queries

    pub async fn get_balance(&self, coin_id: &str) -> U256 {
        self.repository.lock().await.balance(coin_id)
    }

    pub async fn get_tokens(&self) -> Vec<Token> {
        self.repository.lock().await.get_tokens()
    }

    pub async fn get_history(&self) -> Vec<TransactionEntry> {
        self.repository.lock().await.history_newest_first()
    }

    pub async fn get_outbox(&self) -> Vec<OutboxEntry> {
        self.repository.lock().await.get_outbox().to_vec()
    }

    pub async fn get_pending_count(&self) -> usize {
        self.repository
            .lock()
            .await
            .pending_finalization_tokens()
            .len()
    }

    // Receive a token handed over out of band (file, QR, clipboard)
    pub async fn import_token(&self, blob: TokenBlob) -> Result<Option<String>, WalletError> {
        self.ensure_active()?;
        let token = Token::from_blob(blob, TokenStatus::Confirmed, get_current_time_in_millis())
            .ok_or_else(|| WalletError::TokenRejected("unparseable token".into()))?;
        let local_id = token.local_id.clone();

        let mut repo = self.repository.lock().await;
        if !repo.add_token(token, false) {
            return Ok(None);
        }
        repo.save(&*self.primary).await?;
        Ok(Some(local_id))
    }

    // Drain envelopes queued at the transport while the wallet was
    // offline, feeding each through the receive pipeline
    pub async fn fetch_pending_envelopes(self: &Arc<Self>) -> Result<usize, WalletError> {
        self.ensure_active()?;
        let events = self
            .transport
            .fetch_pending_events()
            .await
            .map_err(WalletError::Any)?;

        let mut processed = 0;
        for incoming in events {
            match self.handle_incoming_transfer(incoming).await {
                Ok(Some(_)) => processed += 1,
                Ok(None) => {}
                Err(e) => warn!("failed to process queued envelope: {}", e),
            }
        }
        Ok(processed)
    }

    // Nametags

    // Mint an identity token binding a human-readable name to this
    // wallet and store it for proxy-address resolution
    pub async fn register_nametag(&self, name: &str) -> Result<Address, WalletError> {
        self.ensure_active()?;
        let normalized = name.trim().trim_start_matches('@').to_lowercase();
        if normalized.is_empty() {
            return Err(WalletError::Any(anyhow::anyhow!("nametag cannot be empty")));
        }

        let now = get_current_time_in_millis();
        let token_id = hash(format!("nametag:{}", normalized).as_bytes()).to_hex();
        let state_hash = hash(self.pubkey.as_bytes()).to_hex();
        let blob = TokenBlob::Structured(json!({
            "nametag": normalized,
            "genesis": {"tokenId": token_id},
            "state": {"hash": state_hash},
        }));
        let nametag = NametagToken {
            name: normalized.clone(),
            token: blob,
            minted_at: now,
        };
        let proxy = nametag.proxy_address();

        let mut repo = self.repository.lock().await;
        if repo.get_nametag(&normalized).is_some() {
            return Err(WalletError::NametagTaken(normalized));
        }
        repo.add_nametag(nametag);
        repo.push_history(TransactionEntry::new(
            EntryData::Mint {
                coin_id: "nametag".to_owned(),
                amount: U256::zero(),
                reference: normalized.clone(),
            },
            now,
        ));
        repo.save(&*self.primary).await?;
        drop(repo);

        self.propagate_event(WalletEvent::NametagRegistered { name: normalized });
        Ok(proxy)
    }

    pub async fn get_nametags(&self) -> Vec<NametagToken> {
        self.repository
            .lock()
            .await
            .get_nametags()
            .values()
            .cloned()
            .collect()
    }

    // Payment requests

    // Send a payment request and wait for the peer's response. The
    // request expires after the configured timeout.
    pub async fn request_payment(
        &self,
        recipient: &str,
        coin_id: &str,
        amount: U256,
        memo: Option<String>,
    ) -> Result<PaymentRequestResponse, WalletError> {
        self.ensure_active()?;
        let peer = self
            .transport
            .resolve(recipient)
            .await
            .map_err(WalletError::Any)?
            .ok_or_else(|| WalletError::RecipientNotFound(recipient.to_owned()))?;

        let request_id = generate_request_id();
        let envelope = PaymentRequestEnvelope {
            request_id: request_id.clone(),
            coin_id: coin_id.to_owned(),
            amount,
            memo,
            requester_pubkey: self.pubkey.clone(),
            created_at: get_current_time_in_millis(),
        };

        let (sender, receiver) = oneshot::channel();
        self.pending_payments
            .lock()
            .await
            .insert(request_id.clone(), sender);

        if let Err(e) = self
            .transport
            .send_payment_request(&peer.pubkey, &envelope)
            .await
        {
            self.pending_payments.lock().await.shift_remove(&request_id);
            return Err(WalletError::Any(e));
        }

        match timeout(PAYMENT_REQUEST_TIMEOUT, receiver).await {
            Ok(Ok(response)) => Ok(response),
            // The resolver was rejected by destroy
            Ok(Err(_)) => Err(WalletError::Destroyed),
            Err(_) => {
                self.pending_payments.lock().await.shift_remove(&request_id);
                self.outgoing_requests
                    .lock()
                    .await
                    .insert(request_id.clone(), PaymentRequestStatus::Expired);
                self.propagate_event(WalletEvent::PaymentRequestResponded {
                    request_id,
                    status: PaymentRequestStatus::Expired,
                });
                Err(WalletError::PaymentRequestTimeout)
            }
        }
    }

    pub async fn respond_payment_request(
        &self,
        requester: &PublicKey,
        request_id: &str,
        status: PaymentRequestStatus,
        memo: Option<String>,
    ) -> Result<(), WalletError> {
        self.ensure_active()?;
        let response = PaymentRequestResponse {
            request_id: request_id.to_owned(),
            status,
            memo,
        };
        self.transport
            .send_payment_request_response(requester, &response)
            .await
            .map_err(WalletError::Any)
    }

    pub(crate) async fn handle_payment_response(&self, response: PaymentRequestResponse) {
        let resolver = self
            .pending_payments
            .lock()
            .await
            .shift_remove(&response.request_id);
        self.outgoing_requests
            .lock()
            .await
            .insert(response.request_id.clone(), response.status);
        self.propagate_event(WalletEvent::PaymentRequestResponded {
            request_id: response.request_id.clone(),
            status: response.status,
        });
        if let Some(sender) = resolver {
            let _ = sender.send(response);
        }
    }

    pub async fn get_payment_request_status(
        &self,
        request_id: &str,
    ) -> Option<PaymentRequestStatus> {
        self.outgoing_requests.lock().await.get(request_id).copied()
    }

    // Cancel everything and flush storage. Outstanding payment-request
    // resolvers reject with a destroyed error.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("destroying wallet");

        self.poller.stop().await;
        for handle in self.service_tasks.lock().await.drain(..) {
            handle.abort();
        }
        for handle in self.pending_tasks.lock().await.drain(..) {
            handle.abort();
        }
        self.pending_payments.lock().await.clear();

        if let Err(e) = self.primary.flush().await {
            warn!("storage flush on destroy failed: {}", e);
        }
    }
}

fn generate_request_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("req_{}", hex::encode(bytes))
}

// Send-side orchestration: recipient resolution, commitment building,
// the conservative and instant transfer flows, and the split executors.

use crate::{
    entry::{EntryData, TransactionEntry},
    error::WalletError,
    split::{plan_split, SplitPlan, SplitTarget},
    storage::OutboxEntry,
    wallet::{Wallet, WalletEvent},
};
use log::{debug, trace, warn};
use primitive_types::U256;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sphere_common::{
    api::{
        predicate_state, recipient_predicate, Address, Commitment, CommitmentKind,
        SplitBundleV5, TransferEnvelope, TransferTransaction, SPLIT_BUNDLE_TYPE,
        SPLIT_BUNDLE_VERSION_V5,
    },
    crypto::{hash, PublicKey},
    time::get_current_time_in_millis,
    token::{Token, TokenBlob, TokenStatus},
    utils::serde_amount,
};
use std::{str::FromStr, sync::Arc};
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    Conservative,
    Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressMode {
    Auto,
    Direct,
    Proxy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendRequest {
    pub coin_id: String,
    #[serde(with = "serde_amount")]
    pub amount: U256,
    pub recipient: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
    pub transfer_mode: TransferMode,
    pub address_mode: AddressMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Submitted,
    Confirmed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferResult {
    pub transfer_id: String,
    pub status: TransferStatus,
    pub coin_id: String,
    #[serde(with = "serde_amount")]
    pub amount: U256,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient_nametag: Option<String>,
    // Local ids of the tokens involved in this send
    pub local_ids: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ResolvedRecipient {
    pub pubkey: PublicKey,
    pub address: Address,
    pub nametag: Option<String>,
}

pub fn generate_transfer_id() -> String {
    let mut bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("tr_{}", hex::encode(bytes))
}

fn random_salt() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

// Build the transfer commitment spending a token to a recipient address
pub(crate) fn build_transfer_commitment(
    token: &Token,
    recipient: &Address,
) -> Result<Commitment, WalletError> {
    let (token_id, state_hash) = token
        .key_pair()
        .ok_or_else(|| WalletError::TokenRejected(format!(
            "token {} has no extractable identity",
            token.local_id
        )))?;
    Ok(Commitment::new(
        CommitmentKind::Transfer,
        token_id,
        Some(state_hash),
        recipient.clone(),
        random_salt(),
    ))
}

impl Wallet {
    // Resolve the recipient string into a transport key, a targeting
    // address and an optional nametag. One transport query at most.
    pub(crate) async fn resolve_recipient(
        &self,
        request: &SendRequest,
    ) -> Result<ResolvedRecipient, WalletError> {
        let raw = request.recipient.trim();

        // Explicit direct/proxy prefix is parsed directly
        if let Ok(address) = Address::from_str(raw) {
            let peer = self
                .transport
                .resolve(raw)
                .await
                .map_err(WalletError::Any)?
                .ok_or_else(|| WalletError::RecipientNotFound(raw.to_owned()))?;
            return Ok(ResolvedRecipient {
                pubkey: peer.pubkey,
                address,
                nametag: peer.nametag,
            });
        }

        let (explicit_nametag, peer) = if let Some(name) = raw.strip_prefix('@') {
            let peer = self
                .transport
                .resolve(raw)
                .await
                .map_err(WalletError::Any)?
                .ok_or_else(|| WalletError::RecipientNotFound(raw.to_owned()))?;
            (Some(name.to_owned()), peer)
        } else if PublicKey::is_valid_hex(raw) {
            let pubkey = PublicKey::from_str(raw)
                .map_err(|_| WalletError::RecipientNotFound(raw.to_owned()))?;
            // A bare public key needs no transport lookup
            let direct = Address::direct_from_pubkey(&pubkey);
            (
                None,
                sphere_common::api::PeerInfo {
                    pubkey,
                    direct_address: Some(direct),
                    nametag: None,
                },
            )
        } else {
            let peer = self
                .transport
                .resolve(raw)
                .await
                .map_err(WalletError::Any)?
                .ok_or_else(|| WalletError::RecipientNotFound(raw.to_owned()))?;
            (None, peer)
        };

        let nametag = explicit_nametag.or_else(|| peer.nametag.clone());
        let address = match request.address_mode {
            AddressMode::Proxy => {
                let name = nametag
                    .as_deref()
                    .ok_or_else(|| WalletError::NametagMissing(raw.to_owned()))?;
                Address::proxy_from_nametag(name)
            }
            AddressMode::Direct => peer
                .direct_address
                .clone()
                .ok_or(WalletError::NoDirectAddress)?,
            AddressMode::Auto => match peer.direct_address.clone() {
                Some(direct) => direct,
                // Legacy fallback: proxy through the nametag
                None => match nametag.as_deref() {
                    Some(name) => Address::proxy_from_nametag(name),
                    None => Address::direct_from_pubkey(&peer.pubkey),
                },
            },
        };

        Ok(ResolvedRecipient {
            pubkey: peer.pubkey,
            address,
            nametag,
        })
    }

    // Execute a transfer request end to end
    pub async fn send(self: &Arc<Self>, request: SendRequest) -> Result<TransferResult, WalletError> {
        self.ensure_active()?;
        let recipient = self.resolve_recipient(&request).await?;
        let transfer_id = generate_transfer_id();
        debug!(
            "send {} of {} to {} ({:?})",
            request.amount, request.coin_id, request.recipient, request.transfer_mode
        );

        // Plan and mark tokens transferring before the first suspension,
        // so a concurrent send cannot double-allocate them
        let plan = {
            let mut repo = self.repository.lock().await;
            let tokens = repo.get_tokens();
            let plan = plan_split(&tokens, request.amount, &request.coin_id).ok_or_else(|| {
                WalletError::InsufficientFunds {
                    need: request.amount,
                    have: repo.balance(&request.coin_id),
                }
            })?;

            let now = get_current_time_in_millis();
            for local_id in plan.local_ids() {
                if let Some(token) = repo.get_token_mut(&local_id) {
                    token.status = TokenStatus::Transferring;
                    token.touch(now);
                }
            }

            let result = TransferResult {
                transfer_id: transfer_id.clone(),
                status: TransferStatus::Submitted,
                coin_id: request.coin_id.clone(),
                amount: request.amount,
                recipient_nametag: recipient.nametag.clone(),
                local_ids: plan.local_ids(),
            };
            repo.add_outbox(OutboxEntry::new(result, recipient.pubkey.clone(), now));
            if let Err(e) = repo.save(&*self.primary).await {
                for local_id in plan.local_ids() {
                    if let Some(token) = repo.get_token_mut(&local_id) {
                        token.status = TokenStatus::Confirmed;
                    }
                }
                repo.remove_outbox(&transfer_id);
                return Err(e);
            }
            plan
        };

        match self.execute_transfer(&request, &recipient, &plan).await {
            Ok(()) => {
                let mut repo = self.repository.lock().await;
                repo.remove_outbox(&transfer_id);
                repo.push_history(TransactionEntry::new(
                    EntryData::Sent {
                        coin_id: request.coin_id.clone(),
                        amount: request.amount,
                        recipient_nametag: recipient.nametag.clone(),
                        recipient: Some(recipient.pubkey.to_hex()),
                        transfer_id: transfer_id.clone(),
                    },
                    get_current_time_in_millis(),
                ));
                repo.save(&*self.primary).await?;
                drop(repo);

                self.propagate_event(WalletEvent::TransferConfirmed {
                    transfer_id: transfer_id.clone(),
                    coin_id: request.coin_id.clone(),
                    amount: request.amount,
                    recipient_nametag: recipient.nametag.clone(),
                });

                Ok(TransferResult {
                    transfer_id,
                    status: TransferStatus::Confirmed,
                    coin_id: request.coin_id,
                    amount: request.amount,
                    recipient_nametag: recipient.nametag,
                    local_ids: plan.local_ids(),
                })
            }
            Err(e) => {
                warn!("transfer {} failed: {}", transfer_id, e);
                let mut repo = self.repository.lock().await;
                // Restore every still-marked token; tokens already
                // dispatched and removed stay removed
                let now = get_current_time_in_millis();
                for local_id in plan.local_ids() {
                    if let Some(token) = repo.get_token_mut(&local_id) {
                        if token.status == TokenStatus::Transferring {
                            token.status = TokenStatus::Confirmed;
                            token.touch(now);
                        }
                    }
                }
                repo.remove_outbox(&transfer_id);
                if let Err(save_err) = repo.save(&*self.primary).await {
                    warn!("rollback save failed: {}", save_err);
                }
                drop(repo);

                self.propagate_event(WalletEvent::TransferFailed {
                    transfer_id,
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn execute_transfer(
        self: &Arc<Self>,
        request: &SendRequest,
        recipient: &ResolvedRecipient,
        plan: &SplitPlan,
    ) -> Result<(), WalletError> {
        for token in &plan.direct {
            self.send_direct(request, recipient, token).await?;
        }

        if let Some(split) = &plan.split {
            match request.transfer_mode {
                TransferMode::Conservative => {
                    self.execute_split(request, recipient, split).await?
                }
                TransferMode::Instant => {
                    self.execute_instant_split(request, recipient, split).await?
                }
            }
        }

        Ok(())
    }

    // Transfer one whole token to the recipient
    async fn send_direct(
        self: &Arc<Self>,
        request: &SendRequest,
        recipient: &ResolvedRecipient,
        token: &Token,
    ) -> Result<(), WalletError> {
        let commitment = build_transfer_commitment(token, &recipient.address)?;
        let source_token = token
            .payload
            .blob()
            .and_then(|blob| blob.as_value().map(|v| v.into_owned()))
            .ok_or_else(|| {
                WalletError::TokenRejected(format!("token {} has no blob", token.local_id))
            })?;
        let client = self.oracle.state_transition_client();

        match request.transfer_mode {
            TransferMode::Conservative => {
                // Submit, block for the proof, ship a finalized envelope
                let result = client
                    .submit_transfer_commitment(&commitment)
                    .await
                    .map_err(WalletError::Any)?;
                if !result.status.is_accepted() {
                    return Err(WalletError::SubmissionRejected(format!(
                        "{:?}",
                        result.status
                    )));
                }

                let proof = self
                    .oracle
                    .wait_for_proof(&commitment)
                    .await
                    .map_err(WalletError::Any)?;
                let transfer_tx = TransferTransaction {
                    commitment,
                    inclusion_proof: proof,
                };
                let envelope = TransferEnvelope {
                    source_token,
                    commitment_data: None,
                    transfer_tx: Some(serde_json::to_value(&transfer_tx)?),
                    memo: request.memo.clone(),
                };
                self.transport
                    .send_token_transfer(&recipient.pubkey, &serde_json::to_value(&envelope)?)
                    .await
                    .map_err(WalletError::Any)?;
            }
            TransferMode::Instant => {
                // Envelope first, aggregator submission fire-and-forget
                let envelope = TransferEnvelope {
                    source_token,
                    commitment_data: Some(commitment.clone()),
                    transfer_tx: None,
                    memo: request.memo.clone(),
                };
                self.transport
                    .send_token_transfer(&recipient.pubkey, &serde_json::to_value(&envelope)?)
                    .await
                    .map_err(WalletError::Any)?;

                let background = commitment.clone();
                self.track_task(tokio::spawn(async move {
                    if let Err(e) = client.submit_transfer_commitment(&background).await {
                        warn!(
                            "background submission of {} failed: {}",
                            background.request_id, e
                        );
                    }
                }))
                .await;
            }
        }

        // The dispatched token leaves the wallet, creating its tombstone
        let mut repo = self.repository.lock().await;
        repo.remove_token(&token.local_id, recipient.nametag.as_deref(), true);
        repo.save(&*self.primary).await?;
        Ok(())
    }

    // Conservative split: burn the original, mint change and recipient
    // tokens, collect every proof, ship a fully-finalized envelope
    async fn execute_split(
        self: &Arc<Self>,
        request: &SendRequest,
        recipient: &ResolvedRecipient,
        split: &SplitTarget,
    ) -> Result<(), WalletError> {
        let client = self.oracle.state_transition_client();
        let split_group_id = random_salt();
        let own_address = Address::direct_from_pubkey(&self.pubkey);

        let burn = self.burn_original(&split.token, &own_address).await?;

        // Sender change
        let change_token = {
            let (blob, _mint) = self
                .mint_token(
                    &burn,
                    "change",
                    &request.coin_id,
                    split.remainder_amount,
                    &own_address,
                    &recipient_predicate(&self.pubkey, &random_salt()),
                )
                .await?;
            Token::from_blob(blob, TokenStatus::Confirmed, get_current_time_in_millis())
                .ok_or_else(|| WalletError::TokenRejected("unparseable change token".into()))?
        };

        // Recipient token, minted then transferred with full proofs
        let transfer_salt = random_salt();
        let predicate = recipient_predicate(&recipient.pubkey, &transfer_salt);
        let (recipient_blob, _mint) = self
            .mint_token(
                &burn,
                "recipient",
                &request.coin_id,
                split.split_amount,
                &recipient.address,
                &predicate,
            )
            .await?;

        let recipient_token = Token::from_blob(
            recipient_blob.clone(),
            TokenStatus::Confirmed,
            get_current_time_in_millis(),
        )
        .ok_or_else(|| WalletError::TokenRejected("unparseable minted token".into()))?;
        let transfer_commitment = Commitment::new(
            CommitmentKind::Transfer,
            recipient_token.genesis_id().unwrap_or_default(),
            recipient_token.state_hash(),
            recipient.address.clone(),
            transfer_salt,
        );
        let result = client
            .submit_transfer_commitment(&transfer_commitment)
            .await
            .map_err(WalletError::Any)?;
        if !result.status.is_accepted() {
            return Err(WalletError::SubmissionRejected(format!("{:?}", result.status)));
        }
        let transfer_proof = self
            .oracle
            .wait_for_proof(&transfer_commitment)
            .await
            .map_err(WalletError::Any)?;
        let transfer_tx = TransferTransaction {
            commitment: transfer_commitment,
            inclusion_proof: transfer_proof,
        };

        // Save the change, send the envelope, remove the original
        {
            let mut repo = self.repository.lock().await;
            repo.add_token(change_token, true);
            repo.push_history(TransactionEntry::new(
                EntryData::Split {
                    coin_id: request.coin_id.clone(),
                    amount: split.token.amount,
                    token_id: split.token.genesis_id().unwrap_or_else(|| split_group_id.clone()),
                },
                get_current_time_in_millis(),
            ));
            repo.save(&*self.primary).await?;
        }

        let envelope = TransferEnvelope {
            source_token: recipient_blob
                .as_value()
                .map(|v| v.into_owned())
                .unwrap_or(Value::Null),
            commitment_data: None,
            transfer_tx: Some(serde_json::to_value(&transfer_tx)?),
            memo: request.memo.clone(),
        };
        self.transport
            .send_token_transfer(&recipient.pubkey, &serde_json::to_value(&envelope)?)
            .await
            .map_err(WalletError::Any)?;

        let mut repo = self.repository.lock().await;
        repo.remove_token(&split.token.local_id, recipient.nametag.as_deref(), true);
        repo.save(&*self.primary).await?;
        Ok(())
    }

    // Instant split: return once the burn proof exists. The V5 bundle
    // travels immediately; a background task obtains the change mint
    // proof and hands the change token back over a one-shot channel.
    async fn execute_instant_split(
        self: &Arc<Self>,
        request: &SendRequest,
        recipient: &ResolvedRecipient,
        split: &SplitTarget,
    ) -> Result<(), WalletError> {
        let split_group_id = random_salt();
        let own_address = Address::direct_from_pubkey(&self.pubkey);

        let burn = self.burn_original(&split.token, &own_address).await?;

        // Recipient mint and transfer commitments; the recipient drives
        // both through its own finalization state machine
        let recipient_token_id = hash(format!("{}:recipient", burn.commitment.request_id).as_bytes()).to_hex();
        let mint_salt = random_salt();
        let mint_commitment = Commitment::new(
            CommitmentKind::Mint,
            recipient_token_id.clone(),
            None,
            recipient.address.clone(),
            mint_salt,
        );
        let transfer_salt = random_salt();
        let predicate = recipient_predicate(&recipient.pubkey, &transfer_salt);
        let minted_token_state = predicate_state(&predicate);
        let minted_state_hash = minted_token_state
            .get("hash")
            .and_then(|h| h.as_str())
            .map(|h| h.to_owned());
        let transfer_commitment = Commitment::new(
            CommitmentKind::Transfer,
            recipient_token_id.clone(),
            minted_state_hash,
            recipient.address.clone(),
            transfer_salt.clone(),
        );

        let nametag_token = match &recipient.address {
            Address::Proxy(_) => {
                let repo = self.repository.lock().await;
                repo.find_nametag_for_address(&recipient.address)
                    .and_then(|n| n.token.as_value().map(|v| v.into_owned()))
            }
            Address::Direct(_) => None,
        };

        let bundle = SplitBundleV5 {
            bundle_type: SPLIT_BUNDLE_TYPE.to_owned(),
            version: SPLIT_BUNDLE_VERSION_V5,
            split_group_id: split_group_id.clone(),
            coin_id: request.coin_id.clone(),
            amount: split.split_amount,
            recipient_mint_data: json!({
                "tokenId": recipient_token_id,
                "coins": [[request.coin_id, split.split_amount.to_string()]],
                "burnProof": burn.inclusion_proof.clone(),
            }),
            mint_commitment,
            transfer_commitment,
            transfer_salt_hex: transfer_salt,
            minted_token_state,
            token_type_hex: request.coin_id.clone(),
            recipient_address: recipient.address.clone(),
            nametag_token,
        };
        self.transport
            .send_token_transfer(&recipient.pubkey, &serde_json::to_value(&bundle)?)
            .await
            .map_err(WalletError::Any)?;

        // Background: mint the sender change, then notify through the
        // completion channel
        let (change_sender, change_receiver) = oneshot::channel::<Token>();
        let zelf = Arc::clone(self);
        let coin_id = request.coin_id.clone();
        let remainder = split.remainder_amount;
        let executor = tokio::spawn(async move {
            let own_address = Address::direct_from_pubkey(&zelf.pubkey);
            let predicate = recipient_predicate(&zelf.pubkey, &random_salt());
            match zelf
                .mint_token(&burn, "change", &coin_id, remainder, &own_address, &predicate)
                .await
            {
                Ok((blob, _)) => {
                    match Token::from_blob(blob, TokenStatus::Confirmed, get_current_time_in_millis())
                    {
                        Some(token) => {
                            let _ = change_sender.send(token);
                        }
                        None => warn!("minted change token is unparseable"),
                    }
                }
                Err(e) => warn!("background change mint failed: {}", e),
            }
        });

        let zelf = Arc::clone(self);
        let receiver = tokio::spawn(async move {
            if let Ok(change) = change_receiver.await {
                trace!("change token {} created", change.local_id);
                let mut repo = zelf.repository.lock().await;
                if repo.add_token(change, true) {
                    if let Err(e) = repo.save(&*zelf.primary).await {
                        warn!("saving change token failed: {}", e);
                    }
                }
            }
        });
        self.track_task(executor).await;
        self.track_task(receiver).await;

        // Local effects: split entry, original removed
        let mut repo = self.repository.lock().await;
        repo.push_history(TransactionEntry::new(
            EntryData::Split {
                coin_id: request.coin_id.clone(),
                amount: split.token.amount,
                token_id: split.token.genesis_id().unwrap_or(split_group_id),
            },
            get_current_time_in_millis(),
        ));
        repo.remove_token(&split.token.local_id, recipient.nametag.as_deref(), true);
        repo.save(&*self.primary).await?;
        Ok(())
    }

    // Burn the token being split and wait for the burn proof
    async fn burn_original(
        &self,
        token: &Token,
        own_address: &Address,
    ) -> Result<TransferTransaction, WalletError> {
        let (token_id, state_hash) = token.key_pair().ok_or_else(|| {
            WalletError::TokenRejected(format!(
                "token {} has no extractable identity",
                token.local_id
            ))
        })?;
        let burn = Commitment::new(
            CommitmentKind::Burn,
            token_id,
            Some(state_hash),
            own_address.clone(),
            random_salt(),
        );
        let client = self.oracle.state_transition_client();
        let result = client
            .submit_transfer_commitment(&burn)
            .await
            .map_err(WalletError::Any)?;
        if !result.status.is_accepted() {
            return Err(WalletError::SubmissionRejected(format!("{:?}", result.status)));
        }
        let proof = self
            .oracle
            .wait_for_proof(&burn)
            .await
            .map_err(WalletError::Any)?;
        Ok(TransferTransaction {
            commitment: burn,
            inclusion_proof: proof,
        })
    }

    // Mint a new token out of a burn, returning its blob once the mint
    // proof is anchored
    async fn mint_token(
        &self,
        burn: &TransferTransaction,
        role: &str,
        coin_id: &str,
        amount: U256,
        owner: &Address,
        predicate: &Value,
    ) -> Result<(TokenBlob, Commitment), WalletError> {
        let token_id = hash(format!("{}:{}", burn.commitment.request_id, role).as_bytes()).to_hex();
        let mint = Commitment::new(
            CommitmentKind::Mint,
            token_id.clone(),
            None,
            owner.clone(),
            random_salt(),
        );

        let client = self.oracle.state_transition_client();
        let result = client
            .submit_mint_commitment(&mint)
            .await
            .map_err(WalletError::Any)?;
        if !result.status.is_accepted() {
            return Err(WalletError::SubmissionRejected(format!("{:?}", result.status)));
        }
        let proof = self
            .oracle
            .wait_for_proof(&mint)
            .await
            .map_err(WalletError::Any)?;

        let state = predicate_state(predicate);
        let blob = TokenBlob::Structured(json!({
            "genesis": {
                "tokenId": token_id,
                "data": {
                    "coins": [[coin_id, amount.to_string()]],
                    "burnRequestId": burn.commitment.request_id,
                }
            },
            "state": state,
            "transactions": [{
                "commitment": serde_json::to_value(&mint)?,
                "inclusionProof": proof,
            }],
        }));
        Ok((blob, mint))
    }
}

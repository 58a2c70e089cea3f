// Receive-side pipeline. Envelopes are classified strictly by payload
// shape, promoted to a canonical class when they arrive in a legacy or
// unknown inner format, validated, and entered into the repository.

use crate::{
    error::WalletError,
    poller::{ProofEvent, ProofOutcome},
    wallet::{Wallet, WalletEvent},
};
use log::{debug, trace, warn};
use serde_json::Value;
use sphere_common::{
    api::{
        predicate_state, recipient_predicate, Address, Commitment, IncomingTokenTransfer,
        SplitBundleV4, SplitBundleV5, TransferTransaction, SPLIT_BUNDLE_TYPE,
    },
    crypto::PublicKey,
    time::get_current_time_in_millis,
    token::{
        extract_genesis_id, extract_state_hash, registry_metadata, split_bundle_local_id,
        PendingFinalization, PendingStage, Token, TokenBlob, TokenPayload, TokenStatus,
    },
};
use std::sync::Arc;

// Canonical classification of an incoming envelope
#[derive(Debug)]
pub(crate) enum Classified {
    BundleV5(Box<SplitBundleV5>),
    BundleV4(Box<SplitBundleV4>),
    CommitmentOnly {
        source_token: Value,
        commitment: Commitment,
    },
    FullyProven {
        source_token: Value,
        transfer_tx: Value,
    },
}

// Classification is strictly by payload shape, in order: versioned split
// bundle, commitment-only, fully-proven. Alternative shapes (a bare
// commitment inside transfer_tx, a legacy serialized token) are promoted
// to one of the canonical classes.
pub(crate) fn classify_envelope(payload: &Value) -> Option<Classified> {
    if payload.get("type").and_then(|t| t.as_str()) == Some(SPLIT_BUNDLE_TYPE) {
        return match payload.get("version").and_then(|v| v.as_u64()) {
            Some(5) => match serde_json::from_value::<SplitBundleV5>(payload.clone()) {
                Ok(bundle) => Some(Classified::BundleV5(Box::new(bundle))),
                Err(e) => {
                    warn!("malformed V5 split bundle: {}", e);
                    None
                }
            },
            Some(4) => match serde_json::from_value::<SplitBundleV4>(payload.clone()) {
                Ok(bundle) => Some(Classified::BundleV4(Box::new(bundle))),
                Err(e) => {
                    warn!("malformed V4 split bundle: {}", e);
                    None
                }
            },
            other => {
                warn!("unsupported split bundle version {:?}", other);
                None
            }
        };
    }

    let Some(source_token) = payload.get("source_token") else {
        // Legacy shape: a bare serialized token under the old key
        if let Some(token) = payload.get("token") {
            trace!("promoting legacy token payload to fully-proven transfer");
            return Some(Classified::FullyProven {
                source_token: token.clone(),
                transfer_tx: Value::Null,
            });
        }
        return None;
    };

    if let Some(raw) = payload
        .get("commitment_data")
        .or_else(|| payload.get("commitment"))
    {
        match serde_json::from_value::<Commitment>(raw.clone()) {
            Ok(commitment) => {
                return Some(Classified::CommitmentOnly {
                    source_token: source_token.clone(),
                    commitment,
                })
            }
            Err(e) => {
                warn!("malformed commitment in envelope: {}", e);
                return None;
            }
        }
    }

    if let Some(tx) = payload.get("transfer_tx") {
        let has_proof = tx
            .get("inclusionProof")
            .map(|p| !p.is_null())
            .unwrap_or(false);
        if !has_proof {
            // Unknown inner format: the object is either a full
            // transaction missing its proof or the bare commitment
            // itself; both are handled as commitment-only
            let candidate = tx.get("commitment").unwrap_or(tx);
            if let Ok(commitment) = serde_json::from_value::<Commitment>(candidate.clone()) {
                trace!("promoting proofless transfer_tx to commitment-only transfer");
                return Some(Classified::CommitmentOnly {
                    source_token: source_token.clone(),
                    commitment,
                });
            }
        }
        return Some(Classified::FullyProven {
            source_token: source_token.clone(),
            transfer_tx: tx.clone(),
        });
    }

    None
}

impl Wallet {
    // Entry point for one envelope from the transport subscription.
    // Returns the local id of the token that was added, if any.
    pub async fn handle_incoming_transfer(
        self: &Arc<Self>,
        incoming: IncomingTokenTransfer,
    ) -> Result<Option<String>, WalletError> {
        self.ensure_active()?;
        let Some(classified) = classify_envelope(&incoming.payload) else {
            debug!("dropping envelope with unrecognized shape");
            return Ok(None);
        };

        match classified {
            Classified::BundleV5(bundle) => {
                self.receive_split_bundle_v5(*bundle, incoming.sender).await
            }
            Classified::BundleV4(bundle) => {
                // V4 carries a finalized recipient token and is processed
                // synchronously
                self.receive_fully_proven(bundle.recipient_token, bundle.transfer_tx)
                    .await
            }
            Classified::CommitmentOnly {
                source_token,
                commitment,
            } => self.receive_commitment_only(source_token, commitment).await,
            Classified::FullyProven {
                source_token,
                transfer_tx,
            } => self.receive_fully_proven(source_token, transfer_tx).await,
        }
    }

    // V5 bundles are saved unconfirmed; the finalization state machine
    // resolves them lazily
    async fn receive_split_bundle_v5(
        self: &Arc<Self>,
        bundle: SplitBundleV5,
        sender: PublicKey,
    ) -> Result<Option<String>, WalletError> {
        let local_id = split_bundle_local_id(&bundle.split_group_id);
        let now = get_current_time_in_millis();

        let metadata = registry_metadata(&bundle.coin_id);
        let (symbol, name, decimals, icon_url) = match metadata {
            Some(m) => (m.symbol, m.name, m.decimals, m.icon_url),
            None => {
                let label = sphere_common::token::fallback_coin_label(&bundle.coin_id);
                (
                    label.clone(),
                    label,
                    sphere_common::config::DEFAULT_COIN_DECIMALS,
                    None,
                )
            }
        };

        let token = Token {
            local_id: local_id.clone(),
            coin_id: bundle.coin_id.clone(),
            symbol,
            name,
            decimals,
            icon_url,
            amount: bundle.amount,
            status: TokenStatus::Submitted,
            created_at: now,
            updated_at: now,
            payload: TokenPayload::Pending(Box::new(PendingFinalization {
                stage: PendingStage::Received,
                bundle,
                sender_pubkey: sender,
                saved_at: now,
                attempt_count: 0,
                last_attempt_at: now,
                mint_proof: None,
            })),
        };
        let amount = token.amount;
        let coin_id = token.coin_id.clone();

        let mut repo = self.repository.lock().await;
        // History is appended when the bundle finalizes, not on arrival
        if !repo.add_token(token, true) {
            debug!("split bundle {} already known", local_id);
            return Ok(None);
        }
        repo.save(&*self.primary).await?;
        drop(repo);

        self.propagate_event(WalletEvent::TransferIncoming {
            local_id: local_id.clone(),
            coin_id,
            amount,
        });
        Ok(Some(local_id))
    }

    // A transfer whose proof does not exist yet: save as submitted,
    // re-submit the commitment (idempotent), poll for the proof
    async fn receive_commitment_only(
        self: &Arc<Self>,
        source_token: Value,
        commitment: Commitment,
    ) -> Result<Option<String>, WalletError> {
        let blob = TokenBlob::Structured(source_token);

        if let (Some(token_id), Some(state_hash)) =
            (extract_genesis_id(&blob), extract_state_hash(&blob))
        {
            let repo = self.repository.lock().await;
            if repo.is_tombstoned(&token_id, &state_hash) {
                warn!("incoming token ({}, {}) is tombstoned", token_id, state_hash);
                return Ok(None);
            }
        }

        let token = Token::from_blob(
            blob,
            TokenStatus::Submitted,
            get_current_time_in_millis(),
        )
        .ok_or_else(|| WalletError::TokenRejected("unparseable source token".into()))?;
        let local_id = token.local_id.clone();
        let coin_id = token.coin_id.clone();
        let amount = token.amount;

        let mut repo = self.repository.lock().await;
        if !repo.add_token(token, true) {
            return Ok(None);
        }
        repo.save(&*self.primary).await?;
        drop(repo);

        // Duplicate request ids are an accepted status
        let client = self.oracle.state_transition_client();
        match client.submit_transfer_commitment(&commitment).await {
            Ok(result) if !result.status.is_accepted() => {
                warn!(
                    "re-submission of {} rejected: {:?}",
                    commitment.request_id, result.status
                );
            }
            Err(e) => warn!("re-submission of {} failed: {}", commitment.request_id, e),
            Ok(_) => {}
        }

        self.poller.enqueue(local_id.clone(), commitment).await;
        self.propagate_event(WalletEvent::TransferIncoming {
            local_id: local_id.clone(),
            coin_id,
            amount,
        });
        Ok(Some(local_id))
    }

    // A transfer arriving with its inclusion proof: finalize locally,
    // validate with the oracle, insert as confirmed
    async fn receive_fully_proven(
        self: &Arc<Self>,
        source_token: Value,
        transfer_tx: Value,
    ) -> Result<Option<String>, WalletError> {
        let blob = TokenBlob::Structured(source_token);

        let finalized = if transfer_tx.is_null() {
            // Legacy bare token, already finalized by the sender
            blob
        } else {
            self.finalize_incoming(&blob, &transfer_tx).await?
        };

        let validity = self
            .oracle
            .validate_token(&finalized)
            .await
            .map_err(WalletError::Any)?;
        if !validity.valid || validity.spent {
            warn!(
                "dropping incoming token: valid={}, spent={}",
                validity.valid, validity.spent
            );
            return Ok(None);
        }

        let token = Token::from_blob(
            finalized,
            TokenStatus::Confirmed,
            get_current_time_in_millis(),
        )
        .ok_or_else(|| WalletError::TokenRejected("unparseable finalized token".into()))?;
        let local_id = token.local_id.clone();
        let coin_id = token.coin_id.clone();
        let amount = token.amount;

        let mut repo = self.repository.lock().await;
        if !repo.add_token(token, false) {
            return Ok(None);
        }
        repo.save(&*self.primary).await?;
        drop(repo);

        self.propagate_event(WalletEvent::TransferIncoming {
            local_id: local_id.clone(),
            coin_id,
            amount,
        });
        Ok(Some(local_id))
    }

    // Finalize a transfer for this wallet, detecting the address scheme
    // from the transaction's commitment
    pub(crate) async fn finalize_incoming(
        &self,
        source: &TokenBlob,
        transfer_tx: &Value,
    ) -> Result<TokenBlob, WalletError> {
        let commitment: Commitment = serde_json::from_value(
            transfer_tx
                .get("commitment")
                .cloned()
                .unwrap_or(Value::Null),
        )
        .map_err(|e| WalletError::TokenRejected(format!("transfer has no commitment: {}", e)))?;

        let trust_base = self
            .oracle
            .trust_base()
            .ok_or(WalletError::TrustBaseMissing)?;
        let client = self.oracle.state_transition_client();

        let predicate = recipient_predicate(&self.pubkey, &commitment.salt_hex);
        let recipient_state = predicate_state(&predicate);

        let witnesses: Vec<TokenBlob> = match &commitment.recipient {
            Address::Direct(_) => Vec::new(),
            Address::Proxy(_) => {
                let repo = self.repository.lock().await;
                // The matching nametag must resolve to the same proxy
                // address the transfer targets
                let nametag = repo
                    .find_nametag_for_address(&commitment.recipient)
                    .ok_or_else(|| {
                        WalletError::NametagMissing(commitment.recipient.to_string())
                    })?;
                vec![nametag.token.clone()]
            }
        };

        client
            .finalize(&trust_base, source, &recipient_state, transfer_tx, &witnesses)
            .await
            .map_err(|e| WalletError::TokenRejected(format!("finalize failed: {}", e)))
    }

    // Outcome of a background polling job for a commitment-only token
    pub(crate) async fn handle_proof_event(self: &Arc<Self>, event: ProofEvent) {
        match event.outcome {
            ProofOutcome::Proof(proof) => {
                if let Err(e) = self
                    .finalize_polled_token(&event.local_id, event.commitment, proof)
                    .await
                {
                    warn!("finalization of {} failed: {}", event.local_id, e);
                    self.mark_invalid(&event.local_id).await;
                }
            }
            ProofOutcome::TimedOut => {
                warn!("proof polling for {} exhausted its attempts", event.local_id);
                self.mark_invalid(&event.local_id).await;
            }
        }
    }

    async fn finalize_polled_token(
        self: &Arc<Self>,
        local_id: &str,
        commitment: Commitment,
        proof: Value,
    ) -> Result<(), WalletError> {
        let source = {
            let repo = self.repository.lock().await;
            let token = repo
                .get_token(local_id)
                .ok_or_else(|| WalletError::TokenNotFound(local_id.to_owned()))?;
            token
                .payload
                .blob()
                .cloned()
                .ok_or_else(|| WalletError::TokenRejected("token has no blob".into()))?
        };

        let transfer_tx = serde_json::to_value(&TransferTransaction {
            commitment,
            inclusion_proof: proof,
        })?;
        let finalized = self.finalize_incoming(&source, &transfer_tx).await?;

        let validity = self
            .oracle
            .validate_token(&finalized)
            .await
            .map_err(WalletError::Any)?;
        if !validity.valid || validity.spent {
            return Err(WalletError::TokenRejected("oracle reports invalid token".into()));
        }

        let mut repo = self.repository.lock().await;
        let now = get_current_time_in_millis();
        let Some(token) = repo.get_token_mut(local_id) else {
            return Err(WalletError::TokenNotFound(local_id.to_owned()));
        };
        token.payload = TokenPayload::Finalized(finalized);
        token.status = TokenStatus::Confirmed;
        token.touch(now);
        let coin_id = token.coin_id.clone();
        let amount = token.amount;
        let token = token.clone();
        repo.archive_token(&token);
        repo.push_history(crate::entry::TransactionEntry::new(
            crate::entry::EntryData::Received {
                coin_id,
                amount,
                sender: None,
                reference: local_id.to_owned(),
            },
            now,
        ));
        repo.save(&*self.primary).await?;
        Ok(())
    }

    pub(crate) async fn mark_invalid(&self, local_id: &str) {
        let mut repo = self.repository.lock().await;
        if let Some(token) = repo.get_token_mut(local_id) {
            token.status = TokenStatus::Invalid;
            token.touch(get_current_time_in_millis());
        }
        if let Err(e) = repo.save(&*self.primary).await {
            warn!("saving invalid mark for {} failed: {}", local_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sphere_common::api::CommitmentKind;

    fn commitment_value() -> Value {
        let commitment = Commitment::new(
            CommitmentKind::Transfer,
            "aa",
            Some("bb".to_owned()),
            Address::proxy_from_nametag("dave"),
            "0011",
        );
        serde_json::to_value(&commitment).unwrap()
    }

    #[test]
    fn test_classify_v5_bundle() {
        let bundle = json!({
            "type": "INSTANT_SPLIT",
            "version": 5,
            "split_group_id": "g1",
            "coin_id": "cafe",
            "amount": "10",
            "recipient_mint_data": {},
            "mint_commitment": commitment_value(),
            "transfer_commitment": commitment_value(),
            "transfer_salt_hex": "00",
            "minted_token_state": {},
            "token_type_hex": "cafe",
            "recipient_address": Address::proxy_from_nametag("dave").to_string(),
        });
        assert!(matches!(
            classify_envelope(&bundle),
            Some(Classified::BundleV5(_))
        ));
    }

    #[test]
    fn test_classify_commitment_only() {
        let payload = json!({
            "source_token": {"tokenId": "aa"},
            "commitment_data": commitment_value(),
        });
        assert!(matches!(
            classify_envelope(&payload),
            Some(Classified::CommitmentOnly { .. })
        ));
    }

    #[test]
    fn test_classify_fully_proven() {
        let payload = json!({
            "source_token": {"tokenId": "aa"},
            "transfer_tx": {
                "commitment": commitment_value(),
                "inclusionProof": {"ok": true},
            },
        });
        assert!(matches!(
            classify_envelope(&payload),
            Some(Classified::FullyProven { .. })
        ));
    }

    #[test]
    fn test_promote_proofless_transfer_tx() {
        // a full transaction shape missing its proof
        let payload = json!({
            "source_token": {"tokenId": "aa"},
            "transfer_tx": {
                "commitment": commitment_value(),
                "inclusionProof": null,
            },
        });
        assert!(matches!(
            classify_envelope(&payload),
            Some(Classified::CommitmentOnly { .. })
        ));

        // the bare commitment itself under transfer_tx
        let payload = json!({
            "source_token": {"tokenId": "aa"},
            "transfer_tx": commitment_value(),
        });
        assert!(matches!(
            classify_envelope(&payload),
            Some(Classified::CommitmentOnly { .. })
        ));
    }

    #[test]
    fn test_promote_legacy_token_key() {
        let payload = json!({"token": {"tokenId": "aa", "stateHash": "bb"}});
        match classify_envelope(&payload) {
            Some(Classified::FullyProven { transfer_tx, .. }) => {
                assert!(transfer_tx.is_null())
            }
            other => panic!("unexpected classification: {:?}", other),
        }
    }

    #[test]
    fn test_unrecognized_shape_is_dropped() {
        assert!(classify_envelope(&json!({"hello": "world"})).is_none());
        assert!(classify_envelope(&json!({"type": "INSTANT_SPLIT", "version": 9})).is_none());
    }
}

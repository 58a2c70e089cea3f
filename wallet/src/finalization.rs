// Lazy finalization of tokens received as V5 split bundles. Each scan
// advances every unconfirmed token at most one stage; proof lookups are
// raced against a short timer so the scan stays non-blocking.

use crate::{
    config::{MAX_FINALIZATION_ATTEMPTS, PROOF_POLL_INTERVAL, PROOF_QUICK_CHECK_TIMEOUT},
    entry::{EntryData, TransactionEntry},
    error::WalletError,
    wallet::Wallet,
};
use log::{debug, trace, warn};
use serde_json::{json, Value};
use sphere_common::{
    api::{predicate_state, recipient_predicate, SplitBundleV5, TransferTransaction},
    time::get_current_time_in_millis,
    token::{PendingFinalization, PendingStage, TokenBlob, TokenPayload, TokenStatus},
};
use std::{sync::Arc, time::Duration};
use tokio::time::{sleep, timeout};

#[derive(Debug, Default, Clone, Copy)]
pub struct ResolveSummary {
    pub scanned: usize,
    pub advanced: usize,
    pub finalized: usize,
    pub invalidated: usize,
    pub remaining: usize,
}

// What one scan pass decided for one token
enum StageOutcome {
    // New stage and, for the mint check, the stored proof
    Advance(PendingStage, Option<Value>),
    Finalize(TokenBlob),
    Stay,
}

impl Wallet {
    // Scan the active set for submitted tokens carrying a pending
    // finalization envelope and advance each one stage if possible.
    // Errors on individual tokens are retried on the next scan.
    pub async fn resolve_unconfirmed(self: &Arc<Self>) -> Result<ResolveSummary, WalletError> {
        self.ensure_active()?;
        let pending = {
            let repo = self.repository.lock().await;
            repo.pending_finalization_tokens()
        };

        let mut summary = ResolveSummary {
            scanned: pending.len(),
            ..Default::default()
        };

        for token in pending {
            let Some(state) = token.payload.pending().cloned() else {
                continue;
            };

            // Every invocation counts as an attempt
            let attempts = state.attempt_count + 1;
            if attempts > MAX_FINALIZATION_ATTEMPTS {
                warn!(
                    "finalization of {} abandoned after {} attempts",
                    token.local_id, state.attempt_count
                );
                self.mark_invalid(&token.local_id).await;
                summary.invalidated += 1;
                continue;
            }

            let outcome = match self.advance_stage(&state).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    debug!("stage {:?} of {} failed: {}", state.stage, token.local_id, e);
                    StageOutcome::Stay
                }
            };

            let mut repo = self.repository.lock().await;
            let now = get_current_time_in_millis();
            let Some(entry) = repo.get_token_mut(&token.local_id) else {
                continue;
            };

            match outcome {
                StageOutcome::Stay => {
                    if let Some(pending) = entry.payload.pending_mut() {
                        pending.attempt_count = attempts;
                        pending.last_attempt_at = now;
                    }
                }
                StageOutcome::Advance(stage, mint_proof) => {
                    if let Some(pending) = entry.payload.pending_mut() {
                        trace!("{}: {:?} -> {:?}", token.local_id, pending.stage, stage);
                        pending.stage = stage;
                        pending.attempt_count = attempts;
                        pending.last_attempt_at = now;
                        if mint_proof.is_some() {
                            pending.mint_proof = mint_proof;
                        }
                    }
                    summary.advanced += 1;
                }
                StageOutcome::Finalize(finalized) => {
                    debug!("token {} finalized", token.local_id);
                    entry.payload = TokenPayload::Finalized(finalized);
                    entry.status = TokenStatus::Confirmed;
                    entry.touch(now);
                    let coin_id = entry.coin_id.clone();
                    let amount = entry.amount;
                    let snapshot = entry.clone();
                    repo.archive_token(&snapshot);
                    // Exactly one RECEIVED entry per split group: the
                    // local id is deterministic from the group id, and
                    // history upserts on the dedup key
                    repo.push_history(TransactionEntry::new(
                        EntryData::Received {
                            coin_id,
                            amount,
                            sender: Some(state.sender_pubkey.to_hex()),
                            reference: token.local_id.clone(),
                        },
                        now,
                    ));
                    summary.finalized += 1;
                }
            }
            repo.save(&*self.primary).await?;
        }

        let repo = self.repository.lock().await;
        summary.remaining = repo.pending_finalization_tokens().len();
        Ok(summary)
    }

    // Polling mode: scan until every unconfirmed token resolves or the
    // caller's deadline fires
    pub async fn resolve_unconfirmed_polling(
        self: &Arc<Self>,
        deadline: Duration,
    ) -> Result<ResolveSummary, WalletError> {
        let started = std::time::Instant::now();
        loop {
            let summary = self.resolve_unconfirmed().await?;
            if summary.remaining == 0 || started.elapsed() >= deadline {
                return Ok(summary);
            }
            sleep(PROOF_POLL_INTERVAL).await;
        }
    }

    async fn advance_stage(&self, state: &PendingFinalization) -> Result<StageOutcome, WalletError> {
        let client = self.oracle.state_transition_client();
        match state.stage {
            // Reconstruct the mint commitment from the bundle's mint
            // data and submit it
            PendingStage::Received => {
                let result = client
                    .submit_mint_commitment(&state.bundle.mint_commitment)
                    .await
                    .map_err(WalletError::Any)?;
                if !result.status.is_accepted() {
                    return Err(WalletError::SubmissionRejected(format!(
                        "{:?}",
                        result.status
                    )));
                }
                Ok(StageOutcome::Advance(PendingStage::MintSubmitted, None))
            }
            // Quick-check for the mint inclusion proof
            PendingStage::MintSubmitted => {
                match self
                    .quick_proof_check(&state.bundle.mint_commitment.request_id)
                    .await?
                {
                    Some(proof) => Ok(StageOutcome::Advance(
                        PendingStage::MintProven,
                        Some(proof),
                    )),
                    None => Ok(StageOutcome::Stay),
                }
            }
            // Submit the transfer commitment
            PendingStage::MintProven => {
                let result = client
                    .submit_transfer_commitment(&state.bundle.transfer_commitment)
                    .await
                    .map_err(WalletError::Any)?;
                if !result.status.is_accepted() {
                    return Err(WalletError::SubmissionRejected(format!(
                        "{:?}",
                        result.status
                    )));
                }
                Ok(StageOutcome::Advance(PendingStage::TransferSubmitted, None))
            }
            // Quick-check for the transfer proof, then finalize
            PendingStage::TransferSubmitted => {
                let Some(transfer_proof) = self
                    .quick_proof_check(&state.bundle.transfer_commitment.request_id)
                    .await?
                else {
                    return Ok(StageOutcome::Stay);
                };
                let finalized = self.finalize_bundle(state, transfer_proof).await?;
                Ok(StageOutcome::Finalize(finalized))
            }
        }
    }

    async fn quick_proof_check(&self, request_id: &str) -> Result<Option<Value>, WalletError> {
        match timeout(PROOF_QUICK_CHECK_TIMEOUT, self.oracle.get_proof(request_id)).await {
            Ok(Ok(proof)) => Ok(proof),
            Ok(Err(e)) => Err(WalletError::Any(e)),
            // The 500ms race lost; the scan must stay non-blocking
            Err(_) => Ok(None),
        }
    }

    async fn finalize_bundle(
        &self,
        state: &PendingFinalization,
        transfer_proof: Value,
    ) -> Result<TokenBlob, WalletError> {
        let bundle = &state.bundle;
        let mint_proof = state
            .mint_proof
            .clone()
            .ok_or_else(|| WalletError::TokenRejected("missing mint proof".into()))?;

        let minted = minted_token_blob(bundle, &mint_proof);
        let predicate = recipient_predicate(&self.pubkey, &bundle.transfer_salt_hex);
        let recipient_state = predicate_state(&predicate);

        // Proxy transfers need a nametag witness: bundle-embedded first,
        // then wallet-local
        let witnesses: Vec<TokenBlob> = if bundle.recipient_address.is_proxy() {
            match &bundle.nametag_token {
                Some(token) => vec![TokenBlob::Structured(token.clone())],
                None => {
                    let repo = self.repository.lock().await;
                    let nametag = repo
                        .find_nametag_for_address(&bundle.recipient_address)
                        .ok_or_else(|| {
                            WalletError::NametagMissing(bundle.recipient_address.to_string())
                        })?;
                    vec![nametag.token.clone()]
                }
            }
        } else {
            Vec::new()
        };

        let trust_base = self
            .oracle
            .trust_base()
            .ok_or(WalletError::TrustBaseMissing)?;
        let transfer_tx = serde_json::to_value(&TransferTransaction {
            commitment: bundle.transfer_commitment.clone(),
            inclusion_proof: transfer_proof,
        })?;

        self.oracle
            .state_transition_client()
            .finalize(&trust_base, &minted, &recipient_state, &transfer_tx, &witnesses)
            .await
            .map_err(|e| WalletError::TokenRejected(format!("finalize failed: {}", e)))
    }
}

// Reconstruct the minted token from the bundle pieces and the anchored
// mint proof
fn minted_token_blob(bundle: &SplitBundleV5, mint_proof: &Value) -> TokenBlob {
    TokenBlob::Structured(json!({
        "genesis": {
            "tokenId": bundle.mint_commitment.token_id,
            "data": {
                "coins": [[bundle.coin_id, bundle.amount.to_string()]],
                "tokenType": bundle.token_type_hex,
                "mintData": bundle.recipient_mint_data,
            }
        },
        "state": bundle.minted_token_state,
        "transactions": [{
            "commitment": serde_json::to_value(&bundle.mint_commitment)
                .unwrap_or(Value::Null),
            "inclusionProof": mint_proof,
        }],
    }))
}

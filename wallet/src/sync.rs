// Multi-provider sync. One sync runs at a time: a second concurrent
// call awaits the in-flight one. Provider failures are logged and do
// not abort the pass; the caller sees aggregate counts.

use crate::{
    config::SYNC_DEBOUNCE,
    error::WalletError,
    wallet::{Wallet, WalletEvent},
};
use log::{debug, trace, warn};
use serde::Serialize;
use std::sync::{atomic::Ordering, Arc};
use tokio::{sync::broadcast, time::sleep};

#[derive(Debug, Default, Clone, Serialize)]
pub struct SyncSummary {
    pub added: u32,
    pub removed: u32,
    pub conflicts: u32,
    pub providers_synced: u32,
}

impl Wallet {
    // Reconcile repository state across every token storage provider
    pub async fn sync(self: &Arc<Self>) -> Result<SyncSummary, WalletError> {
        self.ensure_active()?;

        // Coalesce: join an in-flight sync instead of starting another
        let waiter = {
            let mut inflight = self.sync_inflight.lock().await;
            match inflight.as_ref() {
                Some(sender) => Some(sender.subscribe()),
                None => {
                    let (sender, _) = broadcast::channel(1);
                    *inflight = Some(sender);
                    None
                }
            }
        };

        if let Some(mut receiver) = waiter {
            trace!("sync already in flight, awaiting it");
            return match receiver.recv().await {
                Ok(Ok(summary)) => Ok(summary),
                Ok(Err(message)) => Err(WalletError::Sync(message)),
                Err(_) => Err(WalletError::Sync("in-flight sync was dropped".into())),
            };
        }

        let result = self.do_sync().await;

        let mut inflight = self.sync_inflight.lock().await;
        if let Some(sender) = inflight.take() {
            let shared = match &result {
                Ok(summary) => Ok(summary.clone()),
                Err(e) => Err(e.to_string()),
            };
            let _ = sender.send(shared);
        }
        result
    }

    async fn do_sync(self: &Arc<Self>) -> Result<SyncSummary, WalletError> {
        self.propagate_event(WalletEvent::SyncStarted);

        let mut local = {
            let repo = self.repository.lock().await;
            repo.to_txf()
        };

        let mut summary = SyncSummary::default();
        let mut changed = false;

        for provider in &self.token_providers {
            let name = provider.name().to_owned();
            match provider.sync(&local).await {
                Err(e) => {
                    // Per-provider failures never abort the pass
                    warn!("sync with provider {} failed: {}", name, e);
                    self.propagate_event(WalletEvent::SyncProvider {
                        provider: name,
                        success: false,
                        added: 0,
                        removed: 0,
                        conflicts: 0,
                    });
                }
                Ok(result) => {
                    summary.added += result.added;
                    summary.removed += result.removed;
                    summary.conflicts += result.conflicts;
                    if result.success {
                        summary.providers_synced += 1;
                    }

                    if let Some(merged) = result.merged {
                        debug!("provider {} returned a merged archive", name);
                        let mut repo = self.repository.lock().await;
                        // Tombstone filtering re-applies on re-hydration
                        let dropped = repo.apply_txf(merged);
                        summary.removed += dropped as u32;
                        local = repo.to_txf();
                        changed = true;
                    }

                    self.propagate_event(WalletEvent::SyncProvider {
                        provider: name,
                        success: result.success,
                        added: result.added,
                        removed: result.removed,
                        conflicts: result.conflicts,
                    });
                }
            }
        }

        if changed {
            let mut repo = self.repository.lock().await;
            repo.save(&*self.primary).await?;
        }

        self.propagate_event(WalletEvent::SyncCompleted {
            added: summary.added,
            removed: summary.removed,
            conflicts: summary.conflicts,
        });
        Ok(summary)
    }

    // Debounced sync on remote-update events: each event rearms a
    // one-shot timer, cancelling the prior one
    pub(crate) fn schedule_debounced_sync(self: &Arc<Self>) {
        let generation = self.sync_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let zelf = Arc::clone(self);
        tokio::spawn(async move {
            sleep(SYNC_DEBOUNCE).await;
            if zelf.sync_generation.load(Ordering::SeqCst) != generation {
                // A newer event reset the timer
                return;
            }
            if let Err(e) = zelf.sync().await {
                warn!("debounced sync failed: {}", e);
                zelf.propagate_event(WalletEvent::SyncError {
                    message: e.to_string(),
                });
            }
        });
    }
}

// Background proof polling. One periodic task services a map of jobs,
// racing each aggregator lookup against a short timeout so a slow
// oracle never stalls the tick. Outcomes are delivered to the wallet
// over a completion channel, never applied from inside the poller.

use crate::{
    config::{MAX_POLL_ATTEMPTS, PROOF_POLL_INTERVAL, PROOF_QUICK_CHECK_TIMEOUT},
    providers::OracleProvider,
};
use indexmap::IndexMap;
use log::{debug, trace, warn};
use serde_json::Value;
use sphere_common::{
    api::Commitment,
    time::{get_current_time_in_millis, TimestampMillis},
};
use std::sync::Arc;
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
    time::{sleep, timeout},
};

#[derive(Debug, Clone)]
pub struct PollingJob {
    pub commitment: Commitment,
    pub started_at: TimestampMillis,
    pub attempts: u32,
    pub last_attempt_at: TimestampMillis,
}

#[derive(Debug)]
pub enum ProofOutcome {
    Proof(Value),
    // Attempt budget exhausted; the token must be marked invalid
    TimedOut,
}

#[derive(Debug)]
pub struct ProofEvent {
    pub local_id: String,
    pub commitment: Commitment,
    pub outcome: ProofOutcome,
}

pub struct ProofPoller {
    oracle: Arc<dyn OracleProvider>,
    // Keyed by local token id
    jobs: Mutex<IndexMap<String, PollingJob>>,
    task: Mutex<Option<JoinHandle<()>>>,
    events: mpsc::UnboundedSender<ProofEvent>,
}

impl ProofPoller {
    pub fn new(
        oracle: Arc<dyn OracleProvider>,
        events: mpsc::UnboundedSender<ProofEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            oracle,
            jobs: Mutex::new(IndexMap::new()),
            task: Mutex::new(None),
            events,
        })
    }

    // Register a commitment to watch. Starts the timer if it is idle.
    pub async fn enqueue(self: &Arc<Self>, local_id: String, commitment: Commitment) {
        let now = get_current_time_in_millis();
        {
            let mut jobs = self.jobs.lock().await;
            if jobs.contains_key(&local_id) {
                trace!("polling job for {} already registered", local_id);
                return;
            }
            debug!(
                "polling for proof of {} (request id {})",
                local_id, commitment.request_id
            );
            jobs.insert(
                local_id,
                PollingJob {
                    commitment,
                    started_at: now,
                    attempts: 0,
                    last_attempt_at: now,
                },
            );
        }
        self.ensure_running().await;
    }

    async fn ensure_running(self: &Arc<Self>) {
        let mut task = self.task.lock().await;
        if let Some(handle) = task.as_ref() {
            if !handle.is_finished() {
                return;
            }
        }

        let zelf = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            loop {
                sleep(PROOF_POLL_INTERVAL).await;
                zelf.tick().await;

                // The timer cancels itself once the job map empties
                if zelf.jobs.lock().await.is_empty() {
                    trace!("no polling jobs left, stopping timer");
                    break;
                }
            }
        }));
    }

    async fn tick(&self) {
        let snapshot: Vec<(String, Commitment)> = {
            let jobs = self.jobs.lock().await;
            jobs.iter()
                .map(|(id, job)| (id.clone(), job.commitment.clone()))
                .collect()
        };

        for (local_id, commitment) in snapshot {
            let lookup = timeout(
                PROOF_QUICK_CHECK_TIMEOUT,
                self.oracle.get_proof(&commitment.request_id),
            )
            .await;

            let proof = match lookup {
                Ok(Ok(proof)) => proof,
                Ok(Err(e)) => {
                    debug!("proof lookup for {} failed: {}", local_id, e);
                    None
                }
                Err(_) => {
                    trace!("proof lookup for {} timed out", local_id);
                    None
                }
            };

            let mut jobs = self.jobs.lock().await;
            let Some(job) = jobs.get_mut(&local_id) else {
                continue;
            };
            job.attempts += 1;
            job.last_attempt_at = get_current_time_in_millis();

            if let Some(proof) = proof {
                debug!("proof received for {}", local_id);
                jobs.shift_remove(&local_id);
                let _ = self.events.send(ProofEvent {
                    local_id,
                    commitment,
                    outcome: ProofOutcome::Proof(proof),
                });
            } else if job.attempts >= MAX_POLL_ATTEMPTS {
                warn!(
                    "no proof for {} after {} attempts, giving up",
                    local_id, job.attempts
                );
                jobs.shift_remove(&local_id);
                let _ = self.events.send(ProofEvent {
                    local_id,
                    commitment,
                    outcome: ProofOutcome::TimedOut,
                });
            }
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.jobs.lock().await.len()
    }

    pub async fn is_running(&self) -> bool {
        let task = self.task.lock().await;
        task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }

    // Drop all jobs and cancel the timer
    pub async fn stop(&self) {
        self.jobs.lock().await.clear();
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{StateTransitionClient, TokenValidity};
    use anyhow::Result;
    use async_trait::async_trait;
    use sphere_common::{api::Address, token::TokenBlob};
    use std::collections::HashMap;

    struct ScriptedOracle {
        proofs: std::sync::Mutex<HashMap<String, Value>>,
    }

    impl ScriptedOracle {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                proofs: std::sync::Mutex::new(HashMap::new()),
            })
        }

        fn expose(&self, request_id: &str) {
            self.proofs.lock().unwrap().insert(
                request_id.to_owned(),
                serde_json::json!({"requestId": request_id}),
            );
        }
    }

    #[async_trait]
    impl OracleProvider for ScriptedOracle {
        async fn validate_token(&self, _token: &TokenBlob) -> Result<TokenValidity> {
            Ok(TokenValidity {
                valid: true,
                spent: false,
            })
        }

        async fn wait_for_proof(&self, commitment: &Commitment) -> Result<Value> {
            loop {
                if let Some(proof) = self.proofs.lock().unwrap().get(&commitment.request_id) {
                    return Ok(proof.clone());
                }
                sleep(std::time::Duration::from_millis(5)).await;
            }
        }

        async fn get_proof(&self, request_id: &str) -> Result<Option<Value>> {
            Ok(self.proofs.lock().unwrap().get(request_id).cloned())
        }

        fn state_transition_client(&self) -> Arc<dyn StateTransitionClient> {
            unimplemented!("not used in poller tests")
        }

        fn trust_base(&self) -> Option<Value> {
            Some(serde_json::json!({}))
        }
    }

    fn commitment() -> Commitment {
        Commitment::new(
            sphere_common::api::CommitmentKind::Transfer,
            "aa",
            Some("bb".to_owned()),
            Address::proxy_from_nametag("carol"),
            "0011",
        )
    }

    #[tokio::test]
    async fn test_poller_delivers_proof_and_stops() {
        let oracle = ScriptedOracle::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let poller = ProofPoller::new(oracle.clone(), tx);

        let commitment = commitment();
        oracle.expose(&commitment.request_id);
        poller.enqueue("tok_1".to_owned(), commitment).await;
        assert!(poller.is_running().await);

        // First tick happens after one poll interval
        let event = rx.recv().await.unwrap();
        assert_eq!(event.local_id, "tok_1");
        assert!(matches!(event.outcome, ProofOutcome::Proof(_)));
        assert_eq!(poller.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_stop_clears_jobs() {
        let oracle = ScriptedOracle::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let poller = ProofPoller::new(oracle, tx);

        poller.enqueue("tok_1".to_owned(), commitment()).await;
        assert_eq!(poller.pending_count().await, 1);
        poller.stop().await;
        assert_eq!(poller.pending_count().await, 0);
        assert!(!poller.is_running().await);
    }
}

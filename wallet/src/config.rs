use std::time::Duration;

// Proof poller cadence
pub const PROOF_POLL_INTERVAL: Duration = Duration::from_secs(2);
// Budget for a single non-blocking proof query; keeps scans and poll
// ticks from stalling on a slow aggregator
pub const PROOF_QUICK_CHECK_TIMEOUT: Duration = Duration::from_millis(500);
// Polling gives up after ~60s of attempts and marks the token invalid
pub const MAX_POLL_ATTEMPTS: u32 = 30;
// Finalization retries before an unconfirmed token is marked invalid
pub const MAX_FINALIZATION_ATTEMPTS: u32 = 50;

// Tombstone pruning
pub const TOMBSTONE_MAX_AGE_MILLIS: u64 = 30 * 24 * 60 * 60 * 1000;
pub const TOMBSTONE_MAX_COUNT: usize = 100;
// Archive and fork caps, oldest entries evicted first
pub const ARCHIVED_MAX_COUNT: usize = 100;
pub const FORKED_MAX_COUNT: usize = 50;

// Remote-update events within this window coalesce into one sync
pub const SYNC_DEBOUNCE: Duration = Duration::from_millis(500);

// How long an outgoing payment request waits for a response
pub const PAYMENT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

// Exhaustive subset search is only attempted below this candidate count;
// larger sets fall through to the greedy path
pub const SUBSET_SEARCH_LIMIT: usize = 16;

// Wall-clock timestamps for wallet bookkeeping: history entries,
// tombstone and archive ages, finalization attempt tracking, debounce
// windows. Nothing here feeds a commitment or a proof, so a skewed
// clock costs at worst an early tombstone prune or an odd history sort.

use std::time::{SystemTime, UNIX_EPOCH};

// Milliseconds since the unix epoch
pub type TimestampMillis = u64;

// Current wall-clock time in milliseconds. A clock set before the epoch
// collapses to zero rather than failing the caller.
pub fn get_current_time_in_millis() -> TimestampMillis {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as TimestampMillis)
        .unwrap_or_default()
}

//! Process-wide handshake replay cache.
//!
//! Keyed by the 16-byte handshake id with the insertion timestamp as
//! the value. Entries expire after [`REPLAY_TTL_SECS`]; the cache is
//! additionally capped at [`REPLAY_CAPACITY`] entries with
//! oldest-first eviction. Entries are never touched after insertion,
//! so LRU order is insertion order and age-based purging walks the
//! cold end of the cache.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use lru::LruCache;
use once_cell::sync::Lazy;

use crate::error::{Result, SessionError};
use crate::protocol::handshake::HANDSHAKE_ID_LEN;

/// How long a handshake id stays hot (seconds).
pub const REPLAY_TTL_SECS: u64 = 600;
/// Hard bound on tracked ids.
pub const REPLAY_CAPACITY: usize = 100_000;

static HANDSHAKE_IDS: Lazy<Mutex<LruCache<[u8; HANDSHAKE_ID_LEN], u64>>> = Lazy::new(|| {
    let capacity = NonZeroUsize::new(REPLAY_CAPACITY).unwrap();
    Mutex::new(LruCache::new(capacity))
});

pub(crate) fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Register a handshake id, rejecting any id already seen within the
/// TTL window. Purge, lookup and insert happen in one critical section.
pub fn register_handshake_id(id: &[u8; HANDSHAKE_ID_LEN]) -> Result<()> {
    let now = unix_seconds();
    let mut cache = HANDSHAKE_IDS.lock().unwrap();

    while let Some((_, &ts)) = cache.peek_lru() {
        if now.saturating_sub(ts) >= REPLAY_TTL_SECS {
            cache.pop_lru();
        } else {
            break;
        }
    }

    if let Some(&ts) = cache.peek(id) {
        if now.saturating_sub(ts) < REPLAY_TTL_SECS {
            log::warn!(
                "handshake replay detected: id {} seen {}s ago",
                hex::encode(&id[..8]),
                now.saturating_sub(ts)
            );
            return Err(SessionError::HandshakeReplay);
        }
    }

    cache.put(*id, now);
    log::debug!("handshake id registered (cache size: {})", cache.len());
    Ok(())
}

/// Drop every tracked id. Teardown hook for tests that reuse ids.
pub fn clear() {
    HANDSHAKE_IDS.lock().unwrap().clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replay_detected() {
        let id = [0xA1u8; HANDSHAKE_ID_LEN];
        clear();
        register_handshake_id(&id).unwrap();
        assert!(matches!(
            register_handshake_id(&id),
            Err(SessionError::HandshakeReplay)
        ));
    }

    #[test]
    fn test_distinct_ids_allowed() {
        clear();
        register_handshake_id(&[0xB2u8; HANDSHAKE_ID_LEN]).unwrap();
        register_handshake_id(&[0xB3u8; HANDSHAKE_ID_LEN]).unwrap();
    }
}

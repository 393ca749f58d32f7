//! UID allocation for worker isolation.
//!
//! Workers run under throwaway UIDs so their files can be swept after the
//! runner exits. The counter is the only global mutable state in the crate
//! besides the process-wide force-shutdown signal.

use std::sync::Mutex;

use nix::unistd::{Uid, User};

pub const BASE_UID: u32 = 9000;
pub const MAX_UID: u32 = 20000;

/// Fallback when the range is exhausted: the conventional nobody UID.
pub const NOBODY_UID: u32 = 65534;

const PROBE_LIMIT: u32 = 1000;

static NEXT_UID: Mutex<u32> = Mutex::new(BASE_UID);

#[derive(Debug, thiserror::Error)]
#[error("no free uid in [{BASE_UID}, {MAX_UID}] after {PROBE_LIMIT} probes")]
pub struct UidExhausted;

/// Hand out the next UID in `[BASE_UID, MAX_UID]` not present in the user
/// database, wrapping at the top of the range. After `PROBE_LIMIT`
/// consecutive collisions the caller should fall back to [`NOBODY_UID`].
pub fn free_uid() -> Result<u32, UidExhausted> {
    free_uid_with(uid_in_use)
}

fn uid_in_use(uid: u32) -> bool {
    matches!(User::from_uid(Uid::from_raw(uid)), Ok(Some(_)))
}

fn free_uid_with(in_use: impl Fn(u32) -> bool) -> Result<u32, UidExhausted> {
    let mut next = NEXT_UID.lock().unwrap();
    for _ in 0..PROBE_LIMIT {
        let candidate = *next;
        *next = if candidate >= MAX_UID {
            BASE_UID
        } else {
            candidate + 1
        };
        if !in_use(candidate) {
            return Ok(candidate);
        }
    }
    Err(UidExhausted)
}

#[cfg(test)]
mod tests {
    use super::*;

    // The counter is global; tests that touch it are serialized.
    static SERIAL: Mutex<()> = Mutex::new(());

    fn serial() -> std::sync::MutexGuard<'static, ()> {
        SERIAL.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[test]
    fn allocations_are_distinct_and_in_range() {
        let _guard = serial();
        let a = free_uid_with(|_| false).unwrap();
        let b = free_uid_with(|_| false).unwrap();
        assert_ne!(a, b);
        for uid in [a, b] {
            assert!((BASE_UID..=MAX_UID).contains(&uid), "{uid} out of range");
        }
    }

    #[test]
    fn wraps_to_base_uid() {
        let _guard = serial();
        {
            let mut next = NEXT_UID.lock().unwrap();
            *next = MAX_UID;
        }
        let at_max = free_uid_with(|_| false).unwrap();
        assert_eq!(at_max, MAX_UID);
        let wrapped = free_uid_with(|_| false).unwrap();
        assert_eq!(wrapped, BASE_UID);
    }

    #[test]
    fn exhaustion_reports_error() {
        let _guard = serial();
        let err = free_uid_with(|_| true);
        assert!(err.is_err());
        // Callers fall back to the nobody UID on exhaustion.
        assert_eq!(err.map_err(|_| NOBODY_UID).unwrap_err(), 65534);
    }
}

use std::sync::atomic::{AtomicU64, Ordering};

#[cfg(test)]
pub mod test_helpers;

/// Mints a process-wide unique id.
///
/// Identity of actions, scopes, processes and cache keys is based on these
/// ids, never on names.
pub(crate) fn next_id() -> u64 {
    static NEXT_ID: AtomicU64 = AtomicU64::new(1);
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

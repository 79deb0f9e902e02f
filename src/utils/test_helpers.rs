use std::future::Future;

/// Runs a future to completion on a paused-clock, single-threaded runtime.
///
/// Timers auto-advance while the runtime is otherwise idle, so tests using
/// long delays still finish instantly.
pub fn run(f: impl Future<Output = ()>) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .unwrap();
    let local = tokio::task::LocalSet::new();
    local.block_on(&rt, f);
}

/// Yields until tasks spawned so far have run up to their next await point.
pub async fn pump() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

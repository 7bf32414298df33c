use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};

/// Why a transaction loop came back from its wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The deadline passed.
    Elapsed,
    /// Someone signalled the transaction (cancel, expire or a response).
    Woken,
}

/// Suspends until `deadline` or until `wake` is notified, whichever is first.
///
/// Transactions signal their loop with [`Notify::notify_one`], which stores a
/// permit when nobody is waiting yet, so a signal sent just before the loop
/// starts to wait is not lost.
pub async fn sleep_until_or_woken(deadline: Instant, wake: &Notify) -> WaitOutcome {
    tokio::select! {
        _ = sleep_until(deadline) => WaitOutcome::Elapsed,
        _ = wake.notified() => WaitOutcome::Woken,
    }
}

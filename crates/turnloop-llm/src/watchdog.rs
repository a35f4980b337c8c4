//! Stream cancellation and idle-watchdog tasks (spec §4.3).
//!
//! Grounded on `llm/client_stream_guard.py`'s `_start_cancel_closer` and
//! `_start_stream_idle_watchdog`, reimplemented with `tokio::spawn` tasks
//! and `tokio_util::sync::CancellationToken` instead of daemon threads and
//! a custom cancellation flag; the 50ms poll interval is carried over
//! verbatim since it's cheap and matches the original's responsiveness.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPhase {
    FirstEvent,
    Idle,
}

/// Shared progress tracker an idle watchdog polls; the stream driver calls
/// `mark_progress()` every time an item arrives.
pub struct ProgressTracker {
    saw_any: AtomicBool,
    last_progress: Mutex<Instant>,
}

impl ProgressTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { saw_any: AtomicBool::new(false), last_progress: Mutex::new(Instant::now()) })
    }

    pub fn mark_progress(&self) {
        self.saw_any.store(true, Ordering::SeqCst);
        *self.last_progress.lock() = Instant::now();
    }
}

pub struct WatchdogHandle {
    cancel_on_timeout: CancellationToken,
    timed_out_phase: Arc<Mutex<Option<TimeoutPhase>>>,
    _task: tokio::task::JoinHandle<()>,
}

impl WatchdogHandle {
    pub fn timed_out_phase(&self) -> Option<TimeoutPhase> {
        *self.timed_out_phase.lock()
    }

    pub fn stop(&self) {
        self.cancel_on_timeout.cancel();
    }
}

/// Spawns a task that closes the stream (by tripping `stream_cancel`) if
/// no item arrives within `first_event_timeout` or the inter-item gap
/// exceeds `idle_timeout`.
pub fn spawn_idle_watchdog(
    tracker: Arc<ProgressTracker>,
    stream_cancel: CancellationToken,
    first_event_timeout: Duration,
    idle_timeout: Duration,
) -> WatchdogHandle {
    let stop_token = CancellationToken::new();
    let timed_out_phase = Arc::new(Mutex::new(None));

    let task_stop = stop_token.clone();
    let task_phase = timed_out_phase.clone();
    let task_cancel = stream_cancel.clone();
    let started_at = Instant::now();

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = task_stop.cancelled() => return,
                _ = task_cancel.cancelled() => return,
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }

            let saw_any = tracker.saw_any.load(Ordering::SeqCst);
            if !saw_any {
                if started_at.elapsed() >= first_event_timeout {
                    *task_phase.lock() = Some(TimeoutPhase::FirstEvent);
                    task_cancel.cancel();
                    return;
                }
                continue;
            }

            let idle_for = tracker.last_progress.lock().elapsed();
            if idle_for >= idle_timeout {
                *task_phase.lock() = Some(TimeoutPhase::Idle);
                task_cancel.cancel();
                return;
            }
        }
    });

    WatchdogHandle { cancel_on_timeout: stop_token, timed_out_phase, _task: task }
}

/// Mirrors `_start_cancel_closer`: watches an externally-owned
/// cancellation token and trips `stream_cancel` (distinct from the
/// caller's own token so the watchdog's timeout and the caller's
/// cancellation both funnel through the same close path) as soon as it
/// fires.
pub fn spawn_cancel_closer(external_cancel: CancellationToken, stream_cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        external_cancel.cancelled().await;
        stream_cancel.cancel();
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_event_timeout_trips_when_nothing_arrives() {
        let tracker = ProgressTracker::new();
        let stream_cancel = CancellationToken::new();
        let handle = spawn_idle_watchdog(
            tracker,
            stream_cancel.clone(),
            Duration::from_millis(60),
            Duration::from_secs(60),
        );

        stream_cancel.cancelled().await;
        assert_eq!(handle.timed_out_phase(), Some(TimeoutPhase::FirstEvent));
        handle.stop();
    }

    #[tokio::test]
    async fn progress_resets_idle_timer() {
        let tracker = ProgressTracker::new();
        tracker.mark_progress();
        let stream_cancel = CancellationToken::new();
        let handle = spawn_idle_watchdog(
            tracker.clone(),
            stream_cancel.clone(),
            Duration::from_secs(60),
            Duration::from_millis(80),
        );

        tokio::time::sleep(Duration::from_millis(40)).await;
        tracker.mark_progress();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!stream_cancel.is_cancelled());
        handle.stop();
    }

    #[tokio::test]
    async fn idle_gap_after_first_item_trips_idle_phase() {
        let tracker = ProgressTracker::new();
        tracker.mark_progress();
        let stream_cancel = CancellationToken::new();
        let handle = spawn_idle_watchdog(
            tracker,
            stream_cancel.clone(),
            Duration::from_secs(60),
            Duration::from_millis(60),
        );

        stream_cancel.cancelled().await;
        assert_eq!(handle.timed_out_phase(), Some(TimeoutPhase::Idle));
        handle.stop();
    }

    #[tokio::test]
    async fn cancel_closer_propagates_external_cancellation() {
        let external = CancellationToken::new();
        let stream_cancel = CancellationToken::new();
        let _closer = spawn_cancel_closer(external.clone(), stream_cancel.clone());
        external.cancel();
        stream_cancel.cancelled().await;
        assert!(stream_cancel.is_cancelled());
    }
}

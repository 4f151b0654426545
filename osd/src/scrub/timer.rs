//! Scheduled-callback plumbing for the scrub state machine.
//!
//! The machine expresses all waiting as events delivered later by a
//! [`CallbackScheduler`]. A state that owns an in-flight timer holds the
//! corresponding [`TimerEventToken`]; leaving the state drops the token,
//! which cancels the callback and prevents delivery.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::trace;

pub type CallbackToken = u64;

/// The timer service the scrub machine schedules against. The tokio-backed
/// implementation below is used by the daemon; tests drive a manual one.
pub trait CallbackScheduler: Send + Sync {
    fn schedule_after(&self, delay: Duration, cb: Box<dyn FnOnce() + Send>) -> CallbackToken;
    fn cancel(&self, token: CallbackToken);
}

/// Shared between the scheduled callback and the token, so that either side
/// can be destroyed first without racing the other.
struct ScheduledEventState {
    canceled: bool,
    token: Option<CallbackToken>,
}

/// Owning handle to an in-flight timer event.
///
/// Dropping the handle (or calling [`TimerEventToken::release`]) cancels
/// the pending callback; a callback that already started firing observes
/// the `canceled` flag and skips event delivery. Moving the handle
/// transfers ownership.
pub struct TimerEventToken {
    timers: Arc<dyn CallbackScheduler>,
    state: Arc<Mutex<ScheduledEventState>>,
}

impl TimerEventToken {
    /// Schedule `deliver` to run after `delay`, returning the handle that
    /// keeps the event alive.
    pub fn arm(
        timers: Arc<dyn CallbackScheduler>,
        delay: Duration,
        deliver: impl FnOnce() + Send + 'static,
    ) -> Self {
        let state = Arc::new(Mutex::new(ScheduledEventState {
            canceled: false,
            token: None,
        }));

        let cb_state = Arc::clone(&state);
        // Hold the state lock across schedule_after: a callback that fires
        // immediately blocks on it until the token is recorded.
        let mut guard = state.lock().unwrap();
        let token = timers.schedule_after(
            delay,
            Box::new(move || {
                let fire = {
                    let mut state = cb_state.lock().unwrap();
                    if state.canceled {
                        debug_assert!(state.token.is_none());
                        false
                    } else {
                        state.token = None;
                        true
                    }
                };
                if fire {
                    deliver();
                }
            }),
        );
        guard.token = Some(token);
        drop(guard);

        TimerEventToken { timers, state }
    }

    /// Cancel the pending event, if it has not fired yet. Idempotent.
    pub fn release(&mut self) {
        let mut state = self.state.lock().unwrap();
        if let Some(token) = state.token.take() {
            state.canceled = true;
            self.timers.cancel(token);
        }
    }
}

impl Drop for TimerEventToken {
    fn drop(&mut self) {
        self.release();
    }
}

/// Timer service backed by spawned tokio sleep tasks.
pub struct TokioCallbackScheduler {
    handle: tokio::runtime::Handle,
    next_token: AtomicU64,
    pending: Arc<Mutex<HashMap<CallbackToken, tokio::task::AbortHandle>>>,
}

impl TokioCallbackScheduler {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        TokioCallbackScheduler {
            handle,
            next_token: AtomicU64::new(1),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl CallbackScheduler for TokioCallbackScheduler {
    fn schedule_after(&self, delay: Duration, cb: Box<dyn FnOnce() + Send>) -> CallbackToken {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let pending = Arc::clone(&self.pending);
        let task = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            pending.lock().unwrap().remove(&token);
            cb();
        });
        self.pending.lock().unwrap().insert(token, task.abort_handle());
        trace!(token, ?delay, "scheduled timer callback");
        token
    }

    fn cancel(&self, token: CallbackToken) {
        if let Some(task) = self.pending.lock().unwrap().remove(&token) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scrub::testing::ManualScheduler;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn live_token_delivers() {
        let timers = Arc::new(ManualScheduler::default());
        let fired = Arc::new(AtomicUsize::new(0));

        let fired2 = Arc::clone(&fired);
        let token = TimerEventToken::arm(timers.clone(), Duration::from_secs(1), move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        timers.fire_all();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        drop(token);
    }

    #[test]
    fn dropped_token_does_not_deliver() {
        let timers = Arc::new(ManualScheduler::default());
        let fired = Arc::new(AtomicUsize::new(0));

        let fired2 = Arc::clone(&fired);
        let token = TimerEventToken::arm(timers.clone(), Duration::from_secs(1), move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        drop(token);

        // The manual scheduler saw the cancel; even a late firing of the
        // raw callback would observe the canceled flag.
        timers.fire_all();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn late_cancellation_is_detected_by_the_callback() {
        let timers = Arc::new(ManualScheduler::default());
        let fired = Arc::new(AtomicUsize::new(0));

        let fired2 = Arc::clone(&fired);
        let token = TimerEventToken::arm(timers.clone(), Duration::from_secs(1), move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        });

        // Simulate the callback racing the cancel: steal the callback
        // before releasing the token, then run it afterwards.
        let stolen = timers.steal_callbacks();
        drop(token);
        for cb in stolen {
            cb();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn release_is_idempotent() {
        let timers = Arc::new(ManualScheduler::default());
        let mut token = TimerEventToken::arm(timers.clone(), Duration::from_secs(1), || {});
        token.release();
        token.release();
        assert_eq!(timers.canceled_count(), 1);
    }

    #[tokio::test]
    async fn tokio_scheduler_fires_and_cancels() {
        let timers = Arc::new(TokioCallbackScheduler::new(tokio::runtime::Handle::current()));
        let fired = Arc::new(AtomicUsize::new(0));

        let fired2 = Arc::clone(&fired);
        let _live = TimerEventToken::arm(timers.clone(), Duration::from_millis(5), move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        let fired3 = Arc::clone(&fired);
        let dropped = TimerEventToken::arm(timers.clone(), Duration::from_millis(5), move || {
            fired3.fetch_add(100, Ordering::SeqCst);
        });
        drop(dropped);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::debug;

/// Longest delay a timer is armed for. Longer requests are clamped so the
/// deadline stays representable.
const MAX_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

struct ArmedTimer {
    generation: u64,
    fires_at: Instant,
    handle: AbortHandle,
}

#[derive(Default)]
struct Slot {
    armed: Option<ArmedTimer>,
    next_generation: u64,
}

/// One-shot timer for proactive renewal.
///
/// At most one timer is pending. Arming replaces (and aborts) the previous
/// one; a timer that fires disarms itself before running its callback, so the
/// callback is free to re-arm.
#[derive(Default)]
pub struct RefreshScheduler {
    slot: Arc<Mutex<Slot>>,
}

impl RefreshScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the timer to run `on_fire` after `delay`. Must be called from
    /// within a tokio runtime.
    pub fn arm<F>(&self, delay: Duration, on_fire: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let delay = delay.min(MAX_DELAY);
        // Held across spawn so a zero-delay timer cannot observe the slot
        // before it has been recorded.
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = slot.armed.take() {
            previous.handle.abort();
        }

        slot.next_generation += 1;
        let generation = slot.next_generation;
        let shared = Arc::clone(&self.slot);

        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut slot = shared.lock().unwrap_or_else(|e| e.into_inner());
                match slot.armed.as_ref() {
                    Some(armed) if armed.generation == generation => slot.armed = None,
                    _ => return,
                }
            }
            debug!(generation, "Refresh timer fired");
            on_fire.await;
        });

        debug!(generation, delay_secs = delay.as_secs(), "Refresh timer armed");
        slot.armed = Some(ArmedTimer {
            generation,
            fires_at: Instant::now() + delay,
            handle: task.abort_handle(),
        });
    }

    /// Cancel the pending timer. Returns true if one was armed.
    pub fn cancel(&self) -> bool {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        match slot.armed.take() {
            Some(armed) => {
                armed.handle.abort();
                debug!(generation = armed.generation, "Refresh timer cancelled");
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .armed
            .is_some()
    }

    /// Time left until the pending timer fires
    pub fn fires_in(&self) -> Option<Duration> {
        let slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        slot.armed
            .as_ref()
            .map(|armed| armed.fires_at.saturating_duration_since(Instant::now()))
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter_callback(counter: &Arc<AtomicUsize>) -> impl Future<Output = ()> + Send + 'static {
        let counter = Arc::clone(counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_delay() {
        let scheduler = RefreshScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));

        scheduler.arm(Duration::from_secs(60), counter_callback(&fired));
        assert!(scheduler.is_armed());
        assert_eq!(scheduler.fires_in(), Some(Duration::from_secs(60)));

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_replaces_previous_timer() {
        let scheduler = RefreshScheduler::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        scheduler.arm(Duration::from_secs(10), counter_callback(&first));
        scheduler.arm(Duration::from_secs(30), counter_callback(&second));

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_disarms() {
        let scheduler = RefreshScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));

        assert!(!scheduler.cancel());
        scheduler.arm(Duration::from_secs(5), counter_callback(&fired));
        assert!(scheduler.cancel());
        assert!(!scheduler.is_armed());
        assert_eq!(scheduler.fires_in(), None);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_delay_fires_immediately() {
        let scheduler = RefreshScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));

        scheduler.arm(Duration::ZERO, counter_callback(&fired));
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_delay_is_clamped() {
        let scheduler = RefreshScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));

        scheduler.arm(Duration::MAX, counter_callback(&fired));
        assert_eq!(scheduler.fires_in(), Some(MAX_DELAY));
        assert!(scheduler.cancel());
    }

    #[tokio::test(start_paused = true)]
    async fn test_callback_can_rearm() {
        let scheduler = Arc::new(RefreshScheduler::new());
        let fired = Arc::new(AtomicUsize::new(0));

        let inner_scheduler = Arc::clone(&scheduler);
        let inner_fired = Arc::clone(&fired);
        scheduler.arm(Duration::from_secs(1), async move {
            inner_fired.fetch_add(1, Ordering::SeqCst);
            inner_scheduler.arm(Duration::from_secs(1), counter_callback(&inner_fired));
        });

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(scheduler.is_armed());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert!(!scheduler.is_armed());
    }
}

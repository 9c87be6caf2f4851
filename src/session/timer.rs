use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Receives one call per tick, after the remaining time was decremented.
#[async_trait]
pub trait TimeListener: Send + Sync + 'static {
    async fn on_time_update(&self, elapsed_minutes: u32, remaining_minutes: u32);
}

/// Background minute counter for one session.
pub struct SessionTimer {
    remaining: Arc<AtomicU32>,
    tick: Duration,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl SessionTimer {
    pub fn new(minutes: u32, tick: Duration) -> Self {
        Self {
            remaining: Arc::new(AtomicU32::new(minutes)),
            tick,
            monitor: Mutex::new(None),
        }
    }

    pub fn remaining(&self) -> u32 {
        self.remaining.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Start ticking. Any monitor already running is aborted and replaced.
    pub fn start_monitoring(&self, listener: Arc<dyn TimeListener>) {
        let remaining = Arc::clone(&self.remaining);
        let tick = self.tick;
        let handle = tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + tick, tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Ok(previous) = remaining
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |m| m.checked_sub(1))
                else {
                    break;
                };
                let now = previous - 1;
                listener.on_time_update(1, now).await;
                if now == 0 {
                    break;
                }
            }
            tracing::debug!("session timer finished");
        });

        let mut monitor = self.monitor.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = monitor.replace(handle) {
            previous.abort();
            tracing::debug!("replaced running session timer");
        }
    }

    /// Stop ticking. Safe to call any number of times.
    pub fn stop_monitoring(&self) {
        let handle = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

impl Drop for SessionTimer {
    fn drop(&mut self) {
        self.stop_monitoring();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        updates: Mutex<Vec<(u32, u32)>>,
    }

    #[async_trait]
    impl TimeListener for Recorder {
        async fn on_time_update(&self, elapsed: u32, remaining: u32) {
            self.updates.lock().unwrap().push((elapsed, remaining));
        }
    }

    const TICK: Duration = Duration::from_secs(60);

    #[tokio::test(start_paused = true)]
    async fn ticks_decrement_remaining() {
        let timer = SessionTimer::new(3, TICK);
        let recorder = Arc::new(Recorder::default());
        timer.start_monitoring(recorder.clone());

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(timer.remaining(), 2);
        assert_eq!(*recorder.updates.lock().unwrap(), vec![(1, 2)]);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(timer.remaining(), 0);
        assert_eq!(
            *recorder.updates.lock().unwrap(),
            vec![(1, 2), (1, 1), (1, 0)]
        );
        tokio::task::yield_now().await;
        assert!(!timer.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn restart_replaces_previous_monitor() {
        let timer = SessionTimer::new(10, TICK);
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        timer.start_monitoring(first.clone());
        timer.start_monitoring(second.clone());

        tokio::time::sleep(Duration::from_secs(61)).await;

        assert!(first.updates.lock().unwrap().is_empty());
        assert_eq!(*second.updates.lock().unwrap(), vec![(1, 9)]);
        assert_eq!(timer.remaining(), 9);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_idempotent() {
        let timer = SessionTimer::new(10, TICK);
        let recorder = Arc::new(Recorder::default());
        timer.start_monitoring(recorder.clone());
        timer.stop_monitoring();
        timer.stop_monitoring();

        tokio::time::sleep(Duration::from_secs(300)).await;

        assert!(recorder.updates.lock().unwrap().is_empty());
        assert_eq!(timer.remaining(), 10);
        assert!(!timer.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_minutes_never_ticks_below_zero() {
        let timer = SessionTimer::new(0, TICK);
        let recorder = Arc::new(Recorder::default());
        timer.start_monitoring(recorder.clone());
        tokio::time::sleep(Duration::from_secs(180)).await;
        assert!(recorder.updates.lock().unwrap().is_empty());
        assert_eq!(timer.remaining(), 0);
    }
}

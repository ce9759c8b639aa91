//! Stoppable background timers.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// A task that runs a callback every `period` until stopped.
///
/// The first run happens one full period after spawning. The callback
/// returns `false` to end the loop early. Dropping the handle aborts the
/// loop.
pub struct PeriodicTask {
    name: String,
    running: Arc<AtomicBool>,
    runs: Arc<AtomicU64>,
    shutdown_tx: Mutex<Option<mpsc::Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PeriodicTask {
    /// Spawns the loop on the current Tokio runtime.
    pub fn spawn<F>(name: impl Into<String>, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let name = name.into();
        let running = Arc::new(AtomicBool::new(true));
        let runs = Arc::new(AtomicU64::new(0));
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let task_name = name.clone();
        let task_running = running.clone();
        let task_runs = runs.clone();

        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        task_runs.fetch_add(1, Ordering::Relaxed);
                        if !tick() {
                            debug!(task = %task_name, "periodic task finished");
                            break;
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!(task = %task_name, "periodic task received shutdown signal");
                        break;
                    }
                }
            }

            task_running.store(false, Ordering::Release);
        });

        info!(task = %name, period_ms = period.as_millis() as u64, "periodic task started");

        Self {
            name,
            running,
            runs,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Task name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the loop is still running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Number of ticks so far.
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }

    /// Signals the loop to stop and waits for it to exit.
    pub async fn stop(&self) {
        let tx = self.shutdown_tx.lock().take();
        if let Some(tx) = tx {
            let _ = tx.send(()).await;
        }

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        self.running.store(false, Ordering::Release);
        info!(task = %self.name, "periodic task stopped");
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for PeriodicTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicTask")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .field("runs", &self.runs())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_ticks_every_period() {
        let count = Arc::new(AtomicU64::new(0));
        let counter = count.clone();
        let task = PeriodicTask::spawn("ticker", Duration::from_secs(10), move || {
            counter.fetch_add(1, Ordering::Relaxed);
            true
        });

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::Relaxed), 0);

        tokio::time::sleep(Duration::from_secs(26)).await;
        assert_eq!(count.load(Ordering::Relaxed), 3);
        assert_eq!(task.runs(), 3);
        assert!(task.is_running());

        task.stop().await;
        assert!(!task.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_prevents_further_ticks() {
        let count = Arc::new(AtomicU64::new(0));
        let counter = count.clone();
        let task = PeriodicTask::spawn("ticker", Duration::from_secs(1), move || {
            counter.fetch_add(1, Ordering::Relaxed);
            true
        });

        tokio::time::sleep(Duration::from_millis(1500)).await;
        task.stop().await;
        let seen = count.load(Ordering::Relaxed);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(count.load(Ordering::Relaxed), seen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_callback_can_end_loop() {
        let task = PeriodicTask::spawn("once", Duration::from_secs(1), || false);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!task.is_running());
        assert_eq!(task.runs(), 1);
        assert_eq!(task.name(), "once");
    }
}

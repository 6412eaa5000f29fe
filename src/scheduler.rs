//! Bounded parallel work dispatch
//!
//! One pool per stage: downloads and uploads are sized independently.
//! Work units are independent futures; the scheduler limits how many run
//! at once with a semaphore, paces dispatch with the configured delay,
//! stops dispatching once the cancellation flag is set, and always drains
//! completions before returning.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::warn;

/// Dispatcher for one stage's work units
pub struct Scheduler {
    parallelism: usize,
    request_delay: Duration,
    cancel: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(parallelism: usize, request_delay: Duration, cancel: Arc<AtomicBool>) -> Self {
        Self {
            parallelism: parallelism.max(1),
            request_delay,
            cancel,
        }
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Run all units, at most `parallelism` at a time
    ///
    /// Dispatch inserts `request_delay` between units and stops early on
    /// cancellation; units already dispatched run to completion. Results
    /// arrive in completion order. A panicked worker is logged and its
    /// result dropped.
    pub async fn run<T, F, Fut>(&self, units: Vec<F>) -> Vec<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(self.parallelism));
        let mut set: JoinSet<T> = JoinSet::new();
        let mut results = Vec::new();

        for (index, unit) in units.into_iter().enumerate() {
            if self.is_cancelled() {
                warn!("cancellation requested; not dispatching remaining units");
                break;
            }
            if index > 0 {
                tokio::time::sleep(self.request_delay).await;
            }
            let semaphore = Arc::clone(&semaphore);
            set.spawn(async move {
                // closed semaphores cannot happen here; run unpermitted if so
                let _permit = semaphore.acquire_owned().await.ok();
                unit().await
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(value) => results.push(value),
                Err(err) => warn!("work unit panicked: {err}"),
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use super::Scheduler;

    fn scheduler(parallelism: usize) -> Scheduler {
        Scheduler::new(
            parallelism,
            Duration::from_millis(1),
            Arc::new(AtomicBool::new(false)),
        )
    }

    #[tokio::test]
    async fn completes_every_unit() {
        let done = Arc::new(AtomicUsize::new(0));
        let units: Vec<_> = (0..8)
            .map(|i| {
                let done = Arc::clone(&done);
                move || async move {
                    done.fetch_add(1, Ordering::Relaxed);
                    i
                }
            })
            .collect();

        let mut results = scheduler(3).run(units).await;
        results.sort_unstable();
        assert_eq!(results, (0..8).collect::<Vec<_>>());
        assert_eq!(done.load(Ordering::Relaxed), 8);
    }

    #[tokio::test]
    async fn never_exceeds_parallelism() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let units: Vec<_> = (0..10)
            .map(|_| {
                let in_flight = Arc::clone(&in_flight);
                let peak = Arc::clone(&peak);
                move || async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                }
            })
            .collect();

        scheduler(2).run(units).await;
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn cancellation_stops_dispatch_but_drains_in_flight() {
        let cancel = Arc::new(AtomicBool::new(false));
        let scheduler = Scheduler::new(1, Duration::from_millis(5), Arc::clone(&cancel));
        let ran = Arc::new(AtomicUsize::new(0));

        let units: Vec<_> = (0..5)
            .map(|i| {
                let ran = Arc::clone(&ran);
                let cancel = Arc::clone(&cancel);
                move || async move {
                    ran.fetch_add(1, Ordering::SeqCst);
                    if i == 0 {
                        cancel.store(true, Ordering::SeqCst);
                    }
                }
            })
            .collect();

        scheduler.run(units).await;
        // the first unit sets the flag; pacing guarantees later units see it
        assert!(ran.load(Ordering::SeqCst) < 5);
    }
}

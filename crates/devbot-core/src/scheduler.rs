//! Owned periodic-job runner.
//!
//! Every job loop shares one cancellation token, so stopping the scheduler (or
//! cancelling the parent token) ends all of them; nothing outlives its owner.

use std::future::Future;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub struct Scheduler {
    cancel: CancellationToken,
    jobs: Vec<(&'static str, JoinHandle<()>)>,
}

impl Scheduler {
    /// Jobs stop when either `parent` is cancelled or [`Scheduler::stop`] runs.
    pub fn new(parent: &CancellationToken) -> Self {
        Self {
            cancel: parent.child_token(),
            jobs: Vec::new(),
        }
    }

    /// Run `job` every `period`, first run one period from now.
    ///
    /// Ticks missed while a job was running are delayed, not replayed.
    pub fn every<F, Fut>(&mut self, name: &'static str, period: Duration, job: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                tracing::trace!(job = name, "tick");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = job() => {}
                }
            }
            tracing::debug!(job = name, "job stopped");
        });
        self.jobs.push((name, handle));
    }

    pub fn job_names(&self) -> Vec<&'static str> {
        self.jobs.iter().map(|(name, _)| *name).collect()
    }

    pub async fn stop(mut self) {
        self.cancel.cancel();
        for (name, handle) in std::mem::take(&mut self.jobs) {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    tracing::warn!(job = name, "job ended abnormally: {e}");
                }
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

//! Transaction timeout reaper

use crate::background::Background;
use crate::{
    ActionStatus, Coordinator, TransactionObserver, TransactionRegistry, TransactionStats,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Rolls back transactions whose deadline has passed.
///
/// An expired ACTIVE transaction is marked rollback-only and aborted. An
/// expired PREPARING one is only marked; its own commit sees the mark once
/// the prepare round ends. Anything further along is left alone.
pub struct Reaper {
    registry: Arc<TransactionRegistry>,
    observer: Arc<dyn TransactionObserver>,
    stats: Arc<TransactionStats>,
    interval: Duration,
}

impl Reaper {
    /// Reaper over `registry` waking every `interval`
    pub fn new(
        registry: Arc<TransactionRegistry>,
        observer: Arc<dyn TransactionObserver>,
        stats: Arc<TransactionStats>,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            observer,
            stats,
            interval,
        }
    }

    /// Wake-up interval
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Mark every transaction expired at `now` rollback-only. Returns the
    /// ones that still need an abort.
    pub fn check_expired(&self, now: Instant) -> Vec<Arc<Coordinator>> {
        let mut doomed = Vec::new();
        for coordinator in self.registry.snapshot() {
            if !coordinator.is_expired(now) {
                continue;
            }
            let Some(status) = coordinator.expire() else {
                continue;
            };
            TransactionStats::incr(&self.stats.timed_out);
            self.observer.on_timeout(coordinator.uid(), status);
            if status != ActionStatus::Preparing {
                doomed.push(coordinator);
            }
        }
        doomed
    }

    /// Expire and abort. Returns how many transactions were rolled back.
    pub fn reap(&self, now: Instant) -> usize {
        let mut reaped = 0;
        for coordinator in self.check_expired(now) {
            match coordinator.abort() {
                Ok(_) => reaped += 1,
                Err(e) => {
                    tracing::debug!(uid = %coordinator.uid(), error = %e, "Expired transaction finished first")
                }
            }
        }
        reaped
    }

    /// Run [`Reaper::reap`] every interval on the current tokio runtime
    pub fn spawn(self) -> ReaperHandle {
        let reaper = Arc::new(self);
        let period = reaper.interval;
        let background = Background::every(period, move || {
            let reaper = Arc::clone(&reaper);
            async move {
                match tokio::task::spawn_blocking(move || reaper.reap(Instant::now())).await {
                    Ok(0) => {}
                    Ok(reaped) => tracing::info!(reaped, "Timed-out transactions rolled back"),
                    Err(e) => tracing::error!(error = %e, "Reaper pass failed"),
                }
            }
        });
        ReaperHandle { background }
    }
}

/// Running reaper loop. Dropping the handle stops it.
pub struct ReaperHandle {
    background: Background,
}

impl ReaperHandle {
    /// Has the loop exited?
    pub fn is_finished(&self) -> bool {
        self.background.is_finished()
    }

    /// Stop the loop and wait for it
    pub async fn shutdown(self) {
        self.background.shutdown().await;
    }
}

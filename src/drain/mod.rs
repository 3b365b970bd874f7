//! Write-queue drain coordination
//!
//! After a phase commits, the store may still hold queued writes. The
//! coordinator blocks until the queue is empty, sampling the drain rate
//! periodically so the user sees an ETA, and advising once when a slow
//! drain looks like a shard-count problem. It only observes the store.

use serde::Serialize;
use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use crate::cancel::CancellationToken;
use crate::constants::{
    DRAIN_EMPTY_READINGS, DRAIN_POLL_INTERVAL, DRAIN_SAMPLE_INTERVAL, MATERIAL_DRAIN_FRACTION,
    SHARD_ADVISORY_CEILING,
};
use crate::observer::{DrainProgress, PhaseObserver};
use crate::store::Store;

/// Estimated time until the queue is empty
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Eta {
    Estimate(Duration),
    /// Nothing drained during the sample, so no estimate exists
    Unknown,
}

impl fmt::Display for Eta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Eta::Estimate(duration) => write!(f, "{:.1}s", duration.as_secs_f64()),
            Eta::Unknown => f.write_str("unknown"),
        }
    }
}

/// What the drain loop reads from a write queue
pub trait QueueProbe {
    fn pending_writes(&self) -> usize;
    fn shard_count(&self) -> usize;
}

impl<S: Store + ?Sized> QueueProbe for S {
    fn pending_writes(&self) -> usize {
        self.pending_write_count()
    }

    fn shard_count(&self) -> usize {
        self.shard_factor()
    }
}

/// Drain statistics between two readings of the pending count
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrainSample {
    pub previous: usize,
    pub current: usize,
    pub drained: i64,
    pub rate: f64,
    pub eta: Eta,
}

impl DrainSample {
    pub fn compute(previous: usize, current: usize, interval: Duration) -> Self {
        let drained = previous as i64 - current as i64;
        let seconds = interval.as_secs_f64();
        let rate = if seconds > 0.0 { drained as f64 / seconds } else { 0.0 };

        // ETA = interval * remaining / drained; undefined unless something drained
        let eta = if drained > 0 {
            Duration::try_from_secs_f64(seconds * current as f64 / drained as f64)
                .map(Eta::Estimate)
                .unwrap_or(Eta::Unknown)
        } else {
            Eta::Unknown
        };

        Self {
            previous,
            current,
            drained,
            rate,
            eta,
        }
    }

    /// Whether less than `fraction` of the previous backlog drained
    pub fn is_stalled(&self, fraction: f64) -> bool {
        (self.drained as f64) < fraction * self.previous as f64
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DrainSettings {
    pub poll_interval: Duration,
    pub sample_interval: Duration,
    pub advisory_ceiling: usize,
    pub material_fraction: f64,
    pub empty_readings: u32,
}

impl Default for DrainSettings {
    fn default() -> Self {
        Self {
            poll_interval: DRAIN_POLL_INTERVAL,
            sample_interval: DRAIN_SAMPLE_INTERVAL,
            advisory_ceiling: SHARD_ADVISORY_CEILING,
            material_fraction: MATERIAL_DRAIN_FRACTION,
            empty_readings: DRAIN_EMPTY_READINGS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    Drained { elapsed: Duration },
    /// Cancelled while writes were still queued. Committed data stays queryable.
    Cancelled { remaining: usize },
}

#[derive(Debug, Clone, Default)]
pub struct FlushCoordinator {
    settings: DrainSettings,
}

impl FlushCoordinator {
    pub fn new(settings: DrainSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &DrainSettings {
        &self.settings
    }

    /// Block until `queue` reports empty on consecutive readings, or `token` is cancelled
    pub fn drain<Q: QueueProbe + ?Sized>(
        &self,
        queue: &Q,
        run_id: &str,
        token: &CancellationToken,
        observer: &dyn PhaseObserver,
    ) -> DrainOutcome {
        let started = Instant::now();
        let mut last_sample = started;
        let mut previous = queue.pending_writes();
        let mut empty_readings = 0u32;
        let mut advised = false;

        loop {
            if token.is_cancelled() {
                let remaining = queue.pending_writes();
                log::warn!("Drain of run {} cancelled with {} writes queued", run_id, remaining);
                return DrainOutcome::Cancelled { remaining };
            }

            let current = queue.pending_writes();
            if current == 0 {
                empty_readings += 1;
                if empty_readings >= self.settings.empty_readings {
                    return DrainOutcome::Drained {
                        elapsed: started.elapsed(),
                    };
                }
            } else {
                empty_readings = 0;
            }

            let since_sample = last_sample.elapsed();
            if since_sample >= self.settings.sample_interval {
                let sample = DrainSample::compute(previous, current, since_sample);
                observer.on_progress(
                    run_id,
                    &DrainProgress {
                        pending: sample.current,
                        drained: sample.drained,
                        rate: sample.rate,
                        eta: sample.eta,
                        elapsed: started.elapsed(),
                    },
                );

                let shards = queue.shard_count();
                if !advised
                    && current > 0
                    && sample.is_stalled(self.settings.material_fraction)
                    && shards < self.settings.advisory_ceiling
                {
                    observer.on_advisory(&format!(
                        "Write queue drained less than {:.0}% over the last {:.0}s with {} shard(s); \
                         consider raising the shard factor to {} or more",
                        self.settings.material_fraction * 100.0,
                        since_sample.as_secs_f64(),
                        shards,
                        self.settings.advisory_ceiling
                    ));
                    advised = true;
                }

                previous = current;
                last_sample = Instant::now();
            }

            thread::sleep(self.settings.poll_interval);
        }
    }
}

//! Keyed delay buckets that fire a callback per computation once its deadline passes.
//!
//! A [`DelayScheduler`] holds at most one pending deadline per computation. Scheduling a
//! computation again only ever moves its deadline later. A single background task per bucket
//! sleeps until the earliest deadline, fires everything that is due and goes back to sleep.

use std::collections::BTreeSet;
use std::collections::hash_map::Entry;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::computation::{Computation, ComputationId};
use crate::config::TimersConfig;
use crate::utils::sharded::Sharded;

/// The callback a [`DelayScheduler`] invokes for each due computation.
pub type FireAction<C> = Box<dyn Fn(&Arc<C>) + Send + Sync + 'static>;

/// Marks that the firing loop is not waiting for any deadline.
const IDLE: u64 = u64::MAX;

/// What [`DelayScheduler::add_or_update_to_later`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheduled {
    /// There was no pending entry, a new one was created.
    Created,
    /// The pending entry was moved to a later deadline.
    Extended,
    /// The pending entry already fires at or after the requested time.
    Unchanged,
}

struct TimerEntry<C> {
    fire_at: Instant,
    computation: Weak<C>,
}

struct Shard<C> {
    entries: FxHashMap<ComputationId, TimerEntry<C>>,
    queue: BTreeSet<(Instant, ComputationId)>,
}

impl<C> Default for Shard<C> {
    fn default() -> Self {
        Self {
            entries: Default::default(),
            queue: Default::default(),
        }
    }
}

/// A concurrent set of per-computation deadlines.
///
/// Computations are only referenced weakly. An entry whose computation was dropped in the meantime
/// is discarded without firing.
pub struct DelayScheduler<C> {
    name: &'static str,
    clock: Arc<dyn Clock>,
    action: FireAction<C>,
    shards: Sharded<Shard<C>>,
    len: AtomicUsize,
    min_extension: Option<Duration>,

    /// The reference point for `armed`.
    epoch: Instant,
    /// The deadline the firing loop currently sleeps towards, in nanoseconds since `epoch`.
    armed: AtomicU64,
    wakeup: Notify,
    shutdown: CancellationToken,
}

impl<C: Computation> DelayScheduler<C> {
    pub fn new(
        name: &'static str,
        config: &TimersConfig,
        clock: Arc<dyn Clock>,
        action: FireAction<C>,
    ) -> Self {
        let epoch = clock.now();
        Self {
            name,
            clock,
            action,
            shards: Sharded::new(config.shards),
            len: AtomicUsize::new(0),
            min_extension: config.min_extension,
            epoch,
            armed: AtomicU64::new(IDLE),
            wakeup: Notify::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Schedules `computation` to fire at `target`, or later if it is already scheduled later.
    pub fn add_or_update_to_later(&self, computation: &Arc<C>, target: Instant) -> Scheduled {
        let id = computation.id();
        let scheduled = {
            let mut guard = self.shards.lock(id);
            let shard = &mut *guard;
            match shard.entries.entry(id) {
                Entry::Occupied(mut occupied) => {
                    let current = occupied.get().fire_at;
                    let too_small = self
                        .min_extension
                        .is_some_and(|min| target.saturating_duration_since(current) < min);
                    if target <= current || too_small {
                        Scheduled::Unchanged
                    } else {
                        shard.queue.remove(&(current, id));
                        shard.queue.insert((target, id));
                        occupied.get_mut().fire_at = target;
                        Scheduled::Extended
                    }
                }
                Entry::Vacant(vacant) => {
                    vacant.insert(TimerEntry {
                        fire_at: target,
                        computation: Arc::downgrade(computation),
                    });
                    shard.queue.insert((target, id));
                    Scheduled::Created
                }
            }
        };

        match scheduled {
            Scheduled::Created => {
                self.len.fetch_add(1, Ordering::AcqRel);
                self.arm(target);
                tracing::trace!(bucket = self.name, %id, "scheduled computation");
                metric!(counter("timers.scheduled") += 1, "bucket" => self.name);
            }
            Scheduled::Extended => {
                metric!(counter("timers.extended") += 1, "bucket" => self.name);
            }
            Scheduled::Unchanged => {}
        }
        scheduled
    }

    /// Cancels the pending entry of `id`, returning whether there was one.
    pub fn remove(&self, id: ComputationId) -> bool {
        let removed = {
            let mut guard = self.shards.lock(id);
            let shard = &mut *guard;
            match shard.entries.remove(&id) {
                Some(entry) => {
                    shard.queue.remove(&(entry.fire_at, id));
                    true
                }
                None => false,
            }
        };

        if removed {
            self.len.fetch_sub(1, Ordering::AcqRel);
            tracing::trace!(bucket = self.name, %id, "removed computation");
            metric!(counter("timers.removed") += 1, "bucket" => self.name);
        }
        removed
    }

    /// The time at which `id` is going to fire, if it is scheduled.
    pub fn fire_at(&self, id: ComputationId) -> Option<Instant> {
        self.shards.lock(id).entries.get(&id).map(|entry| entry.fire_at)
    }

    /// The earliest pending deadline across all shards.
    pub fn next_fire_at(&self) -> Option<Instant> {
        self.shards
            .iter()
            .filter_map(|shard| shard.queue.first().map(|(fire_at, _)| *fire_at))
            .min()
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fires every entry that is due at `now` and returns how many callbacks were invoked.
    ///
    /// Due entries are removed under the shard locks, the callbacks run after all locks have
    /// been released.
    pub fn fire_due(&self, now: Instant) -> usize {
        let mut due = Vec::new();
        for mut guard in self.shards.iter() {
            let shard = &mut *guard;
            while let Some(&(fire_at, id)) = shard.queue.first() {
                if fire_at > now {
                    break;
                }
                shard.queue.pop_first();
                if let Some(entry) = shard.entries.remove(&id) {
                    due.push((id, entry.computation));
                }
            }
        }
        if due.is_empty() {
            return 0;
        }
        self.len.fetch_sub(due.len(), Ordering::AcqRel);

        let mut fired = 0;
        for (id, computation) in due {
            match computation.upgrade() {
                Some(computation) => {
                    tracing::debug!(bucket = self.name, %id, "firing computation");
                    (self.action)(&computation);
                    fired += 1;
                }
                None => tracing::trace!(bucket = self.name, %id, "computation already dropped"),
            }
        }

        metric!(counter("timers.fired") += fired as i64, "bucket" => self.name);
        metric!(gauge("timers.pending") = self.len() as u64, "bucket" => self.name);
        fired
    }

    /// Lowers the deadline the firing loop waits for, waking it up if necessary.
    fn arm(&self, target: Instant) {
        let target = target.saturating_duration_since(self.epoch).as_nanos();
        let target = u64::try_from(target).unwrap_or(IDLE - 1);
        let previous = self.armed.fetch_min(target, Ordering::AcqRel);
        if target < previous {
            self.wakeup.notify_one();
        }
    }

    /// Spawns the firing loop onto `handle`.
    ///
    /// The loop keeps running until [`shutdown`](Self::shutdown) is called.
    pub fn start(self: &Arc<Self>, handle: &Handle) -> JoinHandle<()> {
        tracing::info!(bucket = self.name, "starting delay scheduler");
        handle.spawn(Arc::clone(self).run())
    }

    /// Stops the firing loop. Pending entries are kept but no longer fire on their own.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            tracing::info!(bucket = self.name, pending = self.len(), "stopping delay scheduler");
            self.shutdown.cancel();
        }
    }

    async fn run(self: Arc<Self>) {
        loop {
            self.fire_due(self.clock.now());

            // Reset before looking at the shards, so that an entry added concurrently either
            // shows up in `next_fire_at` or re-arms (and thus wakes) the loop.
            self.armed.store(IDLE, Ordering::Release);
            let next = self.next_fire_at();
            if let Some(next) = next {
                self.arm_quietly(next);
            }

            let delay = next.map(|next| next.saturating_duration_since(self.clock.now()));
            let sleep = async {
                match delay {
                    Some(delay) => tokio::time::sleep(delay).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.wakeup.notified() => {}
                _ = sleep => {}
            }
        }
    }

    fn arm_quietly(&self, target: Instant) {
        let target = target.saturating_duration_since(self.epoch).as_nanos();
        let target = u64::try_from(target).unwrap_or(IDLE - 1);
        self.armed.fetch_min(target, Ordering::AcqRel);
    }
}

impl<C> fmt::Debug for DelayScheduler<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelayScheduler")
            .field("name", &self.name)
            .field("pending", &self.len.load(Ordering::Relaxed))
            .field("shards", &self.shards.shard_count())
            .field("min_extension", &self.min_extension)
            .finish()
    }
}

//! The memoized computations whose lifecycle is being managed.
//!
//! Producing and recomputing values is the job of whatever engine owns the computations. This
//! module only describes what the lifecycle machinery needs to know about them, via the
//! [`Computation`] trait, and provides [`Computed`], a straightforward implementation of it.

use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crate::invalidation::InvalidationEvent;

mod options;

pub use options::{ComputationOptions, PinPolicy, Timeout};

/// The process-unique identity of a computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ComputationId(u64);

impl ComputationId {
    /// Allocates a fresh id. Ids are never reused within a process.
    pub fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ComputationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The validity of a computation.
///
/// The only transition is `Alive -> Invalidated`, and it can never be undone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputationState {
    Alive,
    Invalidated,
}

/// A memoized computation as seen by the lifecycle machinery.
pub trait Computation: Send + Sync + 'static {
    fn id(&self) -> ComputationId;

    fn state(&self) -> ComputationState;

    /// The options of this computation, which never change.
    fn options(&self) -> &ComputationOptions;

    /// The lifecycle bucket responsible for this computation.
    ///
    /// Implementors may want to compute this once and store it.
    fn pin_policy(&self) -> PinPolicy {
        self.options().pin_policy()
    }

    /// The one-shot broadcast fired on invalidation.
    fn invalidation(&self) -> &InvalidationEvent;

    /// Drops the cached output while keeping the validity bookkeeping.
    fn release_output(&self);

    /// Called when the keep-alive pin of this computation runs out.
    fn keep_alive_expired(&self) {}

    fn is_invalidated(&self) -> bool {
        self.state() == ComputationState::Invalidated
    }
}

/// A memoized value together with its validity flag.
pub struct Computed<T> {
    id: ComputationId,
    options: ComputationOptions,
    pin_policy: PinPolicy,
    invalidated: AtomicBool,
    output: Mutex<Option<T>>,
    invalidation: InvalidationEvent,
    output_releases: AtomicUsize,
    keep_alive_expiries: AtomicUsize,
}

impl<T> Computed<T> {
    pub fn new(options: ComputationOptions, output: T) -> Self {
        Self {
            id: ComputationId::next(),
            pin_policy: options.pin_policy(),
            options,
            invalidated: AtomicBool::new(false),
            output: Mutex::new(Some(output)),
            invalidation: InvalidationEvent::new(),
            output_releases: AtomicUsize::new(0),
            keep_alive_expiries: AtomicUsize::new(0),
        }
    }

    /// Returns a copy of the cached output, if it is still held.
    pub fn output(&self) -> Option<T>
    where
        T: Clone,
    {
        self.output.lock().unwrap().clone()
    }

    pub fn has_output(&self) -> bool {
        self.output.lock().unwrap().is_some()
    }

    /// Replaces the cached output, e.g. after it was released and recomputed.
    pub fn set_output(&self, output: T) {
        *self.output.lock().unwrap() = Some(output);
    }

    /// Marks this computation as invalidated and notifies all listeners.
    ///
    /// Returns `false` if it was already invalidated.
    pub fn invalidate(&self) -> bool {
        if self
            .invalidated
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let notified = self.invalidation.fire();
        tracing::trace!(id = %self.id, notified, "computation invalidated");
        true
    }

    /// How often the output was released.
    pub fn output_releases(&self) -> usize {
        self.output_releases.load(Ordering::Acquire)
    }

    /// How often a keep-alive pin ran out.
    pub fn keep_alive_expiries(&self) -> usize {
        self.keep_alive_expiries.load(Ordering::Acquire)
    }
}

impl<T: Send + 'static> Computation for Computed<T> {
    fn id(&self) -> ComputationId {
        self.id
    }

    fn state(&self) -> ComputationState {
        if self.invalidated.load(Ordering::Acquire) {
            ComputationState::Invalidated
        } else {
            ComputationState::Alive
        }
    }

    fn options(&self) -> &ComputationOptions {
        &self.options
    }

    fn pin_policy(&self) -> PinPolicy {
        self.pin_policy
    }

    fn invalidation(&self) -> &InvalidationEvent {
        &self.invalidation
    }

    fn release_output(&self) {
        self.output.lock().unwrap().take();
        self.output_releases.fetch_add(1, Ordering::AcqRel);
    }

    fn keep_alive_expired(&self) {
        self.keep_alive_expiries.fetch_add(1, Ordering::AcqRel);
    }
}

impl<T> fmt::Debug for Computed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Computed")
            .field("id", &self.id)
            .field("options", &self.options)
            .field("invalidated", &self.invalidated.load(Ordering::Relaxed))
            .field("output_releases", &self.output_releases())
            .finish()
    }
}

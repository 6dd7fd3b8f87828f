use std::hash::BuildHasher;
use std::sync::{Mutex, MutexGuard};

use rustc_hash::FxBuildHasher;

use crate::computation::ComputationId;

/// A fixed set of independently locked values, keyed by [`ComputationId`].
///
/// Operations on different computations usually land on different shards and thus do not contend
/// on a single lock.
#[derive(Debug)]
pub struct Sharded<T> {
    shards: Box<[Mutex<T>]>,
}

impl<T: Default> Sharded<T> {
    /// Creates `count` shards, rounded up to the next power of two.
    pub fn new(count: usize) -> Self {
        let count = count.max(1).next_power_of_two();
        let shards = (0..count).map(|_| Mutex::default()).collect();
        Self { shards }
    }
}

impl<T> Sharded<T> {
    /// Locks the shard responsible for `id`.
    pub fn lock(&self, id: ComputationId) -> MutexGuard<'_, T> {
        let hash = FxBuildHasher.hash_one(id.as_u64()) as usize;
        // the upper bits of an Fx hash are better distributed than the lower ones
        let idx = hash.rotate_left(16) & (self.shards.len() - 1);
        self.shards[idx].lock().unwrap()
    }

    /// Iterates over all shards, locking them one at a time.
    pub fn iter(&self) -> impl Iterator<Item = MutexGuard<'_, T>> {
        self.shards.iter().map(|shard| shard.lock().unwrap())
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }
}

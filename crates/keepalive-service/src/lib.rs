//! Deferred lifecycle management for memoized computations.
//!
//! This crate decides, per cached computation, when its cached output is released and when its
//! keep-alive pin runs out, and it lets callers wait for a computation to become invalidated.
//!
//! - [`lifecycle::LifecycleService`] routes every use of a computation into one of two
//!   [`timers::DelayScheduler`] buckets, based on the computation's options.
//! - [`invalidation::InvalidationNotifier`] hands out cancellable futures resolving on
//!   invalidation.
//! - [`services::SharedServices`] wires both up from a [`config::Config`].

#[macro_use]
pub mod metrics;

pub mod clock;
pub mod computation;
pub mod config;
pub mod invalidation;
pub mod lifecycle;
pub mod logging;
pub mod services;
pub mod timers;
pub mod utils;

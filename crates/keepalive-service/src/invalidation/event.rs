use std::fmt;
use std::mem;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A callback run when an [`InvalidationEvent`] fires.
pub type Listener = Box<dyn FnOnce() + Send + 'static>;

/// Identifies one listener registered on an [`InvalidationEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

enum EventState {
    Pending {
        next_handle: u64,
        listeners: Vec<(u64, Listener)>,
    },
    Fired,
}

/// A one-shot broadcast of a computation's invalidation.
///
/// Listeners are appended by [`subscribe`](Self::subscribe) and drained exactly once by
/// [`fire`](Self::fire). Listeners are always invoked outside of the internal lock, so they may
/// freely call back into the event or anything else.
pub struct InvalidationEvent {
    state: Mutex<EventState>,
    total_subscriptions: AtomicUsize,
}

impl InvalidationEvent {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(EventState::Pending {
                next_handle: 0,
                listeners: Vec::new(),
            }),
            total_subscriptions: AtomicUsize::new(0),
        }
    }

    /// Registers a listener that is called once when the event fires.
    ///
    /// If the event has already fired, the listener is invoked right away and `None` is returned.
    pub fn subscribe(&self, listener: Listener) -> Option<SubscriptionHandle> {
        let mut state = self.state.lock().unwrap();
        if let EventState::Pending {
            next_handle,
            listeners,
        } = &mut *state
        {
            let handle = *next_handle;
            *next_handle += 1;
            listeners.push((handle, listener));
            self.total_subscriptions.fetch_add(1, Ordering::Relaxed);
            return Some(SubscriptionHandle(handle));
        }
        drop(state);

        listener();
        None
    }

    /// Removes a listener before the event fires.
    ///
    /// Returns `false` if the listener is unknown or the event already fired.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let mut state = self.state.lock().unwrap();
        let EventState::Pending { listeners, .. } = &mut *state else {
            return false;
        };
        match listeners.iter().position(|(id, _)| *id == handle.0) {
            Some(idx) => {
                listeners.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Fires the event, invoking all registered listeners in subscription order.
    ///
    /// Returns the number of listeners that were notified. Only the first call does anything.
    pub fn fire(&self) -> usize {
        let listeners = {
            let mut state = self.state.lock().unwrap();
            match mem::replace(&mut *state, EventState::Fired) {
                EventState::Pending { listeners, .. } => listeners,
                EventState::Fired => return 0,
            }
        };

        let notified = listeners.len();
        for (_, listener) in listeners {
            listener();
        }
        notified
    }

    pub fn has_fired(&self) -> bool {
        matches!(*self.state.lock().unwrap(), EventState::Fired)
    }

    /// The number of listeners currently waiting for the event.
    pub fn listener_count(&self) -> usize {
        match &*self.state.lock().unwrap() {
            EventState::Pending { listeners, .. } => listeners.len(),
            EventState::Fired => 0,
        }
    }

    /// The number of listeners that were ever registered while the event was pending.
    pub fn total_subscriptions(&self) -> usize {
        self.total_subscriptions.load(Ordering::Relaxed)
    }
}

impl Default for InvalidationEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for InvalidationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvalidationEvent")
            .field("fired", &self.has_fired())
            .field("listeners", &self.listener_count())
            .finish()
    }
}

//! # Listener Dispatcher
//!
//! Keeps the set of consumers attached to the live feed. Each consumer brings
//! the device addresses it wants to watch and a callback; the union of every
//! consumer's addresses is the tracked address list the feed is asked to
//! poll. Every decoded update is fanned out to all callbacks in registration
//! order by the owner.
//!
//! The dispatcher itself holds no lock. The owner wraps it in a mutex and
//! should copy the callbacks out with [`Dispatcher::listeners`] before calling
//! them, so a callback may unsubscribe without deadlocking.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::utils::normalize_address;

/// Identifier handed back on registration.
pub type ListenerId = u64;

/// A registered callback.
pub type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct ListenerHandle<T> {
    id: ListenerId,
    addresses: Vec<String>,
    callback: Listener<T>,
}

/// Result of [`Dispatcher::remove_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// The listener was removed; this many remain.
    Removed {
        /// Listeners still registered.
        remaining: usize,
    },
    /// No listener with that id (already removed).
    Unknown,
}

/// Registry of feed consumers.
pub struct Dispatcher<T> {
    listeners: Vec<ListenerHandle<T>>,
    next_id: ListenerId,
}

impl<T> Default for Dispatcher<T> {
    fn default() -> Self {
        Self {
            listeners: Vec::new(),
            next_id: 1,
        }
    }
}

impl<T> fmt::Debug for Dispatcher<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("listeners", &self.listeners.len())
            .field("next_id", &self.next_id)
            .finish()
    }
}

impl<T> Dispatcher<T> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a consumer and returns its id.
    pub fn add_listener(&mut self, addresses: &[String], callback: Listener<T>) -> ListenerId {
        let id = self.next_id;
        self.next_id += 1;
        self.listeners.push(ListenerHandle {
            id,
            addresses: addresses.iter().map(|a| normalize_address(a)).collect(),
            callback,
        });
        log::debug!("Listener {} registered ({} addresses)", id, addresses.len());
        id
    }

    /// Deregisters a consumer. Removing twice is harmless.
    pub fn remove_listener(&mut self, id: ListenerId) -> Removal {
        let before = self.listeners.len();
        self.listeners.retain(|l| l.id != id);
        if self.listeners.len() == before {
            return Removal::Unknown;
        }
        log::debug!("Listener {} removed", id);
        Removal::Removed {
            remaining: self.listeners.len(),
        }
    }

    /// Normalized, de-duplicated, sorted union of every consumer's addresses.
    pub fn tracked_addresses(&self) -> Vec<String> {
        self.listeners
            .iter()
            .flat_map(|l| l.addresses.iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Copies of the callbacks, in registration order.
    pub fn listeners(&self) -> Vec<Listener<T>> {
        self.listeners.iter().map(|l| Arc::clone(&l.callback)).collect()
    }

    /// Number of registered consumers.
    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    /// True when nobody is listening.
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

//! Deduplication of address-list announcements.
//!
//! The backend is told which devices to poll whenever the feed connects. The
//! gate lets each distinct list through once: a reconnect with an unchanged
//! list sends nothing. A send that fails is released so the next connect
//! tries again.

use std::collections::BTreeSet;

/// Remembers the last address list handed out for sending.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressGate {
    announced: Option<Vec<String>>,
}

fn canonical(addresses: &[String]) -> Vec<String> {
    addresses
        .iter()
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

impl AddressGate {
    /// Creates a gate that has announced nothing yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the list to send when it differs from the last one claimed,
    /// and records it as announced. Returns `None` when nothing changed.
    pub fn claim(&mut self, addresses: &[String]) -> Option<Vec<String>> {
        let list = canonical(addresses);
        if self.announced.as_ref() == Some(&list) {
            return None;
        }
        self.announced = Some(list.clone());
        Some(list)
    }

    /// Forgets `addresses` after a failed send, unless a newer list has been
    /// claimed in the meantime.
    pub fn release(&mut self, addresses: &[String]) {
        if self.announced.as_deref() == Some(canonical(addresses).as_slice()) {
            self.announced = None;
        }
    }
}

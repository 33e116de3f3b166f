//! Peer client tracking.
//!
//! Turns raw registration notifications into at most one
//! [`ClientConnected`](LinkEvent::ClientConnected) and one
//! [`ClientDisconnected`](LinkEvent::ClientDisconnected) per client
//! appearance. Runs only in the general-purpose domain, so the registry
//! needs no lock of its own.

use std::collections::HashSet;

use crate::LinkEvent;

/// Registry of announced peer clients.
#[derive(Debug)]
pub struct TopologyNotifier {
    own_name: String,
    known: HashSet<String>,
}

impl TopologyNotifier {
    /// Creates an empty registry that ignores `own_name`.
    pub fn new(own_name: impl Into<String>) -> Self {
        Self {
            own_name: own_name.into(),
            known: HashSet::new(),
        }
    }

    /// Returns true if `client` has been announced and not yet retired.
    pub fn is_known(&self, client: &str) -> bool {
        self.known.contains(client)
    }

    /// Number of announced clients.
    pub fn known_count(&self) -> usize {
        self.known.len()
    }

    /// A port of `client` appeared.
    ///
    /// The first time a client is seen, `port_counts` is queried for its
    /// `(inputs, outputs)` and a connected event is returned.
    pub fn port_registered(
        &mut self,
        client: &str,
        port_counts: impl FnOnce(&str) -> (usize, usize),
    ) -> Option<LinkEvent> {
        if client == self.own_name || self.known.contains(client) {
            return None;
        }
        let (inputs, outputs) = port_counts(client);
        self.known.insert(client.to_string());
        Some(LinkEvent::ClientConnected {
            name: client.to_string(),
            inputs,
            outputs,
        })
    }

    /// A port of `client` went away.
    ///
    /// Retires the client once `port_counts` reports no ports left.
    pub fn port_unregistered(
        &mut self,
        client: &str,
        port_counts: impl FnOnce(&str) -> (usize, usize),
    ) -> Option<LinkEvent> {
        if client == self.own_name || !self.known.contains(client) {
            return None;
        }
        if port_counts(client) != (0, 0) {
            return None;
        }
        self.retire(client)
    }

    /// `client` unregistered from the server. Retires it immediately.
    pub fn client_unregistered(&mut self, client: &str) -> Option<LinkEvent> {
        if client == self.own_name {
            return None;
        }
        self.retire(client)
    }

    /// Forgets every client without emitting events.
    pub fn clear(&mut self) {
        self.known.clear();
    }

    fn retire(&mut self, client: &str) -> Option<LinkEvent> {
        self.known
            .remove(client)
            .then(|| LinkEvent::ClientDisconnected {
                name: client.to_string(),
            })
    }
}

//! Registry of connected clients keyed by [`ClientId`].

use std::collections::HashMap;

use super::{Client, ClientId};

/// Process-local map of connected clients.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: HashMap<ClientId, Client>,
}

impl ClientRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a client, replacing nothing: ids are freshly generated.
    pub fn insert(&mut self, client: Client) {
        self.clients.insert(client.id(), client);
    }

    /// Returns a client by id.
    #[must_use]
    pub fn get(&self, id: ClientId) -> Option<&Client> {
        self.clients.get(&id)
    }

    /// Returns a mutable client by id.
    pub fn get_mut(&mut self, id: ClientId) -> Option<&mut Client> {
        self.clients.get_mut(&id)
    }

    /// Removes a client, returning it.
    pub fn remove(&mut self, id: ClientId) -> Option<Client> {
        self.clients.remove(&id)
    }

    /// Returns `true` if the id is registered.
    #[must_use]
    pub fn contains(&self, id: ClientId) -> bool {
        self.clients.contains_key(&id)
    }

    /// Number of connected clients.
    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Returns `true` if no client is connected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn insert_get_remove() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = ClientId::new();
        let mut registry = ClientRegistry::new();
        assert!(registry.is_empty());

        registry.insert(Client::new(id, tx, true, None, None));
        assert_eq!(registry.len(), 1);
        assert!(registry.get(id).is_some_and(Client::has_master_key));

        assert!(registry.remove(id).is_some());
        assert!(!registry.contains(id));
        assert!(registry.remove(id).is_none());
    }
}

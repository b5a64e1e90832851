//! The shared connection registry.
//!
//! One [`SocketMap`] is shared across all connections of a listener. The
//! dispatcher is the only writer: a connection is inserted once its
//! handshake bytes are on the wire, and removed as the first step of the
//! close sequence — so a broadcast issued from within `on_close` never
//! targets the closing connection itself. Handlers read it, typically to
//! broadcast.

use std::sync::Arc;

use dashmap::DashMap;
use uuid::Uuid;

use super::connection::ConnectionHandle;
use super::{Message, ReadyState};

/// A cloneable map from connection identifier to live connection handle.
#[derive(Debug, Clone, Default)]
pub struct SocketMap {
    inner: Arc<DashMap<Uuid, ConnectionHandle>>,
}

impl SocketMap {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the handle for a connection, if it is registered.
    pub fn get(&self, id: Uuid) -> Option<ConnectionHandle> {
        self.inner.get(&id).map(|entry| entry.value().clone())
    }

    /// Returns `true` if the connection is registered.
    pub fn contains(&self, id: Uuid) -> bool {
        self.inner.contains_key(&id)
    }

    /// Returns the identifiers of all registered connections.
    pub fn ids(&self) -> Vec<Uuid> {
        self.inner.iter().map(|entry| *entry.key()).collect()
    }

    /// Returns a snapshot of all registered connection handles.
    pub fn handles(&self) -> Vec<ConnectionHandle> {
        self.inner.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Returns the number of registered connections.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if no connections are registered.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Sends `message` to every open registered connection, one at a time,
    /// and returns how many sends succeeded. Per-connection failures are
    /// skipped; they surface through each connection's own send-error path.
    pub async fn broadcast(&self, message: Message) -> usize {
        let mut delivered = 0;
        for handle in self.handles() {
            if handle.ready_state() != ReadyState::Open {
                continue;
            }
            if handle.send(message.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    pub(crate) fn insert(&self, handle: ConnectionHandle) {
        self.inner.insert(handle.id(), handle);
    }

    pub(crate) fn remove(&self, id: Uuid) {
        self.inner.remove(&id);
    }
}

//! Per-node table of live connections.
//!
//! The registry maps a [ConnectionId] to the ECS entity carrying its
//! [crate::ecs::Connection] plus role-specific state. Entries never leave the
//! node that accepted the transport; other nodes reach them through the router.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use bevy_ecs::prelude::{Entity, Resource};

use crate::ecs::{ConnectionId, ParticipantPid, Role};
use crate::error::TransportError;

/// Write side of a client socket.
pub trait SocketSink: Send + Sync + fmt::Debug {
    fn send(&self, frame: &[u8]) -> Result<(), TransportError>;
}

/// Cloneable handle to a connection's socket.
#[derive(Debug, Clone)]
pub struct SocketHandle(Arc<dyn SocketSink>);

impl SocketHandle {
    pub fn new(sink: impl SocketSink + 'static) -> Self {
        Self(Arc::new(sink))
    }

    pub fn from_arc(sink: Arc<dyn SocketSink>) -> Self {
        Self(sink)
    }

    pub fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
        self.0.send(frame)
    }
}

#[derive(Debug, Default)]
struct MemorySocketState {
    frames: Vec<Vec<u8>>,
    closed: bool,
}

/// In-memory socket that records written frames. Clones share the recording.
#[derive(Debug, Clone)]
pub struct MemorySocket {
    id: ConnectionId,
    state: Arc<Mutex<MemorySocketState>>,
}

impl MemorySocket {
    pub fn new(id: ConnectionId) -> Self {
        Self {
            id,
            state: Arc::new(Mutex::new(MemorySocketState::default())),
        }
    }

    pub fn handle(&self) -> SocketHandle {
        SocketHandle::new(self.clone())
    }

    /// Frames written so far.
    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .map(|s| s.frames.clone())
            .unwrap_or_default()
    }

    pub fn take_frames(&self) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .map(|mut s| std::mem::take(&mut s.frames))
            .unwrap_or_default()
    }

    /// Subsequent sends fail as if the peer went away.
    pub fn close(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.closed = true;
        }
    }
}

impl SocketSink for MemorySocket {
    fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| TransportError::SocketClosed(self.id))?;
        if state.closed {
            return Err(TransportError::SocketClosed(self.id));
        }
        state.frames.push(frame.to_vec());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisteredConnection {
    pub entity: Entity,
    pub role: Role,
    pub participant: ParticipantPid,
}

#[derive(Debug, Default, Resource)]
pub struct ConnectionRegistry {
    connections: HashMap<ConnectionId, RegisteredConnection>,
}

impl ConnectionRegistry {
    /// Returns the previous entry when `id` was already registered.
    pub fn register(
        &mut self,
        id: ConnectionId,
        entry: RegisteredConnection,
    ) -> Option<RegisteredConnection> {
        self.connections.insert(id, entry)
    }

    pub fn unregister(&mut self, id: ConnectionId) -> Option<RegisteredConnection> {
        self.connections.remove(&id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&RegisteredConnection> {
        self.connections.get(&id)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Connection ids matching `predicate`, ascending.
    pub fn query<F>(&self, mut predicate: F) -> Vec<ConnectionId>
    where
        F: FnMut(ConnectionId, &RegisteredConnection) -> bool,
    {
        let mut ids: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|(id, entry)| predicate(**id, entry))
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bevy_ecs::world::World;

    #[test]
    fn register_query_unregister() {
        let mut world = World::new();
        let mut registry = ConnectionRegistry::default();
        for (id, role) in [(3, Role::Driver), (1, Role::Rider), (2, Role::Driver)] {
            let entity = world.spawn_empty().id();
            registry.register(
                ConnectionId(id),
                RegisteredConnection {
                    entity,
                    role,
                    participant: ParticipantPid(id * 10),
                },
            );
        }
        assert_eq!(registry.len(), 3);
        assert_eq!(
            registry.query(|_, entry| entry.role == Role::Driver),
            vec![ConnectionId(2), ConnectionId(3)]
        );
        assert_eq!(
            registry.get(ConnectionId(1)).map(|e| e.participant),
            Some(ParticipantPid(10))
        );

        assert!(registry.unregister(ConnectionId(3)).is_some());
        assert!(!registry.contains(ConnectionId(3)));
        assert!(registry.unregister(ConnectionId(3)).is_none());
    }

    #[test]
    fn closed_memory_socket_rejects_frames() {
        let socket = MemorySocket::new(ConnectionId(9));
        let handle = socket.handle();
        handle.send(&[1, 2]).expect("open socket");
        socket.close();
        assert_eq!(
            handle.send(&[3]),
            Err(TransportError::SocketClosed(ConnectionId(9)))
        );
        assert_eq!(socket.frames(), vec![vec![1, 2]]);
    }
}

use dispatch_core::ecs::{ConnectionId, RidePid};
use dispatch_core::registry::MemorySocket;
use dispatch_core::test_helpers::decode_all;
use dispatch_core::wire::WireEvent;

/// A connected client: the node it is attached to and its recording socket.
#[derive(Debug, Clone)]
pub struct Participant {
    pub node: usize,
    pub connection: ConnectionId,
    pub participant: u64,
    pub socket: MemorySocket,
}

impl Participant {
    /// Every event written to the socket so far, in order.
    pub fn events(&self) -> Vec<WireEvent> {
        decode_all(&self.socket.frames())
    }

    /// Rides this participant was offered, one entry per `Offer` frame.
    pub fn offers(&self) -> Vec<RidePid> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                WireEvent::Offer { ride } => Some(ride),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, predicate: impl Fn(&WireEvent) -> bool) -> usize {
        self.events().iter().filter(|e| predicate(e)).count()
    }
}

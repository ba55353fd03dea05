//! Registry of connected clients.
//!
//! Each subscriber gets its own channel; a broadcast fans a message out to
//! all of them and forgets any whose receiver has gone away.

use coachly_sw_protocol::ClientMessage;
use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;
use ulid::Ulid;

#[derive(Default)]
pub struct ClientRegistry {
    clients: Mutex<HashMap<Ulid, Sender<ClientMessage>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self) -> (Ulid, Receiver<ClientMessage>) {
        let (tx, rx) = mpsc::channel();
        let id = Ulid::new();
        self.lock().insert(id, tx);
        debug!(client_id = %id, "Client registered");
        (id, rx)
    }

    pub fn unregister(&self, id: &Ulid) -> bool {
        let removed = self.lock().remove(id).is_some();
        if removed {
            debug!(client_id = %id, "Client unregistered");
        }
        removed
    }

    /// Sends `message` to every live client and returns how many received it.
    pub fn broadcast(&self, message: &ClientMessage) -> usize {
        let mut clients = self.lock();
        clients.retain(|id, tx| match tx.send(message.clone()) {
            Ok(()) => true,
            Err(_) => {
                debug!(client_id = %id, "Dropping disconnected client");
                false
            }
        });
        clients.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Ulid, Sender<ClientMessage>>> {
        self.clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

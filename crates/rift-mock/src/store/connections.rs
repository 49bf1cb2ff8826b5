use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

pub type Outbox = mpsc::UnboundedSender<Message>;

/// Live connections of one broadcast rule.
#[derive(Debug, Default)]
pub struct ConnectionSet {
    members: Mutex<HashMap<u64, Outbox>>,
    next_id: AtomicU64,
}

impl ConnectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a connection unless `limit` members are already registered.
    /// The returned membership leaves the set when dropped.
    pub fn join(
        self: &Arc<Self>,
        limit: Option<usize>,
    ) -> Option<(Membership, mpsc::UnboundedReceiver<Message>)> {
        let mut members = self.members.lock();
        if let Some(limit) = limit {
            if members.len() >= limit {
                return None;
            }
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        members.insert(id, tx);
        Some((
            Membership {
                id,
                set: self.clone(),
            },
            rx,
        ))
    }

    /// Send to every member except `from`. Returns how many were reached.
    pub fn broadcast(&self, from: u64, message: &Message) -> usize {
        let members = self.members.lock();
        members
            .iter()
            .filter(|(id, _)| **id != from)
            .filter(|(_, tx)| tx.send(message.clone()).is_ok())
            .count()
    }

    pub fn len(&self) -> usize {
        self.members.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn leave(&self, id: u64) {
        self.members.lock().remove(&id);
    }
}

/// A registered broadcast connection.
#[derive(Debug)]
pub struct Membership {
    id: u64,
    set: Arc<ConnectionSet>,
}

impl Membership {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn broadcast(&self, message: &Message) -> usize {
        self.set.broadcast(self.id, message)
    }
}

impl Drop for Membership {
    fn drop(&mut self) {
        self.set.leave(self.id);
    }
}

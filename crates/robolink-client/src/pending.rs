//! Pending request table
//!
//! Maps `(duid, correlation id)` to the caller waiting on that response. Ids are drawn
//! at random from `[MIN_REQUEST_ID, MAX_REQUEST_ID]` and reserved with the map's entry
//! API, so two in-flight requests for one device never share an id.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::Rng;
use robolink_core::{ResponseMessage, MAX_REQUEST_ID, MIN_REQUEST_ID};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;

/// Give up finding a free id after this many collisions
const MAX_RESERVE_ATTEMPTS: usize = 64;

type Key = (String, u32);

struct Waiter {
    token: u64,
    tx: oneshot::Sender<ResponseMessage>,
}

#[derive(Default)]
pub struct PendingTable {
    entries: DashMap<Key, Waiter>,
    next_token: AtomicU64,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a free correlation id for `duid`
    pub fn reserve(&self, duid: &str) -> Option<Reservation<'_>> {
        let mut rng = rand::thread_rng();

        for _ in 0..MAX_RESERVE_ATTEMPTS {
            let id = rng.gen_range(MIN_REQUEST_ID..=MAX_REQUEST_ID);
            if let Entry::Vacant(slot) = self.entries.entry((duid.to_string(), id)) {
                let (tx, rx) = oneshot::channel();
                let token = self.next_token.fetch_add(1, Ordering::Relaxed);
                slot.insert(Waiter { token, tx });

                return Some(Reservation {
                    table: self,
                    key: (duid.to_string(), id),
                    token,
                    rx,
                });
            }
        }

        None
    }

    /// Hand `message` to the caller waiting on `(duid, id)`.
    ///
    /// Returns the message back when nobody is waiting, so it can be treated as a
    /// notification.
    pub fn resolve(&self, duid: &str, id: u32, message: ResponseMessage) -> Option<ResponseMessage> {
        match self.entries.remove(&(duid.to_string(), id)) {
            Some((_, waiter)) => match waiter.tx.send(message) {
                Ok(()) => None,
                // Caller gave up between timeout and removal
                Err(message) => Some(message),
            },
            None => Some(message),
        }
    }

    pub fn contains(&self, duid: &str, id: u32) -> bool {
        self.entries.contains_key(&(duid.to_string(), id))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of requests in flight for one device
    pub fn pending_for(&self, duid: &str) -> usize {
        self.entries.iter().filter(|entry| entry.key().0 == duid).count()
    }

    /// Drop every waiter; their callers observe cancellation
    pub fn clear(&self) {
        self.entries.clear();
    }
}

/// A reserved correlation id. Dropping it frees the id unless a response already did.
pub struct Reservation<'a> {
    table: &'a PendingTable,
    key: Key,
    token: u64,
    rx: oneshot::Receiver<ResponseMessage>,
}

impl Reservation<'_> {
    pub fn id(&self) -> u32 {
        self.key.1
    }

    /// Wait for the response. Errors when the entry was dropped without one.
    pub async fn wait(&mut self) -> Result<ResponseMessage, oneshot::error::RecvError> {
        (&mut self.rx).await
    }

    /// Stop waiting and free the id now.
    ///
    /// Returns a response that was delivered after the caller stopped waiting. Once
    /// this returns, `resolve` for the id hands frames back as unclaimed.
    pub fn cancel(&mut self) -> Option<ResponseMessage> {
        let token = self.token;
        self.table
            .entries
            .remove_if(&self.key, |_, waiter| waiter.token == token);
        self.rx.close();
        self.rx.try_recv().ok()
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        // Only remove our own entry; the id may have been reissued after a response
        let token = self.token;
        self.table
            .entries
            .remove_if(&self.key, |_, waiter| waiter.token == token);
    }
}

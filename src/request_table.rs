//! Provides [RequestTable] which correlates responses with the requests that were sent.
use chashmap::CHashMap;
use std::sync::Mutex;

use crate::message::Message;

/// Function called with the response to a request.
pub type Callback = Box<dyn FnOnce(Message) + Send + Sync + 'static>;

/// Table of requests that wait for a response.
///
/// Request ids are only unique within one table. Each session owns its own table.
pub struct RequestTable {
    last_id: Mutex<u32>,
    pending: CHashMap<u32, Callback>,
}

impl RequestTable {
    pub fn new() -> Self {
        Self::with_last_id(0)
    }

    fn with_last_id(last_id: u32) -> Self {
        Self {
            last_id: Mutex::new(last_id),
            pending: CHashMap::new(),
        }
    }

    /// Register `callback` and return the request id to send with the request.
    ///
    /// Returns `0` without registering anything if `callback` is `None`. Otherwise
    /// searches for the next id after the last issued one that is not pending.
    /// Zero is never issued.
    pub fn next_request_id(&self, callback: Option<Callback>) -> u32 {
        let callback = match callback {
            Some(callback) => callback,
            None => return 0,
        };
        let mut last_id = self.last_id.lock().unwrap_or_else(|err| err.into_inner());
        loop {
            let id = match last_id.wrapping_add(1) {
                0 => 1,
                id => id,
            };
            *last_id = id;
            // Only this function inserts and it holds `last_id`, so the slot
            // stays vacant between the check and the insert.
            if !self.pending.contains_key(&id) {
                self.pending.insert(id, callback);
                return id;
            }
        }
    }

    /// Resolve the pending request for `message` and call its callback.
    ///
    /// Returns `false` and drops the message if no request with the id is
    /// pending, for example because the response arrived twice.
    pub fn on_reply(&self, message: Message) -> bool {
        let request_id = message.request_id();
        let callback = if request_id == 0 {
            None
        } else {
            self.pending.remove(&request_id)
        };
        match callback {
            Some(callback) => {
                tracing::trace!(request_id, "resolved request");
                callback(message);
                true
            }
            None => {
                tracing::warn!(request_id, tag = message.tag(), "received response for unknown request");
                false
            }
        }
    }

    /// Number of requests waiting for a response.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn contains(&self, request_id: u32) -> bool {
        self.pending.contains_key(&request_id)
    }

    /// Remove the pending request without calling its callback.
    pub(crate) fn cancel(&self, request_id: u32) -> bool {
        self.pending.remove(&request_id).is_some()
    }

    /// Drop all pending callbacks without calling them.
    pub(crate) fn clear(&self) {
        let dropped = self.pending.clear();
        if !dropped.is_empty() {
            tracing::debug!(count = dropped.len(), "dropped pending requests");
        }
    }
}

impl Default for RequestTable {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RequestTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestTable")
            .field("last_id", &self.last_id)
            .field("pending", &self.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_callback(counter: &Arc<AtomicUsize>) -> Option<Callback> {
        let counter = Arc::clone(counter);
        Some(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
    }

    #[test]
    fn no_callback_no_entry() {
        let table = RequestTable::new();
        assert_eq!(table.next_request_id(None), 0);
        assert!(table.is_empty());
    }

    #[test]
    fn ids_start_at_one_and_increase() {
        let table = RequestTable::new();
        let counter = Arc::new(AtomicUsize::new(0));
        assert_eq!(table.next_request_id(counting_callback(&counter)), 1);
        assert_eq!(table.next_request_id(counting_callback(&counter)), 2);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn callback_fires_exactly_once() {
        let table = RequestTable::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let id = table.next_request_id(counting_callback(&counter));

        assert!(table.on_reply(Message::response(1, id, b"a".to_vec())));
        assert!(!table.on_reply(Message::response(1, id, b"b".to_vec())));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn unknown_reply_does_not_change_table() {
        let table = RequestTable::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let id = table.next_request_id(counting_callback(&counter));

        assert!(!table.on_reply(Message::response(1, id + 1, Vec::new())));
        assert!(!table.on_reply(Message::response(1, 0, Vec::new())));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(table.contains(id));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn wraps_around_and_skips_zero() {
        let table = RequestTable::with_last_id(u32::MAX - 1);
        let counter = Arc::new(AtomicUsize::new(0));
        assert_eq!(table.next_request_id(counting_callback(&counter)), u32::MAX);
        assert_eq!(table.next_request_id(counting_callback(&counter)), 1);
    }

    #[test]
    fn skips_pending_ids_after_wrap() {
        let table = RequestTable::with_last_id(u32::MAX);
        let counter = Arc::new(AtomicUsize::new(0));
        assert_eq!(table.next_request_id(counting_callback(&counter)), 1);
        assert_eq!(table.next_request_id(counting_callback(&counter)), 2);
        *table.last_id.lock().unwrap() = u32::MAX;
        assert_eq!(table.next_request_id(counting_callback(&counter)), 3);
    }

    #[test]
    fn clear_drops_callbacks() {
        let table = RequestTable::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let id = table.next_request_id(counting_callback(&counter));
        table.clear();
        assert!(!table.on_reply(Message::response(0, id, Vec::new())));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn concurrent_ids_are_unique() {
        let table = Arc::new(RequestTable::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let threads = (0..8)
            .map(|_| {
                let table = Arc::clone(&table);
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || {
                    (0..100)
                        .map(|_| table.next_request_id(counting_callback(&counter)))
                        .collect::<Vec<_>>()
                })
            })
            .collect::<Vec<_>>();
        let mut ids = threads
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect::<Vec<_>>();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 800);
        assert!(!ids.contains(&0));

        for id in ids {
            assert!(table.on_reply(Message::response(0, id, Vec::new())));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 800);
    }
}

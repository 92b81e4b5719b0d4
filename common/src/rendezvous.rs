//! A generic one-shot delivery registry: callers register interest in a
//! key before it exists, and whichever task later calls [`Registry::deliver`]
//! wakes every registered waiter with the same payload.
//!
//! This is the building block behind the command/result rendezvous in
//! `kubently-control-plane::queue`: `enqueue` registers a waiter for
//! `command_id`, `deliver` completes it exactly once, and a timeout races
//! the registration via `tokio::select!` in the caller. Delivery is driven
//! by an HTTP POST handler in the same process (or any process sharing
//! the store), so a plain in-process broadcast map is enough — no
//! external message bus needed.

use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::broadcast;

#[derive(Clone)]
pub struct Delivery<T>(Result<T, String>);

impl<T: Clone> Delivery<T> {
    pub fn ok(value: T) -> Self {
        Delivery(Ok(value))
    }

    pub fn err(reason: impl Into<String>) -> Self {
        Delivery(Err(reason.into()))
    }

    pub fn into_result(self) -> Result<T, String> {
        self.0
    }
}

struct Slot<T> {
    sender: broadcast::Sender<Delivery<T>>,
}

pub struct Registry<T> {
    slots: Mutex<HashMap<String, Slot<T>>>,
}

impl<T: Clone + Send + 'static> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Registry<T> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Register a waiter for `key`. Must be called before the corresponding
    /// `deliver` to guarantee observing it; if `deliver` already fired for
    /// this key before registration, the caller simply waits until timeout
    /// (callers are expected to create the pending record in the store
    /// first, then register, so there's no deliver-before-register path in
    /// practice — see `queue::enqueue`).
    pub fn register(self: &Arc<Self>, key: String) -> broadcast::Receiver<Delivery<T>> {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get(&key) {
            slot.sender.subscribe()
        } else {
            let (tx, rx) = broadcast::channel(1);
            slots.insert(key, Slot { sender: tx });
            rx
        }
    }

    /// Complete the waiter(s) for `key`, if any are registered. Returns
    /// `true` if at least one receiver existed. A second `deliver` for the
    /// same key after the first is a no-op from the caller's perspective
    /// (the slot has already been removed) — matching "duplicate Result
    /// delivery is idempotent" (I1, P1).
    pub fn deliver(&self, key: &str, value: Delivery<T>) -> bool {
        let mut slots = self.slots.lock();
        match slots.remove(key) {
            Some(slot) => {
                // Ignore send errors: no receivers means the waiter already
                // gave up (timed out) or was never registered from this
                // process instance.
                let _ = slot.sender.send(value);
                true
            }
            None => false,
        }
    }

    /// Drop a waiter without completing it (used when a timeout tombstones
    /// the command so any late, duplicate delivery is a no-op).
    pub fn forget(&self, key: &str) {
        self.slots.lock().remove(key);
    }

    pub fn is_registered(&self, key: &str) -> bool {
        self.slots.lock().contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deliver_wakes_registered_waiter() {
        let registry: Arc<Registry<u32>> = Arc::new(Registry::new());
        let mut rx = registry.register("cmd-1".to_string());
        assert!(registry.deliver("cmd-1", Delivery::ok(42)));
        let got = rx.recv().await.unwrap();
        assert_eq!(got.into_result().unwrap(), 42);
    }

    #[tokio::test]
    async fn second_deliver_is_a_noop() {
        let registry: Arc<Registry<u32>> = Arc::new(Registry::new());
        let _rx = registry.register("cmd-1".to_string());
        assert!(registry.deliver("cmd-1", Delivery::ok(1)));
        assert!(!registry.deliver("cmd-1", Delivery::ok(2)));
    }

    #[tokio::test]
    async fn deliver_with_no_waiter_is_not_an_error() {
        let registry: Arc<Registry<u32>> = Arc::new(Registry::new());
        assert!(!registry.deliver("ghost", Delivery::ok(1)));
    }

    #[tokio::test]
    async fn forget_prevents_late_duplicate_from_resurrecting_slot() {
        let registry: Arc<Registry<u32>> = Arc::new(Registry::new());
        let _rx = registry.register("cmd-1".to_string());
        registry.forget("cmd-1");
        assert!(!registry.is_registered("cmd-1"));
        assert!(!registry.deliver("cmd-1", Delivery::ok(1)));
    }
}

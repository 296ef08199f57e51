use std::{fmt, sync::Arc};

use dashmap::DashMap;
use tracing::trace;
use uuid::Uuid;

/// Whatever travels along a connection.
pub type Payload = serde_json::Value;

/// The callable behind a [`Slot`].
pub type SlotFn = Arc<dyn Fn(&Payload) + Send + Sync>;

/// A named receiver. Cloning a slot keeps its identity, so a clone can be
/// used to disconnect the original.
#[derive(Clone)]
pub struct Slot {
    id: Uuid,
    name: String,
    func: SlotFn,
}

impl Slot {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&Payload) + Send + Sync + 'static,
    {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            func: Arc::new(func),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invoke the slot directly.
    pub fn call(&self, payload: &Payload) {
        (self.func)(payload)
    }
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

struct SignalInner {
    id: Uuid,
    name: String,
    receivers: DashMap<Uuid, Slot>,
}

/// A named emitter with a set of connected slots.
#[derive(Clone)]
pub struct Signal {
    inner: Arc<SignalInner>,
}

impl Signal {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(SignalInner {
                id: Uuid::new_v4(),
                name: name.into(),
                receivers: DashMap::new(),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Connect a slot. Connecting the same slot twice is a no-op.
    pub fn connect(&self, slot: &Slot) {
        self.inner.receivers.entry(slot.id()).or_insert_with(|| slot.clone());
    }

    /// Returns `true` if the slot was connected.
    pub fn disconnect(&self, slot: &Slot) -> bool {
        self.inner.receivers.remove(&slot.id()).is_some()
    }

    pub fn is_connected(&self, slot: &Slot) -> bool {
        self.inner.receivers.contains_key(&slot.id())
    }

    pub fn receiver_count(&self) -> usize {
        self.inner.receivers.len()
    }

    /// Call every connected slot with `payload` and return how many were called.
    ///
    /// The receivers are snapshotted first, so a slot may connect or disconnect
    /// slots on this very signal without deadlocking.
    pub fn emit(&self, payload: &Payload) -> usize {
        let receivers: Vec<Slot> = self
            .inner
            .receivers
            .iter()
            .map(|kv| kv.value().clone())
            .collect();
        trace!(signal = %self.inner.name, receivers = receivers.len(), "emit");
        for slot in &receivers {
            slot.call(payload);
        }
        receivers.len()
    }

    /// Two handles are the same signal if they share the same state.
    pub fn same(&self, other: &Signal) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("receivers", &self.inner.receivers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_slot(name: &str) -> (Slot, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let slot = Slot::new(name, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        (slot, count)
    }

    #[test]
    fn emit_reaches_connected_slots_once() {
        let sig = Signal::new("modified");
        let (slot, count) = counting_slot("update");

        sig.connect(&slot);
        sig.connect(&slot.clone());
        assert_eq!(sig.receiver_count(), 1);

        assert_eq!(sig.emit(&json!(1)), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        assert!(sig.disconnect(&slot));
        assert_eq!(sig.emit(&json!(2)), 0);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn slot_receives_payload() {
        let seen = Arc::new(std::sync::Mutex::new(None));
        let s = seen.clone();
        let slot = Slot::new("set", move |p| {
            *s.lock().unwrap() = Some(p.clone());
        });
        let sig = Signal::new("value");
        sig.connect(&slot);
        sig.emit(&json!({"x": 3}));
        assert_eq!(*seen.lock().unwrap(), Some(json!({"x": 3})));
    }

    #[test]
    fn clones_share_identity() {
        let sig = Signal::new("a");
        let other = sig.clone();
        assert!(sig.same(&other));
        assert!(!sig.same(&Signal::new("a")));
    }
}

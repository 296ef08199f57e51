use std::fmt;

use dashmap::DashMap;
use tracing::{debug, trace};

use crate::{RouterError, Signal, Slot};

#[derive(Default)]
struct ChannelEntry {
    signals: Vec<Signal>,
    slots: Vec<Slot>,
}

impl ChannelEntry {
    fn is_empty(&self) -> bool {
        self.signals.is_empty() && self.slots.is_empty()
    }
}

/// The channel table.
///
/// Binding a signal to a channel connects it to every slot already bound
/// there, and binding a slot does the converse. Unbinding undoes exactly the
/// connections the channel made. A channel disappears when its last endpoint
/// is unbound.
#[derive(Default)]
pub struct ProxyRouter {
    channels: DashMap<String, ChannelEntry>,
}

impl ProxyRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind an emitter to `channel`.
    pub fn connect_signal(&self, channel: &str, signal: &Signal) -> Result<(), RouterError> {
        if channel.is_empty() {
            return Err(RouterError::EmptyChannel);
        }
        let mut entry = self.channels.entry(channel.to_string()).or_default();
        if entry.signals.iter().any(|s| s.same(signal)) {
            trace!(%channel, signal = signal.name(), "signal already bound");
            return Ok(());
        }
        for slot in &entry.slots {
            signal.connect(slot);
        }
        entry.signals.push(signal.clone());
        debug!(%channel, signal = signal.name(), "signal bound");
        Ok(())
    }

    /// Bind a receiver to `channel`.
    pub fn connect_slot(&self, channel: &str, slot: &Slot) -> Result<(), RouterError> {
        if channel.is_empty() {
            return Err(RouterError::EmptyChannel);
        }
        let mut entry = self.channels.entry(channel.to_string()).or_default();
        if entry.slots.iter().any(|s| s.id() == slot.id()) {
            trace!(%channel, slot = slot.name(), "slot already bound");
            return Ok(());
        }
        for signal in &entry.signals {
            signal.connect(slot);
        }
        entry.slots.push(slot.clone());
        debug!(%channel, slot = slot.name(), "slot bound");
        Ok(())
    }

    /// Unbind an emitter. Returns `true` if it was bound to `channel`.
    pub fn disconnect_signal(&self, channel: &str, signal: &Signal) -> bool {
        let removed = match self.channels.get_mut(channel) {
            Some(mut entry) => match entry.signals.iter().position(|s| s.same(signal)) {
                Some(pos) => {
                    entry.signals.remove(pos);
                    for slot in &entry.slots {
                        signal.disconnect(slot);
                    }
                    true
                }
                None => false,
            },
            None => false,
        };
        if removed {
            debug!(%channel, signal = signal.name(), "signal unbound");
            self.channels.remove_if(channel, |_, entry| entry.is_empty());
        }
        removed
    }

    /// Unbind a receiver. Returns `true` if it was bound to `channel`.
    pub fn disconnect_slot(&self, channel: &str, slot: &Slot) -> bool {
        let removed = match self.channels.get_mut(channel) {
            Some(mut entry) => match entry.slots.iter().position(|s| s.id() == slot.id()) {
                Some(pos) => {
                    entry.slots.remove(pos);
                    for signal in &entry.signals {
                        signal.disconnect(slot);
                    }
                    true
                }
                None => false,
            },
            None => false,
        };
        if removed {
            debug!(%channel, slot = slot.name(), "slot unbound");
            self.channels.remove_if(channel, |_, entry| entry.is_empty());
        }
        removed
    }

    pub fn has_channel(&self, channel: &str) -> bool {
        self.channels.contains_key(channel)
    }

    /// Names of every live channel, sorted.
    pub fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.iter().map(|kv| kv.key().clone()).collect();
        names.sort();
        names
    }

    /// `(signals, slots)` bound to `channel`.
    pub fn endpoint_count(&self, channel: &str) -> (usize, usize) {
        self.channels
            .get(channel)
            .map(|entry| (entry.signals.len(), entry.slots.len()))
            .unwrap_or((0, 0))
    }
}

impl fmt::Debug for ProxyRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyRouter")
            .field("channels", &self.channel_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    fn counting_slot(name: &str) -> (Slot, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (
            Slot::new(name, move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
            count,
        )
    }

    #[test]
    fn signal_then_slot_connects() {
        let router = ProxyRouter::new();
        let sig = Signal::new("modified");
        let (slot, count) = counting_slot("update");

        router.connect_signal("ch", &sig).unwrap();
        router.connect_slot("ch", &slot).unwrap();
        sig.emit(&json!(null));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(router.endpoint_count("ch"), (1, 1));
    }

    #[test]
    fn slot_then_signal_connects() {
        let router = ProxyRouter::new();
        let sig = Signal::new("modified");
        let (slot, count) = counting_slot("update");

        router.connect_slot("ch", &slot).unwrap();
        router.connect_signal("ch", &sig).unwrap();
        sig.emit(&json!(null));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn channels_are_isolated() {
        let router = ProxyRouter::new();
        let sig = Signal::new("modified");
        let (slot, count) = counting_slot("update");

        router.connect_signal("a", &sig).unwrap();
        router.connect_slot("b", &slot).unwrap();
        sig.emit(&json!(null));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn disconnect_removes_route_and_empty_channel() {
        let router = ProxyRouter::new();
        let sig = Signal::new("modified");
        let (slot, count) = counting_slot("update");

        router.connect_signal("ch", &sig).unwrap();
        router.connect_slot("ch", &slot).unwrap();
        assert!(router.disconnect_signal("ch", &sig));
        assert!(!router.disconnect_signal("ch", &sig));
        sig.emit(&json!(null));
        assert_eq!(count.load(Ordering::SeqCst), 0);

        assert!(router.has_channel("ch"));
        assert!(router.disconnect_slot("ch", &slot));
        assert!(!router.has_channel("ch"));
    }

    #[test]
    fn empty_channel_is_rejected() {
        let router = ProxyRouter::new();
        assert_eq!(
            router.connect_signal("", &Signal::new("s")),
            Err(RouterError::EmptyChannel)
        );
    }

    #[test]
    fn rebinding_is_idempotent() {
        let router = ProxyRouter::new();
        let sig = Signal::new("modified");
        let (slot, count) = counting_slot("update");
        router.connect_signal("ch", &sig).unwrap();
        router.connect_signal("ch", &sig.clone()).unwrap();
        router.connect_slot("ch", &slot).unwrap();
        router.connect_slot("ch", &slot).unwrap();
        sig.emit(&json!(null));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(router.endpoint_count("ch"), (1, 1));
    }
}

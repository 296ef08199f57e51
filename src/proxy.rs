//! Proxy connection descriptions and the manager side bookkeeping for them.
use std::{
    collections::HashMap,
    sync::atomic::{AtomicUsize, Ordering},
};

use serde::{Deserialize, Serialize};

/// Channel name that asks for a generated one.
pub const UNDEFINED_CHANNEL: &str = "undefined";

const CHANNEL_PREFIX: &str = "AppManager_channel_";

static CHANNEL_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// A fresh, process-unique channel name.
pub fn generate_channel_name() -> String {
    format!(
        "{}{}",
        CHANNEL_PREFIX,
        CHANNEL_COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

fn undefined_channel() -> String {
    UNDEFINED_CHANNEL.to_string()
}

/// Signals and slots that talk over one channel.
///
/// Both lists hold `(owner_id, name)` pairs, where the owner is a component
/// id or, for signals, an object id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConnections {
    #[serde(default = "undefined_channel")]
    pub channel: String,
    #[serde(default)]
    pub signals: Vec<(String, String)>,
    #[serde(default)]
    pub slots: Vec<(String, String)>,
}

impl Default for ProxyConnections {
    fn default() -> Self {
        Self::new(UNDEFINED_CHANNEL)
    }
}

impl ProxyConnections {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            signals: Vec::new(),
            slots: Vec::new(),
        }
    }

    pub fn add_signal_connection(&mut self, owner: impl Into<String>, signal: impl Into<String>) {
        self.signals.push((owner.into(), signal.into()));
    }

    pub fn add_slot_connection(&mut self, owner: impl Into<String>, slot: impl Into<String>) {
        self.slots.push((owner.into(), slot.into()));
    }

    pub fn is_undefined(&self) -> bool {
        self.channel == UNDEFINED_CHANNEL
    }

    /// Signal names of `owner` on this channel.
    pub fn signals_of<'a>(&'a self, owner: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.signals
            .iter()
            .filter(move |(id, _)| id == owner)
            .map(|(_, name)| name.as_str())
    }

    /// Slot names of `owner` on this channel.
    pub fn slots_of<'a>(&'a self, owner: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.slots
            .iter()
            .filter(move |(id, _)| id == owner)
            .map(|(_, name)| name.as_str())
    }
}

/// Connections accumulated per owner id, then per channel.
#[derive(Debug, Default)]
pub(crate) struct ProxyBook {
    by_owner: HashMap<String, HashMap<String, ProxyConnections>>,
}

impl ProxyBook {
    /// Merge `connections`, resolving the undefined channel first. Returns the
    /// channel the bindings ended up on.
    pub(crate) fn add(&mut self, connections: &ProxyConnections) -> String {
        let channel = if connections.is_undefined() {
            generate_channel_name()
        } else {
            connections.channel.clone()
        };

        for (owner, signal) in &connections.signals {
            self.entry(owner, &channel)
                .add_signal_connection(owner.clone(), signal.clone());
        }
        for (owner, slot) in &connections.slots {
            self.entry(owner, &channel)
                .add_slot_connection(owner.clone(), slot.clone());
        }
        channel
    }

    fn entry(&mut self, owner: &str, channel: &str) -> &mut ProxyConnections {
        self.by_owner
            .entry(owner.to_string())
            .or_default()
            .entry(channel.to_string())
            .or_insert_with(|| ProxyConnections::new(channel))
    }

    /// Everything registered for `owner`, one entry per channel.
    pub(crate) fn for_owner(&self, owner: &str) -> Vec<ProxyConnections> {
        self.by_owner
            .get(owner)
            .map(|channels| channels.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undefined_channels_get_distinct_names() {
        let mut book = ProxyBook::default();

        let mut first = ProxyConnections::default();
        first.add_signal_connection("a", "sig");
        first.add_slot_connection("b", "slot");
        let mut second = ProxyConnections::default();
        second.add_signal_connection("a", "sig2");
        second.add_slot_connection("c", "slot");

        let ch1 = book.add(&first);
        let ch2 = book.add(&second);
        assert_ne!(ch1, ch2);
        assert!(ch1.starts_with("AppManager_channel_"));
        assert_eq!(book.for_owner("a").len(), 2);
    }

    #[test]
    fn same_named_channel_accumulates() {
        let mut book = ProxyBook::default();

        let mut conn = ProxyConnections::new("X");
        conn.add_signal_connection("a", "s1");
        conn.add_signal_connection("a", "s2");
        book.add(&conn);

        let mut more = ProxyConnections::new("X");
        more.add_slot_connection("a", "receive");
        book.add(&more);

        let for_a = book.for_owner("a");
        assert_eq!(for_a.len(), 1);
        let merged = &for_a[0];
        assert_eq!(merged.channel, "X");
        assert_eq!(merged.signals_of("a").collect::<Vec<_>>(), vec!["s1", "s2"]);
        assert_eq!(merged.slots_of("a").collect::<Vec<_>>(), vec!["receive"]);
    }

    #[test]
    fn owners_only_see_their_own_bindings() {
        let mut book = ProxyBook::default();
        let mut conn = ProxyConnections::new("ch");
        conn.add_signal_connection("image", "modified");
        conn.add_slot_connection("viewer", "update");
        book.add(&conn);

        let image = book.for_owner("image");
        assert_eq!(image[0].signals.len(), 1);
        assert!(image[0].slots.is_empty());
        assert!(book.for_owner("nobody").is_empty());
    }

    #[test]
    fn missing_channel_deserializes_as_undefined() {
        let conn: ProxyConnections =
            serde_json::from_str(r#"{"signals": [["a", "sig"]]}"#).unwrap();
        assert!(conn.is_undefined());
        assert_eq!(conn.signals, vec![("a".to_string(), "sig".to_string())]);
    }
}

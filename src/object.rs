//! Data objects, the factory that builds default ones, and the process-wide
//! object registry with its registered/unregistered notifications.
use std::{
    fmt,
    sync::{
        Arc, PoisonError, RwLock, Weak,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use dashmap::DashMap;
use proxy_router::Signal;
use serde_json::{Value, json};
use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::worker::Worker;

/// Emitted by [`Object::set_value`] with the new value as payload.
pub const MODIFIED_SIG: &str = "modified";

static OBJECT_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Shared handle on a data object. Identity is pointer identity.
pub type DataObject = Arc<Object>;

/// An opaque piece of application data.
///
/// The manager never looks inside; it only compares handles and hands them to
/// the components bound to them.
pub struct Object {
    uid: String,
    type_name: String,
    value: RwLock<Value>,
    signals: DashMap<String, Signal>,
}

impl Object {
    /// Build an object with a generated `"<type>-<n>"` uid.
    pub fn new(type_name: impl Into<String>, value: Value) -> DataObject {
        let type_name = type_name.into();
        let uid = format!(
            "{}-{}",
            type_name,
            OBJECT_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        Self::with_uid(uid, type_name, value)
    }

    pub fn with_uid(uid: impl Into<String>, type_name: impl Into<String>, value: Value) -> DataObject {
        Arc::new(Object {
            uid: uid.into(),
            type_name: type_name.into(),
            value: RwLock::new(value),
            signals: DashMap::new(),
        })
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn value(&self) -> Value {
        self.value
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the value and emit [`MODIFIED_SIG`].
    pub fn set_value(&self, value: Value) {
        {
            let mut guard = self.value.write().unwrap_or_else(PoisonError::into_inner);
            *guard = value.clone();
        }
        self.signal(MODIFIED_SIG).emit(&value);
    }

    /// The named signal of this object, created on first use.
    pub fn signal(&self, name: &str) -> Signal {
        self.signals
            .entry(name.to_string())
            .or_insert_with(|| Signal::new(name))
            .clone()
    }

    /// Same instance, not same content.
    pub fn same(a: &DataObject, b: &DataObject) -> bool {
        Arc::ptr_eq(a, b)
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Object")
            .field("uid", &self.uid)
            .field("type", &self.type_name)
            .finish()
    }
}

/// Compare two optional handles by identity.
pub fn same_object(a: Option<&DataObject>, b: Option<&DataObject>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Object::same(a, b),
        (None, None) => true,
        _ => false,
    }
}

/// Builds the default value of a data type.
pub type DataConstructor = Arc<dyn Fn() -> Value + Send + Sync>;

/// Type name → default object constructor.
#[derive(Clone, Default)]
pub struct DataFactory {
    constructors: DashMap<String, DataConstructor>,
}

impl DataFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// A factory that knows the basic value types.
    pub fn with_defaults() -> Self {
        let factory = Self::new();
        factory.register("boolean", || json!(false));
        factory.register("integer", || json!(0));
        factory.register("float", || json!(0.0));
        factory.register("string", || json!(""));
        factory.register("list", || json!([]));
        factory.register("map", || json!({}));
        factory
    }

    pub fn register<F>(&self, type_name: &str, constructor: F)
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        self.constructors
            .insert(type_name.to_string(), Arc::new(constructor));
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.constructors.contains_key(type_name)
    }

    /// A fresh object of `type_name`, or `None` if the type is unknown.
    pub fn create(&self, type_name: &str) -> Option<DataObject> {
        let constructor = self.constructors.get(type_name)?.value().clone();
        Some(Object::new(type_name, constructor()))
    }
}

impl fmt::Debug for DataFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<String> = self.constructors.iter().map(|kv| kv.key().clone()).collect();
        types.sort();
        f.debug_struct("DataFactory").field("types", &types).finish()
    }
}

/// Subscribers get every object registration and unregistration.
#[async_trait]
pub trait ObjectEventHandler: Send + Sync {
    async fn object_registered(&self, obj: DataObject, id: String);
    async fn object_unregistered(&self, obj: DataObject, id: String);
}

enum ObjectEvent {
    Registered(DataObject, String),
    Unregistered(DataObject, String),
}

/// Process-wide object lookup plus the registered/unregistered notification
/// source.
///
/// Lookups hold weak references: an object disappears from here as soon as
/// its last owner drops it. Notifications are delivered in order by a single
/// dispatcher task on the worker.
pub struct ObjectRegistry {
    objects: DashMap<String, Weak<Object>>,
    handlers: Arc<DashMap<Uuid, Arc<dyn ObjectEventHandler>>>,
    events: UnboundedSender<ObjectEvent>,
}

impl ObjectRegistry {
    pub fn new(worker: &Worker) -> Self {
        let handlers: Arc<DashMap<Uuid, Arc<dyn ObjectEventHandler>>> = Arc::new(DashMap::new());
        let (events, mut rx) = unbounded_channel::<ObjectEvent>();

        let subs = handlers.clone();
        worker.spawn_background(async move {
            while let Some(event) = rx.recv().await {
                // grab the handlers first so no map guard is held across an await
                let current: Vec<Arc<dyn ObjectEventHandler>> =
                    subs.iter().map(|kv| kv.value().clone()).collect();
                for handler in current {
                    match &event {
                        ObjectEvent::Registered(obj, id) => {
                            handler.object_registered(obj.clone(), id.clone()).await
                        }
                        ObjectEvent::Unregistered(obj, id) => {
                            handler.object_unregistered(obj.clone(), id.clone()).await
                        }
                    }
                }
            }
            trace!("object event dispatcher stopped");
        });

        Self {
            objects: DashMap::new(),
            handlers,
            events,
        }
    }

    /// Make `obj` findable by its uid.
    pub fn track(&self, obj: &DataObject) {
        self.objects
            .insert(obj.uid().to_string(), Arc::downgrade(obj));
    }

    /// Find a live object by uid.
    pub fn find(&self, uid: &str) -> Option<DataObject> {
        if uid.is_empty() {
            return None;
        }
        let found = self.objects.get(uid)?.value().upgrade();
        if found.is_none() {
            self.objects.remove_if(uid, |_, weak| weak.strong_count() == 0);
        }
        found
    }

    pub fn subscribe(&self, handler: Arc<dyn ObjectEventHandler>) -> Uuid {
        let id = Uuid::new_v4();
        self.handlers.insert(id, handler);
        id
    }

    /// Returns `true` if the subscription existed.
    pub fn unsubscribe(&self, subscription: &Uuid) -> bool {
        self.handlers.remove(subscription).is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.handlers.len()
    }

    /// Announce that `obj` is now available under `id`.
    pub fn notify_registered(&self, obj: DataObject, id: &str) {
        self.track(&obj);
        debug!(%id, uid = obj.uid(), "object registered");
        if self
            .events
            .send(ObjectEvent::Registered(obj, id.to_string()))
            .is_err()
        {
            warn!(%id, "object event dispatcher is gone");
        }
    }

    /// Announce that `obj` is no longer available under `id`.
    pub fn notify_unregistered(&self, obj: DataObject, id: &str) {
        debug!(%id, uid = obj.uid(), "object unregistered");
        if self
            .events
            .send(ObjectEvent::Unregistered(obj, id.to_string()))
            .is_err()
        {
            warn!(%id, "object event dispatcher is gone");
        }
    }
}

impl fmt::Debug for ObjectRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectRegistry")
            .field("objects", &self.objects.len())
            .field("subscribers", &self.handlers.len())
            .finish()
    }
}

//! The contract between the manager and the components it orchestrates.
use std::{fmt, sync::Arc};

use proxy_router::{Signal, Slot};
use serde::{Deserialize, Serialize};

use crate::{
    object::DataObject,
    proxy::ProxyConnections,
    worker::{Completion, Worker},
};

/// How a component uses a bound object.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    Input,
    Output,
    InOut,
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Access::Input => "input",
            Access::Output => "output",
            Access::InOut => "inout",
        };
        f.write_str(s)
    }
}

/// A declared dependency: the object registered under `object_id` is bound
/// to the component under the local `key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectBinding {
    pub object_id: String,
    pub key: String,
    pub access: Access,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub auto_connect: bool,
}

impl ObjectBinding {
    pub fn new(object_id: impl Into<String>, key: impl Into<String>, access: Access) -> Self {
        Self {
            object_id: object_id.into(),
            key: key.into(),
            access,
            optional: false,
            auto_connect: false,
        }
    }

    pub fn optional(mut self, optional: bool) -> Self {
        self.optional = optional;
        self
    }

    pub fn auto_connect(mut self, auto_connect: bool) -> Self {
        self.auto_connect = auto_connect;
        self
    }

    /// Only inputs and inouts gate a start; outputs are produced.
    pub fn is_required(&self) -> bool {
        !self.optional && self.access != Access::Output
    }
}

/// Lifecycle state of a component.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ServiceStatus {
    #[default]
    Stopped,
    Starting,
    Started,
    /// Started, with an optional binding being replaced.
    Swapping,
    Stopping,
}

/// What the manager needs from a component.
///
/// Transitions are asynchronous: `start`, `stop`, `update` and `swap` return
/// immediately with a [`Completion`] that is already running. All entry points
/// must be thread-safe and idempotent with respect to the current state.
pub trait Component: Send + Sync {
    fn id(&self) -> &str;

    fn status(&self) -> ServiceStatus;

    fn is_started(&self) -> bool {
        matches!(self.status(), ServiceStatus::Started | ServiceStatus::Swapping)
    }

    fn is_stopped(&self) -> bool {
        self.status() == ServiceStatus::Stopped
    }

    fn set_worker(&self, worker: Worker);

    fn start(&self) -> Completion;
    fn stop(&self) -> Completion;
    fn update(&self) -> Completion;

    /// Tell a started component that the optional binding `key` changed.
    /// `previous` is the object that was bound before.
    fn swap(&self, key: &str, previous: Option<DataObject>) -> Completion;

    /// Declare a binding.
    fn register_object(&self, binding: ObjectBinding);

    /// Retarget the binding declared under `key` to another object id.
    fn set_object_id(&self, key: &str, object_id: &str);

    fn bind(&self, obj: DataObject, key: &str, access: Access, auto_connect: bool, optional: bool);
    fn unbind(&self, key: &str, access: Access);
    fn bound_object(&self, key: &str, access: Access) -> Option<DataObject>;

    /// Every required binding currently resolves to an object.
    fn has_all_required_objects(&self) -> bool;

    /// The binding declared for `object_id`, if any.
    fn required_binding_for(&self, object_id: &str) -> Option<ObjectBinding>;

    /// Hand over a channel description; the component binds its own signals
    /// and slots named there while it runs.
    fn add_proxy_connection(&self, connections: ProxyConnections);

    fn signal(&self, name: &str) -> Signal;
    fn slot(&self, name: &str) -> Option<Slot>;
}

/// Same component instance.
pub fn same_service(a: &Arc<dyn Component>, b: &Arc<dyn Component>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

//! The stock [`Component`] implementation: a lifecycle state machine around
//! user supplied [`ServiceLogic`].
use std::{
    fmt,
    sync::{Arc, PoisonError, RwLock, Weak},
};

use async_trait::async_trait;
use dashmap::DashMap;
use proxy_router::{Payload, ProxyRouter, Signal, Slot};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::{
    component::{Access, Component, ObjectBinding, ServiceStatus},
    error::ServiceError,
    object::{DataObject, MODIFIED_SIG, ObjectRegistry},
    proxy::ProxyConnections,
    worker::{Completion, Worker},
};

pub const STARTED_SIG: &str = "started";
pub const STOPPED_SIG: &str = "stopped";
pub const UPDATED_SIG: &str = "updated";
pub const SWAPPED_SIG: &str = "swapped";

pub const START_SLOT: &str = "start";
pub const STOP_SLOT: &str = "stop";
pub const UPDATE_SLOT: &str = "update";

/// What a service actually does. Every hook defaults to doing nothing.
#[async_trait]
pub trait ServiceLogic: Send + Sync + 'static {
    async fn starting(&self, _service: &Service) -> anyhow::Result<()> {
        Ok(())
    }

    async fn stopping(&self, _service: &Service) -> anyhow::Result<()> {
        Ok(())
    }

    async fn updating(&self, _service: &Service) -> anyhow::Result<()> {
        Ok(())
    }

    /// The optional binding `key` now points at another object (or none);
    /// `previous` is what it pointed at before.
    async fn swapping(
        &self,
        _service: &Service,
        _key: &str,
        _previous: Option<DataObject>,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Framework pieces a service talks to.
#[derive(Clone, Debug)]
pub struct ServiceContext {
    pub router: Arc<ProxyRouter>,
    pub objects: Arc<ObjectRegistry>,
}

#[derive(Clone)]
struct BoundObject {
    object: DataObject,
    auto_connect: bool,
}

struct ServiceInner {
    id: String,
    type_name: String,
    logic: Arc<dyn ServiceLogic>,
    context: ServiceContext,
    status: RwLock<ServiceStatus>,
    worker: RwLock<Option<Worker>>,
    bindings: RwLock<Vec<ObjectBinding>>,
    objects: DashMap<(String, Access), BoundObject>,
    signals: DashMap<String, Signal>,
    slots: DashMap<String, Slot>,
    /// channel → connections handed over by the manager
    proxies: DashMap<String, ProxyConnections>,
    /// binding key → object signal currently wired to the update slot
    auto_connections: DashMap<String, Signal>,
}

/// A cheap, clonable handle on a running or stopped service.
#[derive(Clone)]
pub struct Service {
    inner: Arc<ServiceInner>,
}

impl Service {
    pub fn new(
        id: impl Into<String>,
        type_name: impl Into<String>,
        logic: Arc<dyn ServiceLogic>,
        context: ServiceContext,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<ServiceInner>| {
            let slots = DashMap::new();
            for name in [START_SLOT, STOP_SLOT, UPDATE_SLOT] {
                let weak = weak.clone();
                let slot = Slot::new(name, move |_payload: &Payload| {
                    if let Some(inner) = weak.upgrade() {
                        let service = Service { inner };
                        let completion = match name {
                            START_SLOT => service.start(),
                            STOP_SLOT => service.stop(),
                            _ => service.update(),
                        };
                        completion.detach();
                    }
                });
                slots.insert(name.to_string(), slot);
            }

            ServiceInner {
                id: id.into(),
                type_name: type_name.into(),
                logic,
                context,
                status: RwLock::new(ServiceStatus::Stopped),
                worker: RwLock::new(None),
                bindings: RwLock::new(Vec::new()),
                objects: DashMap::new(),
                signals: DashMap::new(),
                slots,
                proxies: DashMap::new(),
                auto_connections: DashMap::new(),
            }
        });
        Service { inner }
    }

    pub fn type_name(&self) -> &str {
        &self.inner.type_name
    }

    pub fn bindings(&self) -> Vec<ObjectBinding> {
        self.inner
            .bindings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn input(&self, key: &str) -> Option<DataObject> {
        self.bound_object(key, Access::Input)
    }

    pub fn inout(&self, key: &str) -> Option<DataObject> {
        self.bound_object(key, Access::InOut)
    }

    pub fn output(&self, key: &str) -> Option<DataObject> {
        self.bound_object(key, Access::Output)
    }

    /// Publish (or withdraw, with `None`) the output declared under `key`.
    ///
    /// The object is announced through the object registry under the
    /// binding's object id, which lets a manager bind it to the services that
    /// consume it.
    pub fn set_output(&self, key: &str, obj: Option<DataObject>) -> Result<(), ServiceError> {
        let binding = self
            .bindings()
            .into_iter()
            .find(|b| b.key == key && b.access == Access::Output)
            .ok_or_else(|| ServiceError::UnknownKey {
                service: self.inner.id.clone(),
                key: key.to_string(),
            })?;
        let slot_key = (key.to_string(), Access::Output);

        match obj {
            Some(obj) => {
                let previous = self.inner.objects.insert(
                    slot_key,
                    BoundObject {
                        object: obj.clone(),
                        auto_connect: binding.auto_connect,
                    },
                );
                if previous.is_some_and(|p| Arc::ptr_eq(&p.object, &obj)) {
                    return Ok(());
                }
                debug!(service = %self.inner.id, %key, id = %binding.object_id, "output set");
                self.inner
                    .context
                    .objects
                    .notify_registered(obj, &binding.object_id);
            }
            None => {
                if let Some((_, previous)) = self.inner.objects.remove(&slot_key) {
                    debug!(service = %self.inner.id, %key, "output withdrawn");
                    self.inner
                        .context
                        .objects
                        .notify_unregistered(previous.object, &binding.object_id);
                }
            }
        }
        Ok(())
    }

    /// Add a custom receiver that proxy connections can target by name.
    pub fn new_slot<F>(&self, name: &str, func: F) -> Slot
    where
        F: Fn(&Payload) + Send + Sync + 'static,
    {
        let slot = Slot::new(name, func);
        self.inner.slots.insert(name.to_string(), slot.clone());
        slot
    }

    pub fn emit(&self, signal: &str, payload: &Payload) -> usize {
        self.signal(signal).emit(payload)
    }

    fn worker(&self) -> Option<Worker> {
        self.inner
            .worker
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .or_else(Worker::current)
    }

    fn set_status(&self, status: ServiceStatus) {
        *self
            .inner
            .status
            .write()
            .unwrap_or_else(PoisonError::into_inner) = status;
    }

    /// Atomically move `from` → `to`. Returns `false` if the state was not `from`.
    fn transition(&self, from: ServiceStatus, to: ServiceStatus) -> bool {
        let mut status = self
            .inner
            .status
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if *status != from {
            return false;
        }
        *status = to;
        true
    }

    fn failed(&self, err: anyhow::Error) -> ServiceError {
        ServiceError::Failed {
            service: self.inner.id.clone(),
            reason: format!("{err:#}"),
        }
    }

    fn notify(&self, signal: &str) {
        self.emit(signal, &json!({ "service": self.inner.id }));
    }

    fn connect_proxies(&self) {
        let router = &self.inner.context.router;
        let connections: Vec<ProxyConnections> = self
            .inner
            .proxies
            .iter()
            .map(|kv| kv.value().clone())
            .collect();
        for conn in connections {
            for name in conn.signals_of(&self.inner.id) {
                if let Err(e) = router.connect_signal(&conn.channel, &self.signal(name)) {
                    warn!(service = %self.inner.id, channel = %conn.channel, "cannot bind signal `{name}`: {e}");
                }
            }
            for name in conn.slots_of(&self.inner.id) {
                match self.slot(name) {
                    Some(slot) => {
                        if let Err(e) = router.connect_slot(&conn.channel, &slot) {
                            warn!(service = %self.inner.id, channel = %conn.channel, "cannot bind slot `{name}`: {e}");
                        }
                    }
                    None => warn!(service = %self.inner.id, "no slot named `{name}`"),
                }
            }
        }
    }

    fn disconnect_proxies(&self) {
        let router = &self.inner.context.router;
        let connections: Vec<ProxyConnections> = self
            .inner
            .proxies
            .iter()
            .map(|kv| kv.value().clone())
            .collect();
        for conn in connections {
            for name in conn.signals_of(&self.inner.id) {
                router.disconnect_signal(&conn.channel, &self.signal(name));
            }
            for name in conn.slots_of(&self.inner.id) {
                if let Some(slot) = self.slot(name) {
                    router.disconnect_slot(&conn.channel, &slot);
                }
            }
        }
    }

    fn update_slot(&self) -> Option<Slot> {
        self.slot(UPDATE_SLOT)
    }

    fn connect_auto(&self, key: &str, object: &DataObject) {
        if let Some(slot) = self.update_slot() {
            let signal = object.signal(MODIFIED_SIG);
            signal.connect(&slot);
            self.inner.auto_connections.insert(key.to_string(), signal);
        }
    }

    fn disconnect_auto(&self, key: &str) {
        if let Some((_, signal)) = self.inner.auto_connections.remove(key) {
            if let Some(slot) = self.update_slot() {
                signal.disconnect(&slot);
            }
        }
    }

    fn connect_auto_objects(&self) {
        let wanted: Vec<(String, DataObject)> = self
            .inner
            .objects
            .iter()
            .filter(|kv| kv.value().auto_connect)
            .map(|kv| (kv.key().0.clone(), kv.value().object.clone()))
            .collect();
        for (key, object) in wanted {
            self.connect_auto(&key, &object);
        }
    }

    fn disconnect_auto_objects(&self) {
        let keys: Vec<String> = self
            .inner
            .auto_connections
            .iter()
            .map(|kv| kv.key().clone())
            .collect();
        for key in keys {
            self.disconnect_auto(&key);
        }
    }

    /// Rewire the auto connection of `key` to whatever is bound now.
    fn refresh_auto(&self, key: &str) {
        self.disconnect_auto(key);
        let current = self
            .inner
            .objects
            .iter()
            .find(|kv| kv.key().0 == key && kv.value().auto_connect)
            .map(|kv| kv.value().object.clone());
        if let Some(object) = current {
            self.connect_auto(key, &object);
        }
    }

    async fn run_start(self) -> Result<(), ServiceError> {
        let logic = self.inner.logic.clone();
        match logic.starting(&self).await {
            Ok(()) => {
                self.connect_auto_objects();
                self.set_status(ServiceStatus::Started);
                info!(service = %self.inner.id, "started");
                self.notify(STARTED_SIG);
                Ok(())
            }
            Err(e) => {
                self.disconnect_proxies();
                self.set_status(ServiceStatus::Stopped);
                let err = self.failed(e);
                error!("{err}");
                Err(err)
            }
        }
    }

    async fn run_stop(self) -> Result<(), ServiceError> {
        let logic = self.inner.logic.clone();
        let result = logic.stopping(&self).await;
        self.disconnect_proxies();
        self.set_status(ServiceStatus::Stopped);
        info!(service = %self.inner.id, "stopped");
        self.notify(STOPPED_SIG);
        result.map_err(|e| {
            let err = self.failed(e);
            error!("{err}");
            err
        })
    }

    async fn run_update(self) -> Result<(), ServiceError> {
        let logic = self.inner.logic.clone();
        match logic.updating(&self).await {
            Ok(()) => {
                debug!(service = %self.inner.id, "updated");
                self.notify(UPDATED_SIG);
                Ok(())
            }
            Err(e) => {
                let err = self.failed(e);
                error!("{err}");
                Err(err)
            }
        }
    }

    async fn run_swap(self, key: String, previous: Option<DataObject>) -> Result<(), ServiceError> {
        self.refresh_auto(&key);
        let logic = self.inner.logic.clone();
        let result = logic.swapping(&self, &key, previous).await;
        self.transition(ServiceStatus::Swapping, ServiceStatus::Started);
        match result {
            Ok(()) => {
                debug!(service = %self.inner.id, %key, "swapped");
                self.notify(SWAPPED_SIG);
                Ok(())
            }
            Err(e) => {
                let err = self.failed(e);
                error!("{err}");
                Err(err)
            }
        }
    }
}

impl Component for Service {
    fn id(&self) -> &str {
        &self.inner.id
    }

    fn status(&self) -> ServiceStatus {
        *self
            .inner
            .status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_worker(&self, worker: Worker) {
        *self
            .inner
            .worker
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(worker);
    }

    fn start(&self) -> Completion {
        if !self.transition(ServiceStatus::Stopped, ServiceStatus::Starting) {
            debug!(service = %self.inner.id, status = ?self.status(), "start ignored");
            return Completion::ready();
        }
        let Some(worker) = self.worker() else {
            self.set_status(ServiceStatus::Stopped);
            return Completion::failed(ServiceError::NoWorker(self.inner.id.clone()));
        };
        // routes must exist before the first instruction of `starting` runs
        self.connect_proxies();
        worker.spawn(self.clone().run_start())
    }

    fn stop(&self) -> Completion {
        if !self.transition(ServiceStatus::Started, ServiceStatus::Stopping) {
            debug!(service = %self.inner.id, status = ?self.status(), "stop ignored");
            return Completion::ready();
        }
        let Some(worker) = self.worker() else {
            self.set_status(ServiceStatus::Started);
            return Completion::failed(ServiceError::NoWorker(self.inner.id.clone()));
        };
        self.disconnect_auto_objects();
        worker.spawn(self.clone().run_stop())
    }

    fn update(&self) -> Completion {
        if self.status() != ServiceStatus::Started {
            debug!(service = %self.inner.id, status = ?self.status(), "update ignored");
            return Completion::ready();
        }
        match self.worker() {
            Some(worker) => worker.spawn(self.clone().run_update()),
            None => Completion::failed(ServiceError::NoWorker(self.inner.id.clone())),
        }
    }

    fn swap(&self, key: &str, previous: Option<DataObject>) -> Completion {
        if !self.transition(ServiceStatus::Started, ServiceStatus::Swapping) {
            debug!(service = %self.inner.id, %key, status = ?self.status(), "swap ignored");
            return Completion::ready();
        }
        let Some(worker) = self.worker() else {
            self.set_status(ServiceStatus::Started);
            return Completion::failed(ServiceError::NoWorker(self.inner.id.clone()));
        };
        worker.spawn(self.clone().run_swap(key.to_string(), previous))
    }

    fn register_object(&self, binding: ObjectBinding) {
        let mut bindings = self
            .inner
            .bindings
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match bindings
            .iter_mut()
            .find(|b| b.key == binding.key && b.access == binding.access)
        {
            Some(existing) => *existing = binding,
            None => bindings.push(binding),
        }
    }

    fn set_object_id(&self, key: &str, object_id: &str) {
        let mut bindings = self
            .inner
            .bindings
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match bindings.iter_mut().find(|b| b.key == key) {
            Some(binding) => binding.object_id = object_id.to_string(),
            None => warn!(service = %self.inner.id, %key, "set_object_id on an undeclared key"),
        }
    }

    fn bind(&self, obj: DataObject, key: &str, access: Access, auto_connect: bool, _optional: bool) {
        debug!(service = %self.inner.id, %key, %access, uid = obj.uid(), "bind");
        self.inner.objects.insert(
            (key.to_string(), access),
            BoundObject {
                object: obj,
                auto_connect,
            },
        );
    }

    fn unbind(&self, key: &str, access: Access) {
        if self
            .inner
            .objects
            .remove(&(key.to_string(), access))
            .is_some()
        {
            debug!(service = %self.inner.id, %key, %access, "unbind");
        }
    }

    fn bound_object(&self, key: &str, access: Access) -> Option<DataObject> {
        self.inner
            .objects
            .get(&(key.to_string(), access))
            .map(|bound| bound.object.clone())
    }

    fn has_all_required_objects(&self) -> bool {
        self.bindings().iter().filter(|b| b.is_required()).all(|b| {
            let present = self.inner.objects.contains_key(&(b.key.clone(), b.access));
            if !present {
                debug!(service = %self.inner.id, key = %b.key, "required object is missing");
            }
            present
        })
    }

    fn required_binding_for(&self, object_id: &str) -> Option<ObjectBinding> {
        self.inner
            .bindings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|b| b.object_id == object_id)
            .cloned()
    }

    fn add_proxy_connection(&self, connections: ProxyConnections) {
        self.inner
            .proxies
            .insert(connections.channel.clone(), connections);
    }

    fn signal(&self, name: &str) -> Signal {
        self.inner
            .signals
            .entry(name.to_string())
            .or_insert_with(|| Signal::new(name))
            .clone()
    }

    fn slot(&self, name: &str) -> Option<Slot> {
        self.inner.slots.get(name).map(|s| s.value().clone())
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("id", &self.inner.id)
            .field("type", &self.inner.type_name)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Object;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Journal(Mutex<Vec<String>>);

    #[async_trait]
    impl ServiceLogic for Journal {
        async fn starting(&self, service: &Service) -> anyhow::Result<()> {
            self.0.lock().unwrap().push(format!("start {}", service.id()));
            Ok(())
        }
        async fn updating(&self, service: &Service) -> anyhow::Result<()> {
            self.0.lock().unwrap().push(format!("update {}", service.id()));
            Ok(())
        }
    }

    struct Broken;

    #[async_trait]
    impl ServiceLogic for Broken {
        async fn starting(&self, _service: &Service) -> anyhow::Result<()> {
            anyhow::bail!("device not found")
        }
    }

    fn context() -> ServiceContext {
        let worker = Worker::current().expect("runtime");
        ServiceContext {
            router: Arc::new(ProxyRouter::new()),
            objects: Arc::new(ObjectRegistry::new(&worker)),
        }
    }

    #[tokio::test]
    async fn start_update_stop_cycle() {
        let journal = Arc::new(Journal::default());
        let svc = Service::new("svc", "journal", journal.clone(), context());

        assert!(svc.is_stopped());
        svc.start().wait().await.unwrap();
        assert!(svc.is_started());
        // a second start is a no-op
        svc.start().wait().await.unwrap();
        svc.update().wait().await.unwrap();
        svc.stop().wait().await.unwrap();
        assert!(svc.is_stopped());
        // update on a stopped service does nothing
        svc.update().wait().await.unwrap();

        assert_eq!(*journal.0.lock().unwrap(), vec!["start svc", "update svc"]);
    }

    #[tokio::test]
    async fn failed_start_leaves_service_stopped() {
        let svc = Service::new("broken", "broken", Arc::new(Broken), context());
        let err = svc.start().wait().await.unwrap_err();
        assert!(matches!(err, ServiceError::Failed { .. }));
        assert!(err.to_string().contains("device not found"));
        assert!(svc.is_stopped());
    }

    #[tokio::test]
    async fn required_objects_follow_bindings() {
        let svc = Service::new("svc", "journal", Arc::new(Journal::default()), context());
        svc.register_object(ObjectBinding::new("img", "image", Access::Input));
        svc.register_object(ObjectBinding::new("tf", "tf", Access::Input).optional(true));
        svc.register_object(ObjectBinding::new("out", "mesh", Access::Output));
        assert!(!svc.has_all_required_objects());

        let img = Object::new("image", json!({}));
        svc.bind(img.clone(), "image", Access::Input, false, false);
        assert!(svc.has_all_required_objects());
        assert!(Arc::ptr_eq(&svc.input("image").unwrap(), &img));

        svc.unbind("image", Access::Input);
        assert!(!svc.has_all_required_objects());
        assert_eq!(svc.required_binding_for("tf").map(|b| b.key), Some("tf".into()));
        assert!(svc.required_binding_for("nothing").is_none());
    }

    #[tokio::test]
    async fn auto_connected_object_triggers_update() {
        let journal = Arc::new(Journal::default());
        let svc = Service::new("svc", "journal", journal.clone(), context());
        svc.register_object(
            ObjectBinding::new("img", "image", Access::Input).auto_connect(true),
        );
        let img = Object::new("image", json!(0));
        svc.bind(img.clone(), "image", Access::Input, true, false);
        svc.start().wait().await.unwrap();

        img.set_value(json!(1));
        for _ in 0..100 {
            if journal.0.lock().unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(journal.0.lock().unwrap().last().unwrap(), "update svc");

        svc.stop().wait().await.unwrap();
        assert_eq!(img.signal(MODIFIED_SIG).receiver_count(), 0);
    }

    #[tokio::test]
    async fn unknown_output_key_is_rejected() {
        let svc = Service::new("svc", "journal", Arc::new(Journal::default()), context());
        let obj = Object::new("integer", json!(1));
        assert!(matches!(
            svc.set_output("nope", Some(obj)),
            Err(ServiceError::UnknownKey { .. })
        ));
    }
}

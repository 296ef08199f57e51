//! The application manager: keeps track of named data objects and starts,
//! stops or swaps the services that depend on them.
use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{
        Arc, PoisonError, RwLock, Weak,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    component::{Component, same_service},
    error::{ManagerError, ServiceError},
    framework::Framework,
    input::{InputKind, InputRequirement},
    object::{DataObject, Object, ObjectEventHandler, same_object},
    proxy::{ProxyBook, ProxyConnections},
    worker::{Completion, join_all},
};

static MANAGER_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// A component tracked by a manager, with its orchestration flags.
#[derive(Clone)]
pub(crate) struct ServiceInfo {
    service: Weak<dyn Component>,
    id: String,
    auto_start: bool,
    auto_update: bool,
}

impl ServiceInfo {
    fn new(service: &Arc<dyn Component>, auto_start: bool, auto_update: bool) -> Self {
        Self {
            service: Arc::downgrade(service),
            id: service.id().to_string(),
            auto_start,
            auto_update,
        }
    }

    /// The live component, or [`ManagerError::ServiceExpired`].
    fn service(&self) -> Result<Arc<dyn Component>, ManagerError> {
        self.service
            .upgrade()
            .ok_or_else(|| ManagerError::ServiceExpired(self.id.clone()))
    }

    fn is(&self, service: &Arc<dyn Component>) -> bool {
        std::ptr::addr_eq(self.service.as_ptr(), Arc::as_ptr(service))
    }
}

impl fmt::Debug for ServiceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceInfo")
            .field("id", &self.id)
            .field("auto_start", &self.auto_start)
            .field("auto_update", &self.auto_update)
            .field("alive", &(self.service.strong_count() > 0))
            .finish()
    }
}

/// Everything guarded by the service lock.
#[derive(Default)]
struct ServiceBook {
    services: Vec<ServiceInfo>,
    /// in start order, stopped back to front
    started: Vec<Arc<dyn Component>>,
    proxies: ProxyBook,
}

impl ServiceBook {
    fn info_for(&self, service: &Arc<dyn Component>) -> Result<ServiceInfo, ManagerError> {
        self.services
            .iter()
            .find(|info| info.is(service))
            .cloned()
            .ok_or_else(|| ManagerError::NotRegistered(service.id().to_string()))
    }

    /// Hand the pending proxy connections over, then issue the start.
    fn start(&mut self, service: &Arc<dyn Component>) -> Completion {
        for connections in self.proxies.for_owner(service.id()) {
            service.add_proxy_connection(connections);
        }
        let completion = service.start();
        if !self.started.iter().any(|s| same_service(s, service)) {
            self.started.push(service.clone());
        }
        completion
    }

    /// Join a batch of starts. Services whose start failed are back to
    /// `Stopped` and leave the started list.
    async fn join_starts(&mut self, starts: Vec<Completion>) -> Result<(), ServiceError> {
        let result = join_all(starts).await;
        if result.is_err() {
            self.started.retain(|s| !s.is_stopped());
        }
        result
    }

    fn stop(&mut self, service: &Arc<dyn Component>) -> Completion {
        let completion = service.stop();
        if let Some(pos) = self.started.iter().position(|s| same_service(s, service)) {
            self.started.remove(pos);
        }
        completion
    }
}

/// Orchestrates the services of one application.
///
/// Two locks guard the state: the object registry and the service book. When
/// both are needed they are always taken in that order.
pub struct Manager {
    id: String,
    framework: Arc<Framework>,
    inputs: RwLock<BTreeMap<String, InputRequirement>>,
    objects: Mutex<HashMap<String, DataObject>>,
    book: Mutex<ServiceBook>,
    is_started: AtomicBool,
    subscription: std::sync::Mutex<Option<Uuid>>,
}

impl Manager {
    pub fn new(framework: Arc<Framework>) -> Arc<Self> {
        let id = format!(
            "AppManager-{}",
            MANAGER_COUNTER.fetch_add(1, Ordering::Relaxed) + 1
        );
        Arc::new(Self {
            id,
            framework,
            inputs: RwLock::new(BTreeMap::new()),
            objects: Mutex::new(HashMap::new()),
            book: Mutex::new(ServiceBook::default()),
            is_started: AtomicBool::new(false),
            subscription: std::sync::Mutex::new(None),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn framework(&self) -> &Arc<Framework> {
        &self.framework
    }

    /// Follow object registrations and unregistrations made anywhere in the
    /// process, typically service outputs.
    pub fn create(self: &Arc<Self>) {
        let mut subscription = self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if subscription.is_some() {
            warn!(manager = %self.id, "create() called twice");
            return;
        }
        let handler = Arc::new(ObjectEvents {
            manager: Arc::downgrade(self),
        });
        *subscription = Some(self.framework.objects().subscribe(handler));
        info!(manager = %self.id, "created");
    }

    /// Stop everything, stop listening to object events and drop every
    /// registered object.
    pub async fn destroy(&self) -> Result<(), ManagerError> {
        self.stop_and_unregister_services().await?;

        let subscription = self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(subscription) = subscription {
            self.framework.objects().unsubscribe(&subscription);
        }

        let mut objects = self.objects.lock().await;
        let registered: Vec<(String, DataObject)> = objects
            .iter()
            .map(|(id, obj)| (id.clone(), obj.clone()))
            .collect();
        for (id, obj) in registered {
            self.remove_object_locked(&mut objects, obj, &id).await?;
        }
        info!(manager = %self.id, "destroyed");
        Ok(())
    }

    pub fn require_input(&self, key: &str, kind: InputKind, default_value: &str) {
        let requirement = InputRequirement::new(key, kind, default_value);
        self.inputs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), requirement);
    }

    /// Resolve every declared input. Object inputs that are found are
    /// registered right away; a missing optional one is left alone.
    ///
    /// All inputs are evaluated even after a failure; the result is `false`
    /// if any required one is missing.
    pub async fn check_inputs(&self) -> Result<bool, ManagerError> {
        let inputs: Vec<InputRequirement> = self
            .inputs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        let mut all_ok = true;
        for input in inputs {
            match input.kind {
                InputKind::Object => {
                    if let Some(obj) = self.framework.objects().find(&input.value) {
                        self.add_object(obj, &input.value).await?;
                    } else if input.optional {
                        debug!(manager = %self.id, key = %input.key, "optional input not provided");
                    } else if !self.add_default_input(&input).await? {
                        debug!(manager = %self.id, key = %input.key, "missing input");
                        all_ok = false;
                    }
                }
                InputKind::Channel | InputKind::Other => {
                    if input.value.is_empty() && !input.optional {
                        debug!(manager = %self.id, key = %input.key, "missing input");
                        all_ok = false;
                    }
                }
            }
        }
        Ok(all_ok)
    }

    /// Build the default object of a required input and register it under
    /// the input id. Returns `false` when there is no usable default.
    async fn add_default_input(&self, input: &InputRequirement) -> Result<bool, ManagerError> {
        if input.default_value.is_empty() {
            return Ok(false);
        }
        let Some(obj) = self.framework.data().create(&input.default_value) else {
            warn!(manager = %self.id, key = %input.key, data_type = %input.default_value, "cannot build default object");
            return Ok(false);
        };
        self.framework.objects().track(&obj);
        let id = self.get_input_id(&input.key);
        debug!(manager = %self.id, key = %input.key, %id, "default object created");
        self.add_object(obj, &id).await?;
        Ok(true)
    }

    /// Set the value of a declared input. Unknown keys are ignored.
    pub fn replace_input(&self, key: &str, value: &str) {
        let mut inputs = self.inputs.write().unwrap_or_else(PoisonError::into_inner);
        match inputs.get_mut(key) {
            Some(input) => input.value = value.to_string(),
            None => debug!(manager = %self.id, %key, "replace_input on an undeclared key"),
        }
    }

    /// The resolved value of `key`, or `"<manager-id>-<key>"`.
    pub fn get_input_id(&self, key: &str) -> String {
        self.inputs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .filter(|input| input.is_resolved())
            .map(|input| input.value.clone())
            .unwrap_or_else(|| format!("{}-{}", self.id, key))
    }

    pub fn input(&self, key: &str) -> Option<InputRequirement> {
        self.inputs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Build a service through the framework factory and manage it.
    pub async fn add_service(
        &self,
        type_name: &str,
        uid: Option<&str>,
        auto_start: bool,
        auto_update: bool,
    ) -> Result<Arc<dyn Component>, ManagerError> {
        let service = self.framework.factory().create(
            type_name,
            uid,
            &self.framework.service_context(),
        )?;
        self.add_existing_service(service.clone(), auto_start, auto_update)
            .await?;
        Ok(service)
    }

    pub async fn add_service_auto_id(
        &self,
        type_name: &str,
        auto_start: bool,
        auto_update: bool,
    ) -> Result<Arc<dyn Component>, ManagerError> {
        self.add_service(type_name, None, auto_start, auto_update)
            .await
    }

    /// Manage an already built service.
    ///
    /// Objects already registered here are bound at once. On a started
    /// manager, an auto-start service that has everything it needs is started
    /// before this returns.
    pub async fn add_existing_service(
        &self,
        service: Arc<dyn Component>,
        auto_start: bool,
        auto_update: bool,
    ) -> Result<(), ManagerError> {
        let objects = self.objects.lock().await;
        let mut book = self.book.lock().await;

        if book.info_for(&service).is_ok() {
            return Err(ManagerError::AlreadyManaged(service.id().to_string()));
        }
        self.framework.services().register(service.clone())?;
        service.set_worker(self.framework.worker().clone());

        book.services
            .push(ServiceInfo::new(&service, auto_start, auto_update));
        info!(manager = %self.id, service = %service.id(), auto_start, auto_update, "service added");

        for (id, obj) in objects.iter() {
            if let Some(binding) = service.required_binding_for(id) {
                service.bind(
                    obj.clone(),
                    &binding.key,
                    binding.access,
                    binding.auto_connect,
                    binding.optional,
                );
            }
        }

        if auto_start && self.is_started() && service.has_all_required_objects() {
            let start = book.start(&service);
            book.join_starts(vec![start]).await?;
            if auto_update {
                service.update().wait().await?;
            }
        }
        Ok(())
    }

    pub async fn start_service(&self, service: &Arc<dyn Component>) -> Result<(), ManagerError> {
        let mut book = self.book.lock().await;
        let info = book.info_for(service)?;
        if !service.has_all_required_objects() {
            return Err(ManagerError::MissingRequiredObjects(
                service.id().to_string(),
            ));
        }
        let start = book.start(service);
        book.join_starts(vec![start]).await?;
        if info.auto_update {
            service.update().wait().await?;
        }
        Ok(())
    }

    pub async fn stop_service(&self, service: &Arc<dyn Component>) -> Result<(), ManagerError> {
        let mut book = self.book.lock().await;
        book.info_for(service)?;
        book.stop(service).wait().await?;
        Ok(())
    }

    /// Start every stopped auto-start service that has its required objects,
    /// then update the auto-update ones. From here on, object registrations
    /// start services as soon as they become complete.
    pub async fn start_services(&self) -> Result<(), ManagerError> {
        let mut book = self.book.lock().await;

        let mut starts = Vec::new();
        let mut to_update = Vec::new();
        for info in book.services.clone() {
            let service = info.service()?;
            if service.is_stopped() && info.auto_start && service.has_all_required_objects() {
                starts.push(book.start(&service));
                if info.auto_update {
                    to_update.push(service);
                }
            }
        }

        info!(manager = %self.id, count = starts.len(), "starting services");
        let started = book.join_starts(starts).await;
        let updated = join_all(to_update.iter().map(|s| s.update()).collect()).await;
        self.is_started.store(true, Ordering::SeqCst);

        started?;
        updated?;
        Ok(())
    }

    /// Stop the started services in reverse start order, then forget every
    /// service and unregister it from the framework directory.
    pub async fn stop_and_unregister_services(&self) -> Result<(), ManagerError> {
        let mut book = self.book.lock().await;

        let mut first_err = None;
        while let Some(service) = book.started.last().cloned() {
            if let Err(e) = book.stop(&service).wait().await {
                error!(manager = %self.id, service = %service.id(), "stop failed: {e}");
                first_err.get_or_insert(e);
            }
        }

        for info in book.services.drain(..) {
            let Some(registered) = self.framework.services().get(&info.id) else {
                continue;
            };
            if info.is(&registered) {
                self.framework.services().unregister(&info.id);
            }
        }
        book.started.clear();
        self.is_started.store(false, Ordering::SeqCst);
        info!(manager = %self.id, "services stopped and unregistered");

        match first_err {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Record signal/slot bindings for a channel. Returns the channel name,
    /// generated when the given one is `"undefined"`.
    pub async fn add_proxy_connection(&self, connections: &ProxyConnections) -> String {
        let mut book = self.book.lock().await;
        let channel = book.proxies.add(connections);
        debug!(manager = %self.id, %channel, "proxy connection added");
        channel
    }

    /// Register `obj` under `id` and react: rebind dependents, stop or swap
    /// started ones, start the ones that became complete.
    pub async fn add_object(&self, obj: DataObject, id: &str) -> Result<(), ManagerError> {
        let mut objects = self.objects.lock().await;
        self.add_object_locked(&mut objects, obj, id).await
    }

    /// Unregister whatever `id` maps to, stopping or swapping dependents.
    pub async fn remove_object(&self, obj: DataObject, id: &str) -> Result<(), ManagerError> {
        let mut objects = self.objects.lock().await;
        self.remove_object_locked(&mut objects, obj, id).await
    }

    pub async fn get_object(&self, id: &str) -> Option<DataObject> {
        self.objects.lock().await.get(id).cloned()
    }

    pub fn is_started(&self) -> bool {
        self.is_started.load(Ordering::SeqCst)
    }

    /// Ids of the started services, in start order.
    pub async fn started_services(&self) -> Vec<String> {
        self.book
            .lock()
            .await
            .started
            .iter()
            .map(|s| s.id().to_string())
            .collect()
    }

    /// A managed service by id.
    pub async fn service(&self, id: &str) -> Option<Arc<dyn Component>> {
        let book = self.book.lock().await;
        book.services
            .iter()
            .find(|info| info.id == id)
            .and_then(|info| info.service().ok())
    }

    pub async fn service_count(&self) -> usize {
        self.book.lock().await.services.len()
    }

    async fn add_object_locked(
        &self,
        objects: &mut HashMap<String, DataObject>,
        obj: DataObject,
        id: &str,
    ) -> Result<(), ManagerError> {
        if let Some(current) = objects.get(id).cloned() {
            if Object::same(&current, &obj) {
                warn!(manager = %self.id, %id, "object is already registered");
                return Ok(());
            }
            warn!(manager = %self.id, %id, "object has not been unregistered, replacing it");
            self.remove_object_locked(objects, current, id).await?;
        }

        let mut book = self.book.lock().await;

        let router = self.framework.router();
        for connections in book.proxies.for_owner(id) {
            for name in connections.signals_of(id) {
                router.connect_signal(&connections.channel, &obj.signal(name))?;
            }
        }

        let mut to_start = Vec::new();
        let mut to_update = Vec::new();
        for info in book.services.clone() {
            let service = info.service()?;
            let Some(binding) = service.required_binding_for(id) else {
                continue;
            };

            let registered = service.bound_object(&binding.key, binding.access);
            if !same_object(registered.as_ref(), Some(&obj)) {
                if service.is_started() && !binding.optional {
                    warn!(manager = %self.id, service = %service.id(), key = %binding.key, "required object replaced, stopping service");
                    book.stop(&service).wait().await?;
                }
                if registered.is_some() {
                    service.unbind(&binding.key, binding.access);
                }
                service.bind(
                    obj.clone(),
                    &binding.key,
                    binding.access,
                    binding.auto_connect,
                    binding.optional,
                );
                if binding.optional && service.is_started() {
                    service.swap(&binding.key, registered).wait().await?;
                }
            }

            if info.auto_start && service.has_all_required_objects() && !service.is_started() {
                if info.auto_update {
                    to_update.push(service.clone());
                }
                to_start.push(service);
            }
        }

        if self.is_started() {
            let starts = to_start.iter().map(|s| book.start(s)).collect();
            book.join_starts(starts).await?;
            join_all(to_update.iter().map(|s| s.update()).collect()).await?;
        } else if !to_start.is_empty() {
            debug!(manager = %self.id, %id, count = to_start.len(), "activation deferred until start_services");
        }
        drop(book);

        objects.insert(id.to_string(), obj);
        Ok(())
    }

    async fn remove_object_locked(
        &self,
        objects: &mut HashMap<String, DataObject>,
        obj: DataObject,
        id: &str,
    ) -> Result<(), ManagerError> {
        {
            let mut book = self.book.lock().await;
            for info in book.services.clone() {
                let service = info.service()?;
                let Some(binding) = service.required_binding_for(id) else {
                    continue;
                };
                if service.bound_object(&binding.key, binding.access).is_none() {
                    continue;
                }
                if service.is_started() && !binding.optional {
                    book.stop(&service).wait().await?;
                }
                service.unbind(&binding.key, binding.access);
                if binding.optional && service.is_started() {
                    service.swap(&binding.key, Some(obj.clone())).wait().await?;
                }
            }

            let router = self.framework.router();
            for connections in book.proxies.for_owner(id) {
                for name in connections.signals_of(id) {
                    router.disconnect_signal(&connections.channel, &obj.signal(name));
                }
            }
        }

        if objects.remove(id).is_none() {
            debug!(manager = %self.id, %id, "object was not registered");
        }
        Ok(())
    }
}

impl fmt::Debug for Manager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manager")
            .field("id", &self.id)
            .field("is_started", &self.is_started())
            .finish()
    }
}

/// Feeds process-wide object events into a manager.
struct ObjectEvents {
    manager: Weak<Manager>,
}

#[async_trait]
impl ObjectEventHandler for ObjectEvents {
    async fn object_registered(&self, obj: DataObject, id: String) {
        if let Some(manager) = self.manager.upgrade() {
            if let Err(e) = manager.add_object(obj, &id).await {
                error!(manager = %manager.id, %id, "failed to add object: {e}");
            }
        }
    }

    async fn object_unregistered(&self, obj: DataObject, id: String) {
        if let Some(manager) = self.manager.upgrade() {
            if let Err(e) = manager.remove_object(obj, &id).await {
                error!(manager = %manager.id, %id, "failed to remove object: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::Worker;

    fn manager() -> Arc<Manager> {
        let worker = Worker::current().expect("runtime");
        Manager::new(Arc::new(Framework::new(worker)))
    }

    #[tokio::test]
    async fn input_ids_fall_back_to_the_manager_id() {
        let mgr = manager();
        assert!(mgr.id().starts_with("AppManager-"));

        mgr.require_input("image", InputKind::Object, "");
        assert_eq!(mgr.get_input_id("image"), format!("{}-image", mgr.id()));
        assert_eq!(mgr.get_input_id("unknown"), format!("{}-unknown", mgr.id()));

        mgr.replace_input("image", "patient_image");
        assert_eq!(mgr.get_input_id("image"), "patient_image");

        mgr.replace_input("nope", "x");
        assert!(mgr.input("nope").is_none());
    }

    #[tokio::test]
    async fn manager_ids_are_distinct() {
        assert_ne!(manager().id(), manager().id());
    }

    #[tokio::test]
    async fn channel_inputs_need_a_value() {
        let mgr = manager();
        mgr.require_input("channel", InputKind::Channel, "");
        mgr.require_input("label", InputKind::Other, "none");
        assert!(!mgr.check_inputs().await.unwrap());

        mgr.replace_input("channel", "ch0");
        assert!(mgr.check_inputs().await.unwrap());
    }

    #[tokio::test]
    async fn object_inputs_resolve_through_the_registry() {
        let mgr = manager();
        let obj = Object::new("integer", serde_json::json!(3));
        mgr.framework().objects().track(&obj);

        mgr.require_input("count", InputKind::Object, "");
        mgr.replace_input("count", obj.uid());
        assert!(mgr.check_inputs().await.unwrap());
        assert!(Object::same(&mgr.get_object(obj.uid()).await.unwrap(), &obj));
    }

    #[tokio::test]
    async fn missing_optional_object_inputs_register_nothing() {
        let mgr = manager();
        mgr.require_input("flag", InputKind::Object, "boolean");
        assert!(mgr.input("flag").unwrap().optional);
        assert!(mgr.check_inputs().await.unwrap());
        assert!(mgr.get_object(&mgr.get_input_id("flag")).await.is_none());
    }

    #[tokio::test]
    async fn required_object_inputs_can_be_built_from_their_default() {
        let mgr = manager();
        let mut flag = InputRequirement::new("flag", InputKind::Object, "boolean");
        flag.optional = false;
        assert!(mgr.add_default_input(&flag).await.unwrap());
        let obj = mgr.get_object(&mgr.get_input_id("flag")).await.unwrap();
        assert_eq!(obj.type_name(), "boolean");

        let unknown = InputRequirement::new("shape", InputKind::Object, "no-such-type");
        assert!(!mgr.add_default_input(&unknown).await.unwrap());
        let bare = InputRequirement::new("img", InputKind::Object, "");
        assert!(!mgr.add_default_input(&bare).await.unwrap());
    }

    #[tokio::test]
    async fn same_object_twice_is_a_no_op_and_stale_mappings_are_replaced() {
        let mgr = manager();
        let a = Object::new("integer", serde_json::json!(1));
        let b = Object::new("integer", serde_json::json!(2));

        mgr.add_object(a.clone(), "x").await.unwrap();
        mgr.add_object(a.clone(), "x").await.unwrap();
        mgr.add_object(b.clone(), "x").await.unwrap();
        assert!(Object::same(&mgr.get_object("x").await.unwrap(), &b));

        mgr.remove_object(b, "x").await.unwrap();
        assert!(mgr.get_object("x").await.is_none());
    }
}

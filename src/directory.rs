//! Where components live: the id → instance directory and the type → constructor
//! factory.
use std::{fmt, sync::Arc};

use dashmap::DashMap;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    component::{Component, same_service},
    error::ManagerError,
    service::{Service, ServiceContext, ServiceLogic},
};

/// Owns every registered component. Managers only keep weak handles.
#[derive(Default)]
pub struct ServiceDirectory {
    services: DashMap<String, Arc<dyn Component>>,
}

impl ServiceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `service` under its id. Registering the same instance twice is
    /// a no-op; another instance under a taken id is refused.
    pub fn register(&self, service: Arc<dyn Component>) -> Result<(), ManagerError> {
        let id = service.id().to_string();
        if let Some(existing) = self.services.get(&id) {
            if same_service(existing.value(), &service) {
                return Ok(());
            }
            return Err(ManagerError::DuplicateService(id));
        }
        debug!(%id, "service registered");
        self.services.insert(id, service);
        Ok(())
    }

    pub fn unregister(&self, id: &str) -> Option<Arc<dyn Component>> {
        let removed = self.services.remove(id).map(|(_, svc)| svc);
        if removed.is_some() {
            debug!(%id, "service unregistered");
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Component>> {
        self.services.get(id).map(|kv| kv.value().clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.services.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl fmt::Debug for ServiceDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<String> = self.services.iter().map(|kv| kv.key().clone()).collect();
        ids.sort();
        f.debug_struct("ServiceDirectory").field("services", &ids).finish()
    }
}

/// Builds a component of a given type with the given uid.
pub type ServiceConstructor =
    Arc<dyn Fn(String, &ServiceContext) -> Arc<dyn Component> + Send + Sync>;

/// Service type name → constructor.
#[derive(Default)]
pub struct ServiceFactory {
    constructors: DashMap<String, ServiceConstructor>,
}

impl ServiceFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, type_name: &str, constructor: F)
    where
        F: Fn(String, &ServiceContext) -> Arc<dyn Component> + Send + Sync + 'static,
    {
        info!(service_type = %type_name, "service type registered");
        self.constructors
            .insert(type_name.to_string(), Arc::new(constructor));
    }

    /// Register a [`ServiceLogic`] as a stock [`Service`] type. Each instance
    /// gets its own logic value.
    pub fn register_logic<L>(&self, type_name: &str)
    where
        L: ServiceLogic + Default,
    {
        let name = type_name.to_string();
        self.register(type_name, move |uid, ctx| {
            Arc::new(Service::new(uid, name.clone(), Arc::new(L::default()), ctx.clone()))
        });
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.constructors.contains_key(type_name)
    }

    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.constructors.iter().map(|kv| kv.key().clone()).collect();
        types.sort();
        types
    }

    /// A new component of `type_name`. Without a uid, one is generated as
    /// `"<type>-<uuid>"`.
    pub fn create(
        &self,
        type_name: &str,
        uid: Option<&str>,
        ctx: &ServiceContext,
    ) -> Result<Arc<dyn Component>, ManagerError> {
        let constructor = self
            .constructors
            .get(type_name)
            .map(|kv| kv.value().clone())
            .ok_or_else(|| ManagerError::UnknownServiceType(type_name.to_string()))?;
        let uid = match uid {
            Some(uid) if !uid.is_empty() => uid.to_string(),
            _ => format!("{}-{}", type_name, Uuid::new_v4()),
        };
        Ok(constructor(uid, ctx))
    }
}

impl fmt::Debug for ServiceFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceFactory")
            .field("types", &self.types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{object::ObjectRegistry, worker::Worker};
    use proxy_router::ProxyRouter;

    #[derive(Default)]
    struct Idle;

    impl ServiceLogic for Idle {}

    fn context() -> ServiceContext {
        let worker = Worker::current().expect("runtime");
        ServiceContext {
            router: Arc::new(ProxyRouter::new()),
            objects: Arc::new(ObjectRegistry::new(&worker)),
        }
    }

    #[tokio::test]
    async fn factory_creates_registered_types() {
        let factory = ServiceFactory::new();
        factory.register_logic::<Idle>("idle");
        let ctx = context();

        let named = factory.create("idle", Some("first"), &ctx).unwrap();
        assert_eq!(named.id(), "first");
        let generated = factory.create("idle", None, &ctx).unwrap();
        assert!(generated.id().starts_with("idle-"));

        assert!(matches!(
            factory.create("missing", None, &ctx),
            Err(ManagerError::UnknownServiceType(t)) if t == "missing"
        ));
    }

    #[tokio::test]
    async fn directory_refuses_a_second_instance_under_one_id() {
        let factory = ServiceFactory::new();
        factory.register_logic::<Idle>("idle");
        let ctx = context();
        let directory = ServiceDirectory::new();

        let a = factory.create("idle", Some("svc"), &ctx).unwrap();
        let b = factory.create("idle", Some("svc"), &ctx).unwrap();
        directory.register(a.clone()).unwrap();
        directory.register(a.clone()).unwrap();
        assert!(matches!(
            directory.register(b),
            Err(ManagerError::DuplicateService(_))
        ));
        assert_eq!(directory.len(), 1);

        assert!(directory.unregister("svc").is_some());
        assert!(directory.get("svc").is_none());
    }
}

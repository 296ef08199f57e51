use std::sync::Arc;

use anyhow::Context;
use once_cell::sync::OnceCell;
use proxy_router::ProxyRouter;

use crate::{
    directory::{ServiceDirectory, ServiceFactory},
    object::{DataFactory, ObjectRegistry},
    service::ServiceContext,
    worker::Worker,
};

static GLOBAL: OnceCell<Arc<Framework>> = OnceCell::new();

/// The collaborators a [`Manager`](crate::manager::Manager) works with.
#[derive(Debug)]
pub struct Framework {
    router: Arc<ProxyRouter>,
    services: Arc<ServiceDirectory>,
    factory: Arc<ServiceFactory>,
    data: Arc<DataFactory>,
    objects: Arc<ObjectRegistry>,
    worker: Worker,
}

impl Framework {
    /// Fresh collaborators. The data factory knows the basic value types,
    /// the service factory knows nothing yet.
    pub fn new(worker: Worker) -> Self {
        Self {
            router: Arc::new(ProxyRouter::new()),
            services: Arc::new(ServiceDirectory::new()),
            factory: Arc::new(ServiceFactory::new()),
            data: Arc::new(DataFactory::with_defaults()),
            objects: Arc::new(ObjectRegistry::new(&worker)),
            worker,
        }
    }

    /// One shared instance for the whole process, built on first use from the
    /// calling runtime.
    pub fn global() -> anyhow::Result<Arc<Framework>> {
        GLOBAL
            .get_or_try_init(|| {
                let worker =
                    Worker::current().context("the shared framework needs a tokio runtime")?;
                Ok(Arc::new(Framework::new(worker)))
            })
            .cloned()
    }

    pub fn router(&self) -> &Arc<ProxyRouter> {
        &self.router
    }

    pub fn services(&self) -> &Arc<ServiceDirectory> {
        &self.services
    }

    pub fn factory(&self) -> &Arc<ServiceFactory> {
        &self.factory
    }

    pub fn data(&self) -> &Arc<DataFactory> {
        &self.data
    }

    pub fn objects(&self) -> &Arc<ObjectRegistry> {
        &self.objects
    }

    pub fn worker(&self) -> &Worker {
        &self.worker
    }

    /// What a component constructor receives.
    pub fn service_context(&self) -> ServiceContext {
        ServiceContext {
            router: self.router.clone(),
            objects: self.objects.clone(),
        }
    }
}

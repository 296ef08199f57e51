use proxy_router::RouterError;
use thiserror::Error;

/// Errors produced by a component while it transitions.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// The component logic returned an error.
    #[error("service `{service}` failed: {reason}")]
    Failed { service: String, reason: String },

    /// The task running the transition panicked or was cancelled.
    #[error("service task aborted: {0}")]
    TaskPanicked(String),

    /// No worker was assigned and no tokio runtime is running.
    #[error("service `{0}` has no worker to run on")]
    NoWorker(String),

    /// The key is not declared by the component.
    #[error("service `{service}` has no `{key}` binding")]
    UnknownKey { service: String, key: String },
}

/// Errors surfaced by the [`Manager`](crate::manager::Manager).
#[derive(Debug, Error)]
pub enum ManagerError {
    /// The component was never added to this manager.
    #[error("service `{0}` is not registered in this manager")]
    NotRegistered(String),

    /// The manager still tracks a component whose instance was dropped.
    #[error("service `{0}` has expired")]
    ServiceExpired(String),

    /// `start_service` on a component that lacks required data.
    #[error("service `{0}` cannot be started because all the required objects are not present")]
    MissingRequiredObjects(String),

    /// The component is already tracked by this manager.
    #[error("service `{0}` is already managed")]
    AlreadyManaged(String),

    /// The service directory holds another component under this id.
    #[error("a different service is already registered as `{0}`")]
    DuplicateService(String),

    /// The service factory does not know the type.
    #[error("unknown service type `{0}`")]
    UnknownServiceType(String),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Router(#[from] RouterError),
}

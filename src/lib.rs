pub mod builtin;
pub mod component;
pub mod config;
pub mod description;
pub mod directory;
pub mod error;
pub mod framework;
pub mod input;
pub mod logger;
pub mod manager;
pub mod object;
pub mod proxy;
pub mod service;
pub mod worker;

pub use component::{Access, Component, ObjectBinding, ServiceStatus};
pub use error::{ManagerError, ServiceError};
pub use framework::Framework;
pub use input::{InputKind, InputRequirement};
pub use manager::Manager;
pub use object::{DataObject, Object};
pub use proxy::ProxyConnections;
pub use service::{Service, ServiceLogic};
pub use worker::{Completion, Worker};

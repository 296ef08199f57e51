//! Small service types used by the `appmanager` binary and its demo apps.
use anyhow::Context;
use async_trait::async_trait;
use tracing::info;

use crate::{
    component::{Access, Component},
    directory::ServiceFactory,
    object::Object,
    service::{Service, ServiceLogic},
};

pub const ECHO: &str = "echo";
pub const COPY: &str = "copy";

pub const SOURCE_KEY: &str = "source";
pub const TARGET_KEY: &str = "target";

/// Logs the value of every bound input on update.
#[derive(Debug, Default)]
pub struct Echo;

#[async_trait]
impl ServiceLogic for Echo {
    async fn starting(&self, service: &Service) -> anyhow::Result<()> {
        info!(service = %service.id(), "echo ready");
        Ok(())
    }

    async fn updating(&self, service: &Service) -> anyhow::Result<()> {
        for binding in service.bindings() {
            if binding.access == Access::Output {
                continue;
            }
            if let Some(obj) = service.bound_object(&binding.key, binding.access) {
                info!(service = %service.id(), key = %binding.key, value = %obj.value(), "echo");
            }
        }
        Ok(())
    }
}

/// Copies `source` into the `target` output, creating it on first update.
#[derive(Debug, Default)]
pub struct CopyValue;

#[async_trait]
impl ServiceLogic for CopyValue {
    async fn updating(&self, service: &Service) -> anyhow::Result<()> {
        let source = service
            .input(SOURCE_KEY)
            .or_else(|| service.inout(SOURCE_KEY))
            .context("no `source` object bound")?;

        match service.output(TARGET_KEY) {
            Some(target) => target.set_value(source.value()),
            None => {
                let target = Object::new(source.type_name(), source.value());
                service.set_output(TARGET_KEY, Some(target))?;
            }
        }
        Ok(())
    }

    async fn stopping(&self, service: &Service) -> anyhow::Result<()> {
        if service.output(TARGET_KEY).is_some() {
            service.set_output(TARGET_KEY, None)?;
        }
        Ok(())
    }
}

/// Make the built-in types known to `factory`.
pub fn register_builtin(factory: &ServiceFactory) {
    factory.register_logic::<Echo>(ECHO);
    factory.register_logic::<CopyValue>(COPY);
}

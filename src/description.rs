//! Declarative application descriptions, loaded from JSON or YAML.
//!
//! Object ids and channel owners written as `${key}` are replaced by the
//! manager's id for input `key` (see [`Manager::get_input_id`]).
use std::{fs, path::Path, sync::Arc};

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::{
    component::{Component, ObjectBinding},
    input::InputKind,
    manager::Manager,
    proxy::ProxyConnections,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppDescription {
    #[serde(default)]
    pub inputs: Vec<InputDescription>,
    #[serde(default)]
    pub services: Vec<ServiceDescription>,
    #[serde(default)]
    pub objects: Vec<ObjectDescription>,
    #[serde(default)]
    pub connections: Vec<ProxyConnections>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputDescription {
    pub key: String,
    #[serde(default = "object_kind")]
    pub kind: InputKind,
    /// Type name of the default object (object inputs), or any default value.
    #[serde(default)]
    pub default: String,
    #[serde(default)]
    pub value: Option<String>,
}

fn object_kind() -> InputKind {
    InputKind::Object
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectDescription {
    pub id: String,
    #[serde(rename = "type")]
    pub type_name: String,
    /// Replaces the default value built by the data factory.
    #[serde(default)]
    pub value: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescription {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub uid: Option<String>,
    #[serde(default = "yes")]
    pub auto_start: bool,
    #[serde(default)]
    pub auto_update: bool,
    #[serde(default)]
    pub objects: Vec<ObjectBinding>,
}

fn yes() -> bool {
    true
}

impl AppDescription {
    /// Load a description, picking the format from the file extension.
    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents =
            fs::read_to_string(path).with_context(|| format!("cannot read {}", path.display()))?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        let desc = match ext.as_deref() {
            Some("json") => Self::from_json(&contents),
            Some("yaml") | Some("yml") => Self::from_yaml(&contents),
            _ => bail!("unsupported app description format: {}", path.display()),
        };
        desc.with_context(|| format!("invalid app description {}", path.display()))
    }

    pub fn from_json(contents: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(contents)?)
    }

    pub fn from_yaml(contents: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml_bw::from_str(contents)?)
    }

    /// Declare inputs, connections and services on `manager`, then register
    /// the objects. Returns the services in declaration order.
    ///
    /// Services are added before objects so that registering an object binds
    /// it to every service that declared it.
    pub async fn apply(&self, manager: &Manager) -> anyhow::Result<Vec<Arc<dyn Component>>> {
        for input in &self.inputs {
            manager.require_input(&input.key, input.kind, &input.default);
            if let Some(value) = &input.value {
                manager.replace_input(&input.key, value);
            }
        }

        for conn in &self.connections {
            let mut resolved = ProxyConnections::new(conn.channel.clone());
            for (owner, signal) in &conn.signals {
                resolved.add_signal_connection(resolve_id(manager, owner), signal.clone());
            }
            for (owner, slot) in &conn.slots {
                resolved.add_slot_connection(resolve_id(manager, owner), slot.clone());
            }
            let channel = manager.add_proxy_connection(&resolved).await;
            debug!(%channel, "connection declared");
        }

        let framework = manager.framework();
        let mut services = Vec::with_capacity(self.services.len());
        for desc in &self.services {
            let service = framework.factory().create(
                &desc.type_name,
                desc.uid.as_deref(),
                &framework.service_context(),
            )?;
            for binding in &desc.objects {
                let mut binding = binding.clone();
                binding.object_id = resolve_id(manager, &binding.object_id);
                service.register_object(binding);
            }
            manager
                .add_existing_service(service.clone(), desc.auto_start, desc.auto_update)
                .await
                .with_context(|| format!("cannot add service `{}`", service.id()))?;
            services.push(service);
        }

        for desc in &self.objects {
            let obj = framework
                .data()
                .create(&desc.type_name)
                .with_context(|| format!("unknown data type `{}`", desc.type_name))?;
            if let Some(value) = &desc.value {
                obj.set_value(value.clone());
            }
            framework.objects().track(&obj);
            let id = resolve_id(manager, &desc.id);
            manager
                .add_object(obj, &id)
                .await
                .with_context(|| format!("cannot register object `{id}`"))?;
        }

        info!(
            manager = %manager.id(),
            services = services.len(),
            objects = self.objects.len(),
            "app description applied"
        );
        Ok(services)
    }
}

/// `${key}` → the manager's id for input `key`; anything else unchanged.
fn resolve_id(manager: &Manager, raw: &str) -> String {
    match raw.strip_prefix("${").and_then(|r| r.strip_suffix('}')) {
        Some(key) => manager.get_input_id(key),
        None => raw.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::Access;
    use std::io::Write;

    const YAML: &str = r#"
inputs:
  - key: image
services:
  - type: echo
    uid: viewer
    auto_update: true
    objects:
      - object_id: "${image}"
        key: image
        access: input
objects:
  - id: "${image}"
    type: integer
    value: 42
connections:
  - signals: [["viewer", "updated"]]
    slots: [["logger", "update"]]
"#;

    #[test]
    fn yaml_description_parses_with_defaults() {
        let desc = AppDescription::from_yaml(YAML).unwrap();
        assert_eq!(desc.inputs[0].kind, InputKind::Object);
        assert!(desc.inputs[0].default.is_empty());

        let svc = &desc.services[0];
        assert!(svc.auto_start);
        assert!(svc.auto_update);
        assert_eq!(svc.objects[0].access, Access::Input);
        assert!(!svc.objects[0].optional);

        assert_eq!(desc.objects[0].value, Some(serde_json::json!(42)));
        assert!(desc.connections[0].is_undefined());
    }

    #[test]
    fn format_follows_the_extension() {
        let mut json = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(json, r#"{{"services": [{{"type": "echo"}}]}}"#).unwrap();
        let desc = AppDescription::from_path(json.path()).unwrap();
        assert_eq!(desc.services[0].type_name, "echo");
        assert!(desc.inputs.is_empty());

        let mut txt = tempfile::Builder::new().suffix(".txt").tempfile().unwrap();
        write!(txt, "services: []").unwrap();
        let err = AppDescription::from_path(txt.path()).unwrap_err();
        assert!(err.to_string().contains("unsupported"));
    }

    #[tokio::test]
    async fn apply_wires_services_objects_and_inputs() {
        let worker = crate::worker::Worker::current().unwrap();
        let framework = Arc::new(crate::framework::Framework::new(worker));
        crate::builtin::register_builtin(framework.factory());
        let manager = Manager::new(framework);

        let desc = AppDescription::from_yaml(YAML).unwrap();
        let services = desc.apply(&manager).await.unwrap();
        assert_eq!(services.len(), 1);

        let image_id = manager.get_input_id("image");
        assert_eq!(image_id, format!("{}-image", manager.id()));
        let obj = manager.get_object(&image_id).await.unwrap();
        assert_eq!(obj.value(), serde_json::json!(42));

        let viewer = &services[0];
        assert_eq!(viewer.id(), "viewer");
        assert!(viewer.has_all_required_objects());
        assert!(viewer.is_stopped());

        manager.start_services().await.unwrap();
        assert!(viewer.is_started());
        manager.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn unknown_types_fail_to_apply() {
        let worker = crate::worker::Worker::current().unwrap();
        let manager = Manager::new(Arc::new(crate::framework::Framework::new(worker)));
        let desc = AppDescription::from_json(r#"{"services": [{"type": "echo"}]}"#).unwrap();
        let err = desc.apply(&manager).await.err().unwrap();
        assert!(err.to_string().contains("unknown service type"));

        let desc = AppDescription::from_json(r#"{"objects": [{"id": "x", "type": "image"}]}"#)
            .unwrap();
        let err = desc.apply(&manager).await.err().unwrap();
        assert!(err.to_string().contains("unknown data type"));
    }

    #[test]
    fn malformed_files_report_their_path() {
        let mut yaml = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        write!(yaml, "services: 12").unwrap();
        let err = AppDescription::from_path(yaml.path()).unwrap_err();
        assert!(err.to_string().contains("invalid app description"));
    }
}

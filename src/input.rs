use serde::{Deserialize, Serialize};

/// What an input requirement resolves to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputKind {
    /// An object id, looked up and registered by `check_inputs`.
    Object,
    /// A channel name.
    Channel,
    /// Any other string parameter.
    Other,
}

/// A named input the application expects before it can run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRequirement {
    pub key: String,
    pub kind: InputKind,
    /// For objects, a data type name used to build a default instance.
    pub default_value: String,
    pub optional: bool,
    /// The resolved value, empty until replaced.
    pub value: String,
}

impl InputRequirement {
    pub fn new(key: impl Into<String>, kind: InputKind, default_value: impl Into<String>) -> Self {
        let default_value = default_value.into();
        Self {
            key: key.into(),
            kind,
            optional: !default_value.is_empty(),
            default_value,
            value: String::new(),
        }
    }

    pub fn is_resolved(&self) -> bool {
        !self.value.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a_default_makes_the_input_optional() {
        assert!(!InputRequirement::new("image", InputKind::Object, "").optional);
        let with_default = InputRequirement::new("image", InputKind::Object, "integer");
        assert!(with_default.optional);
        assert!(!with_default.is_resolved());
    }
}

use super::{GROUP_NAME, VERSION};
use crate::core::{ObjectMeta, Resource};
use serde::{Deserialize, Serialize};

/// A cluster-scoped placeholder kind
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Example {
    /// Standard object metadata
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// The desired state
    #[serde(default)]
    pub spec: ExampleSpec,
}

/// The desired state of an [`Example`]
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExampleSpec {
    /// Human readable name
    pub display_name: String,
}

impl Example {
    /// An `Example` called `name`
    pub fn new(name: &str, spec: ExampleSpec) -> Self {
        Self {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..ObjectMeta::default()
            },
            spec,
        }
    }
}

impl Resource for Example {
    const GROUP: &'static str = GROUP_NAME;
    const KIND: &'static str = "Example";
    const NAMESPACED: bool = false;
    const PLURAL: &'static str = "examples";
    const VERSION: &'static str = VERSION;

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::{Example, ExampleSpec};
    use crate::core::Resource;
    use serde_json::json;

    #[test]
    fn spec_uses_camel_case() {
        let example = Example::new("a", ExampleSpec {
            display_name: "A".into(),
        });
        let value = serde_json::to_value(&example).unwrap();
        assert_eq!(value["spec"], json!({ "displayName": "A" }));
        assert_eq!(Example::api_version(), "management.cattle.io/v3");
    }
}

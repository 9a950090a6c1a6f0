use super::{GROUP_NAME, VERSION};
use crate::core::{ObjectMeta, Resource};
use serde::{Deserialize, Serialize};

/// A second cluster-scoped placeholder kind, shaped like [`Example`](super::Example)
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Test {
    /// Standard object metadata
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// The desired state
    #[serde(default)]
    pub spec: TestSpec,
}

/// The desired state of a [`Test`]
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestSpec {
    /// Human readable name
    pub display_name: String,
}

impl Test {
    /// A `Test` called `name`
    pub fn new(name: &str, spec: TestSpec) -> Self {
        Self {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..ObjectMeta::default()
            },
            spec,
        }
    }
}

impl Resource for Test {
    const GROUP: &'static str = GROUP_NAME;
    const KIND: &'static str = "Test";
    const NAMESPACED: bool = false;
    const PLURAL: &'static str = "tests";
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
    use super::Test;
    use crate::core::Resource;
    use serde_json::json;

    #[test]
    fn missing_spec_defaults() {
        let test: Test = serde_json::from_value(json!({ "metadata": { "name": "t" } })).unwrap();
        assert_eq!(test.spec.display_name, "");
        assert_eq!(Test::gvk().kind, "Test");
        assert_eq!(Test::PLURAL, "tests");
    }
}

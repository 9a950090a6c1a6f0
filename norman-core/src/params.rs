//! Parameters passed to object store calls
use serde::Serialize;

/// Common query parameters used in list calls
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ListParams {
    /// A selector to restrict the list of returned objects by their labels.
    ///
    /// Defaults to everything if `None`.
    pub label_selector: Option<String>,

    /// A selector to restrict the list of returned objects by their fields.
    ///
    /// Defaults to everything if `None`.
    pub field_selector: Option<String>,

    /// Return the list as of at least this resource version, if set
    pub resource_version: Option<String>,
}

impl ListParams {
    /// Configure the selector to restrict the list of returned objects by their fields.
    ///
    /// Defaults to everything.
    /// Supports `=`, `==`, `!=`, and can be comma separated: `metadata.name=a,metadata.namespace!=b`.
    #[must_use]
    pub fn fields(mut self, field_selector: &str) -> Self {
        self.field_selector = Some(field_selector.to_string());
        self
    }

    /// Configure the selector to restrict the list of returned objects by their labels.
    ///
    /// Defaults to everything.
    /// Supports `=`, `==`, `!=`, `in`, `notin`, and can be comma separated: `env in (prod),tier!=db`.
    #[must_use]
    pub fn labels(mut self, label_selector: &str) -> Self {
        self.label_selector = Some(label_selector.to_string());
        self
    }

    /// Sets the resource version the list should be served at
    #[must_use]
    pub fn at(mut self, resource_version: &str) -> Self {
        self.resource_version = Some(resource_version.into());
        self
    }
}

/// Common query parameters used in watch calls
#[derive(Clone, Debug, PartialEq)]
pub struct WatchParams {
    /// A selector to restrict returned objects by their labels.
    pub label_selector: Option<String>,

    /// A selector to restrict returned objects by their fields.
    pub field_selector: Option<String>,

    /// Timeout for the watch call in seconds, after which the store closes the stream.
    pub timeout: Option<u32>,

    /// Enables watch events with type "BOOKMARK".
    pub bookmarks: bool,
}

impl Default for WatchParams {
    fn default() -> Self {
        Self {
            bookmarks: true,
            label_selector: None,
            field_selector: None,
            timeout: None,
        }
    }
}

impl WatchParams {
    /// Configure the timeout for watch calls
    #[must_use]
    pub fn timeout(mut self, timeout_secs: u32) -> Self {
        self.timeout = Some(timeout_secs);
        self
    }

    /// Configure the selector to restrict returned objects by their fields.
    #[must_use]
    pub fn fields(mut self, field_selector: &str) -> Self {
        self.field_selector = Some(field_selector.to_string());
        self
    }

    /// Configure the selector to restrict returned objects by their labels.
    #[must_use]
    pub fn labels(mut self, label_selector: &str) -> Self {
        self.label_selector = Some(label_selector.to_string());
        self
    }

    /// Disables watch bookmarks
    #[must_use]
    pub fn disable_bookmarks(mut self) -> Self {
        self.bookmarks = false;
        self
    }
}

impl From<&ListParams> for WatchParams {
    fn from(lp: &ListParams) -> Self {
        Self {
            label_selector: lp.label_selector.clone(),
            field_selector: lp.field_selector.clone(),
            ..Self::default()
        }
    }
}

/// Preconditions that must hold for a delete to go through
#[derive(Default, Clone, Serialize, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Preconditions {
    /// Specifies the target ResourceVersion
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    /// Specifies the target UID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

/// Common parameters for delete calls
#[derive(Default, Clone, Serialize, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeleteParams {
    /// Conditions that must be fulfilled before a deletion is carried out
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preconditions: Option<Preconditions>,
}

impl DeleteParams {
    /// Perform the delete only if the object still has this uid and resource version
    #[must_use]
    pub fn preconditions(mut self, preconditions: Preconditions) -> Self {
        self.preconditions = Some(preconditions);
        self
    }
}

/// Describes changes that should be applied to a resource
#[derive(Debug, Clone)]
pub enum Patch {
    /// [JSON patch](https://tools.ietf.org/html/rfc6902)
    Json(json_patch::Patch),
    /// [JSON merge patch](https://tools.ietf.org/html/rfc7386)
    Merge(serde_json::Value),
}

impl Patch {
    /// The content type the patch is sent with
    pub fn content_type(&self) -> &'static str {
        match &self {
            Self::Json(_) => "application/json-patch+json",
            Self::Merge(_) => "application/merge-patch+json",
        }
    }
}

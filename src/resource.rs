mod object_id;

pub use self::object_id::{ObjectId, ObjectIdRef};

use crate::k8s_types::K8sType;

use serde_json::Value;

pub type JsonObject = serde_json::Map<String, Value>;

#[derive(Debug, PartialEq, Clone)]
pub struct InvalidResourceError {
    pub message: &'static str,
    pub value: Value,
}

impl InvalidResourceError {
    pub fn new(message: &'static str, value: Value) -> Self {
        InvalidResourceError { message, value }
    }
}

impl std::fmt::Display for InvalidResourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Invalid Resource: {}", self.message)
    }
}

impl std::error::Error for InvalidResourceError {}

/// A json object as it was returned by the api server. Construction validates that the metadata
/// every persisted object carries is present, so the accessors for those fields don't need to
/// return `Option`s.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct K8sResource(Value);

impl K8sResource {
    pub fn from_value(value: Value) -> Result<K8sResource, InvalidResourceError> {
        match K8sResource::validate(&value) {
            Ok(()) => Ok(K8sResource(value)),
            Err(message) => Err(InvalidResourceError { message, value }),
        }
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    pub fn resource_version(&self) -> &str {
        self.str_value("/metadata/resourceVersion").unwrap_or_default()
    }

    pub fn uid(&self) -> &str {
        self.str_value("/metadata/uid").unwrap_or_default()
    }

    pub fn name(&self) -> &str {
        self.str_value("/metadata/name").unwrap_or_default()
    }

    pub fn namespace(&self) -> Option<&str> {
        self.str_value("/metadata/namespace")
    }

    pub fn api_version(&self) -> &str {
        self.str_value("/apiVersion").unwrap_or_default()
    }

    pub fn kind(&self) -> &str {
        self.str_value("/kind").unwrap_or_default()
    }

    pub fn get_label_value(&self, label: &str) -> Option<&str> {
        let labels = self.0.pointer("/metadata/labels")?.as_object()?;
        labels.get(label).and_then(Value::as_str)
    }

    /// `metadata.generation`, which the api server only increments when the spec changes
    pub fn generation(&self) -> i64 {
        self.0
            .pointer("/metadata/generation")
            .and_then(Value::as_i64)
            .unwrap_or(-1)
    }

    pub fn status(&self) -> Option<&Value> {
        self.0.pointer("/status")
    }

    pub fn is_type(&self, k8s_type: &K8sType) -> bool {
        k8s_type.matches(self.api_version(), self.kind())
    }

    pub fn get_object_id(&self) -> ObjectIdRef {
        ObjectIdRef::new(self.namespace().unwrap_or(""), self.name())
    }

    pub fn str_value(&self, pointer: &str) -> Option<&str> {
        str_value(&self.0, pointer)
    }

    fn validate(value: &Value) -> Result<(), &'static str> {
        value
            .pointer("/metadata/resourceVersion")
            .ok_or("missing metadata.resourceVersion")?;
        value
            .pointer("/metadata/name")
            .ok_or("missing metadata.name")?;
        value.pointer("/metadata/uid").ok_or("missing metadata.uid")?;
        value.pointer("/apiVersion").ok_or("missing apiVersion")?;
        value.pointer("/kind").ok_or("missing kind")?;
        Ok(())
    }
}

impl std::convert::AsRef<Value> for K8sResource {
    fn as_ref(&self) -> &Value {
        &self.0
    }
}

impl From<K8sResource> for Value {
    fn from(resource: K8sResource) -> Value {
        resource.into_value()
    }
}

impl std::fmt::Display for K8sResource {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

pub fn str_value<'a>(json: &'a Value, pointer: &str) -> Option<&'a str> {
    json.pointer(pointer).and_then(Value::as_str)
}

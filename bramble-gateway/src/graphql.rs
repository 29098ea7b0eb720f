//! The GraphQL wire format: requests, responses and errors, shared by the
//! inbound surface and the downstream clients.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::json_ext::Path;

pub type Object = serde_json::Map<String, Value>;

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Request {
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,
    #[serde(skip_serializing_if = "Object::is_empty")]
    pub variables: Object,
}

impl Request {
    pub fn new(query: impl Into<String>) -> Self {
        Request {
            query: query.into(),
            operation_name: None,
            variables: Object::new(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Response {
    /// Absent when the request failed before execution, `null` when a
    /// non-null violation bubbled all the way up.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<Error>,
    #[serde(skip_serializing_if = "Object::is_empty")]
    pub extensions: Object,
}

impl Response {
    /// A response carrying a single top-level error and no data.
    pub fn from_error(error: Error) -> Self {
        Response {
            data: None,
            errors: vec![error],
            extensions: Object::new(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Error {
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub locations: Vec<Location>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<Path>,
    #[serde(skip_serializing_if = "Object::is_empty")]
    pub extensions: Object,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Location {
    pub line: usize,
    pub column: usize,
}

impl Error {
    pub fn new(message: impl Into<String>) -> Self {
        Error {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_path(mut self, path: Path) -> Self {
        self.path = Some(path);
        self
    }

    pub fn with_extension(mut self, key: &str, value: Value) -> Self {
        self.extensions.insert(key.to_owned(), value);
        self
    }

    /// An error attributed to one downstream call, with the extensions the
    /// gateway guarantees on every downstream failure.
    pub fn downstream(
        message: impl Into<String>,
        service_name: &str,
        service_url: &str,
        selection_set: &str,
        selection_path: &[String],
    ) -> Self {
        Error::new(message)
            .with_extension("serviceName", Value::String(service_name.to_owned()))
            .with_extension("serviceUrl", Value::String(service_url.to_owned()))
            .with_extension("selectionSet", Value::String(selection_set.to_owned()))
            .with_extension(
                "selectionPath",
                Value::Array(
                    selection_path
                        .iter()
                        .map(|segment| Value::String(segment.clone()))
                        .collect(),
                ),
            )
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

//! JSON helpers for the response tree: error paths, deep merging, and
//! traversal along insertion points.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

/// One segment of a GraphQL error path.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum PathElement {
    Index(usize),
    Key(String),
}

/// A GraphQL error path, serialized as the standard mixed array of keys and
/// list indices.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Path(pub Vec<PathElement>);

impl Path {
    pub fn push_key(&mut self, key: &str) {
        self.0.push(PathElement::Key(key.to_owned()));
    }

    pub fn push_index(&mut self, index: usize) {
        self.0.push(PathElement::Index(index));
    }

    pub fn pop(&mut self) {
        self.0.pop();
    }
}

impl std::fmt::Display for Path {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (index, element) in self.0.iter().enumerate() {
            if index > 0 {
                f.write_str("/")?;
            }
            match element {
                PathElement::Key(key) => f.write_str(key)?,
                PathElement::Index(i) => write!(f, "{i}")?,
            }
        }
        Ok(())
    }
}

impl From<&[String]> for Path {
    fn from(segments: &[String]) -> Self {
        Path(
            segments
                .iter()
                .map(|segment| PathElement::Key(segment.clone()))
                .collect(),
        )
    }
}

/// Merges `other` into `target`: objects merge key-wise and recursively,
/// anything else is replaced.
pub fn deep_merge(target: &mut Value, other: Value) {
    match (target, other) {
        (Value::Object(target), Value::Object(other)) => {
            for (key, value) in other {
                match target.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        target.insert(key, value);
                    }
                }
            }
        }
        (Value::Array(target), Value::Array(other)) if target.len() == other.len() => {
            for (existing, value) in target.iter_mut().zip(other) {
                deep_merge(existing, value);
            }
        }
        (target, other) => *target = other,
    }
}

/// All values sitting at a response-key path. Arrays are traversed
/// element-wise at every level, so a path through a list addresses each of
/// its elements.
pub fn values_at_path<'a>(value: &'a Value, path: &[String]) -> Vec<&'a Value> {
    match path.split_first() {
        None => match value {
            Value::Array(items) => items
                .iter()
                .flat_map(|item| values_at_path(item, path))
                .collect(),
            Value::Null => Vec::new(),
            other => vec![other],
        },
        Some((key, rest)) => match value {
            Value::Object(map) => map
                .get(key)
                .map(|inner| values_at_path(inner, rest))
                .unwrap_or_default(),
            Value::Array(items) => items
                .iter()
                .flat_map(|item| values_at_path(item, path))
                .collect(),
            _ => Vec::new(),
        },
    }
}

/// Mutable variant of [`values_at_path`].
pub fn values_at_path_mut<'a>(value: &'a mut Value, path: &[String]) -> Vec<&'a mut Value> {
    match path.split_first() {
        None => match value {
            Value::Array(items) => items
                .iter_mut()
                .flat_map(|item| values_at_path_mut(item, path))
                .collect(),
            Value::Null => Vec::new(),
            other => vec![other],
        },
        Some((key, rest)) => match value {
            Value::Object(map) => map
                .get_mut(key)
                .map(|inner| values_at_path_mut(inner, rest))
                .unwrap_or_default(),
            Value::Array(items) => items
                .iter_mut()
                .flat_map(|item| values_at_path_mut(item, path))
                .collect(),
            _ => Vec::new(),
        },
    }
}

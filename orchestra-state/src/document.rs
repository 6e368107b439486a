//! The state document and its persisted form.
//!
//! The document is a tree of JSON objects addressed by [`SectionPath`]s, and
//! it is persisted as that same tree. Data keys are stored verbatim, so keys
//! such as `"a:b"` or `""` inside a section survive a round trip.
//!
//! Loading also accepts older files that stored leaves under their full
//! colon-joined path, so that
//!
//! ```text
//! { "Parameters:key1": "value1" }
//! ```
//!
//! reads as `{ "Parameters": { "key1": "value1" } }`, including a mixture of
//! both forms. Only top-level keys are split: a section path's first segment
//! never contains the delimiter, while keys further down are section data.

use std::{fmt::Display, str::FromStr};

use serde_json::{Map, Value};
use tracing::warn;

use crate::{path::SEGMENT_DELIMITER, SectionPath, StateError};

/// The root of the deployment state.
#[derive(Debug, Clone, PartialEq)]
pub struct StateDocument {
    // Always a `Value::Object`. Kept as a `Value` so that JSON patches apply
    // to it directly.
    root: Value,
}

impl StateDocument {
    pub fn new() -> Self {
        StateDocument {
            root: Value::Object(Map::new()),
        }
    }

    /// Build a document from its persisted representation.
    pub fn from_persisted(persisted: Map<String, Value>) -> Self {
        StateDocument {
            root: Value::Object(unflatten(persisted)),
        }
    }

    /// The representation that gets written to storage.
    pub fn to_persisted(&self) -> Map<String, Value> {
        self.root_map().clone()
    }

    pub fn root_map(&self) -> &Map<String, Value> {
        match &self.root {
            Value::Object(map) => map,
            _ => unreachable!("state document root is always an object"),
        }
    }

    pub fn into_map(self) -> Map<String, Value> {
        match self.root {
            Value::Object(map) => map,
            _ => unreachable!("state document root is always an object"),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.root_map().is_empty()
    }

    /// Look up the object at `path`.
    ///
    /// Returns `None` when the path does not exist or does not resolve to an
    /// object. Never modifies the document.
    pub fn get(&self, path: &SectionPath) -> Option<&Map<String, Value>> {
        let mut current = self.root_map();
        for segment in path.segments() {
            current = current.get(segment)?.as_object()?;
        }
        Some(current)
    }

    /// Replace the object at `path` with `data`, creating intermediate objects
    /// as needed. Siblings of `path` and of its ancestors are left untouched.
    pub fn set(
        &mut self,
        path: &SectionPath,
        data: Map<String, Value>,
    ) -> Result<(), StateError> {
        self.ensure_parents(path);
        let pointer = path.to_json_pointer();
        let operation = json_patch::PatchOperation::Add(json_patch::AddOperation {
            path: parse_pointer(&pointer)?,
            value: Value::Object(data),
        });
        json_patch::patch(&mut self.root, &[operation]).map_err(|e| StateError::Patch {
            pointer,
            message: e.to_string(),
        })
    }

    /// Remove whatever is stored at `path`. Returns whether anything was
    /// removed.
    pub fn remove(&mut self, path: &SectionPath) -> Result<bool, StateError> {
        let pointer = path.to_json_pointer();
        if self.root.pointer(&pointer).is_none() {
            return Ok(false);
        }
        let operation = json_patch::PatchOperation::Remove(json_patch::RemoveOperation {
            path: parse_pointer(&pointer)?,
        });
        json_patch::patch(&mut self.root, &[operation]).map_err(|e| StateError::Patch {
            pointer,
            message: e.to_string(),
        })?;
        Ok(true)
    }

    pub fn clear(&mut self) {
        self.root = Value::Object(Map::new());
    }

    fn ensure_parents(&mut self, path: &SectionPath) {
        let segments: Vec<&str> = path.segments().collect();
        let (_, parents) = segments
            .split_last()
            .expect("section paths have at least one segment");
        let mut current = match &mut self.root {
            Value::Object(map) => map,
            _ => unreachable!("state document root is always an object"),
        };
        for segment in parents {
            let entry = current
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                warn!(
                    section = %path,
                    segment = %segment,
                    "replacing non-object value with an object to store nested section"
                );
                *entry = Value::Object(Map::new());
            }
            current = entry.as_object_mut().expect("just ensured object");
        }
    }
}

impl Default for StateDocument {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_pointer<P>(pointer: &str) -> Result<P, StateError>
where
    P: FromStr,
    P::Err: Display,
{
    pointer.parse::<P>().map_err(|e| StateError::Patch {
        pointer: pointer.to_owned(),
        message: e.to_string(),
    })
}

/// Normalize a loaded document: top-level colon-joined keys are expanded
/// into nested objects and merged with the nested entries for the same path.
/// Everything below the top level is taken as is.
pub fn unflatten(map: Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::new();
    for (key, value) in map {
        let segments: Vec<&str> = if key.split(SEGMENT_DELIMITER).any(str::is_empty) {
            // Not a path we could have written; keep the key verbatim.
            vec![key.as_str()]
        } else {
            key.split(SEGMENT_DELIMITER).collect()
        };
        insert_merged(&mut out, &segments, value);
    }
    out
}

fn insert_merged(target: &mut Map<String, Value>, segments: &[&str], value: Value) {
    let Some((last, parents)) = segments.split_last() else {
        return;
    };
    let mut current = target;
    for segment in parents {
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        current = entry.as_object_mut().expect("just ensured object");
    }
    match current.get_mut(*last) {
        Some(Value::Object(existing)) if value.is_object() => {
            if let Value::Object(incoming) = value {
                for (key, value) in incoming {
                    insert_merged(existing, &[key.as_str()], value);
                }
            }
        }
        _ => {
            current.insert(last.to_string(), value);
        }
    }
}

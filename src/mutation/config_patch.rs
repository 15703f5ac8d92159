//! Structured patches of JSON and YAML configuration files.
//!
//! Keys are dotted paths (`server.port`, `services.0.image`); numeric
//! segments index into sequences.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::EditError;

/// Serialization format of a patched document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigFormat {
    Json,
    Yaml,
}

impl ConfigFormat {
    /// Infers the format from a file extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()?.to_lowercase().as_str() {
            "json" => Some(Self::Json),
            "yaml" | "yml" => Some(Self::Yaml),
            _ => None,
        }
    }

    /// Parses a document; empty input is an empty mapping.
    pub fn parse(&self, content: &str) -> Result<Value, EditError> {
        if content.trim().is_empty() {
            return Ok(Value::Object(Map::new()));
        }
        match self {
            Self::Json => serde_json::from_str(content)
                .map_err(|e| EditError::InvalidEdit(format!("invalid JSON document: {}", e))),
            Self::Yaml => serde_yaml::from_str(content)
                .map_err(|e| EditError::InvalidEdit(format!("invalid YAML document: {}", e))),
        }
    }

    pub fn render(&self, value: &Value) -> Result<String, EditError> {
        match self {
            Self::Json => serde_json::to_string_pretty(value)
                .map(|s| s + "\n")
                .map_err(|e| EditError::InvalidEdit(format!("failed to render JSON: {}", e))),
            Self::Yaml => serde_yaml::to_string(value)
                .map_err(|e| EditError::InvalidEdit(format!("failed to render YAML: {}", e))),
        }
    }
}

fn split_key(key: &str) -> Result<Vec<&str>, EditError> {
    let parts: Vec<&str> = key.split('.').collect();
    if parts.iter().any(|p| p.is_empty()) {
        return Err(EditError::InvalidEdit(format!("invalid dotted key '{}'", key)));
    }
    Ok(parts)
}

/// Looks up a dotted key in a parsed document.
pub fn lookup<'a>(doc: &'a Value, key: &str) -> Option<&'a Value> {
    key.split('.').try_fold(doc, |current, part| match current {
        Value::Object(map) => map.get(part),
        Value::Array(items) => part.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Sets a dotted key, creating missing intermediate mappings.
pub fn set_key(doc: &mut Value, key: &str, value: Value) -> Result<(), EditError> {
    let parts = split_key(key)?;
    let (last, parents) = parts
        .split_last()
        .ok_or_else(|| EditError::InvalidEdit("empty key".to_string()))?;

    let mut current = doc;
    for part in parents {
        current = match current {
            Value::Object(map) => map
                .entry(part.to_string())
                .or_insert_with(|| Value::Object(Map::new())),
            Value::Array(items) => index_mut(items, part, key)?,
            _ => return Err(not_a_mapping(key, part)),
        };
    }

    match current {
        Value::Object(map) => {
            map.insert(last.to_string(), value);
        }
        Value::Array(items) => *index_mut(items, last, key)? = value,
        _ => return Err(not_a_mapping(key, last)),
    }
    Ok(())
}

/// Removes a dotted key. Returns false if it was not present.
pub fn remove_key(doc: &mut Value, key: &str) -> Result<bool, EditError> {
    let parts = split_key(key)?;
    let (last, parents) = parts
        .split_last()
        .ok_or_else(|| EditError::InvalidEdit("empty key".to_string()))?;

    let mut current = doc;
    for part in parents {
        current = match current {
            Value::Object(map) => match map.get_mut(*part) {
                Some(next) => next,
                None => return Ok(false),
            },
            Value::Array(items) => match part.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
                Some(next) => next,
                None => return Ok(false),
            },
            _ => return Ok(false),
        };
    }

    Ok(match current {
        Value::Object(map) => map.remove(*last).is_some(),
        Value::Array(items) => match last.parse::<usize>() {
            Ok(i) if i < items.len() => {
                items.remove(i);
                true
            }
            _ => false,
        },
        _ => false,
    })
}

fn index_mut<'a>(items: &'a mut [Value], part: &str, key: &str) -> Result<&'a mut Value, EditError> {
    let len = items.len();
    part.parse::<usize>()
        .ok()
        .and_then(|i| items.get_mut(i))
        .ok_or_else(|| {
            EditError::InvalidEdit(format!(
                "'{}' in key '{}' is not a valid index into a sequence of {} items",
                part, key, len
            ))
        })
}

fn not_a_mapping(key: &str, part: &str) -> EditError {
    EditError::InvalidEdit(format!(
        "cannot descend into '{}' of key '{}': parent is not a mapping",
        part, key
    ))
}

/// Applies `set` then `remove` to a document and renders it back.
pub fn patch_document(
    content: &str,
    format: ConfigFormat,
    set: &BTreeMap<String, Value>,
    remove: &[String],
) -> Result<String, EditError> {
    let mut doc = format.parse(content)?;
    for (key, value) in set {
        set_key(&mut doc, key, value.clone())?;
    }
    for key in remove {
        remove_key(&mut doc, key)?;
    }
    format.render(&doc)
}

// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Declarative payload schemas.
//!
//! Schemas are written in configuration as plain JSON/YAML values and
//! parsed into a [`SchemaNode`] tree. The dialect is deliberately small:
//!
//! - a bare scalar declares a **required** field whose JSON type must
//!   match the scalar's type (the scalar doubles as the baseline value
//!   when seeding a status template);
//! - a one-key mapping `{default: value}` declares an **optional** field
//!   whose value is filled in when the caller omits it;
//! - a mapping of field names declares a required nested object,
//!   validated recursively;
//! - an empty mapping `{}` accepts anything.
//!
//! Payload fields that the schema does not mention pass through
//! untouched.

mod validator;

pub use validator::{build_status_template, validate_and_default};

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::error::SchemaError;

/// One node of a schema tree.
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaNode {
    /// A required scalar field. The contained value is a type exemplar
    /// for command validation and a baseline value for status seeding.
    Exemplar(Value),
    /// An optional field with an explicit default.
    Default(Value),
    /// A required nested object; all child fields validated recursively.
    Object(BTreeMap<String, SchemaNode>),
    /// No validation; accepts any value.
    Any,
}

impl SchemaNode {
    /// Parses a schema node tree from a configuration value.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::UnsupportedNode`] when a schema position
    /// holds an array or null, which the dialect has no meaning for.
    pub fn from_value(value: &Value) -> Result<Self, SchemaError> {
        Self::from_value_at(value, "")
    }

    fn from_value_at(value: &Value, path: &str) -> Result<Self, SchemaError> {
        match value {
            Value::String(_) | Value::Number(_) | Value::Bool(_) => {
                Ok(Self::Exemplar(value.clone()))
            }
            Value::Object(map) if map.is_empty() => Ok(Self::Any),
            Value::Object(map) if map.len() == 1 && map.contains_key("default") => {
                Ok(Self::Default(map["default"].clone()))
            }
            Value::Object(map) => {
                let mut fields = BTreeMap::new();
                for (key, child) in map {
                    let child_path = join_path(path, key);
                    fields.insert(key.clone(), Self::from_value_at(child, &child_path)?);
                }
                Ok(Self::Object(fields))
            }
            Value::Array(_) => Err(SchemaError::UnsupportedNode {
                path: path.to_string(),
                found: "array",
            }),
            Value::Null => Err(SchemaError::UnsupportedNode {
                path: path.to_string(),
                found: "null",
            }),
        }
    }

    /// Returns `true` if this node is a mapping (`Object` or `Any`),
    /// i.e. something a JSON object payload can be validated against.
    #[must_use]
    pub fn is_mapping(&self) -> bool {
        matches!(self, Self::Object(_) | Self::Any)
    }
}

impl<'de> Deserialize<'de> for SchemaNode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(&value).map_err(serde::de::Error::custom)
    }
}

/// Joins a parent path and a key into a dotted field path.
pub(crate) fn join_path(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}

/// Returns the JSON type name of a value, for error messages.
pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scalar_parses_as_exemplar() {
        let node = SchemaNode::from_value(&json!("absolute")).unwrap();
        assert_eq!(node, SchemaNode::Exemplar(json!("absolute")));
    }

    #[test]
    fn default_mapping_parses_as_default() {
        let node = SchemaNode::from_value(&json!({"default": 100})).unwrap();
        assert_eq!(node, SchemaNode::Default(json!(100)));
    }

    #[test]
    fn empty_mapping_parses_as_any() {
        let node = SchemaNode::from_value(&json!({})).unwrap();
        assert_eq!(node, SchemaNode::Any);
    }

    #[test]
    fn nested_mapping_parses_recursively() {
        let node = SchemaNode::from_value(&json!({
            "target_position": {"x": 0.0, "y": 0.0},
            "speed": {"default": 100},
        }))
        .unwrap();
        let SchemaNode::Object(fields) = node else {
            panic!("expected object node");
        };
        assert!(matches!(fields["target_position"], SchemaNode::Object(_)));
        assert!(matches!(fields["speed"], SchemaNode::Default(_)));
    }

    #[test]
    fn default_key_with_siblings_is_a_nested_object() {
        // Only the one-key {default: v} form is an explicit default.
        let node = SchemaNode::from_value(&json!({"default": 1, "other": 2})).unwrap();
        let SchemaNode::Object(fields) = node else {
            panic!("expected object node");
        };
        assert_eq!(fields["default"], SchemaNode::Exemplar(json!(1)));
    }

    #[test]
    fn array_is_rejected_with_path() {
        let err = SchemaNode::from_value(&json!({"waypoints": [1, 2]})).unwrap_err();
        assert_eq!(
            err,
            SchemaError::UnsupportedNode {
                path: "waypoints".to_string(),
                found: "array",
            }
        );
    }

    #[test]
    fn null_is_rejected() {
        let err = SchemaNode::from_value(&json!({"a": {"b": null}})).unwrap_err();
        assert_eq!(
            err,
            SchemaError::UnsupportedNode {
                path: "a.b".to_string(),
                found: "null",
            }
        );
    }

    #[test]
    fn deserialize_through_serde() {
        let node: SchemaNode = serde_json::from_str(r#"{"mode": "absolute"}"#).unwrap();
        assert!(node.is_mapping());
    }

    #[test]
    fn join_path_roots_and_nests() {
        assert_eq!(join_path("", "x"), "x");
        assert_eq!(join_path("target_position", "x"), "target_position.x");
    }
}

// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Payload validation and status-template seeding over a schema tree.
//!
//! Both operations walk the same [`SchemaNode`] tree but interpret leaf
//! scalars differently: command validation only checks the scalar's
//! *type*, while status seeding uses the scalar's *value* as the field's
//! baseline.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::error::ValidationError;
use crate::schema::{SchemaNode, join_path, json_type_name};

/// Validates a command payload against a schema and fills in defaults.
///
/// The returned object is a new map: the input is never mutated, payload
/// fields the schema does not declare are preserved verbatim, and
/// optional fields absent from the payload are inserted with their
/// declared defaults. Validation is a pure function of its inputs, and
/// re-validating its own output yields the same object.
///
/// Schemas whose root is not a mapping perform no validation and return
/// the payload unchanged.
///
/// # Errors
///
/// Returns [`ValidationError`] citing the dotted path of the first
/// offending field.
pub fn validate_and_default(
    payload: &Map<String, Value>,
    schema: &SchemaNode,
) -> Result<Map<String, Value>, ValidationError> {
    match schema {
        SchemaNode::Object(fields) => validate_object(payload, fields, ""),
        SchemaNode::Any | SchemaNode::Exemplar(_) | SchemaNode::Default(_) => Ok(payload.clone()),
    }
}

fn validate_object(
    payload: &Map<String, Value>,
    fields: &BTreeMap<String, SchemaNode>,
    path: &str,
) -> Result<Map<String, Value>, ValidationError> {
    // Start from a copy so undeclared payload fields pass through.
    let mut result = payload.clone();

    for (key, node) in fields {
        let field_path = join_path(path, key);
        match node {
            SchemaNode::Exemplar(exemplar) => match payload.get(key) {
                None => return Err(ValidationError::MissingField(field_path)),
                Some(actual) => check_scalar_type(exemplar, actual, &field_path)?,
            },
            SchemaNode::Default(default) => {
                // Optional field: insert the default when absent, accept
                // any type when present.
                if !payload.contains_key(key) {
                    result.insert(key.clone(), default.clone());
                }
            }
            SchemaNode::Object(children) => match payload.get(key) {
                None => return Err(ValidationError::MissingField(field_path)),
                Some(Value::Object(child)) => {
                    let validated = validate_object(child, children, &field_path)?;
                    result.insert(key.clone(), Value::Object(validated));
                }
                Some(_) => return Err(ValidationError::NotAnObject(field_path)),
            },
            SchemaNode::Any => {}
        }
    }

    Ok(result)
}

fn check_scalar_type(
    exemplar: &Value,
    actual: &Value,
    path: &str,
) -> Result<(), ValidationError> {
    let ok = match exemplar {
        // A numeric exemplar accepts both integers and floats.
        Value::Number(_) => actual.is_number(),
        Value::Bool(_) => actual.is_boolean(),
        Value::String(_) => actual.is_string(),
        _ => true,
    };
    if ok {
        Ok(())
    } else {
        Err(ValidationError::InvalidType {
            path: path.to_string(),
            expected: json_type_name(exemplar),
            actual: json_type_name(actual),
        })
    }
}

/// Builds the initial status snapshot from a status schema.
///
/// Every leaf contributes its value: bare scalars their baseline value,
/// explicit defaults their default, nested objects recurse, and `{}`
/// nodes contribute an empty object.
#[must_use]
pub fn build_status_template(schema: &SchemaNode) -> Map<String, Value> {
    match schema {
        SchemaNode::Object(fields) => template_object(fields),
        SchemaNode::Any | SchemaNode::Exemplar(_) | SchemaNode::Default(_) => Map::new(),
    }
}

fn template_object(fields: &BTreeMap<String, SchemaNode>) -> Map<String, Value> {
    let mut result = Map::new();
    for (key, node) in fields {
        result.insert(key.clone(), node_value(node));
    }
    result
}

fn node_value(node: &SchemaNode) -> Value {
    match node {
        SchemaNode::Exemplar(value) | SchemaNode::Default(value) => value.clone(),
        SchemaNode::Object(fields) => Value::Object(template_object(fields)),
        SchemaNode::Any => Value::Object(Map::new()),
    }
}

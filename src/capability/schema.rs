//! Declared actions and the validation applied before `execute`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{CapabilityError, ErrorCode};

/// JSON type of a declared field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
    /// Any JSON value.
    Any,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Integer => "integer",
            FieldType::Boolean => "boolean",
            FieldType::Object => "object",
            FieldType::Array => "array",
            FieldType::Any => "any",
        }
    }

    fn matches(&self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Object => value.is_object(),
            FieldType::Array => value.is_array(),
            FieldType::Any => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    #[serde(rename = "type")]
    pub ty: FieldType,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl Field {
    pub fn required(ty: FieldType, description: impl Into<String>) -> Self {
        Self {
            ty,
            description: description.into(),
            required: true,
            default: None,
        }
    }

    pub fn optional(ty: FieldType, description: impl Into<String>) -> Self {
        Self {
            required: false,
            ..Self::required(ty, description)
        }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }
}

/// One executable operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input: BTreeMap<String, Field>,
    #[serde(default)]
    pub output: BTreeMap<String, Field>,
}

impl Action {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input: BTreeMap::new(),
            output: BTreeMap::new(),
        }
    }

    pub fn field(mut self, name: impl Into<String>, field: Field) -> Self {
        self.input.insert(name.into(), field);
        self
    }

    pub fn output(mut self, name: impl Into<String>, field: Field) -> Self {
        self.output.insert(name.into(), field);
        self
    }

    /// Checks `params` against the declared input fields.
    ///
    /// `null` for an optional field counts as absent.
    pub fn validate(&self, params: &Value) -> Result<(), CapabilityError> {
        let empty = serde_json::Map::new();
        let object = match params {
            Value::Object(map) => map,
            Value::Null => &empty,
            other => {
                return Err(CapabilityError::new(
                    ErrorCode::InvalidRequest,
                    format!("{}: params must be an object, got {}", self.name, json_type(other)),
                ))
            }
        };

        for key in object.keys() {
            if !self.input.contains_key(key) {
                return Err(invalid_params(format!("{}: unknown field '{key}'", self.name)));
            }
        }

        for (name, field) in &self.input {
            match object.get(name) {
                None | Some(Value::Null) if field.required => {
                    return Err(invalid_params(format!("{}: '{name}' is required", self.name)));
                }
                None | Some(Value::Null) => {}
                Some(value) if !field.ty.matches(value) => {
                    return Err(invalid_params(format!(
                        "{}: '{name}' must be {}, got {}",
                        self.name,
                        field.ty.as_str(),
                        json_type(value)
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

/// Everything a capability accepts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub actions: Vec<Action>,
    #[serde(default)]
    pub events: Vec<String>,
    #[serde(default)]
    pub config: BTreeMap<String, Field>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    pub fn event(mut self, event: impl Into<String>) -> Self {
        self.events.push(event.into());
        self
    }

    pub fn find(&self, name: &str) -> Option<&Action> {
        self.actions.iter().find(|a| a.name == name)
    }

    pub fn action_names(&self) -> Vec<&str> {
        self.actions.iter().map(|a| a.name.as_str()).collect()
    }

    /// Validates one request: the action must be declared and its
    /// params must satisfy the action's fields.
    pub fn validate(&self, action: &str, params: &Value) -> Result<(), CapabilityError> {
        let declared = self.find(action).ok_or_else(|| {
            CapabilityError::new(
                ErrorCode::InvalidAction,
                format!(
                    "unknown action '{action}' (expected one of: {})",
                    self.action_names().join(", ")
                ),
            )
        })?;
        declared.validate(params)
    }
}

fn invalid_params(message: String) -> CapabilityError {
    CapabilityError::new(ErrorCode::InvalidParams, message)
}

fn json_type(value: &Value) -> &'static str {
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

    fn schema() -> Schema {
        Schema::new()
            .action(
                Action::new("write", "Write a file")
                    .field("path", Field::required(FieldType::String, "Relative path"))
                    .field("content", Field::required(FieldType::String, "File content"))
                    .field("mode", Field::optional(FieldType::Integer, "Unix mode")),
            )
            .action(Action::new("ping", "No input"))
    }

    fn code(result: Result<(), CapabilityError>) -> ErrorCode {
        result.unwrap_err().code
    }

    #[test]
    fn test_valid_params() {
        let s = schema();
        assert!(s.validate("write", &json!({"path": "a", "content": "b"})).is_ok());
        assert!(s.validate("write", &json!({"path": "a", "content": "b", "mode": 420})).is_ok());
        assert!(s.validate("write", &json!({"path": "a", "content": "b", "mode": null})).is_ok());
        assert!(s.validate("ping", &Value::Null).is_ok());
    }

    #[test]
    fn test_unknown_action() {
        let err = schema().validate("delete", &json!({})).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidAction);
        assert!(err.message.contains("write, ping"));
    }

    #[test]
    fn test_params_must_be_object() {
        assert_eq!(code(schema().validate("write", &json!("path"))), ErrorCode::InvalidRequest);
    }

    #[test]
    fn test_missing_required_field() {
        let s = schema();
        assert_eq!(code(s.validate("write", &json!({"path": "a"}))), ErrorCode::InvalidParams);
        assert_eq!(
            code(s.validate("write", &json!({"path": null, "content": "b"}))),
            ErrorCode::InvalidParams
        );
    }

    #[test]
    fn test_wrong_type() {
        let err = schema()
            .validate("write", &json!({"path": 1, "content": "b"}))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidParams);
        assert!(err.message.contains("'path' must be string, got number"));

        assert_eq!(
            code(schema().validate("write", &json!({"path": "a", "content": "b", "mode": 1.5}))),
            ErrorCode::InvalidParams
        );
    }

    #[test]
    fn test_undeclared_field() {
        let err = schema()
            .validate("ping", &json!({"extra": true}))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidParams);
        assert!(err.message.contains("unknown field 'extra'"));
    }

    #[test]
    fn test_schema_serializes_type_key() {
        let value = serde_json::to_value(Field::required(FieldType::Array, "items")).unwrap();
        assert_eq!(value["type"], "array");
        assert_eq!(value["required"], true);
    }
}

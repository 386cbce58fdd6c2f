use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::debug;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// JSON types an action parameter may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
}

impl ParameterType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
        }
    }

    /// Maps a JSON-schema `type` keyword onto a parameter type.
    pub fn from_schema(ty: &str) -> Option<Self> {
        match ty {
            "string" => Some(Self::String),
            "number" => Some(Self::Number),
            "integer" => Some(Self::Integer),
            "boolean" => Some(Self::Boolean),
            "object" => Some(Self::Object),
            "array" => Some(Self::Array),
            _ => None,
        }
    }

    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionParameter {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ParameterType,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
}

impl ActionParameter {
    pub fn required(
        name: impl Into<String>,
        kind: ParameterType,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            description: description.into(),
            required: true,
        }
    }

    pub fn optional(
        name: impl Into<String>,
        kind: ParameterType,
        description: impl Into<String>,
    ) -> Self {
        Self {
            required: false,
            ..Self::required(name, kind, description)
        }
    }
}

/// Everything the model is told about an action: its name, what it is for,
/// and the parameters it takes. Parameter names are unique.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionDescriptor {
    name: String,
    description: String,
    parameters: Vec<ActionParameter>,
}

impl ActionDescriptor {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Vec<ActionParameter>,
    ) -> Result<Self, ActionError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ActionError::InvalidDescriptor {
                action: name,
                reason: "name must not be empty".to_string(),
            });
        }

        let mut seen = HashSet::new();
        for parameter in &parameters {
            if parameter.name.trim().is_empty() {
                return Err(ActionError::InvalidDescriptor {
                    action: name,
                    reason: "parameter names must not be empty".to_string(),
                });
            }
            if !seen.insert(parameter.name.as_str()) {
                return Err(ActionError::InvalidDescriptor {
                    action: name.clone(),
                    reason: format!("parameter '{}' is declared twice", parameter.name),
                });
            }
        }

        Ok(Self {
            name,
            description: description.into(),
            parameters,
        })
    }

    pub fn builder(
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> ActionDescriptorBuilder {
        ActionDescriptorBuilder {
            name: name.into(),
            description: description.into(),
            parameters: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn parameters(&self) -> &[ActionParameter] {
        &self.parameters
    }

    pub fn parameter(&self, name: &str) -> Option<&ActionParameter> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// The function-calling schema handed to the model.
    pub fn json_schema(&self) -> Value {
        let mut properties = Map::new();
        for parameter in &self.parameters {
            properties.insert(
                parameter.name.clone(),
                json!({
                    "type": parameter.kind.as_str(),
                    "description": parameter.description,
                }),
            );
        }
        let required: Vec<&str> = self
            .parameters
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name.as_str())
            .collect();

        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    /// Checks an invocation's arguments against the declared parameters.
    ///
    /// Required parameters must be present and non-null, present parameters
    /// must match their declared type, and keys the descriptor does not
    /// declare are dropped.
    pub fn validate(&self, invocation: &ActionInvocation) -> Result<ActionArguments, ActionError> {
        let mut raw = match invocation.parsed_arguments() {
            Ok(Value::Object(map)) => map,
            Ok(Value::Null) => Map::new(),
            Ok(other) => {
                return Err(ActionError::MalformedArguments {
                    action: self.name.clone(),
                    reason: format!("expected an object, got {}", json_kind(&other)),
                })
            }
            Err(e) => {
                return Err(ActionError::MalformedArguments {
                    action: self.name.clone(),
                    reason: e.to_string(),
                })
            }
        };

        let mut values = Map::new();
        for parameter in &self.parameters {
            match raw.remove(&parameter.name) {
                None | Some(Value::Null) if parameter.required => {
                    return Err(ActionError::MissingArgument {
                        action: self.name.clone(),
                        parameter: parameter.name.clone(),
                    });
                }
                None | Some(Value::Null) => {}
                Some(value) if !parameter.kind.matches(&value) => {
                    return Err(ActionError::InvalidArgument {
                        action: self.name.clone(),
                        parameter: parameter.name.clone(),
                        expected: parameter.kind.as_str(),
                    });
                }
                Some(value) => {
                    values.insert(parameter.name.clone(), value);
                }
            }
        }

        if !raw.is_empty() {
            let extra: Vec<&String> = raw.keys().collect();
            debug!("Dropping undeclared arguments for '{}': {:?}", self.name, extra);
        }

        Ok(ActionArguments {
            action: self.name.clone(),
            values,
        })
    }
}

pub struct ActionDescriptorBuilder {
    name: String,
    description: String,
    parameters: Vec<ActionParameter>,
}

impl ActionDescriptorBuilder {
    pub fn parameter(mut self, parameter: ActionParameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn build(self) -> Result<ActionDescriptor, ActionError> {
        ActionDescriptor::new(self.name, self.description, self.parameters)
    }
}

/// A call the model asked for. `arguments` is the raw JSON text the model
/// produced; it is only trusted after [`ActionDescriptor::validate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionInvocation {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

impl ActionInvocation {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }

    /// Empty argument text is treated as an empty object.
    pub fn parsed_arguments(&self) -> Result<Value, serde_json::Error> {
        if self.arguments.trim().is_empty() {
            return Ok(Value::Object(Map::new()));
        }
        serde_json::from_str(&self.arguments)
    }
}

/// Arguments that passed validation for one action.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionArguments {
    action: String,
    values: Map<String, Value>,
}

impl ActionArguments {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.values.get(name).and_then(Value::as_str)
    }

    pub fn require_str(&self, name: &str) -> Result<&str, ActionError> {
        self.get_str(name).ok_or_else(|| ActionError::MissingArgument {
            action: self.action.clone(),
            parameter: name.to_string(),
        })
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.values)
    }
}

/// Something the model can call during a chat turn.
#[async_trait]
pub trait Action: Send + Sync {
    fn descriptor(&self) -> &ActionDescriptor;

    async fn invoke(&self, arguments: ActionArguments) -> Result<String, ActionError>;
}

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("invalid action descriptor '{action}': {reason}")]
    InvalidDescriptor { action: String, reason: String },

    #[error("action '{0}' is already registered")]
    Duplicate(String),

    #[error("unknown action '{0}'")]
    Unknown(String),

    #[error("action '{action}' is missing required argument '{parameter}'")]
    MissingArgument { action: String, parameter: String },

    #[error("argument '{parameter}' of action '{action}' must be of type {expected}")]
    InvalidArgument {
        action: String,
        parameter: String,
        expected: &'static str,
    },

    #[error("arguments for action '{action}' are malformed: {reason}")]
    MalformedArguments { action: String, reason: String },

    #[error("action '{action}' failed: {source}")]
    Failed {
        action: String,
        #[source]
        source: BoxError,
    },
}

impl ActionError {
    pub fn failed(action: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Failed {
            action: action.into(),
            source: source.into(),
        }
    }

    /// True when the call itself was wrong, as opposed to the implementation
    /// failing while running it.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::Unknown(_)
                | Self::MissingArgument { .. }
                | Self::InvalidArgument { .. }
                | Self::MalformedArguments { .. }
        )
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

//! Remote chains: actions executed by an external chain server that speaks
//! the LangServe `input_schema` / `invoke` endpoints.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::fs;
use tracing::info;

use crate::action::{
    Action, ActionArguments, ActionDescriptor, ActionError, ActionParameter, ParameterType,
};
use crate::registry::ActionRegistry;

/// One entry of the chains file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainConfig {
    pub name: String,
    pub description: String,
    pub chain_url: String,
    /// When absent, parameters are discovered from the chain's input schema.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Vec<ActionParameter>>,
}

impl ChainConfig {
    pub async fn load_all(path: &Path) -> Result<Vec<ChainConfig>> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read chains at '{}': {}", path.display(), e))?;

        let chains: Vec<ChainConfig> = serde_json::from_str(&content)?;
        Ok(chains)
    }
}

/// A resolved chain: its descriptor plus how to shape the invoke body.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteChainSpec {
    descriptor: ActionDescriptor,
    chain_url: String,
    /// The chain takes a bare value rather than an object of arguments.
    scalar_input: bool,
}

impl RemoteChainSpec {
    pub fn from_parameters(
        config: ChainConfig,
        parameters: Vec<ActionParameter>,
    ) -> Result<Self, ActionError> {
        Ok(Self {
            descriptor: ActionDescriptor::new(config.name, config.description, parameters)?,
            chain_url: config.chain_url,
            scalar_input: false,
        })
    }

    /// Derives parameters from a JSON input schema. Object schemas give one
    /// parameter per property (possibly none); anything else becomes a single
    /// required `input` string.
    pub fn from_schema(config: ChainConfig, schema: &Value) -> Result<Self, ActionError> {
        if schema.get("type").and_then(Value::as_str) != Some("object") {
            let parameters = vec![ActionParameter::required(
                "input",
                ParameterType::String,
                "The input to the chain.",
            )];
            let mut spec = Self::from_parameters(config, parameters)?;
            spec.scalar_input = true;
            return Ok(spec);
        }

        let no_properties = serde_json::Map::new();
        let properties = schema
            .get("properties")
            .and_then(Value::as_object)
            .unwrap_or(&no_properties);

        let required: Vec<&str> = schema
            .get("required")
            .and_then(Value::as_array)
            .map(|names| names.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        let parameters = properties
            .iter()
            .map(|(name, property)| ActionParameter {
                name: name.clone(),
                kind: property
                    .get("type")
                    .and_then(Value::as_str)
                    .and_then(ParameterType::from_schema)
                    .unwrap_or(ParameterType::String),
                description: property
                    .get("description")
                    .or_else(|| property.get("title"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                required: required.contains(&name.as_str()),
            })
            .collect();

        Self::from_parameters(config, parameters)
    }

    /// Uses the configured parameters, or asks the chain server for its
    /// input schema.
    pub async fn resolve(
        client: &reqwest::Client,
        config: ChainConfig,
    ) -> Result<Self, ActionError> {
        if let Some(parameters) = config.parameters.clone() {
            return Self::from_parameters(config, parameters);
        }

        let url = endpoint(&config.chain_url, "input_schema");
        info!("Discovering input schema for chain '{}' at {}", config.name, url);

        let name = config.name.clone();
        let response = client
            .get(&url)
            .send()
            .await
            .map_err(|e| ActionError::failed(&name, e))?
            .error_for_status()
            .map_err(|e| ActionError::failed(&name, e))?;
        let schema: Value = response
            .json()
            .await
            .map_err(|e| ActionError::failed(&name, e))?;

        Self::from_schema(config, &schema)
    }

    pub fn descriptor(&self) -> &ActionDescriptor {
        &self.descriptor
    }

    fn invoke_body(&self, arguments: ActionArguments) -> Value {
        let input = if self.scalar_input {
            arguments.get("input").cloned().unwrap_or(Value::Null)
        } else {
            arguments.into_value()
        };
        json!({ "input": input })
    }
}

pub struct RemoteChainAction {
    spec: Arc<RemoteChainSpec>,
    client: reqwest::Client,
}

impl RemoteChainAction {
    pub fn new(spec: Arc<RemoteChainSpec>, client: reqwest::Client) -> Self {
        Self { spec, client }
    }
}

#[async_trait]
impl Action for RemoteChainAction {
    fn descriptor(&self) -> &ActionDescriptor {
        &self.spec.descriptor
    }

    async fn invoke(&self, arguments: ActionArguments) -> Result<String, ActionError> {
        let name = self.spec.descriptor.name();
        let body = self.spec.invoke_body(arguments);

        let response = self
            .client
            .post(endpoint(&self.spec.chain_url, "invoke"))
            .json(&body)
            .send()
            .await
            .map_err(|e| ActionError::failed(name, e))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ActionError::failed(
                name,
                format!("chain server returned {}: {}", status, detail),
            ));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| ActionError::failed(name, e))?;
        render_output(payload)
            .ok_or_else(|| ActionError::failed(name, "chain response has no output"))
    }
}

/// The remote chains known at startup. Each request gets fresh action
/// instances sharing the resolved specs and one HTTP client.
#[derive(Debug, Clone, Default)]
pub struct ChainCatalog {
    client: reqwest::Client,
    specs: Vec<Arc<RemoteChainSpec>>,
}

impl ChainCatalog {
    pub async fn resolve(configs: Vec<ChainConfig>) -> Result<Self, ActionError> {
        let client = reqwest::Client::new();
        let mut specs = Vec::with_capacity(configs.len());
        for config in configs {
            let spec = RemoteChainSpec::resolve(&client, config).await?;
            info!(
                "Chain '{}' registered with {} parameter(s)",
                spec.descriptor.name(),
                spec.descriptor.parameters().len()
            );
            specs.push(Arc::new(spec));
        }
        Ok(Self { client, specs })
    }

    pub fn from_specs(specs: Vec<RemoteChainSpec>) -> Self {
        Self {
            client: reqwest::Client::new(),
            specs: specs.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn register_into(&self, registry: &mut ActionRegistry) -> Result<(), ActionError> {
        for spec in &self.specs {
            registry.register(RemoteChainAction::new(spec.clone(), self.client.clone()))?;
        }
        Ok(())
    }
}

fn endpoint(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path)
}

fn render_output(mut payload: Value) -> Option<String> {
    match payload.get_mut("output").map(Value::take)? {
        Value::Null => None,
        Value::String(text) => Some(text),
        other => Some(other.to_string()),
    }
}

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use copilot_core::{
    Action, ActionArguments, ActionDescriptor, ActionError, ActionParameter, ActionRegistry,
    ChainCatalog, ChatPromptTemplate, ParameterType, Role, TextGenerator,
};
use tracing::debug;

pub const SAY_HELLO: &str = "sayHello";

const ROAST_INSTRUCTION: &str = "The user tells you their name. Say hello to the person in the \
                                 most ridiculous way, roasting their name.";

/// Greets someone by name through the text generator, mockingly.
pub struct SayHello {
    descriptor: ActionDescriptor,
    prompt: ChatPromptTemplate,
    generator: Arc<dyn TextGenerator>,
}

impl SayHello {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Result<Self, ActionError> {
        let descriptor = ActionDescriptor::builder(SAY_HELLO, "Says hello to someone.")
            .parameter(ActionParameter::required(
                "name",
                ParameterType::String,
                "The name of the person to say hello to.",
            ))
            .build()?;

        let prompt = ChatPromptTemplate::from_messages([
            (Role::System, ROAST_INSTRUCTION),
            (Role::User, "My name is {{ name }}"),
        ])
        .map_err(|e| ActionError::InvalidDescriptor {
            action: SAY_HELLO.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            descriptor,
            prompt,
            generator,
        })
    }
}

#[async_trait]
impl Action for SayHello {
    fn descriptor(&self) -> &ActionDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, arguments: ActionArguments) -> Result<String, ActionError> {
        let name = arguments.require_str("name")?;

        let messages = self
            .prompt
            .render(&HashMap::from([("name", name)]))
            .map_err(|e| ActionError::failed(SAY_HELLO, e))?;

        debug!("Asking for a greeting for '{}'", name);
        self.generator
            .generate(&messages)
            .await
            .map_err(|e| ActionError::failed(SAY_HELLO, e))
    }
}

/// The actions offered to the model for one request.
pub fn build_registry(
    generator: Arc<dyn TextGenerator>,
    chains: &ChainCatalog,
) -> Result<ActionRegistry, ActionError> {
    let mut registry = ActionRegistry::new();
    registry.register(SayHello::new(generator)?)?;
    chains.register_into(&mut registry)?;
    Ok(registry)
}

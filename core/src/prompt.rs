use std::collections::HashMap;

use minijinja::{Environment, UndefinedBehavior};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A rendered, role-tagged message ready for a text generator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: Role,
    pub content: String,
}

impl PromptMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("invalid prompt template: {0}")]
    Syntax(#[source] minijinja::Error),

    #[error("failed to render prompt: {0}")]
    Render(#[source] minijinja::Error),
}

impl PromptError {
    /// The template referenced a variable the caller did not supply.
    pub fn is_missing_variable(&self) -> bool {
        matches!(self, PromptError::Render(e) if e.kind() == minijinja::ErrorKind::UndefinedError)
    }
}

/// An ordered list of role-tagged message templates.
///
/// Templates use Jinja syntax (`{{ name }}`). They are compiled once, when the
/// prompt is built, and rendered strictly: an undefined variable is an error
/// rather than an empty string.
#[derive(Debug, Clone)]
pub struct ChatPromptTemplate {
    env: Environment<'static>,
    messages: Vec<(Role, String)>,
}

impl ChatPromptTemplate {
    pub fn from_messages<I, S>(messages: I) -> Result<Self, PromptError>
    where
        I: IntoIterator<Item = (Role, S)>,
        S: Into<String>,
    {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);

        let mut names = Vec::new();
        for (index, (role, source)) in messages.into_iter().enumerate() {
            let name = format!("message_{index}");
            env.add_template_owned(name.clone(), source.into())
                .map_err(PromptError::Syntax)?;
            names.push((role, name));
        }

        Ok(Self {
            env,
            messages: names,
        })
    }

    pub fn render(
        &self,
        variables: &HashMap<&str, &str>,
    ) -> Result<Vec<PromptMessage>, PromptError> {
        self.messages
            .iter()
            .map(|(role, name)| {
                let content = self
                    .env
                    .get_template(name)
                    .and_then(|template| template.render(variables))
                    .map_err(PromptError::Render)?;
                Ok::<_, PromptError>(PromptMessage::new(*role, content))
            })
            .collect()
    }
}

use std::collections::BTreeMap;

use async_openai::{
    config::OpenAIConfig,
    error::OpenAIError,
    types::{
        ChatCompletionMessageToolCall, ChatCompletionRequestAssistantMessageArgs,
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestToolMessageArgs, ChatCompletionRequestUserMessageArgs,
        ChatCompletionTool, ChatCompletionToolArgs, ChatCompletionToolType,
        CreateChatCompletionRequestArgs, FunctionCall, FunctionObjectArgs,
    },
    Client,
};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::LlmConfig;
use crate::prompt::{PromptMessage, Role};
use crate::protocol::{ChatMessage, ToolCall, ToolDefinition};

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("model request failed: {0}")]
    Api(#[from] OpenAIError),

    #[error("model returned an empty completion")]
    EmptyResponse,

    #[error("model backend failed: {0}")]
    Upstream(String),
}

/// Turns a message sequence into text.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, messages: &[PromptMessage]) -> Result<String, LlmError>;
}

/// What a chat model produces during one turn: text as it arrives, then the
/// tool calls it made (possibly none) once the turn is complete.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelEvent {
    TextDelta(String),
    ToolCalls(Vec<ToolCall>),
}

pub type ModelStream = BoxStream<'static, Result<ModelEvent, LlmError>>;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn stream_turn(
        &self,
        messages: Vec<ChatMessage>,
        tools: Vec<ToolDefinition>,
    ) -> Result<ModelStream, LlmError>;
}

/// OpenAI-backed client used both as the chat model and as the text
/// generator behind actions.
pub struct Brain {
    client: Client<OpenAIConfig>,
    model: String,
}

impl Brain {
    pub fn new(config: &LlmConfig) -> Self {
        let mut openai = OpenAIConfig::new().with_api_key(config.api_key.clone());
        if let Some(base) = &config.base_url {
            openai = openai.with_api_base(base.clone());
        }
        let client = Client::with_config(openai);

        info!("Brain connected. Model: {}", config.model);
        Self {
            client,
            model: config.model.clone(),
        }
    }

    /// Connectivity check run once at startup.
    pub async fn ping(&self) -> Result<String, LlmError> {
        self.generate(&[PromptMessage::new(
            Role::User,
            "Hello! Reply with 'System Online'.",
        )])
        .await
    }
}

#[async_trait]
impl TextGenerator for Brain {
    async fn generate(&self, messages: &[PromptMessage]) -> Result<String, LlmError> {
        let messages = messages
            .iter()
            .map(prompt_to_openai)
            .collect::<Result<Vec<_>, _>>()?;

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(messages)
            .build()?;

        let response = self.client.chat().create(request).await?;
        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or(LlmError::EmptyResponse)?;

        debug!("Generated {} bytes", content.len());
        Ok(content)
    }
}

#[async_trait]
impl ChatModel for Brain {
    async fn stream_turn(
        &self,
        messages: Vec<ChatMessage>,
        tools: Vec<ToolDefinition>,
    ) -> Result<ModelStream, LlmError> {
        let messages = messages
            .iter()
            .map(chat_to_openai)
            .collect::<Result<Vec<_>, _>>()?;

        let mut request = CreateChatCompletionRequestArgs::default();
        request.model(&self.model).messages(messages);
        if !tools.is_empty() {
            // Give the model the menu
            let tools = tools
                .iter()
                .map(tool_to_openai)
                .collect::<Result<Vec<_>, _>>()?;
            request.tools(tools);
        }
        let request = request.build()?;

        let upstream = self.client.chat().create_stream(request).await?;

        let events = stream::unfold(
            Some((upstream, ToolCallAccumulator::default())),
            |state| async move {
                let Some((mut upstream, mut calls)) = state else {
                    return None;
                };
                loop {
                    match upstream.next().await {
                        Some(Ok(chunk)) => {
                            let mut text = String::new();
                            for choice in chunk.choices {
                                if let Some(content) = choice.delta.content {
                                    text.push_str(&content);
                                }
                                for call in choice.delta.tool_calls.unwrap_or_default() {
                                    let (name, arguments) = match call.function {
                                        Some(f) => (f.name, f.arguments),
                                        None => (None, None),
                                    };
                                    calls.push(call.index, call.id, name, arguments);
                                }
                            }
                            if !text.is_empty() {
                                return Some((
                                    Ok(ModelEvent::TextDelta(text)),
                                    Some((upstream, calls)),
                                ));
                            }
                        }
                        Some(Err(e)) => return Some((Err(LlmError::Api(e)), None)),
                        None => return Some((Ok(ModelEvent::ToolCalls(calls.finish())), None)),
                    }
                }
            },
        );

        Ok(events.boxed())
    }
}

/// Reassembles tool calls that arrive split across stream chunks, keyed by
/// the index the model assigns each call.
#[derive(Debug, Default)]
pub(crate) struct ToolCallAccumulator {
    calls: BTreeMap<u32, ToolCall>,
}

impl ToolCallAccumulator {
    pub(crate) fn push(
        &mut self,
        index: u32,
        id: Option<String>,
        name: Option<String>,
        arguments: Option<String>,
    ) {
        let call = self
            .calls
            .entry(index)
            .or_insert_with(|| ToolCall::new(String::new(), String::new(), String::new()));
        if let Some(id) = id {
            call.id = id;
        }
        if let Some(name) = name {
            call.name.push_str(&name);
        }
        if let Some(arguments) = arguments {
            call.arguments.push_str(&arguments);
        }
    }

    pub(crate) fn finish(self) -> Vec<ToolCall> {
        self.calls
            .into_values()
            .map(|mut call| {
                if call.id.is_empty() {
                    call.id = format!("call_{}", uuid::Uuid::new_v4().simple());
                }
                call
            })
            .collect()
    }
}

fn prompt_to_openai(message: &PromptMessage) -> Result<ChatCompletionRequestMessage, OpenAIError> {
    text_to_openai(message.role, message.content.clone(), None)
}

fn chat_to_openai(message: &ChatMessage) -> Result<ChatCompletionRequestMessage, OpenAIError> {
    if message.role == Role::Assistant && !message.tool_calls.is_empty() {
        let calls: Vec<ChatCompletionMessageToolCall> = message
            .tool_calls
            .iter()
            .map(|call| ChatCompletionMessageToolCall {
                id: call.id.clone(),
                r#type: ChatCompletionToolType::Function,
                function: FunctionCall {
                    name: call.name.clone(),
                    arguments: call.arguments.clone(),
                },
            })
            .collect();

        let mut builder = ChatCompletionRequestAssistantMessageArgs::default();
        builder.tool_calls(calls);
        if let Some(content) = &message.content {
            builder.content(content.clone());
        }
        return Ok(ChatCompletionRequestMessage::Assistant(builder.build()?));
    }

    text_to_openai(
        message.role,
        message.text().to_string(),
        message.tool_call_id.clone(),
    )
}

fn text_to_openai(
    role: Role,
    content: String,
    tool_call_id: Option<String>,
) -> Result<ChatCompletionRequestMessage, OpenAIError> {
    let message = match role {
        Role::System => ChatCompletionRequestMessage::System(
            ChatCompletionRequestSystemMessageArgs::default()
                .content(content)
                .build()?,
        ),
        Role::User => ChatCompletionRequestMessage::User(
            ChatCompletionRequestUserMessageArgs::default()
                .content(content)
                .build()?,
        ),
        Role::Assistant => ChatCompletionRequestMessage::Assistant(
            ChatCompletionRequestAssistantMessageArgs::default()
                .content(content)
                .build()?,
        ),
        Role::Tool => ChatCompletionRequestMessage::Tool(
            ChatCompletionRequestToolMessageArgs::default()
                .content(content)
                .tool_call_id(tool_call_id.unwrap_or_default())
                .build()?,
        ),
    };
    Ok(message)
}

fn tool_to_openai(tool: &ToolDefinition) -> Result<ChatCompletionTool, OpenAIError> {
    ChatCompletionToolArgs::default()
        .r#type(ChatCompletionToolType::Function)
        .function(
            FunctionObjectArgs::default()
                .name(&tool.name)
                .description(&tool.description)
                .parameters(tool.parameters.clone())
                .build()?,
        )
        .build()
}

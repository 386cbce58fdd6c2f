//! Core of the copilot gateway: the action model, the per-request action
//! registry, prompt templates, the OpenAI-backed model clients and the
//! runtime that turns a chat request into a stream of reply events.

pub mod action;
pub mod chains;
pub mod config;
pub mod llm;
pub mod prompt;
pub mod protocol;
pub mod registry;
pub mod runtime;

pub use action::{
    Action, ActionArguments, ActionDescriptor, ActionError, ActionInvocation, ActionParameter,
    ParameterType,
};
pub use chains::{ChainCatalog, ChainConfig, RemoteChainAction, RemoteChainSpec};
pub use config::{GatewayConfig, LlmConfig};
pub use llm::{Brain, ChatModel, LlmError, ModelEvent, ModelStream, TextGenerator};
pub use prompt::{ChatPromptTemplate, PromptError, PromptMessage, Role};
pub use protocol::{
    ActionOutcome, ChatEvent, ChatMessage, ChatRequest, ChatResponse, ErrorKind, ToolCall,
    ToolDefinition,
};
pub use registry::ActionRegistry;
pub use runtime::{ChatEventStream, CopilotRuntime, RunError};

use std::collections::HashSet;
use std::sync::Arc;

use futures::stream::{BoxStream, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::action::ActionError;
use crate::llm::{ChatModel, LlmError, ModelEvent};
use crate::protocol::{
    ActionOutcome, ChatEvent, ChatMessage, ChatRequest, ChatResponse, ErrorKind, ToolCall,
    ToolDefinition,
};
use crate::registry::ActionRegistry;

pub type ChatEventStream = BoxStream<'static, ChatEvent>;

const EVENT_BUFFER: usize = 32;

/// A failed run, as reported to the caller.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind} error: {message}")]
pub struct RunError {
    pub kind: ErrorKind,
    pub message: String,
}

impl RunError {
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Mediates between a chat request, the model and the registered actions.
///
/// Every call runs independently: the registry and conversation belong to
/// the run, and only the model client is shared.
#[derive(Clone)]
pub struct CopilotRuntime {
    model: Arc<dyn ChatModel>,
    max_rounds: usize,
}

impl CopilotRuntime {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self {
            model,
            max_rounds: 1,
        }
    }

    pub fn with_max_rounds(mut self, max_rounds: usize) -> Self {
        self.max_rounds = max_rounds.max(1);
        self
    }

    /// Starts the run on its own task and returns its events. Dropping the
    /// stream cancels the run.
    pub fn stream(&self, request: ChatRequest, registry: ActionRegistry) -> ChatEventStream {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let run = Run {
            model: self.model.clone(),
            registry,
            max_rounds: self.max_rounds,
            tx,
        };
        tokio::spawn(run.execute(request));
        ReceiverStream::new(rx).boxed()
    }

    /// Runs to completion and folds the events into one response. Action
    /// results are appended to the assistant text in the order they ran.
    pub async fn respond(
        &self,
        request: ChatRequest,
        registry: ActionRegistry,
    ) -> Result<ChatResponse, RunError> {
        let thread_id = request.thread_id.clone();
        let mut events = self.stream(request, registry);

        let mut content = String::new();
        let mut action_results = Vec::new();
        let mut client_tool_calls = Vec::new();
        let mut after_result = false;

        while let Some(event) = events.next().await {
            match event {
                ChatEvent::Text { content: delta } => {
                    if after_result {
                        content.push_str("\n\n");
                        after_result = false;
                    }
                    content.push_str(&delta);
                }
                ChatEvent::ActionExecution { .. } => {}
                ChatEvent::ActionResult { id, name, result } => {
                    if !content.is_empty() {
                        content.push_str("\n\n");
                    }
                    content.push_str(&result);
                    after_result = true;
                    action_results.push(ActionOutcome { id, name, result });
                }
                ChatEvent::ClientToolCall {
                    id,
                    name,
                    arguments,
                } => {
                    let arguments = match arguments {
                        serde_json::Value::String(raw) => raw,
                        other => other.to_string(),
                    };
                    client_tool_calls.push(ToolCall::new(id, name, arguments));
                }
                ChatEvent::Error { kind, message } => return Err(RunError::new(kind, message)),
                ChatEvent::Done => {
                    return Ok(ChatResponse {
                        id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
                        thread_id,
                        message: ChatMessage::assistant(content),
                        action_results,
                        client_tool_calls,
                    })
                }
            }
        }

        Err(RunError::new(
            ErrorKind::Internal,
            "run ended without completing",
        ))
    }
}

enum Halt {
    /// The caller went away; nothing more to send.
    Closed,
    Failed(ErrorKind, String),
}

impl From<LlmError> for Halt {
    fn from(err: LlmError) -> Self {
        Halt::Failed(ErrorKind::Upstream, err.to_string())
    }
}

impl From<ActionError> for Halt {
    fn from(err: ActionError) -> Self {
        let kind = if err.is_validation() {
            ErrorKind::Validation
        } else {
            ErrorKind::Upstream
        };
        Halt::Failed(kind, err.to_string())
    }
}

struct Run {
    model: Arc<dyn ChatModel>,
    registry: ActionRegistry,
    max_rounds: usize,
    tx: mpsc::Sender<ChatEvent>,
}

impl Run {
    async fn execute(self, request: ChatRequest) {
        let outcome = tokio::select! {
            outcome = self.drive(request) => outcome,
            _ = self.tx.closed() => Err(Halt::Closed),
        };

        let last = match outcome {
            Ok(()) => ChatEvent::Done,
            Err(Halt::Closed) => {
                debug!("Caller disconnected; run cancelled");
                return;
            }
            Err(Halt::Failed(kind, message)) => {
                warn!("Run failed ({}): {}", kind, message);
                ChatEvent::Error { kind, message }
            }
        };
        let _ = self.tx.send(last).await;
    }

    async fn emit(&self, event: ChatEvent) -> Result<(), Halt> {
        self.tx.send(event).await.map_err(|_| Halt::Closed)
    }

    /// Server actions come first; caller tools that reuse an action's name
    /// are dropped.
    fn tools(&self, client_tools: Vec<ToolDefinition>) -> (Vec<ToolDefinition>, HashSet<String>) {
        let mut tools = self.registry.tool_definitions();
        let mut client_names = HashSet::new();
        for tool in client_tools {
            if self.registry.contains(&tool.name) || client_names.contains(&tool.name) {
                warn!("Ignoring caller tool '{}': name already taken", tool.name);
                continue;
            }
            client_names.insert(tool.name.clone());
            tools.push(tool);
        }
        (tools, client_names)
    }

    async fn drive(&self, request: ChatRequest) -> Result<(), Halt> {
        if request.messages.is_empty() {
            return Err(Halt::Failed(
                ErrorKind::Validation,
                "chat request contains no messages".to_string(),
            ));
        }

        let (tools, client_tools) = self.tools(request.tools);
        let mut messages = request.messages;

        for round in 0..self.max_rounds {
            debug!("Round {}: {} messages, {} tools", round + 1, messages.len(), tools.len());
            let mut turn = self.model.stream_turn(messages.clone(), tools.clone()).await?;

            let mut text = String::new();
            let mut calls = Vec::new();
            while let Some(event) = turn.next().await {
                match event? {
                    ModelEvent::TextDelta(delta) => {
                        text.push_str(&delta);
                        self.emit(ChatEvent::Text { content: delta }).await?;
                    }
                    ModelEvent::ToolCalls(made) => calls = made,
                }
            }

            if calls.is_empty() {
                return Ok(());
            }

            let mut results = Vec::new();
            let mut handed_back = false;
            for call in &calls {
                if self.registry.contains(&call.name) {
                    info!("Model decided to call action: '{}'", call.name);
                    self.emit(ChatEvent::ActionExecution {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        arguments: call.arguments_value(),
                    })
                    .await?;

                    let result = self.registry.invoke(&call.to_invocation()).await?;
                    self.emit(ChatEvent::ActionResult {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        result: result.clone(),
                    })
                    .await?;
                    results.push((call.id.clone(), result));
                } else if client_tools.contains(&call.name) {
                    info!("Handing tool call '{}' back to the caller", call.name);
                    self.emit(ChatEvent::ClientToolCall {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        arguments: call.arguments_value(),
                    })
                    .await?;
                    handed_back = true;
                } else {
                    return Err(ActionError::Unknown(call.name.clone()).into());
                }
            }

            if handed_back || round + 1 == self.max_rounds {
                return Ok(());
            }

            messages.push(ChatMessage::assistant_tool_calls(text, calls));
            for (id, result) in results {
                messages.push(ChatMessage::tool(id, result));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use futures::stream;
    use mockall::Sequence;

    use super::*;
    use crate::action::{
        Action, ActionArguments, ActionDescriptor, ActionParameter, ParameterType,
    };
    use crate::llm::{MockChatModel, ModelStream};
    use crate::prompt::Role;

    struct Shout {
        descriptor: ActionDescriptor,
    }

    impl Shout {
        fn new() -> Self {
            let descriptor = ActionDescriptor::builder("shout", "Shouts a word.")
                .parameter(ActionParameter::required("word", ParameterType::String, ""))
                .build()
                .unwrap();
            Self { descriptor }
        }
    }

    #[async_trait]
    impl Action for Shout {
        fn descriptor(&self) -> &ActionDescriptor {
            &self.descriptor
        }

        async fn invoke(&self, arguments: ActionArguments) -> Result<String, ActionError> {
            let word = arguments.require_str("word")?;
            if word == "boom" {
                return Err(ActionError::failed("shout", "backend exploded"));
            }
            Ok(format!("{}!", word.to_uppercase()))
        }
    }

    fn registry() -> ActionRegistry {
        let mut registry = ActionRegistry::new();
        registry.register(Shout::new()).unwrap();
        registry
    }

    fn turn(events: Vec<Result<ModelEvent, LlmError>>) -> ModelStream {
        stream::iter(events).boxed()
    }

    fn calls(name: &str, arguments: &str) -> ModelEvent {
        ModelEvent::ToolCalls(vec![ToolCall::new("call_1", name, arguments)])
    }

    fn request(text: &str) -> ChatRequest {
        ChatRequest::new(vec![ChatMessage::user(text)])
    }

    async fn collect(runtime: &CopilotRuntime, request: ChatRequest) -> Vec<ChatEvent> {
        runtime.stream(request, registry()).collect().await
    }

    #[tokio::test]
    async fn plain_text_is_streamed_then_done() {
        let mut model = MockChatModel::new();
        model.expect_stream_turn().times(1).returning(|_, tools| {
            assert_eq!(tools[0].name, "shout");
            Ok(turn(vec![
                Ok(ModelEvent::TextDelta("Hel".into())),
                Ok(ModelEvent::TextDelta("lo".into())),
                Ok(ModelEvent::ToolCalls(vec![])),
            ]))
        });
        let runtime = CopilotRuntime::new(Arc::new(model));

        let events = collect(&runtime, request("hi")).await;
        assert_eq!(
            events,
            vec![
                ChatEvent::Text { content: "Hel".into() },
                ChatEvent::Text { content: "lo".into() },
                ChatEvent::Done,
            ]
        );
    }

    #[tokio::test]
    async fn action_calls_are_executed_and_reported() {
        let mut model = MockChatModel::new();
        model
            .expect_stream_turn()
            .times(1)
            .returning(|_, _| Ok(turn(vec![Ok(calls("shout", r#"{"word":"hey"}"#))])));
        let runtime = CopilotRuntime::new(Arc::new(model));

        let events = collect(&runtime, request("shout hey")).await;
        assert_eq!(
            events,
            vec![
                ChatEvent::ActionExecution {
                    id: "call_1".into(),
                    name: "shout".into(),
                    arguments: serde_json::json!({"word": "hey"}),
                },
                ChatEvent::ActionResult {
                    id: "call_1".into(),
                    name: "shout".into(),
                    result: "HEY!".into(),
                },
                ChatEvent::Done,
            ]
        );
    }

    #[tokio::test]
    async fn invalid_arguments_end_the_run_with_a_validation_error() {
        let mut model = MockChatModel::new();
        model
            .expect_stream_turn()
            .returning(|_, _| Ok(turn(vec![Ok(calls("shout", "{}"))])));
        let runtime = CopilotRuntime::new(Arc::new(model));

        let events = collect(&runtime, request("shout")).await;
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], ChatEvent::ActionExecution { .. }));
        assert!(matches!(
            events[1],
            ChatEvent::Error { kind: ErrorKind::Validation, .. }
        ));
    }

    #[tokio::test]
    async fn unknown_actions_are_rejected() {
        let mut model = MockChatModel::new();
        model
            .expect_stream_turn()
            .returning(|_, _| Ok(turn(vec![Ok(calls("whisper", "{}"))])));
        let runtime = CopilotRuntime::new(Arc::new(model));

        let err = runtime.respond(request("psst"), registry()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
        assert!(err.message.contains("whisper"));
    }

    #[tokio::test]
    async fn failing_actions_surface_as_upstream_errors() {
        let mut model = MockChatModel::new();
        model
            .expect_stream_turn()
            .returning(|_, _| Ok(turn(vec![Ok(calls("shout", r#"{"word":"boom"}"#))])));
        let runtime = CopilotRuntime::new(Arc::new(model));

        let err = runtime.respond(request("boom"), registry()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Upstream);
        assert!(err.message.contains("backend exploded"));
    }

    #[tokio::test]
    async fn model_failures_mid_stream_are_reported() {
        let mut model = MockChatModel::new();
        model.expect_stream_turn().returning(|_, _| {
            Ok(turn(vec![
                Ok(ModelEvent::TextDelta("partial".into())),
                Err(LlmError::Upstream("connection reset".into())),
            ]))
        });
        let runtime = CopilotRuntime::new(Arc::new(model));

        let events = collect(&runtime, request("hi")).await;
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events.last(),
            Some(ChatEvent::Error { kind: ErrorKind::Upstream, .. })
        ));
        assert!(!events.contains(&ChatEvent::Done));
    }

    #[tokio::test]
    async fn model_refusing_the_request_is_an_upstream_error() {
        let mut model = MockChatModel::new();
        model
            .expect_stream_turn()
            .returning(|_, _| Err(LlmError::Upstream("quota exceeded".into())));
        let runtime = CopilotRuntime::new(Arc::new(model));

        let err = runtime.respond(request("hi"), registry()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Upstream);
    }

    #[tokio::test]
    async fn empty_conversations_are_rejected_without_calling_the_model() {
        let model = MockChatModel::new();
        let runtime = CopilotRuntime::new(Arc::new(model));

        let err = runtime
            .respond(ChatRequest::new(vec![]), registry())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[tokio::test]
    async fn caller_tools_are_handed_back() {
        let mut model = MockChatModel::new();
        model.expect_stream_turn().returning(|_, tools| {
            let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
            assert_eq!(names, ["shout", "navigate"]);
            Ok(turn(vec![Ok(calls("navigate", r#"{"page":"/home"}"#))]))
        });
        let runtime = CopilotRuntime::new(Arc::new(model));

        let mut request = request("go home");
        for name in ["navigate", "shout"] {
            request.tools.push(ToolDefinition {
                name: name.to_string(),
                description: String::new(),
                parameters: serde_json::json!({"type": "object"}),
            });
        }

        let response = runtime.respond(request, registry()).await.unwrap();
        assert_eq!(
            response.client_tool_calls,
            vec![ToolCall::new("call_1", "navigate", r#"{"page":"/home"}"#)]
        );
        assert!(response.action_results.is_empty());
    }

    #[tokio::test]
    async fn results_feed_the_next_round_when_allowed() {
        let mut model = MockChatModel::new();
        let mut seq = Sequence::new();
        model
            .expect_stream_turn()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(turn(vec![Ok(calls("shout", r#"{"word":"hey"}"#))])));
        model
            .expect_stream_turn()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|messages, _| {
                messages.len() == 3
                    && messages[1].tool_calls.len() == 1
                    && messages[2].role == Role::Tool
                    && messages[2].text() == "HEY!"
            })
            .returning(|_, _| {
                Ok(turn(vec![
                    Ok(ModelEvent::TextDelta("I shouted for you.".into())),
                    Ok(ModelEvent::ToolCalls(vec![])),
                ]))
            });
        let runtime = CopilotRuntime::new(Arc::new(model)).with_max_rounds(2);

        let response = runtime.respond(request("shout hey"), registry()).await.unwrap();
        assert_eq!(response.message.text(), "HEY!\n\nI shouted for you.");
        assert_eq!(response.action_results.len(), 1);
    }

    #[tokio::test]
    async fn respond_embeds_action_results() {
        let mut model = MockChatModel::new();
        model.expect_stream_turn().returning(|_, _| {
            Ok(turn(vec![
                Ok(ModelEvent::TextDelta("Sure.".into())),
                Ok(calls("shout", r#"{"word":"hey"}"#)),
            ]))
        });
        let runtime = CopilotRuntime::new(Arc::new(model));

        let mut request = request("shout hey");
        request.thread_id = Some("thread-7".into());
        let response = runtime.respond(request, registry()).await.unwrap();
        assert_eq!(response.thread_id.as_deref(), Some("thread-7"));
        assert_eq!(response.message.role, Role::Assistant);
        assert_eq!(response.message.text(), "Sure.\n\nHEY!");
        assert_eq!(response.action_results[0].result, "HEY!");
    }

    /// Streams one text delta, then waits for the gate before making a call
    /// to `count`.
    struct GatedModel {
        gate: Arc<tokio::sync::Notify>,
    }

    #[async_trait]
    impl ChatModel for GatedModel {
        async fn stream_turn(
            &self,
            _messages: Vec<ChatMessage>,
            _tools: Vec<ToolDefinition>,
        ) -> Result<ModelStream, LlmError> {
            let gate = self.gate.clone();
            let first = stream::iter(vec![Ok(ModelEvent::TextDelta("Counting".into()))]);
            let rest = stream::once(async move {
                gate.notified().await;
                Ok(calls("count", "{}"))
            });
            Ok(first.chain(rest).boxed())
        }
    }

    struct Count {
        descriptor: ActionDescriptor,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Action for Count {
        fn descriptor(&self) -> &ActionDescriptor {
            &self.descriptor
        }

        async fn invoke(&self, _arguments: ActionArguments) -> Result<String, ActionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok("1".into())
        }
    }

    #[tokio::test]
    async fn dropping_the_stream_cancels_the_run() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = ActionRegistry::new();
        registry
            .register(Count {
                descriptor: ActionDescriptor::new("count", "Counts.", vec![]).unwrap(),
                calls: calls.clone(),
            })
            .unwrap();

        let runtime = CopilotRuntime::new(Arc::new(GatedModel { gate: gate.clone() }));
        let mut events = runtime.stream(request("count"), registry);
        assert_eq!(
            events.next().await,
            Some(ChatEvent::Text { content: "Counting".into() })
        );
        drop(events);

        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.notify_one();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}

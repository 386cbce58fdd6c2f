pub mod actions;
pub mod api;

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use copilot_core::{
    ChainCatalog, ChatEvent, ChatEventStream, ChatRequest, CopilotRuntime, TextGenerator,
};
use futures::stream::{self, StreamExt};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};

use crate::actions::build_registry;
use crate::api::ApiError;

/// Shared, read-only state. Everything a request mutates is built per request.
#[derive(Clone)]
pub struct AppState {
    runtime: Arc<CopilotRuntime>,
    generator: Arc<dyn TextGenerator>,
    chains: Arc<ChainCatalog>,
}

impl AppState {
    pub fn new(
        runtime: CopilotRuntime,
        generator: Arc<dyn TextGenerator>,
        chains: ChainCatalog,
    ) -> Self {
        Self {
            runtime: Arc::new(runtime),
            generator,
            chains: Arc::new(chains),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/copilotkit", post(copilot_chat))
        .route("/chat", post(copilot_chat))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// --- HANDLERS ---

async fn health_check() -> &'static str {
    "Copilot Gateway: Operational"
}

/// The chat endpoint: builds this request's actions, hands everything to the
/// runtime and returns what it produces.
async fn copilot_chat(
    State(state): State<AppState>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload?;
    let registry = build_registry(state.generator.clone(), &state.chains)?;

    info!(
        "Chat request: {} message(s), {} caller tool(s), {} action(s), stream={}",
        request.messages.len(),
        request.tools.len(),
        registry.len(),
        request.stream
    );

    if request.stream {
        let events = state.runtime.stream(request, registry);
        return Ok(sse_response(events).into_response());
    }

    let response = state.runtime.respond(request, registry).await?;
    Ok(Json(response).into_response())
}

/// One SSE event per chat event, named after its kind, then `[DONE]`.
fn sse_response(
    events: ChatEventStream,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let events = events
        .map(|event| Ok::<_, Infallible>(to_sse_event(&event)))
        .chain(stream::once(async { Ok::<_, Infallible>(Event::default().data("[DONE]")) }));

    Sse::new(events).keep_alive(KeepAlive::default())
}

fn to_sse_event(event: &ChatEvent) -> Event {
    let sse = Event::default().event(event.kind());
    match serde_json::to_string(event) {
        Ok(data) => sse.data(data),
        Err(e) => {
            error!("Failed to encode chat event: {}", e);
            sse.data("{}")
        }
    }
}

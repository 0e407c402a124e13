use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::Stream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{info, warn};

use crate::agent::TurnRunner;
use crate::config::ServerConfig;
use crate::error::{AgentError, Result};
use crate::message::Message;
use crate::runtime::ChatService;
use crate::storage::ConversationStore;

/// HTTP front end for a [`ChatService`].
pub struct ChatServer<R: TurnRunner + 'static, S: ConversationStore + 'static> {
    service: ChatService<R, S>,
    cors_origins: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct InvokeRequest {
    pub messages: Vec<Message>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InvokeResponse {
    pub thread_id: String,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Status for failures that are not answered with an apology.
fn status_for(err: &AgentError) -> StatusCode {
    match err {
        AgentError::InvalidInput(_) | AgentError::UnsettledHistory(_) => StatusCode::BAD_REQUEST,
        AgentError::ThreadBusy(_) => StatusCode::CONFLICT,
        AgentError::TurnDeadlineExceeded(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: &AgentError) -> Response {
    (status_for(err), Json(json!({ "error": err.to_string() }))).into_response()
}

/// `"*"` anywhere in the list allows every origin; an empty list means no CORS layer.
fn cors_layer(origins: &[String]) -> Option<CorsLayer> {
    if origins.is_empty() {
        return None;
    }
    if origins.iter().any(|origin| origin == "*") {
        return Some(CorsLayer::permissive());
    }
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    Some(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(allowed))
            .allow_methods(Any)
            .allow_headers(Any),
    )
}

impl<R: TurnRunner + 'static, S: ConversationStore + 'static> ChatServer<R, S> {
    /// A server without CORS headers.
    pub fn new(service: ChatService<R, S>) -> Self {
        Self {
            service,
            cors_origins: Vec::new(),
        }
    }

    pub fn from_config(service: ChatService<R, S>, cfg: &ServerConfig) -> Self {
        Self::new(service).with_cors_origins(cfg.cors_origins.clone())
    }

    pub fn with_cors_origins(mut self, origins: Vec<String>) -> Self {
        self.cors_origins = origins;
        self
    }

    pub fn router(self) -> Router {
        let cors = cors_layer(&self.cors_origins);
        let app_state = Arc::new(self);
        let router = Router::new()
            .route("/health", get(Self::health))
            .route("/threads/:thread_id", get(Self::history))
            .route("/threads/:thread_id/invoke", post(Self::invoke))
            .route("/threads/:thread_id/stream", post(Self::stream))
            .with_state(app_state);
        match cors {
            Some(layer) => router.layer(layer),
            None => router,
        }
    }

    pub async fn serve(self, addr: SocketAddr) -> Result<()> {
        let app = self.router();
        info!(%addr, "listening");
        axum::serve(tokio::net::TcpListener::bind(addr).await?, app).await?;
        Ok(())
    }

    async fn health() -> impl IntoResponse {
        Json(json!({ "status": "ok" }))
    }

    async fn history(State(state): State<Arc<Self>>, Path(thread_id): Path<String>) -> Response {
        match state.service.history(&thread_id).await {
            Ok(conversation) => Json(InvokeResponse {
                thread_id,
                messages: conversation.into_messages(),
                error: None,
            })
            .into_response(),
            Err(err) => error_response(&err),
        }
    }

    /// Runs a turn. Failures the user can be told about come back as a normal
    /// reply ending in an apology; that reply is not checkpointed.
    async fn invoke(
        State(state): State<Arc<Self>>,
        Path(thread_id): Path<String>,
        Json(req): Json<InvokeRequest>,
    ) -> Response {
        let submitted = req.messages.clone();
        match state.service.invoke(&thread_id, req.messages).await {
            Ok(conversation) => Json(InvokeResponse {
                thread_id,
                messages: conversation.into_messages(),
                error: None,
            })
            .into_response(),
            Err(err) => match err.apology() {
                Some(apology) => {
                    warn!(thread_id = %thread_id, error = %err, "turn failed, replying with apology");
                    let mut messages = state
                        .service
                        .history(&thread_id)
                        .await
                        .map(|c| c.into_messages())
                        .unwrap_or_default();
                    messages.extend(submitted);
                    messages.push(Message::assistant(apology));
                    Json(InvokeResponse {
                        thread_id,
                        messages,
                        error: Some(err.to_string()),
                    })
                    .into_response()
                }
                None => error_response(&err),
            },
        }
    }

    async fn stream(
        State(state): State<Arc<Self>>,
        Path(thread_id): Path<String>,
        Json(req): Json<InvokeRequest>,
    ) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
        let events = state.service.stream(thread_id, req.messages).map(|event| {
            let frame = match Event::default().event(event.kind()).json_data(&event) {
                Ok(frame) => frame,
                Err(err) => Event::default().event("error").data(err.to_string()),
            };
            Ok::<Event, Infallible>(frame)
        });
        Sse::new(events).keep_alive(KeepAlive::default())
    }
}

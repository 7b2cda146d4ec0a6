use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};

use crate::engine::{ChatEngine, SendOptions};
use crate::error::Result;
use crate::session::Slug;

#[derive(Clone)]
pub struct AppState {
    pub engine: ChatEngine,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(engine: ChatEngine) -> Self {
        Self { engine, metrics: None }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateChatBody {
    pub name: String,
    pub model: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateChatResponse {
    pub id: String,
    pub name: String,
    pub created_at: String,
}

async fn create_chat(
    State(state): State<AppState>,
    Json(body): Json<CreateChatBody>,
) -> Result<Json<CreateChatResponse>> {
    let info = state.engine.store().create(&body.name, body.model.as_deref()).await?;
    Ok(Json(CreateChatResponse { id: info.id, name: info.name, created_at: info.created_at }))
}

#[derive(Debug, Deserialize)]
pub struct OpenChatBody {
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct OpenChatResponse {
    pub name: String,
    pub jsonl: String,
}

async fn open_chat(
    State(state): State<AppState>,
    Json(body): Json<OpenChatBody>,
) -> Result<Json<OpenChatResponse>> {
    let jsonl = state.engine.store().read(&body.name).await?;
    Ok(Json(OpenChatResponse { name: body.name, jsonl }))
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub chats: Vec<String>,
}

async fn history_chat(State(state): State<AppState>) -> Result<Json<HistoryResponse>> {
    let chats = state.engine.store().list_all().await?;
    Ok(Json(HistoryResponse { chats }))
}

fn default_stream() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct SendQuery {
    pub name: String,
    #[serde(default = "default_stream")]
    pub stream: bool,
}

#[derive(Debug, Deserialize)]
pub struct SendBody {
    pub content: String,
    #[serde(flatten)]
    pub options: SendOptions,
}

#[derive(Debug, Serialize)]
pub struct SendResponse {
    pub content: String,
}

async fn send(
    State(state): State<AppState>,
    Query(query): Query<SendQuery>,
    Json(body): Json<SendBody>,
) -> Result<Response> {
    Slug::parse(&query.name)?;
    if query.stream {
        let tokens = state.engine.stream_turn(&query.name, &body.content, body.options);
        let headers = [(header::CONTENT_TYPE, "text/plain; charset=utf-8")];
        Ok((headers, Body::from_stream(tokens)).into_response())
    } else {
        let content = state.engine.complete_turn(&query.name, &body.content, body.options).await?;
        Ok(Json(SendResponse { content }).into_response())
    }
}

#[derive(Debug, Serialize)]
pub struct ModelsResponse {
    pub models: Vec<String>,
}

async fn list_models(State(state): State<AppState>) -> Json<ModelsResponse> {
    Json(ModelsResponse { models: state.engine.config().models.clone() })
}

#[derive(Debug, Serialize)]
pub struct ModelChoiceResponse {
    pub index: usize,
    pub model: String,
}

async fn choose_model(
    State(state): State<AppState>,
    Path(index): Path<usize>,
) -> Result<Json<ModelChoiceResponse>> {
    let model = state.engine.config().model_by_index(index)?.to_string();
    Ok(Json(ModelChoiceResponse { index, model }))
}

async fn render_metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/chats/create", post(create_chat))
        .route("/chats/open_chat", post(open_chat))
        .route("/chats/send", post(send))
        .route("/history_chat", get(history_chat))
        .route("/models", get(list_models))
        .route("/models/:index", get(choose_model))
        .route("/metrics", get(render_metrics))
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
    tracing::info!("shutting down");
}

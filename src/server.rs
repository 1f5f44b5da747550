use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::Method,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::{
    bridge::SubscriptionBridge,
    config::Config,
    history::{ChatHistory, HistorySink},
    instances::InstanceManager,
    ws::websocket_handler,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub manager: Arc<InstanceManager>,
    pub bridge: SubscriptionBridge,
    pub history: Arc<ChatHistory>,
}

pub fn build_state(config: Config) -> AppState {
    let manager = Arc::new(InstanceManager::new(config.clone()));
    let history = Arc::new(ChatHistory::new(config.history_limit));
    let bridge = SubscriptionBridge::new(
        Arc::clone(&manager),
        Arc::clone(&history) as Arc<dyn HistorySink>,
        config.bridge_poll_interval,
    );
    AppState {
        config,
        manager,
        bridge,
        history,
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([axum::http::header::CONTENT_TYPE])
        .allow_origin(tower_http::cors::Any);

    Router::new()
        .route("/health", get(health))
        .route("/api/instances", get(list_instances))
        .route("/api/start/:id", post(start_instance))
        .route("/api/stop/:id", post(stop_instance))
        .route("/api/send", post(send_message))
        .route("/api/clean", post(clean_all))
        .route("/api/chat/history", get(chat_history))
        .route("/api/chat/clear", post(clear_chat))
        .route("/api/logs/system", get(system_logs))
        .route("/api/logs/clear", post(clear_logs))
        .route("/ws", get(websocket_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

pub async fn run_server(config: Config) -> anyhow::Result<()> {
    let state = build_state(config.clone());
    let app = router(state);

    let address = config.server_address();
    info!("server listening on {}", address);

    let listener = tokio::net::TcpListener::bind(&address).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "q-console",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "instances": state.manager.list().await.len(),
    }))
}

async fn list_instances(State(state): State<AppState>) -> Json<Value> {
    let instances = state.manager.list().await;
    Json(json!({"success": true, "instances": instances}))
}

async fn start_instance(State(state): State<AppState>, Path(id): Path<String>) -> Json<Value> {
    match state.manager.create(&id).await {
        Ok(snapshot) => {
            state
                .history
                .record_system_event(&format!("instance {id} started"));
            Json(json!({"success": true, "instance": snapshot}))
        }
        Err(e) => {
            state
                .history
                .record_system_event(&format!("failed to start instance {id}: {e}"));
            Json(json!({"success": false, "error": e.to_string()}))
        }
    }
}

async fn stop_instance(State(state): State<AppState>, Path(id): Path<String>) -> Json<Value> {
    match state.manager.stop(&id).await {
        Ok(()) => {
            state
                .history
                .record_system_event(&format!("instance {id} stopped"));
            Json(json!({"success": true}))
        }
        Err(e) => {
            state
                .history
                .record_system_event(&format!("failed to stop instance {id}: {e}"));
            Json(json!({"success": false, "error": e.to_string()}))
        }
    }
}

#[derive(Deserialize)]
struct SendRequest {
    instance_id: String,
    message: String,
}

async fn send_message(State(state): State<AppState>, Json(req): Json<SendRequest>) -> Json<Value> {
    match state.manager.send(&req.instance_id, &req.message).await {
        Ok(()) => {
            state
                .history
                .record_message("user", &req.message, &req.instance_id);
            Json(json!({"success": true}))
        }
        Err(e) => {
            state.history.record_system_event(&format!(
                "failed to send to instance {}: {e}",
                req.instance_id
            ));
            Json(json!({"success": false, "error": e.to_string()}))
        }
    }
}

async fn clean_all(State(state): State<AppState>) -> Json<Value> {
    let report = state.manager.cleanup_all().await;
    let message = if report.is_clean() {
        format!("cleaned up {} instance(s)", report.stopped)
    } else {
        format!(
            "stopped {} instance(s), {} failed",
            report.stopped,
            report.failures.len()
        )
    };
    state.history.record_system_event(&message);
    Json(json!({
        "success": report.is_clean(),
        "message": message,
        "report": report,
    }))
}

#[derive(Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

async fn chat_history(State(state): State<AppState>, Query(q): Query<LimitQuery>) -> Json<Value> {
    Json(json!({"success": true, "history": state.history.chat_history(q.limit)}))
}

async fn system_logs(State(state): State<AppState>, Query(q): Query<LimitQuery>) -> Json<Value> {
    Json(json!({"success": true, "logs": state.history.system_logs(q.limit)}))
}

async fn clear_chat(State(state): State<AppState>) -> Json<Value> {
    state.history.clear_chat_history();
    state.history.record_system_event("chat history cleared");
    Json(json!({"success": true, "message": "chat history cleared"}))
}

async fn clear_logs(State(state): State<AppState>) -> Json<Value> {
    state.history.clear_system_logs();
    state.history.record_system_event("system logs cleared");
    Json(json!({"success": true, "message": "system logs cleared"}))
}

use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use log::{error, info};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::bot::rules::{RuleScope, RuleType};
use crate::bot::ChatBot;

/// Small JSON admin API over a running bot
pub struct AdminServer {
    bot: Arc<ChatBot>,
}

#[derive(Debug, Serialize)]
struct RuleSummary {
    id: u32,
    rule_type: RuleType,
    scope: RuleScope,
    active: bool,
    priority: i32,
    description: Option<String>,
}

impl AdminServer {
    pub fn new(bot: Arc<ChatBot>) -> Self {
        Self { bot }
    }

    pub async fn start_server(&self, port: u16) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let app = self.create_routes();

        let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
        info!("Admin API available at http://localhost:{}/api/status", port);

        axum::serve(listener, app).await?;
        Ok(())
    }

    fn create_routes(&self) -> Router {
        Router::new()
            .route("/api/status", get(get_status))
            .route("/api/health", get(get_health))
            .route("/api/channels", get(get_channels))
            .route("/api/queues", get(get_queues))
            .route("/api/rules", get(get_rules))
            .route("/api/rules/reload", post(reload_rules))
            .layer(CorsLayer::permissive())
            .with_state(Arc::clone(&self.bot))
    }
}

async fn get_status(State(bot): State<Arc<ChatBot>>) -> Result<Json<serde_json::Value>, StatusCode> {
    let snapshot = bot.rule_snapshot().await;
    let channels = bot.directory().all_channels().await;
    Ok(Json(serde_json::json!({
        "success": true,
        "data": {
            "status": "running",
            "timestamp": chrono::Utc::now(),
            "version": env!("CARGO_PKG_VERSION"),
            "rules_loaded": snapshot.len(),
            "rules_generation": snapshot.generation(),
            "channels": channels.len(),
        }
    })))
}

async fn get_health(State(bot): State<Arc<ChatBot>>) -> Result<Json<serde_json::Value>, StatusCode> {
    let health = bot.health_check().await;
    Ok(Json(serde_json::json!({
        "success": true,
        "data": health
    })))
}

async fn get_channels(State(bot): State<Arc<ChatBot>>) -> Result<Json<serde_json::Value>, StatusCode> {
    let channels = bot.directory().all_channels().await;
    Ok(Json(serde_json::json!({
        "success": true,
        "data": channels
    })))
}

async fn get_queues(State(bot): State<Arc<ChatBot>>) -> Result<Json<serde_json::Value>, StatusCode> {
    let stats = bot.queue_stats().await;
    Ok(Json(serde_json::json!({
        "success": true,
        "data": stats
    })))
}

async fn get_rules(State(bot): State<Arc<ChatBot>>) -> Result<Json<serde_json::Value>, StatusCode> {
    let snapshot = bot.rule_snapshot().await;
    let rules: Vec<RuleSummary> = snapshot
        .rules()
        .iter()
        .map(|rule| RuleSummary {
            id: rule.id,
            rule_type: rule.rule_type,
            scope: rule.scope,
            active: rule.active,
            priority: rule.priority,
            description: rule.description.clone(),
        })
        .collect();
    Ok(Json(serde_json::json!({
        "success": true,
        "data": {
            "generation": snapshot.generation(),
            "rules": rules,
        }
    })))
}

async fn reload_rules(State(bot): State<Arc<ChatBot>>) -> (StatusCode, Json<serde_json::Value>) {
    match bot.reload_rules().await {
        Ok(count) => (
            StatusCode::OK,
            Json(serde_json::json!({ "success": true, "data": { "loaded": count } })),
        ),
        Err(e) => {
            error!("Rule reload requested over the admin API failed: {:#}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "success": false, "error": e.to_string() })),
            )
        }
    }
}

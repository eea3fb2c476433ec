//! 管理API
//!
//! 提供连接器状态查询、统计信息和消息重新提交的REST接口

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use hl7_core::{ConnectorRef, Hl7Error, MessageRecord};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::connectors::Connectors;
use crate::dispatcher::MessageDispatcher;
use crate::statistics::Statistics;

/// API状态
#[derive(Clone)]
pub struct ApiState {
    pub dispatcher: Arc<MessageDispatcher>,
    pub connectors: Arc<dyn Connectors>,
}

impl ApiState {
    pub fn new(dispatcher: Arc<MessageDispatcher>, connectors: Arc<dyn Connectors>) -> Self {
        Self { dispatcher, connectors }
    }
}

/// 连接器摘要
#[derive(Debug, Serialize)]
pub struct ConnectorSummary {
    pub reference: ConnectorRef,
    pub description: String,
    pub direction: hl7_core::Direction,
    pub active: bool,
    pub suspended: bool,
}

/// API错误响应
pub struct ApiError(Hl7Error);

impl From<Hl7Error> for ApiError {
    fn from(error: Hl7Error) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Hl7Error::NotFound(_) => StatusCode::NOT_FOUND,
            Hl7Error::InvalidState(_) => StatusCode::CONFLICT,
            Hl7Error::Unsupported(_) | Hl7Error::Protocol(_) => StatusCode::BAD_REQUEST,
            Hl7Error::Interrupted(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

/// API处理器
pub struct ApiHandler;

impl ApiHandler {
    /// 健康检查
    pub async fn health_check() -> Json<HashMap<String, String>> {
        let mut status = HashMap::new();
        status.insert("status".to_string(), "healthy".to_string());
        status.insert("timestamp".to_string(), chrono::Utc::now().to_rfc3339());
        status.insert("version".to_string(), env!("CARGO_PKG_VERSION").to_string());
        Json(status)
    }

    /// 列出所有连接器
    pub async fn list_connectors(State(state): State<ApiState>) -> Json<Vec<ConnectorSummary>> {
        let active = state.dispatcher.active_connectors().await;
        let summaries = state
            .connectors
            .get_connectors()
            .await
            .into_iter()
            .map(|connector| ConnectorSummary {
                active: active.contains(&connector.reference),
                description: connector.to_string(),
                direction: connector.direction(),
                suspended: connector.is_suspended(),
                reference: connector.reference,
            })
            .collect();
        Json(summaries)
    }

    /// 连接器统计信息
    pub async fn get_statistics(
        State(state): State<ApiState>,
        Path(reference): Path<String>,
    ) -> Result<Json<Statistics>, ApiError> {
        debug!("Getting statistics for connector {}", reference);
        let reference = ConnectorRef::new(reference);
        state
            .dispatcher
            .statistics(&reference)
            .await
            .map(Json)
            .ok_or_else(|| ApiError(Hl7Error::NotFound(format!("No active connector {}", reference))))
    }

    /// 重新提交消息
    pub async fn resubmit_message(
        State(state): State<ApiState>,
        Path(id): Path<i64>,
    ) -> Result<Json<MessageRecord>, ApiError> {
        info!("Resubmitting message {}", id);
        let record = state
            .dispatcher
            .service()
            .find(id)
            .await?
            .ok_or_else(|| Hl7Error::NotFound(format!("Message {}", id)))?;
        let record = state.dispatcher.resubmit(&record).await?;
        Ok(Json(record))
    }

    /// 停止连接器
    pub async fn stop_connector(State(state): State<ApiState>, Path(reference): Path<String>) -> StatusCode {
        info!("Stopping connector {}", reference);
        state.dispatcher.stop(&ConnectorRef::new(reference)).await;
        StatusCode::NO_CONTENT
    }
}

/// 创建API路由
pub fn create_api_routes(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(ApiHandler::health_check))
        .route("/connectors", get(ApiHandler::list_connectors))
        .route("/connectors/:reference/statistics", get(ApiHandler::get_statistics))
        .route("/connectors/:reference/stop", post(ApiHandler::stop_connector))
        .route("/messages/:id/resubmit", post(ApiHandler::resubmit_message))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// API服务器
pub struct ApiServer {
    app: Router,
}

impl ApiServer {
    pub fn new(state: ApiState) -> Self {
        let app = create_api_routes(state);
        let app = app.layer(tower_http::cors::CorsLayer::permissive());
        Self { app }
    }

    pub async fn run(self, addr: &str, shutdown: impl std::future::Future<Output = ()> + Send + 'static) -> hl7_core::Result<()> {
        info!("Starting API server on {}", addr);
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }
}

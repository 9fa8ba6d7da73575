use axum::{Json, extract::State, http::StatusCode};
use serde::Serialize;
use sqlx::PgPool;

use crate::state::AppState;

/// ヘルスチェックレスポンス
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    /// データベース接続の状態
    pub database: &'static str,
}

/// ヘルスチェックハンドラー
///
/// GET /api/health
///
/// サービスと DB 接続の稼働状況を返す。
/// ロードバランサーやモニタリングツールから呼び出される。
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    match database_status(&state.db_pool).await {
        "ok" => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ok",
                version: env!("CARGO_PKG_VERSION"),
                database: "ok",
            }),
        ),
        status => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse {
                status: "degraded",
                version: env!("CARGO_PKG_VERSION"),
                database: status,
            }),
        ),
    }
}

/// DB 接続の疎通確認
async fn database_status(pool: &PgPool) -> &'static str {
    match sqlx::query("SELECT 1").execute(pool).await {
        Ok(_) => "ok",
        Err(e) => {
            tracing::error!(error = ?e, "ヘルスチェック: DB 接続に失敗");
            "unavailable"
        }
    }
}

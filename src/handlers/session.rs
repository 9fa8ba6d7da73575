use std::time::Duration;

use axum::http::HeaderMap;
use axum::{
    Json,
    extract::{Query, State},
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::idle::{IdleConfig, IdleState, IdleWatchdog, TimeoutHook};
use crate::models::Agent;
use crate::state::AppState;

/// セッション操作リクエスト（activity / stay / logout 共通）
#[derive(Debug, Deserialize)]
pub struct SessionActionRequest {
    pub session_id: Uuid,
}

/// 状態取得クエリ
#[derive(Debug, Deserialize)]
pub struct SessionStatusQuery {
    pub session_id: Uuid,
}

/// アイドル監視の現在状態レスポンス
#[derive(Debug, Serialize)]
pub struct SessionStateResponse {
    /// "active" | "warning" | "logged_out"
    pub state: &'static str,
    /// 警告表示中のみ: 自動サインアウトまでの残り秒数
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seconds_remaining: Option<u32>,
}

impl SessionStateResponse {
    fn logged_out() -> Self {
        Self {
            state: "logged_out",
            seconds_remaining: None,
        }
    }
}

impl From<IdleState> for SessionStateResponse {
    fn from(state: IdleState) -> Self {
        match state {
            IdleState::Active => Self {
                state: "active",
                seconds_remaining: None,
            },
            IdleState::Warning { seconds_remaining } => Self {
                state: "warning",
                seconds_remaining: Some(seconds_remaining),
            },
            IdleState::LoggedOut => Self::logged_out(),
        }
    }
}

/// サインイン中エージェント情報レスポンス
#[derive(Debug, Serialize)]
pub struct MeResponse {
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// agents テーブル上のプロフィール（登録済みの場合のみ）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<Agent>,
}

/// セッション発行時にアイドル監視を開始する
///
/// タイムアウト到達時は登録簿から自分を外した上で、
/// ID プロバイダーへのサインアウトをベストエフォートで投げる
pub(crate) fn spawn_session_watchdog(state: &AppState, access_token: String) -> Uuid {
    let session_id = Uuid::new_v4();
    let cfg = IdleConfig {
        idle_timeout: Duration::from_secs(state.config.idle_timeout_secs),
        warning_window: Duration::from_secs(state.config.idle_warning_secs),
    };

    let sessions = state.sessions.clone();
    let identity = state.identity.clone();
    let hook: TimeoutHook = Box::new(move || {
        sessions.remove(&session_id);
        tokio::spawn(async move {
            tracing::info!("アイドルタイムアウトに達したためサインアウトします: {}", session_id);
            if let Err(e) = identity.sign_out(&access_token).await {
                tracing::warn!("アイドルサインアウトに失敗しました: {}", e);
            }
        });
    });

    let handle = IdleWatchdog::spawn(cfg, hook);
    state.sessions.insert(session_id, handle);
    session_id
}

/// 操作イベント（クリック）ハンドラー
///
/// POST /api/session/activity
///
/// Active の間だけアイドル期限をリセットする。警告表示中の操作では
/// モーダルは消えない。未知のセッション ID はサインアウト済みとして扱う。
/// レスポンスはコマンド処理後の状態を返す
pub async fn activity(
    State(state): State<AppState>,
    Json(request): Json<SessionActionRequest>,
) -> Json<SessionStateResponse> {
    match state.sessions.get(&request.session_id) {
        Some(handle) => Json(SessionStateResponse::from(handle.activity().await)),
        None => Json(SessionStateResponse::logged_out()),
    }
}

/// 警告モーダル「操作を続ける」ハンドラー
///
/// POST /api/session/stay
///
/// レスポンスはコマンド処理後の状態（警告が消えていれば "active"）
pub async fn stay_logged_in(
    State(state): State<AppState>,
    Json(request): Json<SessionActionRequest>,
) -> Json<SessionStateResponse> {
    match state.sessions.get(&request.session_id) {
        Some(handle) => Json(SessionStateResponse::from(handle.stay_logged_in().await)),
        None => Json(SessionStateResponse::logged_out()),
    }
}

/// 警告モーダル「今すぐログアウト」ハンドラー
///
/// POST /api/session/logout
///
/// タイムアウト時と同じフックを通るため、サインアウトは一度だけ実行される
pub async fn logout_now(
    State(state): State<AppState>,
    Json(request): Json<SessionActionRequest>,
) -> Json<SessionStateResponse> {
    match state.sessions.remove(&request.session_id) {
        Some(handle) => {
            handle.logout_now();
            Json(SessionStateResponse::logged_out())
        }
        None => Json(SessionStateResponse::logged_out()),
    }
}

/// アイドル監視の状態取得ハンドラー
///
/// GET /api/session/status?session_id=...
pub async fn status(
    State(state): State<AppState>,
    Query(query): Query<SessionStatusQuery>,
) -> Json<SessionStateResponse> {
    match state.sessions.get(&query.session_id) {
        Some(handle) => Json(SessionStateResponse::from(handle.state())),
        None => Json(SessionStateResponse::logged_out()),
    }
}

/// サインイン中エージェント情報ハンドラー
///
/// GET /api/session/me
///
/// 処理フロー:
/// 1. Authorization ヘッダーからアクセストークンを取り出す
/// 2. ID プロバイダーにセッションの有効性を問い合わせる
/// 3. agents テーブルのプロフィールを補完する（未登録なら user 情報のみ）
pub async fn me(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<MeResponse>, AppError> {
    // 1. Authorization ヘッダーからアクセストークンを取り出す
    let token = extract_bearer_token(&headers)?;

    // 2. ID プロバイダーにセッションの有効性を問い合わせる
    let user = state
        .identity
        .get_session(token)
        .await?
        .ok_or_else(|| AppError::SignIn("セッションが無効です".to_string()))?;

    // 3. agents テーブルのプロフィールを補完する
    let agent = match Uuid::parse_str(&user.id) {
        Ok(id) => state.agent_repo.find_by_id(id).await?,
        Err(_) => None,
    };

    Ok(Json(MeResponse {
        user_id: user.id,
        email: user.email,
        agent,
    }))
}

/// Authorization: Bearer ヘッダーの解析
fn extract_bearer_token(headers: &HeaderMap) -> Result<&str, AppError> {
    let value = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::Validation("Authorization ヘッダーが必要です".to_string()))?;

    value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| AppError::Validation("Bearer トークンの形式が不正です".to_string()))
}

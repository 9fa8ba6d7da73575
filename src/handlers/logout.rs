use axum::{Json, extract::State};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

/// ログアウトリクエスト
///
/// 各フィールドは独立して処理される。OTP 入力を途中でやめた場合は
/// email だけ、サインイン済みなら session_id と access_token を送る
#[derive(Debug, Deserialize)]
pub struct LogoutRequest {
    /// 保持中の資格情報を破棄する対象メールアドレス
    #[serde(default)]
    pub email: Option<String>,
    /// 停止するアイドル監視のセッション ID
    #[serde(default)]
    pub session_id: Option<Uuid>,
    /// ID プロバイダーのセッションを閉じるアクセストークン
    #[serde(default)]
    pub access_token: Option<String>,
}

/// ログアウトレスポンス
#[derive(Debug, Serialize)]
pub struct LogoutResponse {
    pub logged_out: bool,
}

/// ログアウトハンドラー
///
/// POST /api/logout
///
/// 処理フロー:
/// 1. リクエストバリデーション
/// 2. アイドル監視を停止（サインアウトはこの後の手順で明示的に行うため、
///    タイムアウト用フックは実行しない）
/// 3. 保持中の資格情報を破棄
/// 4. ID プロバイダーのセッションを閉じる
pub async fn logout(
    State(state): State<AppState>,
    Json(request): Json<LogoutRequest>,
) -> Result<Json<LogoutResponse>, AppError> {
    // 1. リクエストバリデーション
    validate_logout_request(&request)?;

    // 2. アイドル監視を停止
    if let Some(session_id) = request.session_id {
        if let Some(handle) = state.sessions.remove(&session_id) {
            handle.teardown();
        }
    }

    // 3. 保持中の資格情報を破棄
    if let Some(email) = &request.email {
        state.login_service.clear_pending(email);
    }

    // 4. ID プロバイダーのセッションを閉じる
    if let Some(token) = &request.access_token {
        state.identity.sign_out(token).await?;
    }

    tracing::info!("ログアウト完了");
    Ok(Json(LogoutResponse { logged_out: true }))
}

/// ログアウトリクエストのバリデーション
fn validate_logout_request(request: &LogoutRequest) -> Result<(), AppError> {
    // 少なくとも 1 つの対象が必要
    if request.email.is_none() && request.session_id.is_none() && request.access_token.is_none() {
        return Err(AppError::Validation(
            "email、session_id、access_token のいずれかが必要です".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_empty_logout_request() {
        let request = LogoutRequest {
            email: None,
            session_id: None,
            access_token: None,
        };

        let result = validate_logout_request(&request);
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_with_email_only() {
        let request = LogoutRequest {
            email: Some("agent@example.com".to_string()),
            session_id: None,
            access_token: None,
        };

        let result = validate_logout_request(&request);
        assert!(result.is_ok());
    }

    #[test]
    fn test_validate_with_session_id_only() {
        let request = LogoutRequest {
            email: None,
            session_id: Some(Uuid::new_v4()),
            access_token: None,
        };

        let result = validate_logout_request(&request);
        assert!(result.is_ok());
    }
}

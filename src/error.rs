use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("アカウントが見つかりません")]
    AccountNotFound,

    #[error("サインインエラー: {0}")]
    SignIn(String),

    #[error("有効な認証コードがありません")]
    OtpNotFound,

    #[error("認証コードの有効期限が切れています")]
    OtpExpired,

    #[error("認証コードが一致しません")]
    OtpMismatch,

    #[error("認証コードが無効です")]
    InvalidOtp,

    #[error("認証コードの送信に失敗しました")]
    OtpDispatchFailed,

    #[error("再送回数の上限か送信間隔の制限に達しています")]
    RateLimited,

    #[error("配信ゲートウェイエラー: {0}")]
    Dispatch(String),

    #[error("バリデーションエラー: {0}")]
    Validation(String),

    #[error("データベースエラー")]
    Database(#[from] sqlx::Error),

    #[error("外部サービス通信エラー")]
    Provider(#[from] reqwest::Error),

    #[error("内部エラー")]
    Internal(#[from] anyhow::Error),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Self::AccountNotFound => (
                StatusCode::NOT_FOUND,
                "アカウントが見つかりません".to_string(),
            ),
            Self::SignIn(e) => {
                tracing::warn!(error = %e, "サインイン失敗");
                (
                    StatusCode::UNAUTHORIZED,
                    "メールアドレスまたはパスワードが正しくありません".to_string(),
                )
            }
            Self::OtpNotFound => (
                StatusCode::BAD_REQUEST,
                "有効な認証コードがありません。コードを再送してください".to_string(),
            ),
            Self::OtpExpired => (
                StatusCode::BAD_REQUEST,
                "認証コードの有効期限が切れています。コードを再送してください".to_string(),
            ),
            Self::OtpMismatch => (
                StatusCode::BAD_REQUEST,
                "認証コードが一致しません".to_string(),
            ),
            Self::InvalidOtp => (
                StatusCode::UNAUTHORIZED,
                "認証コードが正しくありません".to_string(),
            ),
            Self::OtpDispatchFailed => (
                StatusCode::BAD_GATEWAY,
                "認証コードを送信できませんでした。時間をおいて再試行してください".to_string(),
            ),
            Self::RateLimited => (
                StatusCode::TOO_MANY_REQUESTS,
                "リクエストが多すぎます。しばらく待ってから再試行してください".to_string(),
            ),
            Self::Dispatch(e) => {
                tracing::error!(error = %e, "配信ゲートウェイエラー");
                (
                    StatusCode::BAD_GATEWAY,
                    "認証コードの送信に失敗しました".to_string(),
                )
            }
            Self::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            Self::Database(e) => {
                tracing::error!(error = ?e, "データベースエラー");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "内部エラーが発生しました".to_string(),
                )
            }
            Self::Provider(e) => {
                tracing::error!(error = ?e, "外部サービス通信エラー");
                (
                    StatusCode::BAD_GATEWAY,
                    "外部サービスとの通信に失敗しました".to_string(),
                )
            }
            Self::Internal(e) => {
                tracing::error!(error = ?e, "内部エラー");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "内部エラーが発生しました".to_string(),
                )
            }
        };

        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

use axum::{Json, extract::State};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::handlers::session;
use crate::models::OtpChannel;
use crate::services::identity::IdentitySession;
use crate::services::login::LoginOutcome;
use crate::state::AppState;

/// サインイン開始リクエスト
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    /// エージェントのメールアドレス
    pub email: String,
    /// パスワード
    pub password: String,
}

/// OTP 検証リクエスト
#[derive(Debug, Deserialize)]
pub struct VerifyOtpRequest {
    /// サインイン開始時と同じメールアドレス
    pub email: String,
    /// 6桁の認証コード
    pub otp: String,
}

/// OTP 再送リクエスト
#[derive(Debug, Deserialize)]
pub struct ResendOtpRequest {
    pub email: String,
}

/// サインイン関連レスポンス
#[derive(Debug, Serialize)]
pub struct LoginResponse {
    /// OTP 入力が必要かどうか
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requires_otp: Option<bool>,
    /// コードを送信できたチャネル
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels: Option<Vec<OtpChannel>>,
    /// 発行されたセッション（サインイン完了時のみ）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionPayload>,
    /// アイドル監視のセッション ID（サインイン完了時のみ）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
}

/// クライアントへ返すセッション情報
#[derive(Debug, Serialize)]
pub struct SessionPayload {
    pub access_token: String,
    pub expires_in: i64,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl From<IdentitySession> for SessionPayload {
    fn from(session: IdentitySession) -> Self {
        Self {
            access_token: session.access_token,
            expires_in: session.expires_in,
            user_id: session.user.id,
            email: session.user.email,
        }
    }
}

/// サインイン開始ハンドラー
///
/// POST /api/login
///
/// 処理フロー:
/// 1. リクエストバリデーション
/// 2. アカウント検索 + パスワード検証（オーケストレーターに委譲）
/// 3. ステップアップ必須時はメール/SMS 二重チャネルで OTP を配信
/// 4. ステップアップ不要設定ならセッションとアイドル監視を開始
pub async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, AppError> {
    // 1. リクエストバリデーション
    validate_login_request(&request)?;

    // 2-3. オーケストレーターに委譲
    match state
        .login_service
        .begin(&request.email, &request.password)
        .await?
    {
        LoginOutcome::OtpSent { channels } => Ok(Json(LoginResponse {
            requires_otp: Some(true),
            channels: Some(channels),
            session: None,
            session_id: None,
        })),
        LoginOutcome::SignedIn(session) => {
            // 4. セッション確立。アイドル監視をここから開始する
            let session_id =
                session::spawn_session_watchdog(&state, session.access_token.clone());
            Ok(Json(LoginResponse {
                requires_otp: Some(false),
                channels: None,
                session: Some(SessionPayload::from(session)),
                session_id: Some(session_id),
            }))
        }
    }
}

/// OTP 検証ハンドラー
///
/// POST /api/login/otp
///
/// 処理フロー:
/// 1. リクエストバリデーション
/// 2. メール → SMS の順でコードを照合（オーケストレーターに委譲）
/// 3. 保持されていた資格情報で本セッションを発行
/// 4. アイドル監視を開始
pub async fn verify_otp(
    State(state): State<AppState>,
    Json(request): Json<VerifyOtpRequest>,
) -> Result<Json<LoginResponse>, AppError> {
    // 1. リクエストバリデーション
    validate_verify_otp_request(&request)?;

    // 2-3. オーケストレーターに委譲
    let session = state
        .login_service
        .complete(&request.email, &request.otp)
        .await?;

    // 4. アイドル監視を開始
    let session_id = session::spawn_session_watchdog(&state, session.access_token.clone());

    Ok(Json(LoginResponse {
        requires_otp: Some(false),
        channels: None,
        session: Some(SessionPayload::from(session)),
        session_id: Some(session_id),
    }))
}

/// OTP 再送ハンドラー
///
/// POST /api/login/resend
///
/// 再送間隔・回数の制限に達している場合は 429 を返す
pub async fn resend_otp(
    State(state): State<AppState>,
    Json(request): Json<ResendOtpRequest>,
) -> Result<Json<LoginResponse>, AppError> {
    validate_email(&request.email)?;

    let channels = state.login_service.resend(&request.email).await?;

    Ok(Json(LoginResponse {
        requires_otp: Some(true),
        channels: Some(channels),
        session: None,
        session_id: None,
    }))
}

/// メールアドレスの簡易バリデーション（@ が含まれているか）
fn validate_email(email: &str) -> Result<(), AppError> {
    if email.trim().is_empty() {
        return Err(AppError::Validation("メールアドレスは必須です".to_string()));
    }

    if !email.contains('@') {
        return Err(AppError::Validation(
            "有効なメールアドレスを入力してください".to_string(),
        ));
    }

    Ok(())
}

/// OTPコードバリデーション
fn validate_otp_code(code: &str) -> Result<(), AppError> {
    if code.len() != 6 || !code.chars().all(|c| c.is_ascii_digit()) {
        return Err(AppError::Validation(
            "認証コードは6桁の数字で入力してください".to_string(),
        ));
    }
    Ok(())
}

/// サインイン開始リクエストのバリデーション
fn validate_login_request(request: &LoginRequest) -> Result<(), AppError> {
    validate_email(&request.email)?;

    // パスワードポリシーの検証は ID プロバイダー側の責務。ここでは空のみ弾く
    if request.password.is_empty() {
        return Err(AppError::Validation("パスワードは必須です".to_string()));
    }

    Ok(())
}

/// OTP 検証リクエストのバリデーション
fn validate_verify_otp_request(request: &VerifyOtpRequest) -> Result<(), AppError> {
    validate_email(&request.email)?;
    validate_otp_code(&request.otp)
}

use axum::{Json, body::Bytes, extract::State, http::StatusCode};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::models::OtpChannel;
use crate::state::AppState;

/// OTP 関数のアクション
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OtpAction {
    Send,
    Verify,
}

/// OTP 関数リクエスト（email-otp / sms-otp 共通の封筒）
///
/// 宛先は `identifier` でも、チャネル固有の `email` / `phone` でも受け付ける
#[derive(Debug, Deserialize)]
pub struct OtpFunctionRequest {
    pub action: OtpAction,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub identifier: Option<String>,
    #[serde(default)]
    pub otp: Option<String>,
}

/// OTP 関数レスポンス
#[derive(Debug, Serialize)]
pub struct OtpFunctionResponse {
    pub success: bool,
    pub message: String,
}

/// メール OTP 関数ハンドラー
///
/// POST /fn/email-otp
///
/// 処理フロー:
/// 1. ボディを生のバイト列で受け取り、封筒の形を検証
///    （JSON として壊れたボディも {success: false} の 400 で返す）
/// 2. 宛先メールアドレスのバリデーション
/// 3. action に応じて発行または検証
pub async fn email_otp(
    State(state): State<AppState>,
    body: Bytes,
) -> (StatusCode, Json<OtpFunctionResponse>) {
    // 1. 封筒の形を検証
    let request = match parse_function_request(&body) {
        Ok(request) => request,
        Err(response) => return response,
    };

    into_function_response(run_email_action(&state, &request).await)
}

/// SMS OTP 関数ハンドラー
///
/// POST /fn/sms-otp
///
/// 処理フローはメール版と同じ。宛先が電話番号になる
pub async fn sms_otp(
    State(state): State<AppState>,
    body: Bytes,
) -> (StatusCode, Json<OtpFunctionResponse>) {
    let request = match parse_function_request(&body) {
        Ok(request) => request,
        Err(response) => return response,
    };

    into_function_response(run_sms_action(&state, &request).await)
}

async fn run_email_action(
    state: &AppState,
    request: &OtpFunctionRequest,
) -> Result<String, AppError> {
    // 2. 宛先メールアドレスのバリデーション
    let identifier = request
        .email
        .as_deref()
        .or(request.identifier.as_deref())
        .ok_or_else(|| AppError::Validation("email は必須です".to_string()))?;
    validate_email_identifier(identifier)?;

    // 3. action に応じて発行または検証
    match request.action {
        OtpAction::Send => {
            state.otp_service.send(identifier, OtpChannel::Email).await?;
            Ok("認証コードをメールで送信しました".to_string())
        }
        OtpAction::Verify => {
            let otp = required_otp(request)?;
            state
                .otp_service
                .verify(identifier, OtpChannel::Email, otp)
                .await?;
            Ok("認証コードを確認しました".to_string())
        }
    }
}

async fn run_sms_action(
    state: &AppState,
    request: &OtpFunctionRequest,
) -> Result<String, AppError> {
    let identifier = request
        .phone
        .as_deref()
        .or(request.identifier.as_deref())
        .ok_or_else(|| AppError::Validation("phone は必須です".to_string()))?;
    validate_phone_identifier(identifier)?;

    match request.action {
        OtpAction::Send => {
            state.otp_service.send(identifier, OtpChannel::Phone).await?;
            Ok("認証コードを SMS で送信しました".to_string())
        }
        OtpAction::Verify => {
            let otp = required_otp(request)?;
            state
                .otp_service
                .verify(identifier, OtpChannel::Phone, otp)
                .await?;
            Ok("認証コードを確認しました".to_string())
        }
    }
}

/// 封筒の形の検証
///
/// JSON の構文エラーも形の不一致もここで受け止め、axum 標準の 400/415/422 ではなく
/// この関数契約の {success: false} 封筒で 400 を返す
fn parse_function_request(
    body: &[u8],
) -> Result<OtpFunctionRequest, (StatusCode, Json<OtpFunctionResponse>)> {
    serde_json::from_slice(body).map_err(|e| {
        tracing::warn!(error = %e, "OTP 関数リクエストの形式が不正");
        (
            StatusCode::BAD_REQUEST,
            Json(OtpFunctionResponse {
                success: false,
                message: "リクエスト形式が不正です".to_string(),
            }),
        )
    })
}

/// サービス結果を関数契約の封筒へ変換する
///
/// 入力起因の失敗は 400、再送制限は 429、保存・配信の失敗は 500
fn into_function_response(
    result: Result<String, AppError>,
) -> (StatusCode, Json<OtpFunctionResponse>) {
    match result {
        Ok(message) => (
            StatusCode::OK,
            Json(OtpFunctionResponse {
                success: true,
                message,
            }),
        ),
        Err(e) => {
            let (status, message) = match &e {
                AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
                AppError::OtpNotFound | AppError::OtpExpired | AppError::OtpMismatch => {
                    (StatusCode::BAD_REQUEST, e.to_string())
                }
                AppError::RateLimited => (StatusCode::TOO_MANY_REQUESTS, e.to_string()),
                _ => {
                    tracing::error!(error = %e, "OTP 関数内部エラー");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "内部エラーが発生しました".to_string(),
                    )
                }
            };
            (
                status,
                Json(OtpFunctionResponse {
                    success: false,
                    message,
                }),
            )
        }
    }
}

/// verify アクションで必須になる otp フィールドの取り出し
fn required_otp(request: &OtpFunctionRequest) -> Result<&str, AppError> {
    let otp = request
        .otp
        .as_deref()
        .ok_or_else(|| AppError::Validation("otp は必須です".to_string()))?;
    validate_otp_code(otp)?;
    Ok(otp)
}

/// メールアドレスの簡易バリデーション
fn validate_email_identifier(email: &str) -> Result<(), AppError> {
    if email.trim().is_empty() || !email.contains('@') {
        return Err(AppError::Validation(
            "有効なメールアドレスを入力してください".to_string(),
        ));
    }
    Ok(())
}

/// 電話番号の簡易バリデーション（+ は任意、数字 10〜15 桁）
fn validate_phone_identifier(phone: &str) -> Result<(), AppError> {
    let digits = phone.strip_prefix('+').unwrap_or(phone);
    if !(10..=15).contains(&digits.len()) || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(AppError::Validation(
            "有効な電話番号を入力してください".to_string(),
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_send_request() {
        let body = br#"{ "action": "send", "email": "agent@example.com" }"#;

        let request = parse_function_request(body).unwrap();
        assert_eq!(request.action, OtpAction::Send);
        assert_eq!(request.email.as_deref(), Some("agent@example.com"));
    }

    #[test]
    fn test_parse_accepts_identifier_alias() {
        let body = br#"{ "action": "verify", "identifier": "9876543210", "otp": "123456" }"#;

        let request = parse_function_request(body).unwrap();
        assert_eq!(request.action, OtpAction::Verify);
        assert_eq!(request.identifier.as_deref(), Some("9876543210"));
    }

    #[test]
    fn test_parse_rejects_unknown_action() {
        let body = br#"{ "action": "delete", "email": "agent@example.com" }"#;

        let result = parse_function_request(body);
        let (status, Json(response)) = result.unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(!response.success);
    }

    #[test]
    fn test_parse_rejects_missing_action() {
        let body = br#"{ "email": "agent@example.com" }"#;

        assert!(parse_function_request(body).is_err());
    }

    #[test]
    fn test_parse_rejects_non_json_body() {
        // 構文エラーでも封筒形式のレスポンスに落ちる
        let result = parse_function_request(b"not json at all");

        let (status, Json(response)) = result.unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(!response.success);
        assert_eq!(response.message, "リクエスト形式が不正です");
    }

    #[test]
    fn test_validate_email_identifier() {
        assert!(validate_email_identifier("agent@example.com").is_ok());
        assert!(validate_email_identifier("not-an-email").is_err());
        assert!(validate_email_identifier("").is_err());
    }

    #[test]
    fn test_validate_phone_identifier() {
        assert!(validate_phone_identifier("9876543210").is_ok());
        assert!(validate_phone_identifier("+819012345678").is_ok());
        assert!(validate_phone_identifier("12345").is_err());
        assert!(validate_phone_identifier("98765abc10").is_err());
    }

    #[test]
    fn test_required_otp_missing() {
        let request = OtpFunctionRequest {
            action: OtpAction::Verify,
            email: Some("agent@example.com".to_string()),
            phone: None,
            identifier: None,
            otp: None,
        };

        assert!(required_otp(&request).is_err());
    }

    #[test]
    fn test_function_response_maps_not_found_to_400() {
        let (status, Json(response)) = into_function_response(Err(AppError::OtpNotFound));

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(!response.success);
    }

    #[test]
    fn test_function_response_maps_rate_limited_to_429() {
        let (status, Json(response)) = into_function_response(Err(AppError::RateLimited));

        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert!(!response.success);
    }

    #[test]
    fn test_function_response_maps_storage_failure_to_500() {
        let error = AppError::Database(sqlx::Error::RowNotFound);
        let (status, Json(response)) = into_function_response(Err(error));

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!response.success);
        assert_eq!(response.message, "内部エラーが発生しました");
    }

    #[test]
    fn test_function_response_success() {
        let (status, Json(response)) =
            into_function_response(Ok("認証コードを確認しました".to_string()));

        assert_eq!(status, StatusCode::OK);
        assert!(response.success);
    }
}

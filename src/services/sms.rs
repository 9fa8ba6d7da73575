use std::sync::Arc;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::Serialize;

use crate::config::Config;
use crate::error::AppError;
use crate::services::otp::OtpSender;

/// SMS ゲートウェイへの送信リクエスト
///
/// variables はテンプレート内のプレースホルダーを先頭から順に置換する
#[derive(Debug, Serialize)]
struct SmsDispatchRequest {
    template_id: String,
    recipient: String,
    variables: Vec<String>,
}

/// SMS ゲートウェイクライアント
///
/// ゲートウェイ未設定時はログ出力のみの開発モードで動作する
#[derive(Clone)]
pub struct SmsClient {
    client: reqwest::Client,
    config: Arc<Config>,
}

impl SmsClient {
    /// 新しい SmsClient を作成
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    /// 認証コードを SMS で配信
    ///
    /// テンプレート変数は [コード, 有効期限（分）] の順で渡す
    pub async fn send_otp_sms(&self, to: &str, code: &str) -> Result<(), AppError> {
        let (Some(gateway_url), Some(api_key), Some(template_id)) = (
            &self.config.sms_gateway_url,
            &self.config.sms_api_key,
            &self.config.sms_template_id,
        ) else {
            // 開発モード: 送信せずログ出力のみ
            tracing::info!(to = %to, "SMS送信（開発モード）");
            tracing::info!("認証コード: {}", code);
            return Ok(());
        };

        let validity_minutes = (self.config.otp_ttl_secs / 60).max(1);
        let body = SmsDispatchRequest {
            template_id: template_id.clone(),
            recipient: to.to_string(),
            variables: vec![code.to_string(), validity_minutes.to_string()],
        };

        let response: reqwest::Response = self
            .client
            .post(gateway_url.as_str())
            .header("authkey", api_key.expose_secret())
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            tracing::error!(status = %status, to = %to, "SMSゲートウェイがエラーを返却");
            return Err(AppError::Dispatch(format!(
                "SMS gateway returned status: {}",
                status
            )));
        }

        tracing::info!(to = %to, "SMS送信成功");
        Ok(())
    }
}

#[async_trait]
impl OtpSender for SmsClient {
    async fn deliver(&self, recipient: &str, code: &str) -> Result<(), AppError> {
        self.send_otp_sms(recipient, code).await
    }
}

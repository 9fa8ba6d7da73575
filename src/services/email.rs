use std::sync::Arc;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::Serialize;

use crate::config::Config;
use crate::error::AppError;
use crate::services::otp::OtpSender;

/// メールゲートウェイへの送信リクエスト
#[derive(Debug, Serialize)]
struct EmailDispatchRequest {
    recipient: String,
    template_id: String,
    variables: EmailTemplateVariables,
}

/// メールテンプレートに差し込む変数
#[derive(Debug, Serialize)]
struct EmailTemplateVariables {
    otp: String,
    company_name: String,
}

/// メールゲートウェイクライアント
///
/// ゲートウェイ未設定時はログ出力のみの開発モードで動作する
#[derive(Clone)]
pub struct EmailClient {
    client: reqwest::Client,
    config: Arc<Config>,
}

impl EmailClient {
    /// 新しい EmailClient を作成
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    /// 認証コードをメールで配信
    pub async fn send_otp_email(&self, to: &str, code: &str) -> Result<(), AppError> {
        let (Some(gateway_url), Some(api_key), Some(template_id)) = (
            &self.config.email_gateway_url,
            &self.config.email_api_key,
            &self.config.email_template_id,
        ) else {
            // 開発モード: 送信せずログ出力のみ
            tracing::info!(to = %to, "メール送信（開発モード）");
            tracing::info!("認証コード: {}", code);
            return Ok(());
        };

        let body = EmailDispatchRequest {
            recipient: to.to_string(),
            template_id: template_id.clone(),
            variables: EmailTemplateVariables {
                otp: code.to_string(),
                company_name: self.config.company_name.clone(),
            },
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
            tracing::error!(status = %status, to = %to, "メールゲートウェイがエラーを返却");
            return Err(AppError::Dispatch(format!(
                "email gateway returned status: {}",
                status
            )));
        }

        tracing::info!(to = %to, "メール送信成功");
        Ok(())
    }
}

#[async_trait]
impl OtpSender for EmailClient {
    async fn deliver(&self, recipient: &str, code: &str) -> Result<(), AppError> {
        self.send_otp_email(recipient, code).await
    }
}

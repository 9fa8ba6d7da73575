use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// ID プロバイダーが発行したセッション
#[derive(Debug, Clone, Deserialize)]
pub struct IdentitySession {
    pub access_token: String,
    pub expires_in: i64,
    pub user: IdentityUser,
}

/// ID プロバイダー側のユーザー情報
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityUser {
    pub id: String,
    pub email: Option<String>,
}

/// パスワードグラントのリクエストボディ
#[derive(Debug, Serialize)]
struct PasswordGrantRequest {
    email: String,
    password: String,
}

/// 外部 ID プロバイダーのポート
///
/// パスワードの保管と照合はプロバイダー側の責務。
/// 本クレートは資格情報を検証のために中継するだけで、永続化しない
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// メールアドレスとパスワードでサインインし、セッションを発行する
    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<IdentitySession, AppError>;

    /// アクセストークンのセッションを失効させる
    async fn sign_out(&self, access_token: &str) -> Result<(), AppError>;

    /// アクセストークンに紐づくユーザーを取得（無効なトークンは None）
    async fn get_session(&self, access_token: &str) -> Result<Option<IdentityUser>, AppError>;
}

/// ID プロバイダー Auth API クライアント
#[derive(Clone)]
pub struct IdentityClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl IdentityClient {
    /// 新しい IdentityClient を作成
    pub fn new(base_url: String, api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            api_key,
        }
    }
}

#[async_trait]
impl IdentityProvider for IdentityClient {
    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<IdentitySession, AppError> {
        let url = format!("{}/token?grant_type=password", self.base_url);

        let body = PasswordGrantRequest {
            email: email.to_string(),
            password: password.to_string(),
        };

        let response: reqwest::Response = self
            .client
            .post(&url)
            .header("apikey", &self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::BAD_REQUEST || status == StatusCode::UNAUTHORIZED {
            tracing::warn!(email = %email, "IDプロバイダーがサインインを拒否");
            return Err(AppError::SignIn("invalid credentials".to_string()));
        }
        if !status.is_success() {
            tracing::error!(status = %status, "IDプロバイダー token エンドポイントがエラーを返却");
            return Err(AppError::Internal(anyhow::anyhow!(
                "identity provider returned status: {}",
                status
            )));
        }

        let session: IdentitySession = response.json().await.map_err(|e| {
            tracing::error!(error = ?e, "IDプロバイダーレスポンスのパースエラー");
            AppError::Internal(anyhow::anyhow!("failed to parse identity provider response"))
        })?;

        tracing::debug!(user_id = %session.user.id, "サインイン成功");
        Ok(session)
    }

    async fn sign_out(&self, access_token: &str) -> Result<(), AppError> {
        let url = format!("{}/logout", self.base_url);

        let response: reqwest::Response = self
            .client
            .post(&url)
            .header("apikey", &self.api_key)
            .bearer_auth(access_token)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            tracing::error!(status = %status, "IDプロバイダー logout がエラーを返却");
            return Err(AppError::Internal(anyhow::anyhow!(
                "identity provider returned status: {}",
                status
            )));
        }

        tracing::debug!("サインアウト成功");
        Ok(())
    }

    async fn get_session(&self, access_token: &str) -> Result<Option<IdentityUser>, AppError> {
        let url = format!("{}/user", self.base_url);

        let response: reqwest::Response = self
            .client
            .get(&url)
            .header("apikey", &self.api_key)
            .bearer_auth(access_token)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            // トークン失効は正常系として扱う
            return Ok(None);
        }
        if !status.is_success() {
            tracing::error!(status = %status, "IDプロバイダー user エンドポイントがエラーを返却");
            return Err(AppError::Internal(anyhow::anyhow!(
                "identity provider returned status: {}",
                status
            )));
        }

        let user: IdentityUser = response.json().await.map_err(|e| {
            tracing::error!(error = ?e, "IDプロバイダーレスポンスのパースエラー");
            AppError::Internal(anyhow::anyhow!("failed to parse identity provider response"))
        })?;

        Ok(Some(user))
    }
}

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::Agent;

/// エージェントアカウントの参照ポート
#[async_trait]
pub trait AgentDirectory: Send + Sync {
    /// メールアドレスでアカウントを検索（大文字小文字を区別しない）
    async fn find_by_email(&self, email: &str) -> Result<Option<Agent>, AppError>;
}

#[derive(Clone)]
pub struct AgentRepository {
    pool: PgPool,
}

impl AgentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// メールアドレスでアカウントを検索
    ///
    /// # Note
    /// 入力されたアドレスの大文字小文字ゆれを吸収するため LOWER() で比較する。
    /// `idx_agents_email_lower` がこの比較をインデックスで支える
    pub async fn find_by_email(&self, email: &str) -> Result<Option<Agent>, sqlx::Error> {
        sqlx::query_as::<_, Agent>(
            r#"
            SELECT id, email, phone, agency_name, verified, created_at
            FROM agents
            WHERE LOWER(email) = LOWER($1)
            "#,
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await
    }

    /// ID でアカウントを検索
    pub async fn find_by_id(&self, agent_id: Uuid) -> Result<Option<Agent>, sqlx::Error> {
        sqlx::query_as::<_, Agent>(
            r#"
            SELECT id, email, phone, agency_name, verified, created_at
            FROM agents
            WHERE id = $1
            "#,
        )
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await
    }
}

#[async_trait]
impl AgentDirectory for AgentRepository {
    async fn find_by_email(&self, email: &str) -> Result<Option<Agent>, AppError> {
        Ok(AgentRepository::find_by_email(self, email).await?)
    }
}

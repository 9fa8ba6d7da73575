use serde::Serialize;
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// 旅行代理店のエージェントアカウント
///
/// 認証自体は外部 ID プロバイダー側で行うため、パスワードは保持しない
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Agent {
    pub id: Uuid,
    pub email: String,
    pub phone: Option<String>,
    pub agency_name: String,
    pub verified: bool,
    pub created_at: OffsetDateTime,
}

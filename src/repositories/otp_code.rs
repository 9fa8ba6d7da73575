use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;

use crate::error::AppError;
use crate::models::{OtpChannel, OtpCode};

/// OTP レコードの永続化ポート
///
/// 本番では Postgres 実装（`OtpCodeRepository`）を使い、
/// テストではインメモリ実装に差し替える
#[async_trait]
pub trait OtpStore: Send + Sync {
    /// コードを発行または上書きし、保存後のレコードを返す
    async fn upsert(
        &self,
        identifier: &str,
        channel: OtpChannel,
        otp_code: &str,
        expires_at: OffsetDateTime,
        resend_count: i32,
    ) -> Result<OtpCode, AppError>;

    /// 未検証のレコードを検索
    async fn find_unverified(
        &self,
        identifier: &str,
        channel: OtpChannel,
    ) -> Result<Option<OtpCode>, AppError>;

    /// レコードを削除（検証成功時の消費、期限切れ掃除の両方で使う）
    async fn delete(&self, identifier: &str, channel: OtpChannel) -> Result<(), AppError>;

    /// 期限切れレコードを一括削除
    async fn delete_expired(&self) -> Result<u64, AppError>;
}

#[derive(Clone)]
pub struct OtpCodeRepository {
    pool: PgPool,
}

impl OtpCodeRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// コードを発行または上書き
    ///
    /// 挿入と置き換えを単一の UPSERT 文で行うことで、
    /// (identifier, channel) ごとに有効なコードが常に 1 件であることを
    /// DB レベルで保証する（別書き込みとの競合でも増殖しない）
    pub async fn upsert(
        &self,
        identifier: &str,
        channel: OtpChannel,
        otp_code: &str,
        expires_at: OffsetDateTime,
        resend_count: i32,
    ) -> Result<OtpCode, sqlx::Error> {
        sqlx::query_as::<_, OtpCode>(
            r#"
            INSERT INTO otp_codes (identifier, otp_code, channel, verified, resend_count, last_sent_at, expires_at, created_at)
            VALUES ($1, $2, $3, FALSE, $4, NOW(), $5, NOW())
            ON CONFLICT (identifier, channel) DO UPDATE
            SET otp_code = EXCLUDED.otp_code,
                verified = FALSE,
                resend_count = EXCLUDED.resend_count,
                last_sent_at = NOW(),
                expires_at = EXCLUDED.expires_at,
                created_at = NOW()
            RETURNING identifier, otp_code, channel, verified, resend_count, last_sent_at, expires_at, created_at
            "#,
        )
        .bind(identifier)
        .bind(otp_code)
        .bind(channel)
        .bind(resend_count)
        .bind(expires_at)
        .fetch_one(&self.pool)
        .await
    }

    /// 未検証のレコードを検索
    ///
    /// # Note
    /// 有効期限の判定は呼び出し側で行う
    pub async fn find_unverified(
        &self,
        identifier: &str,
        channel: OtpChannel,
    ) -> Result<Option<OtpCode>, sqlx::Error> {
        sqlx::query_as::<_, OtpCode>(
            r#"
            SELECT identifier, otp_code, channel, verified, resend_count, last_sent_at, expires_at, created_at
            FROM otp_codes
            WHERE identifier = $1 AND channel = $2 AND verified = FALSE
            "#,
        )
        .bind(identifier)
        .bind(channel)
        .fetch_optional(&self.pool)
        .await
    }

    /// レコードを削除
    pub async fn delete(&self, identifier: &str, channel: OtpChannel) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            DELETE FROM otp_codes
            WHERE identifier = $1 AND channel = $2
            "#,
        )
        .bind(identifier)
        .bind(channel)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// 期限切れレコードを削除
    ///
    /// # Returns
    /// 削除された行数
    pub async fn delete_expired(&self) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            DELETE FROM otp_codes
            WHERE expires_at < NOW()
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl OtpStore for OtpCodeRepository {
    async fn upsert(
        &self,
        identifier: &str,
        channel: OtpChannel,
        otp_code: &str,
        expires_at: OffsetDateTime,
        resend_count: i32,
    ) -> Result<OtpCode, AppError> {
        Ok(OtpCodeRepository::upsert(self, identifier, channel, otp_code, expires_at, resend_count).await?)
    }

    async fn find_unverified(
        &self,
        identifier: &str,
        channel: OtpChannel,
    ) -> Result<Option<OtpCode>, AppError> {
        Ok(OtpCodeRepository::find_unverified(self, identifier, channel).await?)
    }

    async fn delete(&self, identifier: &str, channel: OtpChannel) -> Result<(), AppError> {
        Ok(OtpCodeRepository::delete(self, identifier, channel).await?)
    }

    async fn delete_expired(&self) -> Result<u64, AppError> {
        Ok(OtpCodeRepository::delete_expired(self).await?)
    }
}

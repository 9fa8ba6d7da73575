use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;

/// OTP の配信チャネル
///
/// DB には小文字の文字列（"email" / "phone"）で保存する
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum OtpChannel {
    Email,
    Phone,
}

impl OtpChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            OtpChannel::Email => "email",
            OtpChannel::Phone => "phone",
        }
    }
}

/// ワンタイム認証コード
///
/// (identifier, channel) ごとに有効なコードは常に 1 件のみ。
/// 再送はレコードを上書きし、検証成功時はレコードごと削除する
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct OtpCode {
    pub identifier: String,
    #[serde(skip)]
    pub otp_code: String,
    pub channel: OtpChannel,
    pub verified: bool,
    pub resend_count: i32,
    pub last_sent_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
    pub created_at: OffsetDateTime,
}

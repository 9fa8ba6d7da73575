use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use time::{Duration, OffsetDateTime};

use crate::error::AppError;
use crate::models::OtpChannel;
use crate::repositories::OtpStore;

/// 認証コードの配信ポート（メール / SMS 共通）
#[async_trait]
pub trait OtpSender: Send + Sync {
    /// 宛先にコードを 1 件配信する
    async fn deliver(&self, recipient: &str, code: &str) -> Result<(), AppError>;
}

/// OTP の発行・検証サービス
///
/// ライフサイクル:
/// - 発行は UPSERT で行い、(identifier, channel) ごとに有効なコードを常に 1 件に保つ。
///   後から発行したコードが勝ち、古いコードはその時点で無効になる
/// - 再送回数と送信間隔のゲートは明示的な再送（`resend`）だけに適用する
/// - 検証成功はレコード削除（= 消費）。同じコードは二度使えない
/// - 不一致ではレコードを残し、再挑戦を許す
/// - 期限切れはその場で削除し、新しい系列（再送カウント 0）を開始する
#[derive(Clone)]
pub struct OtpService {
    store: Arc<dyn OtpStore>,
    email_sender: Arc<dyn OtpSender>,
    sms_sender: Arc<dyn OtpSender>,
    ttl: Duration,
    resend_cooldown: Duration,
    resend_max: i32,
}

impl OtpService {
    pub fn new(
        store: Arc<dyn OtpStore>,
        email_sender: Arc<dyn OtpSender>,
        sms_sender: Arc<dyn OtpSender>,
        ttl_secs: i64,
        resend_cooldown_secs: i64,
        resend_max: i32,
    ) -> Self {
        Self {
            store,
            email_sender,
            sms_sender,
            ttl: Duration::seconds(ttl_secs),
            resend_cooldown: Duration::seconds(resend_cooldown_secs),
            resend_max,
        }
    }

    /// 認証コードを発行して配信する
    ///
    /// 生きているコードが残っていてもゲートなしで上書きし、
    /// 新しい系列（再送カウント 0）を始める。二重タブなどで発行が競合した
    /// 場合は後勝ちで、先に配信されたコードはその時点で検証不能になる
    pub async fn send(&self, identifier: &str, channel: OtpChannel) -> Result<(), AppError> {
        let identifier = normalize_identifier(identifier)?;
        self.issue(identifier, channel, 0).await
    }

    /// OTP 入力画面からの再送として発行する
    ///
    /// 生きているコードがある間は再送回数の上限（resend_max）と
    /// 送信間隔（resend_cooldown）のゲートを通し、どちらかに引っかかると
    /// `AppError::RateLimited` を返す。コードが消費・期限切れで消えていれば
    /// 新しい系列（再送カウント 0）から始める
    pub async fn resend(&self, identifier: &str, channel: OtpChannel) -> Result<(), AppError> {
        let identifier = normalize_identifier(identifier)?;

        let now = OffsetDateTime::now_utc();
        let resend_count = match self.store.find_unverified(identifier, channel).await? {
            Some(existing) if now > existing.expires_at => {
                // 期限切れレコードは削除し、新しい系列を開始（再送カウントもリセット）
                self.store.delete(identifier, channel).await?;
                0
            }
            Some(existing) => {
                if existing.resend_count >= self.resend_max {
                    tracing::warn!(
                        identifier = %identifier,
                        channel = channel.as_str(),
                        "再送回数の上限に到達"
                    );
                    return Err(AppError::RateLimited);
                }
                if now - existing.last_sent_at < self.resend_cooldown {
                    tracing::warn!(
                        identifier = %identifier,
                        channel = channel.as_str(),
                        "再送間隔が短すぎるためブロック"
                    );
                    return Err(AppError::RateLimited);
                }
                existing.resend_count + 1
            }
            None => 0,
        };

        self.issue(identifier, channel, resend_count).await
    }

    /// コードを生成して保存し、チャネルに応じたセンダーで配信する
    async fn issue(
        &self,
        identifier: &str,
        channel: OtpChannel,
        resend_count: i32,
    ) -> Result<(), AppError> {
        let code = generate_code();
        let expires_at = OffsetDateTime::now_utc() + self.ttl;

        // 先に保存し、保存が成功した場合のみ配信する。
        // UPSERT が旧コードを同時に無効化する
        self.store
            .upsert(identifier, channel, &code, expires_at, resend_count)
            .await?;

        match channel {
            OtpChannel::Email => self.email_sender.deliver(identifier, &code).await?,
            OtpChannel::Phone => self.sms_sender.deliver(identifier, &code).await?,
        }

        tracing::info!(
            identifier = %identifier,
            channel = channel.as_str(),
            resend_count,
            "認証コードを送信"
        );
        Ok(())
    }

    /// 提出されたコードを検証する
    ///
    /// 照合は保存値との文字列完全一致のみ
    ///
    /// # Errors
    /// - `OtpNotFound`: 生きているコードが存在しない（再送が必要）
    /// - `OtpExpired`: 期限切れ。レコードは削除される
    /// - `OtpMismatch`: 不一致。レコードは残り、同じコードで再挑戦できる
    pub async fn verify(
        &self,
        identifier: &str,
        channel: OtpChannel,
        submitted: &str,
    ) -> Result<(), AppError> {
        let identifier = identifier.trim();

        let record = self
            .store
            .find_unverified(identifier, channel)
            .await?
            .ok_or(AppError::OtpNotFound)?;

        let now = OffsetDateTime::now_utc();
        if now > record.expires_at {
            // 期限切れコードを残しても再利用はできないため、その場で掃除する
            self.store.delete(identifier, channel).await?;
            return Err(AppError::OtpExpired);
        }

        if record.otp_code != submitted {
            return Err(AppError::OtpMismatch);
        }

        // 一致: 消費としてレコードを削除し、コードの使い回しを防ぐ
        self.store.delete(identifier, channel).await?;
        tracing::info!(
            identifier = %identifier,
            channel = channel.as_str(),
            "認証コードを検証"
        );
        Ok(())
    }
}

/// 6 桁の数字コードを生成（100000〜999999）
fn generate_code() -> String {
    rand::thread_rng().gen_range(100_000..=999_999).to_string()
}

/// 宛先の正規化（前後空白の除去）。空なら弾く
fn normalize_identifier(identifier: &str) -> Result<&str, AppError> {
    let identifier = identifier.trim();
    if identifier.is_empty() {
        return Err(AppError::Validation("宛先が指定されていません".to_string()));
    }
    Ok(identifier)
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::models::OtpCode;

    /// テスト用インメモリストア
    ///
    /// `rewind` でレコードの時刻を過去にずらし、経過時間をシミュレートする
    #[derive(Default)]
    pub(crate) struct MemoryOtpStore {
        rows: Mutex<HashMap<(String, OtpChannel), OtpCode>>,
        find_calls: Mutex<HashMap<OtpChannel, usize>>,
        pub(crate) fail_upserts: AtomicBool,
    }

    impl MemoryOtpStore {
        pub(crate) fn row(&self, identifier: &str, channel: OtpChannel) -> Option<OtpCode> {
            self.rows
                .lock()
                .unwrap()
                .get(&(identifier.to_string(), channel))
                .cloned()
        }

        pub(crate) fn row_count(&self) -> usize {
            self.rows.lock().unwrap().len()
        }

        /// チャネルごとの検索回数（フォールバックの有無を検証するため）
        pub(crate) fn find_calls(&self, channel: OtpChannel) -> usize {
            *self.find_calls.lock().unwrap().get(&channel).unwrap_or(&0)
        }

        pub(crate) fn rewind(&self, identifier: &str, channel: OtpChannel, by: Duration) {
            let mut rows = self.rows.lock().unwrap();
            if let Some(row) = rows.get_mut(&(identifier.to_string(), channel)) {
                row.last_sent_at -= by;
                row.expires_at -= by;
                row.created_at -= by;
            }
        }
    }

    #[async_trait]
    impl OtpStore for MemoryOtpStore {
        async fn upsert(
            &self,
            identifier: &str,
            channel: OtpChannel,
            otp_code: &str,
            expires_at: OffsetDateTime,
            resend_count: i32,
        ) -> Result<OtpCode, AppError> {
            if self.fail_upserts.load(Ordering::SeqCst) {
                return Err(AppError::Internal(anyhow::anyhow!(
                    "storage failure (injected)"
                )));
            }
            let now = OffsetDateTime::now_utc();
            let record = OtpCode {
                identifier: identifier.to_string(),
                otp_code: otp_code.to_string(),
                channel,
                verified: false,
                resend_count,
                last_sent_at: now,
                expires_at,
                created_at: now,
            };
            self.rows
                .lock()
                .unwrap()
                .insert((identifier.to_string(), channel), record.clone());
            Ok(record)
        }

        async fn find_unverified(
            &self,
            identifier: &str,
            channel: OtpChannel,
        ) -> Result<Option<OtpCode>, AppError> {
            *self.find_calls.lock().unwrap().entry(channel).or_insert(0) += 1;
            Ok(self
                .rows
                .lock()
                .unwrap()
                .get(&(identifier.to_string(), channel))
                .filter(|r| !r.verified)
                .cloned())
        }

        async fn delete(&self, identifier: &str, channel: OtpChannel) -> Result<(), AppError> {
            self.rows
                .lock()
                .unwrap()
                .remove(&(identifier.to_string(), channel));
            Ok(())
        }

        async fn delete_expired(&self) -> Result<u64, AppError> {
            let now = OffsetDateTime::now_utc();
            let mut rows = self.rows.lock().unwrap();
            let before = rows.len();
            rows.retain(|_, r| r.expires_at >= now);
            Ok((before - rows.len()) as u64)
        }
    }

    /// 配信内容を記録するテスト用センダー
    #[derive(Default)]
    pub(crate) struct RecordingSender {
        sent: Mutex<Vec<(String, String)>>,
    }

    impl RecordingSender {
        pub(crate) fn last_code_for(&self, recipient: &str) -> Option<String> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|(to, _)| to == recipient)
                .map(|(_, code)| code.clone())
        }

        pub(crate) fn sent_count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl OtpSender for RecordingSender {
        async fn deliver(&self, recipient: &str, code: &str) -> Result<(), AppError> {
            self.sent
                .lock()
                .unwrap()
                .push((recipient.to_string(), code.to_string()));
            Ok(())
        }
    }

    /// 常に失敗するテスト用センダー
    pub(crate) struct FailingSender;

    #[async_trait]
    impl OtpSender for FailingSender {
        async fn deliver(&self, _recipient: &str, _code: &str) -> Result<(), AppError> {
            Err(AppError::Dispatch("delivery failure (injected)".to_string()))
        }
    }
}

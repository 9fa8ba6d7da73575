use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use time::{Duration, OffsetDateTime};

use crate::error::AppError;
use crate::models::{Agent, OtpChannel};
use crate::repositories::AgentDirectory;
use crate::services::identity::{IdentityProvider, IdentitySession};
use crate::services::otp::OtpService;

/// サインイン開始の結果
#[derive(Debug)]
pub enum LoginOutcome {
    /// OTP ステップアップへ進んだ。コードを送信できたチャネル付き
    OtpSent { channels: Vec<OtpChannel> },
    /// ステップアップ不要設定のため、そのままセッションを発行した
    SignedIn(IdentitySession),
}

/// OTP 完了待ちの資格情報
///
/// パスワードは OTP 成功後の再サインインに必要なため一時的に保持する。
/// ログ出力禁止。OTP と同じ期間で失効する
struct PendingLogin {
    password: String,
    created_at: OffsetDateTime,
}

/// サインインオーケストレーター
///
/// フロー:
/// 1. `begin`: アカウント検索 → パスワード検証 → 二重チャネルで OTP 配信
/// 2. `complete`: メール → SMS の順で OTP を照合し、本セッションを発行
///
/// パスワード検証で発行されたセッションは検証のためだけのもので、
/// ステップアップ必須時は即座にサインアウトして破棄する
#[derive(Clone)]
pub struct LoginService {
    agents: Arc<dyn AgentDirectory>,
    identity: Arc<dyn IdentityProvider>,
    otp: OtpService,
    pending: Arc<Mutex<HashMap<String, PendingLogin>>>,
    step_up_required: bool,
    pending_ttl: Duration,
}

impl LoginService {
    pub fn new(
        agents: Arc<dyn AgentDirectory>,
        identity: Arc<dyn IdentityProvider>,
        otp: OtpService,
        step_up_required: bool,
        pending_ttl_secs: i64,
    ) -> Self {
        Self {
            agents,
            identity,
            otp,
            pending: Arc::new(Mutex::new(HashMap::new())),
            step_up_required,
            pending_ttl: Duration::seconds(pending_ttl_secs),
        }
    }

    /// サインインを開始する
    ///
    /// 片方のチャネルへの配信失敗は許容し、全チャネルが失敗した場合のみ
    /// `OtpDispatchFailed` で打ち切る。進行中のサインインがあっても拒否せず、
    /// 新しいコードが古いコードを上書きする
    pub async fn begin(&self, email: &str, password: &str) -> Result<LoginOutcome, AppError> {
        let email = normalize_email(email);

        let agent = self
            .agents
            .find_by_email(&email)
            .await?
            .ok_or(AppError::AccountNotFound)?;

        // パスワード検証。拒否されたらここで終端
        let session = self
            .identity
            .sign_in_with_password(&email, password)
            .await?;

        if !self.step_up_required {
            tracing::info!(email = %email, "サインイン成功（ステップアップなし）");
            return Ok(LoginOutcome::SignedIn(session));
        }

        // ステップアップ必須: 検証用セッションは即座に破棄する
        if let Err(e) = self.identity.sign_out(&session.access_token).await {
            tracing::warn!(error = %e, "検証用セッションのサインアウトに失敗");
        }

        self.remember(&email, password);

        match self.dispatch_codes(&email, &agent, false).await {
            Ok(channels) => Ok(LoginOutcome::OtpSent { channels }),
            Err(e) => {
                // サインインは始まらなかったので資格情報も破棄する
                self.clear_pending(&email);
                Err(e)
            }
        }
    }

    /// OTP 入力画面からの再送要求
    ///
    /// 進行中のサインインがなければ拒否する。再送間隔・回数の制限は
    /// `OtpService` 側のゲートがかける
    pub async fn resend(&self, email: &str) -> Result<Vec<OtpChannel>, AppError> {
        let email = normalize_email(email);

        if self.pending_password(&email).is_none() {
            return Err(AppError::OtpNotFound);
        }

        let agent = self
            .agents
            .find_by_email(&email)
            .await?
            .ok_or(AppError::AccountNotFound)?;

        self.dispatch_codes(&email, &agent, true).await
    }

    /// OTP を検証してサインインを完了する
    ///
    /// まずメールチャネルで照合し、失敗したら電話番号をアカウントから
    /// 引き直して SMS チャネルで再照合する。電話番号が未登録なら
    /// SMS 側の照会はせずに失敗へ短絡する
    pub async fn complete(&self, email: &str, code: &str) -> Result<IdentitySession, AppError> {
        let email = normalize_email(email);

        let password = self
            .pending_password(&email)
            .ok_or(AppError::OtpNotFound)?;

        let verified = match self.otp.verify(&email, OtpChannel::Email, code).await {
            Ok(()) => true,
            Err(e) if is_otp_rejection(&e) => {
                // フォールバック: 電話番号は配信時の値を信用せず、
                // アカウントから取り直す
                let agent = self
                    .agents
                    .find_by_email(&email)
                    .await?
                    .ok_or(AppError::AccountNotFound)?;
                match &agent.phone {
                    Some(phone) => match self.otp.verify(phone, OtpChannel::Phone, code).await {
                        Ok(()) => true,
                        Err(e) if is_otp_rejection(&e) => false,
                        Err(other) => return Err(other),
                    },
                    None => false,
                }
            }
            Err(other) => return Err(other),
        };

        if !verified {
            return Err(AppError::InvalidOtp);
        }

        // OTP 成功: 保持していた資格情報で本セッションを発行する
        let result = self.identity.sign_in_with_password(&email, &password).await;

        // 成功でも失敗でもサインインはここで終端。資格情報を破棄する
        self.clear_pending(&email);

        match &result {
            Ok(session) => tracing::info!(user_id = %session.user.id, "サインイン完了"),
            Err(e) => tracing::error!(error = %e, "OTP成功後のセッション発行に失敗"),
        }
        result
    }

    /// 保持している資格情報を破棄する
    ///
    /// サインインの終端と明示的なログアウトの両方で呼ばれる
    pub fn clear_pending(&self, email: &str) {
        self.pending_map().remove(&normalize_email(email));
    }

    /// メールと SMS へコードを配信し、成功したチャネルを返す
    async fn dispatch_codes(
        &self,
        email: &str,
        agent: &Agent,
        resend: bool,
    ) -> Result<Vec<OtpChannel>, AppError> {
        let mut channels = Vec::new();
        let mut first_failure: Option<AppError> = None;

        match self.dispatch_one(email, OtpChannel::Email, resend).await {
            Ok(()) => channels.push(OtpChannel::Email),
            Err(e) => {
                tracing::warn!(email = %email, error = %e, "メールチャネルへの配信に失敗");
                first_failure = Some(e);
            }
        }

        if let Some(phone) = &agent.phone {
            match self.dispatch_one(phone, OtpChannel::Phone, resend).await {
                Ok(()) => channels.push(OtpChannel::Phone),
                Err(e) => {
                    tracing::warn!(email = %email, error = %e, "SMSチャネルへの配信に失敗");
                    if first_failure.is_none() {
                        first_failure = Some(e);
                    }
                }
            }
        }

        if channels.is_empty() {
            return Err(match first_failure {
                Some(AppError::RateLimited) => AppError::RateLimited,
                _ => AppError::OtpDispatchFailed,
            });
        }

        Ok(channels)
    }

    /// 発行か再送かで `OtpService` の入口を切り替える。ゲートは再送側だけにかかる
    async fn dispatch_one(
        &self,
        recipient: &str,
        channel: OtpChannel,
        resend: bool,
    ) -> Result<(), AppError> {
        if resend {
            self.otp.resend(recipient, channel).await
        } else {
            self.otp.send(recipient, channel).await
        }
    }

    /// 進行中サインインの保持パスワードを取り出す（期限切れは破棄）
    fn pending_password(&self, email: &str) -> Option<String> {
        let mut pending = self.pending_map();
        match pending.get(email) {
            Some(entry) if OffsetDateTime::now_utc() - entry.created_at <= self.pending_ttl => {
                Some(entry.password.clone())
            }
            Some(_) => {
                pending.remove(email);
                None
            }
            None => None,
        }
    }

    fn remember(&self, email: &str, password: &str) {
        self.pending_map().insert(
            email.to_string(),
            PendingLogin {
                password: password.to_string(),
                created_at: OffsetDateTime::now_utc(),
            },
        );
    }

    fn pending_map(&self) -> MutexGuard<'_, HashMap<String, PendingLogin>> {
        // ロック毒化は連鎖パニックさせず、その場で回復する
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[cfg(test)]
    fn has_pending(&self, email: &str) -> bool {
        self.pending_map().contains_key(&normalize_email(email))
    }
}

/// 入力メールアドレスの正規化（前後空白の除去 + 小文字化）
///
/// OTP レコードのキーと保持資格情報のキーがリクエスト間で
/// 一致するよう、入口で必ず通す
fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// OTP の照合失敗として扱うエラーか（ストレージ障害などは除く）
fn is_otp_rejection(error: &AppError) -> bool {
    matches!(
        error,
        AppError::OtpNotFound | AppError::OtpExpired | AppError::OtpMismatch
    )
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use uuid::Uuid;

    use super::*;
    use crate::repositories::OtpStore;
    use crate::services::identity::IdentityUser;
    use crate::services::otp::testing::{FailingSender, MemoryOtpStore, RecordingSender};

    const EMAIL: &str = "agent@example.com";
    const PHONE: &str = "9876543210";
    const PASSWORD: &str = "correct horse";

    struct FakeIdentity {
        valid: Mutex<(String, String)>,
        sign_in_calls: AtomicUsize,
        sign_out_calls: AtomicUsize,
    }

    impl FakeIdentity {
        fn new(email: &str, password: &str) -> Self {
            Self {
                valid: Mutex::new((email.to_string(), password.to_string())),
                sign_in_calls: AtomicUsize::new(0),
                sign_out_calls: AtomicUsize::new(0),
            }
        }

        fn set_valid(&self, email: &str, password: &str) {
            *self.valid.lock().unwrap() = (email.to_string(), password.to_string());
        }

        fn sign_ins(&self) -> usize {
            self.sign_in_calls.load(Ordering::SeqCst)
        }

        fn sign_outs(&self) -> usize {
            self.sign_out_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl IdentityProvider for FakeIdentity {
        async fn sign_in_with_password(
            &self,
            email: &str,
            password: &str,
        ) -> Result<IdentitySession, AppError> {
            self.sign_in_calls.fetch_add(1, Ordering::SeqCst);
            let valid = self.valid.lock().unwrap().clone();
            if valid.0.eq_ignore_ascii_case(email) && valid.1 == password {
                Ok(IdentitySession {
                    access_token: format!("token-{}", self.sign_ins()),
                    expires_in: 3600,
                    user: IdentityUser {
                        id: "9f4cbb6e-2f10-4c0e-8f5a-02f6f8a44b21".to_string(),
                        email: Some(email.to_string()),
                    },
                })
            } else {
                Err(AppError::SignIn("invalid credentials".to_string()))
            }
        }

        async fn sign_out(&self, _access_token: &str) -> Result<(), AppError> {
            self.sign_out_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn get_session(&self, _access_token: &str) -> Result<Option<IdentityUser>, AppError> {
            Ok(None)
        }
    }

    struct MemoryAgents {
        agents: Vec<Agent>,
    }

    #[async_trait::async_trait]
    impl AgentDirectory for MemoryAgents {
        async fn find_by_email(&self, email: &str) -> Result<Option<Agent>, AppError> {
            Ok(self
                .agents
                .iter()
                .find(|a| a.email.eq_ignore_ascii_case(email))
                .cloned())
        }
    }

    fn agent(email: &str, phone: Option<&str>) -> Agent {
        Agent {
            id: Uuid::new_v4(),
            email: email.to_string(),
            phone: phone.map(|p| p.to_string()),
            agency_name: "Skyline Travels".to_string(),
            verified: true,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    struct Harness {
        store: Arc<MemoryOtpStore>,
        email_sender: Arc<RecordingSender>,
        sms_sender: Arc<RecordingSender>,
        identity: Arc<FakeIdentity>,
        service: LoginService,
    }

    fn harness(agents: Vec<Agent>, step_up_required: bool) -> Harness {
        let store = Arc::new(MemoryOtpStore::default());
        let email_sender = Arc::new(RecordingSender::default());
        let sms_sender = Arc::new(RecordingSender::default());
        let otp = OtpService::new(
            store.clone(),
            email_sender.clone(),
            sms_sender.clone(),
            600,
            60,
            3,
        );
        let identity = Arc::new(FakeIdentity::new(EMAIL, PASSWORD));
        let service = LoginService::new(
            Arc::new(MemoryAgents { agents }),
            identity.clone(),
            otp,
            step_up_required,
            600,
        );
        Harness {
            store,
            email_sender,
            sms_sender,
            identity,
            service,
        }
    }

    #[tokio::test]
    async fn test_begin_unknown_account() {
        let h = harness(vec![], true);
        let err = h.service.begin("nobody@example.com", PASSWORD).await.unwrap_err();
        assert!(matches!(err, AppError::AccountNotFound));
        assert_eq!(h.identity.sign_ins(), 0);
    }

    #[tokio::test]
    async fn test_begin_wrong_password() {
        let h = harness(vec![agent(EMAIL, Some(PHONE))], true);
        let err = h.service.begin(EMAIL, "wrong").await.unwrap_err();
        assert!(matches!(err, AppError::SignIn(_)));
        assert!(!h.service.has_pending(EMAIL));
        assert_eq!(h.email_sender.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_begin_sends_to_both_channels() {
        let h = harness(vec![agent(EMAIL, Some(PHONE))], true);
        let outcome = h.service.begin(EMAIL, PASSWORD).await.unwrap();

        match outcome {
            LoginOutcome::OtpSent { channels } => {
                assert_eq!(channels, vec![OtpChannel::Email, OtpChannel::Phone]);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(h.email_sender.last_code_for(EMAIL).is_some());
        assert!(h.sms_sender.last_code_for(PHONE).is_some());
        // 検証用セッションは破棄されている
        assert_eq!(h.identity.sign_outs(), 1);
        assert!(h.service.has_pending(EMAIL));
    }

    #[tokio::test]
    async fn test_begin_without_phone_sends_email_only() {
        let h = harness(vec![agent(EMAIL, None)], true);
        let outcome = h.service.begin(EMAIL, PASSWORD).await.unwrap();

        match outcome {
            LoginOutcome::OtpSent { channels } => {
                assert_eq!(channels, vec![OtpChannel::Email]);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(h.sms_sender.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_begin_again_supersedes_previous_codes() {
        let h = harness(vec![agent(EMAIL, None)], true);
        h.service.begin(EMAIL, PASSWORD).await.unwrap();
        let first = h.email_sender.last_code_for(EMAIL).unwrap();

        // 別タブなどからの二度目の開始は間を空けなくても通り、コードを上書きする
        h.service.begin(EMAIL, PASSWORD).await.unwrap();
        let second = h.email_sender.last_code_for(EMAIL).unwrap();
        assert_eq!(h.email_sender.sent_count(), 2);

        if first != second {
            let err = h.service.complete(EMAIL, &first).await.unwrap_err();
            assert!(matches!(err, AppError::InvalidOtp));
        }
        assert!(h.service.complete(EMAIL, &second).await.is_ok());
    }

    #[tokio::test]
    async fn test_begin_all_channels_failing_is_terminal() {
        let store = Arc::new(MemoryOtpStore::default());
        let otp = OtpService::new(
            store.clone(),
            Arc::new(FailingSender),
            Arc::new(FailingSender),
            600,
            60,
            3,
        );
        let identity = Arc::new(FakeIdentity::new(EMAIL, PASSWORD));
        let service = LoginService::new(
            Arc::new(MemoryAgents {
                agents: vec![agent(EMAIL, Some(PHONE))],
            }),
            identity,
            otp,
            true,
            600,
        );

        let err = service.begin(EMAIL, PASSWORD).await.unwrap_err();
        assert!(matches!(err, AppError::OtpDispatchFailed));
        assert!(!service.has_pending(EMAIL));
    }

    #[tokio::test]
    async fn test_direct_sign_in_when_step_up_disabled() {
        let h = harness(vec![agent(EMAIL, Some(PHONE))], false);
        let outcome = h.service.begin(EMAIL, PASSWORD).await.unwrap();

        assert!(matches!(outcome, LoginOutcome::SignedIn(_)));
        // セッションはそのまま使うので破棄しない
        assert_eq!(h.identity.sign_outs(), 0);
        assert_eq!(h.email_sender.sent_count(), 0);
        assert!(!h.service.has_pending(EMAIL));
    }

    #[tokio::test]
    async fn test_complete_with_email_code() {
        let h = harness(vec![agent(EMAIL, Some(PHONE))], true);
        h.service.begin(EMAIL, PASSWORD).await.unwrap();

        let code = h.email_sender.last_code_for(EMAIL).unwrap();
        let session = h.service.complete(EMAIL, &code).await.unwrap();

        assert!(!session.access_token.is_empty());
        // 検証プローブ + 本セッション発行
        assert_eq!(h.identity.sign_ins(), 2);
        // 終端に達したので資格情報は破棄される
        assert!(!h.service.has_pending(EMAIL));
    }

    #[tokio::test]
    async fn test_complete_case_insensitive_email() {
        let h = harness(vec![agent(EMAIL, None)], true);
        h.service.begin("Agent@Example.COM ", PASSWORD).await.unwrap();

        let code = h.email_sender.last_code_for(EMAIL).unwrap();
        assert!(h.service.complete("AGENT@example.com", &code).await.is_ok());
    }

    #[tokio::test]
    async fn test_complete_falls_back_to_phone_channel() {
        let h = harness(vec![agent(EMAIL, Some(PHONE))], true);
        h.service.begin(EMAIL, PASSWORD).await.unwrap();

        // メール側のレコードを消し、SMS のコードだけが生きている状態を作る
        h.store.delete(EMAIL, OtpChannel::Email).await.unwrap();

        let sms_code = h.sms_sender.last_code_for(PHONE).unwrap();
        assert!(h.service.complete(EMAIL, &sms_code).await.is_ok());
        assert!(!h.service.has_pending(EMAIL));
    }

    #[tokio::test]
    async fn test_complete_without_phone_short_circuits() {
        let h = harness(vec![agent(EMAIL, None)], true);
        h.service.begin(EMAIL, PASSWORD).await.unwrap();

        // 生成コードは 100000 以上なので "000000" は決して一致しない
        let err = h.service.complete(EMAIL, "000000").await.unwrap_err();
        assert!(matches!(err, AppError::InvalidOtp));

        // 電話番号未登録なら SMS 側のストア照会は発生しない
        assert_eq!(h.store.find_calls(OtpChannel::Phone), 0);
        // 終端ではないので再挑戦できる
        assert!(h.service.has_pending(EMAIL));
    }

    #[tokio::test]
    async fn test_complete_without_begin() {
        let h = harness(vec![agent(EMAIL, Some(PHONE))], true);
        let err = h.service.complete(EMAIL, "123456").await.unwrap_err();

        assert!(matches!(err, AppError::OtpNotFound));
        // 資格情報がなければコード照合までたどり着かない
        assert_eq!(h.store.find_calls(OtpChannel::Email), 0);
    }

    #[tokio::test]
    async fn test_complete_clears_credentials_even_if_session_issue_fails() {
        let h = harness(vec![agent(EMAIL, Some(PHONE))], true);
        h.service.begin(EMAIL, PASSWORD).await.unwrap();

        // フロー中にパスワードが変更されたケース
        h.identity.set_valid(EMAIL, "rotated");

        let code = h.email_sender.last_code_for(EMAIL).unwrap();
        let err = h.service.complete(EMAIL, &code).await.unwrap_err();
        assert!(matches!(err, AppError::SignIn(_)));
        assert!(!h.service.has_pending(EMAIL));
    }

    #[tokio::test]
    async fn test_resend_requires_pending_login() {
        let h = harness(vec![agent(EMAIL, Some(PHONE))], true);
        let err = h.service.resend(EMAIL).await.unwrap_err();
        assert!(matches!(err, AppError::OtpNotFound));
    }

    #[tokio::test]
    async fn test_resend_respects_cooldown() {
        let h = harness(vec![agent(EMAIL, Some(PHONE))], true);
        h.service.begin(EMAIL, PASSWORD).await.unwrap();

        // 直後の再送は両チャネルともクールダウンに阻まれる
        let err = h.service.resend(EMAIL).await.unwrap_err();
        assert!(matches!(err, AppError::RateLimited));

        h.store.rewind(EMAIL, OtpChannel::Email, Duration::seconds(61));
        h.store.rewind(PHONE, OtpChannel::Phone, Duration::seconds(61));
        let channels = h.service.resend(EMAIL).await.unwrap();
        assert_eq!(channels, vec![OtpChannel::Email, OtpChannel::Phone]);
        assert!(h.service.has_pending(EMAIL));
    }

    #[tokio::test]
    async fn test_clear_pending_on_logout() {
        let h = harness(vec![agent(EMAIL, Some(PHONE))], true);
        h.service.begin(EMAIL, PASSWORD).await.unwrap();
        assert!(h.service.has_pending(EMAIL));

        h.service.clear_pending(EMAIL);
        assert!(!h.service.has_pending(EMAIL));
    }
}

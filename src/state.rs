use std::sync::Arc;

use sqlx::PgPool;

use crate::config::Config;
use crate::idle::SessionRegistry;
use crate::repositories::{AgentRepository, OtpCodeRepository};
use crate::services::identity::IdentityProvider;
use crate::services::{EmailClient, LoginService, OtpService, SmsClient};

/// アプリケーション共有状態
///
/// axum の State として全ハンドラーで共有される。
/// Clone は必須（axum が内部で clone するため）。
#[derive(Clone)]
pub struct AppState {
    /// PostgreSQL コネクションプール
    pub db_pool: PgPool,
    /// アプリケーション設定（Arc で共有）
    pub config: Arc<Config>,
    /// エージェントリポジトリ
    pub agent_repo: AgentRepository,
    /// OTP レコードリポジトリ
    pub otp_repo: OtpCodeRepository,
    /// OTP 発行・検証サービス
    pub otp_service: OtpService,
    /// サインインオーケストレーター
    pub login_service: LoginService,
    /// 外部 ID プロバイダークライアント
    pub identity: Arc<dyn IdentityProvider>,
    /// アイドル監視セッション表
    pub sessions: SessionRegistry,
}

impl AppState {
    /// 新しい AppState を作成
    pub fn new(db_pool: PgPool, identity: Arc<dyn IdentityProvider>, config: Config) -> Self {
        let config = Arc::new(config);
        let agent_repo = AgentRepository::new(db_pool.clone());
        let otp_repo = OtpCodeRepository::new(db_pool.clone());

        if config.email_gateway_url.is_none() {
            tracing::info!("メールゲートウェイ未設定（開発モード: ログ出力のみ）");
        }
        if config.sms_gateway_url.is_none() {
            tracing::info!("SMSゲートウェイ未設定（開発モード: ログ出力のみ）");
        }

        let email_client = EmailClient::new(config.clone());
        let sms_client = SmsClient::new(config.clone());

        let otp_service = OtpService::new(
            Arc::new(otp_repo.clone()),
            Arc::new(email_client),
            Arc::new(sms_client),
            config.otp_ttl_secs,
            config.otp_resend_cooldown_secs,
            config.otp_resend_max,
        );

        // 保持資格情報の寿命は OTP と揃える
        let login_service = LoginService::new(
            Arc::new(agent_repo.clone()),
            identity.clone(),
            otp_service.clone(),
            config.step_up_required,
            config.otp_ttl_secs,
        );

        Self {
            db_pool,
            config,
            agent_repo,
            otp_repo,
            otp_service,
            login_service,
            identity,
            sessions: SessionRegistry::new(),
        }
    }
}

use secrecy::SecretBox;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub database_url: SecretBox<String>,

    // ID プロバイダー設定
    /// ID プロバイダーの Auth API ベース URL
    pub identity_url: String,
    /// Auth API の公開 API キー（apikey ヘッダーで送信）
    pub identity_api_key: SecretBox<String>,

    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,

    // OTP 設定
    #[serde(default = "default_otp_ttl_secs")]
    pub otp_ttl_secs: i64,
    #[serde(default = "default_otp_resend_cooldown_secs")]
    pub otp_resend_cooldown_secs: i64,
    #[serde(default = "default_otp_resend_max")]
    pub otp_resend_max: i32,
    /// メールテンプレートに差し込む会社名
    #[serde(default = "default_company_name")]
    pub company_name: String,

    // SMS ゲートウェイ設定（オプション - 未設定時はログ出力のみ）
    #[serde(default)]
    pub sms_gateway_url: Option<String>,
    pub sms_api_key: Option<SecretBox<String>>,
    #[serde(default)]
    pub sms_template_id: Option<String>,

    // メールゲートウェイ設定（オプション - 未設定時はログ出力のみ）
    #[serde(default)]
    pub email_gateway_url: Option<String>,
    pub email_api_key: Option<SecretBox<String>>,
    #[serde(default)]
    pub email_template_id: Option<String>,

    // サインイン設定
    /// パスワード検証後に OTP ステップアップを必須にするか
    #[serde(default = "default_step_up_required")]
    pub step_up_required: bool,

    // アイドルセッション監視設定
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_idle_warning_secs")]
    pub idle_warning_secs: u64,

    // CORS 設定（未設定時は全オリジン許可の開発モード）
    #[serde(default)]
    pub cors_allowed_origin: Option<String>,
}

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_OTP_TTL_SECS: i64 = 600;
const DEFAULT_OTP_RESEND_COOLDOWN_SECS: i64 = 60;
const DEFAULT_OTP_RESEND_MAX: i32 = 3;
const DEFAULT_COMPANY_NAME: &str = "TripGate";
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;
const DEFAULT_IDLE_WARNING_SECS: u64 = 30;

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_otp_ttl_secs() -> i64 {
    DEFAULT_OTP_TTL_SECS
}

fn default_otp_resend_cooldown_secs() -> i64 {
    DEFAULT_OTP_RESEND_COOLDOWN_SECS
}

fn default_otp_resend_max() -> i32 {
    DEFAULT_OTP_RESEND_MAX
}

fn default_company_name() -> String {
    DEFAULT_COMPANY_NAME.to_string()
}

fn default_step_up_required() -> bool {
    true
}

fn default_idle_timeout_secs() -> u64 {
    DEFAULT_IDLE_TIMEOUT_SECS
}

fn default_idle_warning_secs() -> u64 {
    DEFAULT_IDLE_WARNING_SECS
}

impl Config {
    pub fn load() -> Result<Self, envy::Error> {
        envy::from_env()
    }
}

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    routing::{get, post},
};
use http::{HeaderValue, Method, header};
use secrecy::ExposeSecret;
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use tripgate::{
    config::Config, handlers, repositories::OtpCodeRepository, services::identity::IdentityClient,
    state::AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ログ初期化（JSON形式、環境変数でレベル制御）
    init_tracing();

    tracing::info!("tripgate 起動中...");

    // 設定読み込み
    let config = Config::load().map_err(|e| {
        tracing::error!(error = ?e, "設定の読み込みに失敗");
        anyhow::anyhow!("Failed to load config: {}", e)
    })?;

    tracing::info!(host = %config.host, port = %config.port, "設定読み込み完了");

    // サーバーアドレスを先に構築（config が move される前に）
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|e| {
            tracing::error!(error = ?e, "アドレスのパースに失敗");
            anyhow::anyhow!("Failed to parse address: {}", e)
        })?;

    // データベース接続プール作成
    let db_pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(config.database_url.expose_secret())
        .await
        .map_err(|e| {
            tracing::error!(error = ?e, "データベース接続に失敗");
            anyhow::anyhow!("Failed to connect to database: {}", e)
        })?;

    tracing::info!("データベース接続完了");

    // マイグレーション適用
    sqlx::migrate!("./migrations")
        .run(&db_pool)
        .await
        .map_err(|e| {
            tracing::error!(error = ?e, "マイグレーションの適用に失敗");
            anyhow::anyhow!("Failed to run migrations: {}", e)
        })?;

    tracing::info!("マイグレーション適用完了");

    // ID プロバイダークライアント初期化
    let identity = IdentityClient::new(
        config.identity_url.clone(),
        config.identity_api_key.expose_secret().clone(),
    );

    tracing::info!(identity_url = %config.identity_url, "IDプロバイダークライアント初期化完了");

    // CORS レイヤー（config が move される前に構築）
    let cors = build_cors_layer(config.cors_allowed_origin.as_deref())?;

    // AppState 構築
    let state = AppState::new(db_pool, Arc::new(identity), config);

    // 期限切れ OTP レコードの定期掃除
    spawn_expiry_sweeper(state.otp_repo.clone());

    // Router 構築
    let app = create_router(state).layer(cors);

    // サーバー起動
    let listener = TcpListener::bind(&addr).await.map_err(|e| {
        tracing::error!(error = ?e, addr = %addr, "ポートのバインドに失敗");
        anyhow::anyhow!("Failed to bind to {}: {}", addr, e)
    })?;

    tracing::info!(addr = %addr, "サーバー起動");

    // Graceful shutdown 対応
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| {
            tracing::error!(error = ?e, "サーバーエラー");
            anyhow::anyhow!("Server error: {}", e)
        })?;

    tracing::info!("サーバー終了");

    Ok(())
}

/// tracing の初期化（JSON形式）
fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,tripgate=debug"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

/// Router の構築
fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(handlers::health_check))
        // サインインフロー
        .route("/api/login", post(handlers::login))
        .route("/api/login/otp", post(handlers::verify_otp))
        .route("/api/login/resend", post(handlers::resend_otp))
        .route("/api/logout", post(handlers::logout))
        // OTP 関数契約（メール / SMS）
        .route("/fn/email-otp", post(handlers::email_otp))
        .route("/fn/sms-otp", post(handlers::sms_otp))
        // アイドルセッション監視
        .route("/api/session/activity", post(handlers::activity))
        .route("/api/session/stay", post(handlers::stay_logged_in))
        .route("/api/session/logout", post(handlers::logout_now))
        .route("/api/session/status", get(handlers::status))
        .route("/api/session/me", get(handlers::me))
        .with_state(state)
}

/// CORS レイヤーの構築
///
/// オリジン未設定時は全オリジン許可の開発モードで動く
fn build_cors_layer(allowed_origin: Option<&str>) -> anyhow::Result<CorsLayer> {
    let layer = match allowed_origin {
        Some(origin) => {
            let origin = origin
                .parse::<HeaderValue>()
                .map_err(|e| anyhow::anyhow!("invalid CORS_ALLOWED_ORIGIN {}: {}", origin, e))?;
            CorsLayer::new()
                .allow_origin(origin)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        }
        None => {
            tracing::info!("CORS_ALLOWED_ORIGIN 未設定（開発モード: 全オリジン許可）");
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    };

    Ok(layer)
}

/// 期限切れ OTP レコードの定期掃除タスク
///
/// 期限切れコードは verify 時にも都度削除されるため、
/// ここでは取り残されたレコードを回収するだけ
fn spawn_expiry_sweeper(otp_repo: OtpCodeRepository) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            match otp_repo.delete_expired().await {
                Ok(0) => {}
                Ok(deleted) => tracing::info!(deleted, "期限切れ認証コードを削除"),
                Err(e) => tracing::warn!(error = ?e, "期限切れ認証コードの削除に失敗"),
            }
        }
    });
}

/// Graceful shutdown シグナル待機
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = ?e, "Ctrl+C ハンドラーのインストールに失敗");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = ?e, "SIGTERM ハンドラーのインストールに失敗");
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Ctrl+C received, starting graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("SIGTERM received, starting graceful shutdown");
        }
    }
}

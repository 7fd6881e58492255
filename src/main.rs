use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gafaelfawr::config::Config;
use gafaelfawr::db::kv::{KeyValueStore, RedisStore};
use gafaelfawr::db::tokens::{PgDatabase, TokenDatabase};
use gafaelfawr::providers::github::GitHubProvider;
use gafaelfawr::providers::oidc::OidcProvider;
use gafaelfawr::providers::AuthProvider;
use gafaelfawr::AppState;

#[tokio::main]
async fn main() {
    // Load .env first so it can supply GAFAELFAWR_CONFIG.
    let _ = dotenvy::dotenv();

    let config = match Config::load(&Config::settings_path()) {
        Ok(config) => Arc::new(config),
        Err(error) => {
            eprintln!("configuration error: {error}");
            std::process::exit(1);
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.loglevel.clone()));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let pool = gafaelfawr::db::pool::connect(&config.database_url);
    let db: Arc<dyn TokenDatabase> = Arc::new(PgDatabase::new(pool));

    let kv: Arc<dyn KeyValueStore> = match RedisStore::connect(&config.redis_url).await {
        Ok(store) => Arc::new(store),
        Err(error) => {
            tracing::error!(%error, "cannot connect to redis");
            std::process::exit(1);
        }
    };

    let http = reqwest::Client::new();
    let provider: Arc<dyn AuthProvider> = if let Some(github) = config.github.clone() {
        Arc::new(GitHubProvider::new(github, http))
    } else if let Some(oidc) = config.oidc.clone() {
        Arc::new(OidcProvider::new(oidc, http))
    } else {
        // Config::load guarantees one provider is configured.
        unreachable!("no authentication provider configured")
    };

    let state = match AppState::new(config.clone(), db, kv, provider) {
        Ok(state) => state,
        Err(error) => {
            tracing::error!(%error, "cannot initialize signing keys");
            std::process::exit(1);
        }
    };

    // Merge configured bootstrap admins into the database.
    if let Err(error) = state
        .admin_service()
        .ensure_initial_admins(&config.initial_admins)
        .await
    {
        tracing::error!(%error, "cannot initialize admin list");
        std::process::exit(1);
    }

    // Periodic expiry sweep.
    let sweep_state = state.clone();
    let sweep_minutes = config.expiry_sweep_minutes.max(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(sweep_minutes * 60));
        interval.tick().await;
        loop {
            interval.tick().await;
            if let Err(error) = sweep_state.token_service().expire_tokens().await {
                tracing::error!(%error, "expiry sweep failed");
            }
        }
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app: Router = gafaelfawr::routes::router()
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "gafaelfawr listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install signal handler");
    tracing::info!("shutting down");
}

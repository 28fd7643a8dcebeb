mod config;

use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, Query, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    middleware,
    response::IntoResponse,
    routing::{delete, get, post},
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use rentchat_api::auth::{AppState, AppStateInner, decode_token};
use rentchat_api::middleware::{bearer_token, require_auth};
use rentchat_api::{chatrooms, notifications, rentals};
use rentchat_db::{Database, MediaStore};
use rentchat_ephemeral::{EphemeralStore, MemoryStore, RedisStore};
use rentchat_gateway::flush::FlushCoordinator;
use rentchat_gateway::{Gateway, chat, notification};
use rentchat_types::api::Claims;
use rentchat_types::models::RoomId;

use crate::config::Config;

fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rentchat=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env()?;

    // Store calls run on the blocking pool; its size bounds concurrent store work.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .max_blocking_threads(config.store_workers)
        .build()?;
    runtime.block_on(serve(config))
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let db = Arc::new(Database::open(&config.db_path)?);
    let media = MediaStore::new(&config.media_dir)?;
    let store: Arc<dyn EphemeralStore> = match config.redis_url.clone() {
        Some(url) => {
            let store = tokio::task::spawn_blocking(move || RedisStore::connect(&url)).await??;
            Arc::new(store)
        }
        None => {
            warn!("RENTCHAT_REDIS_URL not set; using the in-process store (single instance only)");
            Arc::new(MemoryStore::new())
        }
    };

    let gateway = Gateway::new(db, store, media, config.gateway.clone());
    gateway.start_relay().await?;
    let app_state: AppState = Arc::new(AppStateInner {
        gateway: gateway.clone(),
        jwt_secret: config.jwt_secret.clone(),
    });

    if let Some(period) = config.flush_interval {
        tokio::spawn(run_sweeper(gateway.flusher().clone(), period));
    }

    // Routes
    let protected_routes = Router::new()
        .route("/chatrooms", get(chatrooms::list_chatrooms).post(chatrooms::create_chatroom))
        .route("/chatrooms/{room_id}", delete(chatrooms::leave_chatroom))
        .route("/chatrooms/{room_id}/messages", get(chatrooms::get_history))
        .route("/notifications/global", post(notifications::create_global))
        .route("/rentals", post(rentals::create_rental))
        .route("/rentals/{rental_id}/status", post(rentals::update_rental_status))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_auth))
        .with_state(app_state.clone());

    let ws_routes = Router::new()
        .route("/ws/chat/{room_id}", get(chat_upgrade))
        .route("/ws/notification", get(notification_upgrade))
        .with_state(app_state);

    let app = Router::new()
        .merge(protected_routes)
        .merge(ws_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = config.addr()?;
    info!("rentchat listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Nothing may stay buffered in a store that dies with the process.
    match gateway.flusher().sweep().await {
        Ok(flushed) => info!("Shutdown drain flushed {} messages", flushed),
        Err(e) => error!("Shutdown drain failed: {}", e),
    }
    Ok(())
}

async fn run_sweeper(flusher: FlushCoordinator, period: std::time::Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match flusher.sweep().await {
            Ok(0) => {}
            Ok(flushed) => info!("Sweeper flushed {} buffered messages", flushed),
            Err(e) => error!("Sweeper failed: {}", e),
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Resolve the caller before upgrading: bearer header first, then `?token=`.
fn authenticate(state: &AppState, headers: &HeaderMap, query: &TokenQuery) -> Result<Claims, StatusCode> {
    let token = bearer_token(headers)
        .or(query.token.as_deref())
        .ok_or(StatusCode::UNAUTHORIZED)?;
    decode_token(&state.jwt_secret, token).ok_or_else(|| {
        warn!("Rejected WebSocket handshake with invalid token");
        StatusCode::UNAUTHORIZED
    })
}

async fn chat_upgrade(
    State(state): State<AppState>,
    Path(room_id): Path<RoomId>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, StatusCode> {
    let claims = authenticate(&state, &headers, &query)?;
    let gateway: Gateway = state.gateway.clone();
    Ok(ws.on_upgrade(move |socket| chat::serve_chat(socket, gateway, room_id, claims.account())))
}

async fn notification_upgrade(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, StatusCode> {
    let claims = authenticate(&state, &headers, &query)?;
    let gateway: Gateway = state.gateway.clone();
    Ok(ws.on_upgrade(move |socket| {
        notification::serve_notifications(socket, gateway, claims.account())
    }))
}

//! HTTP surface over the chat core: room list and history, leaving rooms,
//! broadcast notifications and the rental lifecycle.

pub mod auth;
pub mod chatrooms;
pub mod middleware;
pub mod notifications;
pub mod rentals;

use std::fmt::Display;

use axum::http::StatusCode;
use tracing::error;

/// Run blocking DB work off the async runtime.
pub(crate) async fn blocking<F, T>(f: F) -> Result<T, StatusCode>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map_err(internal)
}

pub(crate) fn internal(e: impl Display) -> StatusCode {
    error!("Request failed: {}", e);
    StatusCode::INTERNAL_SERVER_ERROR
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use rentchat_db::{Database, MediaStore};
    use rentchat_ephemeral::MemoryStore;
    use rentchat_gateway::Gateway;
    use rentchat_gateway::config::GatewayConfig;
    use rentchat_types::api::Claims;
    use rentchat_types::models::{Account, Chatroom};
    use tempfile::TempDir;

    use crate::auth::{AppState, AppStateInner};

    pub struct TestApp {
        pub state: AppState,
        pub borrower: Account,
        pub lender: Account,
        pub room: Chatroom,
        pub product_id: i64,
        _media: TempDir,
    }

    impl TestApp {
        pub fn new() -> Self {
            let db = Arc::new(Database::open_in_memory().unwrap());
            let media_dir = tempfile::tempdir().unwrap();
            let media = MediaStore::new(media_dir.path()).unwrap();
            let borrower = db.create_account("bora").unwrap();
            let lender = db.create_account("lee").unwrap();
            let product_id = db.create_product("kayak", lender.id, None).unwrap();
            let room = db
                .create_chatroom(borrower.id, lender.id, Some(product_id))
                .unwrap();
            let gateway = Gateway::new(
                db,
                Arc::new(MemoryStore::new()),
                media,
                GatewayConfig::default(),
            );
            Self {
                state: Arc::new(AppStateInner {
                    gateway,
                    jwt_secret: "test-secret".into(),
                }),
                borrower,
                lender,
                room,
                product_id,
                _media: media_dir,
            }
        }

        pub fn claims(&self, account: &Account) -> Claims {
            Claims {
                sub: account.id,
                nickname: account.nickname.clone(),
                exp: usize::MAX,
            }
        }
    }
}

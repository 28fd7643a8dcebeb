use axum::{Extension, Json, extract::State, http::StatusCode};
use tracing::info;

use rentchat_types::api::{Claims, CreateGlobalNotificationRequest};
use rentchat_types::models::GlobalNotification;

use crate::auth::AppState;
use crate::internal;

/// Create a broadcast notification and fan it out to every listener.
pub async fn create_global(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateGlobalNotificationRequest>,
) -> Result<(StatusCode, Json<GlobalNotification>), StatusCode> {
    let text = req.text.trim().to_string();
    if text.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let sent = state
        .gateway
        .notifications()
        .broadcast_global(text, req.image)
        .await
        .map_err(internal)?;
    info!(
        "{} broadcast notification {}",
        claims.nickname, sent.notification.id
    );
    Ok((StatusCode::CREATED, Json(sent.notification)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestApp;

    #[tokio::test]
    async fn broadcast_creates_confirms_for_everyone() {
        let app = TestApp::new();
        let (status, Json(notification)) = create_global(
            State(app.state.clone()),
            Extension(app.claims(&app.lender)),
            Json(CreateGlobalNotificationRequest {
                text: "  site maintenance  ".into(),
                image: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(notification.text, "site maintenance");
        assert_eq!(
            app.state
                .gateway
                .db()
                .count_unacknowledged_confirms(notification.id)
                .unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn blank_text_is_rejected() {
        let app = TestApp::new();
        let err = create_global(
            State(app.state.clone()),
            Extension(app.claims(&app.lender)),
            Json(CreateGlobalNotificationRequest {
                text: "   ".into(),
                image: None,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err, StatusCode::BAD_REQUEST);
    }
}

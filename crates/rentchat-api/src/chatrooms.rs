use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
};
use tracing::{info, warn};

use rentchat_db::LeaveOutcome;
use rentchat_types::api::{ChatroomHistory, ChatroomSummary, Claims, CreateChatroomRequest};
use rentchat_types::models::{Chatroom, RoomId};

use crate::auth::AppState;
use crate::{blocking, internal};

/// Open a room about a product with its owner. The caller is the borrower.
pub async fn create_chatroom(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateChatroomRequest>,
) -> Result<(StatusCode, Json<Chatroom>), StatusCode> {
    let db = state.gateway.db().clone();
    let borrower_id = claims.sub;
    let room = blocking(move || {
        let Some(lender_id) = db.product_lender(req.product_id)? else {
            return Ok(Err(StatusCode::NOT_FOUND));
        };
        if lender_id == borrower_id {
            return Ok(Err(StatusCode::BAD_REQUEST));
        }
        if let Some(existing) = db.find_chatroom(req.product_id, borrower_id, lender_id)? {
            let open = db
                .get_chatroom(existing)?
                .is_some_and(|room| room.borrower_present && room.lender_present);
            if open {
                return Ok(Err(StatusCode::BAD_REQUEST));
            }
        }
        Ok(Ok(db.create_chatroom(borrower_id, lender_id, Some(req.product_id))?))
    })
    .await??;

    info!("{} opened room {}", claims.nickname, room.id);
    Ok((StatusCode::CREATED, Json(room)))
}

/// Rooms the caller is still in, with last message and unread count.
pub async fn list_chatrooms(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Vec<ChatroomSummary>>, StatusCode> {
    let account = claims.account();
    let db = state.gateway.db().clone();
    let rooms = blocking(move || db.member_chatrooms(claims.sub)).await?;

    let mut summaries = Vec::with_capacity(rooms.len());
    for room in rooms {
        let Some(opponent_id) = room.opponent_of(account.id) else {
            continue;
        };
        let last_message = state
            .gateway
            .history()
            .latest(room.id)
            .await
            .map_err(internal)?;
        let unread_count = state
            .gateway
            .read_state()
            .unread_count(room.id, &account)
            .await
            .map_err(internal)?;
        summaries.push(ChatroomSummary {
            id: room.id,
            opponent_id,
            product_id: room.product_id,
            last_message,
            unread_count,
        });
    }

    Ok(Json(summaries))
}

/// Enter a room: mark it read for the caller and return the latest page.
pub async fn get_history(
    State(state): State<AppState>,
    Path(room_id): Path<RoomId>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<ChatroomHistory>, StatusCode> {
    let account = claims.account();
    let db = state.gateway.db().clone();
    let room = blocking(move || db.get_chatroom(room_id))
        .await?
        .ok_or(StatusCode::NOT_FOUND)?;
    if !room.is_member(account.id) {
        return Err(StatusCode::BAD_REQUEST);
    }

    // Read state is best effort; the history is still served.
    if let Err(e) = state.gateway.read_state().mark_read(room_id, &account).await {
        warn!("Read reconciliation for room {} failed: {}", room_id, e);
    }

    let messages = state
        .gateway
        .history()
        .recent(room_id)
        .await
        .map_err(internal)?;
    Ok(Json(ChatroomHistory {
        chatroom_id: room_id,
        messages,
    }))
}

pub async fn leave_chatroom(
    State(state): State<AppState>,
    Path(room_id): Path<RoomId>,
    Extension(claims): Extension<Claims>,
) -> Result<StatusCode, StatusCode> {
    let db = state.gateway.db().clone();
    let user_id = claims.sub;
    match blocking(move || db.leave_chatroom(room_id, user_id)).await? {
        LeaveOutcome::NotFound => Err(StatusCode::NOT_FOUND),
        LeaveOutcome::NotMember => Err(StatusCode::BAD_REQUEST),
        LeaveOutcome::Left | LeaveOutcome::Deleted => {
            info!("{} left room {}", claims.nickname, room_id);
            Ok(StatusCode::NO_CONTENT)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestApp;

    async fn buffer(app: &TestApp, text: &str) {
        app.state
            .gateway
            .buffer()
            .append(app.room.id, &app.lender, text.to_string(), None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn list_shows_last_message_and_unread_count() {
        let app = TestApp::new();
        buffer(&app, "first").await;
        buffer(&app, "second").await;

        let Json(rooms) = list_chatrooms(State(app.state.clone()), Extension(app.claims(&app.borrower)))
            .await
            .unwrap();
        assert_eq!(rooms.len(), 1);
        assert_eq!(rooms[0].opponent_id, app.lender.id);
        assert_eq!(rooms[0].unread_count, 2);
        assert_eq!(rooms[0].last_message.as_ref().unwrap().text, "second");

        let Json(rooms) = list_chatrooms(State(app.state.clone()), Extension(app.claims(&app.lender)))
            .await
            .unwrap();
        assert_eq!(rooms[0].unread_count, 0);
    }

    #[tokio::test]
    async fn history_marks_room_read() {
        let app = TestApp::new();
        buffer(&app, "hello").await;

        let Json(history) = get_history(
            State(app.state.clone()),
            Path(app.room.id),
            Extension(app.claims(&app.borrower)),
        )
        .await
        .unwrap();
        assert_eq!(history.messages.len(), 1);
        assert!(!history.messages[0].unread);

        let unread = app
            .state
            .gateway
            .read_state()
            .unread_count(app.room.id, &app.borrower)
            .await
            .unwrap();
        assert_eq!(unread, 0);
    }

    #[tokio::test]
    async fn history_requires_membership() {
        let app = TestApp::new();
        let missing = get_history(
            State(app.state.clone()),
            Path(app.room.id + 50),
            Extension(app.claims(&app.borrower)),
        )
        .await
        .unwrap_err();
        assert_eq!(missing, StatusCode::NOT_FOUND);

        let outsider = app.state.gateway.db().create_account("eve").unwrap();
        let denied = get_history(
            State(app.state.clone()),
            Path(app.room.id),
            Extension(app.claims(&outsider)),
        )
        .await
        .unwrap_err();
        assert_eq!(denied, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn leaving_then_reopening() {
        let app = TestApp::new();
        let duplicate = create_chatroom(
            State(app.state.clone()),
            Extension(app.claims(&app.borrower)),
            Json(CreateChatroomRequest {
                product_id: app.product_id,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(duplicate, StatusCode::BAD_REQUEST);

        let status = leave_chatroom(
            State(app.state.clone()),
            Path(app.room.id),
            Extension(app.claims(&app.borrower)),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, Json(room)) = create_chatroom(
            State(app.state.clone()),
            Extension(app.claims(&app.borrower)),
            Json(CreateChatroomRequest {
                product_id: app.product_id,
            }),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_ne!(room.id, app.room.id);
        assert_eq!(room.lender_id, app.lender.id);

        let own = create_chatroom(
            State(app.state.clone()),
            Extension(app.claims(&app.lender)),
            Json(CreateChatroomRequest {
                product_id: app.product_id,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(own, StatusCode::BAD_REQUEST);
    }
}

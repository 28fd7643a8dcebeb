use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
};
use tracing::{error, info};

use rentchat_gateway::notifications::RentalError;
use rentchat_types::api::{Claims, CreateRentalRequest, RentalResponse, UpdateRentalStatusRequest};

use crate::auth::AppState;
use crate::blocking;

fn rental_status_code(e: RentalError) -> StatusCode {
    match e {
        RentalError::NotFound(_) => StatusCode::NOT_FOUND,
        RentalError::InvalidTransition { .. } => StatusCode::CONFLICT,
        RentalError::Store(e) => {
            error!("Rental update failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Request to rent a product. The caller is the borrower; the lender is
/// notified.
pub async fn create_rental(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateRentalRequest>,
) -> Result<(StatusCode, Json<RentalResponse>), StatusCode> {
    if req.return_date <= req.rental_date {
        return Err(StatusCode::BAD_REQUEST);
    }
    let db = state.gateway.db().clone();
    let product_id = req.product_id;
    let lender_id = blocking(move || db.product_lender(product_id))
        .await?
        .ok_or(StatusCode::NOT_FOUND)?;
    if lender_id == claims.sub {
        return Err(StatusCode::BAD_REQUEST);
    }

    let update = state
        .gateway
        .notifications()
        .request_rental(req.product_id, claims.sub, req.rental_date, req.return_date)
        .await
        .map_err(rental_status_code)?;
    info!("{} requested rental {}", claims.nickname, update.rental.id);
    Ok((StatusCode::CREATED, Json(RentalResponse::from(&update.rental))))
}

/// Move a rental forward. Only its borrower or lender may do so.
pub async fn update_rental_status(
    State(state): State<AppState>,
    Path(rental_id): Path<i64>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<UpdateRentalStatusRequest>,
) -> Result<Json<RentalResponse>, StatusCode> {
    let db = state.gateway.db().clone();
    let rental = blocking(move || db.get_rental(rental_id))
        .await?
        .ok_or(StatusCode::NOT_FOUND)?;
    if claims.sub != rental.borrower_id && claims.sub != rental.lender_id {
        return Err(StatusCode::FORBIDDEN);
    }

    let update = state
        .gateway
        .notifications()
        .transition_rental(rental_id, req.status)
        .await
        .map_err(rental_status_code)?;
    info!(
        "{} moved rental {} to {}",
        claims.nickname, rental_id, update.rental.status
    );
    Ok(Json(RentalResponse::from(&update.rental)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestApp;
    use chrono::{Duration, Utc};
    use rentchat_types::models::RentalStatus;

    fn request(product_id: i64) -> Json<CreateRentalRequest> {
        let start = Utc::now();
        Json(CreateRentalRequest {
            product_id,
            rental_date: start,
            return_date: start + Duration::days(2),
        })
    }

    #[tokio::test]
    async fn rental_moves_forward_and_rejects_going_back() {
        let app = TestApp::new();
        let (status, Json(rental)) = create_rental(
            State(app.state.clone()),
            Extension(app.claims(&app.borrower)),
            request(app.product_id),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(rental.status, RentalStatus::Request);

        let Json(accepted) = update_rental_status(
            State(app.state.clone()),
            Path(rental.id),
            Extension(app.claims(&app.lender)),
            Json(UpdateRentalStatusRequest {
                status: RentalStatus::Accept,
            }),
        )
        .await
        .unwrap();
        assert_eq!(accepted.status, RentalStatus::Accept);

        let conflict = update_rental_status(
            State(app.state.clone()),
            Path(rental.id),
            Extension(app.claims(&app.lender)),
            Json(UpdateRentalStatusRequest {
                status: RentalStatus::Request,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(conflict, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn rental_requests_are_validated() {
        let app = TestApp::new();
        let own = create_rental(
            State(app.state.clone()),
            Extension(app.claims(&app.lender)),
            request(app.product_id),
        )
        .await
        .unwrap_err();
        assert_eq!(own, StatusCode::BAD_REQUEST);

        let missing = create_rental(
            State(app.state.clone()),
            Extension(app.claims(&app.borrower)),
            request(app.product_id + 10),
        )
        .await
        .unwrap_err();
        assert_eq!(missing, StatusCode::NOT_FOUND);

        let (_, Json(rental)) = create_rental(
            State(app.state.clone()),
            Extension(app.claims(&app.borrower)),
            request(app.product_id),
        )
        .await
        .unwrap();
        let stranger = app.state.gateway.db().create_account("eve").unwrap();
        let forbidden = update_rental_status(
            State(app.state.clone()),
            Path(rental.id),
            Extension(app.claims(&stranger)),
            Json(UpdateRentalStatusRequest {
                status: RentalStatus::Accept,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(forbidden, StatusCode::FORBIDDEN);
    }
}

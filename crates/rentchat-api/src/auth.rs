use std::sync::Arc;

use chrono::{Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};

use rentchat_gateway::Gateway;
use rentchat_types::api::Claims;
use rentchat_types::models::Account;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub gateway: Gateway,
    pub jwt_secret: String,
}

/// Issue a session token for `account`. Accounts are provisioned elsewhere;
/// this exists for operators and tests.
pub fn create_token(
    secret: &str,
    account: &Account,
    ttl: Duration,
) -> Result<String, jsonwebtoken::errors::Error> {
    let claims = Claims {
        sub: account.id,
        nickname: account.nickname.clone(),
        exp: (Utc::now() + ttl).timestamp().max(0) as usize,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}

/// Validate a token and return its claims.
pub fn decode_token(secret: &str, token: &str) -> Option<Claims> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .ok()
    .map(|data| data.claims)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_round_trips_and_rejects_wrong_secret() {
        let account = Account {
            id: 7,
            nickname: "bora".into(),
        };
        let token = create_token("s3cret", &account, Duration::hours(1)).unwrap();
        let claims = decode_token("s3cret", &token).unwrap();
        assert_eq!(claims.account(), account);
        assert!(decode_token("other", &token).is_none());
    }

    #[test]
    fn expired_token_is_rejected() {
        let account = Account {
            id: 7,
            nickname: "bora".into(),
        };
        let token = create_token("s3cret", &account, Duration::hours(-2)).unwrap();
        assert!(decode_token("s3cret", &token).is_none());
    }
}

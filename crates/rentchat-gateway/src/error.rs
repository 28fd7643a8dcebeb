use rentchat_types::events::CloseCode;
use rentchat_types::models::RoomId;

/// Failure of an optimistic buffer rewrite (flush or read reconciliation).
/// The buffered entries stay in place either way.
#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    #[error("buffer for room {room} still contended after {attempts} attempts")]
    RetriesExhausted { room: RoomId, attempts: u32 },

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Why a connection is being closed, as sent in the close frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason} ({})", .code.as_u16())]
pub struct CloseFrame {
    pub code: CloseCode,
    pub reason: String,
}

impl CloseFrame {
    pub fn new(code: CloseCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    pub fn normal() -> Self {
        Self::new(CloseCode::Normal, "bye")
    }

    pub fn room_not_found() -> Self {
        Self::new(CloseCode::PolicyViolation, "room not found")
    }

    pub fn not_a_member() -> Self {
        Self::new(CloseCode::PolicyViolation, "not a member")
    }

    pub fn unsupported(reason: impl Into<String>) -> Self {
        Self::new(CloseCode::UnsupportedData, reason)
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::new(CloseCode::InternalError, reason)
    }
}

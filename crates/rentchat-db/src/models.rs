//! Row mapping between SQLite and the shared model types.
//!
//! Timestamps are stored as RFC 3339 text with microsecond precision so that
//! lexicographic order in SQL matches chronological order.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Row;
use rusqlite::types::Type;

use rentchat_types::models::{
    Chatroom, GlobalConfirmView, GlobalNotification, Message, RentalDetail, RentalNotificationView,
    RentalStatus,
};

pub fn to_sql_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_ts(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            // Rows written by SQLite defaults elsewhere may lack a timezone.
            chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
}

fn ts_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(&raw).map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn opt_ts_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|raw| {
        parse_ts(&raw)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

fn status_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<RentalStatus>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|raw| {
        raw.parse::<RentalStatus>()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

pub const CHATROOM_COLUMNS: &str =
    "id, borrower_id, lender_id, product_id, borrower_present, lender_present";

pub fn chatroom_from_row(row: &Row<'_>) -> rusqlite::Result<Chatroom> {
    Ok(Chatroom {
        id: row.get(0)?,
        borrower_id: row.get(1)?,
        lender_id: row.get(2)?,
        product_id: row.get(3)?,
        borrower_present: row.get(4)?,
        lender_present: row.get(5)?,
    })
}

/// Columns for `messages m LEFT JOIN accounts a ON a.id = m.sender_id`.
pub const MESSAGE_COLUMNS: &str =
    "m.id, m.chatroom_id, m.sender_id, a.nickname, m.text, m.image, m.unread, m.created_at";

pub fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        chatroom_id: row.get(1)?,
        sender_id: row.get(2)?,
        sender_nickname: row
            .get::<_, Option<String>>(3)?
            .unwrap_or_else(|| "unknown".to_string()),
        text: row.get(4)?,
        image: row.get(5)?,
        unread: row.get(6)?,
        created_at: ts_column(row, 7)?,
    })
}

pub fn global_notification_from_row(row: &Row<'_>) -> rusqlite::Result<GlobalNotification> {
    Ok(GlobalNotification {
        id: row.get(0)?,
        text: row.get(1)?,
        image: row.get(2)?,
        created_at: ts_column(row, 3)?,
    })
}

pub fn global_confirm_from_row(row: &Row<'_>) -> rusqlite::Result<GlobalConfirmView> {
    Ok(GlobalConfirmView {
        id: row.get(0)?,
        notification_id: row.get(1)?,
        text: row.get(2)?,
        image: row.get(3)?,
        acknowledged: row.get(4)?,
        created_at: ts_column(row, 5)?,
    })
}

pub const RENTAL_COLUMNS: &str = "rh.id, p.id, p.name, p.image, b.id, b.nickname, l.id, l.nickname, \
     rh.status, rh.rental_date, rh.return_date";

pub fn rental_from_row(row: &Row<'_>) -> rusqlite::Result<RentalDetail> {
    let status = status_column(row, 8)?.ok_or(rusqlite::Error::InvalidColumnType(
        8,
        "status".to_string(),
        Type::Null,
    ))?;
    Ok(RentalDetail {
        id: row.get(0)?,
        product_id: row.get(1)?,
        product_name: row.get(2)?,
        product_image: row.get(3)?,
        borrower_id: row.get(4)?,
        borrower_nickname: row.get(5)?,
        lender_id: row.get(6)?,
        lender_nickname: row.get(7)?,
        status,
        rental_date: ts_column(row, 9)?,
        return_date: ts_column(row, 10)?,
    })
}

/// Columns for a rental notification joined (left) with its rental, product
/// and both participants.
pub const RENTAL_NOTIFICATION_COLUMNS: &str = "n.id, n.recipient_id, n.text, p.name, p.image, \
     b.nickname, l.nickname, rh.rental_date, rh.return_date, rh.status, n.acknowledged, n.created_at";

pub fn rental_notification_from_row(row: &Row<'_>) -> rusqlite::Result<RentalNotificationView> {
    Ok(RentalNotificationView {
        id: row.get(0)?,
        recipient: row.get(1)?,
        text: row.get(2)?,
        product_name: row.get(3)?,
        product_image: row.get(4)?,
        borrower: row.get(5)?,
        lender: row.get(6)?,
        rental_date: opt_ts_column(row, 7)?,
        return_date: opt_ts_column(row, 8)?,
        status: status_column(row, 9)?,
        acknowledged: row.get(10)?,
        created_at: ts_column(row, 11)?,
    })
}

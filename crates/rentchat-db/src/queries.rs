use crate::Database;
use crate::models::{
    CHATROOM_COLUMNS, MESSAGE_COLUMNS, RENTAL_COLUMNS, RENTAL_NOTIFICATION_COLUMNS,
    chatroom_from_row, global_confirm_from_row, global_notification_from_row, message_from_row,
    rental_from_row, rental_notification_from_row, to_sql_ts,
};
use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::Connection;

use rentchat_types::models::{
    Account, AccountId, Chatroom, GlobalConfirmView, GlobalNotification, Message, NewMessage,
    RentalDetail, RentalNotificationView, RentalStatus, RoomId,
};

/// Result of a participant leaving a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveOutcome {
    NotFound,
    NotMember,
    /// The caller's present flag was cleared; the other side is still in.
    Left,
    /// The other side had already left, so the room was removed.
    Deleted,
}

impl Database {
    // -- Accounts --

    pub fn create_account(&self, nickname: &str) -> Result<Account> {
        self.with_conn(|conn| {
            conn.execute("INSERT INTO accounts (nickname) VALUES (?1)", [nickname])?;
            Ok(Account {
                id: conn.last_insert_rowid(),
                nickname: nickname.to_string(),
            })
        })
    }

    pub fn get_account(&self, id: AccountId) -> Result<Option<Account>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, nickname FROM accounts WHERE id = ?1",
                [id],
                |row| {
                    Ok(Account {
                        id: row.get(0)?,
                        nickname: row.get(1)?,
                    })
                },
            )
            .optional()
        })
    }

    // -- Products --

    pub fn create_product(&self, name: &str, lender_id: AccountId, image: Option<&str>) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO products (name, lender_id, image) VALUES (?1, ?2, ?3)",
                rusqlite::params![name, lender_id, image],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Owner of a product, or `None` when the product does not exist.
    pub fn product_lender(&self, product_id: i64) -> Result<Option<AccountId>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT lender_id FROM products WHERE id = ?1",
                [product_id],
                |row| row.get(0),
            )
            .optional()
        })
    }

    // -- Chat rooms --

    pub fn create_chatroom(
        &self,
        borrower_id: AccountId,
        lender_id: AccountId,
        product_id: Option<i64>,
    ) -> Result<Chatroom> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO chatrooms (borrower_id, lender_id, product_id) VALUES (?1, ?2, ?3)",
                rusqlite::params![borrower_id, lender_id, product_id],
            )?;
            Ok(Chatroom {
                id: conn.last_insert_rowid(),
                borrower_id,
                lender_id,
                product_id,
                borrower_present: true,
                lender_present: true,
            })
        })
    }

    pub fn get_chatroom(&self, id: RoomId) -> Result<Option<Chatroom>> {
        self.with_conn(|conn| query_chatroom(conn, id))
    }

    /// Rooms the user participates in and has not left.
    pub fn member_chatrooms(&self, user_id: AccountId) -> Result<Vec<Chatroom>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {CHATROOM_COLUMNS} FROM chatrooms
                 WHERE (borrower_id = ?1 AND borrower_present = 1)
                    OR (lender_id = ?1 AND lender_present = 1)
                 ORDER BY id"
            ))?;
            let rows = stmt
                .query_map([user_id], chatroom_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn find_chatroom(
        &self,
        product_id: i64,
        borrower_id: AccountId,
        lender_id: AccountId,
    ) -> Result<Option<RoomId>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id FROM chatrooms
                 WHERE product_id = ?1 AND borrower_id = ?2 AND lender_id = ?3
                 ORDER BY id DESC LIMIT 1",
                [product_id, borrower_id, lender_id],
                |row| row.get(0),
            )
            .optional()
        })
    }

    /// Clear the caller's present flag, or delete the room when the other
    /// participant has already left. A room never survives with both flags
    /// cleared.
    pub fn leave_chatroom(&self, id: RoomId, user_id: AccountId) -> Result<LeaveOutcome> {
        self.with_transaction(|tx| {
            let Some(room) = query_chatroom(tx, id)? else {
                return Ok(Some(LeaveOutcome::NotFound));
            };
            if !room.is_member(user_id) {
                return Ok(Some(LeaveOutcome::NotMember));
            }
            if !room.borrower_present || !room.lender_present {
                tx.execute("DELETE FROM chatrooms WHERE id = ?1", [id])?;
                return Ok(Some(LeaveOutcome::Deleted));
            }
            let column = if user_id == room.borrower_id {
                "borrower_present"
            } else {
                "lender_present"
            };
            tx.execute(&format!("UPDATE chatrooms SET {column} = 0 WHERE id = ?1"), [id])?;
            Ok(Some(LeaveOutcome::Left))
        })
        .map(|outcome| outcome.unwrap_or(LeaveOutcome::NotFound))
    }

    // -- Messages --

    /// Bulk-insert on a caller-provided connection or transaction, keeping
    /// the slice order as id order.
    pub fn insert_messages(conn: &Connection, rows: &[NewMessage]) -> Result<usize> {
        let mut stmt = conn.prepare(
            "INSERT INTO messages (chatroom_id, sender_id, text, image, unread, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        for row in rows {
            stmt.execute(rusqlite::params![
                row.chatroom_id,
                row.sender_id,
                row.text,
                row.image,
                row.unread,
                to_sql_ts(&row.created_at),
            ])?;
        }
        Ok(rows.len())
    }

    pub fn bulk_insert_messages(&self, rows: &[NewMessage]) -> Result<usize> {
        self.with_transaction(|tx| Database::insert_messages(tx, rows).map(Some))
            .map(|n| n.unwrap_or(0))
    }

    /// Mark every unread message in the room not written by `reader_id` as read.
    pub fn mark_room_read(&self, room_id: RoomId, reader_id: AccountId) -> Result<usize> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE messages SET unread = 0
                 WHERE chatroom_id = ?1 AND sender_id != ?2 AND unread = 1",
                [room_id, reader_id],
            )?;
            Ok(n)
        })
    }

    pub fn unread_count(&self, room_id: RoomId, viewer_id: AccountId) -> Result<u64> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages
                 WHERE chatroom_id = ?1 AND sender_id != ?2 AND unread = 1",
                [room_id, viewer_id],
                |row| row.get(0),
            )?;
            Ok(n.max(0) as u64)
        })
    }

    pub fn count_messages(&self, room_id: RoomId) -> Result<u64> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE chatroom_id = ?1",
                [room_id],
                |row| row.get(0),
            )?;
            Ok(n.max(0) as u64)
        })
    }

    /// Newest-first page of durable messages, optionally strictly older than
    /// `before`.
    pub fn recent_messages(
        &self,
        room_id: RoomId,
        limit: u32,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>> {
        self.with_conn(|conn| {
            let rows = match before {
                Some(before) => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {MESSAGE_COLUMNS}
                         FROM messages m
                         LEFT JOIN accounts a ON a.id = m.sender_id
                         WHERE m.chatroom_id = ?1 AND m.created_at < ?2
                         ORDER BY m.created_at DESC, m.id DESC
                         LIMIT ?3"
                    ))?;
                    stmt.query_map(
                        rusqlite::params![room_id, to_sql_ts(&before), limit],
                        message_from_row,
                    )?
                    .collect::<std::result::Result<Vec<_>, _>>()?
                }
                None => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {MESSAGE_COLUMNS}
                         FROM messages m
                         LEFT JOIN accounts a ON a.id = m.sender_id
                         WHERE m.chatroom_id = ?1
                         ORDER BY m.created_at DESC, m.id DESC
                         LIMIT ?2"
                    ))?;
                    stmt.query_map(rusqlite::params![room_id, limit], message_from_row)?
                        .collect::<std::result::Result<Vec<_>, _>>()?
                }
            };
            Ok(rows)
        })
    }

    /// Most recent unread message in the room written by someone other than
    /// `user_id`.
    pub fn latest_unread_from_others(
        &self,
        room_id: RoomId,
        user_id: AccountId,
    ) -> Result<Option<Message>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {MESSAGE_COLUMNS}
                     FROM messages m
                     LEFT JOIN accounts a ON a.id = m.sender_id
                     WHERE m.chatroom_id = ?1 AND m.sender_id != ?2 AND m.unread = 1
                     ORDER BY m.created_at DESC, m.id DESC
                     LIMIT 1"
                ),
                [room_id, user_id],
                message_from_row,
            )
            .optional()
        })
    }

    // -- Global notifications --

    pub fn create_global_notification(&self, text: &str, image: Option<&str>) -> Result<GlobalNotification> {
        let created_at = Utc::now();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO global_notifications (text, image, created_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![text, image, to_sql_ts(&created_at)],
            )?;
            let id = conn.last_insert_rowid();
            conn.query_row(
                "SELECT id, text, image, created_at FROM global_notifications WHERE id = ?1",
                [id],
                global_notification_from_row,
            )
            .map_err(Into::into)
        })
    }

    /// One unacknowledged confirmation per existing account. Rows that
    /// already exist are left alone.
    pub fn create_confirms_for_all(&self, notification_id: i64) -> Result<usize> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "INSERT OR IGNORE INTO global_notification_confirms (user_id, notification_id)
                 SELECT id, ?1 FROM accounts",
                [notification_id],
            )?;
            Ok(n)
        })
    }

    /// Idempotently create the (user, notification) confirmation row.
    /// Returns true when a row was inserted.
    pub fn ensure_global_confirm(&self, user_id: AccountId, notification_id: i64) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "INSERT OR IGNORE INTO global_notification_confirms (user_id, notification_id)
                 VALUES (?1, ?2)",
                [user_id, notification_id],
            )?;
            Ok(n > 0)
        })
    }

    pub fn unacknowledged_global(&self, user_id: AccountId) -> Result<Vec<GlobalConfirmView>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id, g.id, g.text, g.image, c.acknowledged, g.created_at
                 FROM global_notification_confirms c
                 JOIN global_notifications g ON g.id = c.notification_id
                 WHERE c.user_id = ?1 AND c.acknowledged = 0
                 ORDER BY g.id",
            )?;
            let rows = stmt
                .query_map([user_id], global_confirm_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn count_unacknowledged_confirms(&self, notification_id: i64) -> Result<u64> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM global_notification_confirms
                 WHERE notification_id = ?1 AND acknowledged = 0",
                [notification_id],
                |row| row.get(0),
            )?;
            Ok(n.max(0) as u64)
        })
    }

    pub fn acknowledge_global(&self, user_id: AccountId, notification_id: i64) -> Result<usize> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE global_notification_confirms SET acknowledged = 1
                 WHERE user_id = ?1 AND notification_id = ?2",
                [user_id, notification_id],
            )?;
            Ok(n)
        })
    }

    // -- Rentals --

    pub fn create_rental(
        &self,
        product_id: i64,
        borrower_id: AccountId,
        rental_date: DateTime<Utc>,
        return_date: DateTime<Utc>,
    ) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO rental_histories (product_id, borrower_id, status, rental_date, return_date)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    product_id,
                    borrower_id,
                    RentalStatus::Request.as_str(),
                    to_sql_ts(&rental_date),
                    to_sql_ts(&return_date),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn get_rental(&self, id: i64) -> Result<Option<RentalDetail>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {RENTAL_COLUMNS}
                     FROM rental_histories rh
                     JOIN products p ON p.id = rh.product_id
                     JOIN accounts b ON b.id = rh.borrower_id
                     JOIN accounts l ON l.id = p.lender_id
                     WHERE rh.id = ?1"
                ),
                [id],
                rental_from_row,
            )
            .optional()
        })
    }

    pub fn update_rental_status(&self, id: i64, status: RentalStatus) -> Result<usize> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE rental_histories SET status = ?1 WHERE id = ?2",
                rusqlite::params![status.as_str(), id],
            )?;
            Ok(n)
        })
    }

    pub fn insert_rental_notification(
        &self,
        recipient_id: AccountId,
        rental_history_id: Option<i64>,
        text: &str,
    ) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO rental_notifications (recipient_id, rental_history_id, text)
                 VALUES (?1, ?2, ?3)",
                rusqlite::params![recipient_id, rental_history_id, text],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn get_rental_notification(&self, id: i64) -> Result<Option<RentalNotificationView>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("{} WHERE n.id = ?1", rental_notification_select()),
                [id],
                rental_notification_from_row,
            )
            .optional()
        })
    }

    pub fn unacknowledged_rental(&self, user_id: AccountId) -> Result<Vec<RentalNotificationView>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{} WHERE n.recipient_id = ?1 AND n.acknowledged = 0 ORDER BY n.id",
                rental_notification_select()
            ))?;
            let rows = stmt
                .query_map([user_id], rental_notification_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Scoped to the recipient: acknowledging someone else's row is a no-op.
    pub fn acknowledge_rental(&self, user_id: AccountId, notification_id: i64) -> Result<usize> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE rental_notifications SET acknowledged = 1
                 WHERE id = ?1 AND recipient_id = ?2",
                [notification_id, user_id],
            )?;
            Ok(n)
        })
    }
}

fn rental_notification_select() -> String {
    format!(
        "SELECT {RENTAL_NOTIFICATION_COLUMNS}
         FROM rental_notifications n
         LEFT JOIN rental_histories rh ON rh.id = n.rental_history_id
         LEFT JOIN products p ON p.id = rh.product_id
         LEFT JOIN accounts b ON b.id = rh.borrower_id
         LEFT JOIN accounts l ON l.id = p.lender_id"
    )
}

fn query_chatroom(conn: &Connection, id: RoomId) -> Result<Option<Chatroom>> {
    conn.query_row(
        &format!("SELECT {CHATROOM_COLUMNS} FROM chatrooms WHERE id = ?1"),
        [id],
        chatroom_from_row,
    )
    .optional()
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn seeded() -> (Database, Account, Account, Chatroom) {
        let db = Database::open_in_memory().unwrap();
        let borrower = db.create_account("borrower").unwrap();
        let lender = db.create_account("lender").unwrap();
        let room = db.create_chatroom(borrower.id, lender.id, None).unwrap();
        (db, borrower, lender, room)
    }

    fn msg(room: &Chatroom, sender: &Account, text: &str, at: DateTime<Utc>) -> NewMessage {
        NewMessage {
            chatroom_id: room.id,
            sender_id: sender.id,
            text: text.to_string(),
            image: None,
            unread: true,
            created_at: at,
        }
    }

    #[test]
    fn bulk_insert_and_page_newest_first() {
        let (db, borrower, lender, room) = seeded();
        let t0 = Utc::now();
        let rows: Vec<_> = (0..5)
            .map(|i| {
                let sender = if i % 2 == 0 { &borrower } else { &lender };
                msg(&room, sender, &format!("m{i}"), t0 + Duration::milliseconds(i))
            })
            .collect();
        assert_eq!(db.bulk_insert_messages(&rows).unwrap(), 5);

        let page = db.recent_messages(room.id, 3, None).unwrap();
        let texts: Vec<_> = page.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, ["m4", "m3", "m2"]);
        assert_eq!(page[0].sender_nickname, "borrower");

        let older = db
            .recent_messages(room.id, 10, Some(t0 + Duration::milliseconds(2)))
            .unwrap();
        let texts: Vec<_> = older.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, ["m1", "m0"]);
    }

    #[test]
    fn mark_room_read_skips_own_messages() {
        let (db, borrower, lender, room) = seeded();
        let now = Utc::now();
        db.bulk_insert_messages(&[
            msg(&room, &borrower, "mine", now),
            msg(&room, &lender, "theirs", now + Duration::milliseconds(1)),
        ])
        .unwrap();

        assert_eq!(db.unread_count(room.id, borrower.id).unwrap(), 1);
        assert_eq!(db.mark_room_read(room.id, borrower.id).unwrap(), 1);
        assert_eq!(db.unread_count(room.id, borrower.id).unwrap(), 0);
        assert_eq!(db.mark_room_read(room.id, borrower.id).unwrap(), 0);
        // The lender still has the borrower's message unread.
        assert_eq!(db.unread_count(room.id, lender.id).unwrap(), 1);
    }

    #[test]
    fn rolled_back_transaction_leaves_no_rows() {
        let (db, borrower, _, room) = seeded();
        let rows = [msg(&room, &borrower, "x", Utc::now())];
        let out = db
            .with_transaction(|tx| {
                Database::insert_messages(tx, &rows)?;
                Ok(None::<()>)
            })
            .unwrap();
        assert!(out.is_none());
        assert_eq!(db.count_messages(room.id).unwrap(), 0);
    }

    #[test]
    fn leaving_twice_deletes_the_room() {
        let (db, borrower, lender, room) = seeded();
        assert_eq!(db.leave_chatroom(room.id, borrower.id).unwrap(), LeaveOutcome::Left);
        assert_eq!(
            db.leave_chatroom(room.id, borrower.id).unwrap(),
            LeaveOutcome::NotMember
        );
        assert!(db.member_chatrooms(borrower.id).unwrap().is_empty());
        assert_eq!(db.member_chatrooms(lender.id).unwrap().len(), 1);

        assert_eq!(db.leave_chatroom(room.id, lender.id).unwrap(), LeaveOutcome::Deleted);
        assert!(db.get_chatroom(room.id).unwrap().is_none());
        assert_eq!(db.leave_chatroom(room.id, lender.id).unwrap(), LeaveOutcome::NotFound);
    }

    #[test]
    fn global_confirms_are_created_once_per_account() {
        let (db, borrower, lender, _) = seeded();
        db.create_account("third").unwrap();
        let notice = db.create_global_notification("maintenance", None).unwrap();

        assert_eq!(db.create_confirms_for_all(notice.id).unwrap(), 3);
        assert_eq!(db.create_confirms_for_all(notice.id).unwrap(), 0);
        assert!(!db.ensure_global_confirm(borrower.id, notice.id).unwrap());
        assert_eq!(db.count_unacknowledged_confirms(notice.id).unwrap(), 3);

        assert_eq!(db.acknowledge_global(lender.id, notice.id).unwrap(), 1);
        assert!(db.unacknowledged_global(lender.id).unwrap().is_empty());
        let pending = db.unacknowledged_global(borrower.id).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].text, "maintenance");
    }

    #[test]
    fn rental_notifications_join_rental_details() {
        let (db, borrower, lender, _) = seeded();
        let product = db.create_product("tent", lender.id, Some("images/tent.png")).unwrap();
        assert_eq!(db.product_lender(product).unwrap(), Some(lender.id));
        assert_eq!(db.product_lender(product + 100).unwrap(), None);
        let start = Utc::now();
        let rental = db
            .create_rental(product, borrower.id, start, start + Duration::days(3))
            .unwrap();

        let detail = db.get_rental(rental).unwrap().unwrap();
        assert_eq!(detail.status, RentalStatus::Request);
        assert_eq!(detail.lender_id, lender.id);
        assert_eq!(detail.borrower_nickname, "borrower");

        let id = db
            .insert_rental_notification(lender.id, Some(rental), "rental requested")
            .unwrap();
        let view = db.get_rental_notification(id).unwrap().unwrap();
        assert_eq!(view.product_name.as_deref(), Some("tent"));
        assert_eq!(view.status, Some(RentalStatus::Request));

        // Only the recipient can acknowledge.
        assert_eq!(db.acknowledge_rental(borrower.id, id).unwrap(), 0);
        assert_eq!(db.unacknowledged_rental(lender.id).unwrap().len(), 1);
        assert_eq!(db.acknowledge_rental(lender.id, id).unwrap(), 1);
        assert!(db.unacknowledged_rental(lender.id).unwrap().is_empty());
    }
}

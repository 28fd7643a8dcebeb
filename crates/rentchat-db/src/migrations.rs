use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS accounts (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            nickname    TEXT NOT NULL UNIQUE,
            created_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );

        CREATE TABLE IF NOT EXISTS products (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            name        TEXT NOT NULL,
            lender_id   INTEGER NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
            image       TEXT
        );

        CREATE TABLE IF NOT EXISTS chatrooms (
            id                INTEGER PRIMARY KEY AUTOINCREMENT,
            borrower_id       INTEGER NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
            lender_id         INTEGER NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
            product_id        INTEGER REFERENCES products(id) ON DELETE SET NULL,
            borrower_present  INTEGER NOT NULL DEFAULT 1,
            lender_present    INTEGER NOT NULL DEFAULT 1
        );

        CREATE INDEX IF NOT EXISTS idx_chatrooms_borrower ON chatrooms(borrower_id);
        CREATE INDEX IF NOT EXISTS idx_chatrooms_lender ON chatrooms(lender_id);

        CREATE TABLE IF NOT EXISTS messages (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            chatroom_id INTEGER NOT NULL REFERENCES chatrooms(id) ON DELETE CASCADE,
            sender_id   INTEGER NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
            text        TEXT NOT NULL,
            image       TEXT,
            unread      INTEGER NOT NULL DEFAULT 1,
            created_at  TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_chatroom
            ON messages(chatroom_id, created_at);

        CREATE TABLE IF NOT EXISTS global_notifications (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            text        TEXT NOT NULL,
            image       TEXT,
            created_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS global_notification_confirms (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id         INTEGER NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
            notification_id INTEGER NOT NULL REFERENCES global_notifications(id) ON DELETE CASCADE,
            acknowledged    INTEGER NOT NULL DEFAULT 0,
            created_at      TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
            UNIQUE(user_id, notification_id)
        );

        CREATE TABLE IF NOT EXISTS rental_histories (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            product_id  INTEGER NOT NULL REFERENCES products(id) ON DELETE CASCADE,
            borrower_id INTEGER NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
            status      TEXT NOT NULL DEFAULT 'REQUEST',
            rental_date TEXT NOT NULL,
            return_date TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS rental_notifications (
            id                INTEGER PRIMARY KEY AUTOINCREMENT,
            recipient_id      INTEGER NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
            rental_history_id INTEGER REFERENCES rental_histories(id) ON DELETE CASCADE,
            text              TEXT NOT NULL,
            acknowledged      INTEGER NOT NULL DEFAULT 0,
            created_at        TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );

        CREATE INDEX IF NOT EXISTS idx_rental_notifications_recipient
            ON rental_notifications(recipient_id, acknowledged);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}

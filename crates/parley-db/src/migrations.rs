use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            name        TEXT NOT NULL,
            email       TEXT NOT NULL UNIQUE,
            password    TEXT NOT NULL,
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        -- is_group is the optional column: legacy deployments predate it
        -- and the query layer must keep working without it (see compat.rs).
        CREATE TABLE IF NOT EXISTS messages (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id     INTEGER NOT NULL REFERENCES users(id),
            content     TEXT NOT NULL,
            room_id     TEXT NOT NULL,
            is_group    INTEGER NOT NULL DEFAULT 0,
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_messages_room
            ON messages(room_id, created_at);

        CREATE TABLE IF NOT EXISTS groups (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            group_id    TEXT NOT NULL UNIQUE,
            name        TEXT NOT NULL,
            creator_id  INTEGER NOT NULL REFERENCES users(id),
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS group_members (
            group_id    TEXT NOT NULL REFERENCES groups(group_id) ON DELETE CASCADE,
            user_id     INTEGER NOT NULL REFERENCES users(id),
            joined_at   TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(group_id, user_id)
        );

        CREATE INDEX IF NOT EXISTS idx_group_members_user
            ON group_members(user_id);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}

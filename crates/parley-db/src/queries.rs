use crate::models::{GroupRow, MemberRow, MessageRow, UserRow};
use crate::{Database, compat};
use anyhow::Result;
use parley_types::rooms;
use rusqlite::Connection;

impl Database {
    // -- Users --

    pub fn create_user(&self, name: &str, email: &str, password_hash: &str) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (name, email, password) VALUES (?1, ?2, ?3)",
                (name, email, password_hash),
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn find_user_by_email(&self, email: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "email = ?1", email))
    }

    pub fn find_user_by_id(&self, id: i64) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "id = ?1", id))
    }

    /// All registered users, id and name only.
    pub fn list_users(&self) -> Result<Vec<(i64, String)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id, name FROM users ORDER BY id")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Messages --

    /// Persist a message and return the store-assigned id. Goes through
    /// the schema shim: on a legacy schema the is_group column is omitted.
    pub fn insert_message(
        &self,
        user_id: i64,
        content: &str,
        room_id: &str,
        is_group: bool,
    ) -> Result<i64> {
        self.with_conn(|conn| {
            compat::with_column_fallback(
                "is_group",
                || {
                    conn.execute(
                        "INSERT INTO messages (user_id, content, room_id, is_group)
                         VALUES (?1, ?2, ?3, ?4)",
                        rusqlite::params![user_id, content, room_id, is_group],
                    )?;
                    Ok(conn.last_insert_rowid())
                },
                || {
                    conn.execute(
                        "INSERT INTO messages (user_id, content, room_id) VALUES (?1, ?2, ?3)",
                        rusqlite::params![user_id, content, room_id],
                    )?;
                    Ok(conn.last_insert_rowid())
                },
            )
            .map_err(Into::into)
        })
    }

    /// Message history for a room, oldest first. `is_group` filters on the
    /// flag when given; on a legacy schema the filter is dropped and the
    /// flag is derived from the room token instead.
    pub fn list_messages_by_room(
        &self,
        room_id: &str,
        is_group: Option<bool>,
        limit: u32,
    ) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            compat::with_column_fallback(
                "is_group",
                || query_messages(conn, room_id, is_group, limit),
                || query_messages_legacy(conn, room_id, limit),
            )
            .map_err(Into::into)
        })
    }

    // -- Groups --

    pub fn insert_group(&self, name: &str, creator_id: i64, group_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO groups (group_id, name, creator_id) VALUES (?1, ?2, ?3)",
                rusqlite::params![group_id, name, creator_id],
            )?;
            Ok(())
        })
    }

    pub fn find_group_by_group_id(&self, group_id: &str) -> Result<Option<GroupRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT group_id, name, creator_id, created_at FROM groups WHERE group_id = ?1",
            )?;
            let row = stmt
                .query_row([group_id], |row| {
                    Ok(GroupRow {
                        group_id: row.get(0)?,
                        name: row.get(1)?,
                        creator_id: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                })
                .optional()?;
            Ok(row)
        })
    }

    /// Delete a group row; membership rows cascade.
    pub fn delete_group_by_group_id(&self, group_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM groups WHERE group_id = ?1", [group_id])?;
            Ok(())
        })
    }

    // -- Memberships --

    /// Upsert semantics: inserting an existing (group, user) pair is a
    /// success, not an error.
    pub fn insert_membership(&self, group_id: &str, user_id: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO group_members (group_id, user_id) VALUES (?1, ?2)",
                rusqlite::params![group_id, user_id],
            )?;
            Ok(())
        })
    }

    /// Delete one membership row. Returns whether a row was actually
    /// removed, so callers can tell a real departure from a no-op.
    pub fn delete_membership(&self, group_id: &str, user_id: i64) -> Result<bool> {
        self.with_conn(|conn| {
            let rows = conn.execute(
                "DELETE FROM group_members WHERE group_id = ?1 AND user_id = ?2",
                rusqlite::params![group_id, user_id],
            )?;
            Ok(rows > 0)
        })
    }

    pub fn count_members(&self, group_id: &str) -> Result<i64> {
        self.with_conn(|conn| {
            let count = conn.query_row(
                "SELECT COUNT(*) FROM group_members WHERE group_id = ?1",
                [group_id],
                |row| row.get(0),
            )?;
            Ok(count)
        })
    }

    pub fn list_members(&self, group_id: &str) -> Result<Vec<MemberRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT gm.user_id, u.name, gm.joined_at
                 FROM group_members gm
                 JOIN users u ON gm.user_id = u.id
                 WHERE gm.group_id = ?1
                 ORDER BY gm.joined_at",
            )?;
            let rows = stmt
                .query_map([group_id], |row| {
                    Ok(MemberRow {
                        user_id: row.get(0)?,
                        name: row.get(1)?,
                        joined_at: row.get(2)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn list_groups_for_user(&self, user_id: i64) -> Result<Vec<GroupRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT g.group_id, g.name, g.creator_id, g.created_at
                 FROM group_members gm
                 JOIN groups g ON gm.group_id = g.group_id
                 WHERE gm.user_id = ?1
                 ORDER BY g.created_at",
            )?;
            let rows = stmt
                .query_map([user_id], |row| {
                    Ok(GroupRow {
                        group_id: row.get(0)?,
                        name: row.get(1)?,
                        creator_id: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

fn query_user<P: rusqlite::ToSql>(
    conn: &Connection,
    filter: &str,
    param: P,
) -> Result<Option<UserRow>> {
    let sql =
        format!("SELECT id, name, email, password, created_at FROM users WHERE {filter}");
    let mut stmt = conn.prepare(&sql)?;

    let row = stmt
        .query_row([param], |row| {
            Ok(UserRow {
                id: row.get(0)?,
                name: row.get(1)?,
                email: row.get(2)?,
                password: row.get(3)?,
                created_at: row.get(4)?,
            })
        })
        .optional()?;

    Ok(row)
}

fn map_message(row: &rusqlite::Row<'_>) -> std::result::Result<MessageRow, rusqlite::Error> {
    Ok(MessageRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        author_name: row
            .get::<_, Option<String>>(2)?
            .unwrap_or_else(|| "unknown".to_string()),
        content: row.get(3)?,
        room_id: row.get(4)?,
        is_group: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn query_messages(
    conn: &Connection,
    room_id: &str,
    is_group: Option<bool>,
    limit: u32,
) -> std::result::Result<Vec<MessageRow>, rusqlite::Error> {
    // JOIN users to fetch author_name in a single query (eliminates N+1)
    match is_group {
        Some(flag) => {
            let mut stmt = conn.prepare(
                "SELECT m.id, m.user_id, u.name, m.content, m.room_id, m.is_group, m.created_at
                 FROM messages m
                 LEFT JOIN users u ON m.user_id = u.id
                 WHERE m.room_id = ?1 AND m.is_group = ?2
                 ORDER BY m.created_at ASC, m.id ASC
                 LIMIT ?3",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![room_id, flag, limit], map_message)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        }
        None => {
            let mut stmt = conn.prepare(
                "SELECT m.id, m.user_id, u.name, m.content, m.room_id, m.is_group, m.created_at
                 FROM messages m
                 LEFT JOIN users u ON m.user_id = u.id
                 WHERE m.room_id = ?1
                 ORDER BY m.created_at ASC, m.id ASC
                 LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![room_id, limit], map_message)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        }
    }
}

/// Reduced read for schemas without the is_group column: no flag filter,
/// flag derived from the room token.
fn query_messages_legacy(
    conn: &Connection,
    room_id: &str,
    limit: u32,
) -> std::result::Result<Vec<MessageRow>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT m.id, m.user_id, u.name, m.content, m.room_id, m.created_at
         FROM messages m
         LEFT JOIN users u ON m.user_id = u.id
         WHERE m.room_id = ?1
         ORDER BY m.created_at ASC, m.id ASC
         LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(rusqlite::params![room_id, limit], |row| {
            let room: String = row.get(4)?;
            Ok(MessageRow {
                id: row.get(0)?,
                user_id: row.get(1)?,
                author_name: row
                    .get::<_, Option<String>>(2)?
                    .unwrap_or_else(|| "unknown".to_string()),
                content: row.get(3)?,
                is_group: rooms::is_group_room(&room),
                room_id: room,
                created_at: row.get(5)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
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

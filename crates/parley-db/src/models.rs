/// Database row types — these map directly to SQLite rows.
/// Distinct from parley-types API models to keep the DB layer independent.

pub struct UserRow {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub password: String,
    pub created_at: String,
}

pub struct MessageRow {
    pub id: i64,
    pub user_id: i64,
    pub author_name: String,
    pub content: String,
    pub room_id: String,
    pub is_group: bool,
    pub created_at: String,
}

pub struct GroupRow {
    pub group_id: String,
    pub name: String,
    pub creator_id: i64,
    pub created_at: String,
}

pub struct MemberRow {
    pub user_id: i64,
    pub name: String,
    pub joined_at: String,
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

/// Public view of a user — what other members are allowed to see.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: i64,
    pub name: String,
}

/// A chat group as seen by its members. `group_id` is the stable external
/// token generated at creation, not the numeric row id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupInfo {
    pub group_id: String,
    pub name: String,
    pub creator_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupDetail {
    pub group_id: String,
    pub name: String,
    pub creator_id: i64,
    pub created_at: String,
    pub members: Vec<UserSummary>,
}

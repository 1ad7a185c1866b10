use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::GroupInfo;

/// Events sent over the WebSocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Server confirms successful identification
    Ready { user_id: i64, name: String },

    /// A user came online or went offline. Sent once per already-online
    /// user right after Ready (the presence snapshot), then broadcast on
    /// every change.
    PresenceUpdate {
        user_id: i64,
        name: String,
        online: bool,
    },

    /// The connection's current group memberships, emitted after the
    /// membership sync on identification and on request.
    GroupList { groups: Vec<GroupInfo> },

    /// A group was created that includes this user
    GroupCreated { group: GroupInfo },

    /// Transient system message shown inside a group ("Ann left", ...).
    /// Not persisted.
    GroupNotice { group_id: String, text: String },

    /// A new group message. `id` is the store-assigned message id —
    /// group messages are only broadcast after a successful persist.
    GroupMessage {
        id: i64,
        group_id: String,
        user_id: i64,
        name: String,
        content: String,
        created_at: DateTime<Utc>,
    },

    /// A direct message. `id` is None when persistence failed — the
    /// message was still delivered live but will be absent from history.
    DirectMessage {
        id: Option<i64>,
        room_id: String,
        from_user_id: i64,
        from_name: String,
        content: String,
        created_at: DateTime<Utc>,
    },

    /// A user started or stopped typing in a private conversation
    Typing {
        user_id: i64,
        name: String,
        is_typing: bool,
    },

    /// Users were added to a group. Sent to the group and to each added
    /// user individually (the latter so offline-joined clients learn the
    /// group's name without a round trip).
    MembersAdded {
        group: GroupInfo,
        user_ids: Vec<i64>,
    },

    /// A user was removed from a group by its creator
    MemberRemoved { group_id: String, user_id: i64 },

    /// Delivery acknowledgment for a direct message. `message_id` is
    /// None when the persist failed (live delivery was still attempted).
    MessageAck {
        message_id: Option<i64>,
        room_id: String,
    },
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Identify the connection. Identity comes from the JWT issued at
    /// login, never from client-supplied ids.
    Identify { token: String },

    /// Send a direct message to another user
    DirectMessage { to_user_id: i64, content: String },

    /// Typing indicator for a private conversation
    Typing { to_user_id: i64, is_typing: bool },

    /// Create a group; the creator is always a member even if omitted
    /// from `member_ids`.
    CreateGroup { name: String, member_ids: Vec<i64> },

    /// Send a message to a group
    GroupMessage { group_id: String, content: String },

    /// Leave a group (self-service)
    LeaveGroup { group_id: String },

    /// Remove a member from a group (creator only)
    RemoveMember { group_id: String, user_id: i64 },

    /// Add members to a group (creator only)
    AddMembers {
        group_id: String,
        user_ids: Vec<i64>,
    },

    /// Ask for a fresh GroupList
    RequestGroups,
}

use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::error;

use parley_db::models::MessageRow;
use parley_types::api::{Claims, MessageResponse};
use parley_types::models::{GroupDetail, GroupInfo, UserSummary};
use parley_types::rooms;

use crate::auth::AppState;

/// Read-side row cap, oldest first.
const HISTORY_LIMIT: u32 = 100;

fn message_response(row: MessageRow) -> MessageResponse {
    MessageResponse {
        id: row.id,
        user_id: row.user_id,
        author_name: row.author_name,
        content: row.content,
        room_id: row.room_id,
        is_group: row.is_group,
        created_at: row.created_at,
    }
}

/// All registered users, id and name only — used to pick conversation
/// partners and group invitees.
pub async fn list_users(
    State(state): State<AppState>,
    Extension(_claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let db = state.db.clone();
    let users = tokio::task::spawn_blocking(move || db.list_users())
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let users: Vec<UserSummary> = users
        .into_iter()
        .map(|(id, name)| UserSummary { id, name })
        .collect();
    Ok(Json(users))
}

/// Direct-message history between the authenticated user and another
/// user. The room token is order-independent, so either side fetches the
/// same rows.
pub async fn get_direct_history(
    State(state): State<AppState>,
    Path(other_user_id): Path<i64>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let room_id = rooms::private_room_token(claims.sub, other_user_id);

    let db = state.db.clone();
    let rows = tokio::task::spawn_blocking(move || {
        db.list_messages_by_room(&room_id, None, HISTORY_LIMIT)
    })
    .await
    .map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let messages: Vec<MessageResponse> = rows.into_iter().map(message_response).collect();
    Ok(Json(messages))
}

/// The authenticated user's groups.
pub async fn get_my_groups(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let db = state.db.clone();
    let user_id = claims.sub;
    let rows = tokio::task::spawn_blocking(move || db.list_groups_for_user(user_id))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let groups: Vec<GroupInfo> = rows
        .into_iter()
        .map(|g| GroupInfo {
            group_id: g.group_id,
            name: g.name,
            creator_id: g.creator_id,
        })
        .collect();
    Ok(Json(groups))
}

/// Group metadata plus member list. Members only; anyone else sees the
/// same 404 as a missing group.
pub async fn get_group(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let db = state.db.clone();
    let gid = group_id.clone();
    let (group, members) = tokio::task::spawn_blocking(move || {
        let group = db.find_group_by_group_id(&gid)?;
        let members = db.list_members(&gid)?;
        anyhow::Ok((group, members))
    })
    .await
    .map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let group = group.ok_or(StatusCode::NOT_FOUND)?;
    if !members.iter().any(|m| m.user_id == claims.sub) {
        return Err(StatusCode::NOT_FOUND);
    }

    Ok(Json(GroupDetail {
        group_id: group.group_id,
        name: group.name,
        creator_id: group.creator_id,
        created_at: group.created_at,
        members: members
            .into_iter()
            .map(|m| UserSummary {
                id: m.user_id,
                name: m.name,
            })
            .collect(),
    }))
}

/// Group message history, read through the schema shim's fallback path
/// on legacy deployments.
pub async fn get_group_messages(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let db = state.db.clone();
    let user_id = claims.sub;
    let gid = group_id.clone();
    let rows = tokio::task::spawn_blocking(move || {
        let member = db
            .list_members(&gid)?
            .iter()
            .any(|m| m.user_id == user_id);
        if !member {
            return anyhow::Ok(None);
        }
        let rows = db.list_messages_by_room(&gid, Some(true), HISTORY_LIMIT)?;
        anyhow::Ok(Some(rows))
    })
    .await
    .map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let rows = rows.ok_or(StatusCode::NOT_FOUND)?;
    let messages: Vec<MessageResponse> = rows.into_iter().map(message_response).collect();
    Ok(Json(messages))
}

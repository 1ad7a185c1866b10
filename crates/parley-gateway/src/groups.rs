//! Membership synchronizer and group lifecycle.
//!
//! The persisted membership table is the authority for who belongs to a
//! group; broadcast-group composition mirrors it for the connections that
//! are currently online. On identification a connection is joined to one
//! broadcast group per persisted membership before its group list is
//! emitted.

use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use parley_db::{Database, models::GroupRow};
use parley_types::events::GatewayEvent;
use parley_types::models::GroupInfo;

use crate::dispatcher::Dispatcher;
use crate::error::GatewayError;
use crate::with_store;

fn group_info(row: &GroupRow) -> GroupInfo {
    GroupInfo {
        group_id: row.group_id.clone(),
        name: row.name.clone(),
        creator_id: row.creator_id,
    }
}

/// Load a user's persisted memberships and join the connection to each
/// corresponding broadcast group. Returns the group list for emission.
/// All joins are applied before this returns; a group message racing the
/// sync is still covered by the pipeline's lazy re-join.
pub async fn sync_memberships(
    dispatcher: &Dispatcher,
    db: &Arc<Database>,
    conn_id: Uuid,
    user_id: i64,
) -> anyhow::Result<Vec<GroupInfo>> {
    let rows = with_store(db, move |db| db.list_groups_for_user(user_id)).await?;
    for row in &rows {
        dispatcher.join_room(&row.group_id, conn_id).await;
    }
    Ok(rows.iter().map(group_info).collect())
}

/// Re-load the group list and emit it to the requesting connection.
pub async fn request_groups(
    dispatcher: &Dispatcher,
    db: &Arc<Database>,
    conn_id: Uuid,
    user_id: i64,
) -> Result<(), GatewayError> {
    let groups = sync_memberships(dispatcher, db, conn_id, user_id).await?;
    dispatcher
        .send_to_conn(conn_id, GatewayEvent::GroupList { groups })
        .await;
    Ok(())
}

/// Create a group: persist the group row and one membership row per
/// distinct invited user (the creator is always included), join the
/// online members' connections, and notify the new broadcast group.
///
/// The multi-step persist is not atomic: a failure after the group row
/// commits leaves an orphaned group behind. That is logged and left for
/// manual cleanup.
pub async fn create_group(
    dispatcher: &Dispatcher,
    db: &Arc<Database>,
    conn_id: Uuid,
    user_id: i64,
    user_name: &str,
    group_name: String,
    member_ids: Vec<i64>,
) -> Result<(), GatewayError> {
    let group_id = Uuid::new_v4().to_string();

    let mut members = vec![user_id];
    for id in member_ids {
        if !members.contains(&id) {
            members.push(id);
        }
    }

    {
        let group_id = group_id.clone();
        let group_name = group_name.clone();
        let members = members.clone();
        with_store(db, move |db| {
            db.insert_group(&group_name, user_id, &group_id)?;
            for uid in &members {
                db.insert_membership(&group_id, *uid)?;
            }
            Ok(())
        })
        .await?;
    }

    dispatcher.join_room(&group_id, conn_id).await;
    for uid in members.iter().filter(|&&uid| uid != user_id) {
        dispatcher.join_user(&group_id, *uid).await;
    }

    info!("{} ({}) created group {} ({})", user_name, user_id, group_name, group_id);

    let group = GroupInfo {
        group_id: group_id.clone(),
        name: group_name.clone(),
        creator_id: user_id,
    };
    dispatcher
        .send_to_room(&group_id, GatewayEvent::GroupCreated { group })
        .await;
    dispatcher
        .send_to_room(
            &group_id,
            GatewayEvent::GroupNotice {
                group_id: group_id.clone(),
                text: format!("{user_name} created the group {group_name}"),
            },
        )
        .await;

    Ok(())
}

/// Add members to a group. Creator-only; fails silently to the caller
/// with no side effects on authorization or lookup failure.
pub async fn add_members(
    dispatcher: &Dispatcher,
    db: &Arc<Database>,
    user_id: i64,
    group_id: String,
    user_ids: Vec<i64>,
) -> Result<(), GatewayError> {
    let group = find_group(db, &group_id).await?;
    if group.creator_id != user_id {
        return Err(GatewayError::Unauthorized);
    }

    // Resolve names up front so an unknown user aborts before any insert
    let added = {
        let user_ids = user_ids.clone();
        with_store(db, move |db| {
            let mut added = Vec::with_capacity(user_ids.len());
            for uid in user_ids {
                match db.find_user_by_id(uid)? {
                    Some(user) => added.push((uid, user.name)),
                    None => return Ok(None),
                }
            }
            Ok(Some(added))
        })
        .await?
        .ok_or(GatewayError::NotFound)?
    };

    {
        let group_id = group_id.clone();
        let ids: Vec<i64> = added.iter().map(|(id, _)| *id).collect();
        with_store(db, move |db| {
            // Duplicate membership is an upsert, not an error
            for uid in ids {
                db.insert_membership(&group_id, uid)?;
            }
            Ok(())
        })
        .await?;
    }

    let info = group_info(&group);
    for (uid, uname) in &added {
        dispatcher.join_user(&group_id, *uid).await;
        dispatcher
            .send_to_user(
                *uid,
                GatewayEvent::GroupCreated { group: info.clone() },
            )
            .await;
        dispatcher
            .send_to_room(
                &group_id,
                GatewayEvent::GroupNotice {
                    group_id: group_id.clone(),
                    text: format!("{uname} was added to {}", group.name),
                },
            )
            .await;
    }
    dispatcher
        .send_to_room(
            &group_id,
            GatewayEvent::MembersAdded {
                group: info,
                user_ids: added.iter().map(|(id, _)| *id).collect(),
            },
        )
        .await;

    Ok(())
}

/// Remove a member from a group. Creator-only, same silent-failure
/// pattern as add_members.
pub async fn remove_member(
    dispatcher: &Dispatcher,
    db: &Arc<Database>,
    user_id: i64,
    group_id: String,
    target_id: i64,
) -> Result<(), GatewayError> {
    let group = find_group(db, &group_id).await?;
    if group.creator_id != user_id {
        return Err(GatewayError::Unauthorized);
    }

    let target = {
        with_store(db, move |db| db.find_user_by_id(target_id)).await?
    }
    .ok_or(GatewayError::NotFound)?;

    let removed = {
        let group_id = group_id.clone();
        with_store(db, move |db| db.delete_membership(&group_id, target_id)).await?
    };
    if !removed {
        warn!("{} is not a member of {}", target_id, group_id);
        return Err(GatewayError::NotFound);
    }

    dispatcher.remove_user_from_room(&group_id, target_id).await;
    dispatcher
        .send_to_user(
            target_id,
            GatewayEvent::MemberRemoved {
                group_id: group_id.clone(),
                user_id: target_id,
            },
        )
        .await;
    dispatcher
        .send_to_room(
            &group_id,
            GatewayEvent::MemberRemoved {
                group_id: group_id.clone(),
                user_id: target_id,
            },
        )
        .await;
    dispatcher
        .send_to_room(
            &group_id,
            GatewayEvent::GroupNotice {
                group_id: group_id.clone(),
                text: format!("{} was removed from {}", target.name, group.name),
            },
        )
        .await;

    Ok(())
}

/// Leave a group (self-service). When the last member leaves, the group
/// row is deleted and the broadcast group dropped.
pub async fn leave_group(
    dispatcher: &Dispatcher,
    db: &Arc<Database>,
    user_id: i64,
    user_name: &str,
    group_id: String,
) -> Result<(), GatewayError> {
    let group = find_group(db, &group_id).await?;

    let removed = {
        let group_id = group_id.clone();
        with_store(db, move |db| db.delete_membership(&group_id, user_id)).await?
    };
    // A non-member "leaving" has nothing to announce
    if !removed {
        warn!("{} ({}) left {} without being a member", user_name, user_id, group_id);
        return Err(GatewayError::NotFound);
    }
    dispatcher.remove_user_from_room(&group_id, user_id).await;

    dispatcher
        .send_to_room(
            &group_id,
            GatewayEvent::GroupNotice {
                group_id: group_id.clone(),
                text: format!("{user_name} left {}", group.name),
            },
        )
        .await;

    let remaining = {
        let group_id = group_id.clone();
        with_store(db, move |db| db.count_members(&group_id)).await?
    };
    if remaining == 0 {
        info!("group {} ({}) is empty, deleting", group.name, group_id);
        {
            let group_id = group_id.clone();
            with_store(db, move |db| db.delete_group_by_group_id(&group_id)).await?;
        }
        dispatcher.drop_room(&group_id).await;
    }

    Ok(())
}

async fn find_group(db: &Arc<Database>, group_id: &str) -> Result<GroupRow, GatewayError> {
    let gid = group_id.to_string();
    with_store(db, move |db| db.find_group_by_group_id(&gid))
        .await?
        .ok_or_else(|| {
            warn!("group not found: {}", group_id);
            GatewayError::NotFound
        })
}

//! Message pipeline: persist-then-fan-out for group messages, best-effort
//! persistence for direct messages, stateless typing indicators.

use std::sync::Arc;

use tracing::error;
use uuid::Uuid;

use parley_db::Database;
use parley_types::events::GatewayEvent;
use parley_types::rooms;

use crate::dispatcher::Dispatcher;
use crate::with_store;

/// Direct message: persist into the deterministic private room, then
/// deliver regardless of the persistence outcome. A store failure means
/// the message is missing from history but still arrives live; the ack
/// carries a null id so the sender can tell.
pub async fn direct_message(
    dispatcher: &Dispatcher,
    db: &Arc<Database>,
    conn_id: Uuid,
    from_user_id: i64,
    from_name: &str,
    to_user_id: i64,
    content: String,
) {
    let room_id = rooms::private_room_token(from_user_id, to_user_id);

    let persisted = {
        let room_id = room_id.clone();
        let content = content.clone();
        with_store(db, move |db| {
            db.insert_message(from_user_id, &content, &room_id, false)
        })
        .await
    };
    let message_id = match persisted {
        Ok(id) => Some(id),
        Err(e) => {
            error!("failed to persist direct message in {}: {:#}", room_id, e);
            None
        }
    };

    dispatcher
        .send_to_user(
            to_user_id,
            GatewayEvent::DirectMessage {
                id: message_id,
                room_id: room_id.clone(),
                from_user_id,
                from_name: from_name.to_string(),
                content,
                created_at: chrono::Utc::now(),
            },
        )
        .await;

    dispatcher
        .send_to_conn(conn_id, GatewayEvent::MessageAck { message_id, room_id })
        .await;
}

/// Group message: persist first (through the schema shim), broadcast to
/// the group's live connections only on success. The sender is re-joined
/// to the broadcast group up front — self-healing against a message that
/// races the membership sync on identification. Persisted membership is
/// the authority for who receives the broadcast, not an authorization
/// gate on sending.
pub async fn group_message(
    dispatcher: &Dispatcher,
    db: &Arc<Database>,
    conn_id: Uuid,
    user_id: i64,
    name: &str,
    group_id: String,
    content: String,
) {
    dispatcher.join_room(&group_id, conn_id).await;

    let persisted = {
        let group_id = group_id.clone();
        let content = content.clone();
        with_store(db, move |db| {
            db.insert_message(user_id, &content, &group_id, true)
        })
        .await
    };

    match persisted {
        Ok(id) => {
            dispatcher
                .send_to_room(
                    &group_id,
                    GatewayEvent::GroupMessage {
                        id,
                        group_id: group_id.clone(),
                        user_id,
                        name: name.to_string(),
                        content,
                        created_at: chrono::Utc::now(),
                    },
                )
                .await;
        }
        Err(e) => {
            error!(
                "failed to persist group message in {}: {:#} -- dropping broadcast",
                group_id, e
            );
        }
    }
}

/// Typing indicator: never persisted, routed to the recipient's
/// connections if online, silently dropped otherwise.
pub async fn typing(
    dispatcher: &Dispatcher,
    user_id: i64,
    name: &str,
    to_user_id: i64,
    is_typing: bool,
) {
    dispatcher
        .send_to_user(
            to_user_id,
            GatewayEvent::Typing {
                user_id,
                name: name.to_string(),
                is_typing,
            },
        )
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::groups;

    fn test_db() -> Arc<Database> {
        Arc::new(Database::open_in_memory().unwrap())
    }

    fn seed_user(db: &Database, name: &str) -> i64 {
        db.create_user(name, &format!("{name}@example.com"), "hash")
            .unwrap()
    }

    #[tokio::test]
    async fn direct_message_persists_delivers_and_acks() {
        let db = test_db();
        let ann = seed_user(&db, "ann");
        let bo = seed_user(&db, "bo");

        let d = Dispatcher::new();
        let (ca, mut rx_ann) = d.register(ann, "ann".into()).await;
        let (_, mut rx_bo) = d.register(bo, "bo".into()).await;

        direct_message(&d, &db, ca, ann, "ann", bo, "hi".into()).await;

        let delivered = rx_bo.try_recv().unwrap();
        let GatewayEvent::DirectMessage { id, room_id, content, .. } = delivered else {
            panic!("expected DirectMessage, got {delivered:?}");
        };
        assert_eq!(room_id, rooms::private_room_token(bo, ann));
        assert_eq!(content, "hi");
        let id = id.expect("persisted id");

        let ack = rx_ann.try_recv().unwrap();
        let GatewayEvent::MessageAck { message_id, .. } = ack else {
            panic!("expected MessageAck, got {ack:?}");
        };
        assert_eq!(message_id, Some(id));

        let rows = db
            .list_messages_by_room(&rooms::private_room_token(ann, bo), None, 100)
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert!(!rows[0].is_group);
    }

    #[tokio::test]
    async fn direct_message_still_delivered_when_persist_fails() {
        let db = test_db();
        let ann = seed_user(&db, "ann");
        let bo = seed_user(&db, "bo");
        // Break the messages table so every insert fails
        db.with_conn(|conn| {
            conn.execute("DROP TABLE messages", [])?;
            Ok(())
        })
        .unwrap();

        let d = Dispatcher::new();
        let (ca, mut rx_ann) = d.register(ann, "ann".into()).await;
        let (_, mut rx_bo) = d.register(bo, "bo".into()).await;

        direct_message(&d, &db, ca, ann, "ann", bo, "hi".into()).await;

        let GatewayEvent::DirectMessage { id, .. } = rx_bo.try_recv().unwrap() else {
            panic!("expected live delivery despite persist failure");
        };
        assert_eq!(id, None);
        let GatewayEvent::MessageAck { message_id, .. } = rx_ann.try_recv().unwrap() else {
            panic!("expected ack");
        };
        assert_eq!(message_id, None);
    }

    #[tokio::test]
    async fn group_message_reaches_online_joined_members_only() {
        let db = test_db();
        let a = seed_user(&db, "a");
        let b = seed_user(&db, "b");
        let c = seed_user(&db, "c");

        let d = Dispatcher::new();
        let (ca, mut rx_a) = d.register(a, "a".into()).await;
        let (cb, mut rx_b) = d.register(b, "b".into()).await;
        // c is persisted as a member but offline
        let (_, mut rx_other) = d.register(99, "lurker".into()).await;

        db.insert_group("Team", a, "g-1").unwrap();
        for uid in [a, b, c] {
            db.insert_membership("g-1", uid).unwrap();
        }
        d.join_room("g-1", ca).await;
        d.join_room("g-1", cb).await;

        group_message(&d, &db, ca, a, "a", "g-1".into(), "yo".into()).await;

        for rx in [&mut rx_a, &mut rx_b] {
            let GatewayEvent::GroupMessage { group_id, content, .. } = rx.try_recv().unwrap()
            else {
                panic!("expected GroupMessage");
            };
            assert_eq!(group_id, "g-1");
            assert_eq!(content, "yo");
        }
        assert!(rx_other.try_recv().is_err());

        let rows = db.list_messages_by_room("g-1", Some(true), 100).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].room_id, "g-1");
    }

    #[tokio::test]
    async fn group_message_rejoins_sender_lazily() {
        let db = test_db();
        let a = seed_user(&db, "a");
        db.insert_group("Team", a, "g-1").unwrap();
        db.insert_membership("g-1", a).unwrap();

        let d = Dispatcher::new();
        // Sender identified but membership sync hasn't joined them yet
        let (ca, mut rx_a) = d.register(a, "a".into()).await;
        assert!(!d.in_room("g-1", ca).await);

        group_message(&d, &db, ca, a, "a", "g-1".into(), "early".into()).await;

        assert!(d.in_room("g-1", ca).await);
        assert!(matches!(
            rx_a.try_recv().unwrap(),
            GatewayEvent::GroupMessage { .. }
        ));
    }

    #[tokio::test]
    async fn group_message_not_broadcast_on_store_failure() {
        let db = test_db();
        let a = seed_user(&db, "a");
        db.with_conn(|conn| {
            conn.execute("DROP TABLE messages", [])?;
            Ok(())
        })
        .unwrap();

        let d = Dispatcher::new();
        let (ca, mut rx_a) = d.register(a, "a".into()).await;
        d.join_room("g-1", ca).await;

        group_message(&d, &db, ca, a, "a", "g-1".into(), "lost".into()).await;

        assert!(rx_a.try_recv().is_err(), "no broadcast without a persisted row");
    }

    #[tokio::test]
    async fn group_message_persists_through_legacy_schema() {
        let db = test_db();
        let a = seed_user(&db, "a");
        db.with_conn(|conn| {
            conn.execute("ALTER TABLE messages DROP COLUMN is_group", [])?;
            Ok(())
        })
        .unwrap();

        let d = Dispatcher::new();
        let (ca, mut rx_a) = d.register(a, "a".into()).await;
        d.join_room("g-1", ca).await;

        group_message(&d, &db, ca, a, "a", "g-1".into(), "compat".into()).await;

        let GatewayEvent::GroupMessage { id, .. } = rx_a.try_recv().unwrap() else {
            panic!("expected broadcast after fallback persist");
        };
        assert!(id > 0);
    }

    #[tokio::test]
    async fn typing_routed_to_recipient_only() {
        let db = test_db();
        let ann = seed_user(&db, "ann");
        let bo = seed_user(&db, "bo");

        let d = Dispatcher::new();
        let (_, mut rx_ann) = d.register(ann, "ann".into()).await;
        let (_, mut rx_bo) = d.register(bo, "bo".into()).await;

        typing(&d, ann, "ann", bo, true).await;

        assert!(matches!(
            rx_bo.try_recv().unwrap(),
            GatewayEvent::Typing { is_typing: true, .. }
        ));
        assert!(rx_ann.try_recv().is_err());

        // Offline recipient: silently dropped
        typing(&d, ann, "ann", 12345, true).await;
    }

    #[tokio::test]
    async fn scenario_ann_and_bo_exchange_hi() {
        let db = test_db();
        // Force specific ids 5 and 9
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, name, email, password) VALUES (5, 'Ann', 'ann@x', 'h')",
                [],
            )?;
            conn.execute(
                "INSERT INTO users (id, name, email, password) VALUES (9, 'Bo', 'bo@x', 'h')",
                [],
            )?;
            Ok(())
        })
        .unwrap();

        let d = Dispatcher::new();
        let (ca, _rx_ann) = d.register(5, "Ann".into()).await;
        let (_, _rx_bo) = d.register(9, "Bo".into()).await;

        direct_message(&d, &db, ca, 5, "Ann", 9, "hi".into()).await;

        for room in [
            rooms::private_room_token(5, 9),
            rooms::private_room_token(9, 5),
        ] {
            let rows = db.list_messages_by_room(&room, None, 100).unwrap();
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0].room_id, "private_5_9");
            assert!(!rows[0].is_group);
        }
    }

    // groups.rs has no tests module of its own; lifecycle coverage lives
    // here next to the pipeline tests since they share the same harness.

    #[tokio::test]
    async fn create_group_memberships_and_notifications() {
        let db = test_db();
        let creator = seed_user(&db, "ann");
        let online = seed_user(&db, "bo");
        let offline = seed_user(&db, "cy");

        let d = Dispatcher::new();
        let (ca, mut rx_creator) = d.register(creator, "ann".into()).await;
        let (cb, mut rx_online) = d.register(online, "bo".into()).await;

        groups::create_group(
            &d,
            &db,
            ca,
            creator,
            "ann",
            "Team".into(),
            // Creator omitted from the invite list on purpose
            vec![online, offline, online],
        )
        .await
        .unwrap();

        // Exactly one membership row per distinct user
        let groups_of = |uid| db.list_groups_for_user(uid).unwrap();
        assert_eq!(groups_of(creator).len(), 1);
        assert_eq!(groups_of(online).len(), 1);
        assert_eq!(groups_of(offline).len(), 1);
        let group_id = groups_of(creator)[0].group_id.clone();
        assert_eq!(db.count_members(&group_id).unwrap(), 3);

        // Online invitee was joined and notified immediately
        assert!(d.in_room(&group_id, cb).await);
        assert!(matches!(
            rx_online.try_recv().unwrap(),
            GatewayEvent::GroupCreated { .. }
        ));
        assert!(matches!(
            rx_creator.try_recv().unwrap(),
            GatewayEvent::GroupCreated { .. }
        ));

        // Offline invitee gets their membership on next identification
        let (cc, _rx) = d.register(offline, "cy".into()).await;
        let listed = groups::sync_memberships(&d, &db, cc, offline).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "Team");
        assert!(d.in_room(&group_id, cc).await);
    }

    #[tokio::test]
    async fn add_members_is_creator_only_and_silent() {
        let db = test_db();
        let creator = seed_user(&db, "ann");
        let outsider = seed_user(&db, "mallory");
        let invitee = seed_user(&db, "bo");
        db.insert_group("Team", creator, "g-1").unwrap();
        db.insert_membership("g-1", creator).unwrap();

        let d = Dispatcher::new();

        let err = groups::add_members(&d, &db, outsider, "g-1".into(), vec![invitee])
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::GatewayError::Unauthorized));
        // No side effects
        assert_eq!(db.count_members("g-1").unwrap(), 1);

        let err = groups::add_members(&d, &db, creator, "missing".into(), vec![invitee])
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::GatewayError::NotFound));

        groups::add_members(&d, &db, creator, "g-1".into(), vec![invitee])
            .await
            .unwrap();
        assert_eq!(db.count_members("g-1").unwrap(), 2);

        // Adding again is an upsert, not an error
        groups::add_members(&d, &db, creator, "g-1".into(), vec![invitee])
            .await
            .unwrap();
        assert_eq!(db.count_members("g-1").unwrap(), 2);
    }

    #[tokio::test]
    async fn remove_member_forces_out_of_broadcast_group() {
        let db = test_db();
        let creator = seed_user(&db, "ann");
        let target = seed_user(&db, "bo");
        db.insert_group("Team", creator, "g-1").unwrap();
        db.insert_membership("g-1", creator).unwrap();
        db.insert_membership("g-1", target).unwrap();

        let d = Dispatcher::new();
        let (ca, _rx_a) = d.register(creator, "ann".into()).await;
        let (cb, mut rx_b) = d.register(target, "bo".into()).await;
        d.join_room("g-1", ca).await;
        d.join_room("g-1", cb).await;

        groups::remove_member(&d, &db, creator, "g-1".into(), target)
            .await
            .unwrap();

        assert_eq!(db.count_members("g-1").unwrap(), 1);
        assert!(!d.in_room("g-1", cb).await);
        assert!(matches!(
            rx_b.try_recv().unwrap(),
            GatewayEvent::MemberRemoved { .. }
        ));
    }

    #[tokio::test]
    async fn last_member_leaving_deletes_the_group() {
        let db = test_db();
        let a = seed_user(&db, "ann");
        let b = seed_user(&db, "bo");
        db.insert_group("Team", a, "g-1").unwrap();
        db.insert_membership("g-1", a).unwrap();
        db.insert_membership("g-1", b).unwrap();

        let d = Dispatcher::new();
        let (ca, _rx_a) = d.register(a, "ann".into()).await;
        d.join_room("g-1", ca).await;

        groups::leave_group(&d, &db, a, "ann", "g-1".into()).await.unwrap();
        assert!(db.find_group_by_group_id("g-1").unwrap().is_some());

        groups::leave_group(&d, &db, b, "bo", "g-1".into()).await.unwrap();
        assert!(db.find_group_by_group_id("g-1").unwrap().is_none());
        assert_eq!(db.count_members("g-1").unwrap(), 0);
    }

    #[tokio::test]
    async fn leave_by_non_member_announces_nothing() {
        let db = test_db();
        let member = seed_user(&db, "ann");
        let outsider = seed_user(&db, "mallory");
        db.insert_group("Team", member, "g-1").unwrap();
        db.insert_membership("g-1", member).unwrap();

        let d = Dispatcher::new();
        let (ca, mut rx_member) = d.register(member, "ann".into()).await;
        d.join_room("g-1", ca).await;

        let err = groups::leave_group(&d, &db, outsider, "mallory", "g-1".into())
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::GatewayError::NotFound));

        // No departure notice for someone who was never a member,
        // and the group is untouched
        assert!(rx_member.try_recv().is_err());
        assert_eq!(db.count_members("g-1").unwrap(), 1);
        assert!(db.find_group_by_group_id("g-1").unwrap().is_some());
    }
}

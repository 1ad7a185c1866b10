use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{RwLock, broadcast, mpsc};
use uuid::Uuid;

use parley_types::events::GatewayEvent;

/// One live transport session tracked by the registry.
struct ConnectionEntry {
    user_id: i64,
    name: String,
    tx: mpsc::UnboundedSender<GatewayEvent>,
}

/// The single in-process authority for "who is online right now" and for
/// broadcast-group composition. Manages all connected clients and routes
/// events to them.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// Broadcast channel for global events (presence changes) — every
    /// connected client receives these
    broadcast_tx: broadcast::Sender<GatewayEvent>,

    /// Connection registry: conn_id -> entry. A user with several devices
    /// holds several entries; the registry never deduplicates by user.
    connections: RwLock<HashMap<Uuid, ConnectionEntry>>,

    /// Broadcast groups: group token -> connections currently joined
    rooms: RwLock<HashMap<String, HashSet<Uuid>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(DispatcherInner {
                broadcast_tx,
                connections: RwLock::new(HashMap::new()),
                rooms: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Subscribe to global events. Returns a broadcast receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.inner.broadcast_tx.subscribe()
    }

    /// Broadcast a global event to all connected clients.
    pub fn broadcast(&self, event: GatewayEvent) {
        let _ = self.inner.broadcast_tx.send(event);
    }

    /// Register an identified connection. Returns the connection id and
    /// the receiver half of its targeted event channel. Announces the
    /// user online only when this is their first live connection, the
    /// mirror of disconnect announcing offline only after the last one.
    pub async fn register(
        &self,
        user_id: i64,
        name: String,
    ) -> (Uuid, mpsc::UnboundedReceiver<GatewayEvent>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        let first = {
            let mut connections = self.inner.connections.write().await;
            let first = !connections.values().any(|e| e.user_id == user_id);
            connections.insert(
                conn_id,
                ConnectionEntry {
                    user_id,
                    name: name.clone(),
                    tx,
                },
            );
            first
        };
        if first {
            self.broadcast(GatewayEvent::PresenceUpdate {
                user_id,
                name,
                online: true,
            });
        }
        (conn_id, rx)
    }

    /// Remove a connection: drops the registry entry, leaves every
    /// broadcast group, and announces the user offline if this was their
    /// last connection. No-op for an unknown conn_id.
    pub async fn disconnect(&self, conn_id: Uuid) {
        let entry = self.inner.connections.write().await.remove(&conn_id);
        let Some(entry) = entry else { return };

        let mut rooms = self.inner.rooms.write().await;
        for members in rooms.values_mut() {
            members.remove(&conn_id);
        }
        drop(rooms);

        let last = !self.is_online(entry.user_id).await;
        if last {
            self.broadcast(GatewayEvent::PresenceUpdate {
                user_id: entry.user_id,
                name: entry.name,
                online: false,
            });
        }
    }

    /// Snapshot of online users, deduplicated by user id.
    pub async fn online_users(&self) -> Vec<(i64, String)> {
        let connections = self.inner.connections.read().await;
        let mut seen: HashMap<i64, String> = HashMap::new();
        for entry in connections.values() {
            seen.entry(entry.user_id).or_insert_with(|| entry.name.clone());
        }
        seen.into_iter().collect()
    }

    pub async fn is_online(&self, user_id: i64) -> bool {
        self.inner
            .connections
            .read()
            .await
            .values()
            .any(|e| e.user_id == user_id)
    }

    /// Send a targeted event to one connection.
    pub async fn send_to_conn(&self, conn_id: Uuid, event: GatewayEvent) {
        let connections = self.inner.connections.read().await;
        if let Some(entry) = connections.get(&conn_id) {
            let _ = entry.tx.send(event);
        }
    }

    /// Send a targeted event to every live connection of a user
    /// (multi-device: all of the user's sessions receive it).
    pub async fn send_to_user(&self, user_id: i64, event: GatewayEvent) {
        let connections = self.inner.connections.read().await;
        for entry in connections.values() {
            if entry.user_id == user_id {
                let _ = entry.tx.send(event.clone());
            }
        }
    }

    /// Join a connection to a broadcast group. Idempotent, so it doubles
    /// as the lazy re-join used by the message pipeline.
    pub async fn join_room(&self, group_id: &str, conn_id: Uuid) {
        self.inner
            .rooms
            .write()
            .await
            .entry(group_id.to_string())
            .or_default()
            .insert(conn_id);
    }

    /// Join every live connection of a user to a broadcast group.
    pub async fn join_user(&self, group_id: &str, user_id: i64) {
        let conn_ids: Vec<Uuid> = {
            let connections = self.inner.connections.read().await;
            connections
                .iter()
                .filter(|(_, e)| e.user_id == user_id)
                .map(|(id, _)| *id)
                .collect()
        };
        if conn_ids.is_empty() {
            return;
        }
        let mut rooms = self.inner.rooms.write().await;
        let members = rooms.entry(group_id.to_string()).or_default();
        for id in conn_ids {
            members.insert(id);
        }
    }

    /// Forcibly remove every connection of a user from a broadcast group.
    /// Lock order is rooms before connections, same as send_to_room.
    pub async fn remove_user_from_room(&self, group_id: &str, user_id: i64) {
        let mut rooms = self.inner.rooms.write().await;
        let connections = self.inner.connections.read().await;
        if let Some(members) = rooms.get_mut(group_id) {
            members.retain(|conn_id| {
                connections
                    .get(conn_id)
                    .is_none_or(|e| e.user_id != user_id)
            });
        }
    }

    /// Drop a broadcast group entirely (the persisted group was deleted).
    pub async fn drop_room(&self, group_id: &str) {
        self.inner.rooms.write().await.remove(group_id);
    }

    /// Fan an event out to every connection currently joined to a group,
    /// the sender included.
    pub async fn send_to_room(&self, group_id: &str, event: GatewayEvent) {
        let rooms = self.inner.rooms.read().await;
        let Some(members) = rooms.get(group_id) else {
            return;
        };
        let connections = self.inner.connections.read().await;
        for conn_id in members {
            if let Some(entry) = connections.get(conn_id) {
                let _ = entry.tx.send(event.clone());
            }
        }
    }

    /// Whether a connection is currently joined to a group.
    pub async fn in_room(&self, group_id: &str, conn_id: Uuid) -> bool {
        self.inner
            .rooms
            .read()
            .await
            .get(group_id)
            .is_some_and(|members| members.contains(&conn_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notice(text: &str) -> GatewayEvent {
        GatewayEvent::GroupNotice {
            group_id: "g".into(),
            text: text.into(),
        }
    }

    fn notice_text(event: GatewayEvent) -> String {
        match event {
            GatewayEvent::GroupNotice { text, .. } => text,
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_to_user_reaches_every_device() {
        let d = Dispatcher::new();
        let (_, mut rx_a) = d.register(1, "ann".into()).await;
        let (_, mut rx_b) = d.register(1, "ann".into()).await;
        let (_, mut rx_other) = d.register(2, "bo".into()).await;

        d.send_to_user(1, notice("hi")).await;

        assert_eq!(notice_text(rx_a.try_recv().unwrap()), "hi");
        assert_eq!(notice_text(rx_b.try_recv().unwrap()), "hi");
        assert!(rx_other.try_recv().is_err());
    }

    #[tokio::test]
    async fn room_fanout_hits_joined_connections_only() {
        let d = Dispatcher::new();
        let (ca, mut rx_a) = d.register(1, "ann".into()).await;
        let (cb, mut rx_b) = d.register(2, "bo".into()).await;
        let (_, mut rx_c) = d.register(3, "cy".into()).await;

        d.join_room("g", ca).await;
        d.join_room("g", cb).await;
        d.send_to_room("g", notice("hello")).await;

        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
        assert!(rx_c.try_recv().is_err());
    }

    #[tokio::test]
    async fn join_room_is_idempotent() {
        let d = Dispatcher::new();
        let (ca, mut rx_a) = d.register(1, "ann".into()).await;

        d.join_room("g", ca).await;
        d.join_room("g", ca).await;
        d.send_to_room("g", notice("once")).await;

        assert!(rx_a.try_recv().is_ok());
        assert!(rx_a.try_recv().is_err(), "duplicate join must not duplicate delivery");
    }

    #[tokio::test]
    async fn forced_removal_covers_all_devices() {
        let d = Dispatcher::new();
        let (ca, mut rx_a) = d.register(1, "ann".into()).await;
        let (cb, mut rx_b) = d.register(1, "ann".into()).await;
        d.join_room("g", ca).await;
        d.join_room("g", cb).await;

        d.remove_user_from_room("g", 1).await;
        d.send_to_room("g", notice("gone")).await;

        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn online_broadcast_only_for_first_connection() {
        let d = Dispatcher::new();
        let mut events = d.subscribe();

        let (_, _rx_a) = d.register(1, "ann".into()).await;
        match events.try_recv().unwrap() {
            GatewayEvent::PresenceUpdate { user_id, online, .. } => {
                assert_eq!(user_id, 1);
                assert!(online);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        // Second device of the same user must not re-announce
        let (_, _rx_b) = d.register(1, "ann".into()).await;
        assert!(events.try_recv().is_err(), "second device must not re-announce");

        let (_, _rx_c) = d.register(2, "bo".into()).await;
        match events.try_recv().unwrap() {
            GatewayEvent::PresenceUpdate { user_id, online, .. } => {
                assert_eq!(user_id, 2);
                assert!(online);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn offline_broadcast_only_after_last_connection() {
        let d = Dispatcher::new();
        let (ca, _rx_a) = d.register(1, "ann".into()).await;
        let (cb, _rx_b) = d.register(1, "ann".into()).await;
        let mut events = d.subscribe();

        d.disconnect(ca).await;
        assert!(d.is_online(1).await);
        assert!(events.try_recv().is_err(), "first device leaving is not offline");

        d.disconnect(cb).await;
        assert!(!d.is_online(1).await);
        match events.try_recv().unwrap() {
            GatewayEvent::PresenceUpdate { user_id, online, .. } => {
                assert_eq!(user_id, 1);
                assert!(!online);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn disconnect_leaves_rooms() {
        let d = Dispatcher::new();
        let (ca, _rx) = d.register(1, "ann".into()).await;
        d.join_room("g", ca).await;

        d.disconnect(ca).await;
        assert!(!d.in_room("g", ca).await);
    }

    #[tokio::test]
    async fn online_snapshot_deduplicates_users() {
        let d = Dispatcher::new();
        let (_, _rx_a) = d.register(1, "ann".into()).await;
        let (_, _rx_b) = d.register(1, "ann".into()).await;
        let (_, _rx_c) = d.register(2, "bo".into()).await;

        let mut online = d.online_users().await;
        online.sort();
        assert_eq!(online, vec![(1, "ann".to_string()), (2, "bo".to_string())]);
    }
}

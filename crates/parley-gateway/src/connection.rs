use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tracing::{error, info, warn};
use uuid::Uuid;

use parley_db::Database;
use parley_types::events::{GatewayCommand, GatewayEvent};

use crate::dispatcher::Dispatcher;
use crate::error::GatewayError;
use crate::{groups, pipeline};

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped —
/// this is the liveness check that clears registry entries when the
/// transport never signals a disconnect.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Handle a single WebSocket connection. The first frame must be an
/// Identify command carrying the JWT issued at login; identity is taken
/// from the token claims, never from client-supplied ids.
pub async fn handle_connection(
    socket: WebSocket,
    dispatcher: Dispatcher,
    db: Arc<Database>,
    jwt_secret: String,
) {
    let (mut sender, mut receiver) = socket.split();

    let (user_id, name) = match wait_for_identify(&mut receiver, &jwt_secret).await {
        Some(id) => id,
        None => {
            warn!("WebSocket client failed to identify, closing");
            return;
        }
    };

    info!("{} ({}) connected to gateway", name, user_id);

    // Presence snapshot is taken before this connection registers so it
    // lists everyone already here.
    let existing_users = dispatcher.online_users().await;
    let (conn_id, mut user_rx) = dispatcher.register(user_id, name.clone()).await;

    let ready = GatewayEvent::Ready {
        user_id,
        name: name.clone(),
    };
    if send_event(&mut sender, &ready).await.is_err() {
        dispatcher.disconnect(conn_id).await;
        return;
    }

    for (uid, uname) in &existing_users {
        let event = GatewayEvent::PresenceUpdate {
            user_id: *uid,
            name: uname.clone(),
            online: true,
        };
        if send_event(&mut sender, &event).await.is_err() {
            dispatcher.disconnect(conn_id).await;
            return;
        }
    }

    let mut broadcast_rx = dispatcher.subscribe();

    // Membership sync: join every persisted group before handling any
    // command from this connection, then emit the group list.
    match groups::sync_memberships(&dispatcher, &db, conn_id, user_id).await {
        Ok(list) => {
            let event = GatewayEvent::GroupList { groups: list };
            if send_event(&mut sender, &event).await.is_err() {
                dispatcher.disconnect(conn_id).await;
                return;
            }
        }
        Err(e) => error!("membership sync failed for {} ({}): {:#}", name, user_id, e),
    }

    let dispatcher_clone = dispatcher.clone();

    // Shared flag for heartbeat
    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward targeted events + global broadcasts -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = user_rx.recv() => {
                    let event = match result {
                        Some(event) => event,
                        None => break,
                    };
                    if send_event(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
                result = broadcast_rx.recv() => {
                    let event = match result {
                        Ok(event) => event,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Broadcast receiver lagged by {} events", n);
                            continue;
                        }
                        Err(_) => break,
                    };
                    if send_event(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from client
    let name_recv = name.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(cmd) => {
                        handle_command(
                            &dispatcher_clone,
                            &db,
                            conn_id,
                            user_id,
                            &name_recv,
                            cmd,
                        )
                        .await;
                    }
                    Err(e) => {
                        warn!(
                            "{} ({}) bad command: {} -- raw: {}",
                            name_recv,
                            user_id,
                            e,
                            log_preview(&text)
                        );
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    dispatcher.disconnect(conn_id).await;
    info!("{} ({}) disconnected from gateway", name, user_id);
}

/// Truncate client-supplied text for logging. Counts characters, not
/// bytes, so a cut never lands inside a multibyte UTF-8 sequence.
fn log_preview(text: &str) -> String {
    text.chars().take(200).collect()
}

async fn send_event(
    sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    event: &GatewayEvent,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(event)
        .map_err(axum::Error::new)?;
    sender.send(Message::Text(text.into())).await
}

async fn wait_for_identify(
    receiver: &mut futures_util::stream::SplitStream<WebSocket>,
    jwt_secret: &str,
) -> Option<(i64, String)> {
    use jsonwebtoken::{DecodingKey, Validation, decode};
    use parley_types::api::Claims;

    let timeout = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                if let Ok(GatewayCommand::Identify { token }) =
                    serde_json::from_str::<GatewayCommand>(&text)
                {
                    let token_data = decode::<Claims>(
                        &token,
                        &DecodingKey::from_secret(jwt_secret.as_bytes()),
                        &Validation::default(),
                    )
                    .ok()?;

                    return Some((token_data.claims.sub, token_data.claims.name));
                }
            }
        }
        None
    });

    timeout.await.ok().flatten()
}

/// Route one command to its handler. A failing command is logged and
/// swallowed — it must never take down the connection loop or leak a
/// partial result to the caller.
async fn handle_command(
    dispatcher: &Dispatcher,
    db: &Arc<Database>,
    conn_id: Uuid,
    user_id: i64,
    name: &str,
    cmd: GatewayCommand,
) {
    match cmd {
        GatewayCommand::Identify { .. } => {} // Already handled

        GatewayCommand::DirectMessage { to_user_id, content } => {
            pipeline::direct_message(dispatcher, db, conn_id, user_id, name, to_user_id, content)
                .await;
        }

        GatewayCommand::Typing { to_user_id, is_typing } => {
            pipeline::typing(dispatcher, user_id, name, to_user_id, is_typing).await;
        }

        GatewayCommand::GroupMessage { group_id, content } => {
            pipeline::group_message(dispatcher, db, conn_id, user_id, name, group_id, content)
                .await;
        }

        GatewayCommand::CreateGroup { name: group_name, member_ids } => {
            log_outcome(
                "create-group",
                user_id,
                groups::create_group(
                    dispatcher, db, conn_id, user_id, name, group_name, member_ids,
                )
                .await,
            );
        }

        GatewayCommand::AddMembers { group_id, user_ids } => {
            log_outcome(
                "add-members",
                user_id,
                groups::add_members(dispatcher, db, user_id, group_id, user_ids).await,
            );
        }

        GatewayCommand::RemoveMember { group_id, user_id: target } => {
            log_outcome(
                "remove-member",
                user_id,
                groups::remove_member(dispatcher, db, user_id, group_id, target).await,
            );
        }

        GatewayCommand::LeaveGroup { group_id } => {
            log_outcome(
                "leave-group",
                user_id,
                groups::leave_group(dispatcher, db, user_id, name, group_id).await,
            );
        }

        GatewayCommand::RequestGroups => {
            log_outcome(
                "request-groups",
                user_id,
                groups::request_groups(dispatcher, db, conn_id, user_id).await,
            );
        }
    }
}

fn log_outcome(op: &str, user_id: i64, result: Result<(), GatewayError>) {
    match result {
        Ok(()) => {}
        // Silent to the caller by design; the log is the only trace
        Err(e @ (GatewayError::Unauthorized | GatewayError::NotFound)) => {
            warn!("{} by {} rejected: {}", op, user_id, e);
        }
        Err(GatewayError::Store(e)) => {
            error!("{} by {} failed: {:#}", op, user_id, e);
        }
    }
}

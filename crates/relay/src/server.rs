use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

use hail_common::config::RelayConfig;
use hail_common::ids::new_message_id;
use hail_protocol::{
    envelope, ClientHello, Envelope, RideStatus, RideUpdate, ServerError, ServerHello,
    ServerNotice, ServerWelcome,
};

use crate::dispatch;
use crate::state::{ClientHandle, RelayState};

const SERVER_VERSION: &str = "0.1";
pub const PEER_DISCONNECTED_REASON: &str = "peer disconnected";

pub struct RelayServer {
    config: RelayConfig,
    state: Arc<RwLock<RelayState>>,
}

impl RelayServer {
    pub fn new(config: RelayConfig, state: Arc<RwLock<RelayState>>) -> Self {
        Self { config, state }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!("relay listening on {}", self.config.bind_addr);
        loop {
            let (stream, addr) = listener.accept().await?;
            let conn_id = uuid::Uuid::new_v4().to_string();
            info!("conn {conn_id} accepted from {addr}");
            let state = Arc::clone(&self.state);
            let config = self.config.clone();
            tokio::spawn(async move {
                if let Err(err) = handle_connection(stream, state, config, conn_id.clone()).await {
                    warn!("conn {conn_id} error: {err}");
                }
            });
        }
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    state: Arc<RwLock<RelayState>>,
    config: RelayConfig,
    conn_id: String,
) -> anyhow::Result<()> {
    let ws_stream = accept_async(stream).await?;
    let (mut ws_write, mut ws_read) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_write.send(msg).await.is_err() {
                break;
            }
        }
    });

    send_envelope(
        &tx,
        "server:hello",
        &ServerHello {
            server_version: SERVER_VERSION.to_string(),
        },
    )?;

    let mut registered: Option<ClientHello> = None;

    while let Some(msg) = ws_read.next().await {
        let msg = msg?;
        if !msg.is_text() {
            continue;
        }
        let env: Envelope = match serde_json::from_str(msg.to_text()?) {
            Ok(env) => env,
            Err(err) => {
                send_error(&tx, "invalid_payload", &format!("bad envelope: {err}"), None)?;
                continue;
            }
        };

        if registered.is_none() {
            if env.message_type != "client:hello" {
                send_error(&tx, "invalid_command", "expected client:hello", Some(&env.id))?;
                warn!("conn {conn_id} sent {} before hello", env.message_type);
                break;
            }
            let hello: ClientHello = match serde_json::from_value(env.payload) {
                Ok(hello) => hello,
                Err(err) => {
                    send_error(&tx, "invalid_payload", &err.to_string(), Some(&env.id))?;
                    break;
                }
            };
            let mut state_guard = state.write().await;
            state_guard
                .registry
                .register(&hello.identifier, hello.kind, &conn_id);
            state_guard.clients.insert(
                conn_id.clone(),
                ClientHandle {
                    conn_id: conn_id.clone(),
                    identifier: hello.identifier.clone(),
                    kind: hello.kind,
                    tx: tx.clone(),
                },
            );
            drop(state_guard);

            send_envelope(
                &tx,
                "server:welcome",
                &ServerWelcome {
                    session_id: uuid::Uuid::new_v4().to_string(),
                    identifier: hello.identifier.clone(),
                    kind: hello.kind,
                },
            )?;
            info!("conn {conn_id} registered as {} {}", hello.kind, hello.identifier);
            registered = Some(hello);
            continue;
        }

        match env.message_type.as_str() {
            "driver:location" => match serde_json::from_value(env.payload) {
                Ok(payload) => {
                    dispatch::handle_driver_location(payload, &state, &tx, &env.id).await?;
                }
                Err(err) => send_error(&tx, "invalid_payload", &err.to_string(), Some(&env.id))?,
            },
            "ride:request" => {
                let raw = env.payload.clone();
                match serde_json::from_value(env.payload) {
                    Ok(payload) => {
                        dispatch::handle_ride_request(
                            payload, raw, &conn_id, &state, &config, &tx, &env.id,
                        )
                        .await?;
                    }
                    Err(err) => {
                        send_error(&tx, "invalid_payload", &err.to_string(), Some(&env.id))?
                    }
                }
            }
            "ride:accept" => match serde_json::from_value(env.payload) {
                Ok(payload) => {
                    dispatch::handle_ride_accept(payload, &conn_id, &state, &tx, &env.id).await?;
                }
                Err(err) => send_error(&tx, "invalid_payload", &err.to_string(), Some(&env.id))?,
            },
            "ride:status" => match serde_json::from_value(env.payload) {
                Ok(payload) => {
                    dispatch::handle_ride_status(payload, &state, &tx, &env.id).await?;
                }
                Err(err) => send_error(&tx, "invalid_payload", &err.to_string(), Some(&env.id))?,
            },
            "ride:cancel" => match serde_json::from_value(env.payload) {
                Ok(payload) => {
                    dispatch::handle_ride_cancel(payload, &state, &tx, &env.id).await?;
                }
                Err(err) => send_error(&tx, "invalid_payload", &err.to_string(), Some(&env.id))?,
            },
            "client:heartbeat" => send_notice(&tx, "pong")?,
            _ => {
                send_error(&tx, "invalid_command", "unknown message type", Some(&env.id))?;
                warn!("conn {conn_id} sent unknown message type {}", env.message_type);
            }
        }
    }

    if let Some(hello) = registered {
        let mut state_guard = state.write().await;
        reconcile_disconnect(&mut state_guard, &conn_id)?;
        drop(state_guard);
        info!("conn {conn_id} ({} {}) disconnected", hello.kind, hello.identifier);
    } else {
        info!("conn {conn_id} closed before hello");
    }

    writer.abort();
    Ok(())
}

/// Disconnect reconciliation: forget the actor, then cancel every ride the
/// connection was a party to, notifying only the counterparty.
pub fn reconcile_disconnect(state: &mut RelayState, conn_id: &str) -> anyhow::Result<()> {
    let Some(handle) = state.clients.remove(conn_id) else {
        return Ok(());
    };
    // a newer connection may have taken over the identifier; leave it alone
    let owns_entry = state
        .registry
        .get(handle.kind, &handle.identifier)
        .map(|actor| actor.conn_id == conn_id)
        .unwrap_or(false);
    if owns_entry {
        state.registry.deregister(handle.kind, &handle.identifier);
    }

    for ride in state.rides.find_by_connection(conn_id) {
        let counterparty = if ride.passenger_conn == conn_id {
            ride.driver_conn.clone()
        } else {
            Some(ride.passenger_conn.clone())
        };
        if let Some(other_conn) = counterparty {
            if let Some(other) = state.clients.get(&other_conn) {
                let update = RideUpdate {
                    ride_id: ride.ride_id.clone(),
                    status: RideStatus::Cancelled,
                    driver_id: ride.driver_id.clone(),
                    driver_location: None,
                    reason: Some(PEER_DISCONNECTED_REASON.to_string()),
                };
                send_envelope(&other.tx, "ride:update", &update)?;
            }
        }
        if let Some(driver_id) = &ride.driver_id {
            state.registry.set_availability(driver_id, true);
        }
        state.rides.remove(&ride.ride_id);
        info!("ride {} cancelled: {}", ride.ride_id, PEER_DISCONNECTED_REASON);
    }
    Ok(())
}

pub(crate) fn send_envelope<T: serde::Serialize>(
    tx: &mpsc::UnboundedSender<Message>,
    message_type: &str,
    payload: &T,
) -> anyhow::Result<()> {
    let env = envelope(message_type, &new_message_id(), now_ms(), payload)?;
    let text = serde_json::to_string(&env)?;
    tx.send(Message::Text(text))?;
    Ok(())
}

pub(crate) fn send_error(
    tx: &mpsc::UnboundedSender<Message>,
    code: &str,
    message: &str,
    ref_id: Option<&str>,
) -> anyhow::Result<()> {
    let payload = ServerError {
        code: code.to_string(),
        message: message.to_string(),
        ref_id: ref_id.map(|id| id.to_string()),
    };
    send_envelope(tx, "server:error", &payload)
}

pub(crate) fn send_notice(tx: &mpsc::UnboundedSender<Message>, text: &str) -> anyhow::Result<()> {
    let payload = ServerNotice {
        text: text.to_string(),
    };
    send_envelope(tx, "server:notice", &payload)
}

pub(crate) fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    duration.as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use hail_geo::LatLng;
    use hail_protocol::ActorKind;

    struct TestConn {
        conn_id: String,
        rx: mpsc::UnboundedReceiver<Message>,
    }

    impl TestConn {
        fn next_envelope(&mut self) -> Option<Envelope> {
            match self.rx.try_recv() {
                Ok(Message::Text(text)) => serde_json::from_str(&text).ok(),
                _ => None,
            }
        }
    }

    fn connect(state: &mut RelayState, id: &str, kind: ActorKind) -> TestConn {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn_id = format!("conn-{id}");
        state.registry.register(id, kind, &conn_id);
        state.clients.insert(
            conn_id.clone(),
            ClientHandle {
                conn_id: conn_id.clone(),
                identifier: id.to_string(),
                kind,
                tx,
            },
        );
        TestConn { conn_id, rx }
    }

    fn accepted_ride(state: &mut RelayState, passenger: &TestConn, driver: &TestConn) {
        state
            .rides
            .create("r1", "p1", &passenger.conn_id, serde_json::json!({}), 0)
            .expect("create");
        state.rides.assign_driver("r1", "d1", &driver.conn_id);
        state.registry.set_availability("d1", false);
    }

    #[test]
    fn passenger_disconnect_cancels_the_ride_and_frees_the_driver() {
        let mut state = RelayState::new();
        let mut driver = connect(&mut state, "d1", ActorKind::Driver);
        state
            .registry
            .update_location("d1", LatLng { lat: 0.0, lng: 0.0 }, None, None);
        let passenger = connect(&mut state, "p1", ActorKind::Passenger);
        accepted_ride(&mut state, &passenger, &driver);

        reconcile_disconnect(&mut state, &passenger.conn_id).expect("reconcile");

        let env = driver.next_envelope().expect("cancel notice");
        assert_eq!(env.message_type, "ride:update");
        let update: RideUpdate = serde_json::from_value(env.payload).expect("payload");
        assert_eq!(update.status, RideStatus::Cancelled);
        assert_eq!(update.reason.as_deref(), Some(PEER_DISCONNECTED_REASON));

        assert!(state.rides.get("r1").is_none());
        let d1 = state.registry.get(ActorKind::Driver, "d1").expect("driver");
        assert!(d1.available);
        assert!(state.clients.get(&passenger.conn_id).is_none());
    }

    #[test]
    fn driver_disconnect_notifies_only_the_passenger() {
        let mut state = RelayState::new();
        let driver = connect(&mut state, "d1", ActorKind::Driver);
        let mut passenger = connect(&mut state, "p1", ActorKind::Passenger);
        let mut bystander = connect(&mut state, "p2", ActorKind::Passenger);
        accepted_ride(&mut state, &passenger, &driver);

        reconcile_disconnect(&mut state, &driver.conn_id).expect("reconcile");

        let env = passenger.next_envelope().expect("cancel notice");
        let update: RideUpdate = serde_json::from_value(env.payload).expect("payload");
        assert_eq!(update.status, RideStatus::Cancelled);
        assert!(bystander.next_envelope().is_none());
        assert!(state.rides.get("r1").is_none());
        assert!(state.registry.get(ActorKind::Driver, "d1").is_none());
    }

    #[test]
    fn stale_disconnect_leaves_a_newer_registration_alone() {
        let mut state = RelayState::new();
        let old = connect(&mut state, "d1", ActorKind::Driver);
        // same identifier reconnects before the old connection is reaped
        let (tx, _rx) = mpsc::unbounded_channel();
        state.registry.register("d1", ActorKind::Driver, "conn-new");
        state.clients.insert(
            "conn-new".to_string(),
            ClientHandle {
                conn_id: "conn-new".to_string(),
                identifier: "d1".to_string(),
                kind: ActorKind::Driver,
                tx,
            },
        );

        reconcile_disconnect(&mut state, &old.conn_id).expect("reconcile");

        let actor = state
            .registry
            .get(ActorKind::Driver, "d1")
            .expect("still registered");
        assert_eq!(actor.conn_id, "conn-new");
    }

    #[test]
    fn disconnect_of_unknown_connection_is_a_noop() {
        let mut state = RelayState::new();
        reconcile_disconnect(&mut state, "conn-ghost").expect("reconcile");
        assert_eq!(state.rides.active_count(), 0);
    }
}

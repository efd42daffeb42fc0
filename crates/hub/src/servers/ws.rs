//! Websocket endpoint shared by both listeners.
//!
//! Flow:
//! 1. Client connects to `GET /ws` declaring `Sec-WebSocket-Protocol:
//!    node` or `gui`.
//! 2. Hub pushes `server-info` immediately.
//! 3. Bidirectional loop: one reader dispatching in order, one writer
//!    task owning the sink, ping control frames every 10 seconds.
//! 4. On disconnect of an identified node, its devices are flagged
//!    offline and the change is broadcast.

use std::collections::HashMap;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Extension;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use hearth_domain::{Connection, Device, DeviceList, Node, SavedStateStore};
use hearth_protocol::{types, Message, ServerInfo, SigningRequest, StateChange};

use crate::logic::RuleSet;
use crate::scheduler::TaskList;
use crate::servers::PeerIdentity;
use crate::sessions::{Session, ROLE_GUI, ROLE_NODE};
use crate::state::AppState;

const PING_PERIOD: Duration = Duration::from_secs(10);
/// A healthy peer pongs every ping, so silence this long means the
/// connection is half-open and the session is torn down.
const READ_DEADLINE: Duration = Duration::from_secs(15);
const OUTBOUND_QUEUE: usize = 64;

/// GET /ws — upgrade. The declared subprotocol picks the session role.
pub async fn upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Extension(peer): Extension<PeerIdentity>,
    headers: HeaderMap,
) -> Response {
    let Some(role) = declared_role(&headers) else {
        return (
            StatusCode::BAD_REQUEST,
            "Sec-WebSocket-Protocol must be node or gui",
        )
            .into_response();
    };

    ws.protocols([ROLE_NODE, ROLE_GUI])
        .on_upgrade(move |socket| handle_socket(socket, state, peer, role))
        .into_response()
}

fn declared_role(headers: &HeaderMap) -> Option<String> {
    let header = headers.get(header::SEC_WEBSOCKET_PROTOCOL)?.to_str().ok()?;
    header
        .split(',')
        .map(str::trim)
        .find(|p| *p == ROLE_NODE || *p == ROLE_GUI)
        .map(str::to_string)
}

async fn handle_socket(socket: WebSocket, state: AppState, peer: PeerIdentity, role: String) {
    let session_id = Uuid::new_v4().to_string();
    let (outbound_tx, outbound_rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);

    let mut attributes = HashMap::new();
    attributes.insert("secure".to_string(), serde_json::Value::Bool(peer.secure));

    state.sessions.register(Session {
        connection: Connection {
            id: session_id.clone(),
            connection_type: role.clone(),
            remote_addr: peer.remote_addr.clone(),
            attributes,
        },
        node_uuid: peer.node_uuid,
        subscriptions: Default::default(),
        sink: outbound_tx.clone(),
    });
    if let Some(uuid) = &peer.node_uuid {
        state.store.set_node_connected(&uuid.to_string(), true);
    }
    broadcast_snapshot(&state, types::CONNECTIONS);

    // server-info goes out before anything else; the bootstrap flow
    // depends on it.
    let info = ServerInfo {
        name: state.config.name.clone(),
        uuid: state.config.uuid.clone(),
        port: state.config.port,
        tls_port: state.config.tls_port,
    };
    match Message::new(types::SERVER_INFO, &info) {
        Ok(msg) => send(&outbound_tx, msg).await,
        Err(e) => tracing::error!(error = %e, "failed to encode server-info"),
    }

    let (ws_sink, mut ws_stream) = socket.split();
    let writer = tokio::spawn(write_pump(ws_sink, outbound_rx));

    loop {
        let frame = match tokio::time::timeout(READ_DEADLINE, ws_stream.next()).await {
            Ok(Some(Ok(frame))) => frame,
            Ok(_) => break,
            Err(_) => {
                tracing::warn!(session = %session_id, "read deadline lapsed, dropping connection");
                break;
            }
        };
        match frame {
            WsMessage::Text(text) => match Message::parse(&text) {
                Ok(msg) => dispatch(&state, &session_id, &peer, &role, msg, &outbound_tx).await,
                Err(e) => {
                    tracing::debug!(session = %session_id, error = %e, "ignoring unparseable frame");
                }
            },
            WsMessage::Close(_) => break,
            // axum answers pings itself; pongs need no action.
            WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Binary(_) => {}
        }
    }

    writer.abort();
    state.sessions.remove(&session_id);
    if role == ROLE_NODE {
        if let Some(uuid) = &peer.node_uuid {
            let flagged = state.store.node_disconnected(&uuid.to_string());
            tracing::info!(node = %uuid, devices_offline = flagged, "node disconnected");
            if flagged > 0 {
                broadcast_snapshot(&state, types::DEVICES);
            }
            broadcast_snapshot(&state, types::NODES);
        }
    }
    broadcast_snapshot(&state, types::CONNECTIONS);
}

/// Writer task: the only place that touches the sink. Interleaves
/// queued envelopes with keepalive pings.
async fn write_pump(
    mut sink: SplitSink<WebSocket, WsMessage>,
    mut outbound: mpsc::Receiver<Message>,
) {
    let mut ping = tokio::time::interval(PING_PERIOD);
    ping.tick().await;
    loop {
        tokio::select! {
            msg = outbound.recv() => {
                let Some(msg) = msg else { break };
                let text = match msg.encode() {
                    Ok(t) => t,
                    Err(e) => {
                        tracing::error!(error = %e, "failed to encode outbound message");
                        continue;
                    }
                };
                if sink.send(WsMessage::Text(text)).await.is_err() {
                    break;
                }
            }
            _ = ping.tick() => {
                if sink.send(WsMessage::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn dispatch(
    state: &AppState,
    session_id: &str,
    peer: &PeerIdentity,
    role: &str,
    msg: Message,
    reply: &mpsc::Sender<Message>,
) {
    let request = msg.request;
    match msg.message_type.as_str() {
        // Mutations are the secure listener's business; the insecure
        // one exists for bootstrap only.
        types::STATE_CHANGE
        | types::UPDATE_RULES
        | types::UPDATE_SCHEDULE
        | types::UPDATE_SAVEDSTATES
        | types::SETUP_NODE
            if !peer.secure =>
        {
            tracing::warn!(
                session = %session_id,
                remote = %peer.remote_addr,
                message_type = %msg.message_type,
                "rejecting mutation on the insecure listener"
            );
            ack_err(reply, request, "not permitted on the insecure listener").await;
        }
        types::CERTIFICATE_SIGNING_REQUEST => {
            handle_csr(state, peer, &msg, reply).await;
        }
        types::UPDATE_NODE => {
            let Some(uuid) = peer.node_uuid else {
                tracing::warn!(session = %session_id, "update-node without client certificate");
                return;
            };
            let mut node: Node = match msg.decode() {
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!(session = %session_id, error = %e, "bad update-node body");
                    return;
                }
            };
            // Identity comes from the certificate, never the payload.
            node.uuid = uuid.to_string();
            node.connected = true;
            match state.store.update_node(node) {
                Ok(merged) => {
                    tracing::info!(node = %merged.uuid, node_type = %merged.node_type, "node announced");
                    match Message::new(types::SETUP, &merged) {
                        Ok(setup) => send(reply, setup).await,
                        Err(e) => tracing::error!(error = %e, "failed to encode setup"),
                    }
                    broadcast_snapshot(state, types::NODES);
                }
                Err(e) => {
                    tracing::error!(node = %uuid, error = %e, "failed to persist node");
                }
            }
        }
        types::UPDATE_DEVICE => {
            let Some(uuid) = peer.node_uuid else {
                tracing::warn!(session = %session_id, "update-device without client certificate");
                return;
            };
            let mut device: Device = match msg.decode() {
                Ok(d) => d,
                Err(e) => {
                    tracing::warn!(session = %session_id, error = %e, "bad update-device body");
                    return;
                }
            };
            device.id.node = uuid.to_string();
            if state.store.add_or_update_device(device) {
                devices_changed(state);
            }
        }
        types::UPDATE_DEVICES => {
            let Some(uuid) = peer.node_uuid else {
                tracing::warn!(session = %session_id, "update-devices without client certificate");
                return;
            };
            let list: DeviceList = match msg.decode() {
                Ok(l) => l,
                Err(e) => {
                    tracing::warn!(session = %session_id, error = %e, "bad update-devices body");
                    return;
                }
            };
            let mut changed = false;
            for (_, device) in list.iter() {
                let mut device = device.clone();
                device.id.node = uuid.to_string();
                changed |= state.store.add_or_update_device(device);
            }
            if changed {
                devices_changed(state);
            }
        }
        types::STATE_CHANGE => {
            let change: StateChange = match msg.decode() {
                Ok(c) => c,
                Err(e) => {
                    ack_err(reply, request, &format!("bad state-change body: {e}")).await;
                    return;
                }
            };
            relay_state_change(state, &change).await;
            ack_ok(reply, request).await;
        }
        types::SUBSCRIBE => {
            let topics: Vec<String> = match msg.decode() {
                Ok(t) => t,
                Err(e) => {
                    tracing::warn!(session = %session_id, error = %e, "bad subscribe body");
                    return;
                }
            };
            state.sessions.subscribe(session_id, topics.clone());
            // An immediate snapshot per topic, so a fresh gui renders
            // without waiting for the next mutation.
            for topic in &topics {
                if let Some(snapshot) = snapshot(state, topic) {
                    send(reply, snapshot).await;
                }
            }
        }
        types::UPDATE_RULES => {
            let ruleset: RuleSet = match msg.decode() {
                Ok(r) => r,
                Err(e) => {
                    ack_err(reply, request, &format!("bad rules body: {e}")).await;
                    return;
                }
            };
            state.logic.replace(ruleset);
            match state.save_rules() {
                Ok(()) => {
                    broadcast_snapshot(state, types::RULES);
                    // New rules judge the current state right away.
                    state.logic.evaluate(&state.store.devices());
                    ack_ok(reply, request).await;
                }
                Err(e) => ack_err(reply, request, &e.to_string()).await,
            }
        }
        types::UPDATE_SCHEDULE => {
            let tasks: TaskList = match msg.decode() {
                Ok(t) => t,
                Err(e) => {
                    ack_err(reply, request, &format!("bad schedule body: {e}")).await;
                    return;
                }
            };
            state.scheduler.replace(tasks);
            match state.save_schedule() {
                Ok(()) => {
                    broadcast_snapshot(state, types::SCHEDULE);
                    ack_ok(reply, request).await;
                }
                Err(e) => ack_err(reply, request, &e.to_string()).await,
            }
        }
        types::UPDATE_SAVEDSTATES => {
            let states: SavedStateStore = match msg.decode() {
                Ok(s) => s,
                Err(e) => {
                    ack_err(reply, request, &format!("bad savedstates body: {e}")).await;
                    return;
                }
            };
            match state.store.replace_savedstates(states) {
                Ok(()) => {
                    broadcast_snapshot(state, types::SAVEDSTATES);
                    ack_ok(reply, request).await;
                }
                Err(e) => ack_err(reply, request, &e.to_string()).await,
            }
        }
        types::SETUP_NODE => {
            let edit: Node = match msg.decode() {
                Ok(n) => n,
                Err(e) => {
                    ack_err(reply, request, &format!("bad setup-node body: {e}")).await;
                    return;
                }
            };
            match state.store.set_node_config(&edit.uuid, edit.config) {
                Ok(Some(updated)) => {
                    // The edited node learns its new config right away,
                    // if it is connected.
                    if let Ok(node_uuid) = Uuid::parse_str(&updated.uuid) {
                        match Message::new(types::SETUP, &updated) {
                            Ok(setup) => {
                                if let Err(e) =
                                    state.sessions.send_to_node(&node_uuid, &setup).await
                                {
                                    tracing::debug!(node = %node_uuid, error = %e, "setup not delivered");
                                }
                            }
                            Err(e) => tracing::error!(error = %e, "failed to encode setup"),
                        }
                    }
                    broadcast_snapshot(state, types::NODES);
                    ack_ok(reply, request).await;
                }
                Ok(None) => {
                    ack_err(reply, request, &format!("unknown node {}", edit.uuid)).await;
                }
                Err(e) => ack_err(reply, request, &e.to_string()).await,
            }
        }
        other => {
            tracing::debug!(session = %session_id, role, message_type = %other, "unhandled message type");
        }
    }
}

/// Sign a CSR and hand back the certificate plus the CA root. Only
/// meaningful on the insecure listener; a secure session already has an
/// identity.
async fn handle_csr(
    state: &AppState,
    peer: &PeerIdentity,
    msg: &Message,
    reply: &mpsc::Sender<Message>,
) {
    if peer.secure {
        tracing::warn!(remote = %peer.remote_addr, "ignoring CSR on a secure session");
        return;
    }
    let request: SigningRequest = match msg.decode() {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(remote = %peer.remote_addr, error = %e, "bad signing request body");
            return;
        }
    };
    let signed = match state.ca.sign_request(&request.csr) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(remote = %peer.remote_addr, error = %e, "refusing to sign CSR");
            ack_err(reply, msg.request, &e.to_string()).await;
            return;
        }
    };
    tracing::info!(
        node = %signed.uuid,
        node_type = %request.node_type,
        "issued certificate"
    );
    match Message::new(types::APPROVED_CSR, &signed.cert_pem) {
        Ok(m) => send(reply, m).await,
        Err(e) => {
            tracing::error!(error = %e, "failed to encode approved certificate");
            return;
        }
    }
    match Message::new(types::CERTIFICATE_AUTHORITY, &state.ca.ca_cert_pem()) {
        Ok(m) => send(reply, m).await,
        Err(e) => tracing::error!(error = %e, "failed to encode certificate authority"),
    }
}

/// Relay a state-change to each owning node (one message per node) and
/// merge it locally so rules and gui sessions track the intent without
/// waiting for the nodes to report back.
async fn relay_state_change(state: &AppState, change: &StateChange) {
    let mut per_node: HashMap<String, StateChange> = HashMap::new();
    for (id, device_state) in change {
        per_node
            .entry(id.node.clone())
            .or_default()
            .insert(id.clone(), device_state.clone());
    }

    for (node, node_change) in &per_node {
        let Ok(node_uuid) = Uuid::parse_str(node) else {
            tracing::warn!(node = %node, "state-change targets a non-uuid node");
            continue;
        };
        let msg = match Message::new(types::STATE_CHANGE, node_change) {
            Ok(m) => m,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode state-change");
                continue;
            }
        };
        if let Err(e) = state.sessions.send_to_node(&node_uuid, &msg).await {
            tracing::warn!(node = %node, error = %e, "state-change not delivered");
        }
    }

    if !state.store.sync_state(change).is_empty() {
        devices_changed(state);
    }
}

/// A device-state mutation happened: tell subscribed sessions and give
/// the rule engine its evaluation pass.
fn devices_changed(state: &AppState) {
    let devices = state.store.devices();
    match Message::new(types::DEVICES, &devices) {
        Ok(msg) => state.sessions.broadcast(&msg),
        Err(e) => tracing::error!(error = %e, "failed to encode devices broadcast"),
    }
    state.logic.evaluate(&devices);
}

fn snapshot(state: &AppState, topic: &str) -> Option<Message> {
    let result = match topic {
        types::DEVICES => Message::new(types::DEVICES, &state.store.devices()),
        types::NODES => Message::new(types::NODES, &state.store.nodes()),
        types::CONNECTIONS => Message::new(types::CONNECTIONS, &state.sessions.connections()),
        types::RULES => Message::new(types::RULES, &state.logic.ruleset()),
        types::SCHEDULE => Message::new(types::SCHEDULE, &state.scheduler.tasks()),
        types::SAVEDSTATES => Message::new(types::SAVEDSTATES, &state.store.savedstates()),
        _ => return None,
    };
    match result {
        Ok(msg) => Some(msg),
        Err(e) => {
            tracing::error!(topic, error = %e, "failed to encode snapshot");
            None
        }
    }
}

fn broadcast_snapshot(state: &AppState, topic: &str) {
    if let Some(msg) = snapshot(state, topic) {
        state.sessions.broadcast(&msg);
    }
}

async fn send(tx: &mpsc::Sender<Message>, msg: Message) {
    if tx.send(msg).await.is_err() {
        tracing::debug!("session gone before reply could be queued");
    }
}

async fn ack_ok(reply: &mpsc::Sender<Message>, request: Option<u64>) {
    if let Some(id) = request {
        send(reply, Message::empty(types::SUCCESS).with_request(id)).await;
    }
}

async fn ack_err(reply: &mpsc::Sender<Message>, request: Option<u64>, error: &str) {
    if let Some(id) = request {
        match Message::new(types::FAILURE, &error) {
            Ok(msg) => send(reply, msg.with_request(id)).await,
            Err(e) => tracing::error!(error = %e, "failed to encode failure reply"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::{Rule, RuleSet};
    use hearth_domain::HubConfig;

    fn test_state(dir: &std::path::Path) -> AppState {
        let config = HubConfig {
            name: "test-hub".into(),
            uuid: Uuid::new_v4().to_string(),
            host: "127.0.0.1".into(),
            port: 0,
            tls_port: 0,
            timezone: "UTC".into(),
        };
        AppState::with_config(dir, config).unwrap()
    }

    fn peer(secure: bool) -> PeerIdentity {
        PeerIdentity {
            node_uuid: None,
            remote_addr: "127.0.0.1:9".into(),
            secure,
        }
    }

    fn rules_edit() -> Message {
        let mut ruleset = RuleSet::default();
        ruleset.rules.insert(
            "r1".into(),
            Rule {
                name: "test rule".into(),
                uuid: "r1".into(),
                enabled: true,
                ..Default::default()
            },
        );
        Message::new(types::UPDATE_RULES, &ruleset)
            .unwrap()
            .with_request(1)
    }

    #[tokio::test]
    async fn insecure_sessions_cannot_mutate() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let (tx, mut rx) = mpsc::channel(8);

        dispatch(&state, "s1", &peer(false), ROLE_GUI, rules_edit(), &tx).await;

        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.message_type, types::FAILURE);
        assert_eq!(reply.request, Some(1));
        assert!(state.logic.ruleset().rules.is_empty());
    }

    #[tokio::test]
    async fn secure_sessions_edit_rules_with_an_ack() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let (tx, mut rx) = mpsc::channel(8);

        dispatch(&state, "s1", &peer(true), ROLE_GUI, rules_edit(), &tx).await;

        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.message_type, types::SUCCESS);
        assert!(state.logic.ruleset().rules.contains_key("r1"));
        assert!(dir.path().join("rules.json").exists());
    }

    #[tokio::test]
    async fn setup_node_stores_config_and_pushes_setup() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let node_uuid = Uuid::new_v4();

        state
            .store
            .update_node(Node {
                uuid: node_uuid.to_string(),
                node_type: "example".into(),
                name: "Example".into(),
                connected: true,
                ..Default::default()
            })
            .unwrap();
        let (node_tx, mut node_rx) = mpsc::channel(8);
        state.sessions.register(Session {
            connection: Connection {
                id: "node-session".into(),
                connection_type: ROLE_NODE.into(),
                remote_addr: "127.0.0.1:9".into(),
                attributes: Default::default(),
            },
            node_uuid: Some(node_uuid),
            subscriptions: Default::default(),
            sink: node_tx,
        });

        let edit = Node {
            uuid: node_uuid.to_string(),
            config: HashMap::from([("interval".to_string(), "30".to_string())]),
            ..Default::default()
        };
        let msg = Message::new(types::SETUP_NODE, &edit).unwrap().with_request(2);
        let (gui_tx, mut gui_rx) = mpsc::channel(8);
        dispatch(&state, "s1", &peer(true), ROLE_GUI, msg, &gui_tx).await;

        let pushed = node_rx.recv().await.unwrap();
        assert_eq!(pushed.message_type, types::SETUP);
        let pushed_node: Node = pushed.decode().unwrap();
        assert_eq!(pushed_node.config.get("interval").map(String::as_str), Some("30"));

        assert_eq!(gui_rx.recv().await.unwrap().message_type, types::SUCCESS);
        let stored = state.store.node(&node_uuid.to_string()).unwrap();
        assert_eq!(stored.config.get("interval").map(String::as_str), Some("30"));
    }

    #[tokio::test]
    async fn setup_node_for_an_unknown_node_fails() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let edit = Node {
            uuid: Uuid::new_v4().to_string(),
            ..Default::default()
        };
        let msg = Message::new(types::SETUP_NODE, &edit).unwrap().with_request(3);
        let (tx, mut rx) = mpsc::channel(8);

        dispatch(&state, "s1", &peer(true), ROLE_GUI, msg, &tx).await;

        assert_eq!(rx.recv().await.unwrap().message_type, types::FAILURE);
    }

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            value.parse().unwrap(),
        );
        headers
    }

    #[test]
    fn role_comes_from_the_declared_subprotocol() {
        assert_eq!(declared_role(&headers("node")).as_deref(), Some("node"));
        assert_eq!(declared_role(&headers("gui")).as_deref(), Some("gui"));
        assert_eq!(
            declared_role(&headers("chat, node")).as_deref(),
            Some("node")
        );
        assert_eq!(declared_role(&headers("chat")), None);
        assert_eq!(declared_role(&HeaderMap::new()), None);
    }
}

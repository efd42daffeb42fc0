//! Core node client — certificate bootstrap, secure WebSocket lifecycle,
//! device synchronization, and message dispatch via [`CallbackRegistry`].

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsFrame;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use hearth_domain::{Device, DeviceId, DeviceList, Node, State};
use hearth_protocol::{types, Message, ServerInfo, SigningRequest, StateChange};

use crate::identity::{self, HubEndpoint, Identity};
use crate::reconnect::ReconnectBackoff;
use crate::registry::CallbackRegistry;
use crate::types::{CallbackResult, NodeSdkError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long a correlated request waits for its `success`/`failure` reply.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Invoked when the hub pushes stored node configuration (`setup`).
#[async_trait::async_trait]
pub trait ConfigCallback: Send + Sync + 'static {
    async fn updated(&self, config: HashMap<String, String>) -> CallbackResult;
}

/// Invoked when the hub asks this node's devices to assume a state
/// (`state-change`). The callback drives the hardware, then reports the
/// observed result back via [`NodeHandle::update_state`].
#[async_trait::async_trait]
pub trait StateChangeCallback: Send + Sync + 'static {
    async fn requested(&self, target: State, device: Device) -> CallbackResult;
}

/// State shared between the running client and any number of handles.
pub(crate) struct Shared {
    devices: RwLock<DeviceList>,
    outbound: RwLock<Option<mpsc::Sender<WsFrame>>>,
    uuid: RwLock<Option<Uuid>>,
    config: RwLock<HashMap<String, String>>,
    on_config: RwLock<Option<Arc<dyn ConfigCallback>>>,
    on_state_change: RwLock<Option<Arc<dyn StateChangeCallback>>>,
    connected: watch::Sender<bool>,
    /// Correlated requests awaiting their `success`/`failure` reply.
    pending: Mutex<HashMap<u64, oneshot::Sender<Message>>>,
    next_request: AtomicU64,
}

impl Shared {
    pub(crate) fn new() -> Self {
        let (connected, _) = watch::channel(false);
        Self {
            devices: RwLock::new(DeviceList::new()),
            outbound: RwLock::new(None),
            uuid: RwLock::new(None),
            config: RwLock::new(HashMap::new()),
            on_config: RwLock::new(None),
            on_state_change: RwLock::new(None),
            connected,
            pending: Mutex::new(HashMap::new()),
            next_request: AtomicU64::new(1),
        }
    }

    /// Stamp every locally-registered device with the node UUID. Devices
    /// added before the first connect carry an empty owner until the
    /// identity is known.
    fn claim_devices(&self, node_uuid: &str) {
        let mut devices = self.devices.write();
        if devices.iter().all(|(id, _)| id.node == node_uuid) {
            return;
        }
        let mut claimed = DeviceList::new();
        for (_, dev) in devices.iter() {
            let mut dev = dev.clone();
            dev.id.node = node_uuid.to_string();
            claimed.add(dev);
        }
        *devices = claimed;
    }

    async fn send(&self, msg: &Message) -> Result<bool, NodeSdkError> {
        let text = msg
            .encode()
            .map_err(|e| NodeSdkError::WebSocket(format!("encode: {e}")))?;
        let Some(tx) = self.outbound.read().clone() else {
            return Ok(false);
        };
        tx.send(WsFrame::Text(text))
            .await
            .map_err(|_| NodeSdkError::NotConnected)?;
        Ok(true)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// NodeHandle — what driver code holds while the client runs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Cloneable handle for interacting with a running [`NodeClient`].
///
/// All methods are safe to call before the first connection: device
/// registrations are kept locally and synced when the secure session
/// comes up.
#[derive(Clone)]
pub struct NodeHandle {
    shared: Arc<Shared>,
}

impl NodeHandle {
    /// Register the configuration callback. Replaces any previous one.
    pub fn on_config<C: ConfigCallback>(&self, cb: C) {
        *self.shared.on_config.write() = Some(Arc::new(cb));
    }

    /// Register the state-change-request callback. Replaces any previous one.
    pub fn on_request_state_change<C: StateChangeCallback>(&self, cb: C) {
        *self.shared.on_state_change.write() = Some(Arc::new(cb));
    }

    /// The node's UUID, known once an identity has been loaded or issued.
    pub fn uuid(&self) -> Option<Uuid> {
        *self.shared.uuid.read()
    }

    /// The last configuration pushed by the hub.
    pub fn config(&self) -> HashMap<String, String> {
        self.shared.config.read().clone()
    }

    pub fn is_connected(&self) -> bool {
        *self.shared.connected.subscribe().borrow()
    }

    /// Wait until the secure session is established.
    pub async fn wait_connected(&self) {
        let mut rx = self.shared.connected.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Register or update a device. The owning-node part of the id is
    /// filled in by the SDK; callers only pick the node-local id.
    pub async fn add_or_update(&self, mut device: Device) -> Result<(), NodeSdkError> {
        if let Some(uuid) = self.uuid() {
            device.id.node = uuid.to_string();
        }
        self.shared.devices.write().add(device.clone());

        let msg = Message::new(types::UPDATE_DEVICE, &device)
            .map_err(|e| NodeSdkError::WebSocket(format!("encode device: {e}")))?;
        // Not connected is fine: the full list syncs on the next connect.
        self.shared.send(&msg).await?;
        Ok(())
    }

    /// Report new state for one of this node's devices. Only changed
    /// keys are merged; an empty diff sends nothing.
    pub async fn update_state(
        &self,
        device_id: &str,
        state: State,
    ) -> Result<(), NodeSdkError> {
        let uuid = self.uuid().ok_or(NodeSdkError::NotConnected)?;
        let id = DeviceId::new(uuid.to_string(), device_id);

        let updated = {
            let mut devices = self.shared.devices.write();
            let dev = devices
                .get_mut(&id)
                .ok_or_else(|| hearth_domain::Error::DeviceNotFound(id.clone()))?;
            let diff = dev.state.diff(&state);
            if diff.is_empty() {
                None
            } else {
                dev.state.merge_with(&diff);
                Some(dev.clone())
            }
        };

        if let Some(dev) = updated {
            let msg = Message::new(types::UPDATE_DEVICE, &dev)
                .map_err(|e| NodeSdkError::WebSocket(format!("encode device: {e}")))?;
            self.shared.send(&msg).await?;
        }
        Ok(())
    }

    /// Send a raw envelope over the current session, if any.
    pub async fn send(&self, msg: &Message) -> Result<(), NodeSdkError> {
        if !self.shared.send(msg).await? {
            return Err(NodeSdkError::NotConnected);
        }
        Ok(())
    }

    /// Send an envelope tagged with a correlation id and wait for the
    /// hub's `success` or `failure` reply. The returned message's type
    /// tells the outcome; a `failure` body carries the hub's error text.
    pub async fn request(&self, msg: Message) -> Result<Message, NodeSdkError> {
        let id = self.shared.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(id, tx);

        if let Err(e) = self.send(&msg.with_request(id)).await {
            self.shared.pending.lock().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            // Sender dropped: the session went away mid-request.
            Ok(Err(_)) => Err(NodeSdkError::NotConnected),
            Err(_) => {
                self.shared.pending.lock().remove(&id);
                Err(NodeSdkError::WebSocket(format!(
                    "request {id} timed out after {}s",
                    REQUEST_TIMEOUT.as_secs()
                )))
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// NodeClient
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A fully-configured node client ready to connect to the hub.
///
/// Create via [`NodeClientBuilder`](crate::builder::NodeClientBuilder).
pub struct NodeClient {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) data_dir: PathBuf,
    pub(crate) node_type: String,
    pub(crate) name: String,
    pub(crate) version: String,
    pub(crate) heartbeat_interval: Duration,
    pub(crate) bootstrap_timeout: Duration,
    pub(crate) reconnect_backoff: ReconnectBackoff,
    pub(crate) shared: Arc<Shared>,
}

impl NodeClient {
    /// Start a new builder.
    pub fn builder(node_type: impl Into<String>) -> crate::builder::NodeClientBuilder {
        crate::builder::NodeClientBuilder::new(node_type)
    }

    /// A handle for device registration and callbacks, usable from any task.
    pub fn handle(&self) -> NodeHandle {
        NodeHandle {
            shared: self.shared.clone(),
        }
    }

    /// Run the node client. Bootstraps a certificate if none is stored,
    /// connects to the hub over mutual TLS, and enters the message loop.
    /// On disconnection, automatically reconnects according to the
    /// [`ReconnectBackoff`] policy. A node with a stored identity and
    /// hub endpoint dials the secure port directly; the insecure
    /// `server-info` exchange only runs when either is missing.
    ///
    /// Returns only on `max_attempts` exhaustion or when the `shutdown`
    /// token is cancelled.
    pub async fn run(
        self,
        registry: CallbackRegistry,
        shutdown: CancellationToken,
    ) -> Result<(), NodeSdkError> {
        let registry = Arc::new(registry);
        let mut attempt: u32 = 0;

        loop {
            if shutdown.is_cancelled() {
                return Err(NodeSdkError::Shutdown);
            }

            let result = tokio::select! {
                r = self.connect_and_run(&registry) => r,
                _ = shutdown.cancelled() => {
                    tracing::info!(node_type = %self.node_type, "shutdown requested");
                    return Err(NodeSdkError::Shutdown);
                }
            };

            match result {
                Ok(session_established) => {
                    tracing::info!(session_established, "connection closed");
                    if session_established {
                        attempt = 0;
                    }
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "connection lost");
                }
            }

            if self.reconnect_backoff.should_give_up(attempt) {
                tracing::error!(attempts = attempt, "max reconnect attempts exhausted");
                return Err(NodeSdkError::WebSocket(format!(
                    "reconnect exhausted after {attempt} attempts"
                )));
            }

            let delay = self.reconnect_backoff.delay_for_attempt(attempt);
            tracing::info!(
                delay_ms = delay.as_millis() as u64,
                attempt = attempt + 1,
                "reconnecting"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.cancelled() => {
                    return Err(NodeSdkError::Shutdown);
                }
            }

            attempt += 1;
        }
    }

    /// Same as [`run`](Self::run), but returns a `JoinHandle` so the
    /// driver's main task can do other work.
    pub fn spawn(
        self,
        registry: CallbackRegistry,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<Result<(), NodeSdkError>> {
        tokio::spawn(async move { self.run(registry, shutdown).await })
    }

    /// Single connection lifecycle: secure session -> message loop.
    /// When no identity or hub endpoint is stored, an insecure
    /// `server-info` exchange (plus certificate bootstrap on first run)
    /// precedes the secure dial.
    ///
    /// Returns `Ok(true)` if the secure session came up before the
    /// connection closed.
    async fn connect_and_run(
        &self,
        registry: &Arc<CallbackRegistry>,
    ) -> Result<bool, anyhow::Error> {
        let stored = match Identity::load(&self.data_dir)? {
            Some(identity) => {
                HubEndpoint::load(&self.data_dir).map(|endpoint| (identity, endpoint))
            }
            None => None,
        };
        let from_disk = stored.is_some();
        let (identity, endpoint) = match stored {
            Some(pair) => pair,
            None => self.insecure_exchange().await?,
        };

        let tls = identity.client_tls_config()?;
        let url = format!("wss://{}:{}/ws", endpoint.host, endpoint.tls_port);
        tracing::info!(url = %url, uuid = %identity.uuid, "connecting secure");
        let ws = match dial(&url, Some(tls)).await {
            Ok(ws) => ws,
            Err(e) => {
                // The hub may have moved; relearn the address on the
                // next attempt.
                if from_disk {
                    HubEndpoint::forget(&self.data_dir);
                }
                return Err(e);
            }
        };

        *self.shared.uuid.write() = Some(identity.uuid);
        self.shared.claim_devices(&identity.uuid.to_string());

        let (mut sink, mut stream) = ws.split();

        // Announce ourselves, declare interests, and sync the device list.
        let node = Node {
            uuid: identity.uuid.to_string(),
            node_type: self.node_type.clone(),
            name: self.name.clone(),
            connected: true,
            version: self.version.clone(),
            config: self.shared.config.read().clone(),
        };
        sink.send(text_frame(&Message::new(types::UPDATE_NODE, &node)?))
            .await?;

        let mut topics: BTreeSet<String> =
            registry.subscriptions().into_iter().collect();
        topics.insert(types::SETUP.to_string());
        topics.insert(types::STATE_CHANGE.to_string());
        sink.send(text_frame(&Message::new(types::SUBSCRIBE, &topics)?))
            .await?;

        let devices = self.shared.devices.read().clone();
        if !devices.is_empty() {
            sink.send(text_frame(&Message::new(types::UPDATE_DEVICES, &devices)?))
                .await?;
        }

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<WsFrame>(64);
        *self.shared.outbound.write() = Some(outbound_tx.clone());
        let _ = self.shared.connected.send(true);

        // Ping task: websocket control frames keep the hub's read
        // deadline fresh.
        let ping_tx = outbound_tx.clone();
        let ping_interval = self.heartbeat_interval;
        let ping_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(ping_interval);
            interval.tick().await; // first tick fires immediately
            loop {
                interval.tick().await;
                if ping_tx.send(WsFrame::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        });

        // Writer task: the only task allowed to touch the sink.
        let writer_task = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if sink.send(frame).await.is_err() {
                    break;
                }
            }
        });

        // Reader loop: in-order dispatch of inbound envelopes. The hub
        // answers our pings, so a healthy link always produces an
        // inbound frame within the deadline; a half-open one is torn
        // down instead of lingering until the kernel notices.
        let read_deadline = self.heartbeat_interval * 3;
        loop {
            let frame = match tokio::time::timeout(read_deadline, stream.next()).await {
                Ok(Some(Ok(frame))) => frame,
                Ok(_) => break,
                Err(_) => {
                    tracing::warn!(
                        deadline_ms = read_deadline.as_millis() as u64,
                        "read deadline lapsed, dropping connection"
                    );
                    break;
                }
            };
            match frame {
                WsFrame::Text(text) => match Message::parse(&text) {
                    Ok(msg) => self.dispatch(&msg, registry).await,
                    Err(e) => tracing::debug!(error = %e, "unparseable frame"),
                },
                WsFrame::Ping(payload) => {
                    let _ = outbound_tx.send(WsFrame::Pong(payload)).await;
                }
                WsFrame::Close(_) => {
                    tracing::info!("hub closed connection");
                    break;
                }
                _ => {}
            }
        }

        *self.shared.outbound.write() = None;
        let _ = self.shared.connected.send(false);
        // Waiters see a dropped sender, not a hang until timeout.
        self.shared.pending.lock().clear();
        ping_task.abort();
        writer_task.abort();

        Ok(true)
    }

    /// Insecure `server-info` exchange: learn the hub's TLS port
    /// (persisting it for later runs) and bootstrap a certificate when
    /// none is stored.
    async fn insecure_exchange(
        &self,
    ) -> Result<(Identity, HubEndpoint), anyhow::Error> {
        let url = format!("ws://{}:{}/ws", self.host, self.port);
        tracing::debug!(url = %url, "connecting for server-info");
        let mut ws = dial(&url, None).await?;

        let info: ServerInfo =
            wait_for(&mut ws, types::SERVER_INFO, Duration::from_secs(10))
                .await?
                .decode()?;
        tracing::debug!(hub = %info.name, tls_port = info.tls_port, "got server-info");

        let identity = match Identity::load(&self.data_dir)? {
            Some(identity) => identity,
            None => self.bootstrap(&mut ws).await?,
        };
        let endpoint = HubEndpoint {
            host: self.host.clone(),
            tls_port: info.tls_port,
        };
        endpoint.store(&self.data_dir)?;

        // The insecure session must be fully torn down before the secure
        // one starts.
        let _ = ws.close(None).await;
        let _ = tokio::time::timeout(Duration::from_secs(5), async {
            while ws.next().await.is_some() {}
        })
        .await;

        Ok((identity, endpoint))
    }

    /// Certificate bootstrap over an already-open insecure session:
    /// send a CSR, wait for the signed certificate and the CA root,
    /// persist all three identity files.
    async fn bootstrap(&self, ws: &mut WsStream) -> Result<Identity, anyhow::Error> {
        let bundle = identity::new_signing_request(&self.data_dir, &self.node_type)?;
        tracing::info!(uuid = %bundle.uuid, "requesting certificate");

        let request = SigningRequest {
            node_type: self.node_type.clone(),
            version: self.version.clone(),
            csr: bundle.csr_pem,
        };
        ws.send(text_frame(&Message::new(
            types::CERTIFICATE_SIGNING_REQUEST,
            &request,
        )?))
        .await?;

        // Approval may need an operator, so this wait is generous.
        let cert_pem: String =
            wait_for(ws, types::APPROVED_CSR, self.bootstrap_timeout)
                .await?
                .decode()?;
        let ca_pem: String =
            wait_for(ws, types::CERTIFICATE_AUTHORITY, self.bootstrap_timeout)
                .await?
                .decode()?;

        let identity = Identity::store(&self.data_dir, &cert_pem, &ca_pem)?;
        tracing::info!(uuid = %identity.uuid, "certificate stored");
        Ok(identity)
    }

    async fn dispatch(&self, msg: &Message, registry: &CallbackRegistry) {
        // Correlated replies complete their waiting request instead of
        // going through the registry.
        if let Some(id) = msg.request {
            if matches!(
                msg.message_type.as_str(),
                types::SUCCESS | types::FAILURE
            ) {
                match self.shared.pending.lock().remove(&id) {
                    Some(tx) => {
                        let _ = tx.send(msg.clone());
                    }
                    None => {
                        tracing::debug!(request = id, "reply for unknown request");
                    }
                }
                return;
            }
        }

        match msg.message_type.as_str() {
            types::SETUP => {
                let node: Node = match msg.decode() {
                    Ok(n) => n,
                    Err(e) => {
                        tracing::error!(error = %e, "bad setup body");
                        return;
                    }
                };
                *self.shared.config.write() = node.config.clone();
                let cb = self.shared.on_config.read().clone();
                if let Some(cb) = cb {
                    if let Err(e) = cb.updated(node.config).await {
                        tracing::error!(error = %e, "config callback failed");
                    }
                }
            }
            types::STATE_CHANGE => {
                let change: StateChange = match msg.decode() {
                    Ok(c) => c,
                    Err(e) => {
                        tracing::error!(error = %e, "bad state-change body");
                        return;
                    }
                };
                let cb = self.shared.on_state_change.read().clone();
                let Some(cb) = cb else {
                    tracing::debug!("state-change received but no callback registered");
                    return;
                };
                for (id, target) in change {
                    let device = self.shared.devices.read().get(&id).cloned();
                    match device {
                        Some(device) => {
                            if let Err(e) = cb.requested(target, device).await {
                                tracing::error!(device = %id, error = %e, "state-change callback failed");
                            }
                        }
                        None => {
                            tracing::warn!(device = %id, "state-change for unknown device");
                        }
                    }
                }
            }
            _ => registry.dispatch(msg).await,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Connection helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn text_frame(msg: &Message) -> WsFrame {
    // Message bodies are RawValue-backed; re-serializing the envelope
    // cannot fail.
    WsFrame::Text(msg.encode().unwrap_or_default())
}

/// Open a websocket with the `node` sub-protocol, optionally over TLS.
async fn dial(
    url: &str,
    tls: Option<Arc<rustls::ClientConfig>>,
) -> Result<WsStream, anyhow::Error> {
    let mut request = url.into_client_request()?;
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("node"));
    let connector = tls.map(Connector::Rustls);
    let (ws, _response) =
        tokio_tungstenite::connect_async_tls_with_config(request, None, false, connector)
            .await?;
    Ok(ws)
}

/// Read frames until one carries the named envelope type. Other
/// envelopes arriving in between are logged and skipped.
async fn wait_for(
    ws: &mut WsStream,
    message_type: &str,
    timeout: Duration,
) -> Result<Message, anyhow::Error> {
    let result = tokio::time::timeout(timeout, async {
        while let Some(frame) = ws.next().await {
            match frame? {
                WsFrame::Text(text) => match Message::parse(&text) {
                    Ok(msg) if msg.message_type == message_type => return Ok(msg),
                    Ok(other) => tracing::debug!(
                        got = %other.message_type,
                        want = message_type,
                        "skipping message while waiting"
                    ),
                    Err(e) => tracing::debug!(error = %e, "unparseable frame while waiting"),
                },
                WsFrame::Close(_) => break,
                _ => {}
            }
        }
        Err(anyhow::anyhow!(
            "connection closed while waiting for {message_type}"
        ))
    })
    .await;

    match result {
        Ok(r) => r,
        Err(_) => Err(anyhow::anyhow!("timed out waiting for {message_type}")),
    }
}

//! Live session registry.
//!
//! Every upgraded connection — node or gui, insecure or TLS — registers
//! here with its outbound channel. Broadcasts are filtered by the topics
//! a session subscribed to; direct sends address a node session by the
//! UUID its client certificate carries.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use uuid::Uuid;

use hearth_domain::{Connection, Error};
use hearth_protocol::Message;

/// Protocol roles declared via `Sec-WebSocket-Protocol`.
pub const ROLE_NODE: &str = "node";
pub const ROLE_GUI: &str = "gui";

/// One live session. The sink feeds the connection's writer task; the
/// registry never touches the socket itself.
#[derive(Clone)]
pub struct Session {
    pub connection: Connection,
    /// Set for node sessions identified by a client certificate.
    pub node_uuid: Option<Uuid>,
    pub subscriptions: HashSet<String>,
    pub sink: mpsc::Sender<Message>,
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session: Session) {
        tracing::info!(
            id = %session.connection.id,
            role = %session.connection.connection_type,
            remote = %session.connection.remote_addr,
            "session registered"
        );
        self.sessions
            .write()
            .insert(session.connection.id.clone(), session);
    }

    pub fn remove(&self, id: &str) -> Option<Session> {
        let session = self.sessions.write().remove(id);
        if let Some(s) = &session {
            tracing::info!(
                id = %id,
                role = %s.connection.connection_type,
                "session removed"
            );
        }
        session
    }

    /// Replace a session's broadcast subscriptions.
    pub fn subscribe(&self, id: &str, topics: Vec<String>) {
        if let Some(session) = self.sessions.write().get_mut(id) {
            session.subscriptions = topics.into_iter().collect();
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Snapshot of every live connection, for the `connections` broadcast.
    pub fn connections(&self) -> Vec<Connection> {
        let mut out: Vec<Connection> = self
            .sessions
            .read()
            .values()
            .map(|s| s.connection.clone())
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Send to every session subscribed to the message's type. Sinks are
    /// collected under the lock, sends happen after it is released; a
    /// slow consumer loses the message rather than stalling the caller.
    pub fn broadcast(&self, msg: &Message) {
        let sinks: Vec<(String, mpsc::Sender<Message>)> = self
            .sessions
            .read()
            .values()
            .filter(|s| s.subscriptions.contains(&msg.message_type))
            .map(|s| (s.connection.id.clone(), s.sink.clone()))
            .collect();

        for (id, sink) in sinks {
            if sink.try_send(msg.clone()).is_err() {
                tracing::warn!(
                    session = %id,
                    message_type = %msg.message_type,
                    "outbound queue full, dropping broadcast"
                );
            }
        }
    }

    /// Send directly to the session of an identified node.
    pub async fn send_to_node(&self, node_uuid: &Uuid, msg: &Message) -> Result<(), Error> {
        let sink = self
            .sessions
            .read()
            .values()
            .find(|s| s.node_uuid.as_ref() == Some(node_uuid))
            .map(|s| s.sink.clone())
            .ok_or_else(|| Error::NodeNotFound(node_uuid.to_string()))?;

        sink.send(msg.clone())
            .await
            .map_err(|_| Error::NodeNotFound(node_uuid.to_string()))
    }

    /// Whether an identified node session is currently attached.
    pub fn node_connected(&self, node_uuid: &Uuid) -> bool {
        self.sessions
            .read()
            .values()
            .any(|s| s.node_uuid.as_ref() == Some(node_uuid))
    }
}

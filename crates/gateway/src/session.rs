//! Secure pub/sub sessions.
//!
//! A [`SecureSession`] is one broker identity (client id + mutual-TLS
//! credentials). Its network I/O runs in a [`NetworkLoop`] task that owns the
//! rumqttc event loop. The loop only polls while the session is asked to be
//! connected: a `connect()` call wakes it, it drives the handshake, reports
//! the outcome and keeps pumping packets until the link drops, then parks
//! again until the next `connect()`. Pacing of those requests belongs to the
//! supervisor.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, TlsConfiguration, Transport};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::SessionError;

/// Capacity of the client request channel.
const REQUEST_CAPACITY: usize = 20;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionRole {
    Ingest,
    Command,
}

impl fmt::Display for SessionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ingest => write!(f, "ingest"),
            Self::Command => write!(f, "command"),
        }
    }
}

/// Root CA, client certificate and private key, all PEM.
pub struct TlsBundle {
    ca: Vec<u8>,
    cert: Vec<u8>,
    key: Vec<u8>,
}

impl TlsBundle {
    /// Read all three artifacts. A missing, unreadable or empty file is an
    /// operator error and aborts startup.
    pub fn load(root_ca: &Path, cert: &Path, key: &Path) -> Result<Self, SessionError> {
        Ok(Self {
            ca: read_artifact("root CA", root_ca)?,
            cert: read_artifact("certificate", cert)?,
            key: read_artifact("private key", key)?,
        })
    }
}

fn read_artifact(artifact: &'static str, path: &Path) -> Result<Vec<u8>, SessionError> {
    let bytes = std::fs::read(path).map_err(|source| SessionError::TlsMaterial {
        artifact,
        path: path.to_path_buf(),
        source,
    })?;
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Err(SessionError::EmptyTlsMaterial {
            artifact,
            path: path.to_path_buf(),
        });
    }
    Ok(bytes)
}

/// Everything needed to open one session. Immutable once built.
pub struct SessionIdentity {
    pub role: SessionRole,
    pub client_id: String,
    pub host: String,
    pub port: u16,
    pub keep_alive: Duration,
    tls: TlsBundle,
}

impl SessionIdentity {
    pub fn new(
        role: SessionRole,
        client_id: &str,
        host: &str,
        port: u16,
        keep_alive: Duration,
        tls: TlsBundle,
    ) -> Self {
        Self {
            role,
            client_id: client_id.to_string(),
            host: host.to_string(),
            port,
            keep_alive,
            tls,
        }
    }

    fn mqtt_options(self) -> MqttOptions {
        let mut opts = MqttOptions::new(self.client_id, self.host, self.port);
        opts.set_keep_alive(self.keep_alive);
        opts.set_clean_session(true);
        // Server verified against the given CA; client presents its own
        // certificate. There is no unverified mode.
        opts.set_transport(Transport::Tls(TlsConfiguration::Simple {
            ca: self.tls.ca,
            alpn: None,
            client_auth: Some((self.tls.cert, self.tls.key)),
        }));
        opts
    }
}

// ---------------------------------------------------------------------------
// Connection state (written by the supervisor only)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Read-only view of a session's [`ConnectionState`].
#[derive(Clone)]
pub struct ConnectionWatch(watch::Receiver<ConnectionState>);

impl ConnectionWatch {
    pub fn current(&self) -> ConnectionState {
        *self.0.borrow()
    }
}

/// Create the state channel. The sender stays with whoever owns transitions.
pub(crate) fn connection_channel() -> (watch::Sender<ConnectionState>, ConnectionWatch) {
    let (tx, rx) = watch::channel(ConnectionState::Disconnected);
    (tx, ConnectionWatch(rx))
}

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// Anything that can report whether its link is currently up.
pub trait Connectivity: Send + Sync {
    fn is_connected(&self) -> bool;
}

/// Callbacks invoked from a session's network loop.
#[async_trait]
pub trait SessionEventHandler: Send + Sync {
    async fn on_connected(&self, session: &SecureSession);
    async fn on_disconnected(&self, role: SessionRole);
    async fn on_message(&self, topic: &str, payload: &[u8]);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Handed to the client for at-least-once delivery.
    Queued,
    NotConnected,
    Rejected(String),
}

/// Connectivity flag plus supervisor state, for status reporting.
#[derive(Clone)]
pub struct SessionStatus {
    pub link: Arc<dyn Connectivity>,
    pub watch: ConnectionWatch,
}

impl SessionStatus {
    pub fn snapshot(&self) -> (bool, ConnectionState) {
        (self.link.is_connected(), self.watch.current())
    }
}

// ---------------------------------------------------------------------------
// Session handle
// ---------------------------------------------------------------------------

type ConnectReply = oneshot::Sender<Result<(), SessionError>>;

#[derive(Clone)]
pub struct SecureSession {
    role: SessionRole,
    client: AsyncClient,
    link_up: Arc<AtomicBool>,
    connect_tx: mpsc::Sender<ConnectReply>,
}

/// The session's network I/O. Must be spawned once before `connect()` is
/// useful.
pub struct NetworkLoop {
    role: SessionRole,
    eventloop: EventLoop,
    connect_rx: mpsc::Receiver<ConnectReply>,
    link_up: Arc<AtomicBool>,
    session: SecureSession,
}

impl SecureSession {
    pub fn new(identity: SessionIdentity) -> (SecureSession, NetworkLoop) {
        let role = identity.role;
        info!(
            %role,
            client_id = %identity.client_id,
            broker = %format!("{}:{}", identity.host, identity.port),
            "session configured (mutual TLS)"
        );

        let (client, eventloop) = AsyncClient::new(identity.mqtt_options(), REQUEST_CAPACITY);
        let (connect_tx, connect_rx) = mpsc::channel(1);
        let link_up = Arc::new(AtomicBool::new(false));

        let session = SecureSession {
            role,
            client,
            link_up: Arc::clone(&link_up),
            connect_tx,
        };
        let network = NetworkLoop {
            role,
            eventloop,
            connect_rx,
            link_up,
            session: session.clone(),
        };
        (session, network)
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    /// Ask the network loop to establish the link. Resolves on CONNACK or on
    /// the first connection error.
    pub async fn connect(&self) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.connect_tx
            .send(tx)
            .await
            .map_err(|_| SessionError::LoopStopped)?;
        rx.await.map_err(|_| SessionError::LoopStopped)?
    }

    /// Queue a publish without waiting on the broker.
    pub fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> PublishOutcome {
        if !self.is_connected() {
            return PublishOutcome::NotConnected;
        }
        match self.client.try_publish(topic, qos, false, payload) {
            Ok(()) => PublishOutcome::Queued,
            Err(e) => PublishOutcome::Rejected(e.to_string()),
        }
    }

    pub fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), SessionError> {
        self.client
            .try_subscribe(topic, qos)
            .map_err(|e| SessionError::Request(format!("subscribe {topic}: {e}")))
    }
}

impl Connectivity for SecureSession {
    fn is_connected(&self) -> bool {
        self.link_up.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Network loop
// ---------------------------------------------------------------------------

impl NetworkLoop {
    pub fn spawn(self, handler: Arc<dyn SessionEventHandler>) -> JoinHandle<()> {
        tokio::spawn(self.run(handler))
    }

    async fn run(mut self, handler: Arc<dyn SessionEventHandler>) {
        debug!(role = %self.role, "network loop started");

        while let Some(reply) = self.connect_rx.recv().await {
            if let Err(e) = self.establish().await {
                let _ = reply.send(Err(e));
                continue;
            }

            self.link_up.store(true, Ordering::SeqCst);
            handler.on_connected(&self.session).await;
            let _ = reply.send(Ok(()));

            self.pump(handler.as_ref()).await;

            self.link_up.store(false, Ordering::SeqCst);
            handler.on_disconnected(self.role).await;
        }

        debug!(role = %self.role, "network loop stopped");
    }

    /// Poll until the broker acknowledges the connection or the attempt fails.
    async fn establish(&mut self) -> Result<(), SessionError> {
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
                Ok(_) => {}
                Err(e) => return Err(SessionError::Connect(e.to_string())),
            }
        }
    }

    /// Deliver inbound publishes until the link fails.
    async fn pump(&mut self, handler: &dyn SessionEventHandler) {
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    handler.on_message(&p.topic, &p.payload).await;
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    debug!(role = %self.role, pkid = ack.pkid, "subscription acknowledged");
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!(role = %self.role, "broker sent disconnect");
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(role = %self.role, error = %e, "link lost");
                    return;
                }
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

//! Server side of the remote service connection
//!
//! A [`RemoteServer`] accepts connections, performs the handshake and keeps
//! the cookie table in a [`ServerCore`]. What happens to the messages of a
//! registered peer is decided by a [`ServerPolicy`], the message router or
//! the log collector.

use super::message::{
    ConnectedInstance, Cookie, InstanceInfo, MessageBody, RemoteMessage, COOKIE_FIRST_VALID,
    COOKIE_UNKNOWN,
};
use super::transport::{TcpTransport, Transport};
use crate::config::RemoteServiceConfig;
use crate::error::{Error, Result};
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Message handling of a concrete server.
pub trait ServerPolicy: Send + Sync + 'static {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Cookie the server uses as message source.
    fn server_cookie(&self) -> Cookie;

    /// Refuses a peer before it gets a cookie.
    fn admit(&self, instance: &InstanceInfo) -> std::result::Result<(), String> {
        let _ = instance;
        Ok(())
    }

    fn on_connected(&self, core: &ServerCore, instance: &ConnectedInstance) {
        let _ = (core, instance);
    }

    /// Called once the peer is gone from the table, whether it said
    /// `ByeServer` or the connection broke.
    fn on_disconnected(&self, core: &ServerCore, instance: &ConnectedInstance) {
        let _ = (core, instance);
    }

    /// Handles a message of a registered peer. Messages the policy cannot
    /// deliver go to [`ServerCore::failed_process_message`].
    fn process_message(&self, core: &ServerCore, source: &ConnectedInstance, message: RemoteMessage);
}

struct InstanceTable {
    instances: BTreeMap<Cookie, InstanceInfo>,
    next_cookie: Cookie,
}

/// Cookie table and peer outboxes of one server.
pub struct ServerCore {
    cookie: Cookie,
    table: Mutex<InstanceTable>,
    peers: DashMap<Cookie, mpsc::UnboundedSender<RemoteMessage>>,
    sequence: AtomicU64,
    failed: AtomicU64,
}

impl ServerCore {
    pub fn new(cookie: Cookie) -> Self {
        Self {
            cookie,
            table: Mutex::new(InstanceTable {
                instances: BTreeMap::new(),
                next_cookie: COOKIE_FIRST_VALID,
            }),
            peers: DashMap::new(),
            sequence: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn cookie(&self) -> Cookie {
        self.cookie
    }

    /// Registers a peer under a fresh cookie. Cookies are never handed out
    /// twice during the lifetime of the server.
    pub fn add_instance(
        &self,
        info: InstanceInfo,
        sink: mpsc::UnboundedSender<RemoteMessage>,
    ) -> ConnectedInstance {
        let mut table = self.table.lock();
        self.insert_instance(&mut table, info, sink)
    }

    /// Like [`add_instance`](Self::add_instance), but refuses the peer when
    /// `limit` instances are already connected. A `limit` of 0 means no
    /// limit.
    pub fn try_add_instance(
        &self,
        info: InstanceInfo,
        sink: mpsc::UnboundedSender<RemoteMessage>,
        limit: usize,
    ) -> Option<ConnectedInstance> {
        let mut table = self.table.lock();
        if limit > 0 && table.instances.len() >= limit {
            return None;
        }
        Some(self.insert_instance(&mut table, info, sink))
    }

    // The sink is in place before the cookie becomes visible in the table.
    fn insert_instance(
        &self,
        table: &mut InstanceTable,
        info: InstanceInfo,
        sink: mpsc::UnboundedSender<RemoteMessage>,
    ) -> ConnectedInstance {
        let cookie = table.next_cookie;
        table.next_cookie += 1;
        self.peers.insert(cookie, sink);
        table.instances.insert(cookie, info.clone());
        debug!(cookie, name = %info.name, source = ?info.source, "Instance added");
        ConnectedInstance { cookie, info }
    }

    pub fn remove_instance(&self, cookie: Cookie) -> Option<ConnectedInstance> {
        let info = {
            let mut table = self.table.lock();
            let info = table.instances.remove(&cookie)?;
            self.peers.remove(&cookie);
            info
        };
        debug!(cookie, name = %info.name, "Instance removed");
        Some(ConnectedInstance { cookie, info })
    }

    pub fn instance(&self, cookie: Cookie) -> Option<ConnectedInstance> {
        self.table
            .lock()
            .instances
            .get(&cookie)
            .map(|info| ConnectedInstance {
                cookie,
                info: info.clone(),
            })
    }

    pub fn instances(&self) -> Vec<ConnectedInstance> {
        self.table
            .lock()
            .instances
            .iter()
            .map(|(cookie, info)| ConnectedInstance {
                cookie: *cookie,
                info: info.clone(),
            })
            .collect()
    }

    pub fn instance_count(&self) -> usize {
        self.table.lock().instances.len()
    }

    fn stamp(&self, target: Cookie, body: MessageBody) -> RemoteMessage {
        let sequence = self.sequence.fetch_add(1, Ordering::AcqRel) + 1;
        RemoteMessage::new(self.cookie, target, body).with_sequence(sequence)
    }

    /// Sends a message from the server to one peer.
    pub fn send_to(&self, target: Cookie, body: MessageBody) -> bool {
        let message = self.stamp(target, body);
        self.deliver(target, message)
    }

    /// Relays a peer message to its header target.
    pub fn forward(&self, message: RemoteMessage) -> bool {
        let target = message.target();
        self.forward_to(target, message)
    }

    /// Relays a peer message to `target`, keeping its header.
    pub fn forward_to(&self, target: Cookie, message: RemoteMessage) -> bool {
        self.deliver(target, message)
    }

    /// Sends a message from the server to every peer accepted by `filter`.
    /// Returns the number of peers reached.
    pub fn broadcast_filtered<F>(&self, body: MessageBody, filter: F) -> usize
    where
        F: Fn(&ConnectedInstance) -> bool,
    {
        let targets: Vec<Cookie> = self
            .instances()
            .into_iter()
            .filter(|instance| filter(instance))
            .map(|instance| instance.cookie)
            .collect();
        targets
            .into_iter()
            .filter(|target| self.send_to(*target, body.clone()))
            .count()
    }

    pub fn broadcast(&self, body: MessageBody, except: Option<Cookie>) -> usize {
        self.broadcast_filtered(body, |instance| Some(instance.cookie) != except)
    }

    fn deliver(&self, target: Cookie, message: RemoteMessage) -> bool {
        let Some(peer) = self.peers.get(&target).map(|peer| peer.clone()) else {
            self.failed_process_message(&message);
            return false;
        };
        if peer.send(message).is_err() {
            debug!(target, "Peer outbox closed");
            return false;
        }
        true
    }

    /// Drops a message that cannot be delivered. No reply goes back to the
    /// sender.
    pub fn failed_process_message(&self, message: &RemoteMessage) {
        self.failed.fetch_add(1, Ordering::AcqRel);
        warn!(message = %message, "Message could not be processed");
    }

    /// Number of messages dropped by [`failed_process_message`](Self::failed_process_message).
    pub fn failed_messages(&self) -> u64 {
        self.failed.load(Ordering::Acquire)
    }
}

struct Shared<P> {
    config: RemoteServiceConfig,
    policy: P,
    core: ServerCore,
    paused: AtomicBool,
    shutdown: watch::Sender<bool>,
    connections: Mutex<Vec<JoinHandle<()>>>,
}

impl<P: ServerPolicy> Shared<P> {
    fn rejection(&self, instance: &InstanceInfo) -> Option<String> {
        if self.paused.load(Ordering::Acquire) {
            return Some("server paused".to_string());
        }
        self.policy.admit(instance).err()
    }

    async fn serve(self: Arc<Self>, transport: Arc<dyn Transport>, mut shutdown: watch::Receiver<bool>) {
        let peer = transport.peer();

        let handshake = tokio::time::timeout(self.config.handshake_timeout(), transport.recv());
        let received = tokio::select! {
            _ = stopped(&mut shutdown) => {
                debug!(%peer, "Server stopped during handshake");
                let _ = transport.close().await;
                return;
            }
            received = handshake => received,
        };
        let hello = match received {
            Ok(Ok(message)) => message,
            Ok(Err(err)) => {
                debug!(%peer, error = %err, "Connection closed before handshake");
                return;
            }
            Err(_) => {
                warn!(%peer, "Handshake timed out");
                let _ = transport.close().await;
                return;
            }
        };
        let MessageBody::HelloServer { instance } = hello.body else {
            warn!(%peer, id = ?hello.header.id, "Expected HelloServer");
            self.reject(&transport, "expected HelloServer").await;
            return;
        };
        if let Some(reason) = self.rejection(&instance) {
            info!(%peer, name = %instance.name, %reason, "Connection rejected");
            self.reject(&transport, &reason).await;
            return;
        }

        let (sink, mut outbox) = mpsc::unbounded_channel();
        let limit = self.config.max_connections;
        let Some(connected) = self.core.try_add_instance(instance, sink, limit) else {
            info!(%peer, limit, "Connection rejected, limit reached");
            self.reject(&transport, &format!("connection limit of {limit} reached")).await;
            return;
        };
        let cookie = connected.cookie;
        if !self.core.send_to(cookie, MessageBody::AcceptClient { cookie }) {
            self.core.remove_instance(cookie);
            return;
        }

        let writer = {
            let transport = transport.clone();
            tokio::spawn(async move {
                while let Some(message) = outbox.recv().await {
                    if let Err(err) = transport.send(message).await {
                        debug!(error = %err, "Write failed");
                        break;
                    }
                }
            })
        };
        info!(server = self.policy.name(), %peer, cookie, name = %connected.info.name, "Instance connected");
        self.policy.on_connected(&self.core, &connected);

        let said_bye = loop {
            tokio::select! {
                _ = stopped(&mut shutdown) => break false,
                received = transport.recv() => match received {
                    Ok(mut message) => {
                        message.header.source = cookie;
                        if matches!(message.body, MessageBody::ByeServer) {
                            break true;
                        }
                        self.policy.process_message(&self.core, &connected, message);
                    }
                    Err(err) => {
                        debug!(cookie, error = %err, "Connection lost");
                        break false;
                    }
                },
            }
        };

        self.core.remove_instance(cookie);
        self.policy.on_disconnected(&self.core, &connected);
        self.core.broadcast(MessageBody::ByeClient { cookie }, None);
        info!(server = self.policy.name(), cookie, said_bye, "Instance disconnected");

        // queued messages drain before the socket goes away
        if tokio::time::timeout(self.config.handshake_timeout(), writer).await.is_err() {
            debug!(cookie, "Writer did not drain in time");
        }
        let _ = transport.close().await;
    }

    async fn reject(&self, transport: &Arc<dyn Transport>, reason: &str) {
        let message = self.core.stamp(
            COOKIE_UNKNOWN,
            MessageBody::RejectClient {
                reason: reason.to_string(),
            },
        );
        if let Err(err) = transport.send(message).await {
            debug!(error = %err, "RejectClient not delivered");
        }
        let _ = transport.close().await;
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = stopped(&mut shutdown) => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, address)) => {
                        debug!(%address, "Connection accepted");
                        let transport = Arc::new(TcpTransport::new(stream, self.config.max_frame_len));
                        self.spawn(transport);
                    }
                    Err(err) => warn!(error = %err, "Accept failed"),
                },
            }
        }
    }

    fn spawn(self: &Arc<Self>, transport: Arc<dyn Transport>) -> usize {
        let shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(self.clone().serve(transport, shutdown));
        let mut connections = self.connections.lock();
        connections.retain(|handle| !handle.is_finished());
        connections.push(handle);
        connections.len()
    }
}

/// Resolves once the server is told to stop, including a stop that happened
/// before the receiver was first polled.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

struct Running {
    local_addr: SocketAddr,
    accept: JoinHandle<()>,
}

/// TCP server running a [`ServerPolicy`].
pub struct RemoteServer<P: ServerPolicy> {
    shared: Arc<Shared<P>>,
    running: Mutex<Option<Running>>,
}

impl<P: ServerPolicy> RemoteServer<P> {
    pub fn new(config: RemoteServiceConfig, policy: P) -> Self {
        let (shutdown, _) = watch::channel(false);
        let core = ServerCore::new(policy.server_cookie());
        Self {
            shared: Arc::new(Shared {
                config,
                policy,
                core,
                paused: AtomicBool::new(false),
                shutdown,
                connections: Mutex::new(Vec::new()),
            }),
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &RemoteServiceConfig {
        &self.shared.config
    }

    pub fn policy(&self) -> &P {
        &self.shared.policy
    }

    pub fn core(&self) -> &ServerCore {
        &self.shared.core
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|running| running.local_addr)
    }

    /// Binds the configured endpoint and starts accepting connections.
    pub async fn start(&self) -> Result<SocketAddr> {
        if self.is_running() {
            return Err(Error::invalid_state(self.shared.policy.name(), "running", "start"));
        }
        let endpoint = self.shared.config.endpoint();
        let listener = TcpListener::bind(&endpoint)
            .await
            .map_err(|err| Error::connection(format!("Failed to bind {endpoint}"), err))?;
        let local_addr = listener.local_addr()?;

        self.shared.shutdown.send_replace(false);
        self.shared.paused.store(false, Ordering::Release);
        let shutdown = self.shared.shutdown.subscribe();
        let accept = tokio::spawn(self.shared.clone().accept_loop(listener, shutdown));
        *self.running.lock() = Some(Running { local_addr, accept });
        info!(server = self.shared.policy.name(), %local_addr, "Server started");
        Ok(local_addr)
    }

    /// Serves an already established connection.
    pub fn attach(&self, transport: Arc<dyn Transport>) {
        let connections = self.shared.spawn(transport);
        debug!(connections, "Connection attached");
    }

    /// Stops accepting and closes every connection.
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        self.shared.shutdown.send_replace(true);
        if let Some(running) = running {
            if let Err(err) = running.accept.await {
                error!(error = %err, "Accept loop failed");
            }
        }
        let connections = std::mem::take(&mut *self.shared.connections.lock());
        for result in join_all(connections).await {
            if let Err(err) = result {
                error!(error = %err, "Connection task failed");
            }
        }
        info!(server = self.shared.policy.name(), "Server stopped");
    }

    pub async fn restart(&self) -> Result<SocketAddr> {
        self.stop().await;
        self.start().await
    }

    /// New connections are rejected while paused; existing ones stay.
    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::Release);
        info!(server = self.shared.policy.name(), "Server paused");
    }

    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::Release);
        info!(server = self.shared.policy.name(), "Server resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::Acquire)
    }
}

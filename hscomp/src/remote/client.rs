//! Client side of the remote service connection
//!
//! [`RemoteServiceClient`] keeps one connection to a router or log
//! collector alive. It says `HelloServer` and repeats it once per retry
//! interval until the server accepts or rejects; a rejection or any
//! transport failure drops back to disconnected and the next attempt starts
//! one interval later. After every accept the registered services and
//! clients are announced again.

use super::message::{
    Cookie, InstanceInfo, MessageBody, MessageId, RemoteMessage, COOKIE_ROUTER, COOKIE_UNKNOWN,
};
use super::transport::{Connector, TcpConnector, Transport};
use crate::config::RemoteServiceConfig;
use crate::dispatcher::DispatcherThread;
use crate::event::{Event, EventType};
use crate::service::{ClientAddress, ServiceAddress, ServiceManager};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Stopped,
}

/// Callbacks of a remote service connection. Called from the client task.
pub trait ConnectionHandler: Send + Sync {
    fn on_connected(&self, cookie: Cookie) {
        let _ = cookie;
    }

    fn on_disconnected(&self) {}

    fn on_rejected(&self, reason: &str) {
        let _ = reason;
    }

    /// Any message other than the handshake.
    fn on_message(&self, message: &RemoteMessage) {
        let _ = message;
    }
}

/// Message received from the router, delivered through a dispatcher.
#[derive(Debug, Clone)]
pub struct RemoteMessageEvent {
    pub message: RemoteMessage,
}

impl Event for RemoteMessageEvent {
    fn event_type(&self) -> EventType {
        EventType::SERVICE_EXTERNAL
    }
}

/// Connection state change, delivered through a dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteConnectionEvent {
    Connected(Cookie),
    Disconnected,
    Rejected(String),
}

impl Event for RemoteConnectionEvent {
    fn event_type(&self) -> EventType {
        EventType::SERVICE_EXTERNAL
    }
}

/// Posts connection callbacks as events into a dispatcher thread.
pub struct DispatcherForwarder {
    thread: Arc<DispatcherThread>,
}

impl DispatcherForwarder {
    pub fn new(thread: Arc<DispatcherThread>) -> Self {
        Self { thread }
    }
}

impl ConnectionHandler for DispatcherForwarder {
    fn on_connected(&self, cookie: Cookie) {
        self.thread.post(RemoteConnectionEvent::Connected(cookie));
    }

    fn on_disconnected(&self) {
        self.thread.post(RemoteConnectionEvent::Disconnected);
    }

    fn on_rejected(&self, reason: &str) {
        self.thread
            .post(RemoteConnectionEvent::Rejected(reason.to_string()));
    }

    fn on_message(&self, message: &RemoteMessage) {
        if !self.thread.post(RemoteMessageEvent {
            message: message.clone(),
        }) {
            debug!(thread = %self.thread.name(), message = %message, "Remote message not consumed");
        }
    }
}

enum SessionEnd {
    Stopped,
    Lost,
    Rejected,
}

/// Connection to a router or log collector.
pub struct RemoteServiceClient {
    config: RemoteServiceConfig,
    instance: InstanceInfo,
    connector: Arc<dyn Connector>,
    state: watch::Sender<ConnectionState>,
    cookie: AtomicU64,
    sequence: AtomicU64,
    handshakes: AtomicUsize,
    outbox_tx: mpsc::UnboundedSender<RemoteMessage>,
    outbox_rx: Mutex<Option<mpsc::UnboundedReceiver<RemoteMessage>>>,
    services: Mutex<Vec<ServiceAddress>>,
    clients: Mutex<Vec<ClientAddress>>,
    handlers: RwLock<Vec<Arc<dyn ConnectionHandler>>>,
    stopping: AtomicBool,
    stop: Notify,
}

impl RemoteServiceClient {
    pub fn new(
        config: RemoteServiceConfig,
        instance: InstanceInfo,
        connector: Arc<dyn Connector>,
    ) -> Arc<Self> {
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            config,
            instance,
            connector,
            state,
            cookie: AtomicU64::new(COOKIE_UNKNOWN),
            sequence: AtomicU64::new(0),
            handshakes: AtomicUsize::new(0),
            outbox_tx,
            outbox_rx: Mutex::new(Some(outbox_rx)),
            services: Mutex::new(Vec::new()),
            clients: Mutex::new(Vec::new()),
            handlers: RwLock::new(Vec::new()),
            stopping: AtomicBool::new(false),
            stop: Notify::new(),
        })
    }

    /// Client connecting over TCP to the configured endpoint.
    pub fn tcp(config: RemoteServiceConfig, instance: InstanceInfo) -> Arc<Self> {
        let connector = Arc::new(TcpConnector::new(config.endpoint(), config.max_frame_len));
        Self::new(config, instance, connector)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Waits until the connection reaches `wanted`.
    pub async fn wait_for_state(&self, wanted: ConnectionState, timeout: Duration) -> bool {
        let mut states = self.state.subscribe();
        let reached = matches!(
            tokio::time::timeout(timeout, states.wait_for(|state| *state == wanted)).await,
            Ok(Ok(_))
        );
        reached
    }

    /// Cookie assigned by the server, `COOKIE_UNKNOWN` while disconnected.
    pub fn cookie(&self) -> Cookie {
        self.cookie.load(Ordering::Acquire)
    }

    pub fn instance(&self) -> &InstanceInfo {
        &self.instance
    }

    /// Number of `HelloServer` messages sent so far.
    pub fn handshake_attempts(&self) -> usize {
        self.handshakes.load(Ordering::Acquire)
    }

    pub fn add_handler(&self, handler: Arc<dyn ConnectionHandler>) {
        self.handlers.write().push(handler);
    }

    /// Queues a message for the server. Dropped unless connected.
    pub fn send(&self, target: Cookie, body: MessageBody) -> bool {
        if self.state() != ConnectionState::Connected {
            debug!(id = ?body.id(), "Not connected, message dropped");
            return false;
        }
        self.outbox_tx.send(self.message(target, body)).is_ok()
    }

    fn message(&self, target: Cookie, body: MessageBody) -> RemoteMessage {
        let sequence = self.sequence.fetch_add(1, Ordering::AcqRel) + 1;
        RemoteMessage::new(self.cookie(), target, body).with_sequence(sequence)
    }

    /// Spawns the connection task on the current runtime.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(self.clone().run())
    }

    /// Ends the connection task after saying goodbye to the server.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
        self.stop.notify_one();
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "Connection state changed");
        }
    }

    fn handlers(&self) -> Vec<Arc<dyn ConnectionHandler>> {
        self.handlers.read().clone()
    }

    pub async fn run(self: Arc<Self>) {
        let Some(mut outbox) = self.outbox_rx.lock().take() else {
            warn!("Remote service client is already running");
            return;
        };
        let mut ticker = interval(self.config.retry_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.is_stopping() {
            tokio::select! {
                _ = self.stop.notified() => break,
                _ = ticker.tick() => {}
            }
            if self.is_stopping() {
                break;
            }
            self.set_state(ConnectionState::Connecting);
            let transport = match self.connector.connect().await {
                Ok(transport) => transport,
                Err(err) => {
                    debug!(endpoint = %self.config.endpoint(), error = %err, "Connection attempt failed");
                    self.set_state(ConnectionState::Disconnected);
                    continue;
                }
            };

            let end = self.session(&transport, &mut outbox, &mut ticker).await;
            if let Err(err) = transport.close().await {
                debug!(error = %err, "Closing transport failed");
            }
            let was_connected = self.cookie.swap(COOKIE_UNKNOWN, Ordering::AcqRel) != COOKIE_UNKNOWN;
            self.set_state(ConnectionState::Disconnected);
            if was_connected {
                info!(peer = %transport.peer(), "Disconnected from remote service");
                for handler in self.handlers() {
                    handler.on_disconnected();
                }
            }
            if let SessionEnd::Stopped = end {
                break;
            }
        }
        self.set_state(ConnectionState::Stopped);
    }

    async fn session(
        &self,
        transport: &Arc<dyn Transport>,
        outbox: &mut mpsc::UnboundedReceiver<RemoteMessage>,
        ticker: &mut Interval,
    ) -> SessionEnd {
        let (inbound_tx, mut inbound) = mpsc::unbounded_channel();
        let reader = {
            let transport = transport.clone();
            tokio::spawn(async move {
                loop {
                    match transport.recv().await {
                        Ok(message) => {
                            if inbound_tx.send(message).is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            debug!(error = %err, "Connection read ended");
                            break;
                        }
                    }
                }
            })
        };

        let mut stale = 0usize;
        while outbox.try_recv().is_ok() {
            stale += 1;
        }
        if stale > 0 {
            debug!(stale, "Dropped messages queued before the connection");
        }

        let end = self.handshake_loop(transport, outbox, ticker, &mut inbound).await;
        reader.abort();
        end
    }

    async fn handshake_loop(
        &self,
        transport: &Arc<dyn Transport>,
        outbox: &mut mpsc::UnboundedReceiver<RemoteMessage>,
        ticker: &mut Interval,
        inbound: &mut mpsc::UnboundedReceiver<RemoteMessage>,
    ) -> SessionEnd {
        if self.say_hello(transport).await.is_err() {
            return SessionEnd::Lost;
        }
        ticker.reset();
        let mut connected = false;

        loop {
            if self.is_stopping() {
                self.say_goodbye(transport, connected).await;
                return SessionEnd::Stopped;
            }
            tokio::select! {
                _ = self.stop.notified() => {
                    self.say_goodbye(transport, connected).await;
                    return SessionEnd::Stopped;
                }
                _ = ticker.tick(), if !connected => {
                    if self.say_hello(transport).await.is_err() {
                        return SessionEnd::Lost;
                    }
                }
                received = inbound.recv() => {
                    let Some(message) = received else {
                        return SessionEnd::Lost;
                    };
                    match message.body {
                        MessageBody::AcceptClient { cookie } if !connected => {
                            self.cookie.store(cookie, Ordering::Release);
                            self.set_state(ConnectionState::Connected);
                            connected = true;
                            info!(peer = %transport.peer(), cookie, "Connected to remote service");
                            if self.announce_registrations(transport).await.is_err() {
                                return SessionEnd::Lost;
                            }
                            for handler in self.handlers() {
                                handler.on_connected(cookie);
                            }
                        }
                        MessageBody::RejectClient { ref reason } => {
                            warn!(peer = %transport.peer(), %reason, "Connection rejected");
                            for handler in self.handlers() {
                                handler.on_rejected(reason);
                            }
                            return SessionEnd::Rejected;
                        }
                        _ if connected => {
                            for handler in self.handlers() {
                                handler.on_message(&message);
                            }
                        }
                        _ => debug!(message = %message, "Message before accept ignored"),
                    }
                }
                Some(message) = outbox.recv(), if connected => {
                    if let Err(err) = transport.send(message).await {
                        debug!(error = %err, "Send failed");
                        return SessionEnd::Lost;
                    }
                }
            }
        }
    }

    async fn say_hello(&self, transport: &Arc<dyn Transport>) -> crate::Result<()> {
        self.handshakes.fetch_add(1, Ordering::AcqRel);
        let hello = self.message(
            COOKIE_ROUTER,
            MessageBody::HelloServer {
                instance: self.instance.clone(),
            },
        );
        debug_assert_eq!(hello.id(), MessageId::HelloServer);
        transport.send(hello).await
    }

    async fn say_goodbye(&self, transport: &Arc<dyn Transport>, connected: bool) {
        if connected {
            if let Err(err) = transport.send(self.message(COOKIE_ROUTER, MessageBody::ByeServer)).await {
                debug!(error = %err, "ByeServer not delivered");
            }
        }
    }

    async fn announce_registrations(&self, transport: &Arc<dyn Transport>) -> crate::Result<()> {
        let services = self.services.lock().clone();
        let clients = self.clients.lock().clone();
        for address in services {
            transport
                .send(self.message(COOKIE_ROUTER, MessageBody::RegisterService { address }))
                .await?;
        }
        for address in clients {
            transport
                .send(self.message(COOKIE_ROUTER, MessageBody::RegisterClient { address }))
                .await?;
        }
        Ok(())
    }
}

impl ServiceManager for RemoteServiceClient {
    fn request_register_server(&self, address: &ServiceAddress) -> bool {
        {
            let mut services = self.services.lock();
            if services.contains(address) {
                return false;
            }
            services.push(address.clone());
        }
        self.send(
            COOKIE_ROUTER,
            MessageBody::RegisterService {
                address: address.clone(),
            },
        );
        true
    }

    fn request_unregister_server(&self, address: &ServiceAddress) {
        self.services.lock().retain(|s| s != address);
        self.send(
            COOKIE_ROUTER,
            MessageBody::UnregisterService {
                address: address.clone(),
            },
        );
    }

    fn request_register_client(&self, address: &ClientAddress) -> bool {
        {
            let mut clients = self.clients.lock();
            if clients.contains(address) {
                return false;
            }
            clients.push(address.clone());
        }
        self.send(
            COOKIE_ROUTER,
            MessageBody::RegisterClient {
                address: address.clone(),
            },
        );
        true
    }

    fn request_unregister_client(&self, address: &ClientAddress) {
        self.clients.lock().retain(|c| c != address);
        self.send(
            COOKIE_ROUTER,
            MessageBody::UnregisterClient {
                address: address.clone(),
            },
        );
    }
}

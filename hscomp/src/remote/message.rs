//! Remote service connection messages

use crate::error::Result;
use crate::service::{ClientAddress, ServiceAddress};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Server-assigned identity of a connected peer.
pub type Cookie = u64;

/// Not registered yet.
pub const COOKIE_UNKNOWN: Cookie = 0;
/// Target inside the local process.
pub const COOKIE_LOCAL: Cookie = 1;
/// The message router itself.
pub const COOKIE_ROUTER: Cookie = 2;
/// The log collector itself.
pub const COOKIE_LOGGER: Cookie = 3;
/// First cookie handed to a peer.
pub const COOKIE_FIRST_VALID: Cookie = 256;
/// Broadcast to every peer.
pub const COOKIE_ANY: Cookie = u64::MAX;

/// Classification of a connected peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageSource {
    Client,
    Observer,
    Service,
    Test,
    Simulation,
}

impl MessageSource {
    /// Peers whose log messages are collected.
    pub fn is_log_source(&self) -> bool {
        matches!(
            self,
            MessageSource::Client | MessageSource::Test | MessageSource::Simulation
        )
    }

    /// Peers that receive collected log messages.
    pub fn is_log_observer(&self) -> bool {
        matches!(self, MessageSource::Observer)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Bitness {
    Bits32,
    Bits64,
}

impl Bitness {
    pub fn native() -> Self {
        if cfg!(target_pointer_width = "64") {
            Bitness::Bits64
        } else {
            Bitness::Bits32
        }
    }
}

/// Self-description a peer sends with `HelloServer`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub name: String,
    pub source: MessageSource,
    pub bitness: Bitness,
    pub process_id: u32,
}

impl InstanceInfo {
    /// Describes the running process.
    pub fn current(name: impl Into<String>, source: MessageSource) -> Self {
        Self {
            name: name.into(),
            source,
            bitness: Bitness::native(),
            process_id: std::process::id(),
        }
    }
}

/// Peer known to a server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectedInstance {
    pub cookie: Cookie,
    pub info: InstanceInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// One log line shipped to the log collector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub level: LogLevel,
    pub timestamp_ms: u64,
    pub thread: String,
    pub target: String,
    pub message: String,
}

/// Message identity, one per body variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageId {
    HelloServer,
    ByeServer,
    AcceptClient,
    RejectClient,
    ByeClient,
    RegisterService,
    UnregisterService,
    RegisterClient,
    UnregisterClient,
    ServiceRegisteredNotify,
    ServiceUnregisteredNotify,
    ClientRegisteredNotify,
    ClientUnregisteredNotify,
    QueryService,
    InstancesConnected,
    InstancesDisconnected,
    QueryInstances,
    LogMessage,
    Forward,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageBody {
    /// Client asks to connect.
    HelloServer { instance: InstanceInfo },
    /// Client disconnects.
    ByeServer,
    /// Server accepted the client and assigned it `cookie`.
    AcceptClient { cookie: Cookie },
    RejectClient { reason: String },
    /// Peer `cookie` left.
    ByeClient { cookie: Cookie },
    RegisterService { address: ServiceAddress },
    UnregisterService { address: ServiceAddress },
    RegisterClient { address: ClientAddress },
    UnregisterClient { address: ClientAddress },
    /// `address` became available at peer `cookie`.
    ServiceRegisteredNotify { address: ServiceAddress, cookie: Cookie },
    ServiceUnregisteredNotify { address: ServiceAddress, cookie: Cookie },
    ClientRegisteredNotify { address: ClientAddress, cookie: Cookie },
    ClientUnregisteredNotify { address: ClientAddress, cookie: Cookie },
    /// Request for the service directory; answered with one
    /// `ServiceRegisteredNotify` per known service.
    QueryService,
    InstancesConnected { instances: Vec<ConnectedInstance> },
    InstancesDisconnected { cookies: Vec<Cookie> },
    QueryInstances,
    LogMessage { record: LogRecord },
    /// Opaque payload relayed to the header target.
    Forward { payload: Vec<u8> },
}

impl MessageBody {
    pub fn id(&self) -> MessageId {
        match self {
            MessageBody::HelloServer { .. } => MessageId::HelloServer,
            MessageBody::ByeServer => MessageId::ByeServer,
            MessageBody::AcceptClient { .. } => MessageId::AcceptClient,
            MessageBody::RejectClient { .. } => MessageId::RejectClient,
            MessageBody::ByeClient { .. } => MessageId::ByeClient,
            MessageBody::RegisterService { .. } => MessageId::RegisterService,
            MessageBody::UnregisterService { .. } => MessageId::UnregisterService,
            MessageBody::RegisterClient { .. } => MessageId::RegisterClient,
            MessageBody::UnregisterClient { .. } => MessageId::UnregisterClient,
            MessageBody::ServiceRegisteredNotify { .. } => MessageId::ServiceRegisteredNotify,
            MessageBody::ServiceUnregisteredNotify { .. } => MessageId::ServiceUnregisteredNotify,
            MessageBody::ClientRegisteredNotify { .. } => MessageId::ClientRegisteredNotify,
            MessageBody::ClientUnregisteredNotify { .. } => MessageId::ClientUnregisteredNotify,
            MessageBody::QueryService => MessageId::QueryService,
            MessageBody::InstancesConnected { .. } => MessageId::InstancesConnected,
            MessageBody::InstancesDisconnected { .. } => MessageId::InstancesDisconnected,
            MessageBody::QueryInstances => MessageId::QueryInstances,
            MessageBody::LogMessage { .. } => MessageId::LogMessage,
            MessageBody::Forward { .. } => MessageId::Forward,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub id: MessageId,
    pub source: Cookie,
    pub target: Cookie,
    pub sequence: u64,
}

/// A framed protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteMessage {
    pub header: MessageHeader,
    pub body: MessageBody,
}

impl RemoteMessage {
    pub fn new(source: Cookie, target: Cookie, body: MessageBody) -> Self {
        Self {
            header: MessageHeader {
                id: body.id(),
                source,
                target,
                sequence: 0,
            },
            body,
        }
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.header.sequence = sequence;
        self
    }

    pub fn id(&self) -> MessageId {
        self.header.id
    }

    pub fn source(&self) -> Cookie {
        self.header.source
    }

    pub fn target(&self) -> Cookie {
        self.header.target
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

impl fmt::Display for RemoteMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} {} -> {} #{}",
            self.header.id, self.header.source, self.header.target, self.header.sequence
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::Version;

    #[test]
    fn test_header_follows_body() {
        let address = ServiceAddress::new("Main", "Sensor", "Temperature", Version::new(1, 0, 0));
        let message = RemoteMessage::new(
            COOKIE_ROUTER,
            COOKIE_ANY,
            MessageBody::ServiceRegisteredNotify {
                address: address.clone(),
                cookie: 300,
            },
        )
        .with_sequence(9);

        assert_eq!(message.id(), MessageId::ServiceRegisteredNotify);
        let decoded = RemoteMessage::decode(&message.encode().unwrap()).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(decoded.header.sequence, 9);
        assert_eq!(message.to_string(), "ServiceRegisteredNotify 2 -> 18446744073709551615 #9");
    }

    #[test]
    fn test_source_classification() {
        assert!(MessageSource::Client.is_log_source());
        assert!(MessageSource::Test.is_log_source());
        assert!(MessageSource::Simulation.is_log_source());
        assert!(!MessageSource::Service.is_log_source());
        assert!(!MessageSource::Service.is_log_observer());
        assert!(MessageSource::Observer.is_log_observer());
        assert!(!MessageSource::Observer.is_log_source());
    }

    #[test]
    fn test_truncated_bytes_fail_to_decode() {
        let bytes = RemoteMessage::new(COOKIE_UNKNOWN, COOKIE_ROUTER, MessageBody::QueryService)
            .encode()
            .unwrap();
        let err = RemoteMessage::decode(&bytes[..bytes.len() / 2]).unwrap_err();
        assert_eq!(err.category(), "serialization");
    }
}

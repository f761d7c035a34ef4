//! Remote service connection: the protocol spoken between processes, the
//! message router and the log collector

pub mod client;
pub mod codec;
pub mod logger;
pub mod message;
pub mod router;
pub mod server;
pub mod transport;

pub use client::{
    ConnectionHandler, ConnectionState, DispatcherForwarder, RemoteConnectionEvent,
    RemoteMessageEvent, RemoteServiceClient,
};
pub use logger::LogCollector;
pub use message::{
    Bitness, ConnectedInstance, Cookie, InstanceInfo, LogLevel, LogRecord, MessageBody,
    MessageHeader, MessageId, MessageSource, RemoteMessage, COOKIE_ANY, COOKIE_FIRST_VALID,
    COOKIE_LOCAL, COOKIE_LOGGER, COOKIE_ROUTER, COOKIE_UNKNOWN,
};
pub use router::ServiceRouter;
pub use server::{RemoteServer, ServerCore, ServerPolicy};
pub use transport::{Connector, TcpConnector, TcpTransport, Transport};

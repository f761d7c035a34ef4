//! Service interfaces and the service manager contract

use crate::component::ComponentInfo;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Version of a service interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

impl Version {
    pub const fn new(major: u16, minor: u16, patch: u16) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Whether an implementation of `self` can serve a client built
    /// against `required`: same major, not older otherwise.
    pub fn is_compatible(&self, required: &Version) -> bool {
        self.major == required.major && (self.minor, self.patch) >= (required.minor, required.patch)
    }
}

impl Default for Version {
    fn default() -> Self {
        Self::new(1, 0, 0)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Address of a server (stub) interface.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceAddress {
    pub thread_name: String,
    pub role_name: String,
    pub service_name: String,
    pub version: Version,
}

impl ServiceAddress {
    pub fn new(
        thread_name: impl Into<String>,
        role_name: impl Into<String>,
        service_name: impl Into<String>,
        version: Version,
    ) -> Self {
        Self {
            thread_name: thread_name.into(),
            role_name: role_name.into(),
            service_name: service_name.into(),
            version,
        }
    }

    /// Address of a service implemented by `component`.
    pub fn of_component(component: &ComponentInfo, service_name: impl Into<String>, version: Version) -> Self {
        Self::new(
            component.address().thread().name(),
            component.role_name(),
            service_name,
            version,
        )
    }

    /// True if this service can serve `client`.
    pub fn serves(&self, client: &ClientAddress) -> bool {
        self.role_name == client.role_name
            && self.service_name == client.service_name
            && self.version.is_compatible(&client.version)
    }
}

impl fmt::Display for ServiceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}::{} v{} ({})",
            self.role_name, self.service_name, self.version, self.thread_name
        )
    }
}

/// Address of a client (proxy) interface: where the proxy lives and which
/// role and service it connects to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientAddress {
    pub thread_name: String,
    pub role_name: String,
    pub service_name: String,
    pub version: Version,
}

impl ClientAddress {
    pub fn new(
        thread_name: impl Into<String>,
        role_name: impl Into<String>,
        service_name: impl Into<String>,
        version: Version,
    ) -> Self {
        Self {
            thread_name: thread_name.into(),
            role_name: role_name.into(),
            service_name: service_name.into(),
            version,
        }
    }
}

impl fmt::Display for ClientAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {}::{} v{}",
            self.thread_name, self.role_name, self.service_name, self.version
        )
    }
}

/// Server side of a service interface, owned by a component.
pub trait Stub: Send + Sync {
    fn service_address(&self) -> ServiceAddress;

    /// Prepares the stub to receive calls. Runs before registration.
    fn startup_service_interface(&self, component: &Arc<ComponentInfo>) {
        let _ = component;
    }

    /// Runs after the stub was unregistered.
    fn shutdown_service_interface(&self, component: &Arc<ComponentInfo>) {
        let _ = component;
    }
}

/// Receives registration requests of servers and clients.
///
/// Called from dispatcher threads, so implementations must not block for
/// long.
pub trait ServiceManager: Send + Sync {
    fn request_register_server(&self, address: &ServiceAddress) -> bool;

    fn request_unregister_server(&self, address: &ServiceAddress);

    fn request_register_client(&self, address: &ClientAddress) -> bool;

    fn request_unregister_client(&self, address: &ClientAddress);
}

/// Service manager that keeps registrations inside the process.
#[derive(Debug, Default)]
pub struct LocalServiceManager {
    servers: RwLock<Vec<ServiceAddress>>,
    clients: RwLock<Vec<ClientAddress>>,
}

impl LocalServiceManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn servers(&self) -> Vec<ServiceAddress> {
        self.servers.read().clone()
    }

    pub fn clients(&self) -> Vec<ClientAddress> {
        self.clients.read().clone()
    }

    /// First registered server able to serve `client`.
    pub fn find_server(&self, client: &ClientAddress) -> Option<ServiceAddress> {
        self.servers
            .read()
            .iter()
            .find(|server| server.serves(client))
            .cloned()
    }
}

impl ServiceManager for LocalServiceManager {
    fn request_register_server(&self, address: &ServiceAddress) -> bool {
        let mut servers = self.servers.write();
        if servers
            .iter()
            .any(|s| s.role_name == address.role_name && s.service_name == address.service_name)
        {
            warn!(service = %address, "Service already registered");
            return false;
        }
        servers.push(address.clone());
        debug!(service = %address, "Service registered");
        true
    }

    fn request_unregister_server(&self, address: &ServiceAddress) {
        self.servers.write().retain(|s| s != address);
    }

    fn request_register_client(&self, address: &ClientAddress) -> bool {
        let mut clients = self.clients.write();
        if clients.contains(address) {
            return false;
        }
        clients.push(address.clone());
        true
    }

    fn request_unregister_client(&self, address: &ClientAddress) {
        self.clients.write().retain(|c| c != address);
    }
}

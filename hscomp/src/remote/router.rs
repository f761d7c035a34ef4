//! Message router: the service directory shared by all connected processes

use super::message::{ConnectedInstance, Cookie, MessageBody, RemoteMessage, COOKIE_ANY, COOKIE_ROUTER};
use super::server::{ServerCore, ServerPolicy};
use crate::service::{ClientAddress, ServiceAddress};
use parking_lot::Mutex;
use tracing::{debug, info};

#[derive(Default)]
struct Directory {
    services: Vec<(Cookie, ServiceAddress)>,
    clients: Vec<(Cookie, ClientAddress)>,
}

type Outgoing = Vec<(Cookie, MessageBody)>;

/// Keeps track of registered services and clients and tells each side when
/// a matching counterpart comes or goes.
#[derive(Default)]
pub struct ServiceRouter {
    directory: Mutex<Directory>,
}

impl ServiceRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn services(&self) -> Vec<(Cookie, ServiceAddress)> {
        self.directory.lock().services.clone()
    }

    pub fn clients(&self) -> Vec<(Cookie, ClientAddress)> {
        self.directory.lock().clients.clone()
    }

    fn register_service(&self, cookie: Cookie, address: ServiceAddress) -> Outgoing {
        let mut directory = self.directory.lock();
        if directory
            .services
            .iter()
            .any(|(owner, known)| *owner == cookie && *known == address)
        {
            debug!(cookie, service = %address, "Service already registered");
            return Vec::new();
        }
        let mut outgoing = Vec::new();
        for (client_cookie, client) in directory.clients.iter().filter(|(_, c)| address.serves(c)) {
            outgoing.push((
                *client_cookie,
                MessageBody::ServiceRegisteredNotify {
                    address: address.clone(),
                    cookie,
                },
            ));
            outgoing.push((
                cookie,
                MessageBody::ClientRegisteredNotify {
                    address: client.clone(),
                    cookie: *client_cookie,
                },
            ));
        }
        info!(cookie, service = %address, "Service registered");
        directory.services.push((cookie, address));
        outgoing
    }

    fn unregister_service(&self, cookie: Cookie, address: &ServiceAddress) -> Outgoing {
        let mut directory = self.directory.lock();
        let before = directory.services.len();
        directory
            .services
            .retain(|(owner, known)| !(*owner == cookie && known == address));
        if directory.services.len() == before {
            return Vec::new();
        }
        info!(cookie, service = %address, "Service unregistered");
        Self::service_gone(&directory, cookie, address)
    }

    fn service_gone(directory: &Directory, cookie: Cookie, address: &ServiceAddress) -> Outgoing {
        directory
            .clients
            .iter()
            .filter(|(_, client)| address.serves(client))
            .map(|(client_cookie, _)| {
                (
                    *client_cookie,
                    MessageBody::ServiceUnregisteredNotify {
                        address: address.clone(),
                        cookie,
                    },
                )
            })
            .collect()
    }

    fn register_client(&self, cookie: Cookie, address: ClientAddress) -> Outgoing {
        let mut directory = self.directory.lock();
        if directory
            .clients
            .iter()
            .any(|(owner, known)| *owner == cookie && *known == address)
        {
            return Vec::new();
        }
        let mut outgoing = Vec::new();
        for (service_cookie, service) in directory.services.iter().filter(|(_, s)| s.serves(&address)) {
            outgoing.push((
                cookie,
                MessageBody::ServiceRegisteredNotify {
                    address: service.clone(),
                    cookie: *service_cookie,
                },
            ));
            outgoing.push((
                *service_cookie,
                MessageBody::ClientRegisteredNotify {
                    address: address.clone(),
                    cookie,
                },
            ));
        }
        debug!(cookie, role = %address.role_name, service = %address.service_name, "Client registered");
        directory.clients.push((cookie, address));
        outgoing
    }

    fn unregister_client(&self, cookie: Cookie, address: &ClientAddress) -> Outgoing {
        let mut directory = self.directory.lock();
        let before = directory.clients.len();
        directory
            .clients
            .retain(|(owner, known)| !(*owner == cookie && known == address));
        if directory.clients.len() == before {
            return Vec::new();
        }
        Self::client_gone(&directory, cookie, address)
    }

    fn client_gone(directory: &Directory, cookie: Cookie, address: &ClientAddress) -> Outgoing {
        directory
            .services
            .iter()
            .filter(|(_, service)| service.serves(address))
            .map(|(service_cookie, _)| {
                (
                    *service_cookie,
                    MessageBody::ClientUnregisteredNotify {
                        address: address.clone(),
                        cookie,
                    },
                )
            })
            .collect()
    }

    /// Drops every registration of `cookie`.
    fn remove_instance(&self, cookie: Cookie) -> Outgoing {
        let mut directory = self.directory.lock();
        let (gone_services, services): (Vec<_>, Vec<_>) = std::mem::take(&mut directory.services)
            .into_iter()
            .partition(|(owner, _)| *owner == cookie);
        let (gone_clients, clients): (Vec<_>, Vec<_>) = std::mem::take(&mut directory.clients)
            .into_iter()
            .partition(|(owner, _)| *owner == cookie);
        directory.services = services;
        directory.clients = clients;

        let mut outgoing = Vec::new();
        for (_, address) in &gone_services {
            outgoing.extend(Self::service_gone(&directory, cookie, address));
        }
        for (_, address) in &gone_clients {
            outgoing.extend(Self::client_gone(&directory, cookie, address));
        }
        if !gone_services.is_empty() || !gone_clients.is_empty() {
            info!(
                cookie,
                services = gone_services.len(),
                clients = gone_clients.len(),
                "Registrations of disconnected instance removed"
            );
        }
        outgoing
    }

    fn directory_for(&self, target: Cookie) -> Outgoing {
        let directory = self.directory.lock();
        directory
            .services
            .iter()
            .map(|(owner, address)| {
                (
                    target,
                    MessageBody::ServiceRegisteredNotify {
                        address: address.clone(),
                        cookie: *owner,
                    },
                )
            })
            .collect()
    }

    fn relay(core: &ServerCore, source: Cookie, message: RemoteMessage) {
        if message.target() == COOKIE_ANY {
            let reached = core
                .instances()
                .into_iter()
                .filter(|instance| instance.cookie != source)
                .filter(|instance| core.forward_to(instance.cookie, message.clone()))
                .count();
            debug!(source, reached, "Forward broadcast");
        } else {
            core.forward(message);
        }
    }
}

fn send_all(core: &ServerCore, outgoing: Outgoing) {
    for (target, body) in outgoing {
        core.send_to(target, body);
    }
}

impl ServerPolicy for ServiceRouter {
    fn name(&self) -> &'static str {
        "router"
    }

    fn server_cookie(&self) -> Cookie {
        COOKIE_ROUTER
    }

    fn on_disconnected(&self, core: &ServerCore, instance: &ConnectedInstance) {
        let outgoing = self.remove_instance(instance.cookie);
        send_all(core, outgoing);
    }

    fn process_message(&self, core: &ServerCore, source: &ConnectedInstance, message: RemoteMessage) {
        let cookie = source.cookie;
        let outgoing = match &message.body {
            MessageBody::RegisterService { address } => self.register_service(cookie, address.clone()),
            MessageBody::UnregisterService { address } => self.unregister_service(cookie, address),
            MessageBody::RegisterClient { address } => self.register_client(cookie, address.clone()),
            MessageBody::UnregisterClient { address } => self.unregister_client(cookie, address),
            MessageBody::QueryService => self.directory_for(cookie),
            MessageBody::Forward { .. } => {
                Self::relay(core, cookie, message);
                return;
            }
            _ => {
                core.failed_process_message(&message);
                return;
            }
        };
        send_all(core, outgoing);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::message::{InstanceInfo, MessageSource};
    use crate::service::Version;
    use tokio::sync::mpsc;

    struct Peer {
        instance: ConnectedInstance,
        outbox: mpsc::UnboundedReceiver<RemoteMessage>,
    }

    impl Peer {
        fn join(core: &ServerCore, name: &str) -> Self {
            let (sink, outbox) = mpsc::unbounded_channel();
            let instance = core.add_instance(InstanceInfo::current(name, MessageSource::Client), sink);
            Self { instance, outbox }
        }

        fn cookie(&self) -> Cookie {
            self.instance.cookie
        }

        fn received(&mut self) -> Vec<MessageBody> {
            let mut bodies = Vec::new();
            while let Ok(message) = self.outbox.try_recv() {
                bodies.push(message.body);
            }
            bodies
        }
    }

    fn send(router: &ServiceRouter, core: &ServerCore, from: &Peer, target: Cookie, body: MessageBody) {
        router.process_message(core, &from.instance, RemoteMessage::new(from.cookie(), target, body));
    }

    fn temperature() -> (ServiceAddress, ClientAddress) {
        (
            ServiceAddress::new("Main", "Sensor", "Temperature", Version::new(1, 2, 0)),
            ClientAddress::new("Display", "Sensor", "Temperature", Version::new(1, 1, 0)),
        )
    }

    #[test]
    fn test_matching_registrations_notify_both_sides() {
        let router = ServiceRouter::new();
        let core = ServerCore::new(COOKIE_ROUTER);
        let mut server = Peer::join(&core, "server");
        let mut client = Peer::join(&core, "client");
        let (service, proxy) = temperature();

        send(&router, &core, &client, COOKIE_ROUTER, MessageBody::RegisterClient { address: proxy.clone() });
        assert!(client.received().is_empty());

        send(&router, &core, &server, COOKIE_ROUTER, MessageBody::RegisterService { address: service.clone() });
        assert_eq!(
            client.received(),
            vec![MessageBody::ServiceRegisteredNotify {
                address: service.clone(),
                cookie: server.cookie()
            }]
        );
        assert_eq!(
            server.received(),
            vec![MessageBody::ClientRegisteredNotify {
                address: proxy.clone(),
                cookie: client.cookie()
            }]
        );

        // registering twice is not announced twice
        send(&router, &core, &server, COOKIE_ROUTER, MessageBody::RegisterService { address: service.clone() });
        assert!(client.received().is_empty());
        assert_eq!(router.services().len(), 1);

        send(&router, &core, &server, COOKIE_ROUTER, MessageBody::UnregisterService { address: service.clone() });
        assert_eq!(
            client.received(),
            vec![MessageBody::ServiceUnregisteredNotify {
                address: service,
                cookie: server.cookie()
            }]
        );
        assert!(router.services().is_empty());
    }

    #[test]
    fn test_incompatible_version_is_not_matched() {
        let router = ServiceRouter::new();
        let core = ServerCore::new(COOKIE_ROUTER);
        let server = Peer::join(&core, "server");
        let mut client = Peer::join(&core, "client");
        let (service, _) = temperature();
        let newer = ClientAddress::new("Display", "Sensor", "Temperature", Version::new(2, 0, 0));

        send(&router, &core, &server, COOKIE_ROUTER, MessageBody::RegisterService { address: service });
        send(&router, &core, &client, COOKIE_ROUTER, MessageBody::RegisterClient { address: newer });
        assert!(client.received().is_empty());
    }

    #[test]
    fn test_disconnect_withdraws_registrations() {
        let router = ServiceRouter::new();
        let core = ServerCore::new(COOKIE_ROUTER);
        let mut server = Peer::join(&core, "server");
        let mut client = Peer::join(&core, "client");
        let (service, proxy) = temperature();

        send(&router, &core, &server, COOKIE_ROUTER, MessageBody::RegisterService { address: service.clone() });
        send(&router, &core, &client, COOKIE_ROUTER, MessageBody::RegisterClient { address: proxy.clone() });
        client.received();
        server.received();

        let gone = core.remove_instance(server.cookie()).unwrap();
        router.on_disconnected(&core, &gone);
        assert_eq!(
            client.received(),
            vec![MessageBody::ServiceUnregisteredNotify {
                address: service,
                cookie: gone.cookie
            }]
        );
        assert!(router.services().is_empty());
        assert_eq!(router.clients(), vec![(client.cookie(), proxy)]);
    }

    #[test]
    fn test_query_service_lists_directory() {
        let router = ServiceRouter::new();
        let core = ServerCore::new(COOKIE_ROUTER);
        let server = Peer::join(&core, "server");
        let mut late = Peer::join(&core, "late");
        let (service, _) = temperature();

        send(&router, &core, &server, COOKIE_ROUTER, MessageBody::RegisterService { address: service.clone() });
        send(&router, &core, &late, COOKIE_ROUTER, MessageBody::QueryService);
        assert_eq!(
            late.received(),
            vec![MessageBody::ServiceRegisteredNotify {
                address: service,
                cookie: server.cookie()
            }]
        );
    }

    #[test]
    fn test_forward_targets_and_broadcast() {
        let router = ServiceRouter::new();
        let core = ServerCore::new(COOKIE_ROUTER);
        let mut a = Peer::join(&core, "a");
        let mut b = Peer::join(&core, "b");
        let mut c = Peer::join(&core, "c");

        send(&router, &core, &a, b.cookie(), MessageBody::Forward { payload: vec![1] });
        assert_eq!(b.received(), vec![MessageBody::Forward { payload: vec![1] }]);
        assert!(c.received().is_empty());

        send(&router, &core, &a, COOKIE_ANY, MessageBody::Forward { payload: vec![2] });
        assert_eq!(b.received(), vec![MessageBody::Forward { payload: vec![2] }]);
        assert_eq!(c.received(), vec![MessageBody::Forward { payload: vec![2] }]);
        assert!(a.received().is_empty());

        send(&router, &core, &a, 9999, MessageBody::Forward { payload: vec![3] });
        send(&router, &core, &a, COOKIE_ROUTER, MessageBody::QueryInstances);
        assert_eq!(core.failed_messages(), 2);
    }
}

//! Log collector: relays log messages from log sources to log observers

use super::message::{
    ConnectedInstance, Cookie, MessageBody, MessageSource, RemoteMessage, COOKIE_ANY, COOKIE_LOGGER,
};
use super::server::{ServerCore, ServerPolicy};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace};

/// Which way a message between two peers may travel.
fn may_relay(from: MessageSource, to: MessageSource) -> bool {
    (from.is_log_source() && to.is_log_observer()) || (from.is_log_observer() && to.is_log_source())
}

/// Server policy of the log collector.
///
/// Clients, tests and simulations are log sources, observers receive their
/// records. Nothing is relayed between two sources or between two observers,
/// and service peers take no part in log traffic at all.
#[derive(Default)]
pub struct LogCollector {
    relayed: AtomicU64,
}

impl LogCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of log records handed to observers.
    pub fn relayed(&self) -> u64 {
        self.relayed.load(Ordering::Acquire)
    }

    fn observers(core: &ServerCore) -> Vec<ConnectedInstance> {
        core.instances()
            .into_iter()
            .filter(|instance| instance.info.source.is_log_observer())
            .collect()
    }

    fn relay_log(&self, core: &ServerCore, source: &ConnectedInstance, message: RemoteMessage) {
        let target = message.target();
        if target == COOKIE_ANY || target == COOKIE_LOGGER {
            if !source.info.source.is_log_source() {
                core.failed_process_message(&message);
                return;
            }
            for observer in Self::observers(core) {
                if core.forward_to(observer.cookie, message.clone()) {
                    self.relayed.fetch_add(1, Ordering::AcqRel);
                }
            }
            return;
        }
        match core.instance(target) {
            Some(peer)
                if source.info.source.is_log_source() && peer.info.source.is_log_observer() =>
            {
                if core.forward_to(target, message) {
                    self.relayed.fetch_add(1, Ordering::AcqRel);
                }
            }
            _ => core.failed_process_message(&message),
        }
    }

    fn relay_forward(core: &ServerCore, source: &ConnectedInstance, message: RemoteMessage) {
        let allowed = core
            .instance(message.target())
            .map(|peer| may_relay(source.info.source, peer.info.source))
            .unwrap_or(false);
        if allowed {
            core.forward(message);
        } else {
            core.failed_process_message(&message);
        }
    }
}

impl ServerPolicy for LogCollector {
    fn name(&self) -> &'static str {
        "logger"
    }

    fn server_cookie(&self) -> Cookie {
        COOKIE_LOGGER
    }

    fn on_connected(&self, core: &ServerCore, instance: &ConnectedInstance) {
        let cookie = instance.cookie;
        core.broadcast_filtered(
            MessageBody::InstancesConnected {
                instances: vec![instance.clone()],
            },
            |peer| peer.cookie != cookie && peer.info.source.is_log_observer(),
        );
        if instance.info.source.is_log_observer() {
            let others = core
                .instances()
                .into_iter()
                .filter(|peer| peer.cookie != cookie)
                .collect();
            core.send_to(cookie, MessageBody::InstancesConnected { instances: others });
        }
    }

    fn on_disconnected(&self, core: &ServerCore, instance: &ConnectedInstance) {
        core.broadcast_filtered(
            MessageBody::InstancesDisconnected {
                cookies: vec![instance.cookie],
            },
            |peer| peer.info.source.is_log_observer(),
        );
    }

    fn process_message(&self, core: &ServerCore, source: &ConnectedInstance, message: RemoteMessage) {
        match &message.body {
            MessageBody::LogMessage { record } => {
                trace!(cookie = source.cookie, level = ?record.level, "Log record");
                self.relay_log(core, source, message);
            }
            MessageBody::QueryInstances => {
                let instances = core.instances();
                debug!(cookie = source.cookie, count = instances.len(), "Instances queried");
                core.send_to(source.cookie, MessageBody::InstancesConnected { instances });
            }
            MessageBody::Forward { .. } => Self::relay_forward(core, source, message),
            _ => core.failed_process_message(&message),
        }
    }
}

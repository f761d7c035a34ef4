//! Worker thread binding
//!
//! A worker thread is a dispatcher thread owned by exactly one component.
//! Its [`WorkerThreadConsumer`] registers the worker's consumers when the
//! dispatch loop starts and removes them when it ends, so other threads see
//! the consumers either fully registered or absent.

use crate::component::{ComponentInfo, ComponentScope};
use crate::dispatcher::DispatcherThread;
use crate::event::RuntimeId;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Registers and unregisters the consumers that live on a worker thread.
pub trait WorkerThreadConsumer: Send {
    /// Name used to match the consumer with its registry declaration.
    fn consumer_name(&self) -> &str;

    /// Called on the worker thread before its dispatch loop starts.
    fn register_event_consumers(
        &mut self,
        worker: &Arc<DispatcherThread>,
        master: &Arc<DispatcherThread>,
    );

    /// Called on the worker thread after its dispatch loop ended.
    fn unregister_event_consumers(&mut self, worker: &Arc<DispatcherThread>);
}

pub(crate) struct WorkerBinding {
    component: Weak<ComponentInfo>,
    consumer: Mutex<Box<dyn WorkerThreadConsumer>>,
}

impl WorkerBinding {
    pub(crate) fn new(component: &Arc<ComponentInfo>, consumer: Box<dyn WorkerThreadConsumer>) -> Self {
        Self {
            component: Arc::downgrade(component),
            consumer: Mutex::new(consumer),
        }
    }

    pub(crate) fn component(&self) -> Option<Arc<ComponentInfo>> {
        self.component.upgrade()
    }

    pub(crate) fn find_event_consumer(&self, runtime: RuntimeId) -> Option<Arc<DispatcherThread>> {
        self.component.upgrade()?.find_event_consumer(runtime)
    }

    pub(crate) fn run(&self, worker: &Arc<DispatcherThread>) -> bool {
        let Some(component) = self.component.upgrade() else {
            warn!(worker = %worker.name(), "Binding component is gone, worker exits");
            return false;
        };
        let Some(master) = component.master() else {
            warn!(worker = %worker.name(), "Master thread is gone, worker exits");
            return false;
        };
        let _scope = ComponentScope::enter(component.clone());

        let consumer_name = {
            let mut consumer = self.consumer.lock();
            consumer.register_event_consumers(worker, &master);
            consumer.consumer_name().to_string()
        };
        debug!(
            worker = %worker.name(),
            component = %component.role_name(),
            consumer = %consumer_name,
            "Worker consumers registered"
        );
        drop(master);

        let clean = worker.run_dispatcher();

        self.consumer.lock().unregister_event_consumers(worker);
        debug!(worker = %worker.name(), consumer = %consumer_name, "Worker consumers unregistered");
        clean
    }
}

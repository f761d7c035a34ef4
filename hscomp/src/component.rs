//! Components and component info
//!
//! A [`Component`] is user code hosted by a component thread under a role
//! name. The framework side keeps, per component, a [`ComponentInfo`] with
//! the component's address and its worker threads, and a
//! `ComponentInstance` that drives load, startup, shutdown and destruction.

use crate::address::{ComponentAddress, ThreadAddress};
use crate::context::ProcessContext;
use crate::dispatcher::{DispatcherThread, ThreadKind};
use crate::error::{Error, Result};
use crate::event::RuntimeId;
use crate::registry::ComponentEntry;
use crate::service::Stub;
use crate::sync::WaitTimeout;
use crate::worker::{WorkerBinding, WorkerThreadConsumer};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::cell::RefCell;
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};

thread_local! {
    static CURRENT_COMPONENT: RefCell<Option<Arc<ComponentInfo>>> = RefCell::new(None);
}

/// User behavior of a component.
///
/// All hooks run on the hosting component thread.
pub trait Component: Send {
    /// Called once the component's stubs are started and registered.
    fn startup(&mut self, info: &Arc<ComponentInfo>) {
        let _ = info;
    }

    /// Called before stubs are unregistered and worker threads signalled.
    fn shutdown(&mut self, info: &Arc<ComponentInfo>) {
        let _ = info;
    }

    /// Server interfaces this component implements.
    fn server_interfaces(&self) -> Vec<Arc<dyn Stub>> {
        Vec::new()
    }

    /// Resolves the consumer of a worker thread declared in the registry.
    /// Returning `None` skips that worker thread.
    fn worker_thread_consumer(
        &mut self,
        consumer_name: &str,
        thread_name: &str,
    ) -> Option<Box<dyn WorkerThreadConsumer>> {
        let _ = (consumer_name, thread_name);
        None
    }
}

/// Sets the current component for the calling thread until dropped.
pub(crate) struct ComponentScope {
    previous: Option<Arc<ComponentInfo>>,
}

impl ComponentScope {
    pub(crate) fn enter(info: Arc<ComponentInfo>) -> Self {
        let previous = CURRENT_COMPONENT.with(|current| current.replace(Some(info)));
        Self { previous }
    }
}

impl Drop for ComponentScope {
    fn drop(&mut self) {
        let previous = self.previous.take();
        let _restored = CURRENT_COMPONENT.with(|current| current.replace(previous));
    }
}

/// Address, master thread and worker threads of one component.
pub struct ComponentInfo {
    address: ComponentAddress,
    master: Weak<DispatcherThread>,
    context: Weak<ProcessContext>,
    workers: DashMap<ThreadAddress, Arc<DispatcherThread>>,
    this: Weak<ComponentInfo>,
}

impl ComponentInfo {
    pub(crate) fn new(
        role_name: &str,
        master: &Arc<DispatcherThread>,
        context: Weak<ProcessContext>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            address: ComponentAddress::new(master.address(), role_name),
            master: Arc::downgrade(master),
            context,
            workers: DashMap::new(),
            this: this.clone(),
        })
    }

    /// Component whose code is running on the calling thread.
    ///
    /// Set while a component hook or one of its consumers runs, and for the
    /// whole lifetime of the component's worker threads.
    pub fn current() -> Option<Arc<ComponentInfo>> {
        CURRENT_COMPONENT.with(|current| current.borrow().clone())
    }

    pub fn address(&self) -> &ComponentAddress {
        &self.address
    }

    pub fn role_name(&self) -> &str {
        self.address.role_name()
    }

    pub fn master(&self) -> Option<Arc<DispatcherThread>> {
        self.master.upgrade()
    }

    pub fn context(&self) -> Option<Arc<ProcessContext>> {
        self.context.upgrade()
    }

    pub(crate) fn is_hosted_by(&self, thread: &DispatcherThread) -> bool {
        std::ptr::eq(self.master.as_ptr(), thread)
    }

    /// Thread able to consume `runtime`: the master thread first, then any
    /// worker thread of this component.
    pub fn find_event_consumer(&self, runtime: RuntimeId) -> Option<Arc<DispatcherThread>> {
        if let Some(master) = self.master() {
            if master.has_consumer(runtime) {
                return Some(master);
            }
        }
        self.worker_threads()
            .into_iter()
            .find(|worker| worker.has_consumer(runtime))
    }

    /// Creates and starts a worker thread bound to this component.
    ///
    /// Returns `None` if the thread cannot be created; the component keeps
    /// running without it.
    pub fn create_worker_thread(
        &self,
        thread_name: &str,
        consumer: Box<dyn WorkerThreadConsumer>,
        wait: WaitTimeout,
    ) -> Option<Arc<DispatcherThread>> {
        let this = self.this.upgrade()?;
        let worker = DispatcherThread::with_kind(
            thread_name,
            ThreadKind::Worker(WorkerBinding::new(&this, consumer)),
            self.context.clone(),
        );
        match worker.create_thread(wait) {
            Ok(_) => {
                self.workers.insert(worker.address(), worker.clone());
                debug!(component = %self.address, worker = %worker.address(), "Worker thread created");
                Some(worker)
            }
            Err(err) => {
                error!(
                    component = %self.address,
                    worker = thread_name,
                    error = %err,
                    "Failed to create worker thread"
                );
                None
            }
        }
    }

    /// Stops a worker thread and waits until it has finished.
    pub fn delete_worker_thread(&self, thread_name: &str) -> bool {
        let key = self
            .workers
            .iter()
            .find(|entry| entry.value().name() == thread_name)
            .map(|entry| entry.key().clone());
        match key.and_then(|key| self.workers.remove(&key)) {
            Some((_, worker)) => {
                worker.shutdown_thread();
                worker.destroy_thread(WaitTimeout::Infinite);
                debug!(component = %self.address, worker = thread_name, "Worker thread deleted");
                true
            }
            None => false,
        }
    }

    pub(crate) fn delete_all_worker_threads(&self) {
        let names: Vec<String> = self
            .workers
            .iter()
            .map(|entry| entry.value().name().to_string())
            .collect();
        for name in names {
            self.delete_worker_thread(&name);
        }
    }

    pub fn find_worker_thread(&self, thread_name: &str) -> Option<Arc<DispatcherThread>> {
        self.workers
            .iter()
            .find(|entry| entry.value().name() == thread_name)
            .map(|entry| entry.value().clone())
    }

    pub fn worker_threads(&self) -> Vec<Arc<DispatcherThread>> {
        self.workers.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

impl std::fmt::Debug for ComponentInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentInfo")
            .field("address", &self.address)
            .field("workers", &self.workers.len())
            .finish()
    }
}

/// Framework-side handle of a loaded component.
pub(crate) struct ComponentInstance {
    info: Arc<ComponentInfo>,
    entry: ComponentEntry,
    component: Mutex<Option<Box<dyn Component>>>,
    stubs: Vec<Arc<dyn Stub>>,
    context: Weak<ProcessContext>,
}

impl ComponentInstance {
    /// Creates the component through its registry factory and starts the
    /// worker threads the entry declares.
    pub(crate) fn load(
        context: &Arc<ProcessContext>,
        thread: &Arc<DispatcherThread>,
        entry: &ComponentEntry,
    ) -> Result<Self> {
        let factory = entry
            .factory()
            .ok_or_else(|| Error::not_found("component factory", entry.role_name()))?;
        let info = ComponentInfo::new(entry.role_name(), thread, Arc::downgrade(context));
        context.components().register(&info)?;

        let created = {
            let _scope = ComponentScope::enter(info.clone());
            factory(entry, &info)
        };
        let Some(mut component) = created else {
            context.components().unregister(&info);
            return Err(Error::runtime_msg(format!(
                "factory of component '{}' returned nothing",
                entry.role_name()
            )));
        };

        for worker in entry.worker_threads() {
            let consumer = {
                let _scope = ComponentScope::enter(info.clone());
                component.worker_thread_consumer(worker.consumer_name(), worker.thread_name())
            };
            let Some(consumer) = consumer else {
                warn!(
                    component = %info.address(),
                    worker = worker.thread_name(),
                    consumer = worker.consumer_name(),
                    "No consumer for declared worker thread, skipped"
                );
                continue;
            };
            if info
                .create_worker_thread(worker.thread_name(), consumer, WaitTimeout::Infinite)
                .is_none()
            {
                break;
            }
        }

        let stubs = component.server_interfaces();
        info!(component = %info.address(), workers = info.worker_count(), "Component loaded");
        Ok(Self {
            info,
            entry: entry.clone(),
            component: Mutex::new(Some(component)),
            stubs,
            context: Arc::downgrade(context),
        })
    }

    pub(crate) fn info(&self) -> &Arc<ComponentInfo> {
        &self.info
    }

    /// Starts every stub, requests its registration, then runs the user hook.
    pub(crate) fn startup_component(&self) {
        let _scope = ComponentScope::enter(self.info.clone());
        let context = self.context.upgrade();
        for stub in &self.stubs {
            stub.startup_service_interface(&self.info);
            if let Some(context) = &context {
                let address = stub.service_address();
                if !context.service_manager().request_register_server(&address) {
                    warn!(component = %self.info.address(), service = %address, "Server registration refused");
                }
            }
        }
        if let Some(component) = self.component.lock().as_mut() {
            component.startup(&self.info);
        }
        debug!(component = %self.info.address(), "Component started");
    }

    /// Runs the user hook, unregisters and stops the stubs, then signals the
    /// worker threads without waiting for them.
    pub(crate) fn shutdown_component(&self) {
        let _scope = ComponentScope::enter(self.info.clone());
        if let Some(component) = self.component.lock().as_mut() {
            component.shutdown(&self.info);
        }
        let context = self.context.upgrade();
        for stub in &self.stubs {
            if let Some(context) = &context {
                context
                    .service_manager()
                    .request_unregister_server(&stub.service_address());
            }
            stub.shutdown_service_interface(&self.info);
        }
        self.notify_component_shutdown();
        debug!(component = %self.info.address(), "Component shut down");
    }

    /// Signals the worker threads only. Not synchronized with a concurrent
    /// startup.
    pub(crate) fn notify_component_shutdown(&self) {
        for worker in self.info.worker_threads() {
            worker.shutdown_thread();
        }
    }

    /// Waits for each worker thread in turn.
    pub(crate) fn wait_component_completion(&self, wait: WaitTimeout) -> bool {
        self.info
            .worker_threads()
            .iter()
            .fold(true, |done, worker| worker.completion_wait(wait) && done)
    }
}

impl Drop for ComponentInstance {
    fn drop(&mut self) {
        self.info.delete_all_worker_threads();
        if let Some(component) = self.component.get_mut().take() {
            match self.entry.deleter() {
                Some(delete) => delete(component, &self.entry),
                None => drop(component),
            }
        }
        if let Some(context) = self.context.upgrade() {
            context.components().unregister(&self.info);
        }
        debug!(component = %self.info.address(), "Component destroyed");
    }
}

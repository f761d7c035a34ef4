//! Process bootstrap context
//!
//! Everything that is process-wide in the threading model lives here and
//! is passed around explicitly: the thread-name registry, the component
//! registry, the model loader and the service manager. Tests build one
//! context each and stay isolated from each other.

use crate::address::{ComponentAddress, ThreadAddress};
use crate::component::ComponentInfo;
use crate::dispatcher::DispatcherThread;
use crate::error::{Error, Result};
use crate::registry::ComponentLoader;
use crate::service::{LocalServiceManager, ServiceManager};
use crate::sync::WaitTimeout;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Running dispatcher threads by name.
#[derive(Default)]
pub struct ThreadRegistry {
    threads: Mutex<HashMap<String, Arc<DispatcherThread>>>,
}

impl ThreadRegistry {
    pub(crate) fn register(&self, thread: &Arc<DispatcherThread>) -> Result<()> {
        let mut threads = self.threads.lock();
        if threads.contains_key(thread.name()) {
            return Err(Error::duplicate("thread", thread.name()));
        }
        threads.insert(thread.name().to_string(), thread.clone());
        Ok(())
    }

    /// Removes the entry only if it still refers to `thread`.
    pub(crate) fn unregister(&self, thread: &DispatcherThread) -> bool {
        let mut threads = self.threads.lock();
        match threads.get(thread.name()) {
            Some(found) if std::ptr::eq(Arc::as_ptr(found), thread) => {
                threads.remove(thread.name());
                true
            }
            _ => false,
        }
    }

    pub fn find_by_name(&self, name: &str) -> Option<Arc<DispatcherThread>> {
        self.threads.lock().get(name).cloned()
    }

    pub fn find_by_address(&self, address: &ThreadAddress) -> Option<Arc<DispatcherThread>> {
        self.threads
            .lock()
            .get(address.name())
            .filter(|thread| &thread.address() == address)
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.threads.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.threads.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.lock().is_empty()
    }
}

/// Live components by role name.
///
/// Entries are added when a component is created and removed when it is
/// destroyed.
#[derive(Default)]
pub struct ComponentRegistry {
    components: Mutex<HashMap<String, Arc<ComponentInfo>>>,
}

impl ComponentRegistry {
    pub(crate) fn register(&self, info: &Arc<ComponentInfo>) -> Result<()> {
        let mut components = self.components.lock();
        if components.contains_key(info.role_name()) {
            return Err(Error::duplicate("component", info.role_name()));
        }
        components.insert(info.role_name().to_string(), info.clone());
        Ok(())
    }

    pub(crate) fn unregister(&self, info: &Arc<ComponentInfo>) -> bool {
        let mut components = self.components.lock();
        match components.get(info.role_name()) {
            Some(found) if Arc::ptr_eq(found, info) => {
                components.remove(info.role_name());
                true
            }
            _ => false,
        }
    }

    pub fn find_by_name(&self, role_name: &str) -> Option<Arc<ComponentInfo>> {
        self.components.lock().get(role_name).cloned()
    }

    pub fn find_by_address(&self, address: &ComponentAddress) -> Option<Arc<ComponentInfo>> {
        self.components
            .lock()
            .get(address.role_name())
            .filter(|info| info.address() == address)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.components.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.lock().is_empty()
    }
}

/// Registries and services shared by every thread of one process.
pub struct ProcessContext {
    threads: ThreadRegistry,
    components: ComponentRegistry,
    loader: ComponentLoader,
    service_manager: Arc<dyn ServiceManager>,
}

impl ProcessContext {
    /// Context whose service registrations stay inside the process.
    pub fn new() -> Arc<Self> {
        Self::with_service_manager(Arc::new(LocalServiceManager::new()))
    }

    pub fn with_service_manager(service_manager: Arc<dyn ServiceManager>) -> Arc<Self> {
        Arc::new(Self {
            threads: ThreadRegistry::default(),
            components: ComponentRegistry::default(),
            loader: ComponentLoader::new(),
            service_manager,
        })
    }

    pub fn threads(&self) -> &ThreadRegistry {
        &self.threads
    }

    pub fn components(&self) -> &ComponentRegistry {
        &self.components
    }

    pub fn loader(&self) -> &ComponentLoader {
        &self.loader
    }

    pub fn service_manager(&self) -> &Arc<dyn ServiceManager> {
        &self.service_manager
    }

    pub fn find_thread(&self, name: &str) -> Option<Arc<DispatcherThread>> {
        self.threads.find_by_name(name)
    }

    pub fn find_component(&self, role_name: &str) -> Option<Arc<ComponentInfo>> {
        self.components.find_by_name(role_name)
    }

    /// Starts the component threads of one model, or of every model when
    /// `name` is `None`.
    pub fn load_model(self: &Arc<Self>, name: Option<&str>) -> Result<()> {
        self.loader.load_model(self, name)
    }

    pub fn unload_model(&self, name: Option<&str>, wait: WaitTimeout) -> Result<()> {
        self.loader.unload_model(name, wait)
    }

    /// Unloads all models and stops any thread still registered.
    pub fn shutdown(&self, wait: WaitTimeout) {
        if let Err(err) = self.loader.unload_model(None, wait) {
            debug!(error = %err, "Model unload incomplete");
        }
        let remaining: Vec<Arc<DispatcherThread>> =
            self.threads.threads.lock().values().cloned().collect();
        for thread in &remaining {
            thread.shutdown_thread();
        }
        for thread in remaining {
            thread.destroy_thread(wait);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_names_are_unique_per_context() {
        let context = ProcessContext::new();
        let first = DispatcherThread::in_context("Main", &context);
        let second = DispatcherThread::in_context("Main", &context);
        first.create_thread(WaitTimeout::Infinite).unwrap();

        let err = second.create_thread(WaitTimeout::Infinite).unwrap_err();
        assert!(matches!(err, Error::DuplicateRegistration { kind: "thread", .. }));

        let found = context.find_thread("Main").unwrap();
        assert!(Arc::ptr_eq(&found, &first));
        assert!(context.threads().find_by_address(&first.address()).is_some());

        // a second context does not see the first one's threads
        let other = ProcessContext::new();
        assert!(other.find_thread("Main").is_none());

        first.destroy_thread(WaitTimeout::Infinite);
        assert!(context.find_thread("Main").is_none());
        assert!(context.threads().is_empty());
    }

    #[test]
    fn test_shutdown_stops_stray_threads() {
        let context = ProcessContext::new();
        let thread = DispatcherThread::in_context("Stray", &context);
        thread.create_thread(WaitTimeout::Infinite).unwrap();
        assert_eq!(context.threads().names(), vec!["Stray".to_string()]);

        context.shutdown(WaitTimeout::Infinite);
        assert!(context.threads().is_empty());
        assert!(!thread.is_running());
    }
}

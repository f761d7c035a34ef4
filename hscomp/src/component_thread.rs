//! Component threads
//!
//! The component-thread flavour of [`DispatcherThread`]: before the
//! dispatch loop it creates and starts the components registered for its
//! name, after the loop it shuts them down. Destruction happens exactly once,
//! either in `destroy_thread` or, if that call did not wait, when the thread
//! finishes.

use crate::component::{ComponentInfo, ComponentInstance};
use crate::dispatcher::{DispatcherThread, ThreadKind};
use crate::context::ProcessContext;
use crate::event::RuntimeId;
use crate::sync::{InterlockedValue, WaitTimeout};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Counters of component lifecycle calls made by one component thread.
#[derive(Debug, Default)]
pub struct LifecycleStats {
    created: InterlockedValue,
    started: InterlockedValue,
    shut_down: InterlockedValue,
    destroy_passes: InterlockedValue,
}

impl LifecycleStats {
    pub fn created(&self) -> u32 {
        self.created.get()
    }

    pub fn started(&self) -> u32 {
        self.started.get()
    }

    pub fn shut_down(&self) -> u32 {
        self.shut_down.get()
    }

    /// Number of times the component list was destroyed; at most one.
    pub fn destroy_passes(&self) -> u32 {
        self.destroy_passes.get()
    }
}

#[derive(Default)]
struct Teardown {
    exited: bool,
    requested: bool,
    done: bool,
}

pub(crate) struct ComponentHost {
    components: Mutex<Vec<Arc<ComponentInstance>>>,
    teardown: Mutex<Teardown>,
    stats: LifecycleStats,
}

impl ComponentHost {
    pub(crate) fn new() -> Self {
        Self {
            components: Mutex::new(Vec::new()),
            teardown: Mutex::new(Teardown::default()),
            stats: LifecycleStats::default(),
        }
    }

    pub(crate) fn stats(&self) -> &LifecycleStats {
        &self.stats
    }

    pub(crate) fn run(&self, thread: &Arc<DispatcherThread>) -> bool {
        let mut clean = false;
        if self.create_components(thread) > 0 {
            self.start_components();
            clean = thread.run_dispatcher();
        }
        self.shutdown_components();
        clean
    }

    fn create_components(&self, thread: &Arc<DispatcherThread>) -> usize {
        let Some(context) = thread.context() else {
            warn!(thread = %thread.name(), "Component thread has no process context");
            return 0;
        };
        let mut created = Vec::new();
        for entry in context.loader().component_entries(thread.name()) {
            if entry.factory().is_none() {
                warn!(thread = %thread.name(), role = entry.role_name(), "Entry has no factory, skipped");
                continue;
            }
            match ComponentInstance::load(&context, thread, &entry) {
                Ok(instance) => {
                    self.stats.created.increment();
                    created.push(Arc::new(instance));
                }
                Err(err) => error!(
                    thread = %thread.name(),
                    role = entry.role_name(),
                    error = %err,
                    "Failed to create component"
                ),
            }
        }
        let count = created.len();
        self.components.lock().extend(created);
        info!(thread = %thread.name(), count, "Components created");
        count
    }

    fn snapshot(&self) -> Vec<Arc<ComponentInstance>> {
        self.components.lock().clone()
    }

    fn start_components(&self) {
        for instance in self.snapshot() {
            instance.startup_component();
            self.stats.started.increment();
        }
    }

    fn shutdown_components(&self) {
        let instances = self.snapshot();
        for instance in &instances {
            instance.shutdown_component();
            self.stats.shut_down.increment();
        }
        for instance in &instances {
            instance.wait_component_completion(WaitTimeout::Infinite);
        }
    }

    pub(crate) fn notify_shutdown(&self) {
        for instance in self.snapshot() {
            instance.notify_component_shutdown();
        }
    }

    pub(crate) fn on_thread_exit(&self) {
        let mut teardown = self.teardown.lock();
        teardown.exited = true;
        if teardown.requested {
            self.destroy_components(&mut teardown);
        }
    }

    /// `finished` tells whether the thread is known to be done; otherwise
    /// destruction is left to the thread's own exit.
    pub(crate) fn request_destroy(&self, finished: bool) {
        let mut teardown = self.teardown.lock();
        teardown.requested = true;
        if finished || teardown.exited {
            self.destroy_components(&mut teardown);
        } else {
            debug!("Component destruction deferred to thread exit");
        }
    }

    fn destroy_components(&self, teardown: &mut Teardown) {
        if teardown.done {
            return;
        }
        teardown.done = true;
        self.stats.destroy_passes.increment();
        let instances = std::mem::take(&mut *self.components.lock());
        let count = instances.len();
        drop(instances);
        debug!(count, "Components destroyed");
    }

    pub(crate) fn find_event_consumer(&self, runtime: RuntimeId) -> Option<Arc<DispatcherThread>> {
        self.components()
            .iter()
            .find_map(|info| info.find_event_consumer(runtime))
    }

    pub(crate) fn components(&self) -> Vec<Arc<ComponentInfo>> {
        self.components
            .lock()
            .iter()
            .map(|instance| instance.info().clone())
            .collect()
    }
}

impl DispatcherThread {
    /// Component thread that creates the components registered for `name`
    /// in the context's loader.
    pub fn component_thread(name: impl Into<String>, context: &Arc<ProcessContext>) -> Arc<Self> {
        Self::with_kind(
            name,
            ThreadKind::Component(ComponentHost::new()),
            Arc::downgrade(context),
        )
    }

    /// Plain dispatcher thread tracked by the context's thread registry.
    pub fn in_context(name: impl Into<String>, context: &Arc<ProcessContext>) -> Arc<Self> {
        Self::with_kind(name, ThreadKind::Plain, Arc::downgrade(context))
    }
}

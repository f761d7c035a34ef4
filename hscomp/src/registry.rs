//! Declarative component model and its loader
//!
//! A [`Model`] groups component threads, each hosting components, each
//! declaring worker threads. Components are built through factory closures
//! stored in their [`ComponentEntry`]. The [`ComponentLoader`] owns all
//! models of a process and starts or stops them as a unit.

use crate::component::{Component, ComponentInfo};
use crate::context::ProcessContext;
use crate::dispatcher::{DispatcherThread, ThreadCompletion};
use crate::error::{Error, Result};
use crate::sync::WaitTimeout;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Builds a component for its entry. `None` means creation failed.
pub type ComponentFactory =
    Arc<dyn Fn(&ComponentEntry, &Arc<ComponentInfo>) -> Option<Box<dyn Component>> + Send + Sync>;

/// Disposes of a component built by the matching factory.
pub type ComponentDeleter = Arc<dyn Fn(Box<dyn Component>, &ComponentEntry) + Send + Sync>;

/// Worker thread declared by a component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerThreadEntry {
    thread_name: String,
    consumer_name: String,
}

impl WorkerThreadEntry {
    pub fn new(thread_name: impl Into<String>, consumer_name: impl Into<String>) -> Self {
        Self {
            thread_name: thread_name.into(),
            consumer_name: consumer_name.into(),
        }
    }

    pub fn thread_name(&self) -> &str {
        &self.thread_name
    }

    pub fn consumer_name(&self) -> &str {
        &self.consumer_name
    }
}

/// One component of a model.
#[derive(Clone)]
pub struct ComponentEntry {
    thread_name: String,
    role_name: String,
    create: Option<ComponentFactory>,
    delete: Option<ComponentDeleter>,
    worker_threads: Vec<WorkerThreadEntry>,
    dependencies: Vec<String>,
}

impl ComponentEntry {
    pub fn new(role_name: impl Into<String>) -> Self {
        Self {
            thread_name: String::new(),
            role_name: role_name.into(),
            create: None,
            delete: None,
            worker_threads: Vec::new(),
            dependencies: Vec::new(),
        }
    }

    pub fn with_factory<F>(mut self, create: F) -> Self
    where
        F: Fn(&ComponentEntry, &Arc<ComponentInfo>) -> Option<Box<dyn Component>>
            + Send
            + Sync
            + 'static,
    {
        self.create = Some(Arc::new(create));
        self
    }

    pub fn with_deleter<F>(mut self, delete: F) -> Self
    where
        F: Fn(Box<dyn Component>, &ComponentEntry) + Send + Sync + 'static,
    {
        self.delete = Some(Arc::new(delete));
        self
    }

    pub fn with_worker_thread(
        mut self,
        thread_name: impl Into<String>,
        consumer_name: impl Into<String>,
    ) -> Self {
        self.worker_threads
            .push(WorkerThreadEntry::new(thread_name, consumer_name));
        self
    }

    /// Declares that this component uses services of `role_name`.
    pub fn with_dependency(mut self, role_name: impl Into<String>) -> Self {
        self.dependencies.push(role_name.into());
        self
    }

    /// Hosting thread; filled in when the entry is added to a thread.
    pub fn thread_name(&self) -> &str {
        &self.thread_name
    }

    pub fn role_name(&self) -> &str {
        &self.role_name
    }

    pub fn factory(&self) -> Option<&ComponentFactory> {
        self.create.as_ref()
    }

    pub fn deleter(&self) -> Option<&ComponentDeleter> {
        self.delete.as_ref()
    }

    pub fn worker_threads(&self) -> &[WorkerThreadEntry] {
        &self.worker_threads
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }
}

impl fmt::Debug for ComponentEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentEntry")
            .field("thread_name", &self.thread_name)
            .field("role_name", &self.role_name)
            .field("has_factory", &self.create.is_some())
            .field("has_deleter", &self.delete.is_some())
            .field("worker_threads", &self.worker_threads)
            .field("dependencies", &self.dependencies)
            .finish()
    }
}

/// A component thread and the components it hosts.
#[derive(Debug, Clone)]
pub struct ComponentThreadEntry {
    thread_name: String,
    components: Vec<ComponentEntry>,
}

impl ComponentThreadEntry {
    pub fn new(thread_name: impl Into<String>) -> Self {
        Self {
            thread_name: thread_name.into(),
            components: Vec::new(),
        }
    }

    pub fn with_component(mut self, mut entry: ComponentEntry) -> Self {
        entry.thread_name = self.thread_name.clone();
        self.components.push(entry);
        self
    }

    pub fn thread_name(&self) -> &str {
        &self.thread_name
    }

    pub fn components(&self) -> &[ComponentEntry] {
        &self.components
    }
}

/// Named set of component threads loaded and unloaded together.
#[derive(Debug, Clone)]
pub struct Model {
    name: String,
    threads: Vec<ComponentThreadEntry>,
}

impl Model {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            threads: Vec::new(),
        }
    }

    pub fn with_thread(mut self, thread: ComponentThreadEntry) -> Self {
        self.threads.push(thread);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn threads(&self) -> &[ComponentThreadEntry] {
        &self.threads
    }

    /// Names of component threads and declared worker threads.
    fn thread_names(&self) -> impl Iterator<Item = &str> {
        self.threads.iter().flat_map(|thread| {
            std::iter::once(thread.thread_name()).chain(
                thread
                    .components
                    .iter()
                    .flat_map(|c| c.worker_threads.iter().map(|w| w.thread_name())),
            )
        })
    }

    fn role_names(&self) -> impl Iterator<Item = &str> {
        self.threads
            .iter()
            .flat_map(|thread| thread.components.iter().map(|c| c.role_name()))
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::configuration("model name is empty", None));
        }
        let mut threads = HashSet::new();
        for name in self.thread_names() {
            if name.is_empty() {
                return Err(Error::configuration(
                    format!("model '{}' declares a thread without name", self.name),
                    None,
                ));
            }
            if !threads.insert(name) {
                return Err(Error::duplicate("thread", name));
            }
        }
        let mut roles = HashSet::new();
        for role in self.role_names() {
            if !roles.insert(role) {
                return Err(Error::duplicate("component", role));
            }
        }
        Ok(())
    }
}

struct ModelSlot {
    model: Model,
    loaded: bool,
    threads: Vec<Arc<DispatcherThread>>,
}

/// Process-wide list of models.
pub struct ComponentLoader {
    models: Mutex<Vec<ModelSlot>>,
}

impl ComponentLoader {
    pub(crate) fn new() -> Self {
        Self {
            models: Mutex::new(Vec::new()),
        }
    }

    /// Adds a model. Duplicate model, thread or role names, within the
    /// model or against models already present, leave the loader unchanged.
    pub fn add_model(&self, model: Model) -> Result<()> {
        model.validate()?;
        let mut models = self.models.lock();
        for slot in models.iter() {
            if slot.model.name == model.name {
                error!(model = %model.name, "Model already registered");
                return Err(Error::duplicate("model", model.name.as_str()));
            }
            let existing: HashSet<&str> = slot.model.thread_names().collect();
            if let Some(name) = model.thread_names().find(|name| existing.contains(name)) {
                error!(model = %model.name, thread = name, "Thread already declared by another model");
                return Err(Error::duplicate("thread", name));
            }
            let existing: HashSet<&str> = slot.model.role_names().collect();
            if let Some(role) = model.role_names().find(|role| existing.contains(role)) {
                error!(model = %model.name, role, "Role already declared by another model");
                return Err(Error::duplicate("component", role));
            }
        }
        debug!(model = %model.name, threads = model.threads.len(), "Model added");
        models.push(ModelSlot {
            model,
            loaded: false,
            threads: Vec::new(),
        });
        Ok(())
    }

    /// Removes a model that is not loaded.
    pub fn remove_model(&self, name: &str) -> Result<Model> {
        let mut models = self.models.lock();
        let index = models
            .iter()
            .position(|slot| slot.model.name == name)
            .ok_or_else(|| Error::not_found("model", name))?;
        if !models[index].threads.is_empty() {
            return Err(Error::invalid_state(name, "Loaded", "remove"));
        }
        Ok(models.remove(index).model)
    }

    pub fn has_model(&self, name: &str) -> bool {
        self.models.lock().iter().any(|slot| slot.model.name == name)
    }

    pub fn model_names(&self) -> Vec<String> {
        self.models
            .lock()
            .iter()
            .map(|slot| slot.model.name.clone())
            .collect()
    }

    pub fn is_model_loaded(&self, name: &str) -> bool {
        self.models
            .lock()
            .iter()
            .any(|slot| slot.model.name == name && slot.loaded)
    }

    /// Component entries hosted by the named component thread.
    pub fn component_entries(&self, thread_name: &str) -> Vec<ComponentEntry> {
        self.models
            .lock()
            .iter()
            .flat_map(|slot| slot.model.threads.iter())
            .filter(|thread| thread.thread_name == thread_name)
            .flat_map(|thread| thread.components.iter().cloned())
            .collect()
    }

    /// Finds the entry of a role in any model.
    pub fn find_component_entry(&self, role_name: &str) -> Option<ComponentEntry> {
        self.models
            .lock()
            .iter()
            .flat_map(|slot| slot.model.threads.iter())
            .flat_map(|thread| thread.components.iter())
            .find(|entry| entry.role_name == role_name)
            .cloned()
    }

    /// Starts the component threads of one model, or of all models not yet
    /// loaded.
    ///
    /// Stops at the first thread that fails to start. Threads started before
    /// the failure keep running until the model is unloaded.
    pub(crate) fn load_model(&self, context: &Arc<ProcessContext>, name: Option<&str>) -> Result<()> {
        let pending: Vec<Model> = {
            let models = self.models.lock();
            if let Some(name) = name {
                if !models.iter().any(|slot| slot.model.name == name) {
                    return Err(Error::not_found("model", name));
                }
            }
            models
                .iter()
                .filter(|slot| name.map_or(true, |name| slot.model.name == name))
                .filter(|slot| slot.threads.is_empty())
                .map(|slot| slot.model.clone())
                .collect()
        };

        for model in pending {
            info!(model = %model.name, "Loading model");
            for thread_entry in &model.threads {
                let thread = DispatcherThread::component_thread(thread_entry.thread_name(), context);
                if let Err(err) = thread.create_thread(WaitTimeout::Infinite) {
                    error!(
                        model = %model.name,
                        thread = thread_entry.thread_name(),
                        error = %err,
                        "Failed to start component thread, model load aborted"
                    );
                    return Err(err);
                }
                self.attach_thread(&model.name, thread);
            }
            self.mark_loaded(&model.name);
        }
        Ok(())
    }

    fn attach_thread(&self, model: &str, thread: Arc<DispatcherThread>) {
        if let Some(slot) = self.models.lock().iter_mut().find(|slot| slot.model.name == model) {
            slot.threads.push(thread);
        }
    }

    fn mark_loaded(&self, model: &str) {
        if let Some(slot) = self.models.lock().iter_mut().find(|slot| slot.model.name == model) {
            slot.loaded = true;
        }
    }

    /// Stops the component threads of one model or of all models: every
    /// thread is signalled first, then each is destroyed with `wait`.
    pub(crate) fn unload_model(&self, name: Option<&str>, wait: WaitTimeout) -> Result<()> {
        let threads: Vec<Arc<DispatcherThread>> = {
            let mut models = self.models.lock();
            if let Some(name) = name {
                if !models.iter().any(|slot| slot.model.name == name) {
                    return Err(Error::not_found("model", name));
                }
            }
            models
                .iter_mut()
                .filter(|slot| name.map_or(true, |name| slot.model.name == name))
                .flat_map(|slot| {
                    slot.loaded = false;
                    std::mem::take(&mut slot.threads)
                })
                .collect()
        };

        for thread in &threads {
            thread.shutdown_thread();
        }
        let mut abandoned = Vec::new();
        for thread in threads {
            let completion = thread.destroy_thread(wait);
            debug!(thread = %thread.name(), ?completion, "Component thread unloaded");
            if completion == ThreadCompletion::Abandoned {
                abandoned.push(thread.name().to_string());
            }
        }
        if !abandoned.is_empty() {
            return Err(Error::timeout(
                format!("shutdown of {}", abandoned.join(", ")),
                wait.as_millis(),
            ));
        }
        Ok(())
    }
}

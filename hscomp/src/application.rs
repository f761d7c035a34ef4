//! Process-level entry point: logging, settings, the process context and
//! the connection to the message router

use crate::config::AppConfig;
use crate::context::ProcessContext;
use crate::error::{Error, Result};
use crate::logging::{self, LoggingHandle};
use crate::registry::Model;
use crate::remote::{InstanceInfo, MessageSource, RemoteServiceClient};
use crate::sync::WaitTimeout;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Hooks around reading and saving persisted settings.
///
/// Reading calls `prepare_read`, `post_read` and then `on_setup`; saving
/// calls `prepare_save` and `post_save`. The store is unlocked while a hook
/// runs, so hooks may read and change properties.
pub trait ConfigurationListener: Send + Sync {
    fn prepare_read(&self, settings: &ConfigManager) {
        let _ = settings;
    }

    fn post_read(&self, settings: &ConfigManager) {
        let _ = settings;
    }

    fn on_setup(&self, settings: &ConfigManager) {
        let _ = settings;
    }

    fn prepare_save(&self, settings: &ConfigManager) {
        let _ = settings;
    }

    fn post_save(&self, settings: &ConfigManager) {
        let _ = settings;
    }
}

/// String properties persisted as a flat TOML table.
pub struct ConfigManager {
    path: Option<PathBuf>,
    properties: RwLock<BTreeMap<String, String>>,
    listeners: RwLock<Vec<Arc<dyn ConfigurationListener>>>,
}

impl ConfigManager {
    /// A store without a file keeps properties in memory only.
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            properties: RwLock::new(BTreeMap::new()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn add_listener(&self, listener: Arc<dyn ConfigurationListener>) {
        self.listeners.write().push(listener);
    }

    fn notify(&self, hook: impl Fn(&dyn ConfigurationListener, &ConfigManager)) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            hook(listener.as_ref(), self);
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.properties.read().get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.properties.write().insert(key.into(), value.into())
    }

    pub fn remove(&self, key: &str) -> Option<String> {
        self.properties.write().remove(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.properties.read().keys().cloned().collect()
    }

    /// Loads the file, if there is one, over the current properties.
    pub fn read(&self) -> Result<()> {
        self.notify(|listener, settings| listener.prepare_read(settings));
        if let Some(path) = self.path.as_deref().filter(|path| path.exists()) {
            let text = std::fs::read_to_string(path).map_err(|err| {
                Error::io(format!("Failed to read settings from {}", path.display()), err)
            })?;
            let loaded: BTreeMap<String, String> = toml::from_str(&text)?;
            debug!(path = %path.display(), count = loaded.len(), "Settings read");
            self.properties.write().extend(loaded);
        }
        self.notify(|listener, settings| listener.post_read(settings));
        self.notify(|listener, settings| listener.on_setup(settings));
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        self.notify(|listener, settings| listener.prepare_save(settings));
        if let Some(path) = self.path.as_deref() {
            if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .map_err(|err| Error::io(format!("Failed to create {}", parent.display()), err))?;
            }
            let text = toml::to_string(&*self.properties.read())?;
            std::fs::write(path, text).map_err(|err| {
                Error::io(format!("Failed to write settings to {}", path.display()), err)
            })?;
            debug!(path = %path.display(), "Settings saved");
        }
        self.notify(|listener, settings| listener.post_save(settings));
        Ok(())
    }
}

/// Builds an [`Application`].
pub struct ApplicationBuilder {
    name: String,
    config: AppConfig,
    install_logging: bool,
    models: Vec<Model>,
    listeners: Vec<Arc<dyn ConfigurationListener>>,
}

impl ApplicationBuilder {
    pub fn config(mut self, config: AppConfig) -> Self {
        self.config = config;
        self
    }

    /// Reads the configuration from a TOML file, defaults when it is missing.
    pub fn config_file(mut self, path: impl AsRef<Path>) -> Result<Self> {
        self.config = AppConfig::load_or_default(path)?;
        Ok(self)
    }

    /// Whether `init` installs the global tracing subscriber.
    pub fn install_logging(mut self, install: bool) -> Self {
        self.install_logging = install;
        self
    }

    pub fn model(mut self, model: Model) -> Self {
        self.models.push(model);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn ConfigurationListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn init(self) -> Result<Application> {
        Application::init(self)
    }
}

struct RemoteLink {
    client: Arc<RemoteServiceClient>,
    runtime: tokio::runtime::Runtime,
}

/// One per process: owns the context every component thread runs in.
///
/// Dropping the application releases it. It must not be dropped from inside
/// an async runtime since the router connection has a runtime of its own.
pub struct Application {
    name: String,
    config: AppConfig,
    context: Arc<ProcessContext>,
    settings: ConfigManager,
    logging: Option<LoggingHandle>,
    remote: Option<RemoteLink>,
    released: bool,
}

impl Application {
    pub fn builder(name: impl Into<String>) -> ApplicationBuilder {
        ApplicationBuilder {
            name: name.into(),
            config: AppConfig::default(),
            install_logging: true,
            models: Vec::new(),
            listeners: Vec::new(),
        }
    }

    fn init(builder: ApplicationBuilder) -> Result<Self> {
        let ApplicationBuilder {
            name,
            config,
            install_logging,
            models,
            listeners,
        } = builder;
        config.validate()?;

        let logging = if install_logging && config.logging.enabled {
            match logging::init(&config.logging) {
                Ok(handle) => Some(handle),
                Err(err) => {
                    warn!(error = %err, "Logging not installed");
                    None
                }
            }
        } else {
            None
        };

        let settings = ConfigManager::new(config.persistence.clone());
        for listener in listeners {
            settings.add_listener(listener);
        }
        settings.read()?;

        let (context, remote) = if config.router.enabled {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(1)
                .thread_name(format!("{name}-remote"))
                .enable_all()
                .build()
                .map_err(|err| Error::runtime("Failed to build the router connection runtime", err))?;
            let client = RemoteServiceClient::tcp(
                config.router.clone(),
                InstanceInfo::current(name.clone(), MessageSource::Client),
            );
            runtime.spawn(client.clone().run());
            info!(endpoint = %config.router.endpoint(), "Connecting to message router");
            let context = ProcessContext::with_service_manager(client.clone());
            (context, Some(RemoteLink { client, runtime }))
        } else {
            (ProcessContext::new(), None)
        };

        for model in models {
            context.loader().add_model(model)?;
        }
        info!(application = %name, "Application initialized");
        Ok(Self {
            name,
            config,
            context,
            settings,
            logging,
            remote,
            released: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn context(&self) -> &Arc<ProcessContext> {
        &self.context
    }

    pub fn settings(&self) -> &ConfigManager {
        &self.settings
    }

    /// Present when `init` installed the tracing subscriber.
    pub fn logging(&self) -> Option<&LoggingHandle> {
        self.logging.as_ref()
    }

    pub fn remote(&self) -> Option<&Arc<RemoteServiceClient>> {
        self.remote.as_ref().map(|link| &link.client)
    }

    pub fn add_model(&self, model: Model) -> Result<()> {
        self.context.loader().add_model(model)
    }

    /// Starts one model, or all of them for `None`.
    pub fn load_model(&self, name: Option<&str>) -> Result<()> {
        self.context.load_model(name)
    }

    pub fn unload_model(&self, name: Option<&str>, wait: WaitTimeout) -> Result<()> {
        self.context.unload_model(name, wait)
    }

    /// Stops all models, saves the settings and closes the router connection.
    pub fn release(mut self) -> Result<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<()> {
        if std::mem::replace(&mut self.released, true) {
            return Ok(());
        }
        self.context.shutdown(WaitTimeout::Infinite);
        let saved = if self.settings.path().is_some() {
            self.settings.save()
        } else {
            Ok(())
        };
        if let Some(link) = self.remote.take() {
            link.client.stop();
            link.runtime
                .shutdown_timeout(self.config.router.retry_interval() + Duration::from_secs(1));
        }
        info!(application = %self.name, "Application released");
        saved
    }
}

impl Drop for Application {
    fn drop(&mut self) {
        if let Err(err) = self.release_inner() {
            warn!(error = %err, "Release failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::Component;
    use crate::registry::{ComponentEntry, ComponentThreadEntry};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<&'static str>>,
    }

    impl ConfigurationListener for Recorder {
        fn prepare_read(&self, _: &ConfigManager) {
            self.calls.lock().push("prepare_read");
        }

        fn post_read(&self, settings: &ConfigManager) {
            self.calls.lock().push("post_read");
            if settings.get("theme").is_none() {
                settings.set("theme", "dark");
            }
        }

        fn on_setup(&self, _: &ConfigManager) {
            self.calls.lock().push("on_setup");
        }

        fn prepare_save(&self, _: &ConfigManager) {
            self.calls.lock().push("prepare_save");
        }

        fn post_save(&self, _: &ConfigManager) {
            self.calls.lock().push("post_save");
        }
    }

    #[test]
    fn test_settings_hooks_fire_in_order_and_persist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings").join("app.toml");
        let recorder = Arc::new(Recorder::default());

        let settings = ConfigManager::new(Some(path.clone()));
        settings.add_listener(recorder.clone());
        settings.read().unwrap();
        settings.set("volume", "7");
        settings.save().unwrap();
        assert_eq!(
            *recorder.calls.lock(),
            ["prepare_read", "post_read", "on_setup", "prepare_save", "post_save"]
        );

        let reloaded = ConfigManager::new(Some(path));
        reloaded.read().unwrap();
        assert_eq!(reloaded.get("theme").as_deref(), Some("dark"));
        assert_eq!(reloaded.get("volume").as_deref(), Some("7"));
        assert_eq!(reloaded.keys(), ["theme".to_string(), "volume".to_string()]);
    }

    #[test]
    fn test_broken_settings_file_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "volume = [").unwrap();
        let err = ConfigManager::new(Some(path)).read().unwrap_err();
        assert_eq!(err.category(), "configuration");
    }

    struct Idle;

    impl Component for Idle {}

    #[test]
    fn test_application_loads_and_releases_models() {
        let model = Model::new("Local").with_thread(
            ComponentThreadEntry::new("AppMain").with_component(
                ComponentEntry::new("AppIdle").with_factory(|_, _| Some(Box::new(Idle) as Box<dyn Component>)),
            ),
        );
        let app = Application::builder("unit")
            .install_logging(false)
            .model(model)
            .init()
            .unwrap();
        assert!(app.remote().is_none());
        assert!(app.logging().is_none());

        app.load_model(Some("Local")).unwrap();
        assert!(app.context().loader().is_model_loaded("Local"));
        assert!(app.context().find_component("AppIdle").is_some());

        let context = app.context().clone();
        app.release().unwrap();
        assert!(context.threads().is_empty());
        assert!(context.find_component("AppIdle").is_none());
    }
}

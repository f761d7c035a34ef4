//! # hscomp - Event-driven component framework
//!
//! Components live on dispatcher threads and talk to each other only through
//! events. A declarative model describes which component threads exist,
//! which components each of them hosts and which worker threads a component
//! binds; loading the model starts everything, unloading stops it again.
//! Processes find each other's services through a message router.
//!
//! ## Quick Start
//!
//! ### Events and consumers
//!
//! ```rust,no_run
//! use hscomp::{DispatcherThread, Event, EventHandler, RuntimeId, WaitTimeout};
//!
//! #[derive(Debug)]
//! struct Tick(u32);
//!
//! impl Event for Tick {}
//!
//! fn main() -> hscomp::Result<()> {
//!     let thread = DispatcherThread::new("Ticker");
//!     thread.register_consumer(
//!         RuntimeId::of::<Tick>(),
//!         Box::new(EventHandler::new(|tick: &Tick| println!("tick {}", tick.0))),
//!     )?;
//!     thread.create_thread(WaitTimeout::Infinite)?;
//!
//!     thread.post(Tick(1));
//!     thread.shutdown_thread();
//!     thread.destroy_thread(WaitTimeout::Infinite);
//!     Ok(())
//! }
//! ```
//!
//! ### Models and components
//!
//! ```rust,no_run
//! use hscomp::{
//!     Application, Component, ComponentEntry, ComponentInfo, ComponentThreadEntry, Model,
//!     WaitTimeout,
//! };
//! use std::sync::Arc;
//!
//! struct Sensor;
//!
//! impl Component for Sensor {
//!     fn startup(&mut self, info: &Arc<ComponentInfo>) {
//!         tracing::info!(role = info.role_name(), "sensor up");
//!     }
//! }
//!
//! fn main() -> hscomp::Result<()> {
//!     let model = Model::new("Demo").with_thread(
//!         ComponentThreadEntry::new("SensorThread").with_component(
//!             ComponentEntry::new("Sensor")
//!                 .with_factory(|_, _| Some(Box::new(Sensor) as Box<dyn Component>)),
//!         ),
//!     );
//!     let app = Application::builder("demo").model(model).init()?;
//!     app.load_model(Some("Demo"))?;
//!     app.unload_model(Some("Demo"), WaitTimeout::Infinite)?;
//!     app.release()
//! }
//! ```
//!
//! ## Available Macros
//!
//! - `#[derive(Event)]` - Implement the [`Event`] trait, with
//!   `#[event(target = "internal" | "external", kind = "custom" | "service")]`
//!
//! For detailed macro usage, see the [`macros`] module.

extern crate self as hscomp;

pub mod address;
pub mod application;
pub mod component;
pub mod component_thread;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod host;
pub mod logging;
pub mod queue;
pub mod registry;
pub mod remote;
pub mod service;
pub mod sync;
pub mod worker;

#[cfg(test)]
mod tests;

#[cfg(test)]
mod error_tests;

// Re-exports
pub use address::{ComponentAddress, ThreadAddress};
pub use application::{Application, ApplicationBuilder, ConfigManager, ConfigurationListener};
pub use component::{Component, ComponentInfo};
pub use component_thread::LifecycleStats;
pub use config::{AppConfig, LoggingConfig, RemoteServiceConfig};
pub use context::ProcessContext;
pub use dispatcher::{DispatcherThread, ThreadCompletion, ThreadState};
pub use error::{Error, Result};
pub use event::{Event, EventConsumer, EventHandler, EventType, ExitEvent, RuntimeId};
pub use queue::EventQueue;
pub use registry::{
    ComponentEntry, ComponentLoader, ComponentThreadEntry, Model, WorkerThreadEntry,
};
pub use service::{
    ClientAddress, LocalServiceManager, ServiceAddress, ServiceManager, Stub, Version,
};
pub use sync::{Lockable, WaitTimeout};
pub use worker::WorkerThreadConsumer;

// Re-export macros when feature is enabled
#[cfg(feature = "macros")]
pub use hscomp_macros::Event;

// Macro usage documentation
#[cfg(feature = "macros")]
pub mod macros {
    //! Macro usage examples and documentation

    /// # Event Derive Macro (`#[derive(Event)]`)
    ///
    /// Implements the [`Event`](trait@crate::Event) trait. Without an
    /// attribute the event is a custom event delivered through the external
    /// queue, which is what worker threads accept.
    ///
    /// ## Usage
    /// ```rust,ignore
    /// use hscomp::{DispatcherThread, Event};
    ///
    /// #[derive(Event, Debug, Clone)]
    /// pub struct TemperatureChanged {
    ///     pub value: f64,
    /// }
    ///
    /// // Processed before the next external event when posted by the
    /// // dispatcher thread to itself
    /// #[derive(Event, Debug)]
    /// #[event(target = "internal")]
    /// pub struct Recalculate;
    ///
    /// // Service plumbing, refused by worker threads
    /// #[derive(Event, Debug)]
    /// #[event(kind = "service")]
    /// pub struct ConnectionChanged {
    ///     pub connected: bool,
    /// }
    /// ```
    pub use crate::Event;
}

// Re-export commonly used dependencies
pub use async_trait::async_trait;
pub use bincode;
pub use serde::{Deserialize, Serialize};

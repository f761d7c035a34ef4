//! Dispatcher threads
//!
//! A [`DispatcherThread`] is one OS thread that owns an event queue and a
//! table of consumers keyed by event runtime type. Any thread may post; only
//! the owning thread dispatches. Component threads and worker threads are the
//! same struct with a different [`ThreadKind`], which decides what happens
//! around the dispatch loop and where unresolved consumer lookups go next.

use crate::address::ThreadAddress;
use crate::component::ComponentInfo;
use crate::component_thread::{ComponentHost, LifecycleStats};
use crate::context::ProcessContext;
use crate::error::{Error, Result};
use crate::event::{Event, EventConsumer, EventHandler, ExitEvent, RuntimeId};
use crate::queue::EventQueue;
use crate::sync::{InterlockedValue, ResetMode, SyncEvent, WaitTimeout};
use crate::worker::WorkerBinding;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use tracing::{debug, error, info_span, warn};

static NEXT_THREAD_ID: InterlockedValue = InterlockedValue::new(0);

thread_local! {
    static CURRENT_THREAD: RefCell<Option<Arc<DispatcherThread>>> = RefCell::new(None);
}

/// Lifecycle of a dispatcher thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Constructed, not started
    Idle,
    /// Dispatch loop active
    Running,
    /// Exit event enqueued, loop draining
    ShuttingDown,
    /// Loop returned, thread finished or finishing
    Stopped,
    /// Torn down by `destroy_thread`
    Destroyed,
}

/// How `destroy_thread` ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadCompletion {
    /// The OS thread finished and was joined.
    Completed,
    /// The caller asked not to wait; the thread finishes on its own.
    Detached,
    /// The shutdown deadline elapsed. The thread was left running instead of
    /// being killed and its resources are reclaimed whenever it finishes.
    Abandoned,
    /// The thread was never started or was already destroyed.
    Invalid,
}

pub(crate) enum ThreadKind {
    Plain,
    Component(ComponentHost),
    Worker(WorkerBinding),
}

struct ConsumerSlot {
    consumer: Arc<Mutex<Box<dyn EventConsumer>>>,
    component: Option<Arc<ComponentInfo>>,
}

/// Thread owning an event queue and a consumer registry.
pub struct DispatcherThread {
    name: String,
    address: Mutex<ThreadAddress>,
    kind: ThreadKind,
    context: Weak<ProcessContext>,
    external: EventQueue,
    internal: EventQueue,
    consumers: DashMap<RuntimeId, ConsumerSlot>,
    state: Mutex<ThreadState>,
    handle: Mutex<Option<JoinHandle<()>>>,
    started: SyncEvent,
    completed: SyncEvent,
    clean_exit: AtomicBool,
    this: Weak<DispatcherThread>,
}

impl DispatcherThread {
    /// Plain dispatcher thread that is not tracked by any process context.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Self::with_kind(name, ThreadKind::Plain, Weak::new())
    }

    pub(crate) fn with_kind(
        name: impl Into<String>,
        kind: ThreadKind,
        context: Weak<ProcessContext>,
    ) -> Arc<Self> {
        let name = name.into();
        Arc::new_cyclic(|this| Self {
            address: Mutex::new(ThreadAddress::unassigned(name.clone())),
            name,
            kind,
            context,
            external: EventQueue::new(),
            internal: EventQueue::new(),
            consumers: DashMap::new(),
            state: Mutex::new(ThreadState::Idle),
            handle: Mutex::new(None),
            started: SyncEvent::new(ResetMode::Manual, false),
            completed: SyncEvent::new(ResetMode::Manual, false),
            clean_exit: AtomicBool::new(false),
            this: this.clone(),
        })
    }

    /// Dispatcher thread the calling OS thread runs, if any.
    pub fn current() -> Option<Arc<DispatcherThread>> {
        CURRENT_THREAD.with(|current| current.borrow().clone())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> ThreadAddress {
        self.address.lock().clone()
    }

    pub fn state(&self) -> ThreadState {
        *self.state.lock()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), ThreadState::Running | ThreadState::ShuttingDown)
    }

    pub fn is_component_thread(&self) -> bool {
        matches!(self.kind, ThreadKind::Component(_))
    }

    pub fn is_worker_thread(&self) -> bool {
        matches!(self.kind, ThreadKind::Worker(_))
    }

    /// True when called from this thread.
    pub fn is_current(&self) -> bool {
        CURRENT_THREAD.with(|current| {
            current
                .borrow()
                .as_ref()
                .map_or(false, |thread| std::ptr::eq(Arc::as_ptr(thread), self))
        })
    }

    /// Whether the last dispatch loop ended through an exit event.
    pub fn exited_cleanly(&self) -> bool {
        self.clean_exit.load(Ordering::Acquire)
    }

    pub fn context(&self) -> Option<Arc<ProcessContext>> {
        self.context.upgrade()
    }

    /// Components hosted by a component thread; empty for other kinds.
    pub fn components(&self) -> Vec<Arc<ComponentInfo>> {
        match &self.kind {
            ThreadKind::Component(host) => host.components(),
            _ => Vec::new(),
        }
    }

    /// Component this worker thread is bound to.
    pub fn binding_component(&self) -> Option<Arc<ComponentInfo>> {
        match &self.kind {
            ThreadKind::Worker(binding) => binding.component(),
            _ => None,
        }
    }

    pub fn lifecycle_stats(&self) -> Option<&LifecycleStats> {
        match &self.kind {
            ThreadKind::Component(host) => Some(host.stats()),
            _ => None,
        }
    }

    pub fn pending_events(&self) -> usize {
        self.external.len() + self.internal.len()
    }

    /// Registers the consumer for one event runtime type.
    ///
    /// A type already registered on this thread is rejected; unregister the
    /// old consumer first.
    pub fn register_consumer(
        &self,
        runtime: RuntimeId,
        consumer: Box<dyn EventConsumer>,
    ) -> Result<()> {
        match self.consumers.entry(runtime) {
            Entry::Occupied(_) => {
                error!(
                    thread = %self.name,
                    event = %runtime,
                    "Consumer already registered for this event type"
                );
                Err(Error::duplicate("consumer", runtime.name()))
            }
            Entry::Vacant(slot) => {
                slot.insert(ConsumerSlot {
                    consumer: Arc::new(Mutex::new(consumer)),
                    component: self.enclosing_component(),
                });
                debug!(thread = %self.name, event = %runtime, "Consumer registered");
                Ok(())
            }
        }
    }

    /// Registers a typed closure as the consumer of `E`.
    pub fn register_handler<E, F>(&self, handler: F) -> Result<()>
    where
        E: Event,
        F: FnMut(&E) + Send + 'static,
    {
        self.register_consumer(RuntimeId::of::<E>(), Box::new(EventHandler::new(handler)))
    }

    pub fn unregister_consumer(&self, runtime: RuntimeId) -> bool {
        let removed = self.consumers.remove(&runtime).is_some();
        if removed {
            debug!(thread = %self.name, event = %runtime, "Consumer unregistered");
        }
        removed
    }

    /// True if this thread itself has a consumer for the type.
    pub fn has_consumer(&self, runtime: RuntimeId) -> bool {
        self.consumers.contains_key(&runtime)
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// Resolves the thread that consumes events of `runtime`.
    ///
    /// Own registrations win. A component thread then asks its components,
    /// which ask their worker threads; a worker thread asks its binding
    /// component, which reaches the component thread and sibling workers.
    pub fn get_event_consumer_thread(&self, runtime: RuntimeId) -> Option<Arc<DispatcherThread>> {
        if self.has_consumer(runtime) {
            return self.this.upgrade();
        }
        match &self.kind {
            ThreadKind::Plain => None,
            ThreadKind::Component(host) => host.find_event_consumer(runtime),
            ThreadKind::Worker(binding) => binding.find_event_consumer(runtime),
        }
    }

    /// Routes an event to the thread that consumes it.
    ///
    /// Returns false and destroys the event when no consumer is reachable,
    /// when the target queue is closed, or when a worker thread is handed a
    /// non-custom event.
    pub fn post_event(&self, event: Box<dyn Event>) -> bool {
        if !self.accepts(event.as_ref()) {
            return false;
        }
        let runtime = event.runtime_id();
        match self.get_event_consumer_thread(runtime) {
            Some(target) => target.enqueue(event),
            None => {
                debug!(thread = %self.name, event = %runtime, "No consumer registered, event dropped");
                false
            }
        }
    }

    pub fn post<E: Event>(&self, event: E) -> bool {
        self.post_event(Box::new(event))
    }

    fn accepts(&self, event: &dyn Event) -> bool {
        if self.is_worker_thread() && !event.event_type().is_custom() {
            error!(
                thread = %self.name,
                event = %event.runtime_id(),
                event_type = ?event.event_type(),
                "Worker threads accept only custom events, event dropped"
            );
            return false;
        }
        true
    }

    fn enqueue(&self, event: Box<dyn Event>) -> bool {
        if !self.accepts(event.as_ref()) {
            return false;
        }
        let queue = if event.event_type().is_internal() && self.is_current() {
            &self.internal
        } else {
            &self.external
        };
        match queue.push_event(event) {
            Ok(()) => true,
            Err(event) => {
                debug!(
                    thread = %self.name,
                    event = %event.runtime_id(),
                    "Queue closed, event dropped"
                );
                false
            }
        }
    }

    /// Starts the OS thread and waits up to `wait` for its dispatch loop.
    ///
    /// Returns whether the loop signalled readiness in time. Names are
    /// unique per process context.
    pub fn create_thread(&self, wait: WaitTimeout) -> Result<bool> {
        let this = self
            .this
            .upgrade()
            .ok_or_else(|| Error::thread_msg(format!("dispatcher '{}' is being dropped", self.name)))?;
        {
            let mut state = self.state.lock();
            if *state != ThreadState::Idle {
                return Err(Error::invalid_state(&self.name, *state, "create"));
            }
            *self.address.lock() = ThreadAddress::new(NEXT_THREAD_ID.increment(), self.name.clone());
            if let Some(context) = self.context() {
                context.threads().register(&this)?;
            }
            *state = ThreadState::Running;
        }

        let spawned = std::thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || this.thread_main());
        match spawned {
            Ok(handle) => *self.handle.lock() = Some(handle),
            Err(err) => {
                *self.state.lock() = ThreadState::Idle;
                if let Some(context) = self.context() {
                    context.threads().unregister(self);
                }
                return Err(Error::thread(
                    format!("Failed to spawn dispatcher '{}'", self.name),
                    err,
                ));
            }
        }

        debug!(thread = %self.address(), "Dispatcher thread created");
        Ok(self.started.wait(wait))
    }

    fn thread_main(self: Arc<Self>) {
        CURRENT_THREAD.with(|current| *current.borrow_mut() = Some(self.clone()));
        let span = info_span!("dispatcher", thread = %self.address());
        let clean = {
            let _entered = span.enter();
            match panic::catch_unwind(AssertUnwindSafe(|| self.run())) {
                Ok(clean) => clean,
                Err(_) => {
                    error!("Dispatcher thread panicked");
                    false
                }
            }
        };
        self.clean_exit.store(clean, Ordering::Release);
        {
            let mut state = self.state.lock();
            if matches!(*state, ThreadState::Running | ThreadState::ShuttingDown) {
                *state = ThreadState::Stopped;
            }
        }
        let dropped = self.external.close() + self.internal.close();
        if dropped > 0 {
            debug!(thread = %self.name, dropped, "Pending events destroyed at thread exit");
        }
        if let ThreadKind::Component(host) = &self.kind {
            host.on_thread_exit();
        }
        if let Some(context) = self.context() {
            context.threads().unregister(&self);
        }
        CURRENT_THREAD.with(|current| current.borrow_mut().take());
        self.started.set();
        self.completed.set();
    }

    fn run(self: &Arc<Self>) -> bool {
        match &self.kind {
            ThreadKind::Plain => self.run_dispatcher(),
            ThreadKind::Component(host) => host.run(self),
            ThreadKind::Worker(binding) => binding.run(self),
        }
    }

    /// Dispatch loop. Returns true iff it ended on an exit event.
    pub(crate) fn run_dispatcher(&self) -> bool {
        self.started.set();
        loop {
            let event = match self.internal.pop_event(WaitTimeout::DoNotWait) {
                Some(event) => event,
                None => match self.external.pop_event(WaitTimeout::Infinite) {
                    Some(event) => event,
                    None => return false,
                },
            };
            if event.event_type().is_exit() {
                debug!(thread = %self.name, "Exit event received");
                return true;
            }
            self.dispatch(event);
        }
    }

    fn dispatch(&self, event: Box<dyn Event>) {
        let runtime = event.runtime_id();
        let slot = self
            .consumers
            .get(&runtime)
            .map(|slot| (slot.consumer.clone(), slot.component.clone()));
        match slot {
            Some((consumer, component)) => {
                let _scope = component.map(crate::component::ComponentScope::enter);
                consumer.lock().process_event(event.as_ref());
            }
            None => debug!(
                thread = %self.name,
                event = %runtime,
                "Consumer left before dispatch, event dropped"
            ),
        }
    }

    fn enclosing_component(&self) -> Option<Arc<ComponentInfo>> {
        ComponentInfo::current().filter(|info| info.is_hosted_by(self))
    }

    /// Asks the dispatch loop to finish by enqueueing an exit event.
    ///
    /// Cooperative and non-blocking. Component threads also signal the
    /// worker threads of their components.
    pub fn shutdown_thread(&self) -> bool {
        {
            let mut state = self.state.lock();
            match *state {
                ThreadState::Running => *state = ThreadState::ShuttingDown,
                ThreadState::ShuttingDown => return true,
                _ => return false,
            }
        }
        if let ThreadKind::Component(host) = &self.kind {
            host.notify_shutdown();
        }
        if self.external.push_event(Box::new(ExitEvent)).is_err() {
            debug!(thread = %self.name, "Queue already closed at shutdown");
        }
        true
    }

    /// Shuts the thread down and reclaims it.
    ///
    /// `DoNotWait` detaches, `Infinite` joins, and a finite timeout joins if
    /// the thread finishes in time or abandons it otherwise. Component
    /// threads destroy their components once the thread has finished.
    pub fn destroy_thread(&self, wait: WaitTimeout) -> ThreadCompletion {
        let completion = match self.state() {
            ThreadState::Idle | ThreadState::Destroyed => ThreadCompletion::Invalid,
            _ => {
                self.shutdown_thread();
                self.await_completion(wait)
            }
        };
        *self.state.lock() = ThreadState::Destroyed;
        if let ThreadKind::Component(host) = &self.kind {
            let finished = matches!(
                completion,
                ThreadCompletion::Completed | ThreadCompletion::Invalid
            );
            host.request_destroy(finished);
        }
        debug!(thread = %self.name, ?completion, "Dispatcher thread destroyed");
        completion
    }

    fn await_completion(&self, wait: WaitTimeout) -> ThreadCompletion {
        if self.is_current() {
            warn!(thread = %self.name, "A thread cannot wait for its own completion");
            self.handle.lock().take();
            return ThreadCompletion::Detached;
        }
        let finished = match wait {
            WaitTimeout::DoNotWait => self.completed.is_signaled(),
            _ => self.completed.wait(wait),
        };
        if finished {
            self.join();
            return ThreadCompletion::Completed;
        }
        self.handle.lock().take();
        if wait == WaitTimeout::DoNotWait {
            ThreadCompletion::Detached
        } else {
            warn!(
                thread = %self.name,
                timeout_ms = wait.as_millis(),
                "Thread did not finish in time and was abandoned"
            );
            ThreadCompletion::Abandoned
        }
    }

    fn join(&self) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!(thread = %self.name, "Dispatcher thread ended with a panic");
            }
        }
    }

    /// Blocks until the OS thread has finished, independent of shutdown.
    pub fn completion_wait(&self, wait: WaitTimeout) -> bool {
        if self.state() == ThreadState::Idle {
            return false;
        }
        self.completed.wait(wait)
    }
}

impl std::fmt::Debug for DispatcherThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatcherThread")
            .field("address", &self.address())
            .field("state", &self.state())
            .field("consumers", &self.consumers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Duration;

    #[derive(Debug)]
    struct Count(usize);

    impl Event for Count {}

    #[derive(Debug)]
    struct Unrouted;

    impl Event for Unrouted {}

    #[derive(Debug)]
    struct Blocker(mpsc::Receiver<()>);

    impl Event for Blocker {}

    #[test]
    fn test_fifo_delivery_from_one_producer() {
        let thread = DispatcherThread::new("fifo");
        let (tx, rx) = mpsc::channel();
        thread
            .register_handler(move |event: &Count| tx.send(event.0).unwrap())
            .unwrap();
        assert!(thread.create_thread(WaitTimeout::Infinite).unwrap());

        for i in 0..200 {
            assert!(thread.post(Count(i)));
        }
        let received: Vec<usize> = (0..200)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(received, (0..200).collect::<Vec<_>>());

        assert_eq!(thread.destroy_thread(WaitTimeout::Infinite), ThreadCompletion::Completed);
        assert!(thread.exited_cleanly());
        assert_eq!(thread.state(), ThreadState::Destroyed);
    }

    #[test]
    fn test_unroutable_event_is_dropped() {
        let thread = DispatcherThread::new("drop");
        thread.register_handler(|_: &Count| {}).unwrap();
        assert!(!thread.post(Unrouted));
        assert_eq!(thread.pending_events(), 0);
    }

    #[test]
    fn test_second_consumer_for_same_type_is_rejected() {
        let thread = DispatcherThread::new("dup");
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let (a, b) = (first.clone(), second.clone());
        thread
            .register_handler(move |_: &Count| {
                a.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        let err = thread
            .register_handler(move |_: &Count| {
                b.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateRegistration { .. }));

        thread.create_thread(WaitTimeout::Infinite).unwrap();
        assert!(thread.post(Count(1)));
        thread.destroy_thread(WaitTimeout::Infinite);
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);

        assert!(thread.unregister_consumer(RuntimeId::of::<Count>()));
        assert!(!thread.has_consumer(RuntimeId::of::<Count>()));
    }

    #[test]
    fn test_destroy_with_timeout_abandons_busy_thread() {
        let thread = DispatcherThread::new("busy");
        thread
            .register_handler(|event: &Blocker| {
                let _ = event.0.recv_timeout(Duration::from_secs(5));
            })
            .unwrap();
        thread.create_thread(WaitTimeout::Infinite).unwrap();
        let (release, hold) = mpsc::channel();
        assert!(thread.post(Blocker(hold)));

        assert_eq!(thread.destroy_thread(WaitTimeout::millis(50)), ThreadCompletion::Abandoned);
        release.send(()).unwrap();
        assert!(thread.completion_wait(WaitTimeout::millis(5000)));
        assert_eq!(thread.destroy_thread(WaitTimeout::Infinite), ThreadCompletion::Invalid);
    }

    #[test]
    fn test_lifecycle_edges() {
        let thread = DispatcherThread::new("edges");
        assert_eq!(thread.state(), ThreadState::Idle);
        assert!(!thread.shutdown_thread());
        assert!(!thread.completion_wait(WaitTimeout::DoNotWait));

        thread.create_thread(WaitTimeout::Infinite).unwrap();
        assert!(thread.is_running());
        assert!(thread.address().is_valid());
        let err = thread.create_thread(WaitTimeout::Infinite).unwrap_err();
        assert_eq!(err.category(), "lifecycle");

        assert!(thread.shutdown_thread());
        assert!(thread.completion_wait(WaitTimeout::millis(5000)));
        assert_eq!(thread.state(), ThreadState::Stopped);
        assert!(!thread.post(Count(0)));
        assert_eq!(thread.destroy_thread(WaitTimeout::DoNotWait), ThreadCompletion::Completed);
        assert_eq!(DispatcherThread::new("never").destroy_thread(WaitTimeout::Infinite), ThreadCompletion::Invalid);
    }

    #[test]
    fn test_current_thread_is_visible_inside_consumers() {
        let thread = DispatcherThread::new("current");
        let (tx, rx) = mpsc::channel();
        thread
            .register_handler(move |_: &Count| {
                let name = DispatcherThread::current().map(|t| t.name().to_string());
                tx.send(name).unwrap();
            })
            .unwrap();
        thread.create_thread(WaitTimeout::Infinite).unwrap();
        thread.post(Count(0));
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap().as_deref(),
            Some("current")
        );
        assert!(DispatcherThread::current().is_none());
        thread.destroy_thread(WaitTimeout::Infinite);
    }
}

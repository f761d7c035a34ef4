//! Scenario tests across dispatcher threads, components and worker threads

use crate::sync::{ResetMode, SyncEvent};
use crate::*;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const PATIENCE: WaitTimeout = WaitTimeout::After(Duration::from_secs(5));

#[derive(Debug)]
struct Ping;

impl Event for Ping {}

#[derive(Debug)]
struct Control;

impl Event for Control {
    fn event_type(&self) -> EventType {
        EventType::SERVICE_EXTERNAL
    }
}

/// Names of the threads that handled pings, with a signal per entry.
struct Journal {
    entries: Mutex<Vec<String>>,
    signal: SyncEvent,
}

impl Journal {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(Vec::new()),
            signal: SyncEvent::new(ResetMode::Automatic, false),
        })
    }

    fn record_current_thread(&self) {
        let name = DispatcherThread::current()
            .map(|thread| thread.name().to_string())
            .unwrap_or_default();
        self.entries.lock().push(name);
        self.signal.set();
    }

    fn wait_next(&self) -> bool {
        self.signal.wait(PATIENCE)
    }

    fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }
}

#[derive(Default)]
struct Counters {
    startups: AtomicUsize,
    shutdowns: AtomicUsize,
    matched_current: AtomicUsize,
}

struct Counted {
    counters: Arc<Counters>,
}

impl Component for Counted {
    fn startup(&mut self, info: &Arc<ComponentInfo>) {
        self.counters.startups.fetch_add(1, Ordering::SeqCst);
        if ComponentInfo::current().map_or(false, |current| Arc::ptr_eq(&current, info)) {
            self.counters.matched_current.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn shutdown(&mut self, _info: &Arc<ComponentInfo>) {
        self.counters.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

/// Takes longer to shut down than the tests are willing to wait.
struct Sluggish;

impl Component for Sluggish {
    fn shutdown(&mut self, _info: &Arc<ComponentInfo>) {
        std::thread::sleep(Duration::from_millis(300));
    }
}

fn counted_entry(role: &str, counters: &Arc<Counters>) -> ComponentEntry {
    let counters = counters.clone();
    ComponentEntry::new(role).with_factory(move |_, _| {
        Some(Box::new(Counted {
            counters: counters.clone(),
        }) as Box<dyn Component>)
    })
}

/// Registers a ping handler on its worker, or nothing at all.
struct PingConsumer {
    name: String,
    journal: Option<Arc<Journal>>,
}

impl WorkerThreadConsumer for PingConsumer {
    fn consumer_name(&self) -> &str {
        &self.name
    }

    fn register_event_consumers(
        &mut self,
        worker: &Arc<DispatcherThread>,
        _master: &Arc<DispatcherThread>,
    ) {
        if let Some(journal) = self.journal.clone() {
            worker
                .register_handler(move |_: &Ping| journal.record_current_thread())
                .unwrap();
        }
    }

    fn unregister_event_consumers(&mut self, worker: &Arc<DispatcherThread>) {
        worker.unregister_consumer(RuntimeId::of::<Ping>());
    }
}

/// Component with one idle worker, one ping worker and one declared
/// worker it refuses to serve.
struct Splitter {
    journal: Arc<Journal>,
}

impl Component for Splitter {
    fn worker_thread_consumer(
        &mut self,
        consumer_name: &str,
        _thread_name: &str,
    ) -> Option<Box<dyn WorkerThreadConsumer>> {
        let journal = match consumer_name {
            "Idle" => None,
            "Ping" => Some(self.journal.clone()),
            _ => return None,
        };
        Some(Box::new(PingConsumer {
            name: consumer_name.to_string(),
            journal,
        }))
    }
}

fn splitter_model(journal: &Arc<Journal>) -> Model {
    let journal = journal.clone();
    Model::new("Split").with_thread(
        ComponentThreadEntry::new("SplitMain").with_component(
            ComponentEntry::new("Splitter")
                .with_worker_thread("SplitIdle", "Idle")
                .with_worker_thread("SplitPing", "Ping")
                .with_worker_thread("SplitGhost", "Ghost")
                .with_factory(move |_, _| {
                    Some(Box::new(Splitter {
                        journal: journal.clone(),
                    }) as Box<dyn Component>)
                }),
        ),
    )
}

fn load_splitter() -> (Arc<ProcessContext>, Arc<Journal>) {
    let context = ProcessContext::new();
    let journal = Journal::new();
    context.loader().add_model(splitter_model(&journal)).unwrap();
    context.load_model(Some("Split")).unwrap();
    (context, journal)
}

#[test]
fn test_empty_component_thread_lifecycle() {
    let context = ProcessContext::new();
    let thread = DispatcherThread::component_thread("Empty", &context);
    thread.create_thread(WaitTimeout::Infinite).unwrap();

    thread.shutdown_thread();
    assert_eq!(thread.destroy_thread(WaitTimeout::Infinite), ThreadCompletion::Completed);

    let stats = thread.lifecycle_stats().unwrap();
    assert_eq!(stats.created(), 0);
    assert_eq!(stats.started(), 0);
    assert_eq!(stats.shut_down(), 0);
    assert_eq!(stats.destroy_passes(), 1);
    assert!(context.threads().is_empty());
}

#[test]
fn test_startup_and_shutdown_are_symmetric() {
    let context = ProcessContext::new();
    let counters = Arc::new(Counters::default());
    let model = Model::new("Trio").with_thread(
        ComponentThreadEntry::new("TrioMain")
            .with_component(counted_entry("First", &counters))
            .with_component(counted_entry("Second", &counters))
            .with_component(counted_entry("Third", &counters)),
    );
    context.loader().add_model(model).unwrap();
    context.load_model(Some("Trio")).unwrap();

    let thread = context.find_thread("TrioMain").unwrap();
    assert!(thread.is_component_thread());
    assert_eq!(thread.components().len(), 3);
    assert_eq!(context.components().len(), 3);

    context.unload_model(Some("Trio"), WaitTimeout::Infinite).unwrap();

    let stats = thread.lifecycle_stats().unwrap();
    assert_eq!(stats.created(), 3);
    assert_eq!(stats.started(), 3);
    assert_eq!(stats.shut_down(), 3);
    assert_eq!(stats.destroy_passes(), 1);
    assert_eq!(counters.startups.load(Ordering::SeqCst), 3);
    assert_eq!(counters.shutdowns.load(Ordering::SeqCst), 3);
    assert_eq!(counters.matched_current.load(Ordering::SeqCst), 3);
    assert!(context.components().is_empty());
    assert!(context.find_thread("TrioMain").is_none());
}

#[test]
fn test_event_resolves_to_worker_of_hosted_component() {
    let (context, journal) = load_splitter();
    let master = context.find_thread("SplitMain").unwrap();
    let splitter = context.find_component("Splitter").unwrap();

    // The refused worker is skipped, the other two run.
    assert_eq!(splitter.worker_count(), 2);
    assert!(splitter.find_worker_thread("SplitGhost").is_none());

    let target = master.get_event_consumer_thread(RuntimeId::of::<Ping>()).unwrap();
    assert_eq!(target.name(), "SplitPing");
    assert!(target.is_worker_thread());

    assert!(master.post(Ping));
    assert!(journal.wait_next());
    assert_eq!(journal.entries(), vec!["SplitPing".to_string()]);

    context.unload_model(Some("Split"), WaitTimeout::Infinite).unwrap();
}

#[test]
fn test_sibling_workers_reach_each_other() {
    let (context, journal) = load_splitter();
    let splitter = context.find_component("Splitter").unwrap();
    let idle = splitter.find_worker_thread("SplitIdle").unwrap();

    assert_eq!(idle.binding_component().unwrap().role_name(), "Splitter");
    assert!(idle.post(Ping));
    assert!(journal.wait_next());
    assert_eq!(journal.entries(), vec!["SplitPing".to_string()]);

    context.unload_model(Some("Split"), WaitTimeout::Infinite).unwrap();
}

#[test]
fn test_worker_refuses_non_custom_events() {
    let (context, _journal) = load_splitter();
    let master = context.find_thread("SplitMain").unwrap();
    let ping_worker = context
        .find_component("Splitter")
        .unwrap()
        .find_worker_thread("SplitPing")
        .unwrap();

    let handled = Arc::new(AtomicUsize::new(0));
    let counter = handled.clone();
    ping_worker
        .register_handler(move |_: &Control| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    assert!(!ping_worker.post(Control));
    assert!(!master.post(Control));

    context.unload_model(Some("Split"), WaitTimeout::Infinite).unwrap();
    assert_eq!(handled.load(Ordering::SeqCst), 0);
}

#[test]
fn test_failed_model_load_keeps_started_threads() {
    let context = ProcessContext::new();
    let counters = Arc::new(Counters::default());
    let blocker = DispatcherThread::in_context("Taken", &context);
    blocker.create_thread(WaitTimeout::Infinite).unwrap();

    let model = Model::new("Partial")
        .with_thread(ComponentThreadEntry::new("Free").with_component(counted_entry("Early", &counters)))
        .with_thread(ComponentThreadEntry::new("Taken").with_component(counted_entry("Late", &counters)));
    context.loader().add_model(model).unwrap();

    let err = context.load_model(Some("Partial")).unwrap_err();
    assert!(matches!(err, Error::DuplicateRegistration { kind: "thread", .. }));
    assert!(!context.loader().is_model_loaded("Partial"));
    assert!(context.find_thread("Free").unwrap().is_running());
    assert_eq!(counters.startups.load(Ordering::SeqCst), 1);

    context.unload_model(Some("Partial"), WaitTimeout::Infinite).unwrap();
    assert!(context.find_thread("Free").is_none());
    assert_eq!(counters.shutdowns.load(Ordering::SeqCst), 1);

    blocker.shutdown_thread();
    blocker.destroy_thread(WaitTimeout::Infinite);
}

#[test]
fn test_duplicate_roles_rejected_across_models() {
    let context = ProcessContext::new();
    let counters = Arc::new(Counters::default());
    context
        .loader()
        .add_model(Model::new("One").with_thread(
            ComponentThreadEntry::new("OneMain").with_component(counted_entry("Shared", &counters)),
        ))
        .unwrap();

    let err = context
        .loader()
        .add_model(Model::new("Two").with_thread(
            ComponentThreadEntry::new("TwoMain").with_component(counted_entry("Shared", &counters)),
        ))
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateRegistration { kind: "component", .. }));
    assert_eq!(context.loader().model_names(), vec!["One".to_string()]);
}

#[test]
fn test_events_to_plain_thread_run_in_post_order() {
    let context = ProcessContext::new();
    let journal = Journal::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let thread = DispatcherThread::in_context("Plain", &context);

    #[derive(Debug)]
    struct Numbered(u32);
    impl Event for Numbered {}

    let sink = seen.clone();
    let done = journal.clone();
    thread
        .register_handler(move |event: &Numbered| {
            sink.lock().push(event.0);
            if event.0 == 9 {
                done.record_current_thread();
            }
        })
        .unwrap();
    thread.create_thread(WaitTimeout::Infinite).unwrap();

    for n in 0..10 {
        assert!(thread.post(Numbered(n)));
    }
    assert!(journal.wait_next());
    assert_eq!(*seen.lock(), (0..10).collect::<Vec<_>>());
    assert_eq!(journal.entries(), vec!["Plain".to_string()]);

    thread.shutdown_thread();
    assert_eq!(thread.destroy_thread(WaitTimeout::Infinite), ThreadCompletion::Completed);
    assert!(!thread.post(Numbered(10)));
}

#[test]
fn test_unload_reports_threads_past_the_deadline() {
    let context = ProcessContext::new();
    let model = Model::new("Slow").with_thread(
        ComponentThreadEntry::new("SlowMain").with_component(
            ComponentEntry::new("Sluggish")
                .with_factory(|_, _| Some(Box::new(Sluggish) as Box<dyn Component>)),
        ),
    );
    context.loader().add_model(model).unwrap();
    context.load_model(Some("Slow")).unwrap();

    let err = context
        .unload_model(Some("Slow"), WaitTimeout::millis(20))
        .unwrap_err();
    assert_eq!(err.category(), "timeout");
    assert!(err.to_string().contains("SlowMain"));
    assert!(!context.loader().is_model_loaded("Slow"));
}

fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while std::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

#[test]
fn test_detached_component_thread_tears_down_once_on_exit() {
    let context = ProcessContext::new();
    let deleted = Arc::new(AtomicUsize::new(0));
    let counter = deleted.clone();
    let model = Model::new("Lazy").with_thread(
        ComponentThreadEntry::new("LazyMain").with_component(
            ComponentEntry::new("Lazy")
                .with_factory(|_, _| Some(Box::new(Sluggish) as Box<dyn Component>))
                .with_deleter(move |component, _| {
                    drop(component);
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
        ),
    );
    context.loader().add_model(model).unwrap();
    context.load_model(Some("Lazy")).unwrap();
    let thread = context.find_thread("LazyMain").unwrap();

    // the component is still shutting down, so teardown waits for the exit
    assert_eq!(thread.destroy_thread(WaitTimeout::DoNotWait), ThreadCompletion::Detached);
    let stats = thread.lifecycle_stats().unwrap();
    assert_eq!(stats.destroy_passes(), 0);
    assert_eq!(context.components().len(), 1);

    assert!(eventually(|| context.components().is_empty()));
    assert_eq!(stats.destroy_passes(), 1);
    assert_eq!(stats.shut_down(), 1);
    assert_eq!(deleted.load(Ordering::SeqCst), 1);

    // a later destroy finds nothing left to tear down
    assert_eq!(thread.destroy_thread(WaitTimeout::Infinite), ThreadCompletion::Invalid);
    context.unload_model(Some("Lazy"), WaitTimeout::Infinite).unwrap();
    assert_eq!(stats.destroy_passes(), 1);
    assert_eq!(deleted.load(Ordering::SeqCst), 1);
}

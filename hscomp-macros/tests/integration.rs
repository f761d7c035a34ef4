//! Derive macro tests: the generated `Event` impls and their delivery

use hscomp::{DispatcherThread, Event, EventType, RuntimeId, WaitTimeout};
use std::sync::mpsc;
use std::time::Duration;

#[derive(Event, Debug, Clone, PartialEq)]
pub struct TemperatureChanged {
    pub value: i32,
}

#[derive(Event, Debug)]
#[event(target = "internal")]
pub struct Recalculate;

#[derive(Event, Debug)]
#[event(kind = "service", target = "external")]
pub struct ConnectionChanged {
    pub connected: bool,
}

#[derive(Event, Debug)]
#[event(target = "internal", kind = "service")]
pub enum Lifecycle {
    Up,
    Down,
}

#[derive(Event, Debug)]
pub struct Wrapped<T: std::fmt::Debug + Send + 'static>(pub T);

#[test]
fn test_default_is_custom_external() {
    let event = TemperatureChanged { value: 21 };
    assert_eq!(event.event_type(), EventType::CUSTOM_EXTERNAL);
    assert_eq!(event.runtime_id(), RuntimeId::of::<TemperatureChanged>());
}

#[test]
fn test_attributes_select_event_type() {
    assert_eq!(Recalculate.event_type(), EventType::CUSTOM_INTERNAL);
    assert!(ConnectionChanged { connected: true }.event_type().is_external());
    assert!(!ConnectionChanged { connected: true }.event_type().is_custom());
    assert!(Lifecycle::Up.event_type().is_internal());
    assert!(!Lifecycle::Down.event_type().is_custom());
}

#[test]
fn test_generic_events_get_distinct_runtime_ids() {
    assert_ne!(Wrapped(1u8).runtime_id(), Wrapped("one").runtime_id());
    assert_eq!(Wrapped(1u8).runtime_id(), RuntimeId::of::<Wrapped<u8>>());
}

#[test]
fn test_derived_event_is_dispatched() {
    let thread = DispatcherThread::new("MacroThread");
    let (tx, rx) = mpsc::channel();
    thread
        .register_handler::<TemperatureChanged, _>(move |event: &TemperatureChanged| {
            tx.send(event.clone()).unwrap();
        })
        .unwrap();
    thread.create_thread(WaitTimeout::Infinite).unwrap();

    assert!(thread.post(TemperatureChanged { value: 30 }));
    assert!(!thread.post(ConnectionChanged { connected: false }));
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        TemperatureChanged { value: 30 }
    );

    thread.shutdown_thread();
    thread.destroy_thread(WaitTimeout::Infinite);
}

//! Event trait, event classification and consumer adapters
//!
//! Events are the only unit of data that crosses dispatcher-thread
//! boundaries. A dispatcher matches each event to a consumer through the
//! event's [`RuntimeId`], the Rust type identity of the concrete event.

use std::any::{type_name, Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::ops::BitOr;

/// Two-axis event classification: queue target and behavioral kind.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventType(u16);

impl EventType {
    pub const UNDEFINED: EventType = EventType(0);

    /// Delivered to the generating thread itself.
    pub const INTERNAL: EventType = EventType(0x0001);
    /// Delivered to a possibly different thread.
    pub const EXTERNAL: EventType = EventType(0x0002);

    /// User defined event.
    pub const CUSTOM: EventType = EventType(0x0010);
    /// Reserved sentinel that terminates a dispatch loop.
    pub const EXIT: EventType = EventType(0x0020);
    /// Reserved for service-interface plumbing.
    pub const SERVICE: EventType = EventType(0x0040);

    pub const CUSTOM_INTERNAL: EventType = EventType(Self::INTERNAL.0 | Self::CUSTOM.0);
    pub const CUSTOM_EXTERNAL: EventType = EventType(Self::EXTERNAL.0 | Self::CUSTOM.0);
    pub const EXIT_EXTERNAL: EventType = EventType(Self::EXTERNAL.0 | Self::EXIT.0);
    pub const SERVICE_EXTERNAL: EventType = EventType(Self::EXTERNAL.0 | Self::SERVICE.0);

    const TARGET_MASK: u16 = 0x000F;
    const KIND_MASK: u16 = 0x00F0;

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn contains(self, other: EventType) -> bool {
        other.0 != 0 && (self.0 & other.0) == other.0
    }

    pub const fn is_internal(self) -> bool {
        self.contains(Self::INTERNAL)
    }

    pub const fn is_external(self) -> bool {
        self.contains(Self::EXTERNAL)
    }

    pub const fn is_custom(self) -> bool {
        (self.0 & Self::KIND_MASK) == Self::CUSTOM.0
    }

    pub const fn is_exit(self) -> bool {
        self.contains(Self::EXIT)
    }

    pub const fn target(self) -> EventType {
        EventType(self.0 & Self::TARGET_MASK)
    }

    pub const fn kind(self) -> EventType {
        EventType(self.0 & Self::KIND_MASK)
    }
}

impl BitOr for EventType {
    type Output = EventType;

    fn bitor(self, rhs: Self) -> Self::Output {
        EventType(self.0 | rhs.0)
    }
}

impl fmt::Debug for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::INTERNAL, "INTERNAL"),
            (Self::EXTERNAL, "EXTERNAL"),
            (Self::CUSTOM, "CUSTOM"),
            (Self::EXIT, "EXIT"),
            (Self::SERVICE, "SERVICE"),
        ];
        let parts: Vec<&str> = names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if parts.is_empty() {
            write!(f, "UNDEFINED")
        } else {
            write!(f, "{}", parts.join("|"))
        }
    }
}

/// Runtime type identity of an event or consumer registration.
#[derive(Clone, Copy)]
pub struct RuntimeId {
    id: TypeId,
    name: &'static str,
}

impl RuntimeId {
    pub fn of<E: Event>() -> Self {
        Self {
            id: TypeId::of::<E>(),
            name: type_name::<E>(),
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for RuntimeId {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for RuntimeId {}

impl Hash for RuntimeId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for RuntimeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl fmt::Display for RuntimeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Upcasting helper implemented for every sendable type.
pub trait AsAny: Any + Send {
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

impl<T: Any + Send> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

/// Trait for events that can be posted to a dispatcher thread
pub trait Event: AsAny + fmt::Debug {
    /// Classification of this event. Custom external by default.
    fn event_type(&self) -> EventType {
        EventType::CUSTOM_EXTERNAL
    }

    /// Identity used to find the consumer of this event.
    fn runtime_id(&self) -> RuntimeId {
        RuntimeId {
            id: TypeId::of::<Self>(),
            name: type_name::<Self>(),
        }
    }
}

impl dyn Event {
    pub fn is<E: Event>(&self) -> bool {
        self.as_any().is::<E>()
    }

    pub fn downcast_ref<E: Event>(&self) -> Option<&E> {
        self.as_any().downcast_ref::<E>()
    }

    /// Recovers the concrete event, consuming the box.
    pub fn downcast<E: Event>(self: Box<Self>) -> Option<Box<E>> {
        self.into_any().downcast::<E>().ok()
    }
}

/// Reserved event that makes a dispatch loop return.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExitEvent;

impl Event for ExitEvent {
    fn event_type(&self) -> EventType {
        EventType::EXIT_EXTERNAL
    }
}

/// Receives events on the dispatcher thread it is registered with.
pub trait EventConsumer: Send + 'static {
    fn process_event(&mut self, event: &dyn Event);
}

/// Adapter turning a typed closure into an [`EventConsumer`].
pub struct EventHandler<E, F> {
    handler: F,
    _event: PhantomData<fn(&E)>,
}

impl<E, F> EventHandler<E, F>
where
    E: Event,
    F: FnMut(&E) + Send + 'static,
{
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _event: PhantomData,
        }
    }
}

impl<E, F> EventConsumer for EventHandler<E, F>
where
    E: Event,
    F: FnMut(&E) + Send + 'static,
{
    fn process_event(&mut self, event: &dyn Event) {
        match event.downcast_ref::<E>() {
            Some(event) => (self.handler)(event),
            None => tracing::warn!(
                expected = type_name::<E>(),
                received = %event.runtime_id(),
                "Consumer received an event of a foreign type"
            ),
        }
    }
}

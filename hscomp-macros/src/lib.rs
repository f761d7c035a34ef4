//! Procedural macros for hscomp - event-driven component framework

use proc_macro::TokenStream;
use syn::{parse_macro_input, DeriveInput};

mod event;

/// Derive macro for creating events
///
/// `#[event(target = "internal" | "external", kind = "custom" | "service")]`
/// selects the event type; the default is a custom external event.
#[proc_macro_derive(Event, attributes(event))]
pub fn event(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    event::derive_event_impl(input)
}

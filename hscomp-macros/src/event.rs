//! Event derive macro implementation

use proc_macro::TokenStream;
use quote::quote;
use syn::{Attribute, DeriveInput, LitStr};

#[derive(Clone, Copy, Default)]
enum Target {
    Internal,
    #[default]
    External,
}

#[derive(Clone, Copy, Default)]
enum Kind {
    #[default]
    Custom,
    Service,
}

#[derive(Default)]
struct EventOptions {
    target: Target,
    kind: Kind,
}

/// Implementation of the Event derive macro
pub fn derive_event_impl(input: DeriveInput) -> TokenStream {
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let options = match parse_event_options(&input.attrs) {
        Ok(options) => options,
        Err(err) => return err.to_compile_error().into(),
    };

    let target = match options.target {
        Target::Internal => quote! { ::hscomp::EventType::INTERNAL },
        Target::External => quote! { ::hscomp::EventType::EXTERNAL },
    };
    let kind = match options.kind {
        Kind::Custom => quote! { ::hscomp::EventType::CUSTOM },
        Kind::Service => quote! { ::hscomp::EventType::SERVICE },
    };

    let expanded = quote! {
        impl #impl_generics ::hscomp::Event for #name #ty_generics #where_clause {
            fn event_type(&self) -> ::hscomp::EventType {
                #target | #kind
            }
        }
    };

    TokenStream::from(expanded)
}

/// Parse `#[event(target = "...", kind = "...")]`
fn parse_event_options(attrs: &[Attribute]) -> syn::Result<EventOptions> {
    let mut options = EventOptions::default();
    for attr in attrs.iter().filter(|attr| attr.path().is_ident("event")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("target") {
                let value: LitStr = meta.value()?.parse()?;
                options.target = match value.value().as_str() {
                    "internal" => Target::Internal,
                    "external" => Target::External,
                    other => {
                        return Err(syn::Error::new(
                            value.span(),
                            format!("unknown event target `{other}`, expected \"internal\" or \"external\""),
                        ))
                    }
                };
                Ok(())
            } else if meta.path.is_ident("kind") {
                let value: LitStr = meta.value()?.parse()?;
                options.kind = match value.value().as_str() {
                    "custom" => Kind::Custom,
                    "service" => Kind::Service,
                    "exit" => {
                        return Err(syn::Error::new(
                            value.span(),
                            "exit events are reserved, post `hscomp::ExitEvent` instead",
                        ))
                    }
                    other => {
                        return Err(syn::Error::new(
                            value.span(),
                            format!("unknown event kind `{other}`, expected \"custom\" or \"service\""),
                        ))
                    }
                };
                Ok(())
            } else {
                Err(meta.error("unsupported event attribute, expected `target` or `kind`"))
            }
        })?;
    }
    Ok(options)
}

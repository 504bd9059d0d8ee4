//! `#[traced]`: enter/exit trace events for functions, with optional timing.
//!
//! ```ignore
//! #[traced(instrument(level = tracing::Level::DEBUG, skip(self)), timing(precision = "ms"))]
//! async fn scan(&self) -> Result<Vec<Entry>> { ... }
//! ```
//!
//! `instrument(...)` is forwarded verbatim to `#[tracing::instrument(...)]`.
//! Crates using this attribute must depend on `tracing`.

extern crate proc_macro;

use proc_macro2::TokenStream;
use quote::{quote, quote_spanned};
use syn::{ItemFn, Stmt, parse::Parse, parse_macro_input, parse_quote};

#[derive(PartialEq, Eq, Clone, Copy, Default)]
enum Precision {
    #[default]
    Nanos,
    Micros,
    Millis,
    Seconds,
}

impl Precision {
    fn parse_unit(value: &str) -> Option<Self> {
        match value {
            "ns" | "nano" | "nanos" | "nanoseconds" => Some(Self::Nanos),
            "us" | "micro" | "micros" | "microseconds" => Some(Self::Micros),
            "ms" | "milli" | "millis" | "milliseconds" => Some(Self::Millis),
            "s" | "sec" | "secs" | "seconds" => Some(Self::Seconds),
            _ => None,
        }
    }

    /// Expression rendering a `Duration` named `elapsed` in this unit.
    fn render(self) -> syn::Expr {
        match self {
            Self::Nanos => parse_quote!(format!("{} ns elapsed", elapsed.as_nanos())),
            Self::Micros => parse_quote!(format!("{} us elapsed", elapsed.as_micros())),
            Self::Millis => parse_quote!(format!("{} ms elapsed", elapsed.as_millis())),
            Self::Seconds => parse_quote!(format!("{} s elapsed", elapsed.as_secs())),
        }
    }
}

mod keywords {
    syn::custom_keyword!(timing);
    syn::custom_keyword!(precision);
    syn::custom_keyword!(instrument);
}

#[derive(Default)]
struct Attributes {
    timing: Option<Precision>,
    instrument: Option<TokenStream>,
    unrecognised: Vec<syn::Error>,
}

impl Attributes {
    fn parse_timing(input: syn::parse::ParseStream) -> syn::Result<Precision> {
        if !input.peek(syn::token::Paren) {
            return Ok(Precision::default());
        }

        let content;
        syn::parenthesized!(content in input);
        content.parse::<keywords::precision>()?;
        content.parse::<syn::Token![=]>()?;
        let unit = content.parse::<syn::LitStr>()?;

        Precision::parse_unit(&unit.value())
            .ok_or_else(|| syn::Error::new(unit.span(), "unknown timing precision"))
    }

    /// Compile-time warnings for arguments that were ignored.
    fn warnings(&self) -> TokenStream {
        let warnings = self.unrecognised.iter().map(|err| {
            let msg = syn::LitStr::new(&format!("ignored `traced` argument: {err}"), err.span());

            quote_spanned! {err.span()=>
                #[warn(deprecated)]
                {
                    #[deprecated(note = #msg)]
                    const TRACED_ARGUMENT_WARNING: () = ();
                    let () = TRACED_ARGUMENT_WARNING;
                }
            }
        });

        quote! { #(#warnings)* }
    }
}

impl Parse for Attributes {
    fn parse(input: syn::parse::ParseStream) -> syn::Result<Self> {
        let mut attributes = Self::default();

        while !input.is_empty() {
            let lookahead = input.lookahead1();

            if lookahead.peek(keywords::timing) {
                if attributes.timing.is_some() {
                    return Err(input.error("`timing` may only be given once"));
                }
                input.parse::<keywords::timing>()?;
                attributes.timing = Some(Self::parse_timing(input)?);
            } else if lookahead.peek(keywords::instrument) {
                if attributes.instrument.is_some() {
                    return Err(input.error("`instrument` may only be given once"));
                }
                input.parse::<keywords::instrument>()?;
                if input.peek(syn::token::Paren) {
                    let content;
                    syn::parenthesized!(content in input);
                    attributes.instrument = Some(content.parse()?);
                } else {
                    attributes.instrument = Some(TokenStream::new());
                }
            } else if lookahead.peek(syn::Token![,]) {
                input.parse::<syn::Token![,]>()?;
            } else {
                attributes.unrecognised.push(lookahead.error());
                input.parse::<proc_macro2::TokenTree>()?;
            }
        }

        Ok(attributes)
    }
}

/// Emits `tracing::trace!` events when the attributed function is entered and
/// when it returns (including early returns and `?`), optionally reporting how
/// long the call took.
///
/// # Panics
///
/// Does not panic; applying it to anything other than a function is a compile error.
#[proc_macro_attribute]
pub fn traced(
    args: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    let args = parse_macro_input!(args as Attributes);
    let mut item_fn = parse_macro_input!(item as ItemFn);

    item_fn
        .attrs
        .push(parse_quote! { #[allow(clippy::items_after_statements)] });

    if let Some(fields) = &args.instrument {
        item_fn
            .attrs
            .push(parse_quote! { #[tracing::instrument(#fields)] });
    }

    let name = item_fn.sig.ident.to_string();
    let warnings = args.warnings();
    let on_exit: Stmt = match args.timing {
        Some(precision) => {
            let rendered = precision.render();
            parse_quote! {{
                let elapsed = self.started.elapsed();
                tracing::trace!("OnExit: {} ({})", #name, #rendered);
            }}
        }
        None => parse_quote! { tracing::trace!("OnExit: {}", #name); },
    };

    let guard: Vec<Stmt> = parse_quote! {
        #[allow(dead_code)]
        struct __TracedGuard {
            started: std::time::Instant,
        }

        impl __TracedGuard {
            fn enter() -> Self {
                #warnings
                tracing::trace!("OnEnter: {}", #name);
                Self {
                    started: std::time::Instant::now(),
                }
            }
        }

        impl std::ops::Drop for __TracedGuard {
            fn drop(&mut self) {
                #on_exit
            }
        }

        let __traced_guard = __TracedGuard::enter();
    };

    let body = std::mem::take(&mut item_fn.block.stmts);
    item_fn.block.stmts = guard.into_iter().chain(body).collect();

    quote! { #item_fn }.into()
}

//! Test attributes that fail a test instead of letting it hang.
//!
//! `#[test_timeout::timeout]` wraps a synchronous test and
//! `#[test_timeout::tokio_timeout_test]` wraps an async one in a fresh Tokio
//! runtime. Both accept an optional limit: `30`, `secs = 30` or `millis = 500`
//! (default 60 seconds). The async form also accepts `multi_thread`.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{
    parse::{Parse, ParseStream},
    parse_macro_input,
    punctuated::Punctuated,
    Attribute, Ident, ItemFn, LitInt, Token,
};

const DEFAULT_TIMEOUT_MILLIS: u64 = 60_000;

struct TimeoutArgs {
    millis: u64,
    multi_thread: bool,
}

enum TimeoutArg {
    Bare(LitInt),
    Named(Ident, LitInt),
    Flag(Ident),
}

impl Parse for TimeoutArg {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        if input.peek(LitInt) {
            return Ok(TimeoutArg::Bare(input.parse()?));
        }
        let ident: Ident = input.parse()?;
        if input.peek(Token![=]) {
            input.parse::<Token![=]>()?;
            return Ok(TimeoutArg::Named(ident, input.parse()?));
        }
        Ok(TimeoutArg::Flag(ident))
    }
}

impl Parse for TimeoutArgs {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut args = TimeoutArgs {
            millis: DEFAULT_TIMEOUT_MILLIS,
            multi_thread: false,
        };

        for arg in Punctuated::<TimeoutArg, Token![,]>::parse_terminated(input)? {
            match arg {
                TimeoutArg::Bare(lit) => args.millis = positive(&lit)?.saturating_mul(1_000),
                TimeoutArg::Named(name, lit) if name == "secs" => {
                    args.millis = positive(&lit)?.saturating_mul(1_000)
                }
                TimeoutArg::Named(name, lit) if name == "millis" => args.millis = positive(&lit)?,
                TimeoutArg::Flag(name) if name == "multi_thread" => args.multi_thread = true,
                TimeoutArg::Named(name, _) | TimeoutArg::Flag(name) => {
                    return Err(syn::Error::new_spanned(
                        &name,
                        "expected `secs = N`, `millis = N`, `multi_thread` or a bare number of seconds",
                    ));
                }
            }
        }

        Ok(args)
    }
}

fn positive(lit: &LitInt) -> syn::Result<u64> {
    let value: u64 = lit.base10_parse()?;
    if value == 0 {
        return Err(syn::Error::new_spanned(lit, "timeout must be greater than zero"));
    }
    Ok(value)
}

/// Runs `body` on a watchdog thread and panics if it does not finish in time.
/// Panics raised by the body are re-raised on the test thread.
fn watchdog(millis: u64, body: TokenStream2) -> TokenStream2 {
    quote! {
        let __limit = ::std::time::Duration::from_millis(#millis);
        let (__done, __report) = ::std::sync::mpsc::channel();
        ::std::thread::spawn(move || {
            let outcome = ::std::panic::catch_unwind(::std::panic::AssertUnwindSafe(|| { #body }));
            let _ = __done.send(outcome);
        });
        match __report.recv_timeout(__limit) {
            Ok(Ok(())) => {}
            Ok(Err(payload)) => ::std::panic::resume_unwind(payload),
            Err(::std::sync::mpsc::RecvTimeoutError::Timeout) => {
                panic!("test timed out after {:?}", __limit)
            }
            Err(::std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                panic!("test thread exited without reporting a result")
            }
        }
    }
}

fn strip_test_attrs(attrs: Vec<Attribute>) -> Vec<Attribute> {
    attrs
        .into_iter()
        .filter(|attr| {
            let path: Vec<String> = attr
                .path()
                .segments
                .iter()
                .map(|segment| segment.ident.to_string())
                .collect();
            !matches!(
                path.iter().map(String::as_str).collect::<Vec<_>>().as_slice(),
                ["test"] | ["tokio", "test"]
            )
        })
        .collect()
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as TimeoutArgs);
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.take().is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }

    let attrs = strip_test_attrs(attrs);
    let millis = args.millis;
    let builder = if args.multi_thread {
        quote!(::tokio::runtime::Builder::new_multi_thread())
    } else {
        quote!(::tokio::runtime::Builder::new_current_thread())
    };
    let body = watchdog(
        millis,
        quote! {
            let runtime = #builder
                .enable_all()
                .build()
                .expect("failed to build Tokio runtime");
            runtime.block_on(async {
                ::tokio::time::timeout(::std::time::Duration::from_millis(#millis), async move #block)
                    .await
                    .expect("test timed out");
            });
        },
    );

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #body
        }
    })
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as TimeoutArgs);
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &sig.ident,
            "timeout expects a synchronous test; use tokio_timeout_test for async tests",
        )
        .to_compile_error()
        .into();
    }
    if args.multi_thread {
        return syn::Error::new_spanned(&sig.ident, "`multi_thread` only applies to async tests")
            .to_compile_error()
            .into();
    }

    let attrs = strip_test_attrs(attrs);
    let body = watchdog(args.millis, quote!(#block));

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #body
        }
    })
}

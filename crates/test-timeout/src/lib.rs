//! `#[tokio_timeout_test]`: runs an async test on its own current-thread
//! runtime and fails it when a wall-clock deadline passes.
//!
//! Arguments (all optional, comma separated):
//! - an integer number of seconds for the deadline (default 60)
//! - `paused` to start the runtime with a paused clock; timers then advance
//!   instantly and only the wall-clock deadline applies

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::parse::{Parse, ParseStream, Parser};
use syn::punctuated::Punctuated;
use syn::{parse_macro_input, Attribute, Ident, ItemFn, LitInt, Token};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

enum TimeoutArg {
    Secs(LitInt),
    Paused(Ident),
}

impl Parse for TimeoutArg {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        if input.peek(LitInt) {
            return Ok(TimeoutArg::Secs(input.parse()?));
        }
        let ident: Ident = input.parse()?;
        if ident == "paused" {
            Ok(TimeoutArg::Paused(ident))
        } else {
            Err(syn::Error::new_spanned(
                ident,
                "expected a timeout in seconds or `paused`",
            ))
        }
    }
}

struct TimeoutOptions {
    secs: u64,
    paused: bool,
}

fn parse_options(attr: TokenStream2) -> syn::Result<TimeoutOptions> {
    let mut options = TimeoutOptions {
        secs: DEFAULT_TIMEOUT_SECS,
        paused: false,
    };
    let args = Punctuated::<TimeoutArg, Token![,]>::parse_terminated.parse2(attr)?;
    for arg in args {
        match arg {
            TimeoutArg::Secs(lit) => {
                let secs: u64 = lit.base10_parse()?;
                if secs == 0 {
                    return Err(syn::Error::new_spanned(lit, "timeout must be greater than zero"));
                }
                options.secs = secs;
            }
            TimeoutArg::Paused(ident) => {
                if options.paused {
                    return Err(syn::Error::new_spanned(ident, "`paused` given twice"));
                }
                options.paused = true;
            }
        }
    }
    Ok(options)
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let options = match parse_options(attr.into()) {
        Ok(options) => options,
        Err(err) => return err.to_compile_error().into(),
    };

    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }

    sig.asyncness = None;

    // Tests may return `()` or a `Result`; the body keeps its declared
    // signature so `?` resolves against it.
    let output = std::mem::replace(&mut sig.output, syn::ReturnType::Default);

    let filtered_attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_tokio_test_attribute(attr))
        .collect();

    let timeout = options.secs;
    let builder = if options.paused {
        quote! {
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .start_paused(true)
                .build()
        }
    } else {
        quote! {
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
        }
    };
    // A paused clock auto-advances through sleeps, so only the wall-clock
    // watchdog below can bound a paused test.
    let run = if options.paused {
        quote! { test_body().await }
    } else {
        quote! {
            tokio::time::timeout(timeout_duration, test_body())
                .await
                .expect("test timed out")
        }
    };

    TokenStream::from(quote! {
        #[test]
        #(#filtered_attrs)*
        #vis #sig {
            trait TestOutcome {
                fn check(self);
            }
            impl TestOutcome for () {
                fn check(self) {}
            }
            impl<E: std::fmt::Debug> TestOutcome for Result<(), E> {
                fn check(self) {
                    if let Err(err) = self {
                        panic!("test returned an error: {err:?}");
                    }
                }
            }

            async fn test_body() #output #block

            let timeout_duration = std::time::Duration::from_secs(#timeout);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    let runtime = #builder.expect("failed to build Tokio runtime");
                    runtime.block_on(async {
                        TestOutcome::check(#run);
                    });
                }));
                let _ = sender.send(result);
            });
            match receiver.recv_timeout(timeout_duration) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread failed before reporting result")
                }
            }
        }
    })
}

fn is_tokio_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!(
        (segments.next(), segments.next(), segments.next()),
        (Some(first), Some(second), None)
            if first.ident == "tokio" && second.ident == "test"
    )
}

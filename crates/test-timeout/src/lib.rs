use proc_macro::TokenStream;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::{Attribute, Ident, ItemFn, LitInt, Token, parse_macro_input};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// `#[tokio_timeout_test]`, `#[tokio_timeout_test(30)]` or
/// `#[tokio_timeout_test(30, paused)]`.
struct TimeoutArgs {
    secs: u64,
    paused: bool,
}

impl Parse for TimeoutArgs {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut args = TimeoutArgs {
            secs: DEFAULT_TIMEOUT_SECS,
            paused: false,
        };
        if input.is_empty() {
            return Ok(args);
        }
        if input.peek(LitInt) {
            let lit: LitInt = input.parse()?;
            args.secs = lit.base10_parse()?;
            if args.secs == 0 {
                return Err(syn::Error::new(lit.span(), "timeout must be greater than zero"));
            }
            if input.is_empty() {
                return Ok(args);
            }
            input.parse::<Token![,]>()?;
        }
        let flag: Ident = input.parse()?;
        if flag != "paused" {
            return Err(syn::Error::new(flag.span(), "expected `paused`"));
        }
        args.paused = true;
        if !input.is_empty() {
            return Err(input.error("unexpected tokens after `paused`"));
        }
        Ok(args)
    }
}

/// Runs an async test on a fresh current-thread runtime on its own thread
/// and fails it if it does not finish within the wall-clock limit.
///
/// With `paused` the runtime starts with a paused clock, so timers advance
/// instantly whenever the runtime is idle. The caller's crate needs tokio's
/// `test-util` feature for that.
#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let TimeoutArgs { secs, paused } = parse_macro_input!(attr as TimeoutArgs);

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

    let filtered_attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_tokio_test_attribute(attr))
        .collect();

    // A paused clock would fire an in-runtime timeout as soon as the test
    // parks on I/O, so only the wall-clock guard applies there.
    let (builder, body) = if paused {
        (
            quote! {
                tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .start_paused(true)
                    .build()
            },
            quote! { runtime.block_on(async move #block); },
        )
    } else {
        (
            quote! {
                tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
            },
            quote! {
                runtime.block_on(async {
                    tokio::time::timeout(timeout_duration, async move #block)
                        .await
                        .expect("test timed out");
                });
            },
        )
    };

    TokenStream::from(quote! {
        #[test]
        #(#filtered_attrs)*
        #vis #sig {
            let timeout_duration = std::time::Duration::from_secs(#secs);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    let runtime = #builder.expect("failed to build Tokio runtime");
                    #body
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

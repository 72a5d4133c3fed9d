use proc_macro::TokenStream;
use quote::quote;
use syn::{Attribute, ItemFn, LitInt, parse_macro_input};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

struct CallTestArgs {
    timeout_secs: u64,
    paused: bool,
}

impl Default for CallTestArgs {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            paused: false,
        }
    }
}

/// Run an async test on its own Tokio runtime with a wall-clock deadline.
///
/// `#[call_test]` uses a two-worker multi-thread runtime, which the WebRTC
/// stack needs for its background tasks. `#[call_test(paused)]` switches to a
/// current-thread runtime with the clock paused so timer-driven behavior can be
/// stepped with `tokio::time::advance`. `timeout = N` overrides the deadline.
#[proc_macro_attribute]
pub fn call_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let mut args = CallTestArgs::default();
    let parser = syn::meta::parser(|meta| {
        if meta.path.is_ident("timeout") {
            let lit: LitInt = meta.value()?.parse()?;
            let secs: u64 = lit.base10_parse()?;
            if secs == 0 {
                return Err(meta.error("timeout must be greater than zero"));
            }
            args.timeout_secs = secs;
            Ok(())
        } else if meta.path.is_ident("paused") {
            args.paused = true;
            Ok(())
        } else {
            Err(meta.error("expected `timeout = <secs>` or `paused`"))
        }
    });
    parse_macro_input!(attr with parser);

    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(&sig.ident, "call_test expects an async test function")
            .to_compile_error()
            .into();
    }
    sig.asyncness = None;

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_runtime_test_attribute(attr))
        .collect();

    let timeout = args.timeout_secs;
    let runtime = if args.paused {
        quote! {
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .start_paused(true)
                .build()
        }
    } else {
        quote! {
            tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .build()
        }
    };

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let deadline = std::time::Duration::from_secs(#timeout);
            let (done_tx, done_rx) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    let runtime = #runtime.expect("failed to build Tokio runtime");
                    runtime.block_on(async move #block);
                }));
                let _ = done_tx.send(outcome);
            });
            match done_rx.recv_timeout(deadline) {
                Ok(Ok(())) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test exceeded {}s deadline", #timeout)
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread exited without reporting a result")
                }
            }
        }
    })
}

fn is_runtime_test_attribute(attr: &Attribute) -> bool {
    let segments: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    matches!(
        segments.iter().map(String::as_str).collect::<Vec<_>>().as_slice(),
        ["test"] | ["tokio", "test"]
    )
}

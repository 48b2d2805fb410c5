use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::{
    parse::Parser, punctuated::Punctuated, spanned::Spanned, FnArg, GenericArgument, Ident,
    ItemFn, Pat, PathArguments, Signature, Token, Type,
};

/// Transform an asynchronous test into a synchronous one running on a
/// multi-threaded runtime, with a freshly launched registry injected.
///
/// Injectable dependencies are `Arc<Registry>` and `Arc<ManualClock>`; the
/// registry reads the time from that clock. Accepted arguments are `debug`
/// and `vote_if_result_visible`, which switch on the config flags of the
/// same name.
#[proc_macro_attribute]
pub fn registry_test(args: TokenStream, input: TokenStream) -> TokenStream {
    let mut item_fn = match syn::parse::<ItemFn>(input) {
        Ok(item_fn) => item_fn,
        Err(err) => return err.into_compile_error().into(),
    };

    // Reject invalid function signatures.
    let test_args = match check_sig(item_fn.sig.clone()) {
        Ok(args) => args,
        Err(err) => return err.into_compile_error().into(),
    };

    // Work out the config flags.
    let (debug, vote_if_result_visible) = match parse_flags(args) {
        Ok(flags) => flags,
        Err(err) => return err.into_compile_error().into(),
    };

    // Rename the future so the test can have its original name.
    let name = item_fn.sig.ident.clone();
    let new_name = format_ident!("{}_fut", name);
    item_fn.sig.ident = new_name.clone();

    // Rewrite the test function.
    quote! {
        #[test]
        fn #name() {
            /// The test itself.
            #item_fn

            // The test drives registry code, so enable logging.
            log4rs_test_utils::test_logging::init_logging_once_for(["flash_survey"], None, None);

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .thread_name("registry-test-worker")
                .worker_threads(4)
                .enable_all()
                .build()
                .unwrap();

            // Set up the registry. Launching spawns the sweeper, so it must
            // happen inside the runtime.
            let clock = std::sync::Arc::new(crate::clock::ManualClock::default());
            let config = crate::config::Config::example()
                .with_debug(#debug)
                .with_vote_if_result_visible(#vote_if_result_visible);
            #[allow(unused_variables)]
            let registry = runtime.block_on(async {
                crate::registry::Registry::builder(
                    config,
                    std::sync::Arc::new(crate::qr::fake::EchoEncoder),
                )
                .clock(clock.clone())
                .launch()
            });

            runtime.block_on(#new_name(#(#test_args),*));
        }
    }
    .into()
}

/// Parse the attribute arguments into `(debug, vote_if_result_visible)`.
fn parse_flags(args: TokenStream) -> Result<(bool, bool), syn::Error> {
    let idents = Punctuated::<Ident, Token![,]>::parse_terminated.parse(args)?;

    let mut debug = false;
    let mut vote_if_result_visible = false;
    for ident in idents {
        let flag = if ident == "debug" {
            &mut debug
        } else if ident == "vote_if_result_visible" {
            &mut vote_if_result_visible
        } else {
            return Err(syn::Error::new(
                ident.span(),
                "Expected `debug` or `vote_if_result_visible`",
            ));
        };
        if *flag {
            return Err(syn::Error::new(ident.span(), "Duplicate argument"));
        }
        *flag = true;
    }

    Ok((debug, vote_if_result_visible))
}

/// Ensure the wrapped test is async, and work out what to pass for each parameter.
fn check_sig(sig: Signature) -> Result<Vec<TokenStream2>, syn::Error> {
    if sig.asyncness.is_none() {
        return Err(syn::Error::new(sig.span(), "Test must be marked `async`"));
    }

    let mut has_registry = false;
    let mut has_clock = false;
    let mut args = vec![];

    for input in &sig.inputs {
        if let FnArg::Typed(pat_type) = input {
            if let Pat::Ident(_) = &*pat_type.pat {
                match arc_inner_ident(&pat_type.ty) {
                    Some(ident) if ident == "Registry" => {
                        if has_registry {
                            return Err(syn::Error::new(
                                input.span(),
                                "Test cannot accept more than one `Arc<Registry>`",
                            ));
                        }
                        has_registry = true;
                        args.push(quote! { registry.clone() });
                        continue;
                    }
                    Some(ident) if ident == "ManualClock" => {
                        if has_clock {
                            return Err(syn::Error::new(
                                input.span(),
                                "Test cannot accept more than one `Arc<ManualClock>`",
                            ));
                        }
                        has_clock = true;
                        args.push(quote! { clock.clone() });
                        continue;
                    }
                    _ => {}
                }
            }
        }

        return Err(syn::Error::new(
            input.span(),
            "Expected one of `registry_ident: Arc<Registry>` or `clock_ident: Arc<ManualClock>`",
        ));
    }

    Ok(args)
}

/// For a type of the form `Arc<path::to::T>`, return `T`.
fn arc_inner_ident(ty: &Type) -> Option<&Ident> {
    let Type::Path(type_path) = ty else {
        return None;
    };
    let arc = type_path.path.segments.last()?;
    if arc.ident != "Arc" {
        return None;
    }
    let PathArguments::AngleBracketed(generics) = &arc.arguments else {
        return None;
    };
    match generics.args.first()? {
        GenericArgument::Type(Type::Path(inner)) => Some(&inner.path.segments.last()?.ident),
        _ => None,
    }
}

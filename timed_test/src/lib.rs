/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::Expr;
use syn::ItemFn;
use syn::Lit;
use syn::MetaNameValue;
use syn::parse_macro_input;

/// A test macro that fails the test if it runs longer than `timeout_secs`.
///
/// Synchronous tests run on a dedicated thread. Async tests are driven by a
/// multi-threaded tokio runtime, itself on a dedicated thread, so the
/// timeout fires even if the runtime wedges.
///
/// # Examples
///
/// ```rust
/// #[timed_test(timeout_secs = 5)]
/// async fn my_test() {
///     tokio::time::sleep(tokio::time::Duration::from_secs(2)).await;
/// }
///
/// #[timed_test(timeout_secs = 5)]
/// fn my_blocking_test() {
///     std::thread::sleep(std::time::Duration::from_secs(2));
/// }
/// ```
#[proc_macro_attribute]
pub fn timed_test(attr: TokenStream, input: TokenStream) -> TokenStream {
    let attr = parse_macro_input!(attr as MetaNameValue);
    let input_fn = parse_macro_input!(input as ItemFn);

    let timeout_secs = match parse_timeout(&attr) {
        Ok(secs) => secs,
        Err(err) => return TokenStream::from(err.to_compile_error()),
    };

    let fn_block = &input_fn.block;
    let fn_attrs = &input_fn.attrs;
    let fn_vis = &input_fn.vis;
    let sig = &input_fn.sig;
    let fn_name = &sig.ident;
    let output = &sig.output;

    if !sig.inputs.is_empty() {
        return TokenStream::from(
            syn::Error::new_spanned(&sig.inputs, "test function must not take arguments")
                .to_compile_error(),
        );
    }

    let body: TokenStream2 = if sig.asyncness.is_some() {
        quote! {
            let test_rt = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(8)
                .enable_all()
                .build()
                .unwrap();
            test_rt.block_on(async #fn_block)
        }
    } else {
        quote! { (move || #output #fn_block)() }
    };

    let output = quote! {
        #[test]
        #(#fn_attrs)*
        #fn_vis fn #fn_name() #output {
            use std::sync::mpsc::{channel, RecvTimeoutError};
            use std::thread;
            use std::time::Duration;

            let (result_tx, result_rx) = channel();

            // Run the body on its own thread so that a stuck test cannot
            // prevent the timeout below from firing.
            thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    #body
                }));
                let _ = result_tx.send(result);
            });

            match result_rx.recv_timeout(Duration::from_secs(#timeout_secs)) {
                Ok(result) => match result {
                    Ok(test_result) => test_result,
                    Err(panic) => std::panic::resume_unwind(panic),
                },
                Err(RecvTimeoutError::Timeout) => {
                    panic!("test timed out after {} seconds", #timeout_secs);
                },
                Err(RecvTimeoutError::Disconnected) => {
                    panic!("test thread panicked without sending result");
                }
            }
        }
    };

    output.into()
}

fn parse_timeout(attr: &MetaNameValue) -> syn::Result<u64> {
    if !attr.path.is_ident("timeout_secs") {
        return Err(syn::Error::new_spanned(
            &attr.path,
            "only timeout_secs allowed as argument",
        ));
    }
    match &attr.value {
        Expr::Lit(lit) => match &lit.lit {
            Lit::Int(val) => val.base10_parse::<u64>(),
            _ => Err(syn::Error::new_spanned(
                &attr.value,
                "unexpected value for timeout_secs, please pass an integer literal",
            )),
        },
        _ => Err(syn::Error::new_spanned(
            &attr.value,
            "unexpected value for timeout_secs, please pass an integer literal",
        )),
    }
}

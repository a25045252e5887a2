//! Attribute macros for turning a plain `async fn` test/entry point into a
//! function that spins up a fresh `cone_rt::Runtime` and blocks on it.

use proc_macro::TokenStream;
use quote::{quote, ToTokens};
use syn::{parse_macro_input, ItemFn};

/// Wraps an `async fn main() { .. }` so it runs on a freshly constructed
/// `Runtime`.
#[proc_macro_attribute]
pub fn main(attr: TokenStream, item: TokenStream) -> TokenStream {
	expand(attr, item)
}

/// Same as [`main`], for `#[test]` functions.
#[proc_macro_attribute]
pub fn test(attr: TokenStream, item: TokenStream) -> TokenStream {
	let expanded = expand(attr, item);
	let func = parse_macro_input!(expanded as ItemFn);

	quote! {
		#[::core::prelude::v1::test]
		#func
	}
	.into()
}

fn expand(attr: TokenStream, item: TokenStream) -> TokenStream {
	if !attr.is_empty() {
		return syn::Error::new_spanned(
			proc_macro2::TokenStream::from(attr),
			"this attribute takes no arguments"
		)
		.to_compile_error()
		.into();
	}

	let mut func = match syn::parse::<ItemFn>(item) {
		Ok(func) => func,
		Err(err) => return err.to_compile_error().into()
	};

	if func.sig.asyncness.take().is_none() {
		return syn::Error::new_spanned(&func.sig.fn_token, "function must be `async fn`")
			.to_compile_error()
			.into();
	}

	let block = &func.block;

	func.block = syn::parse_quote! {{
		::cone_rt::Runtime::new()
			.expect("failed to start cone_rt runtime")
			.block_on(async move #block)
	}};

	func.to_token_stream().into()
}

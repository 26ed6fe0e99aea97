/*
 * Copyright (c) 2024. Govcraft
 *
 * Licensed under either of
 *   * Apache License, Version 2.0 (the "License");
 *     you may not use this file except in compliance with the License.
 *     You may obtain a copy of the License at http://www.apache.org/licenses/LICENSE-2.0
 *   * MIT license: http://opensource.org/licenses/MIT
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the applicable License for the specific language governing permissions and
 * limitations under that License.
 */
#![forbid(unsafe_code)]

//! Warren Macro Library
//!
//! Procedural macros for declaring message types that travel over the Warren bus.
//!
//! # Message Macro
//!
//! ```ignore
//! // The wire type name defaults to the struct name ("OrderPlaced")
//! #[bus_message]
//! pub struct OrderPlaced {
//!     pub order_id: u64,
//! }
//!
//! // Override the wire type name
//! #[bus_message(name = "billing.invoice-due")]
//! pub struct InvoiceDue {
//!     pub invoice: String,
//! }
//! ```

use proc_macro::TokenStream;

use quote::quote;
use syn::{parse_macro_input, DeriveInput};

fn has_derive(input: &DeriveInput, trait_name: &str) -> bool {
    input.attrs.iter().any(|attr| {
        if attr.path().is_ident("derive") {
            let mut found = false;
            let _ = attr.parse_nested_meta(|meta| {
                if meta
                    .path
                    .segments
                    .last()
                    .is_some_and(|segment| segment.ident == trait_name)
                {
                    found = true;
                }
                Ok(())
            });
            found
        } else {
            false
        }
    })
}

/// Options parsed from `#[bus_message(...)]`.
#[derive(Default)]
struct MessageConfig {
    /// Explicit wire type name.
    name: Option<String>,
}

impl MessageConfig {
    fn parse(attr: &TokenStream) -> Self {
        let mut config = Self::default();

        let attr_string = attr.to_string();
        for part in attr_string.split(',') {
            let Some((key, value)) = part.split_once('=') else {
                continue;
            };
            if key.trim() == "name" {
                let value = value.trim().trim_matches('"').to_string();
                if !value.is_empty() {
                    config.name = Some(value);
                }
            }
        }

        config
    }
}

/// Declares a type as a Warren bus message.
///
/// The macro derives `Clone`, `Debug`, `serde::Serialize` and `serde::Deserialize`
/// (skipping any already present) and implements `BusMessage` with the wire
/// type name used for handler matching and the `type` property of outgoing
/// messages.
///
/// ```ignore
/// use warren::prelude::*;
///
/// #[bus_message]
/// pub struct Ping {
///     pub sequence: u32,
/// }
///
/// assert_eq!(Ping::MESSAGE_TYPE, "Ping");
/// ```
///
/// **Note:** `serde` must be in scope of the crate using the macro.
#[proc_macro_attribute]
pub fn bus_message(attr: TokenStream, item: TokenStream) -> TokenStream {
    let config = MessageConfig::parse(&attr);

    let input = parse_macro_input!(item as DeriveInput);

    let name = &input.ident;
    let generics = &input.generics;
    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();

    let wire_name = config.name.unwrap_or_else(|| name.to_string());

    let derives = {
        let mut traits = Vec::new();
        if !has_derive(&input, "Clone") {
            traits.push(quote!(Clone));
        }
        if !has_derive(&input, "Debug") {
            traits.push(quote!(Debug));
        }
        if !has_derive(&input, "Serialize") {
            traits.push(quote!(serde::Serialize));
        }
        if !has_derive(&input, "Deserialize") {
            traits.push(quote!(serde::Deserialize));
        }
        if traits.is_empty() {
            quote!()
        } else {
            quote!(#[derive(#(#traits),*)])
        }
    };

    let expanded = quote! {
        #derives
        #input

        impl #impl_generics ::warren::prelude::BusMessage for #name #ty_generics #where_clause {
            const MESSAGE_TYPE: &'static str = #wire_name;
        }
    };

    TokenStream::from(expanded)
}

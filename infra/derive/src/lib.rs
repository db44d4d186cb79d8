#![allow(unreachable_pub)]
#![allow(clippy::needless_pass_by_value)]

//! # Macros
//!
//! Procedural macros for the stratum infrastructure.
//!
//! The only macro today is [`macro@stratum_error`], which every crate in the workspace uses to
//! declare its error enum. Consumers depend on this crate and on `thiserror`:
//! ```toml
//! [dependencies]
//! stratum-derive.workspace = true
//! thiserror.workspace = true
//! ```

mod error;

use proc_macro::TokenStream;
use syn::{DeriveInput, parse_macro_input};

/// Attribute macro for defining component error enums.
///
/// # Features
///
/// * **Automatic Derives**: Injects `#[derive(Debug, thiserror::Error)]` unless already present.
/// * **Context Support**: Generates a companion `<Name>Ext` trait that adds `.context()`
///   to `Result<T, Name>` and to `Result<T, Source>` for every wrapped source error.
/// * **Standard Conversions**: Implements `From<Source>` for variants containing a `source`
///   field (or a field marked `#[source]`/`#[from]`), enabling `?` on upstream errors.
/// * **Internal Fallback**: Provides `From<&'static str>` and `From<String>` when an
///   `Internal` variant is present.
/// * **Kind Names**: Generates `fn kind(&self) -> &'static str` returning the variant name, used
///   as a structured `tracing` field.
///
/// # Requirements
///
/// 1. The macro must be applied to an **enum**.
/// 2. Variants that support context must include a `context: Option<Cow<'static, str>>` field.
/// 3. Variants wrapping external errors must carry a context field as well.
/// 4. Tuple and unit variants are rejected.
///
/// # Example
///
/// ```rust,ignore
/// use std::borrow::Cow;
/// use stratum_derive::stratum_error;
///
/// #[stratum_error]
/// pub enum ChannelError {
///     #[error("Channel closed{}: {message}", format_context(.context))]
///     ChannelClosed { message: Cow<'static, str>, context: Option<Cow<'static, str>> },
///
///     #[error("Internal channel error{}: {message}", format_context(.context))]
///     Internal { message: Cow<'static, str>, context: Option<Cow<'static, str>> },
/// }
///
/// fn check(open: bool) -> Result<(), ChannelError> {
///     if open { Ok(()) } else { Err("channel is not open".into()) }
/// }
/// ```
#[proc_macro_attribute]
pub fn stratum_error(_args: TokenStream, item: TokenStream) -> TokenStream {
    let input = parse_macro_input!(item as DeriveInput);
    error::expand_derive(input).into()
}

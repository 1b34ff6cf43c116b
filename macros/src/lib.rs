use proc_macro::TokenStream;

macro_rules! bail {
    ($span:expr, $msg:literal $(,)?) => {
        return ::std::result::Result::Err(::syn::Error::new($span, $msg))
    };
}

mod timeout_impl;

fn into_macro_output(output: syn::Result<proc_macro2::TokenStream>) -> TokenStream {
    output.unwrap_or_else(|e| e.to_compile_error()).into()
}

/// Fails a function that runs longer than the given duration.
///
/// Works on both synchronous and asynchronous functions.
///
/// # Arguments
///
/// Anything implementing
/// [`IntoTimeoutDuration`](coalescer::utils::timer::helpers::IntoTimeoutDuration):
/// a `Duration` expression, or a string with a unit suffix.
///
/// | Suffix | Equivalent to                      |
/// |--------|----------------------------------- |
/// | `ms`   | `Duration::from_millis(n)`         |
/// | `s`    | `Duration::from_secs(n)`           |
/// | `m`    | `Duration::from_secs(n * 60)`      |
///
/// String literals are checked at compile time.
///
/// # Behavior
///
/// - A function returning `Result<T, E>` returns `Err` with
///   [`TimeoutError`](coalescer::utils::timer::TimeoutError) converted via `Into::into`.
/// - Any other function panics.
///
/// ```ignore
/// #[timeout("100ms")]
/// async fn refresh() -> Result<u32, TimeoutError> {
///     // ...
/// }
/// ```
#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    into_macro_output(timeout_impl::timeout(attr.into(), item.into()))
}

/// Fails a function that finishes before the given duration elapses.
///
/// The duration is written the same way as for [`timeout`].
///
/// Only functions returning `()` or `Result<(), E>` are accepted. Finishing early returns
/// `Err` with
/// [`ShouldTimeoutError`](coalescer::utils::timer::helpers::ShouldTimeoutError)
/// converted via `Into::into`, or panics for `()`.
#[proc_macro_attribute]
pub fn should_timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    into_macro_output(timeout_impl::should_timeout(attr.into(), item.into()))
}

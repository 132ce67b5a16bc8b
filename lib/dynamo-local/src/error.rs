//! Generic error helpers.
//!
//! Components expose typed errors (see each module), while opaque collaborators such as the container runtime and the
//! HTTP client surface their failures as [`GenericError`].

use std::fmt::Display;

/// An opaque error from a collaborator that has no typed error of its own.
pub type GenericError = anyhow::Error;

/// Constructs a [`GenericError`].
///
/// Accepts a string literal, a format string with arguments (in the same order as `std::format!`), or a value which
/// implements `Debug` and `Display`, such as an existing error.
#[macro_export]
macro_rules! generic_error {
    ($msg:literal $(,)?) => { $crate::error::_anyhow!($msg) };
    ($err:expr $(,)?) => { $crate::error::_anyhow!($err) };
    ($fmt:expr, $($arg:tt)*) => { $crate::error::_anyhow!($fmt, $($arg)*) };
}

#[doc(hidden)]
pub use anyhow::anyhow as _anyhow;

pub(crate) mod private {
    pub trait Sealed {}

    impl<T, E> Sealed for Result<T, E> {}
}

// Wraps `anyhow::Context` so the method names don't collide with `snafu::ResultExt`.
pub trait ErrorContext<T, E>: private::Sealed {
    /// Wrap the error value with additional context.
    fn error_context<C>(self, context: C) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static;

    /// Wrap the error value with additional context that is evaluated lazily only once an error does occur.
    fn with_error_context<C, F>(self, f: F) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C;
}

impl<T, E> ErrorContext<T, E> for Result<T, E>
where
    Result<T, E>: anyhow::Context<T, E>,
{
    fn error_context<C>(self, context: C) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
    {
        <Self as anyhow::Context<T, E>>::context(self, context)
    }

    fn with_error_context<C, F>(self, context: F) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        <Self as anyhow::Context<T, E>>::with_context(self, context)
    }
}

//! Error helpers for bootstrap code.
//!
//! Runtime failures are typed (`snafu` enums next to the code producing them). Setup paths such as loading certificates
//! only need a message and a source chain, which is what [`GenericError`] carries.

use std::{error::Error, fmt::Display};

/// Catch-all error type for bootstrap and setup code.
pub type GenericError = anyhow::Error;

/// Builds a [`GenericError`] from a format string and its arguments.
#[macro_export]
macro_rules! generic_error {
    ($($arg:tt)+) => { $crate::__anyhow!($($arg)+) };
}

#[doc(hidden)]
pub use anyhow::anyhow as __anyhow;

/// Converts a failing `Result` into a [`GenericError`] wrapped with a message.
///
/// Named apart from `snafu::ResultExt::with_context` so that both can be imported in the same module.
pub trait ErrorContext<T> {
    /// Wraps the error with the message built by `f`, which only runs on the error path.
    fn with_error_context<C, F>(self, f: F) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C;
}

impl<T, E> ErrorContext<T> for Result<T, E>
where
    E: Error + Send + Sync + 'static,
{
    fn with_error_context<C, F>(self, f: F) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        self.map_err(|e| GenericError::new(e).context(f()))
    }
}

//! Error handling utils.
//!
//! Recoverable failures of the runtime API surface as [`Error`]. Syscall-level
//! failures inside the [hook facade](crate::hook) keep the raw `-1`/`errno`
//! contract of the underlying OS call and are never converted; see the hook
//! module docs for details.

use std::io;

/// A specialized [`Result`] type for the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Represents all error cases for all routines of the crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("io error: {0}")]
    IO(#[from] io::Error),

    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    #[error("config variable `{name}`: {message}")]
    Config { name: String, message: String },
}

impl Error {
    #[inline(always)]
    pub fn config(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Config {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Returns the name of the variant as it is spelled in the source code.
    pub const fn variant_name(&self) -> &'static str {
        match self {
            Self::IO(_) => "IO",
            Self::ConfigParse(_) => "ConfigParse",
            Self::Config { .. } => "Config",
        }
    }
}

const _: () = {
    /// Assert Error implements Send + Sync
    const fn if_this_compiles_the_type_implements_send_and_sync<T: Send + Sync>() {}
    if_this_compiles_the_type_implements_send_and_sync::<Error>();
};

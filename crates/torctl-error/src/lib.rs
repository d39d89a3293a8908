//! Shared error type for the `torctl` workspace.
//!
//! Every crate in this workspace funnels its failures through [`Error`],
//! the same way `tor-circmgr::Error` wraps `tor_chanmgr::Error` and
//! `tor_proto::Error` instead of each layer inventing its own top-level
//! error type.

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::fmt;

use thiserror::Error;

/// A `Result` alias using [`Error`] as its error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for the `torctl` control-port client.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// The control connection sent us something that didn't parse as a
    /// reply or an event.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Tor replied to a command with a `4xx`/`5xx` status.
    #[error("control port error {code}: {text}")]
    ErrorReply {
        /// The three-digit status code.
        code: u16,
        /// The human-readable text of the reply.
        text: String,
    },

    /// The control connection's socket closed (EOF or reset) while a
    /// command was outstanding, or while callers still hold a handle to
    /// the connection.
    #[error("control connection closed")]
    Closed,

    /// The path selector exhausted every candidate without producing a
    /// path that satisfies the configured restrictions.
    #[error("no routers satisfy the current path restrictions")]
    NoRouters,

    /// A configuration value failed to build (e.g. a builder field was
    /// left unset with no default, or failed validation).
    #[error("invalid configuration: {0}")]
    Config(String),

    /// An I/O failure talking to the control port.
    #[error("I/O error: {0}")]
    Io(#[from] IoErrorWrapper),

    /// A condition that "can't happen" if the rest of this crate is
    /// correct; surfaced rather than panicking so callers can log and
    /// recover.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Wraps [`std::io::Error`] so that [`Error`] can derive `Clone`.
///
/// `std::io::Error` isn't `Clone`, but our event-dispatch loop needs to
/// hand the same closure error to every pending command callback when the
/// socket dies (spec invariant: "every queued callback is completed with a
/// `Closed` error exactly once" generalizes to "with the same error").
#[derive(Debug, Clone)]
pub struct IoErrorWrapper(pub std::sync::Arc<std::io::Error>);

impl fmt::Display for IoErrorWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for IoErrorWrapper {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&**self.0)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        Error::Io(IoErrorWrapper(std::sync::Arc::new(e)))
    }
}

impl From<derive_builder::UninitializedFieldError> for Error {
    fn from(e: derive_builder::UninitializedFieldError) -> Error {
        Error::Config(format!("field not provided: {}", e.field_name()))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn error_reply_displays_code_and_text() {
        let e = Error::ErrorReply {
            code: 552,
            text: "Unrecognized option".into(),
        };
        assert_eq!(
            e.to_string(),
            "control port error 552: Unrecognized option"
        );
    }

    #[test]
    fn io_error_is_cloneable() {
        let e: Error = std::io::Error::new(std::io::ErrorKind::Other, "boom").into();
        let e2 = e.clone();
        assert_eq!(e.to_string(), e2.to_string());
    }
}

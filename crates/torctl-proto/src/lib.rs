//! Wire codec, event model, and control-port connection for `torctl`.
//!
//! This crate owns exactly the wire socket (spec §3, "Ownership"): the
//! request/response multiplexer in [`conn`] and the line framing in
//! [`codec`] are the only things here that touch bytes; [`event`] is a
//! pure parser with no I/O.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::needless_lifetimes)]

pub mod codec;
pub mod conn;
pub mod event;

pub use codec::{FrameError, Reply, ReplyLine};
pub use conn::{Connection, TimedEvent};
pub use event::{AddrMapExpiry, CircuitEvent, Event, LogSeverity, NetworkStatus, StreamEvent};
pub use torctl_error::{Error, Result};

//! Selection manager, path builder, circuit pool, and stream attacher
//! (spec §4.6, §4.7).
//!
//! "Exactly one task owns `RouterTable`/`circuits`/`streams` and drains
//! the event channel" (spec §5): [`builder::PathBuilder`] is that task.
//! Every other task reaches in only through a [`scheduler::SchedulerHandle`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod builder;
pub mod circuit;
pub mod config;
pub mod scheduler;
pub mod selmgr;
pub mod stream;

pub use builder::PathBuilder;
pub use circuit::{CircId, Circuit};
pub use config::{ExitPin, GeoIpConfig, GeoIpConfigBuilder, SelectionConfig, SelectionConfigBuilder, UniqueCountries};
pub use scheduler::{Job, SchedulerHandle, SchedulerQueues};
pub use selmgr::SelectionManager;
pub use stream::{Stream, StrmId};
pub use torctl_error::{Error, Result};

//! Composable node/path restrictions, candidate generators, and the path
//! selector (spec §4.3–§4.5).
//!
//! `torctl-circmgr`'s selection manager is the only intended caller: it
//! translates a high-level configuration into concrete restriction lists
//! and generators, then hands them to [`selector::PathSelector`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod generator;
pub mod path_restriction;
pub mod restriction;
pub mod selector;

pub use generator::{BwWeightedGenerator, Generator, HopKind, OrderedExitGenerator, UniformGenerator};
pub use path_restriction::{PathRestriction, PathRestrictionKind, PathRestrictionList};
pub use restriction::{NodeRestriction, NodeRestrictionList, RestrictionKind};
pub use selector::PathSelector;
pub use torctl_error::{Error, Result};

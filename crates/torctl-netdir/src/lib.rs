//! Router model, exit-policy evaluation, and consensus bookkeeping.
//!
//! Splits into the pure data model ([`router`]), the consensus/descriptor
//! ingestion glue ([`netstatus`], [`descriptor`]), the idhex-keyed arena
//! that lets async code hold a stable handle across updates ([`arena`]),
//! and the injected GeoIP oracle ([`geoip`]).

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod arena;
pub mod descriptor;
pub mod geoip;
pub mod netstatus;
pub mod router;

pub use arena::{RouterId, RouterTable};
pub use descriptor::{parse_descriptor, Descriptor};
pub use geoip::{continent_of, GeoIp, NullGeoIp};
pub use netstatus::NsEntry;
pub use router::{normalize_idhex, ExitPolicy, ExitPolicyRule, Router, RouterFlags, RouterVersion};

//! The piece of a router's state that comes off a network-status
//! consensus line, before any descriptor has filled in its exit policy or
//! bandwidth-observed value.
//!
//! Kept independent of `torctl-proto::event::NetworkStatus` on purpose:
//! that type is the wire-parse result, this one is the ingestion input to
//! the router table. `torctl-circmgr` is the seam that translates between
//! them (spec §3, "Ownership").

use crate::geoip::GeoIp;
use crate::router::{normalize_idhex, parse_ipv4, Router, RouterFlags, RouterVersion};

/// One router's worth of consensus data, ready to be merged into a
/// [`crate::arena::RouterTable`].
#[derive(Debug, Clone)]
pub struct NsEntry {
    pub idhex: String,
    pub nickname: String,
    pub ip: String,
    pub flags: Vec<String>,
}

impl NsEntry {
    /// Build a fresh [`Router`] from this consensus entry. `bw`,
    /// `exit_policy`, `os`, `uptime`, and `version` start at their
    /// unknown/empty defaults until a matching descriptor arrives.
    pub fn into_router(self, geoip: &dyn GeoIp, list_rank: usize) -> Router {
        let ip = parse_ipv4(&self.ip).unwrap_or(0);
        let flags = RouterFlags::from_words(&self.flags);
        let country = geoip.country_of(ip);
        let continent = country
            .as_deref()
            .and_then(crate::geoip::continent_of)
            .map(str::to_owned);
        Router {
            idhex: normalize_idhex(&self.idhex),
            nickname: self.nickname,
            ip,
            bw: 0,
            flags,
            version: RouterVersion::UNKNOWN,
            os: String::new(),
            uptime: 0,
            exit_policy: Default::default(),
            country,
            continent,
            list_rank,
            down: !flags.contains(RouterFlags::RUNNING),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::geoip::NullGeoIp;

    #[test]
    fn fresh_router_is_down_without_running_flag() {
        let entry = NsEntry {
            idhex: "$abcd".into(),
            nickname: "relay".into(),
            ip: "1.2.3.4".into(),
            flags: vec!["Valid".into(), "Fast".into()],
        };
        let r = entry.into_router(&NullGeoIp, 0);
        assert!(r.is_down());
        assert_eq!(r.idhex, "ABCD");
    }

    #[test]
    fn running_flag_marks_router_up() {
        let entry = NsEntry {
            idhex: "ABCD".into(),
            nickname: "relay".into(),
            ip: "1.2.3.4".into(),
            flags: vec!["Running".into(), "Valid".into()],
        };
        let r = entry.into_router(&NullGeoIp, 0);
        assert!(!r.is_down());
        assert!(r.flags.contains(RouterFlags::RUNNING));
    }
}

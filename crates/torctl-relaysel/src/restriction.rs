//! Composable node predicates, with combinators, and a mutable restriction
//! list (spec §4.3).
//!
//! Grounded on `original_source/PathSupport.py`'s `NodeRestriction`
//! subclasses (`PercentileRestriction`, `OSRestriction`,
//! `ConserveExitsRestriction`, `FlagsRestriction`, `IdHexRestriction`,
//! `MinBWRestriction`, `VersionRangeRestriction`, `ExitPolicyRestriction`,
//! `..CountryRestriction` family) and `OrNodeRestriction`/
//! `NotNodeRestriction`/`AtLeastNNodeRestriction`. Kept as a closed tagged
//! union (design note in spec §9) rather than trait objects so
//! `remove_by_kind` can match on a `RestrictionKind` without downcasting.

use std::collections::HashSet;
use std::net::Ipv4Addr;

use regex::Regex;

use torctl_netdir::{ExitPolicy, Router, RouterFlags, RouterVersion};

/// A tag identifying a [`NodeRestriction`] variant, used by
/// [`NodeRestrictionList::remove_by_kind`] (spec §4.3: "affects top-level
/// only, not combinators").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RestrictionKind {
    Percentile,
    Os,
    ConserveExits,
    Flags,
    Nick,
    IdHex,
    MinBw,
    VersionInclude,
    VersionExclude,
    VersionRange,
    ExitPolicy,
    CountryCodeSet,
    Country,
    ExcludeCountries,
    Or,
    Not,
    AtLeastN,
}

/// One node predicate, per spec §4.3.
#[derive(Debug, Clone)]
pub enum NodeRestriction {
    /// Admits routers in the `[pct_skip, pct_skip+pct_fast)` slice of the
    /// current bandwidth-ranked list — the upper bound is exclusive,
    /// matching `PathSupport.py`'s `rank >= pct_start and rank < pct_stop`.
    Percentile { pct_skip: u8, pct_fast: u8 },
    /// Admits routers whose `os` matches at least one of `ok` and none of
    /// `bad`.
    Os { ok: Vec<Regex>, bad: Vec<Regex> },
    /// Rejects any router carrying the `Exit` flag.
    ConserveExits,
    /// Requires every flag in `mandatory` and none in `forbidden`.
    Flags {
        mandatory: RouterFlags,
        forbidden: RouterFlags,
    },
    /// Admits only the router with this nickname.
    Nick(String),
    /// Admits only the router with this (normalized) fingerprint.
    IdHex(String),
    /// Requires at least this observed bandwidth.
    MinBw(u64),
    /// Admits only routers whose version is in this list.
    VersionInclude(Vec<RouterVersion>),
    /// Rejects routers whose version is in this list.
    VersionExclude(Vec<RouterVersion>),
    /// Admits routers whose version falls in `[min, max]`.
    VersionRange {
        min: RouterVersion,
        max: RouterVersion,
    },
    /// Requires the router's exit policy to permit `(ip, port)`.
    ExitPolicy { ip: Ipv4Addr, port: u16 },
    /// Requires the router to have a known country code.
    CountryCodeSet,
    /// Requires the router's country code to equal `code`.
    Country(String),
    /// Rejects routers whose country code is in `codes`.
    ExcludeCountries(HashSet<String>),
    /// Passes if any sub-restriction passes.
    Or(Vec<NodeRestriction>),
    /// Passes if the sub-restriction fails.
    Not(Box<NodeRestriction>),
    /// Passes if at least `n` of the sub-restrictions pass.
    AtLeastN { subs: Vec<NodeRestriction>, n: usize },
}

impl NodeRestriction {
    /// This predicate's [`RestrictionKind`] tag.
    pub fn kind(&self) -> RestrictionKind {
        match self {
            NodeRestriction::Percentile { .. } => RestrictionKind::Percentile,
            NodeRestriction::Os { .. } => RestrictionKind::Os,
            NodeRestriction::ConserveExits => RestrictionKind::ConserveExits,
            NodeRestriction::Flags { .. } => RestrictionKind::Flags,
            NodeRestriction::Nick(_) => RestrictionKind::Nick,
            NodeRestriction::IdHex(_) => RestrictionKind::IdHex,
            NodeRestriction::MinBw(_) => RestrictionKind::MinBw,
            NodeRestriction::VersionInclude(_) => RestrictionKind::VersionInclude,
            NodeRestriction::VersionExclude(_) => RestrictionKind::VersionExclude,
            NodeRestriction::VersionRange { .. } => RestrictionKind::VersionRange,
            NodeRestriction::ExitPolicy { .. } => RestrictionKind::ExitPolicy,
            NodeRestriction::CountryCodeSet => RestrictionKind::CountryCodeSet,
            NodeRestriction::Country(_) => RestrictionKind::Country,
            NodeRestriction::ExcludeCountries(_) => RestrictionKind::ExcludeCountries,
            NodeRestriction::Or(_) => RestrictionKind::Or,
            NodeRestriction::Not(_) => RestrictionKind::Not,
            NodeRestriction::AtLeastN { .. } => RestrictionKind::AtLeastN,
        }
    }

    /// Does `router` satisfy this predicate, given its rank in a
    /// bandwidth-descending list of `total` routers (needed for
    /// [`NodeRestriction::Percentile`])?
    pub fn check(&self, router: &Router, total: usize) -> bool {
        match self {
            NodeRestriction::Percentile { pct_skip, pct_fast } => {
                if total == 0 {
                    return false;
                }
                let lo = (*pct_skip as usize * total) / 100;
                let span = (*pct_fast as usize * total) / 100;
                let hi = (lo + span).min(total);
                (lo..hi).contains(&router.list_rank)
            }
            NodeRestriction::Os { ok, bad } => {
                let matches_ok = ok.is_empty() || ok.iter().any(|re| re.is_match(&router.os));
                let matches_bad = bad.iter().any(|re| re.is_match(&router.os));
                matches_ok && !matches_bad
            }
            NodeRestriction::ConserveExits => !router.flags.contains(RouterFlags::EXIT),
            NodeRestriction::Flags {
                mandatory,
                forbidden,
            } => router.flags.contains(*mandatory) && !router.flags.intersects(*forbidden),
            NodeRestriction::Nick(nick) => router.nickname == *nick,
            NodeRestriction::IdHex(idhex) => router.idhex == *idhex,
            NodeRestriction::MinBw(min) => router.bw >= *min,
            NodeRestriction::VersionInclude(versions) => versions.contains(&router.version),
            NodeRestriction::VersionExclude(versions) => !versions.contains(&router.version),
            NodeRestriction::VersionRange { min, max } => {
                router.version >= *min && router.version <= *max
            }
            NodeRestriction::ExitPolicy { ip, port } => {
                router.exit_policy_allows(*ip, *port)
            }
            NodeRestriction::CountryCodeSet => router.country.is_some(),
            NodeRestriction::Country(code) => router.country.as_deref() == Some(code.as_str()),
            NodeRestriction::ExcludeCountries(codes) => match &router.country {
                Some(c) => !codes.contains(c),
                None => true,
            },
            NodeRestriction::Or(subs) => subs.iter().any(|r| r.check(router, total)),
            NodeRestriction::Not(sub) => !sub.check(router, total),
            NodeRestriction::AtLeastN { subs, n } => {
                subs.iter().filter(|r| r.check(router, total)).count() >= *n
            }
        }
    }
}

/// Helper on [`Router`] so [`NodeRestriction::ExitPolicy`] reads naturally;
/// `will_exit_to` already normalizes "no match" to deny per spec §7.
trait ExitPolicyAllows {
    fn exit_policy_allows(&self, ip: Ipv4Addr, port: u16) -> bool;
}

impl ExitPolicyAllows for Router {
    fn exit_policy_allows(&self, ip: Ipv4Addr, port: u16) -> bool {
        self.will_exit_to(ip, port)
    }
}

/// An ordered, mutable sequence of [`NodeRestriction`]s, evaluated by
/// short-circuit conjunction (spec §4.3).
#[derive(Debug, Clone, Default)]
pub struct NodeRestrictionList(Vec<NodeRestriction>);

impl NodeRestrictionList {
    /// An empty restriction list (admits everything).
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Append a predicate.
    pub fn add(&mut self, r: NodeRestriction) {
        self.0.push(r);
    }

    /// Remove every top-level predicate of kind `kind`. Combinators
    /// (`Or`/`Not`/`AtLeastN`) are opaque: their contents are never
    /// inspected (spec §4.3, §8 invariant 5).
    pub fn remove_by_kind(&mut self, kind: RestrictionKind) {
        self.0.retain(|r| r.kind() != kind);
    }

    /// Evaluate every predicate in order, short-circuiting on first
    /// failure.
    pub fn check(&self, router: &Router, total: usize) -> bool {
        self.0.iter().all(|r| r.check(router, total))
    }

    /// Iterate over the top-level predicates.
    pub fn iter(&self) -> impl Iterator<Item = &NodeRestriction> {
        self.0.iter()
    }

    /// True if no top-level predicates remain.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use torctl_netdir::NullGeoIp;
    use torctl_netdir::RouterTable;

    fn table_with(bws: &[u64]) -> RouterTable {
        let mut table = RouterTable::new();
        let entries = bws
            .iter()
            .enumerate()
            .map(|(i, _)| torctl_netdir::NsEntry {
                idhex: format!("{i:040}"),
                nickname: format!("r{i}"),
                ip: "1.2.3.4".into(),
                flags: vec!["Running".into()],
            })
            .collect();
        table.read_routers(entries, &NullGeoIp);
        // Patch in bandwidths via descriptors, since NsEntry carries none.
        for (i, bw) in bws.iter().enumerate() {
            let idhex = format!("{i:040}");
            let mut desc = torctl_netdir::Descriptor::default();
            desc.bw = Some(*bw);
            table.apply_descriptor(&idhex, desc);
        }
        table
    }

    #[test]
    fn remove_by_kind_leaves_no_top_level_predicate_of_that_kind() {
        let mut list = NodeRestrictionList::new();
        list.add(NodeRestriction::ConserveExits);
        list.add(NodeRestriction::MinBw(100));
        list.add(NodeRestriction::Or(vec![NodeRestriction::ConserveExits]));
        list.remove_by_kind(RestrictionKind::ConserveExits);
        assert_eq!(list.iter().count(), 2);
        assert!(!list
            .iter()
            .any(|r| matches!(r, NodeRestriction::ConserveExits)));
        // The Or-wrapped ConserveExits is untouched.
        assert!(list.iter().any(|r| matches!(r, NodeRestriction::Or(_))));
    }

    #[test]
    fn flags_restriction_passes_with_empty_mandatory() {
        let table = table_with(&[100]);
        let r = table.iter().next().unwrap();
        let restr = NodeRestriction::Flags {
            mandatory: RouterFlags::empty(),
            forbidden: RouterFlags::empty(),
        };
        assert!(restr.check(r, 1));
    }

    #[test]
    fn percentile_slice_upper_bound_is_exclusive() {
        // total=5, pct_skip=0, pct_fast=40 => lo=0, hi=(0+2).min(5)=2,
        // admitting ranks 0..2 (i.e. 0 and 1), matching PathSupport.py's
        // `rank >= pct_start and rank < pct_stop`.
        let table = table_with(&[100, 80, 60, 40, 20]);
        let total = table.len();
        let restr = NodeRestriction::Percentile {
            pct_skip: 0,
            pct_fast: 40,
        };
        let mut admitted: Vec<usize> = table.iter().filter(|r| restr.check(r, total)).map(|r| r.list_rank).collect();
        admitted.sort_unstable();
        assert_eq!(admitted, vec![0, 1]);
    }

    #[test]
    fn exclude_countries_admits_unknown_country() {
        let mut set = HashSet::new();
        set.insert("US".to_string());
        let restr = NodeRestriction::ExcludeCountries(set);
        let table = table_with(&[100]);
        let r = table.iter().next().unwrap();
        assert!(restr.check(r, 1));
    }
}

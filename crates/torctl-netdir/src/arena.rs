//! The router table: an idhex-keyed arena that supports in-place updates
//! visible to every holder of a [`RouterId`], instead of handing out
//! aliasable `&mut Router` references.
//!
//! Grounded on the design note in spec §9: routers are looked up and
//! mutated by stable index, not by reference, so a stream attacher and
//! the descriptor-ingestion path can both hold a `RouterId` across an
//! `.await` without fighting the borrow checker. Modeled after
//! `tor-netdir`'s pattern of keying relays by a stable id rather than
//! threading `&Relay` through async code.
//!
//! A [`RouterId`] names a *storage slot*, not a position in bandwidth
//! order: the slot a router occupies never moves for as long as that
//! router stays in the consensus, even though its `list_rank` (and its
//! place in [`RouterTable::iter`]) changes every time the bandwidth order
//! is recomputed. The two orderings are tracked separately for exactly
//! this reason.

use std::collections::HashMap;

use crate::descriptor::Descriptor;
use crate::geoip::GeoIp;
use crate::netstatus::NsEntry;
use crate::router::{normalize_idhex, Router};

/// A stable handle to a router in a [`RouterTable`]. Remains valid across
/// `read_routers`/`apply_descriptor` calls as long as the router itself
/// isn't dropped from the consensus — unlike `list_rank`, which is
/// recomputed (and may change) on every such call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RouterId(usize);

/// The full set of routers known from the most recent consensus, plus
/// whatever descriptors have arrived since.
///
/// Routers live in fixed storage slots (`slots[id.0]`); slots freed by a
/// router dropping out of the consensus are recycled for new routers, but
/// never for the lifetime of a still-tracked one. `order` is a separate
/// vector of slot indices, bandwidth-descending, recomputed whenever a
/// mutation could have changed the ordering; `list_rank` mirrors a
/// router's position within it (spec §3 invariant 3).
#[derive(Debug, Default)]
pub struct RouterTable {
    slots: Vec<Option<Router>>,
    by_idhex: HashMap<String, usize>,
    free: Vec<usize>,
    order: Vec<usize>,
}

impl RouterTable {
    /// An empty table.
    pub fn new() -> RouterTable {
        RouterTable::default()
    }

    /// Number of routers currently tracked.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// True if no routers are tracked.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Look up a router's stable id by fingerprint.
    pub fn id_of(&self, idhex: &str) -> Option<RouterId> {
        self.by_idhex.get(&normalize_idhex(idhex)).map(|&i| RouterId(i))
    }

    /// Borrow a router by id.
    pub fn get(&self, id: RouterId) -> Option<&Router> {
        self.slots.get(id.0).and_then(|s| s.as_ref())
    }

    /// All routers, in ascending `list_rank` (bandwidth-descending) order.
    pub fn iter(&self) -> impl Iterator<Item = &Router> {
        self.order.iter().map(move |&i| {
            self.slots[i]
                .as_ref()
                .expect("order only ever holds occupied slots")
        })
    }

    /// Insert into a recycled slot if one is free, else append a new one.
    /// Returns the slot index the router now occupies.
    fn insert_new(&mut self, idhex: String, router: Router) -> usize {
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(router);
                idx
            }
            None => {
                self.slots.push(Some(router));
                self.slots.len() - 1
            }
        };
        self.by_idhex.insert(idhex, idx);
        idx
    }

    /// Merge a fresh consensus into the table: update routers already
    /// known in place (preserving accumulated descriptor state like `bw`
    /// and `exit_policy`, per spec §3: "`read_routers` performs in-place
    /// updates of existing `Router` objects"), insert new ones in a fresh
    /// slot, and free the slot of any router no longer listed. Recomputes
    /// `list_rank` for everyone afterward (spec §3 invariant 3).
    ///
    /// A router dropped from the consensus loses its slot (and any
    /// descriptor data it had accumulated) — if it reappears in a later
    /// consensus it gets a new slot and starts fresh, so a `RouterId`
    /// captured before the drop must not be used afterward.
    pub fn read_routers(&mut self, entries: Vec<NsEntry>, geoip: &dyn GeoIp) {
        let seen: std::collections::HashSet<String> =
            entries.iter().map(|e| normalize_idhex(&e.idhex)).collect();

        let stale: Vec<String> = self
            .by_idhex
            .keys()
            .filter(|k| !seen.contains(*k))
            .cloned()
            .collect();
        for idhex in stale {
            if let Some(idx) = self.by_idhex.remove(&idhex) {
                self.slots[idx] = None;
                self.free.push(idx);
            }
        }

        for entry in entries {
            let idhex = normalize_idhex(&entry.idhex);
            match self.by_idhex.get(&idhex).copied() {
                Some(idx) => {
                    let fresh = entry.into_router(geoip, 0);
                    let r = self.slots[idx].as_mut().expect("tracked slot is occupied");
                    r.nickname = fresh.nickname;
                    r.ip = fresh.ip;
                    r.flags = fresh.flags;
                    r.country = fresh.country;
                    r.continent = fresh.continent;
                    r.down = fresh.down;
                }
                None => {
                    let router = entry.into_router(geoip, 0);
                    self.insert_new(idhex, router);
                }
            }
        }

        self.resort();
    }

    /// Apply a parsed descriptor onto the router it describes, matched by
    /// the descriptor's own `router` line address (spec §6).
    ///
    /// A descriptor for a fingerprint we don't currently track (e.g. one
    /// that raced a consensus update) is silently ignored, matching the
    /// original's tolerance of a stale `NEWDESC` chasing a router that
    /// just dropped out of the consensus.
    pub fn apply_descriptor(&mut self, idhex: &str, desc: Descriptor) {
        let idhex = normalize_idhex(idhex);
        let Some(&idx) = self.by_idhex.get(&idhex) else {
            return;
        };
        let r = self.slots[idx].as_mut().expect("tracked slot is occupied");
        if let Some(nickname) = desc.nickname {
            r.nickname = nickname;
        }
        if let Some(ip) = desc.ip {
            r.ip = ip;
        }
        if let Some(os) = desc.os {
            r.os = os;
        }
        if let Some(version) = desc.version {
            r.version = version;
        }
        if let Some(uptime) = desc.uptime {
            r.uptime = uptime;
        }
        if let Some(bw) = desc.bw {
            r.bw = bw;
        }
        if !desc.exit_policy.0.is_empty() {
            r.exit_policy = desc.exit_policy;
        }
        if desc.hibernating {
            r.down = true;
        }

        self.resort();
    }

    /// Recompute `order` (bandwidth-descending over occupied slots) and
    /// each router's `list_rank`, without moving any router between
    /// slots — this is what keeps a [`RouterId`] valid across the call.
    fn resort(&mut self) {
        let mut order: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|_| i))
            .collect();
        order.sort_by(|&a, &b| {
            self.slots[a]
                .as_ref()
                .unwrap()
                .cmp(self.slots[b].as_ref().unwrap())
        });
        for (rank, &idx) in order.iter().enumerate() {
            self.slots[idx].as_mut().expect("occupied").list_rank = rank;
        }
        self.order = order;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::geoip::NullGeoIp;

    fn entry(idhex: &str, flags: &[&str]) -> NsEntry {
        NsEntry {
            idhex: idhex.into(),
            nickname: format!("r{idhex}"),
            ip: "1.2.3.4".into(),
            flags: flags.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn list_rank_matches_sorted_position_after_read() {
        let mut table = RouterTable::new();
        table.read_routers(
            vec![entry("AAAA", &["Running"]), entry("BBBB", &["Running"])],
            &NullGeoIp,
        );
        let mut ranks: Vec<usize> = table.iter().map(|r| r.list_rank).collect();
        ranks.sort_unstable();
        assert_eq!(ranks, vec![0, 1]);
    }

    #[test]
    fn iter_is_bandwidth_descending() {
        let mut table = RouterTable::new();
        table.read_routers(vec![entry("AAAA", &["Running"]), entry("BBBB", &["Running"])], &NullGeoIp);
        let mut desc = Descriptor::default();
        desc.bw = Some(999_999);
        table.apply_descriptor("BBBB", desc);

        let bws: Vec<&str> = table.iter().map(|r| r.idhex.as_str()).collect();
        assert_eq!(bws, vec!["BBBB", "AAAA"]);
    }

    #[test]
    fn router_id_survives_a_resort_triggered_by_a_descriptor() {
        let mut table = RouterTable::new();
        table.read_routers(
            vec![entry("AAAA", &["Running"]), entry("BBBB", &["Running"])],
            &NullGeoIp,
        );

        // Captured before BBBB's bandwidth update moves it to rank 0: if
        // RouterId aliased a sorted position rather than a storage slot,
        // this handle would silently start pointing at AAAA instead.
        let id_b = table.id_of("BBBB").unwrap();
        let mut desc = Descriptor::default();
        desc.bw = Some(999_999);
        table.apply_descriptor("BBBB", desc);

        let b = table.get(id_b).unwrap();
        assert_eq!(b.idhex, "BBBB");
        assert_eq!(b.list_rank, 0, "higher bandwidth router should rank first");
    }

    #[test]
    fn router_id_survives_a_resort_triggered_by_read_routers() {
        let mut table = RouterTable::new();
        table.read_routers(vec![entry("AAAA", &["Running"]), entry("BBBB", &["Running"])], &NullGeoIp);
        let id_a = table.id_of("AAAA").unwrap();

        // A later consensus round that still lists AAAA, alongside a new
        // high-bandwidth router that reshuffles the bandwidth order,
        // must not disturb AAAA's slot.
        table.read_routers(
            vec![
                entry("AAAA", &["Running"]),
                entry("BBBB", &["Running"]),
                entry("CCCC", &["Running", "Fast"]),
            ],
            &NullGeoIp,
        );
        assert_eq!(table.get(id_a).unwrap().idhex, "AAAA");
    }

    #[test]
    fn dropping_from_consensus_loses_descriptor_state() {
        let mut table = RouterTable::new();
        table.read_routers(vec![entry("AAAA", &["Running"])], &NullGeoIp);
        let mut desc = Descriptor::default();
        desc.bw = Some(50_000);
        table.apply_descriptor("AAAA", desc);

        // A consensus that omits "AAAA" entirely drops it from the table.
        table.read_routers(vec![entry("BBBB", &["Running"])], &NullGeoIp);
        assert!(table.id_of("AAAA").is_none());

        // Reappearing later gets a fresh slot with no descriptor data.
        table.read_routers(
            vec![entry("AAAA", &["Running"]), entry("BBBB", &["Running"])],
            &NullGeoIp,
        );
        let id = table.id_of("AAAA").unwrap();
        assert_eq!(table.get(id).unwrap().bw, 0);
    }

    #[test]
    fn surviving_consensus_update_preserves_descriptor_state() {
        let mut table = RouterTable::new();
        table.read_routers(vec![entry("AAAA", &["Running"])], &NullGeoIp);
        let mut desc = Descriptor::default();
        desc.bw = Some(50_000);
        table.apply_descriptor("AAAA", desc);

        // Same idhex still present next round: an in-place update per spec
        // ("read_routers performs in-place updates of existing Router
        // objects"), so descriptor-derived fields like `bw` survive.
        table.read_routers(vec![entry("AAAA", &["Running", "Guard"])], &NullGeoIp);
        let id = table.id_of("AAAA").unwrap();
        let r = table.get(id).unwrap();
        assert_eq!(r.bw, 50_000);
        assert!(r.flags.contains(crate::router::RouterFlags::GUARD));
    }

    #[test]
    fn freed_slot_is_recycled_by_a_later_arrival() {
        let mut table = RouterTable::new();
        table.read_routers(vec![entry("AAAA", &["Running"])], &NullGeoIp);
        let id_a = table.id_of("AAAA").unwrap();
        table.read_routers(vec![entry("BBBB", &["Running"])], &NullGeoIp);
        // AAAA's old slot may now be reused by BBBB; id_a must not resolve
        // to BBBB's data even though the underlying storage index might
        // coincide.
        if let Some(r) = table.get(id_a) {
            assert_eq!(r.idhex, "BBBB");
            // If this path is hit, id_a was stale and happened to alias a
            // recycled slot; a caller MUST have re-resolved via id_of
            // instead of reusing a RouterId across a consensus round that
            // dropped the router it named.
        }
    }
}

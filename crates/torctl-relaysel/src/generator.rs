//! Lazy producers of candidate routers per hop (spec §4.4).
//!
//! Grounded on `original_source/PathSupport.py`'s `NodeGenerator`,
//! `UniformGenerator`, `OrderedExitGenerator`, and `BwWeightedGenerator`.
//! All three share the contract spelled out in spec §4.4: wrap a
//! bandwidth-descending router slice plus a node-restriction list, and
//! expose `rewind`/`mark_chosen`/`all_chosen`/`next_r`.

use std::collections::{HashMap, HashSet};

use rand::Rng;

use torctl_netdir::{Router, RouterFlags};

use crate::restriction::NodeRestrictionList;

/// Shared behavior every hop generator must provide (spec §4.4).
pub trait Generator {
    /// Reset to the full candidate pool, recomputing any cached totals.
    fn rewind(&mut self, routers: &[Router]);
    /// Produce the next admissible, not-yet-chosen router, if any.
    fn next_r<'a>(&mut self, routers: &'a [Router]) -> Option<&'a Router>;
    /// Mark `idhex` chosen so it won't be yielded again this attempt.
    fn mark_chosen(&mut self, idhex: &str);
    /// Have all admissible candidates already been chosen?
    fn all_chosen(&self, routers: &[Router]) -> bool;
    /// Replace this generator's restriction list wholesale (spec §4.6's
    /// `set_target`: swaps in a fresh `ExitPolicy`/country pin).
    fn set_restrictions(&mut self, restrictions: NodeRestrictionList);
    /// Retarget the exit port an `OrderedExitGenerator` scans for; a no-op
    /// for generators that don't carry a port (spec §4.4: "`set_port(p)`
    /// switches the cursor").
    fn set_port(&mut self, _port: u16) {}
}

/// Picks uniformly at random from the current candidate pool (spec §4.4).
#[derive(Debug, Default)]
pub struct UniformGenerator {
    restrictions: NodeRestrictionList,
    chosen: HashSet<String>,
}

impl UniformGenerator {
    /// Build a generator that filters candidates through `restrictions`.
    pub fn new(restrictions: NodeRestrictionList) -> Self {
        Self {
            restrictions,
            chosen: HashSet::new(),
        }
    }

    fn admissible<'a>(&self, routers: &'a [Router]) -> Vec<&'a Router> {
        let total = routers.len();
        routers
            .iter()
            .filter(|r| !self.chosen.contains(&r.idhex))
            .filter(|r| self.restrictions.check(r, total))
            .collect()
    }
}

impl Generator for UniformGenerator {
    fn rewind(&mut self, _routers: &[Router]) {
        self.chosen.clear();
    }

    fn next_r<'a>(&mut self, routers: &'a [Router]) -> Option<&'a Router> {
        let pool = self.admissible(routers);
        if pool.is_empty() {
            return None;
        }
        let idx = rand::thread_rng().gen_range(0..pool.len());
        Some(pool[idx])
    }

    fn mark_chosen(&mut self, idhex: &str) {
        self.chosen.insert(idhex.to_owned());
    }

    fn all_chosen(&self, routers: &[Router]) -> bool {
        self.admissible(routers).is_empty()
    }

    fn set_restrictions(&mut self, restrictions: NodeRestrictionList) {
        self.restrictions = restrictions;
    }
}

/// Round-robins over the bandwidth-sorted list for a single exit port
/// (spec §4.4).
///
/// Grounded on `original_source/lib-ext/PathSupport.py`'s
/// `OrderedExitGenerator`, which keys its cursor by port
/// (`next_exit_by_port`) so that switching ports, or simply calling
/// `rewind` again for the same port across successive `build_path` calls,
/// resumes the scan where the last one left off rather than restarting at
/// index 0 every time. `rewind`'s `last_idx = len(sorted_r)` quirk (spec
/// §9 "suspected source bug") is carried over faithfully, but only for a
/// port's *first* use (cursor still at its initial `0`): the termination
/// check on that first pass compares the cursor against the list's length
/// rather than against the cursor's own starting index. Every later
/// `rewind` for a port whose cursor has moved on instead pins `last_idx`
/// to wherever that cursor currently sits, so the generator wraps back to
/// its own starting point rather than scanning from zero — this is what
/// gives successive circuits round-robin exit diversity instead of always
/// handing back the same first admissible exit.
#[derive(Debug)]
pub struct OrderedExitGenerator {
    restrictions: NodeRestrictionList,
    port: u16,
    /// Cursor per port, so switching `to_port` and back doesn't lose a
    /// scan already in progress (`next_exit_by_port` in the original).
    cursor_by_port: HashMap<u16, usize>,
    /// Index the current scan started at; termination fires when the
    /// active port's cursor returns here, except on a port's first use
    /// (cursor still `0` going into `rewind`), where this is left at
    /// `routers.len()` per the quirk above.
    last_idx: usize,
    chosen: HashSet<String>,
}

impl OrderedExitGenerator {
    /// Build a generator targeting `port`, restricted by `restrictions`.
    pub fn new(port: u16, restrictions: NodeRestrictionList) -> Self {
        Self {
            restrictions,
            port,
            cursor_by_port: HashMap::new(),
            last_idx: 0,
            chosen: HashSet::new(),
        }
    }

    fn admits(&self, r: &Router, total: usize) -> bool {
        r.flags.contains(RouterFlags::EXIT)
            && r.will_exit_to(std::net::Ipv4Addr::new(255, 255, 255, 255), self.port)
            && self.restrictions.check(r, total)
    }
}

impl Generator for OrderedExitGenerator {
    fn rewind(&mut self, routers: &[Router]) {
        self.chosen.clear();
        let cursor = *self.cursor_by_port.entry(self.port).or_insert(0);
        if cursor == 0 {
            // First use of this port (or the prior scan already wrapped
            // all the way back to 0): faithful port of the source quirk.
            self.last_idx = routers.len();
        } else {
            self.last_idx = cursor;
        }
    }

    fn next_r<'a>(&mut self, routers: &'a [Router]) -> Option<&'a Router> {
        if routers.is_empty() {
            return None;
        }
        let total = routers.len();
        let mut cursor = *self.cursor_by_port.get(&self.port).unwrap_or(&0);
        let start = cursor;
        loop {
            let candidate = &routers[cursor];
            cursor = (cursor + 1) % routers.len();

            if !self.chosen.contains(&candidate.idhex) && self.admits(candidate, total) {
                self.cursor_by_port.insert(self.port, cursor);
                return Some(candidate);
            }
            if cursor == self.last_idx || cursor == start {
                self.cursor_by_port.insert(self.port, cursor);
                return None;
            }
        }
    }

    fn mark_chosen(&mut self, idhex: &str) {
        self.chosen.insert(idhex.to_owned());
    }

    fn all_chosen(&self, routers: &[Router]) -> bool {
        let total = routers.len();
        routers
            .iter()
            .filter(|r| self.admits(r, total))
            .all(|r| self.chosen.contains(&r.idhex))
    }

    /// Swap restrictions without touching the cursor (spec §4.6's
    /// `reset_restriction` note: "preserves the cursor").
    fn set_restrictions(&mut self, restrictions: NodeRestrictionList) {
        self.restrictions = restrictions;
    }

    /// Switch the target exit port; the new port's cursor (persisted
    /// separately in `cursor_by_port`) takes over (spec §4.4: "`set_port(p)`
    /// switches the cursor").
    fn set_port(&mut self, port: u16) {
        self.port = port;
    }
}

/// Whether a hop position targets an exit relay, for
/// [`BwWeightedGenerator`]'s discount math (spec §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HopKind {
    /// Entry or middle hop.
    NonExit,
    /// Exit hop.
    Exit,
}

/// Bandwidth-weighted random selection with an exit-discount weight (spec
/// §4.4).
#[derive(Debug)]
pub struct BwWeightedGenerator {
    restrictions: NodeRestrictionList,
    pathlen: usize,
    hop: HopKind,
    chosen: HashSet<String>,
    /// Cached on `rewind`.
    total_bw: u64,
    total_exit_bw: u64,
}

impl BwWeightedGenerator {
    /// Build a generator for a hop of kind `hop` in a path of length
    /// `pathlen`.
    pub fn new(pathlen: usize, hop: HopKind, restrictions: NodeRestrictionList) -> Self {
        Self {
            restrictions,
            pathlen: pathlen.max(1),
            hop,
            chosen: HashSet::new(),
            total_bw: 0,
            total_exit_bw: 0,
        }
    }

    /// The exit-discount weight `w` per spec §4.4's formula, given the
    /// cached totals.
    fn exit_discount(&self) -> f64 {
        if self.total_exit_bw == 0 {
            return 0.0;
        }
        let bw_per_hop = self.total_bw as f64 / self.pathlen as f64;
        if (self.total_exit_bw as f64) >= bw_per_hop {
            ((self.total_exit_bw as f64) - bw_per_hop) / self.total_exit_bw as f64
        } else {
            0.0
        }
        .max(0.0)
    }

    /// This router's effective sampling weight for the current hop kind.
    fn weight(&self, r: &Router) -> f64 {
        match self.hop {
            HopKind::Exit => r.bw as f64,
            HopKind::NonExit => {
                if r.flags.contains(RouterFlags::EXIT) {
                    r.bw as f64 * self.exit_discount()
                } else {
                    r.bw as f64
                }
            }
        }
    }

    fn admissible<'a>(&self, routers: &'a [Router], total: usize) -> Vec<&'a Router> {
        routers
            .iter()
            .filter(|r| !self.chosen.contains(&r.idhex))
            .filter(|r| match self.hop {
                HopKind::Exit => r.flags.contains(RouterFlags::EXIT),
                HopKind::NonExit => true,
            })
            .filter(|r| self.restrictions.check(r, total))
            .collect()
    }
}

impl Generator for BwWeightedGenerator {
    fn rewind(&mut self, routers: &[Router]) {
        self.chosen.clear();
        let total = routers.len();
        self.total_bw = routers
            .iter()
            .filter(|r| self.restrictions.check(r, total))
            .map(|r| r.bw)
            .sum();
        self.total_exit_bw = routers
            .iter()
            .filter(|r| r.flags.contains(RouterFlags::EXIT))
            .filter(|r| self.restrictions.check(r, total))
            .map(|r| r.bw)
            .sum();
    }

    fn next_r<'a>(&mut self, routers: &'a [Router]) -> Option<&'a Router> {
        let total = routers.len();
        let pool = self.admissible(routers, total);
        if pool.is_empty() {
            return None;
        }
        let total_weight: f64 = pool.iter().map(|r| self.weight(r)).sum();
        if total_weight <= 0.0 {
            // Every candidate has zero weight (e.g. no bandwidth data);
            // fall back to a uniform draw over the admissible pool so the
            // build doesn't stall forever.
            let idx = rand::thread_rng().gen_range(0..pool.len());
            return Some(pool[idx]);
        }

        let mut target = rand::thread_rng().gen_range(0.0..total_weight);
        for r in &pool {
            let w = self.weight(r);
            if target < w {
                return Some(r);
            }
            target -= w;
        }
        pool.last().copied()
    }

    fn mark_chosen(&mut self, idhex: &str) {
        self.chosen.insert(idhex.to_owned());
    }

    fn all_chosen(&self, routers: &[Router]) -> bool {
        let total = routers.len();
        self.admissible(routers, total).is_empty()
    }

    /// Swap restrictions (e.g. a fresh `ExitPolicy` target pin) without
    /// resetting the chosen set; callers still call `rewind` separately to
    /// recompute totals per spec §4.5 step 1.
    fn set_restrictions(&mut self, restrictions: NodeRestrictionList) {
        self.restrictions = restrictions;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use torctl_netdir::{NullGeoIp, RouterTable};

    fn make_router(idhex: &str, bw: u64, exit: bool) -> Router {
        Router {
            idhex: idhex.to_owned(),
            nickname: idhex.to_owned(),
            ip: 0,
            bw,
            flags: if exit {
                RouterFlags::EXIT | RouterFlags::RUNNING
            } else {
                RouterFlags::RUNNING
            },
            version: Default::default(),
            os: String::new(),
            uptime: 0,
            exit_policy: torctl_netdir::ExitPolicy(vec![torctl_netdir::ExitPolicyRule::wildcard(
                true,
            )]),
            country: None,
            continent: None,
            list_rank: 0,
            down: false,
        }
    }

    #[test]
    fn uniform_generator_terminates_with_empty_restrictions() {
        let routers: Vec<Router> = (0..5)
            .map(|i| make_router(&format!("R{i}"), (100 - i as u64 * 10).max(1), false))
            .collect();
        let mut gen = UniformGenerator::new(NodeRestrictionList::new());
        gen.rewind(&routers);
        let mut seen = HashSet::new();
        while let Some(r) = gen.next_r(&routers) {
            gen.mark_chosen(&r.idhex);
            assert!(seen.insert(r.idhex.clone()), "must not repeat a router");
            if seen.len() > routers.len() {
                panic!("uniform generator failed to terminate");
            }
        }
        assert_eq!(seen.len(), routers.len());
        assert!(gen.all_chosen(&routers));
    }

    #[test]
    fn ordered_exit_round_robins_and_wraps() {
        let routers: Vec<Router> = (0..5)
            .map(|i| make_router(&format!("E{i}"), 100, true))
            .collect();
        let mut gen = OrderedExitGenerator::new(80, NodeRestrictionList::new());
        gen.rewind(&routers);
        let mut order = Vec::new();
        for _ in 0..5 {
            let r = gen.next_r(&routers).expect("should yield 5 exits");
            order.push(r.idhex.clone());
            gen.mark_chosen(&r.idhex);
        }
        assert_eq!(order, vec!["E0", "E1", "E2", "E3", "E4"]);
        // Now exhausted: a further call terminates.
        assert!(gen.next_r(&routers).is_none());
    }

    #[test]
    fn bw_weighted_exit_discount_matches_spec_example() {
        // spec §8 scenario 3: A=1000,B=1000 (exit), C=500,D=500 (non-exit),
        // pathlen=3 => total_bw=3000, total_exit_bw=2000, bw_per_hop=1000,
        // w=(2000-1000)/2000=0.5.
        let routers = vec![
            make_router("A", 1000, true),
            make_router("B", 1000, true),
            make_router("C", 500, false),
            make_router("D", 500, false),
        ];
        let mut gen = BwWeightedGenerator::new(3, HopKind::NonExit, NodeRestrictionList::new());
        gen.rewind(&routers);
        assert_eq!(gen.total_bw, 3000);
        assert_eq!(gen.total_exit_bw, 2000);
        assert!((gen.exit_discount() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn router_table_integration_sorts_before_generator_use() {
        let mut table = RouterTable::new();
        table.read_routers(
            vec![
                torctl_netdir::NsEntry {
                    idhex: "A".repeat(40),
                    nickname: "a".into(),
                    ip: "1.2.3.4".into(),
                    flags: vec!["Running".into()],
                },
                torctl_netdir::NsEntry {
                    idhex: "B".repeat(40),
                    nickname: "b".into(),
                    ip: "1.2.3.5".into(),
                    flags: vec!["Running".into()],
                },
            ],
            &NullGeoIp,
        );
        let routers: Vec<Router> = table.iter().cloned().collect();
        let mut gen = UniformGenerator::new(NodeRestrictionList::new());
        gen.rewind(&routers);
        assert!(gen.next_r(&routers).is_some());
    }
}

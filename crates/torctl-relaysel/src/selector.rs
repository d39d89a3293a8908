//! Compose three hop generators and a path-restriction list into
//! `build_path(len)` (spec §4.5).
//!
//! Grounded on `original_source/PathSupport.py`'s `PathBuilder.build_path`.
//! Per spec §9's documented "suspected source bug" — carried over
//! faithfully, not fixed — the *first* time any generator's iterator is
//! exhausted mid-draw, the retry path mistakenly starts drawing every hop
//! (entry, middle, *and* exit) from the entry generator instead of each
//! position's own generator. [`PathSelector::build_path`] reproduces this:
//! once exhaustion has been observed, `entry_gen` alone supplies every
//! subsequent draw for the rest of that call.

use torctl_error::Error;
use torctl_netdir::Router;

use crate::generator::Generator;
use crate::path_restriction::PathRestrictionList;
use crate::restriction::NodeRestrictionList;

/// How many times `build_path` will rewind all generators and retry before
/// giving up with [`Error::NoRouters`] (spec §4.5 step 5: "a bounded
/// number of rewinds").
const MAX_REWINDS: u32 = 8;

/// Composes an entry/middle/exit generator triple with a path-restriction
/// list into a single `build_path` operation (spec §4.5).
pub struct PathSelector {
    entry_gen: Box<dyn Generator + Send>,
    mid_gen: Box<dyn Generator + Send>,
    exit_gen: Box<dyn Generator + Send>,
    path_restrictions: PathRestrictionList,
}

impl PathSelector {
    /// Build a selector from its three generators and a path-restriction
    /// list (spec §4.5: "Compose three generators + a path-restriction
    /// list").
    pub fn new(
        entry_gen: Box<dyn Generator + Send>,
        mid_gen: Box<dyn Generator + Send>,
        exit_gen: Box<dyn Generator + Send>,
        path_restrictions: PathRestrictionList,
    ) -> Self {
        Self {
            entry_gen,
            mid_gen,
            exit_gen,
            path_restrictions,
        }
    }

    /// Replace the exit generator's restriction list wholesale (spec §4.6
    /// `set_target`: a fresh `ExitPolicy`, and possibly a country pin).
    pub fn set_exit_restrictions(&mut self, restrictions: NodeRestrictionList) {
        self.exit_gen.set_restrictions(restrictions);
    }

    /// Retarget the `OrderedExitGenerator`'s scan port, if the exit
    /// generator is one (spec §4.6 `set_target`: "updates the ordered-exit
    /// cursor if present").
    pub fn set_exit_port(&mut self, port: u16) {
        self.exit_gen.set_port(port);
    }

    /// Build one hop sequence of `pathlen` routers satisfying every
    /// restriction, or fail with [`Error::NoRouters`].
    pub fn build_path(&mut self, pathlen: usize, routers: &[Router]) -> Result<Vec<Router>, Error> {
        self.entry_gen.rewind(routers);
        self.mid_gen.rewind(routers);
        self.exit_gen.rewind(routers);

        // Set once the documented bug has kicked in for this call.
        let mut entry_gen_supplies_all = false;
        let mut rewinds = 0u32;

        loop {
            match self.draw_once(pathlen, routers, entry_gen_supplies_all) {
                Some(idhexes) => {
                    let resolved: Option<Vec<&Router>> = idhexes
                        .iter()
                        .map(|id| routers.iter().find(|r| &r.idhex == id))
                        .collect();
                    let Some(resolved) = resolved else {
                        // A drawn router vanished from the table mid-build;
                        // treat like a failed path and draw again.
                        continue;
                    };

                    if self.path_restrictions.check(&resolved) {
                        // Always mark chosen by the position's own
                        // generator, regardless of `entry_gen_supplies_all`:
                        // the documented bug (spec §9) only scopes which
                        // generator *supplies* candidates during a retry,
                        // not which generator's "already used" bookkeeping
                        // gets updated on success (original `build_path`
                        // always calls `entry_gen.mark_chosen`/
                        // `mid_gen.mark_chosen`/`exit_gen.mark_chosen` on
                        // every successful build).
                        self.mark_chosen_by_role(pathlen, &idhexes);
                        return Ok(resolved.into_iter().cloned().collect());
                    }
                    // Path-restriction rejection: discard and draw again
                    // without rewinding (spec §4.5 step 4).
                }
                None => {
                    rewinds += 1;
                    if rewinds > MAX_REWINDS {
                        return Err(Error::NoRouters);
                    }
                    tracing::warn!(rewinds, "path generator exhausted, rewinding");
                    self.entry_gen.rewind(routers);
                    self.mid_gen.rewind(routers);
                    self.exit_gen.rewind(routers);
                    // Spec §9: the faithful bug. From the first exhaustion
                    // onward, every position draws from entry_gen.
                    entry_gen_supplies_all = true;
                }
            }
        }
    }

    /// Mark each drawn router chosen in the generator for its position
    /// (entry/mid/exit), called on every successful build regardless of
    /// whether `entry_gen_supplies_all` was set during the draw.
    fn mark_chosen_by_role(&mut self, pathlen: usize, idhexes: &[String]) {
        if pathlen == 1 {
            self.exit_gen.mark_chosen(&idhexes[0]);
            return;
        }
        self.entry_gen.mark_chosen(&idhexes[0]);
        for mid in &idhexes[1..idhexes.len() - 1] {
            self.mid_gen.mark_chosen(mid);
        }
        self.exit_gen.mark_chosen(idhexes.last().expect("pathlen >= 1"));
    }

    /// Draw one full candidate hop sequence, or `None` if any position's
    /// generator is exhausted.
    fn draw_once(&mut self, pathlen: usize, routers: &[Router], entry_gen_supplies_all: bool) -> Option<Vec<String>> {
        if pathlen == 1 {
            let r = self.exit_gen.next_r(routers)?;
            return Some(vec![r.idhex.clone()]);
        }

        let mut path = Vec::with_capacity(pathlen);

        let entry = self.entry_gen.next_r(routers)?;
        path.push(entry.idhex.clone());

        for _ in 0..pathlen.saturating_sub(2) {
            let mid = if entry_gen_supplies_all {
                self.entry_gen.next_r(routers)?
            } else {
                self.mid_gen.next_r(routers)?
            };
            path.push(mid.idhex.clone());
        }

        let exit = if entry_gen_supplies_all {
            self.entry_gen.next_r(routers)?
        } else {
            self.exit_gen.next_r(routers)?
        };
        path.push(exit.idhex.clone());

        Some(path)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::generator::UniformGenerator;
    use crate::restriction::{NodeRestriction, NodeRestrictionList};
    use torctl_netdir::{NullGeoIp, RouterFlags, RouterTable};

    fn table_with(bws: &[u64]) -> RouterTable {
        let mut table = RouterTable::new();
        let entries = bws
            .iter()
            .enumerate()
            .map(|(i, _)| torctl_netdir::NsEntry {
                idhex: format!("{i:040}"),
                nickname: format!("r{i}"),
                ip: format!("10.0.{i}.1"),
                flags: vec!["Running".into(), "Exit".into(), "Valid".into()],
            })
            .collect();
        table.read_routers(entries, &NullGeoIp);
        for (i, bw) in bws.iter().enumerate() {
            let idhex = format!("{i:040}");
            let mut desc = torctl_netdir::Descriptor::default();
            desc.bw = Some(*bw);
            desc.exit_policy = torctl_netdir::ExitPolicy(vec![torctl_netdir::ExitPolicyRule::wildcard(true)]);
            table.apply_descriptor(&idhex, desc);
        }
        table
    }

    #[test]
    fn uniform_path_build_of_length_three_yields_distinct_routers() {
        let table = table_with(&[100, 80, 60, 40, 20]);
        let routers: Vec<Router> = table.iter().cloned().collect();

        let mut selector = PathSelector::new(
            Box::new(UniformGenerator::new(NodeRestrictionList::new())),
            Box::new(UniformGenerator::new(NodeRestrictionList::new())),
            Box::new(UniformGenerator::new(NodeRestrictionList::new())),
            PathRestrictionList::new(),
        );

        let path = selector.build_path(3, &routers).unwrap();
        assert_eq!(path.len(), 3);
        let mut ids: Vec<&str> = path.iter().map(|r| r.idhex.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 3, "all three hops must be distinct");
    }

    #[test]
    fn exhausted_generators_surface_no_routers() {
        let table = table_with(&[100]);
        let routers: Vec<Router> = table.iter().cloned().collect();

        let mut impossible = NodeRestrictionList::new();
        impossible.add(NodeRestriction::MinBw(u64::MAX));

        let mut selector = PathSelector::new(
            Box::new(UniformGenerator::new(impossible.clone())),
            Box::new(UniformGenerator::new(impossible.clone())),
            Box::new(UniformGenerator::new(impossible)),
            PathRestrictionList::new(),
        );

        let err = selector.build_path(3, &routers).unwrap_err();
        assert!(matches!(err, Error::NoRouters));
    }

    #[test]
    fn single_hop_path_draws_only_from_exit_generator() {
        let table = table_with(&[100, 50]);
        let routers: Vec<Router> = table.iter().cloned().collect();

        let mut selector = PathSelector::new(
            Box::new(UniformGenerator::new(NodeRestrictionList::new())),
            Box::new(UniformGenerator::new(NodeRestrictionList::new())),
            Box::new(UniformGenerator::new(NodeRestrictionList::new())),
            PathRestrictionList::new(),
        );

        let path = selector.build_path(1, &routers).unwrap();
        assert_eq!(path.len(), 1);
        let _ = RouterFlags::EXIT;
    }
}

//! Translates [`SelectionConfig`] into concrete restriction lists and
//! generators, and reconciles them against the live router table (spec
//! §4.6).
//!
//! Grounded on `original_source/PathSupport.py`'s `SelectionManager`: the
//! fixed rule set in `reconfigure` and the `ExitPolicy` replacement in
//! `set_target` are carried over verbatim; only the representation (typed
//! restriction lists instead of Python lists of `NodeRestriction` instances)
//! changes.

use std::net::Ipv4Addr;
use std::sync::Arc;

use torctl_error::Error;
use torctl_netdir::{GeoIp, Router, RouterFlags};
use torctl_relaysel::{
    BwWeightedGenerator, Generator, HopKind, NodeRestriction, NodeRestrictionList, OrderedExitGenerator,
    PathRestriction, PathRestrictionList, PathSelector, UniformGenerator,
};

use crate::config::{ExitPin, SelectionConfig, UniqueCountries};

/// Owns the current restriction lists, generators, and path selector derived
/// from a [`SelectionConfig`] (spec §4.6).
pub struct SelectionManager {
    config: SelectionConfig,
    geoip: Arc<dyn GeoIp>,
    entry_restrictions: NodeRestrictionList,
    middle_restrictions: NodeRestrictionList,
    /// The exit restriction list as built by `reconfigure`, before any
    /// per-target `ExitPolicy`/country pin from `set_target` is layered on.
    exit_restrictions_base: NodeRestrictionList,
    path_restrictions: PathRestrictionList,
    selector: Option<PathSelector>,
    target: Option<(Ipv4Addr, u16)>,
}

impl SelectionManager {
    /// Build a manager with no selector yet; call [`SelectionManager::reconfigure`]
    /// with the current router list before the first [`SelectionManager::build_path`].
    pub fn new(config: SelectionConfig, geoip: Arc<dyn GeoIp>) -> Self {
        Self {
            config,
            geoip,
            entry_restrictions: NodeRestrictionList::new(),
            middle_restrictions: NodeRestrictionList::new(),
            exit_restrictions_base: NodeRestrictionList::new(),
            path_restrictions: PathRestrictionList::new(),
            selector: None,
            target: None,
        }
    }

    /// The path length every built circuit should have.
    pub fn pathlen(&self) -> usize {
        self.config.pathlen
    }

    /// The port to pretend a pure name-resolution stream (no real
    /// destination port) is targeting, for exit-policy evaluation (spec
    /// §4.7: `NEWRESOLVE` streams carry no port of their own).
    pub fn resolve_port(&self) -> u16 {
        self.config.resolve_port
    }

    /// How many circuits the pool should try to keep warm.
    pub fn num_circuits(&self) -> usize {
        self.config.num_circuits
    }

    /// Replace the current config; takes effect on the next `reconfigure`.
    pub fn set_config(&mut self, config: SelectionConfig) {
        self.config = config;
    }

    /// Rebuild the entry/middle/exit restriction lists, the path-restriction
    /// list, and the three generators from the current config and a freshly
    /// bandwidth-sorted router slice (spec §4.6's fixed rules).
    pub fn reconfigure(&mut self, sorted_routers: &[Router]) {
        let _ = sorted_routers; // generators pull candidates lazily from the table the caller passes to build_path.

        self.entry_restrictions = self.build_entry_restrictions();
        self.middle_restrictions = self.build_middle_restrictions();
        self.exit_restrictions_base = self.build_exit_restrictions();
        self.path_restrictions = self.build_path_restrictions();

        let (entry_gen, mid_gen, exit_gen): (
            Box<dyn Generator + Send>,
            Box<dyn Generator + Send>,
            Box<dyn Generator + Send>,
        ) = if self.config.order_exits {
            (
                Box::new(UniformGenerator::new(self.entry_restrictions.clone())),
                Box::new(UniformGenerator::new(self.middle_restrictions.clone())),
                Box::new(OrderedExitGenerator::new(
                    self.config.resolve_port,
                    self.exit_restrictions_base.clone(),
                )),
            )
        } else if self.config.uniform {
            self.exit_restrictions_base.add(wildcard_exit_policy_seed());
            (
                Box::new(UniformGenerator::new(self.entry_restrictions.clone())),
                Box::new(UniformGenerator::new(self.middle_restrictions.clone())),
                Box::new(UniformGenerator::new(self.exit_restrictions_base.clone())),
            )
        } else {
            // Bandwidth-weighted mode: ConserveExits interacts badly with
            // bw-weighted sampling, so it's stripped from entry/middle here
            // (spec §4.6).
            self.exit_restrictions_base.add(wildcard_exit_policy_seed());
            let mut entry_r = self.entry_restrictions.clone();
            entry_r.remove_by_kind(torctl_relaysel::RestrictionKind::ConserveExits);
            let mut mid_r = self.middle_restrictions.clone();
            mid_r.remove_by_kind(torctl_relaysel::RestrictionKind::ConserveExits);
            (
                Box::new(BwWeightedGenerator::new(self.config.pathlen, HopKind::NonExit, entry_r)),
                Box::new(BwWeightedGenerator::new(self.config.pathlen, HopKind::NonExit, mid_r)),
                Box::new(BwWeightedGenerator::new(
                    self.config.pathlen,
                    HopKind::Exit,
                    self.exit_restrictions_base.clone(),
                )),
            )
        };

        self.selector = Some(PathSelector::new(
            entry_gen,
            mid_gen,
            exit_gen,
            self.path_restrictions.clone(),
        ));

        if let Some((ip, port)) = self.target {
            self.apply_target(ip, port);
        }
    }

    /// Replace the exit restriction's `ExitPolicy` (and, under `echelon`,
    /// its country pin) to target `(ip, port)`; retargets the ordered-exit
    /// cursor if that generator is in use (spec §4.6).
    pub fn set_target(&mut self, ip: Ipv4Addr, port: u16) {
        self.target = Some((ip, port));
        self.apply_target(ip, port);
    }

    fn apply_target(&mut self, ip: Ipv4Addr, port: u16) {
        let mut exit = self.exit_restrictions_base.clone();
        exit.add(NodeRestriction::ExitPolicy { ip, port });

        if let Some(geoip) = &self.config.geoip {
            if geoip.echelon {
                let pin = self
                    .geoip
                    .country_of(u32::from(ip))
                    .or_else(|| geoip.exit_country.clone());
                if let Some(country) = pin {
                    exit.add(NodeRestriction::Country(country));
                }
            }
        }

        if let Some(selector) = &mut self.selector {
            selector.set_exit_restrictions(exit);
            if self.config.order_exits {
                selector.set_exit_port(port);
            }
        }
    }

    /// Draw one circuit's worth of hops, or fail with
    /// [`torctl_error::Error::NoRouters`] if no candidate sequence satisfies
    /// the configured restrictions.
    pub fn build_path(&mut self, routers: &[Router]) -> Result<Vec<Router>, Error> {
        let pathlen = self.config.pathlen;
        self.selector
            .as_mut()
            .ok_or_else(|| Error::Internal("build_path called before reconfigure".into()))?
            .build_path(pathlen, routers)
    }

    fn build_entry_restrictions(&self) -> NodeRestrictionList {
        let mut list = NodeRestrictionList::new();
        if !self.config.use_all_exits {
            list.add(NodeRestriction::Percentile {
                pct_skip: self.config.percent_skip,
                pct_fast: self.config.percent_fast,
            });
        }
        list.add(NodeRestriction::ConserveExits);
        let mandatory = if self.config.use_guards {
            RouterFlags::GUARD | RouterFlags::VALID | RouterFlags::RUNNING
        } else {
            RouterFlags::VALID | RouterFlags::RUNNING
        };
        list.add(NodeRestriction::Flags {
            mandatory,
            forbidden: RouterFlags::empty(),
        });
        if let Some(min_bw) = self.config.min_bw {
            list.add(NodeRestriction::MinBw(min_bw));
        }
        self.add_geoip_node_restrictions(&mut list, |g| g.entry_country.clone());
        list
    }

    fn build_middle_restrictions(&self) -> NodeRestrictionList {
        let mut list = NodeRestrictionList::new();
        list.add(NodeRestriction::Percentile {
            pct_skip: self.config.percent_skip,
            pct_fast: self.config.percent_fast,
        });
        list.add(NodeRestriction::ConserveExits);
        list.add(NodeRestriction::Flags {
            mandatory: RouterFlags::RUNNING,
            forbidden: RouterFlags::empty(),
        });
        if let Some(min_bw) = self.config.min_bw {
            list.add(NodeRestriction::MinBw(min_bw));
        }
        self.add_geoip_node_restrictions(&mut list, |g| g.middle_country.clone());
        list
    }

    fn build_exit_restrictions(&self) -> NodeRestrictionList {
        let mut list = NodeRestrictionList::new();
        list.add(NodeRestriction::Flags {
            mandatory: RouterFlags::VALID | RouterFlags::RUNNING,
            forbidden: RouterFlags::BAD_EXIT,
        });
        if !self.config.use_all_exits {
            list.add(NodeRestriction::Percentile {
                pct_skip: self.config.percent_skip,
                pct_fast: self.config.percent_fast,
            });
        }
        if let Some(min_bw) = self.config.min_bw {
            list.add(NodeRestriction::MinBw(min_bw));
        }
        match &self.config.exit_pin {
            Some(ExitPin::Nickname(nick)) => list.add(NodeRestriction::Nick(nick.clone())),
            Some(ExitPin::IdHex(idhex)) => {
                list.add(NodeRestriction::IdHex(torctl_netdir::normalize_idhex(idhex)))
            }
            None => {}
        }
        self.add_geoip_node_restrictions(&mut list, |g| g.exit_country.clone());
        list
    }

    /// Add the geoip-driven per-hop predicates common to all three
    /// restriction lists: `CountryCodeSet`, a per-position `Country` pin,
    /// and `ExcludeCountries` (spec §4.6).
    fn add_geoip_node_restrictions(
        &self,
        list: &mut NodeRestrictionList,
        country_for: impl Fn(&crate::config::GeoIpConfig) -> Option<String>,
    ) {
        let Some(geoip) = &self.config.geoip else {
            return;
        };
        list.add(NodeRestriction::CountryCodeSet);
        if let Some(country) = country_for(geoip) {
            list.add(NodeRestriction::Country(country));
        }
        if !geoip.excludes.is_empty() {
            list.add(NodeRestriction::ExcludeCountries(
                geoip.excludes.iter().cloned().collect(),
            ));
        }
    }

    fn build_path_restrictions(&self) -> PathRestrictionList {
        let mut list = PathRestrictionList::new();
        list.add(PathRestriction::Unique);
        if !self.config.use_all_exits {
            list.add(PathRestriction::Subnet16);
        }

        let Some(geoip) = &self.config.geoip else {
            return list;
        };

        match geoip.unique_countries {
            UniqueCountries::Enabled => list.add(PathRestriction::UniqueCountry),
            UniqueCountries::Disabled | UniqueCountries::Unset => {}
        }
        match geoip.continent_crossings {
            None => list.add(PathRestriction::UniqueContinent),
            Some(n) => list.add(PathRestriction::ContinentMax(n)),
        }
        if let Some(n) = geoip.ocean_crossings {
            list.add(PathRestriction::OceanPhobic(n));
        }
        list
    }
}

/// The placeholder `ExitPolicy` `set_target` replaces once a real stream
/// needs a path (spec §4.6: "Uniform (entry/mid/exit) with an
/// `ExitPolicy(255.255.255.255, 80)` seed").
fn wildcard_exit_policy_seed() -> NodeRestriction {
    NodeRestriction::ExitPolicy {
        ip: Ipv4Addr::new(255, 255, 255, 255),
        port: 80,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use torctl_netdir::{NsEntry, NullGeoIp, RouterTable};

    fn table_with(n: usize) -> RouterTable {
        let mut table = RouterTable::new();
        let entries = (0..n)
            .map(|i| NsEntry {
                idhex: format!("{i:040}"),
                nickname: format!("r{i}"),
                ip: format!("10.{}.0.1", i % 250),
                flags: vec!["Running".into(), "Valid".into(), "Exit".into(), "Guard".into()],
            })
            .collect();
        table.read_routers(entries, &NullGeoIp);
        for i in 0..n {
            let idhex = format!("{i:040}");
            let mut desc = torctl_netdir::Descriptor::default();
            desc.bw = Some(1000 - i as u64);
            desc.exit_policy =
                torctl_netdir::ExitPolicy(vec![torctl_netdir::ExitPolicyRule::wildcard(true)]);
            table.apply_descriptor(&idhex, desc);
        }
        table
    }

    #[test]
    fn reconfigure_then_build_path_yields_pathlen_hops() {
        let table = table_with(10);
        let routers: Vec<Router> = table.iter().cloned().collect();
        let mut mgr = SelectionManager::new(SelectionConfig::default(), Arc::new(NullGeoIp));
        mgr.reconfigure(&routers);
        let path = mgr.build_path(&routers).unwrap();
        assert_eq!(path.len(), 3);
    }

    #[test]
    fn set_target_narrows_exit_to_matching_policy() {
        let table = table_with(6);
        let routers: Vec<Router> = table.iter().cloned().collect();
        let mut mgr = SelectionManager::new(SelectionConfig::default(), Arc::new(NullGeoIp));
        mgr.reconfigure(&routers);
        mgr.set_target(Ipv4Addr::new(9, 9, 9, 9), 443);
        let path = mgr.build_path(&routers).unwrap();
        assert_eq!(path.len(), 3);
    }

    #[test]
    fn bw_weighted_mode_strips_conserve_exits_from_entry_and_middle() {
        let table = table_with(8);
        let routers: Vec<Router> = table.iter().cloned().collect();
        let cfg = SelectionConfig::builder().uniform(false).order_exits(false).build().unwrap();
        let mut mgr = SelectionManager::new(cfg, Arc::new(NullGeoIp));
        mgr.reconfigure(&routers);
        assert!(!mgr
            .entry_restrictions
            .iter()
            .any(|r| matches!(r, NodeRestriction::ConserveExits)));
        assert!(!mgr
            .middle_restrictions
            .iter()
            .any(|r| matches!(r, NodeRestriction::ConserveExits)));
    }

    #[test]
    fn order_exits_mode_uses_ordered_exit_generator() {
        let table = table_with(5);
        let routers: Vec<Router> = table.iter().cloned().collect();
        let cfg = SelectionConfig::builder().order_exits(true).build().unwrap();
        let mut mgr = SelectionManager::new(cfg, Arc::new(NullGeoIp));
        mgr.reconfigure(&routers);
        // Two successive builds over a stable table must round-robin the
        // exit hop rather than hand back the same first admissible exit
        // every time (the ordered-exit cursor has to survive across
        // build_path calls, not just within one).
        let a = mgr.build_path(&routers).unwrap();
        let b = mgr.build_path(&routers).unwrap();
        assert_eq!(a.len(), 3);
        assert_eq!(b.len(), 3);
        assert_ne!(
            a.last().unwrap().idhex,
            b.last().unwrap().idhex,
            "ordered-exit cursor should advance between builds"
        );
    }
}

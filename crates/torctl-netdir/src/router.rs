//! The `Router` record, its version/flags, and exit-policy evaluation.
//!
//! Grounded on `original_source/TorCtl.py`'s `Router`, `RouterVersion`, and
//! `ExitPolicyLine` classes: the fields, the first-match-wins exit-policy
//! semantics, and the `a*2^24 + b*2^16 + c*2^8 + d` version encoding are
//! all carried over unchanged (spec §3, §6).

use std::cmp::Ordering;
use std::net::Ipv4Addr;

use bitflags::bitflags;

use torctl_error::Error;

bitflags! {
    /// The flag set a consensus assigns a router (spec §3).
    ///
    /// Unrecognized flag strings seen on the wire are simply not
    /// represented here — the predicates in `torctl-relaysel` only ever
    /// test for flags in this set, matching `FlagsRestriction`'s mandatory/
    /// forbidden lists in spec §4.3.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RouterFlags: u32 {
        const RUNNING   = 1 << 0;
        const VALID     = 1 << 1;
        const EXIT      = 1 << 2;
        const GUARD     = 1 << 3;
        const BAD_EXIT  = 1 << 4;
        const STABLE    = 1 << 5;
        const FAST      = 1 << 6;
        const AUTHORITY = 1 << 7;
        const NAMED     = 1 << 8;
        const UNNAMED   = 1 << 9;
        const V2DIR     = 1 << 10;
        const HSDIR     = 1 << 11;
    }
}

impl RouterFlags {
    /// Parse the `s` line's space-separated flag words (as seen in an NS
    /// reply) into a [`RouterFlags`] set.
    pub fn from_words<I: IntoIterator<Item = S>, S: AsRef<str>>(words: I) -> RouterFlags {
        let mut flags = RouterFlags::empty();
        for w in words {
            flags |= match w.as_ref() {
                "Running" => RouterFlags::RUNNING,
                "Valid" => RouterFlags::VALID,
                "Exit" => RouterFlags::EXIT,
                "Guard" => RouterFlags::GUARD,
                "BadExit" => RouterFlags::BAD_EXIT,
                "Stable" => RouterFlags::STABLE,
                "Fast" => RouterFlags::FAST,
                "Authority" => RouterFlags::AUTHORITY,
                "Named" => RouterFlags::NAMED,
                "Unnamed" => RouterFlags::UNNAMED,
                "V2Dir" => RouterFlags::V2DIR,
                "HSDir" => RouterFlags::HSDIR,
                _ => RouterFlags::empty(),
            };
        }
        flags
    }
}

/// A router's self-reported Tor version, `a.b.c.d`, ordered as an integer
/// per spec §6: `a*2^24 + b*2^16 + c*2^8 + d`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct RouterVersion {
    encoded: u32,
}

impl RouterVersion {
    /// The zero version, used when a descriptor carries no `platform` line.
    pub const UNKNOWN: RouterVersion = RouterVersion { encoded: 0 };

    /// Parse a leading `a.b.c.d` out of a platform version string.
    pub fn parse(s: &str) -> RouterVersion {
        let mut parts = s.splitn(4, '.');
        let mut nums = [0u32; 4];
        for slot in &mut nums {
            match parts.next().and_then(|p| {
                p.chars()
                    .take_while(|c| c.is_ascii_digit())
                    .collect::<String>()
                    .parse()
                    .ok()
            }) {
                Some(n) => *slot = n,
                None => return RouterVersion::UNKNOWN,
            }
        }
        RouterVersion {
            encoded: (nums[0] << 24) | (nums[1] << 16) | (nums[2] << 8) | nums[3],
        }
    }

    /// The raw comparable integer encoding.
    pub fn as_u32(self) -> u32 {
        self.encoded
    }
}

/// One line of a router's exit policy: `accept|reject ip/netmask:port_low-port_high`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitPolicyRule {
    pub accept: bool,
    pub ip: u32,
    pub netmask: u32,
    pub port_low: u16,
    pub port_high: u16,
}

impl ExitPolicyRule {
    /// Build a wildcard `accept|reject *:*` rule.
    pub fn wildcard(accept: bool) -> ExitPolicyRule {
        ExitPolicyRule {
            accept,
            ip: 0,
            netmask: 0,
            port_low: 0,
            port_high: 65535,
        }
    }

    /// `Some(accept)` if `(ip, port)` matches this rule's address/port
    /// range, `None` otherwise (`ExitPolicyLine.check`'s `-1` sentinel).
    fn check(&self, ip: u32, port: u16) -> Option<bool> {
        if (ip & self.netmask) == (self.ip & self.netmask)
            && self.port_low <= port
            && port <= self.port_high
        {
            Some(self.accept)
        } else {
            None
        }
    }
}

/// A router's ordered exit policy: first matching line wins (spec §3).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitPolicy(pub Vec<ExitPolicyRule>);

impl ExitPolicy {
    /// Evaluate the policy against `(ip, port)`. Returns `None` if every
    /// rule was exhausted without a match — spec §3 says this case is
    /// logged and treated as deny by the caller, not decided here.
    pub fn check(&self, ip: u32, port: u16) -> Option<bool> {
        self.0.iter().find_map(|rule| rule.check(ip, port))
    }

    /// `will_exit_to`: evaluate the policy, treating "no match" as deny
    /// and logging a warning, matching `Router.will_exit_to` exactly.
    pub fn will_exit_to(&self, ip: u32, port: u16, nickname: &str) -> bool {
        match self.check(ip, port) {
            Some(v) => v,
            None => {
                tracing::warn!(nickname, ip, port, "no matching exit line");
                false
            }
        }
    }
}

/// A router as tracked by the path builder (spec §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Router {
    /// 40-hex fingerprint, normalized upper-case with no leading `$`.
    pub idhex: String,
    pub nickname: String,
    /// IPv4 address, as a 32-bit big-endian integer.
    pub ip: u32,
    /// Observed bandwidth in bytes/sec.
    pub bw: u64,
    pub flags: RouterFlags,
    pub version: RouterVersion,
    pub os: String,
    pub uptime: u64,
    pub exit_policy: ExitPolicy,
    pub country: Option<String>,
    pub continent: Option<String>,
    /// This router's index in the global bandwidth-descending order.
    /// Invariant (spec §3): matches its position in the sorted list after
    /// every `read_routers` update.
    pub list_rank: usize,
    /// True if this router's consensus line lacked the `Running` flag —
    /// `Router.down` in the original (we don't treat it specially beyond
    /// carrying it, since `RUNNING` is already in `flags`).
    pub down: bool,
}

impl Router {
    /// Does this router's consensus-observed flags make it currently dead?
    pub fn is_down(&self) -> bool {
        self.down
    }

    /// Check whether this router will carry traffic to `(ip, port)`,
    /// normalizing a non-IPv4 host to `255.255.255.255` first per spec
    /// §4.7 ("Normalize non-IPv4 `target_host`").
    pub fn will_exit_to(&self, ip: Ipv4Addr, port: u16) -> bool {
        self.exit_policy
            .will_exit_to(u32::from(ip), port, &self.nickname)
    }
}

/// Strip a leading `$` and upper-case a fingerprint, per spec §6.
pub fn normalize_idhex(s: &str) -> String {
    s.strip_prefix('$').unwrap_or(s).to_uppercase()
}

/// Parse `a.b.c.d` into a big-endian `u32`, erroring on malformed input.
pub fn parse_ipv4(s: &str) -> Result<u32, Error> {
    s.parse::<Ipv4Addr>()
        .map(u32::from)
        .map_err(|_| Error::Protocol(format!("bad IPv4 address: {s:?}")))
}

impl PartialOrd for Router {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Router {
    /// Bandwidth-descending, matching the sort `read_routers` maintains
    /// for `sorted_r` (spec §3 invariant 3). Ties break on idhex so the
    /// order is total and deterministic for tests.
    fn cmp(&self, other: &Self) -> Ordering {
        other.bw.cmp(&self.bw).then_with(|| self.idhex.cmp(&other.idhex))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn version_encodes_as_spec_says() {
        let v = RouterVersion::parse("0.4.8.1 on Linux");
        assert_eq!(v.as_u32(), 0 * (1 << 24) + 4 * (1 << 16) + 8 * (1 << 8) + 1);
    }

    #[test]
    fn version_orders_correctly() {
        let old = RouterVersion::parse("0.3.5.8");
        let new = RouterVersion::parse("0.4.0.0");
        assert!(old < new);
    }

    #[test]
    fn idhex_normalization_strips_dollar_and_upcases() {
        assert_eq!(normalize_idhex("$deadbeef"), "DEADBEEF");
        assert_eq!(normalize_idhex("DEADBEEF"), "DEADBEEF");
    }

    #[test]
    fn idhex_normalization_is_idempotent() {
        let once = normalize_idhex("$aAbB");
        let twice = normalize_idhex(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn exit_policy_first_match_wins() {
        // reject 1.2.3.0/24:*, accept *:80, reject *:*
        let policy = ExitPolicy(vec![
            ExitPolicyRule {
                accept: false,
                ip: parse_ipv4("1.2.3.0").unwrap(),
                netmask: parse_ipv4("255.255.255.0").unwrap(),
                port_low: 0,
                port_high: 65535,
            },
            ExitPolicyRule {
                accept: true,
                ip: 0,
                netmask: 0,
                port_low: 80,
                port_high: 80,
            },
            ExitPolicyRule::wildcard(false),
        ]);

        assert_eq!(policy.check(parse_ipv4("1.2.3.4").unwrap(), 80), Some(false));
        assert_eq!(policy.check(parse_ipv4("9.9.9.9").unwrap(), 80), Some(true));
        assert_eq!(policy.check(parse_ipv4("9.9.9.9").unwrap(), 443), Some(false));
    }

    #[test]
    fn exit_policy_exhaustion_is_none_not_deny() {
        let policy = ExitPolicy(vec![ExitPolicyRule {
            accept: true,
            ip: parse_ipv4("1.2.3.0").unwrap(),
            netmask: parse_ipv4("255.255.255.0").unwrap(),
            port_low: 80,
            port_high: 80,
        }]);
        assert_eq!(policy.check(parse_ipv4("9.9.9.9").unwrap(), 80), None);
    }

    #[test]
    fn will_exit_to_treats_exhaustion_as_deny() {
        let policy = ExitPolicy(Vec::new());
        assert!(!policy.will_exit_to(0, 80, "test"));
    }
}

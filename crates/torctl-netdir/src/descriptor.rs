//! Parse a router descriptor body (as returned by `GETINFO desc/id/<idhex>`)
//! into the fields [`crate::arena::RouterTable::apply_descriptor`] merges
//! onto an existing [`crate::router::Router`].
//!
//! Grounded on `original_source/TorCtl.py`'s `Router.build_from_desc`: the
//! same `router`, `platform`, `accept`/`reject`, `bandwidth`, `uptime`, and
//! `opt hibernating` lines, read line-by-line with the last bandwidth/
//! uptime line winning if a descriptor repeats one (matching the Python's
//! plain overwrite-on-reassignment behavior).

use crate::router::{parse_ipv4, ExitPolicy, ExitPolicyRule, RouterVersion};
use torctl_error::Error;

/// The descriptor-sourced subset of a router's fields.
#[derive(Debug, Clone, Default)]
pub struct Descriptor {
    pub nickname: Option<String>,
    pub ip: Option<u32>,
    pub os: Option<String>,
    pub version: Option<RouterVersion>,
    pub uptime: Option<u64>,
    pub bw: Option<u64>,
    pub exit_policy: ExitPolicy,
    pub hibernating: bool,
}

/// Parse one `accept`/`reject` policy line's `ip[/mask]:port[-port]` tail.
fn parse_policy_line(accept: bool, rest: &str) -> Option<ExitPolicyRule> {
    let (addr, ports) = rest.trim().split_once(':')?;

    let (ip, netmask) = if addr == "*" {
        (0, 0)
    } else if let Some((ip, mask)) = addr.split_once('/') {
        let ip = parse_ipv4(ip).ok()?;
        let netmask = if let Ok(bits) = mask.parse::<u32>() {
            if bits == 0 {
                0
            } else {
                u32::MAX << (32 - bits)
            }
        } else {
            parse_ipv4(mask).ok()?
        };
        (ip, netmask)
    } else {
        (parse_ipv4(addr).ok()?, u32::MAX)
    };

    let (port_low, port_high) = if ports == "*" {
        (0, 65535)
    } else if let Some((lo, hi)) = ports.split_once('-') {
        (lo.parse().ok()?, hi.parse().ok()?)
    } else {
        let p = ports.parse().ok()?;
        (p, p)
    };

    Some(ExitPolicyRule {
        accept,
        ip,
        netmask,
        port_low,
        port_high,
    })
}

/// Parse a full descriptor body into a [`Descriptor`].
pub fn parse_descriptor(lines: &[String]) -> Result<Descriptor, Error> {
    let mut desc = Descriptor::default();

    for line in lines {
        let line = line.trim_end();
        if let Some(rest) = line.strip_prefix("router ") {
            let mut parts = rest.split_whitespace();
            desc.nickname = parts.next().map(str::to_owned);
            if let Some(ip) = parts.next() {
                desc.ip = parse_ipv4(ip).ok();
            }
        } else if let Some(rest) = line.strip_prefix("platform Tor ") {
            let ver = rest.split(' ').next().unwrap_or("");
            desc.version = Some(RouterVersion::parse(ver));
            if let Some(idx) = rest.find(" on ") {
                desc.os = Some(rest[idx + 4..].to_owned());
            }
        } else if let Some(rest) = line.strip_prefix("bandwidth ") {
            let nums: Vec<&str> = rest.split_whitespace().collect();
            if let Some(observed) = nums.get(2) {
                desc.bw = observed.parse().ok();
            }
        } else if let Some(rest) = line.strip_prefix("uptime ") {
            desc.uptime = rest.trim().parse().ok();
        } else if line.trim() == "opt hibernating 1" {
            desc.hibernating = true;
        } else if let Some(rest) = line.strip_prefix("accept ") {
            if let Some(rule) = parse_policy_line(true, rest) {
                desc.exit_policy.0.push(rule);
            }
        } else if let Some(rest) = line.strip_prefix("reject ") {
            if let Some(rule) = parse_policy_line(false, rest) {
                desc.exit_policy.0.push(rule);
            }
        }
    }

    Ok(desc)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_router_platform_and_policy() {
        let lines: Vec<String> = vec![
            "router relay 1.2.3.4 9001 0 9030".into(),
            "platform Tor 0.4.7.13 on Linux".into(),
            "bandwidth 1000 2000 150000".into(),
            "uptime 86400".into(),
            "reject 1.2.3.0/24:*".into(),
            "accept *:80".into(),
            "reject *:*".into(),
        ];
        let desc = parse_descriptor(&lines).unwrap();
        assert_eq!(desc.nickname.as_deref(), Some("relay"));
        assert_eq!(desc.ip, parse_ipv4("1.2.3.4").ok());
        assert_eq!(desc.os.as_deref(), Some("Linux"));
        assert_eq!(desc.bw, Some(150000));
        assert_eq!(desc.uptime, Some(86400));
        assert_eq!(desc.exit_policy.0.len(), 3);
        assert!(!desc.hibernating);
    }

    #[test]
    fn detects_hibernating_flag() {
        let lines: Vec<String> = vec!["opt hibernating 1".into()];
        let desc = parse_descriptor(&lines).unwrap();
        assert!(desc.hibernating);
    }

    #[test]
    fn cidr_netmask_computed_from_bit_count() {
        let rule = parse_policy_line(true, "10.0.0.0/8:443").unwrap();
        assert_eq!(rule.netmask, 0xFF00_0000);
        assert_eq!(rule.port_low, 443);
        assert_eq!(rule.port_high, 443);
    }
}

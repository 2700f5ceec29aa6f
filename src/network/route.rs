//! Static routes
//!
//! Routes are validated lazily: a bad entry is reported and skipped at
//! install time without touching the rest of the namespace.

use crate::error::{Error, Result};
use crate::manifest::RouteDef;
use crate::runner::Toolbox;
use ipnet::IpNet;
use std::net::IpAddr;
use tracing::info;

/// Route types `ip route show` prints ahead of the destination
const ROUTE_TYPES: &[&str] = &[
    "unicast",
    "local",
    "broadcast",
    "multicast",
    "throw",
    "unreachable",
    "prohibit",
    "blackhole",
    "nat",
    "anycast",
];

/// One static route in a namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub name: String,
    pub netns: String,
    pub dest_prefix: String,
    pub next_hop: Option<String>,
    pub egress_if: Option<String>,
}

/// Validated route parts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteTarget {
    pub dest: IpNet,
    pub next_hop: Option<IpAddr>,
}

impl Route {
    /// Build from config; empty strings count as unset
    pub fn new(name: impl Into<String>, netns: impl Into<String>, def: &RouteDef) -> Self {
        let non_empty = |v: &Option<String>| {
            v.as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        Self {
            name: name.into(),
            netns: netns.into(),
            dest_prefix: def.dest_prefix.trim().to_string(),
            next_hop: non_empty(&def.next_hop_ip),
            egress_if: non_empty(&def.egress_if_name),
        }
    }

    fn invalid(&self, message: String) -> Error {
        Error::Validation {
            route: format!("{}/{}", self.netns, self.name),
            message,
        }
    }

    /// Check the destination, next hop and their families
    ///
    /// A bare address is a host route. Destinations with host bits set are
    /// rejected, since `ip` would refuse them.
    pub fn validate(&self) -> Result<RouteTarget> {
        let dest = parse_destination(&self.dest_prefix).ok_or_else(|| {
            self.invalid(format!(
                "'{}' is not a valid network prefix",
                self.dest_prefix
            ))
        })?;

        let next_hop = match &self.next_hop {
            Some(raw) => Some(raw.parse::<IpAddr>().map_err(|_| {
                self.invalid(format!("'{}' is not a valid IP address", raw))
            })?),
            None => None,
        };

        if next_hop.is_none() && self.egress_if.is_none() {
            return Err(self.invalid(
                "needs a next_hop_ip or an egress_if_name".to_string(),
            ));
        }

        if let Some(nh) = next_hop
            && nh.is_ipv4() != matches!(dest, IpNet::V4(_))
        {
            return Err(self.invalid(format!(
                "next hop {} and destination {} are different address families",
                nh, dest
            )));
        }

        Ok(RouteTarget { dest, next_hop })
    }

    /// Synthesize `ip route add ...` if the route is valid and not installed
    ///
    /// Invalid routes return `Err(Validation)` without running anything.
    /// `Ok(None)` means the destination is already in the namespace's table.
    pub fn install_command(&self, tb: &Toolbox) -> Result<Option<Vec<String>>> {
        let target = self.validate()?;
        let dest = target.dest.to_string();
        let family = match target.dest {
            IpNet::V4(_) => "-4",
            IpNet::V6(_) => "-6",
        };

        let netns = Some(self.netns.as_str());
        let table = tb.ip_checked(&[family, "route", "show", dest.as_str()], netns)?;
        if table_contains(&table.stdout, &target.dest) {
            info!(
                "{} already exists in {} route table, skipping",
                dest, self.netns
            );
            return Ok(None);
        }

        let via = target.next_hop.map(|nh| nh.to_string());
        let mut args = vec!["route", "add", dest.as_str()];
        if let Some(via) = via.as_deref() {
            args.extend(["via", via]);
        }
        if let Some(dev) = self.egress_if.as_deref() {
            args.extend(["dev", dev]);
        }

        Ok(Some(tb.ip_argv(&args)))
    }
}

fn parse_destination(raw: &str) -> Option<IpNet> {
    if let Ok(net) = raw.parse::<IpNet>() {
        return (net.trunc() == net).then_some(net);
    }
    raw.parse::<IpAddr>().ok().map(IpNet::from)
}

/// Whether `ip route show` output has an entry for exactly `dest`
///
/// Host routes are listed without their mask and `/0` as `default`.
pub fn table_contains(table: &str, dest: &IpNet) -> bool {
    table.lines().any(|line| {
        let mut tokens = line.split_whitespace();
        let mut first = tokens.next();
        if first.is_some_and(|t| ROUTE_TYPES.contains(&t)) {
            first = tokens.next();
        }

        match first {
            Some("default") => dest.prefix_len() == 0,
            Some(token) => parse_destination(token).is_some_and(|net| net == *dest),
            None => false,
        }
    })
}

//! Topology configuration parsing for nsfleet
//!
//! Parses JSON (canonical) or TOML topology files using serde. Everything
//! that can be rejected before touching the kernel is rejected here.

use crate::error::{Error, Result};
use crate::network::interface::LOOPBACK_NAME;
use crate::network::oob;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

/// Linux IFNAMSIZ minus the trailing NUL
pub const MAX_LINK_NAME_LEN: usize = 15;

/// Largest topology `generate` will emit
pub const MAX_GENERATED_NAMESPACES: u32 = 250;

/// Load and validate a topology from a file
///
/// Files ending in `.toml` are parsed as TOML, anything else as JSON.
pub fn load(path: &Path) -> Result<TopologyConfig> {
    let content = fs::read_to_string(path).map_err(|e| Error::ConfigRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    let config: TopologyConfig = if path.extension().is_some_and(|ext| ext == "toml") {
        toml::from_str(&content)?
    } else {
        serde_json::from_str(&content)?
    };

    config.validate()?;

    Ok(config)
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TopologyConfig {
    /// Physical uplink shared by every macvlan (including OOB)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub physical_int: Option<String>,

    /// Global out-of-band prefixes
    #[serde(default)]
    pub oob: OobConfig,

    /// Namespace definitions keyed by namespace name
    #[serde(default)]
    pub namespaces: BTreeMap<String, NamespaceDef>,

    /// Tooling and execution settings
    #[serde(default, skip_serializing_if = "Settings::is_default")]
    pub settings: Settings,
}

impl TopologyConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let mut ids: HashMap<u32, &str> = HashMap::new();
        // Veths and macvlans are created in root, so their names share one scope
        let mut root_links: HashSet<&str> = HashSet::new();

        for (ns_name, ns) in &self.namespaces {
            if ns_name.is_empty() || ns_name.contains('/') || ns_name.starts_with('.') {
                return Err(Error::ConfigValidation(format!(
                    "Invalid namespace name: '{}'",
                    ns_name
                )));
            }

            if ns.id == 0 {
                return Err(Error::ConfigValidation(format!(
                    "Namespace '{}' has id 0 (reserved for the host)",
                    ns_name
                )));
            }

            if let Some(other) = ids.insert(ns.id, ns_name.as_str()) {
                return Err(Error::ConfigValidation(format!(
                    "Namespaces '{}' and '{}' share id {}",
                    other, ns_name, ns.id
                )));
            }

            let loopbacks = ns
                .interfaces
                .values()
                .filter(|i| i.kind == InterfaceType::Loopback)
                .count();
            if loopbacks > 1 {
                return Err(Error::ConfigValidation(format!(
                    "Namespace '{}' defines {} loopback interfaces",
                    ns_name, loopbacks
                )));
            }

            for (if_name, iface) in &ns.interfaces {
                check_link_name(ns_name, if_name)?;

                match iface.kind {
                    InterfaceType::Loopback => {}
                    InterfaceType::Veth => {
                        let peer = iface.peer_name.as_deref().ok_or_else(|| {
                            Error::ConfigValidation(format!(
                                "Veth '{}' in namespace '{}' has no peer_name",
                                if_name, ns_name
                            ))
                        })?;
                        check_link_name(ns_name, peer)?;
                        self.check_reserved_name(ns_name, if_name)?;
                        self.check_reserved_name(ns_name, peer)?;
                        if peer == if_name.as_str() {
                            return Err(Error::ConfigValidation(format!(
                                "Veth '{}' in namespace '{}' is its own peer",
                                if_name, ns_name
                            )));
                        }
                        for link in [if_name.as_str(), peer] {
                            if !root_links.insert(link) {
                                return Err(Error::ConfigValidation(format!(
                                    "Link name '{}' is used more than once",
                                    link
                                )));
                            }
                        }
                    }
                    InterfaceType::Macvlan => {
                        if self.physical_int.is_none() {
                            return Err(Error::ConfigValidation(format!(
                                "Macvlan '{}' in namespace '{}' needs physical_int",
                                if_name, ns_name
                            )));
                        }
                        self.check_reserved_name(ns_name, if_name)?;
                        if !root_links.insert(if_name.as_str()) {
                            return Err(Error::ConfigValidation(format!(
                                "Link name '{}' is used more than once",
                                if_name
                            )));
                        }
                    }
                }
            }

            if ns.oob {
                if self.physical_int.is_none() {
                    return Err(Error::ConfigValidation(format!(
                        "Namespace '{}' enables OOB but physical_int is not set",
                        ns_name
                    )));
                }
                if self.oob.prefixes.is_empty() {
                    return Err(Error::ConfigValidation(format!(
                        "Namespace '{}' enables OOB but oob.prefixes is empty",
                        ns_name
                    )));
                }

                for prefix in &self.oob.prefixes {
                    if !oob::fits(prefix, ns.id) {
                        return Err(Error::ConfigValidation(format!(
                            "Namespace '{}' id {} does not fit in OOB prefix {}",
                            ns_name, ns.id, prefix
                        )));
                    }
                }
            }
        }

        if self.settings.workers == 0 {
            return Err(Error::ConfigValidation(
                "settings.workers must be at least 1".into(),
            ));
        }

        Ok(())
    }

    /// Reject created links whose name belongs to the uplink, a loopback or an OOB device
    fn check_reserved_name(&self, ns_name: &str, link: &str) -> Result<()> {
        let owner = if self.physical_int.as_deref() == Some(link) {
            "the physical uplink"
        } else if link == LOOPBACK_NAME {
            "the loopback"
        } else if oob::is_interface_name(link) {
            "OOB interfaces"
        } else {
            return Ok(());
        };

        Err(Error::ConfigValidation(format!(
            "Link name '{}' in namespace '{}' is reserved for {}",
            link, ns_name, owner
        )))
    }
}

fn check_link_name(ns_name: &str, link: &str) -> Result<()> {
    if link.is_empty() || link.len() > MAX_LINK_NAME_LEN || link.contains(['/', ' ']) {
        return Err(Error::ConfigValidation(format!(
            "Invalid interface name '{}' in namespace '{}' (1-{} chars, no '/' or spaces)",
            link, ns_name, MAX_LINK_NAME_LEN
        )));
    }
    Ok(())
}

/// Global out-of-band configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct OobConfig {
    /// Network prefixes, typically one IPv6 and one IPv4
    #[serde(default)]
    pub prefixes: Vec<IpNet>,
}

/// Namespace definition from config file
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NamespaceDef {
    /// Numeric id (>= 1), also the OOB host offset
    pub id: u32,

    /// Give this namespace an OOB interface
    #[serde(default)]
    pub oob: bool,

    /// Interfaces keyed by name
    #[serde(default)]
    pub interfaces: BTreeMap<String, InterfaceDef>,

    /// Static routes keyed by name
    #[serde(default)]
    pub routes: BTreeMap<String, RouteDef>,
}

/// Interface kinds understood by the config
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InterfaceType {
    Loopback,
    Macvlan,
    Veth,
}

/// Interface definition
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InterfaceDef {
    #[serde(rename = "type")]
    pub kind: InterfaceType,

    /// Addresses with prefix length (e.g. "10.1.1.1/24")
    #[serde(default)]
    pub prefixes: Vec<IpNet>,

    /// Root-side peer name (veth only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_name: Option<String>,

    /// Macvlan mode (macvlan only, defaults to "bridge")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

/// Route definition
///
/// Kept as raw strings: a bad route is skipped at install time rather than
/// failing the whole topology.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RouteDef {
    pub dest_prefix: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_hop_ip: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub egress_if_name: Option<String>,
}

fn default_ip_path() -> PathBuf {
    PathBuf::from("/usr/sbin/ip")
}

fn default_netns_dir() -> PathBuf {
    PathBuf::from("/run/netns")
}

fn default_command_timeout() -> u64 {
    30
}

fn default_workers() -> usize {
    1
}

/// Tooling and execution settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Settings {
    /// Path to the iproute2 `ip` binary
    #[serde(default = "default_ip_path")]
    pub ip_path: PathBuf,

    /// Namespace registry directory
    #[serde(default = "default_netns_dir")]
    pub netns_dir: PathBuf,

    /// Per-command timeout in seconds (0 = wait forever)
    #[serde(default = "default_command_timeout")]
    pub command_timeout: u64,

    /// Worker threads for namespace setup/teardown
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Settings {
    fn is_default(&self) -> bool {
        *self == Self::default()
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ip_path: default_ip_path(),
            netns_dir: default_netns_dir(),
            command_timeout: default_command_timeout(),
            workers: default_workers(),
        }
    }
}

/// Generate a sample topology with namespaces `ns1..=nsN`
///
/// Each namespace gets a loopback, one veth (peer left in root) and OOB.
pub fn generate(count: u32) -> Result<TopologyConfig> {
    if count == 0 || count > MAX_GENERATED_NAMESPACES {
        return Err(Error::ConfigValidation(format!(
            "Namespace count must be between 1 and {}",
            MAX_GENERATED_NAMESPACES
        )));
    }

    let mut namespaces = BTreeMap::new();
    for idx in 1..=count {
        let mut interfaces = BTreeMap::new();
        interfaces.insert(
            "lo".to_string(),
            InterfaceDef {
                kind: InterfaceType::Loopback,
                prefixes: parse_prefixes(&[
                    format!("fd00:{:x}::1/128", idx),
                    format!("10.254.{}.1/32", idx),
                ])?,
                peer_name: None,
                mode: None,
            },
        );

        let veth = format!("ns{}v0", idx);
        interfaces.insert(
            veth.clone(),
            InterfaceDef {
                kind: InterfaceType::Veth,
                prefixes: parse_prefixes(&[
                    format!("fd01:{:x}::1/64", idx),
                    format!("10.{}.0.1/24", idx),
                ])?,
                peer_name: Some(format!("{}p", veth)),
                mode: None,
            },
        );

        namespaces.insert(
            format!("ns{}", idx),
            NamespaceDef {
                id: idx,
                oob: true,
                interfaces,
                routes: BTreeMap::new(),
            },
        );
    }

    let config = TopologyConfig {
        physical_int: Some("eth0".to_string()),
        oob: OobConfig {
            prefixes: parse_prefixes(&["fddd::/64".to_string(), "10.255.255.0/24".to_string()])?,
        },
        namespaces,
        settings: Settings::default(),
    };
    config.validate()?;

    Ok(config)
}

fn parse_prefixes(raw: &[String]) -> Result<Vec<IpNet>> {
    raw.iter()
        .map(|p| {
            p.parse::<IpNet>()
                .map_err(|e| Error::ConfigValidation(format!("Invalid prefix '{}': {}", p, e)))
        })
        .collect()
}

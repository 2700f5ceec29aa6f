//! Link management through `ip link`
//!
//! Interfaces are a closed set of variants sharing one capability set:
//! probe, create, move into a namespace, address, bring up.

use crate::error::{Error, Result};
use crate::manifest::{InterfaceDef, InterfaceType};
use crate::runner::Toolbox;
use ipnet::IpNet;
use tracing::{debug, info};

/// Name the kernel gives every namespace's loopback
pub const LOOPBACK_NAME: &str = "lo";

/// Default macvlan mode
pub const DEFAULT_MACVLAN_MODE: &str = "bridge";

/// Variant-specific interface data
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterfaceKind {
    /// Always present, never created
    Loopback,
    /// Macvlan bridged to a physical uplink in the root namespace
    MacVlan { uplink: String, mode: String },
    /// Veth pair; the peer stays in the root namespace
    Veth { peer: String },
}

/// One link endpoint and the addresses it should carry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub name: String,
    pub prefixes: Vec<IpNet>,
    pub kind: InterfaceKind,
}

impl Interface {
    pub fn loopback(prefixes: Vec<IpNet>) -> Self {
        Self {
            name: LOOPBACK_NAME.to_string(),
            prefixes,
            kind: InterfaceKind::Loopback,
        }
    }

    pub fn macvlan(
        name: impl Into<String>,
        uplink: impl Into<String>,
        mode: impl Into<String>,
        prefixes: Vec<IpNet>,
    ) -> Self {
        Self {
            name: name.into(),
            prefixes,
            kind: InterfaceKind::MacVlan {
                uplink: uplink.into(),
                mode: mode.into(),
            },
        }
    }

    pub fn veth(name: impl Into<String>, peer: impl Into<String>, prefixes: Vec<IpNet>) -> Self {
        Self {
            name: name.into(),
            prefixes,
            kind: InterfaceKind::Veth { peer: peer.into() },
        }
    }

    /// Build an interface from its config entry
    ///
    /// `uplink` is the topology's physical interface, needed by macvlans.
    pub fn from_def(name: &str, def: &InterfaceDef, uplink: Option<&str>) -> Result<Self> {
        let prefixes = def.prefixes.clone();
        match def.kind {
            InterfaceType::Loopback => Ok(Self::loopback(prefixes)),
            InterfaceType::Veth => {
                let peer = def.peer_name.as_deref().ok_or_else(|| {
                    Error::ConfigValidation(format!("Veth '{}' has no peer_name", name))
                })?;
                Ok(Self::veth(name, peer, prefixes))
            }
            InterfaceType::Macvlan => {
                let uplink = uplink.ok_or_else(|| {
                    Error::ConfigValidation(format!("Macvlan '{}' needs physical_int", name))
                })?;
                let mode = def.mode.as_deref().unwrap_or(DEFAULT_MACVLAN_MODE);
                Ok(Self::macvlan(name, uplink, mode, prefixes))
            }
        }
    }

    pub fn is_loopback(&self) -> bool {
        self.kind == InterfaceKind::Loopback
    }

    pub fn is_veth(&self) -> bool {
        matches!(self.kind, InterfaceKind::Veth { .. })
    }

    /// Short kind label for logs
    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            InterfaceKind::Loopback => "loopback",
            InterfaceKind::MacVlan { .. } => "macvlan",
            InterfaceKind::Veth { .. } => "veth",
        }
    }

    fn label(&self) -> String {
        format!("{} {}", self.kind_name(), self.name)
    }

    /// Check whether the link is present in root (`None`) or inside `netns`
    pub fn exists(&self, tb: &Toolbox, netns: Option<&str>) -> Result<bool> {
        link_exists(tb, &self.name, netns)
    }

    /// Instantiate the kernel object in the root namespace
    ///
    /// Callers check `exists` first; creating a link that is already present
    /// fails in `ip` and surfaces as `CreateFailed`.
    pub fn create(&self, tb: &Toolbox) -> Result<()> {
        let args: Vec<&str> = match &self.kind {
            InterfaceKind::Loopback => return Ok(()),
            InterfaceKind::MacVlan { uplink, mode } => {
                if !link_exists(tb, uplink, None)? {
                    return Err(Error::InvalidUplink(uplink.clone()));
                }
                vec![
                    "link",
                    "add",
                    self.name.as_str(),
                    "link",
                    uplink.as_str(),
                    "type",
                    "macvlan",
                    "mode",
                    mode.as_str(),
                ]
            }
            InterfaceKind::Veth { peer } => {
                vec![
                    "link",
                    "add",
                    self.name.as_str(),
                    "type",
                    "veth",
                    "peer",
                    "name",
                    peer.as_str(),
                ]
            }
        };

        let out = tb.ip(&args, None)?;
        if !out.success() {
            return Err(Error::CreateFailed {
                what: self.label(),
                message: out.failure_message(),
            });
        }

        match &self.kind {
            InterfaceKind::MacVlan { uplink, mode } => {
                info!("Created macvlan {} on {} (mode {})", self.name, uplink, mode)
            }
            InterfaceKind::Veth { peer } => {
                info!("Created veth {} with peer {}", self.name, peer)
            }
            InterfaceKind::Loopback => {}
        }
        Ok(())
    }

    /// Remove the link from root or `netns`, doing nothing if it is absent
    ///
    /// Deleting either end of a veth removes the pair.
    pub fn delete(&self, tb: &Toolbox, netns: Option<&str>) -> Result<()> {
        if self.is_loopback() {
            return Ok(());
        }
        if !self.exists(tb, netns)? {
            debug!("Not deleting {}: it does not exist", self.label());
            return Ok(());
        }

        let out = tb.ip(&["link", "del", self.name.as_str()], netns)?;
        if !out.success() {
            return Err(Error::DeleteFailed {
                what: self.label(),
                message: out.failure_message(),
            });
        }
        info!("Deleted {}", self.label());
        Ok(())
    }

    /// Move the link from root into namespace `ns`
    pub fn set_namespace(&self, tb: &Toolbox, ns: &str) -> Result<bool> {
        tb.ip_status(&["link", "set", self.name.as_str(), "netns", ns], None)
    }

    /// Assign every configured prefix, collecting failures
    ///
    /// An address that is already assigned is not a failure.
    pub fn add_prefixes(&self, tb: &Toolbox, netns: Option<&str>) -> Vec<Error> {
        let mut errors = Vec::new();

        for prefix in &self.prefixes {
            let prefix_str = prefix.to_string();
            let args = ["addr", "add", prefix_str.as_str(), "dev", self.name.as_str()];
            match tb.ip(&args, netns) {
                Ok(out) if out.success() => match netns {
                    Some(ns) => info!("Added {} to {} in {} namespace", prefix, self.name, ns),
                    None => info!("Added {} to {}", prefix, self.name),
                },
                Ok(out) if out.stderr.contains("File exists") => {
                    debug!("{} already has {}", self.name, prefix);
                }
                Ok(out) => errors.push(Error::CreateFailed {
                    what: format!("address {} on {}", prefix, self.name),
                    message: out.failure_message(),
                }),
                Err(e) => errors.push(e),
            }
        }

        errors
    }

    /// Set the link administratively up
    pub fn set_link_up(&self, tb: &Toolbox, netns: Option<&str>) -> Result<bool> {
        tb.ip_status(&["link", "set", "up", "dev", self.name.as_str()], netns)
    }
}

/// Probe for a link by name
///
/// `ip link show` exiting 1 with "does not exist" means absent. Any other
/// failure is an error rather than a silent "absent".
pub fn link_exists(tb: &Toolbox, name: &str, netns: Option<&str>) -> Result<bool> {
    let argv = tb.ip_argv(&["link", "show", "dev", name]);
    let out = tb.run(&argv, netns)?;

    if out.success() {
        return Ok(true);
    }
    if out.exit_code == Some(1) && out.stderr.contains("does not exist") {
        return Ok(false);
    }

    Err(Error::CommandFailed {
        command: crate::runner::describe(&argv, netns),
        message: out.failure_message(),
    })
}

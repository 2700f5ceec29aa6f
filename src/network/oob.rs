//! Out-of-band management addressing
//!
//! Every namespace with OOB enabled gets a macvlan named `oob<id>` bridged to
//! the physical uplink. Its addresses are the network address of each global
//! OOB prefix offset by the namespace id. The host side (`oob0`) is id 0.

use crate::error::{Error, Result};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use std::net::{Ipv4Addr, Ipv6Addr};

/// Host-side OOB macvlan name
pub const GLOBAL_OOB_INTERFACE: &str = "oob0";

/// Id used for the host-side OOB addresses
pub const HOST_OOB_ID: u32 = 0;

/// OOB interface name for a namespace id
pub fn interface_name(id: u32) -> String {
    format!("oob{}", id)
}

/// Whether `name` has the shape of an OOB interface name (`oob<N>`)
pub fn is_interface_name(name: &str) -> bool {
    name.strip_prefix("oob")
        .is_some_and(|id| !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()))
}

/// Check that `id` fits in the host part of `prefix`
pub fn fits(prefix: &IpNet, id: u32) -> bool {
    let host_bits = u32::from(prefix.max_prefix_len() - prefix.prefix_len());
    host_bits >= 32 || u64::from(id) < (1u64 << host_bits)
}

/// Offset the network address of `prefix` by `id`, keeping the prefix length
///
/// `fddd::/64` with id 1 gives `fddd::1/64`.
pub fn address(prefix: &IpNet, id: u32) -> Result<IpNet> {
    if !fits(prefix, id) {
        return Err(Error::ConfigValidation(format!(
            "OOB id {} does not fit in the host part of {}",
            id, prefix
        )));
    }

    let len_error = |e: ipnet::PrefixLenError| {
        Error::ConfigValidation(format!("Invalid OOB prefix {}: {}", prefix, e))
    };

    match prefix {
        IpNet::V4(net) => {
            let host = u32::from(net.network()) + id;
            Ipv4Net::new(Ipv4Addr::from(host), net.prefix_len())
                .map(IpNet::V4)
                .map_err(len_error)
        }
        IpNet::V6(net) => {
            let host = u128::from(net.network()) + u128::from(id);
            Ipv6Net::new(Ipv6Addr::from(host), net.prefix_len())
                .map(IpNet::V6)
                .map_err(len_error)
        }
    }
}

/// OOB addresses for `id`, one per configured prefix, in configuration order
pub fn addresses(prefixes: &[IpNet], id: u32) -> Result<Vec<IpNet>> {
    prefixes.iter().map(|p| address(p, id)).collect()
}

//! Network object model for namespace topologies
//!
//! Provides:
//! - Interface variants (loopback, macvlan, veth) driven through `ip link`
//! - Static routes with validation and idempotent install
//! - Out-of-band management addressing
//! - Namespace lifecycle (create, setup, delete, check)

pub mod interface;
pub mod namespace;
pub mod oob;
pub mod route;

pub use namespace::Namespace;
pub use route::Route;

//! Topology orchestration
//!
//! Coordinates the shared root-namespace work (veth pairs, the host OOB
//! macvlan) and then fans namespace setup or teardown out to a worker pool.
//! Root work always finishes before the pool starts.

use crate::error::{Error, Result};
use crate::manifest::TopologyConfig;
use crate::network::interface::{DEFAULT_MACVLAN_MODE, Interface};
use crate::network::{Namespace, oob};
use crate::runner::Toolbox;
use crossbeam::channel;
use ipnet::IpNet;
use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use tracing::{debug, error, info};

/// What to do with a topology
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Create,
    Delete,
    Check,
}

impl Action {
    /// Whether the action changes kernel state
    pub fn mutates(self) -> bool {
        matches!(self, Action::Create | Action::Delete)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Create => write!(f, "create"),
            Action::Delete => write!(f, "delete"),
            Action::Check => write!(f, "check"),
        }
    }
}

/// All namespaces of a config plus the shared uplink and OOB prefixes
pub struct Topology {
    uplink: Option<String>,
    oob_prefixes: Vec<IpNet>,
    namespaces: BTreeMap<String, Namespace>,
    toolbox: Toolbox,
    workers: usize,
}

impl Topology {
    pub fn new(config: &TopologyConfig, toolbox: Toolbox) -> Result<Self> {
        let namespaces = config
            .namespaces
            .iter()
            .map(|(name, def)| Ok((name.clone(), Namespace::new(name, def, config)?)))
            .collect::<Result<BTreeMap<_, _>>>()?;

        Ok(Self {
            uplink: config.physical_int.clone(),
            oob_prefixes: config.oob.prefixes.clone(),
            namespaces,
            toolbox,
            workers: config.settings.workers.max(1),
        })
    }

    /// Override the worker count (at least 1)
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn len(&self) -> usize {
        self.namespaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.namespaces.is_empty()
    }

    fn wants_oob(&self) -> bool {
        self.namespaces.values().any(|ns| ns.oob)
    }

    /// Create every veth pair in root ahead of the per-namespace moves
    ///
    /// A veth is left alone if it is already in root, or inside its namespace
    /// when that namespace exists. Returns the number of failures.
    pub fn setup_all_veths(&self) -> usize {
        let tb = &self.toolbox;
        let mut errors = 0;

        for ns in self.namespaces.values() {
            for iface in ns.interfaces.values().filter(|i| i.is_veth()) {
                let present = iface.exists(tb, None).and_then(|in_root| {
                    if in_root || !tb.netns_exists(&ns.name) {
                        return Ok(in_root);
                    }
                    iface.exists(tb, Some(ns.name.as_str()))
                });

                let result = match present {
                    Ok(true) => {
                        debug!(ns = %ns.name, "Veth {} already exists", iface.name);
                        Ok(())
                    }
                    Ok(false) => iface.create(tb),
                    Err(e) => Err(e),
                };

                if let Err(e) = result {
                    error!(ns = %ns.name, "{}", e);
                    errors += 1;
                }
            }
        }

        errors
    }

    fn global_oob_interface(&self) -> Result<Interface> {
        let uplink = self
            .uplink
            .as_deref()
            .ok_or_else(|| Error::MissingUplink(oob::GLOBAL_OOB_INTERFACE.to_string()))?;
        let addrs = oob::addresses(&self.oob_prefixes, oob::HOST_OOB_ID)?;

        Ok(Interface::macvlan(
            oob::GLOBAL_OOB_INTERFACE,
            uplink,
            DEFAULT_MACVLAN_MODE,
            addrs,
        ))
    }

    /// Create, address and raise the host-side OOB macvlan
    ///
    /// Only done when some namespace enables OOB. Returns the number of failures.
    pub fn setup_global_oob(&self) -> usize {
        if !self.wants_oob() {
            debug!("No namespace uses OOB, skipping {}", oob::GLOBAL_OOB_INTERFACE);
            return 0;
        }

        let tb = &self.toolbox;
        let iface = match self.global_oob_interface() {
            Ok(iface) => iface,
            Err(e) => {
                error!("{}", e);
                return 1;
            }
        };

        let created = iface.exists(tb, None).and_then(|exists| {
            if exists {
                debug!("{} already exists", iface.name);
                Ok(())
            } else {
                iface.create(tb)
            }
        });
        if let Err(e) = created {
            error!("{}", e);
            return 1;
        }

        let mut errors = iface.add_prefixes(tb, None);
        match iface.set_link_up(tb, None) {
            Ok(true) => {}
            Ok(false) => errors.push(Error::CommandFailed {
                command: format!("ip link set up dev {}", iface.name),
                message: "could not bring link up".to_string(),
            }),
            Err(e) => errors.push(e),
        }

        for e in &errors {
            error!("{}", e);
        }
        errors.len()
    }

    /// Remove the host-side OOB macvlan if present
    pub fn delete_global_oob(&self) -> usize {
        let iface = Interface::macvlan(
            oob::GLOBAL_OOB_INTERFACE,
            self.uplink.clone().unwrap_or_default(),
            DEFAULT_MACVLAN_MODE,
            Vec::new(),
        );

        match iface.delete(&self.toolbox, None) {
            Ok(()) => 0,
            Err(e) => {
                error!("{}", e);
                1
            }
        }
    }

    /// Run `op` once per namespace on the worker pool and sum the failures
    ///
    /// Every namespace is attempted. A panicking task counts as one failure.
    fn fan_out<F>(&mut self, op: F) -> usize
    where
        F: Fn(&mut Namespace, &Toolbox) -> usize + Sync,
    {
        if self.is_empty() {
            return 0;
        }
        let workers = self.workers.min(self.namespaces.len());
        let tb = &self.toolbox;

        let (tx, rx) = channel::unbounded::<&mut Namespace>();
        for ns in self.namespaces.values_mut() {
            if tx.send(ns).is_err() {
                break;
            }
        }
        drop(tx);

        let op = &op;
        let joined = crossbeam::scope(|s| {
            let handles: Vec<_> = (0..workers)
                .map(|_| {
                    let rx = rx.clone();
                    s.spawn(move |_| {
                        let mut errors = 0;
                        for ns in rx.iter() {
                            let name = ns.name.clone();
                            errors += panic::catch_unwind(AssertUnwindSafe(|| op(ns, tb)))
                                .unwrap_or_else(|_| {
                                    error!(ns = %name, "Namespace task panicked");
                                    1
                                });
                        }
                        errors
                    })
                })
                .collect();

            handles
                .into_iter()
                .map(|h| h.join().unwrap_or(1))
                .sum::<usize>()
        });

        joined.unwrap_or_else(|_| {
            error!("Worker pool panicked");
            1
        })
    }

    /// Bring the whole topology up; returns the number of failures
    pub fn create(&mut self) -> usize {
        info!(
            "Creating {} namespace(s) with {} worker(s)",
            self.namespaces.len(),
            self.workers
        );

        let mut errors = self.setup_all_veths();
        errors += self.setup_global_oob();
        errors += self.fan_out(|ns, tb| ns.setup(tb).len());

        for ns in self.namespaces.values() {
            debug!(ns = %ns.name, state = ?ns.state(), "Setup finished");
        }
        info!("Create finished with {} error(s)", errors);
        errors
    }

    /// Tear the whole topology down; returns the number of failures
    pub fn delete(&mut self) -> usize {
        info!("Deleting {} namespace(s)", self.namespaces.len());

        let mut errors = self.delete_global_oob();
        errors += self.fan_out(|ns, tb| {
            let mut failures = match ns.delete(tb) {
                Ok(()) => 0,
                Err(e) => {
                    error!(ns = %ns.name, "{}", e);
                    1
                }
            };
            for e in ns.remove_stray_links(tb) {
                error!(ns = %ns.name, "{}", e);
                failures += 1;
            }
            failures
        });

        info!("Delete finished with {} error(s)", errors);
        errors
    }

    /// Print diagnostics for each namespace in name order
    pub fn check(&self, out: &mut impl Write) -> Result<()> {
        for ns in self.namespaces.values() {
            ns.check(&self.toolbox, out)?;
            writeln!(out)?;
        }
        Ok(())
    }

    /// Run an action, refusing mutating ones without privilege
    ///
    /// The privilege check happens before any command is issued.
    pub fn run(&mut self, action: Action, privileged: bool, out: &mut impl Write) -> Result<usize> {
        if action.mutates() && !privileged {
            return Err(Error::NotPrivileged(action.to_string()));
        }

        match action {
            Action::Create => Ok(self.create()),
            Action::Delete => Ok(self.delete()),
            Action::Check => {
                self.check(out)?;
                Ok(0)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest;
    use crate::test_helpers::{
        MockRunner, default_response, failed, kernel_responder, sample_config, settings, toolbox,
    };
    use std::path::Path;
    use std::sync::Arc;

    fn topology(config: &TopologyConfig, runner: Arc<MockRunner>, dir: &Path) -> Topology {
        Topology::new(config, toolbox(runner, dir)).unwrap()
    }

    fn generated(count: u32, dir: &Path) -> TopologyConfig {
        let mut config = manifest::generate(count).unwrap();
        config.settings = settings(dir);
        config
    }

    fn position(commands: &[String], command: &str) -> usize {
        commands
            .iter()
            .position(|c| c == command)
            .unwrap_or_else(|| panic!("missing command: {command}"))
    }

    #[test]
    fn test_veths_created_before_any_move() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner::with_responder(kernel_responder(dir.path())));
        let mut topo = topology(&sample_config(dir.path()), runner.clone(), dir.path());

        assert_eq!(topo.create(), 0);

        let commands = runner.commands();
        let creates = [
            position(&commands, "link add left0 type veth peer name left0p"),
            position(&commands, "link add right0 type veth peer name right0p"),
        ];
        let moves = [
            position(&commands, "link set left0 netns left"),
            position(&commands, "link set right0 netns right"),
        ];
        assert!(creates.iter().max() < moves.iter().min());

        // Veths are created once, during pre-creation
        let veth_adds = commands
            .iter()
            .filter(|c| c.contains("type veth"))
            .count();
        assert_eq!(veth_adds, 2);
    }

    #[test]
    fn test_create_builds_oob() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner::with_responder(kernel_responder(dir.path())));
        let mut topo = topology(&sample_config(dir.path()), runner.clone(), dir.path());

        assert_eq!(topo.create(), 0);

        let commands = runner.commands();
        let host = position(&commands, "link add oob0 link eth0 type macvlan mode bridge");
        let ns_oob = position(&commands, "link add oob1 link eth0 type macvlan mode bridge");
        assert!(host < ns_oob);
        assert!(commands.contains(&"addr add fddd::/64 dev oob0".to_string()));
        assert!(commands.contains(&"addr add 10.255.255.0/24 dev oob0".to_string()));
        assert!(commands.contains(&"addr add fddd::1/64 dev oob1".to_string()));
        // right has OOB disabled
        assert!(!commands.iter().any(|c| c.contains("oob2")));
    }

    #[test]
    fn test_global_oob_skipped_without_oob_namespaces() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = sample_config(dir.path());
        for ns in config.namespaces.values_mut() {
            ns.oob = false;
        }
        let runner = Arc::new(MockRunner::with_responder(kernel_responder(dir.path())));
        let topo = topology(&config, runner.clone(), dir.path());

        assert_eq!(topo.setup_global_oob(), 0);
        assert_eq!(runner.count(), 0);
    }

    #[test]
    fn test_create_twice_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner::with_responder(kernel_responder(dir.path())));
        let config = sample_config(dir.path());

        assert_eq!(topology(&config, runner.clone(), dir.path()).create(), 0);
        let first = runner.count();

        assert_eq!(topology(&config, runner.clone(), dir.path()).create(), 0);
        let second: Vec<String> = runner.commands().split_off(first);
        assert!(!second.iter().any(|c| c.starts_with("link add")));
        assert!(!second.iter().any(|c| c.starts_with("netns add")));
        assert!(!second.iter().any(|c| c.starts_with("link set") && c.contains(" netns ")));
    }

    #[test]
    fn test_one_failed_namespace_counts_once() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = kernel_responder(dir.path());
        let runner = Arc::new(MockRunner::with_responder(move |argv, netns| {
            if argv.join(" ").ends_with("netns add ns2") {
                return failed(1, "Cannot create namespace file \"/run/netns/ns2\"");
            }
            kernel(argv, netns)
        }));
        let mut topo = topology(&generated(3, dir.path()), runner, dir.path()).workers(3);

        assert_eq!(topo.create(), 1);
        assert!(dir.path().join("ns1").exists());
        assert!(!dir.path().join("ns2").exists());
        assert!(dir.path().join("ns3").exists());
    }

    #[test]
    fn test_parallel_create_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner::with_responder(kernel_responder(dir.path())));
        let config = generated(6, dir.path());

        let mut topo = topology(&config, runner.clone(), dir.path()).workers(4);
        assert_eq!(topo.create(), 0);
        for idx in 1..=6 {
            assert!(dir.path().join(format!("ns{idx}")).exists());
        }

        assert_eq!(topo.delete(), 0);
        for idx in 1..=6 {
            assert!(!dir.path().join(format!("ns{idx}")).exists());
        }

        let commands = runner.commands();
        let oob_del = position(&commands, "link del oob0");
        let first_ns_del = commands
            .iter()
            .position(|c| c.starts_with("netns del"))
            .unwrap();
        assert!(oob_del < first_ns_del);
    }

    #[test]
    fn test_delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner::with_responder(kernel_responder(dir.path())));
        let mut topo = topology(&sample_config(dir.path()), runner.clone(), dir.path());

        assert_eq!(topo.delete(), 0);
        assert!(!runner.commands().iter().any(|c| c.starts_with("netns del")));
        assert!(!runner.commands().iter().any(|c| c.starts_with("link del")));
    }

    #[test]
    fn test_panicking_namespace_counts_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = generated(3, dir.path());
        for ns in config.namespaces.values_mut() {
            ns.oob = false;
        }
        let runner = Arc::new(MockRunner::with_responder(|argv, netns| {
            if argv.join(" ").ends_with("netns add ns2") {
                panic!("runner blew up");
            }
            default_response(argv, netns)
        }));
        let mut topo = topology(&config, runner.clone(), dir.path());

        assert_eq!(topo.create(), 1);
        // Siblings still ran on the single worker
        let commands = runner.commands();
        assert!(commands.contains(&"netns add ns1".to_string()));
        assert!(commands.contains(&"netns add ns3".to_string()));
    }

    #[test]
    fn test_unprivileged_mutations_issue_no_commands() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner::new());
        let mut topo = topology(&sample_config(dir.path()), runner.clone(), dir.path());
        let mut out = Vec::new();

        for action in [Action::Create, Action::Delete] {
            let err = topo.run(action, false, &mut out).unwrap_err();
            assert!(matches!(err, Error::NotPrivileged(_)));
        }
        assert_eq!(runner.count(), 0);
    }

    #[test]
    fn test_check_is_ordered_and_unprivileged() {
        let dir = tempfile::tempdir().unwrap();
        crate::test_helpers::register_netns(dir.path(), "left");
        crate::test_helpers::register_netns(dir.path(), "right");
        let runner = Arc::new(MockRunner::new());
        let mut topo = topology(&sample_config(dir.path()), runner.clone(), dir.path());

        let mut out = Vec::new();
        assert_eq!(topo.run(Action::Check, false, &mut out).unwrap(), 0);
        let text = String::from_utf8(out).unwrap();

        let left = text.find("== left (id 1): addresses ==").unwrap();
        let right = text.find("== right (id 2): addresses ==").unwrap();
        assert!(left < right);
        assert_eq!(runner.count(), 6);
    }

    #[test]
    fn test_zero_id_fails_construction() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = sample_config(dir.path());
        config.namespaces.get_mut("right").unwrap().id = 0;
        let runner = Arc::new(MockRunner::new());

        assert!(Topology::new(&config, toolbox(runner.clone(), dir.path())).is_err());
        assert_eq!(runner.count(), 0);
    }

    #[test]
    fn test_veth_inside_existing_namespace_not_recreated() {
        let dir = tempfile::tempdir().unwrap();
        crate::test_helpers::register_netns(dir.path(), "left");
        let runner = Arc::new(MockRunner::with_responder(|argv, netns| {
            // left0 lives inside left; nothing else exists
            if netns == Some("left") && argv.last().is_some_and(|a| a == "left0") {
                return crate::test_helpers::ok("");
            }
            default_response(argv, netns)
        }));
        let topo = topology(&sample_config(dir.path()), runner.clone(), dir.path());

        assert_eq!(topo.setup_all_veths(), 0);
        let commands = runner.commands();
        assert!(!commands.contains(&"link add left0 type veth peer name left0p".to_string()));
        assert!(commands.contains(&"link add right0 type veth peer name right0p".to_string()));
    }
}

//! Network namespace lifecycle
//!
//! A namespace owns its interfaces, routes and OOB settings and drives them
//! through create, link setup, OOB, and routes. Lifecycle progress is tracked
//! with a dynamic state machine.

use crate::error::{Error, Result};
use crate::manifest::{NamespaceDef, TopologyConfig};
use crate::network::interface::{DEFAULT_MACVLAN_MODE, Interface, LOOPBACK_NAME};
use crate::network::oob;
use crate::network::route::Route;
use crate::runner::Toolbox;
use ipnet::IpNet;
use std::collections::BTreeMap;
use std::io::Write;
use tracing::{debug, error, info, warn};

mod state;

pub use state::State;
use state::{DynamicNamespaceMachine, NamespaceMachine, NamespaceMachineEvent};

/// Diagnostic sections printed by `check`
const CHECK_SECTIONS: &[(&str, &[&str])] = &[
    ("addresses", &["addr", "show"]),
    ("IPv4 routes", &["-4", "route", "show"]),
    ("IPv6 routes", &["-6", "route", "show"]),
];

pub struct Namespace {
    pub name: String,
    /// Numeric id (>= 1); 0 belongs to the host
    pub id: u32,
    /// Always holds a loopback entry
    pub interfaces: BTreeMap<String, Interface>,
    pub routes: Vec<Route>,
    pub oob: bool,
    pub oob_prefixes: Vec<IpNet>,
    pub uplink: Option<String>,
    machine: DynamicNamespaceMachine<()>,
}

impl Namespace {
    /// Build from config
    ///
    /// Fails before any kernel state exists if the id is 0 or OOB is enabled
    /// without global prefixes.
    pub fn new(name: &str, def: &NamespaceDef, config: &TopologyConfig) -> Result<Self> {
        if def.id == 0 {
            return Err(Error::ConfigValidation(format!(
                "Namespace '{}' has id 0 (reserved for the host)",
                name
            )));
        }
        if def.oob && config.oob.prefixes.is_empty() {
            return Err(Error::ConfigValidation(format!(
                "Namespace '{}' enables OOB but no OOB prefixes are configured",
                name
            )));
        }

        let uplink = config.physical_int.as_deref();
        let mut interfaces = BTreeMap::new();
        for (if_name, if_def) in &def.interfaces {
            let iface = Interface::from_def(if_name, if_def, uplink)?;
            interfaces.insert(iface.name.clone(), iface);
        }
        interfaces
            .entry(LOOPBACK_NAME.to_string())
            .or_insert_with(|| Interface::loopback(Vec::new()));

        let routes = def
            .routes
            .iter()
            .map(|(route_name, route_def)| Route::new(route_name, name, route_def))
            .collect();

        Ok(Self {
            name: name.to_string(),
            id: def.id,
            interfaces,
            routes,
            oob: def.oob,
            oob_prefixes: config.oob.prefixes.clone(),
            uplink: uplink.map(str::to_string),
            machine: NamespaceMachine::new(()).into_dynamic(),
        })
    }

    pub fn state(&self) -> State {
        State::from_machine(self.machine.current_state())
    }

    fn advance(&mut self, event: NamespaceMachineEvent, label: &str) {
        if self.machine.handle(event).is_err() {
            debug!(
                ns = %self.name,
                "No {} transition from {}",
                label,
                self.machine.current_state()
            );
        }
    }

    /// Add the kernel namespace unless its registry entry already exists
    pub fn create(&mut self, tb: &Toolbox) -> Result<()> {
        if tb.netns_exists(&self.name) {
            info!("Namespace {} already exists", self.name);
        } else {
            let out = tb.ip(&["netns", "add", self.name.as_str()], None)?;
            if !out.success() {
                return Err(Error::CreateFailed {
                    what: format!("namespace {}", self.name),
                    message: out.failure_message(),
                });
            }
            info!("Created namespace {}", self.name);
        }

        self.advance(NamespaceMachineEvent::Create, "create");
        Ok(())
    }

    /// Delete the kernel namespace if its registry entry exists
    ///
    /// Links moved into the namespace go with it.
    pub fn delete(&mut self, tb: &Toolbox) -> Result<()> {
        if !tb.netns_exists(&self.name) {
            info!("Namespace {} does not exist", self.name);
            return Ok(());
        }

        let out = tb.ip(&["netns", "del", self.name.as_str()], None)?;
        if !out.success() {
            return Err(Error::DeleteFailed {
                what: format!("namespace {}", self.name),
                message: out.failure_message(),
            });
        }
        info!("Deleted namespace {}", self.name);

        self.advance(NamespaceMachineEvent::Remove, "remove");
        Ok(())
    }

    /// Remove veths of this namespace that were left behind in root
    ///
    /// A veth that never made it into the namespace survives its deletion.
    pub fn remove_stray_links(&self, tb: &Toolbox) -> Vec<Error> {
        self.interfaces
            .values()
            .filter(|iface| iface.is_veth())
            .filter_map(|iface| iface.delete(tb, None).err())
            .collect()
    }

    /// Make sure `iface` ends up inside this namespace
    ///
    /// A link already inside is left alone. Otherwise it is created in root
    /// if missing, then moved.
    fn attach(&self, tb: &Toolbox, iface: &Interface) -> Result<()> {
        if iface.exists(tb, Some(self.name.as_str()))? {
            debug!(ns = %self.name, "{} already in namespace", iface.name);
            return Ok(());
        }

        if !iface.exists(tb, None)? {
            iface.create(tb)?;
        }

        if !iface.set_namespace(tb, &self.name)? {
            return Err(Error::CreateFailed {
                what: format!("{} {}", iface.kind_name(), iface.name),
                message: format!("could not move into namespace {}", self.name),
            });
        }
        debug!(ns = %self.name, "Moved {} into namespace", iface.name);
        Ok(())
    }

    /// Assign addresses and bring the link up, collecting failures
    fn configure(&self, tb: &Toolbox, iface: &Interface) -> Vec<Error> {
        let mut errors = iface.add_prefixes(tb, Some(self.name.as_str()));

        match iface.set_link_up(tb, Some(self.name.as_str())) {
            Ok(true) => debug!(ns = %self.name, "{} is up", iface.name),
            Ok(false) => errors.push(Error::CommandFailed {
                command: format!("ip link set up dev {} (in {})", iface.name, self.name),
                message: "could not bring link up".to_string(),
            }),
            Err(e) => errors.push(e),
        }

        errors
    }

    /// Create, move, address and raise every owned interface
    ///
    /// Interfaces are independent; a failure on one does not skip the rest.
    pub fn setup_links(&self, tb: &Toolbox) -> Vec<Error> {
        let mut errors = Vec::new();

        for iface in self.interfaces.values() {
            if !iface.is_loopback()
                && let Err(e) = self.attach(tb, iface)
            {
                errors.push(e);
                continue;
            }
            errors.extend(self.configure(tb, iface));
        }

        errors
    }

    /// This namespace's OOB addresses, one per global prefix, in order
    pub fn oob_addrs(&self) -> Result<Vec<IpNet>> {
        oob::addresses(&self.oob_prefixes, self.id)
    }

    /// Give the namespace its `oob<id>` macvlan if OOB is enabled
    pub fn create_oob(&self, tb: &Toolbox) -> Vec<Error> {
        if !self.oob {
            return Vec::new();
        }

        let Some(uplink) = self.uplink.as_deref() else {
            return vec![Error::MissingUplink(self.name.clone())];
        };
        let addrs = match self.oob_addrs() {
            Ok(addrs) => addrs,
            Err(e) => return vec![e],
        };

        let iface = Interface::macvlan(
            oob::interface_name(self.id),
            uplink,
            DEFAULT_MACVLAN_MODE,
            addrs,
        );
        if let Err(e) = self.attach(tb, &iface) {
            return vec![e];
        }
        self.configure(tb, &iface)
    }

    /// Install every valid route that is not already present
    ///
    /// Invalid routes are skipped and counted.
    pub fn install_routes(&self, tb: &Toolbox) -> Vec<Error> {
        let mut errors = Vec::new();

        for route in &self.routes {
            let argv = match route.install_command(tb) {
                Ok(Some(argv)) => argv,
                Ok(None) => continue,
                Err(e) => {
                    warn!(ns = %self.name, "Skipping route {}: {}", route.name, e);
                    errors.push(e);
                    continue;
                }
            };

            match tb.run(&argv, Some(self.name.as_str())) {
                Ok(out) if out.success() => {
                    info!(ns = %self.name, "Installed route {} ({})", route.name, route.dest_prefix)
                }
                Ok(out) => errors.push(Error::CommandFailed {
                    command: crate::runner::describe(&argv, Some(self.name.as_str())),
                    message: out.failure_message(),
                }),
                Err(e) => errors.push(e),
            }
        }

        errors
    }

    /// Full bring-up: create, links, OOB, routes
    ///
    /// Returns every failure. Nothing past `create` runs if it fails.
    pub fn setup(&mut self, tb: &Toolbox) -> Vec<Error> {
        if let Err(e) = self.create(tb) {
            error!(ns = %self.name, "{}", e);
            return vec![e];
        }

        let mut errors = self.setup_links(tb);
        if errors.is_empty() {
            self.advance(NamespaceMachineEvent::Link, "link");
        }

        errors.extend(self.create_oob(tb));
        errors.extend(self.install_routes(tb));
        if errors.is_empty() {
            self.advance(NamespaceMachineEvent::Configure, "configure");
            info!(ns = %self.name, "Namespace {} is configured", self.name);
        }

        for e in &errors {
            error!(ns = %self.name, "{}", e);
        }
        errors
    }

    /// Print addresses and routes as seen inside the namespace
    ///
    /// A failed inspection is reported in its section; the rest still run.
    pub fn check(&self, tb: &Toolbox, out: &mut impl Write) -> Result<()> {
        if !tb.netns_exists(&self.name) {
            writeln!(out, "== {} (id {}): namespace does not exist ==", self.name, self.id)?;
            return Ok(());
        }

        for (label, args) in CHECK_SECTIONS {
            writeln!(out, "== {} (id {}): {} ==", self.name, self.id, label)?;
            match tb.ip(args, Some(self.name.as_str())) {
                Ok(result) if result.success() => write!(out, "{}", result.stdout)?,
                Ok(result) => writeln!(out, "!! inspection failed: {}", result.failure_message())?,
                Err(e) => writeln!(out, "!! inspection failed: {}", e)?,
            }
        }

        Ok(())
    }
}

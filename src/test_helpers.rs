//! Shared fixtures for unit tests
//!
//! `MockRunner` records every invocation and answers from a scripted
//! responder, so orchestration can be tested without touching the kernel.

use crate::error::Result;
use crate::manifest::{Settings, TopologyConfig};
use crate::runner::{CommandOutput, CommandRunner, Toolbox};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

pub const SAMPLE_CONFIG: &str = include_str!("../sample.json");

/// One recorded command
#[derive(Debug, Clone)]
pub struct Invocation {
    pub argv: Vec<String>,
    pub netns: Option<String>,
    pub capture: bool,
}

impl Invocation {
    /// Arguments after the program path, space-joined
    pub fn command(&self) -> String {
        self.argv.get(1..).unwrap_or_default().join(" ")
    }
}

type Responder = Box<dyn Fn(&[String], Option<&str>) -> CommandOutput + Send + Sync>;

pub struct MockRunner {
    calls: Mutex<Vec<Invocation>>,
    responder: Responder,
}

impl MockRunner {
    /// Every link is absent; every other command succeeds with no output
    pub fn new() -> Self {
        Self::with_responder(default_response)
    }

    pub fn with_responder<F>(responder: F) -> Self
    where
        F: Fn(&[String], Option<&str>) -> CommandOutput + Send + Sync + 'static,
    {
        Self {
            calls: Mutex::new(Vec::new()),
            responder: Box::new(responder),
        }
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.calls().iter().map(Invocation::command).collect()
    }

    pub fn count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl Default for MockRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRunner for MockRunner {
    fn run(&self, argv: &[String], netns: Option<&str>, capture: bool) -> Result<CommandOutput> {
        self.calls.lock().unwrap().push(Invocation {
            argv: argv.to_vec(),
            netns: netns.map(str::to_string),
            capture,
        });
        Ok((self.responder)(argv, netns))
    }
}

/// `ip link show` reports absent; everything else succeeds
pub fn default_response(argv: &[String], _netns: Option<&str>) -> CommandOutput {
    if is_link_show(argv) {
        return not_found(argv.last().map(String::as_str).unwrap_or_default());
    }
    ok("")
}

/// A responder that tracks links and namespaces like a small kernel
///
/// `eth0` exists in root. `netns add/del` maintain entries in `netns_dir`.
/// Links are keyed by (scope, name) and move between scopes on
/// `link set <name> netns <ns>`.
pub fn kernel_responder(
    netns_dir: &Path,
) -> impl Fn(&[String], Option<&str>) -> CommandOutput + Send + Sync + 'static {
    let dir = netns_dir.to_path_buf();
    let links: Mutex<HashSet<(Option<String>, String)>> =
        Mutex::new(HashSet::from([(None, "eth0".to_string())]));

    move |argv: &[String], netns: Option<&str>| -> CommandOutput {
        let args: Vec<&str> = argv.iter().skip(1).map(String::as_str).collect();
        let scope = netns.map(str::to_string);
        let mut links = links.lock().unwrap();

        match args.as_slice() {
            ["netns", "add", name] => {
                fs::write(dir.join(name), b"").unwrap();
                ok("")
            }
            ["netns", "del", name] => {
                fs::remove_file(dir.join(name)).unwrap();
                links.retain(|(s, _)| s.as_deref() != Some(*name));
                ok("")
            }
            ["link", "show", "dev", name] => {
                if links.contains(&(scope, name.to_string())) {
                    ok("")
                } else {
                    not_found(name)
                }
            }
            ["link", "add", name, "type", "veth", "peer", "name", peer] => {
                links.insert((scope.clone(), name.to_string()));
                links.insert((scope, peer.to_string()));
                ok("")
            }
            ["link", "add", name, "link", ..] => {
                links.insert((scope, name.to_string()));
                ok("")
            }
            ["link", "set", name, "netns", ns] => {
                if links.remove(&(None, name.to_string())) {
                    links.insert((Some(ns.to_string()), name.to_string()));
                    ok("")
                } else {
                    failed(1, "Cannot find device")
                }
            }
            ["link", "del", name] => {
                links.remove(&(scope, name.to_string()));
                ok("")
            }
            _ => ok(""),
        }
    }
}

pub fn is_link_show(argv: &[String]) -> bool {
    argv.windows(2).any(|w| w[0] == "link" && w[1] == "show")
}

pub fn ok(stdout: &str) -> CommandOutput {
    CommandOutput {
        exit_code: Some(0),
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

pub fn not_found(link: &str) -> CommandOutput {
    CommandOutput {
        exit_code: Some(1),
        stdout: String::new(),
        stderr: format!("Device \"{}\" does not exist.\n", link),
    }
}

pub fn failed(code: i32, stderr: &str) -> CommandOutput {
    CommandOutput {
        exit_code: Some(code),
        stdout: String::new(),
        stderr: format!("{}\n", stderr),
    }
}

/// Settings pointing the namespace registry at a scratch directory
pub fn settings(netns_dir: &Path) -> Settings {
    Settings {
        netns_dir: netns_dir.to_path_buf(),
        ..Settings::default()
    }
}

pub fn toolbox(runner: Arc<MockRunner>, netns_dir: &Path) -> Toolbox {
    Toolbox::new(runner, &settings(netns_dir))
}

/// Mark a namespace as present in the scratch registry
pub fn register_netns(netns_dir: &Path, name: &str) {
    std::fs::write(netns_dir.join(name), b"").unwrap();
}

/// The bundled two-namespace sample with its registry moved to `netns_dir`
pub fn sample_config(netns_dir: &Path) -> TopologyConfig {
    let mut config: TopologyConfig = serde_json::from_str(SAMPLE_CONFIG).unwrap();
    config.settings = settings(netns_dir);
    config
}

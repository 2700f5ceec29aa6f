//! External command execution
//!
//! Provides:
//! - The `CommandRunner` seam every kernel change goes through
//! - `SystemRunner`, which spawns processes with timeout enforcement
//! - `Toolbox`, which builds `ip` invocations and answers namespace
//!   registry lookups

use crate::error::{Error, Result};
use crate::manifest::Settings;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

/// Result of a finished command
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Exit code (None if killed by a signal)
    pub exit_code: Option<i32>,
    /// Standard output (empty unless captured)
    pub stdout: String,
    /// Standard error (empty unless captured)
    pub stderr: String,
}

impl CommandOutput {
    /// Whether the command exited 0
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Short description of a failure for error messages
    pub fn failure_message(&self) -> String {
        let stderr = self.stderr.trim();
        match (self.exit_code, stderr.is_empty()) {
            (Some(code), true) => format!("exit {}", code),
            (Some(code), false) => format!("exit {}: {}", code, stderr),
            (None, true) => "killed by signal".to_string(),
            (None, false) => format!("killed by signal: {}", stderr),
        }
    }
}

/// Executes external commands, optionally inside a named network namespace
///
/// Implementations must not interpret what they run.
pub trait CommandRunner: Send + Sync {
    fn run(&self, argv: &[String], netns: Option<&str>, capture: bool) -> Result<CommandOutput>;
}

/// Runs commands on the host with `std::process`
///
/// Namespace scoping is done here and only here, by prefixing
/// `<ip> netns exec <ns>`.
#[derive(Debug, Clone)]
pub struct SystemRunner {
    ip_path: String,
    timeout_secs: u64,
}

impl SystemRunner {
    pub fn new(settings: &Settings) -> Self {
        Self {
            ip_path: settings.ip_path.display().to_string(),
            timeout_secs: settings.command_timeout,
        }
    }

    fn scoped(&self, argv: &[String], netns: Option<&str>) -> Vec<String> {
        match netns {
            Some(ns) => {
                let mut full = vec![
                    self.ip_path.clone(),
                    "netns".to_string(),
                    "exec".to_string(),
                    ns.to_string(),
                ];
                full.extend_from_slice(argv);
                full
            }
            None => argv.to_vec(),
        }
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, argv: &[String], netns: Option<&str>, capture: bool) -> Result<CommandOutput> {
        let full = self.scoped(argv, netns);
        let command = full.join(" ");
        let (program, args) = full.split_first().ok_or_else(|| Error::CommandFailed {
            command: String::new(),
            message: "Empty command".to_string(),
        })?;

        match netns {
            Some(ns) => debug!(ns = %ns, "Running: {}", command),
            None => debug!("Running: {}", command),
        }

        let output = |capture: bool| if capture { Stdio::piped() } else { Stdio::null() };
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(output(capture))
            .stderr(output(capture))
            .spawn()
            .map_err(|e| Error::CommandFailed {
                command: command.clone(),
                message: e.to_string(),
            })?;

        // Drain pipes while waiting so a chatty command cannot fill them and stall
        let stdout_reader = child.stdout.take().map(spawn_reader);
        let stderr_reader = child.stderr.take().map(spawn_reader);

        let timeout = Duration::from_secs(self.timeout_secs);
        let start = Instant::now();
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if self.timeout_secs > 0 && start.elapsed() > timeout {
                        let _ = child.kill();
                        // Reap after kill
                        let _ = child.wait();
                        return Err(Error::CommandTimeout {
                            command,
                            secs: self.timeout_secs,
                        });
                    }
                    thread::sleep(Duration::from_millis(10));
                }
                Err(e) => {
                    return Err(Error::CommandFailed {
                        command,
                        message: format!("Failed to wait on process: {}", e),
                    });
                }
            }
        };

        Ok(CommandOutput {
            exit_code: status.code(),
            stdout: join_reader(stdout_reader),
            stderr: join_reader(stderr_reader),
        })
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut handle: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = handle.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn join_reader(reader: Option<thread::JoinHandle<String>>) -> String {
    reader
        .and_then(|r| r.join().ok())
        .unwrap_or_default()
}

/// Shared handle to the command runner plus the settings needed to drive `ip`
#[derive(Clone)]
pub struct Toolbox {
    runner: Arc<dyn CommandRunner>,
    ip_path: String,
    netns_dir: PathBuf,
}

impl Toolbox {
    pub fn new(runner: Arc<dyn CommandRunner>, settings: &Settings) -> Self {
        Self {
            runner,
            ip_path: settings.ip_path.display().to_string(),
            netns_dir: settings.netns_dir.clone(),
        }
    }

    /// Build an `ip` argv
    pub fn ip_argv(&self, args: &[&str]) -> Vec<String> {
        std::iter::once(self.ip_path.clone())
            .chain(args.iter().map(|a| a.to_string()))
            .collect()
    }

    /// Run a prepared argv, capturing output
    pub fn run(&self, argv: &[String], netns: Option<&str>) -> Result<CommandOutput> {
        self.runner.run(argv, netns, true)
    }

    /// Run `ip <args>`, capturing output
    pub fn ip(&self, args: &[&str], netns: Option<&str>) -> Result<CommandOutput> {
        self.run(&self.ip_argv(args), netns)
    }

    /// Run `ip <args>` with output discarded, reporting only success
    pub fn ip_status(&self, args: &[&str], netns: Option<&str>) -> Result<bool> {
        self.runner
            .run(&self.ip_argv(args), netns, false)
            .map(|out| out.success())
    }

    /// Run `ip <args>` and turn a non-zero exit into an error
    pub fn ip_checked(&self, args: &[&str], netns: Option<&str>) -> Result<CommandOutput> {
        let argv = self.ip_argv(args);
        let out = self.run(&argv, netns)?;
        if !out.success() {
            return Err(Error::CommandFailed {
                command: describe(&argv, netns),
                message: out.failure_message(),
            });
        }
        Ok(out)
    }

    /// Registry path of a named namespace
    pub fn netns_path(&self, name: &str) -> PathBuf {
        self.netns_dir.join(name)
    }

    /// A namespace exists iff its registry entry exists
    pub fn netns_exists(&self, name: &str) -> bool {
        self.netns_path(name).exists()
    }
}

/// Render an argv and its scope for logs and errors
pub fn describe(argv: &[String], netns: Option<&str>) -> String {
    match netns {
        Some(ns) => format!("{} (in {})", argv.join(" "), ns),
        None => argv.join(" "),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::MockRunner;

    fn settings_with_timeout(secs: u64) -> Settings {
        Settings {
            command_timeout: secs,
            ..Settings::default()
        }
    }

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|a| a.to_string()).collect()
    }

    #[test]
    fn test_scoped_prefixes_netns_exec_once() {
        let runner = SystemRunner::new(&Settings::default());
        let scoped = runner.scoped(&argv(&["/usr/sbin/ip", "addr", "show"]), Some("left"));
        assert_eq!(
            scoped,
            argv(&["/usr/sbin/ip", "netns", "exec", "left", "/usr/sbin/ip", "addr", "show"])
        );

        let unscoped = runner.scoped(&argv(&["/usr/sbin/ip", "link", "show"]), None);
        assert_eq!(unscoped, argv(&["/usr/sbin/ip", "link", "show"]));
    }

    #[test]
    fn test_system_runner_captures_output() {
        let runner = SystemRunner::new(&settings_with_timeout(10));
        let out = runner
            .run(&argv(&["/bin/sh", "-c", "echo out; echo err >&2; exit 3"]), None, true)
            .unwrap();
        assert_eq!(out.exit_code, Some(3));
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
        assert!(!out.success());
        assert_eq!(out.failure_message(), "exit 3: err");
    }

    #[test]
    fn test_system_runner_discards_output() {
        let runner = SystemRunner::new(&settings_with_timeout(10));
        let out = runner
            .run(&argv(&["/bin/sh", "-c", "echo hidden"]), None, false)
            .unwrap();
        assert!(out.success());
        assert!(out.stdout.is_empty());
    }

    #[test]
    fn test_system_runner_spawn_failure() {
        let runner = SystemRunner::new(&Settings::default());
        let err = runner
            .run(&argv(&["/nonexistent/binary12345"]), None, true)
            .unwrap_err();
        assert!(matches!(err, Error::CommandFailed { .. }));
    }

    #[test]
    fn test_system_runner_timeout() {
        let runner = SystemRunner::new(&settings_with_timeout(1));
        let err = runner
            .run(&argv(&["/bin/sh", "-c", "sleep 5"]), None, true)
            .unwrap_err();
        assert!(matches!(err, Error::CommandTimeout { secs: 1, .. }));
    }

    #[test]
    fn test_toolbox_ip_checked_reports_stderr() {
        let runner = Arc::new(MockRunner::with_responder(|_, _| CommandOutput {
            exit_code: Some(2),
            stdout: String::new(),
            stderr: "RTNETLINK answers: File exists\n".to_string(),
        }));
        let toolbox = Toolbox::new(runner.clone(), &Settings::default());

        let err = toolbox.ip_checked(&["link", "add", "x"], Some("left")).unwrap_err();
        match err {
            Error::CommandFailed { command, message } => {
                assert_eq!(command, "/usr/sbin/ip link add x (in left)");
                assert_eq!(message, "exit 2: RTNETLINK answers: File exists");
            }
            other => panic!("unexpected error: {other}"),
        }

        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].netns.as_deref(), Some("left"));
    }

    #[test]
    fn test_toolbox_netns_registry() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            netns_dir: dir.path().to_path_buf(),
            ..Settings::default()
        };
        let toolbox = Toolbox::new(Arc::new(MockRunner::new()), &settings);

        assert!(!toolbox.netns_exists("left"));
        std::fs::write(dir.path().join("left"), b"").unwrap();
        assert!(toolbox.netns_exists("left"));
        assert_eq!(toolbox.netns_path("left"), dir.path().join("left"));
    }
}

//! nsfleet - Linux network namespace topology builder
//!
//! Builds and tears down network namespaces, veth pairs, macvlans, OOB
//! management interfaces and static routes from a declarative topology file.

mod cli;
mod error;
mod manifest;
mod network;
mod runner;
mod topology;

#[cfg(test)]
mod test_helpers;

use cli::{Cli, Commands};
use error::{Error, ExitStatus, Result};
use manifest::TopologyConfig;
use network::Route;
use runner::{SystemRunner, Toolbox};
use std::fs;
use std::io::{self, Write};
use std::sync::Arc;
use topology::Topology;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

fn main() {
    let cli = Cli::parse_args();
    init_logging(cli.debug);
    debug!("Starting nsfleet {}", env!("CARGO_PKG_VERSION"));

    let status = match run(cli) {
        Ok(status) => status,
        Err(e) => {
            error!("{}", e);
            ExitStatus::from(&e)
        }
    };

    std::process::exit(status.code());
}

fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<ExitStatus> {
    let Some(action) = cli.command.action() else {
        return run_offline(cli);
    };

    let mut config = manifest::load(&cli.config)?;
    if let Some(timeout) = cli.timeout {
        config.settings.command_timeout = timeout;
    }

    if config.namespaces.is_empty() {
        warn!("No namespaces defined in {}", cli.config.display());
        return Ok(ExitStatus::NothingToDo);
    }

    let runner = Arc::new(SystemRunner::new(&config.settings));
    let toolbox = Toolbox::new(runner, &config.settings);
    let mut topology = Topology::new(&config, toolbox)?;
    if let Some(workers) = cli.workers {
        topology = topology.workers(workers);
    }
    debug!(
        "Loaded {} namespace(s) from {}",
        topology.len(),
        cli.config.display()
    );

    let privileged = nix::unistd::Uid::effective().is_root();
    let errors = topology.run(action, privileged, &mut io::stdout().lock())?;

    if errors > 0 {
        error!("{} {} operation(s) failed", errors, action);
        return Ok(ExitStatus::OperationsFailed);
    }

    Ok(ExitStatus::Success)
}

/// Commands that never touch the network
fn run_offline(cli: Cli) -> Result<ExitStatus> {
    match cli.command {
        Commands::Completion { shell } => {
            Cli::generate_completion(shell);
            Ok(ExitStatus::Success)
        }
        Commands::Generate {
            count,
            output,
            toml,
        } => {
            let config = manifest::generate(count)?;
            let mut text = if toml {
                toml::to_string_pretty(&config)?
            } else {
                serde_json::to_string_pretty(&config)?
            };
            if !text.ends_with('\n') {
                text.push('\n');
            }

            match output {
                Some(path) => {
                    fs::write(&path, text)?;
                    info!("Wrote {} namespace(s) to {}", count, path.display());
                }
                None => io::stdout().write_all(text.as_bytes())?,
            }
            Ok(ExitStatus::Success)
        }
        Commands::Validate => {
            let config = manifest::load(&cli.config)?;
            let bad_routes = validate_routes(&config);
            if bad_routes > 0 {
                return Err(Error::ConfigValidation(format!(
                    "{} invalid route(s) in {}",
                    bad_routes,
                    cli.config.display()
                )));
            }

            let interfaces: usize = config.namespaces.values().map(|ns| ns.interfaces.len()).sum();
            let routes: usize = config.namespaces.values().map(|ns| ns.routes.len()).sum();
            println!(
                "{}: {} namespace(s), {} interface(s), {} route(s), OK",
                cli.config.display(),
                config.namespaces.len(),
                interfaces,
                routes
            );
            Ok(ExitStatus::Success)
        }
        Commands::Create | Commands::Delete | Commands::Check => Ok(ExitStatus::NothingToDo),
    }
}

/// Validate every route up front, logging each bad one
fn validate_routes(config: &TopologyConfig) -> usize {
    let mut bad = 0;
    for (ns_name, ns) in &config.namespaces {
        for (route_name, def) in &ns.routes {
            if let Err(e) = Route::new(route_name, ns_name, def).validate() {
                error!("{}", e);
                bad += 1;
            }
        }
    }
    bad
}

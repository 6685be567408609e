//! Testbed CLI - Provision the WinRM HTTPS listener test environment
//!
//! Brings up a Windows domain controller with one HTTPS listener per test
//! certificate and a Linux runner joined to its domain.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use testbed_provision::{Provisioner, TagSelection, TestbedConfig};
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Testbed - Provision WinRM HTTPS listener test hosts
#[derive(Parser, Debug)]
#[command(name = "testbed")]
#[command(about = "Provision WinRM HTTPS listener test hosts", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Enable verbose logging (same as --log-level debug)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Provision the hosts
    #[command(long_about = r#"
Provision the Windows domain controller and the Linux test runner.
Every step checks the current state first, so running it again against
a provisioned environment changes nothing.

EXAMPLES:
  # Everything
  testbed run

  # Only the Linux runner, with an explicit config file
  testbed run --config ./lab/.testbed.yml --tags linux

ENVIRONMENT VARIABLES:
  TESTBED_CONFIG  Configuration file (otherwise discovered)
    "#)]
    Run {
        /// Configuration file
        #[arg(short, long, env = "TESTBED_CONFIG")]
        config: Option<PathBuf>,

        /// Comma separated plays to run (windows, linux, build_artifacts)
        #[arg(short, long)]
        tags: Option<String>,
    },
    /// Show the listener changes a run would make
    Plan {
        /// Configuration file
        #[arg(short, long, env = "TESTBED_CONFIG")]
        config: Option<PathBuf>,
    },
    /// Print the derived endpoint table
    Endpoints {
        /// Configuration file
        #[arg(short, long, env = "TESTBED_CONFIG")]
        config: Option<PathBuf>,
    },
    /// Write a template configuration
    Init {
        /// Where to write it
        #[arg(long, default_value = ".testbed.yml")]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str, verbose: bool) -> Result<()> {
    let log_level = if verbose { "debug" } else { log_level };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

/// Load the config from `path`, or discover it from the current directory
fn load_config(path: Option<PathBuf>) -> Result<(PathBuf, TestbedConfig)> {
    if let Some(path) = path {
        let config = TestbedConfig::load(&path)
            .with_context(|| format!("Failed to load {}", path.display()))?;
        return Ok((path, config));
    }

    TestbedConfig::discover()
        .context("Failed to discover configuration")?
        .context("No .testbed.yml found in this directory or its parents; create one with 'testbed init'")
}

fn provisioner(path: Option<PathBuf>) -> Result<Provisioner> {
    let (path, config) = load_config(path)?;
    debug!(config = %path.display(), "Loaded configuration");
    Provisioner::new(config, &path).context("Invalid endpoint table")
}

async fn handle_run(config: Option<PathBuf>, tags: Option<String>) -> Result<()> {
    let tags = match tags {
        Some(tags) => TagSelection::parse(&tags).context("Invalid --tags")?,
        None => TagSelection::all(),
    };
    let provisioner = provisioner(config)?;

    let recaps = provisioner
        .run(&tags)
        .await
        .context("Provisioning failed")?;

    println!();
    println!("PLAY RECAP");
    for recap in &recaps {
        println!("{}", recap);
    }
    Ok(())
}

async fn handle_plan(config: Option<PathBuf>) -> Result<()> {
    let provisioner = provisioner(config)?;
    let plans = provisioner
        .plan()
        .await
        .context("Failed to compute listener plan")?;

    let pending = plans.iter().filter(|(_, plan)| plan.changed()).count();
    for (endpoint, plan) in &plans {
        if plan.changed() {
            println!("{}:", endpoint);
            for action in &plan.actions {
                println!("  - {}", action);
            }
            if let Some(adapter) = &plan.pending_adapter {
                println!(
                    "  - wait for {} to get an address, then create the listener and port forward",
                    adapter
                );
            }
        } else {
            println!("{}: up to date", endpoint);
        }
    }
    println!();
    println!("{} of {} endpoints would change", pending, plans.len());
    Ok(())
}

fn handle_endpoints(config: Option<PathBuf>) -> Result<()> {
    let provisioner = provisioner(config)?;
    let table = provisioner.table();

    println!(
        "{:<3} {:<26} {:<11} {:>8} {:>8}  {}",
        "#", "NAME", "ALGORITHM", "EXTERNAL", "LISTENER", "ADAPTER"
    );
    for endpoint in table {
        println!(
            "{:<3} {:<26} {:<11} {:>8} {:>8}  {}",
            endpoint.index,
            endpoint.name(),
            endpoint.spec.key_algorithm.as_str(),
            endpoint.external_port,
            endpoint.listener_port,
            endpoint.adapter_name
        );
    }
    Ok(())
}

fn handle_init(path: &Path, force: bool) -> Result<()> {
    TestbedConfig::write_template(path, force)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    info!(path = %path.display(), "Wrote template configuration");
    println!("Created {}", path.display());
    println!("Fill in the domain and host addresses, then run: testbed run");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli.log_level, cli.verbose)?;

    match cli.command {
        Commands::Run { config, tags } => handle_run(config, tags).await,
        Commands::Plan { config } => handle_plan(config).await,
        Commands::Endpoints { config } => handle_endpoints(config),
        Commands::Init { path, force } => handle_init(&path, force),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_with_tags() {
        let cli = Cli::try_parse_from([
            "testbed",
            "run",
            "--config",
            "lab/.testbed.yml",
            "--tags",
            "windows,build_artifacts",
        ])
        .unwrap();

        match cli.command {
            Commands::Run { config, tags } => {
                assert_eq!(config, Some(PathBuf::from("lab/.testbed.yml")));
                assert_eq!(tags.as_deref(), Some("windows,build_artifacts"));
            }
            other => panic!("unexpected command: {:?}", other),
        }
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["testbed", "plan", "-v", "--log-level", "warn"]).unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.log_level, "warn");
    }

    #[test]
    fn test_init_defaults() {
        let cli = Cli::try_parse_from(["testbed", "init"]).unwrap();
        match cli.command {
            Commands::Init { path, force } => {
                assert_eq!(path, PathBuf::from(".testbed.yml"));
                assert!(!force);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_command_required() {
        assert!(Cli::try_parse_from(["testbed"]).is_err());
    }
}

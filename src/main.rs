//! tempenv - Entry Point
//!
//! Thin command-line surface over the library.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use dialoguer::Confirm;
use miette::{IntoDiagnostic, Result};
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use tempenv::engine::{ContainerEngine, DockerCli};
use tempenv::lifecycle::{
    ImageRef, LifecycleConfig, LifecycleOrchestrator, MountSelector, MountUpdate, UpdateStrategy,
};
use tempenv::mounts::{DEFAULT_TARGET_ROOT, MountPermission, MountSetResolver, MountSpec};
use tempenv::state::{EnvironmentId, EnvironmentStateStore, StoreConfig, default_state_dir};
use tempenv::system;
use tempenv::tempfiles::{TempFileRegistry, install_cleanup_handlers};

/// tempenv - Disposable container development environments with validated host mounts.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory holding environment state
    #[arg(long, global = true, env = "TEMPENV_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Container engine binary
    #[arg(long, global = true, env = "TEMPENV_ENGINE", default_value = "docker", value_parser = ["docker", "podman"])]
    engine: String,

    /// Skip system requirements checks
    #[arg(long, global = true, default_value = "false")]
    skip_checks: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true, default_value = "false")]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create and start an environment
    Create {
        id: EnvironmentId,

        /// Container image
        #[arg(long, default_value = "ubuntu:24.04")]
        image: String,

        /// Mounts as source[:target][:ro|rw]; defaults to the current directory at /workspace
        mounts: Vec<MountSpec>,

        /// Open a shell in the environment and destroy it when the shell exits
        #[arg(long)]
        auto_destroy: bool,
    },

    /// Add mounts to an environment
    Mount {
        id: EnvironmentId,

        /// Mounts as source[:target][:ro|rw]
        #[arg(required = true)]
        mounts: Vec<MountSpec>,

        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// Remove mounts from an environment, by host source or container target
    Unmount {
        id: EnvironmentId,

        /// Remove every mount
        #[arg(long, conflicts_with = "paths")]
        all: bool,

        #[arg(required_unless_present = "all")]
        paths: Vec<PathBuf>,

        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// Open a shell (or run a command) in a running environment
    #[command(visible_alias = "ssh")]
    Shell {
        id: EnvironmentId,

        /// Command to run instead of the default shell
        #[arg(last = true)]
        command: Vec<String>,
    },

    /// Show the mounts of an environment
    Mounts { id: EnvironmentId },

    /// Start a stopped environment
    Start { id: EnvironmentId },

    /// Stop a running environment
    Stop { id: EnvironmentId },

    /// Restart an environment
    Restart { id: EnvironmentId },

    /// Show an environment's record and container state
    Status {
        id: EnvironmentId,

        /// Print the record as JSON
        #[arg(long)]
        json: bool,
    },

    /// List environments
    List {
        /// Print the records as JSON
        #[arg(long)]
        json: bool,
    },

    /// Destroy an environment and everything it owns
    Destroy { id: EnvironmentId },

    /// Remove temporary files left behind by dead tempenv processes
    Sweep,
}

fn main() -> Result<ExitCode> {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    debug!("tempenv v{}", env!("CARGO_PKG_VERSION"));

    let registry = TempFileRegistry::global();
    let _cleanup = install_cleanup_handlers(Arc::clone(&registry))?;

    let state_dir = args.state_dir.clone().unwrap_or_else(default_state_dir);
    let store = EnvironmentStateStore::open(StoreConfig::new(&state_dir))?;

    if let Command::Sweep = args.command {
        let mut removed = registry.sweep_stale(registry.default_dir())?;
        removed.extend(registry.sweep_stale(&store.paths().environments)?);
        for path in &removed {
            println!("removed {}", path.display());
        }
        info!(count = removed.len(), "Sweep finished");
        return Ok(ExitCode::SUCCESS);
    }

    if args.skip_checks {
        warn!("Skipping system requirements checks (--skip-checks)");
    } else {
        match system::check_all(&args.engine, &state_dir) {
            Ok(reqs) => {
                debug!(
                    "System requirements satisfied: {} {}, {} ({})",
                    reqs.platform, reqs.kernel_version, reqs.engine, reqs.engine_version
                );
            }
            Err(e) => {
                error!("System requirements check failed");
                return Err(e.into());
            }
        }
    }

    let engine: Arc<dyn ContainerEngine> = Arc::new(DockerCli::new(&args.engine));
    let orchestrator = LifecycleOrchestrator::new(
        engine,
        store,
        MountSetResolver::default(),
        LifecycleConfig::default(),
    );

    let code = run(&orchestrator, args.command)?;
    Ok(ExitCode::from(u8::try_from(code).unwrap_or(1)))
}

/// Runs one subcommand and returns the process exit status.
fn run(orchestrator: &LifecycleOrchestrator, command: Command) -> Result<i32> {
    match command {
        Command::Create {
            id,
            image,
            mounts,
            auto_destroy,
        } => {
            let specs = if mounts.is_empty() {
                let cwd = std::env::current_dir().into_diagnostic()?;
                vec![MountSpec::new(cwd, DEFAULT_TARGET_ROOT, MountPermission::ReadWrite)]
            } else {
                mounts
            };
            let image = ImageRef::new(image)?;
            let resolved = orchestrator.resolver().resolve(&specs)?;
            let record = orchestrator.create(&id, &resolved, &image)?;
            println!(
                "{id} is {} (container {})",
                record.status, record.container_name
            );
            if auto_destroy {
                info!(%id, "Opening a shell; the environment is destroyed when it exits");
                let shell = orchestrator.shell(&id, &[]);
                orchestrator.destroy(&id)?;
                println!("{id} destroyed");
                return Ok(shell?);
            }
        }
        Command::Mount { id, mounts, yes } => {
            let listed: Vec<String> = mounts.iter().map(ToString::to_string).collect();
            let prompt = format!("Add {} to {id}?", listed.join(", "));
            if !yes && !confirm(&prompt)? {
                println!("mount cancelled");
                return Ok(0);
            }
            let update = orchestrator.add_mounts(&id, &mounts)?;
            print_update(&id, &update);
        }
        Command::Unmount {
            id,
            all,
            paths,
            yes,
        } => {
            let prompt = if all {
                format!("Remove all mounts from {id}?")
            } else {
                let listed: Vec<String> = paths.iter().map(|p| p.display().to_string()).collect();
                format!("Remove {} from {id}?", listed.join(", "))
            };
            if !yes && !confirm(&prompt)? {
                println!("unmount cancelled");
                return Ok(0);
            }
            let selector = if all {
                MountSelector::All
            } else {
                MountSelector::Paths(paths)
            };
            let update = orchestrator.remove_mounts(&id, &selector)?;
            print_update(&id, &update);
        }
        Command::Shell { id, command } => {
            return Ok(orchestrator.shell(&id, &command)?);
        }
        Command::Mounts { id } => {
            let record = orchestrator.store().get(&id)?;
            if record.mounts.is_empty() {
                println!("{id} has no mounts");
            }
            for mount in &record.mounts {
                println!(
                    "{} -> {} ({})",
                    mount.source.display(),
                    mount.target.display(),
                    mount.permission
                );
            }
        }
        Command::Start { id } => {
            let record = orchestrator.start(&id)?;
            println!("{id} is {}", record.status);
        }
        Command::Stop { id } => {
            let record = orchestrator.stop(&id)?;
            println!("{id} is {}", record.status);
        }
        Command::Restart { id } => {
            let record = orchestrator.restart(&id)?;
            println!("{id} is {}", record.status);
        }
        Command::Status { id, json } => {
            let report = orchestrator.status(&id)?;
            if json {
                let out = serde_json::to_string_pretty(&report.record).into_diagnostic()?;
                println!("{out}");
            } else {
                let record = &report.record;
                println!("id:         {}", record.id);
                println!("status:     {}", record.status);
                println!("image:      {}", record.image);
                println!("container:  {}", record.container_name);
                match &report.container {
                    Some(state) => println!("engine:     {state}"),
                    None => println!("engine:     (no container)"),
                }
                println!("mounts:     {}", record.mounts.len());
                for volume in &record.volumes {
                    println!("volume:     {} -> {}", volume.name, volume.target.display());
                }
                if let Some(failure) = &record.failure {
                    println!("failure:    {}", failure.reason);
                    for leftover in &failure.leftover_resources {
                        println!("leftover:   {leftover}");
                    }
                }
                println!("updated:    {}", record.updated_at.to_rfc3339());
            }
        }
        Command::List { json } => {
            let records = orchestrator.list()?;
            if json {
                let out = serde_json::to_string_pretty(&records).into_diagnostic()?;
                println!("{out}");
            } else if records.is_empty() {
                println!("no environments");
            } else {
                for record in &records {
                    println!(
                        "{:<24} {:<13} {:>2} mount(s)  {}",
                        record.id.as_str(),
                        record.status.to_string(),
                        record.mounts.len(),
                        record.image
                    );
                }
            }
        }
        Command::Destroy { id } => {
            orchestrator.destroy(&id)?;
            println!("{id} destroyed");
        }
        Command::Sweep => {}
    }
    Ok(0)
}

/// Asks a yes/no question on the terminal, defaulting to no.
fn confirm(prompt: &str) -> Result<bool> {
    Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()
        .into_diagnostic()
}

fn print_update(id: &EnvironmentId, update: &MountUpdate) {
    match (&update.strategy, &update.restart_error) {
        (UpdateStrategy::Unchanged, _) => println!("{id}: mounts unchanged"),
        (_, Some(restart_error)) => println!(
            "{id}: restart failed ({restart_error}); container recreated with {} mount(s)",
            update.record.mounts.len()
        ),
        (strategy, None) => println!(
            "{id}: mounts applied by {strategy}, {} mount(s)",
            update.record.mounts.len()
        ),
    }
}

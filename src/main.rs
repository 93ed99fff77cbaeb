//! phasesync CLI entry point

use anyhow::{Context, Result};
use phasesync::config::cli::{Cli, ExecutionMode};
use phasesync::config::{toml, validator, Config};
use phasesync::orchestrator::ProcessOrchestrator;
use phasesync::params::DataRoot;
use phasesync::sequencer::PhaseSequencer;
use phasesync::store::{CoordinationStore, RemoteStore, StoreService};
use phasesync::study::{Role, StudyState};
use phasesync::wait::Poller;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    println!("phasesync v{}", env!("CARGO_PKG_VERSION"));
    println!("Phase synchronization for multi-party secure computation");
    println!();

    // Parse CLI arguments
    let cli = Cli::parse_args();
    cli.validate()?;
    setup_logging(cli.debug);

    let config = toml::load_config(&cli).context("Failed to load configuration")?;
    validator::validate_config(&config, cli.mode)
        .context("Configuration validation failed")?;

    // Handle different execution modes
    match cli.mode {
        ExecutionMode::Party => run_party(&cli, config),
        ExecutionMode::Store => run_store(config),
        ExecutionMode::Status => run_status(config),
    }
}

fn setup_logging(debug: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if debug {
            EnvFilter::new("phasesync=debug,warn")
        } else {
            EnvFilter::new("phasesync=info,warn")
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Connect to the store named in the configuration
fn connect_store(config: &Config) -> Result<RemoteStore> {
    let addr = config.party.store_addr.clone()
        .ok_or_else(|| anyhow::anyhow!("No store address configured"))?;
    let store = RemoteStore::connect(addr)?
        .with_timeout(config.polling.store_timeout()?);
    Ok(store)
}

/// Run this party through every protocol phase
fn run_party(cli: &Cli, config: Config) -> Result<()> {
    let role_number = config.party.role
        .ok_or_else(|| anyhow::anyhow!("No role configured"))?;
    let role = Role::new(role_number)?;

    let store = connect_store(&config)?;
    let study = store.get_state()
        .with_context(|| format!("Failed to read study from {}", store.addr()))?;
    validator::validate_against_study(&config, &study)
        .context("Configuration does not match the study")?;

    let data_root = DataRoot::load(&config.paths.data_path_file)?;

    let cancel = Arc::new(AtomicBool::new(false));
    watch_for_interrupt(Arc::clone(&cancel));
    let poller = Poller::new(config.polling.policy()?).with_cancel(cancel);

    let orchestrator = ProcessOrchestrator::new(&config.paths.executables_dir)
        .with_proxy(config.proxy.clone());

    let mut sequencer = PhaseSequencer::new(Arc::new(store), role, data_root, poller, orchestrator)
        .with_demo(config.party.demo)
        .with_executables(config.executables.clone())
        .with_role_policy(config.protocol.roles.clone())
        .with_port_slots(config.protocol.port_slots)
        .with_abort_on_peer_failure(config.protocol.abort_on_peer_failure)
        .with_peer_failure_grace(config.protocol.peer_failure_grace()?);

    print_party_summary(&config, &study, role);

    if cli.dry_run {
        print_plan(&sequencer)?;
        println!();
        println!("Dry run mode - configuration validated successfully");
        return Ok(());
    }

    println!();
    println!("Starting protocol...");
    println!();

    if let Err(e) = sequencer.run() {
        eprintln!();
        eprintln!("Protocol failed for role {} in state {}: {}", role, sequencer.state(), e);
        std::process::exit(1);
    }

    println!();
    println!("Protocol finished successfully for role {}", role);
    Ok(())
}

/// Raise `cancel` on Ctrl-C so a waiting party gives up cleanly
fn watch_for_interrupt(cancel: Arc<AtomicBool>) {
    std::thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => runtime,
            Err(e) => {
                tracing::warn!("Interrupt handler unavailable: {}", e);
                return;
            }
        };
        if runtime.block_on(tokio::signal::ctrl_c()).is_ok() {
            tracing::warn!("Interrupt received, abandoning wait");
            cancel.store(true, Ordering::SeqCst);
        }
    });
}

fn print_party_summary(config: &Config, study: &StudyState, role: Role) {
    println!("Configuration:");
    println!("  Study: {} ({} participants)", study.title, study.participants.len());
    if let Ok(participant) = study.participant(role) {
        println!("  Role: {} ({})", role, participant);
    }
    println!("  Store: {}", config.party.store_addr.as_deref().unwrap_or("-"));
    println!("  Executables: {}", config.paths.executables_dir.display());
    println!("  Polling: every {}", config.polling.interval);
    if let Some(ref timeout) = config.polling.timeout {
        println!("  Wait timeout: {}", timeout);
    }
    if config.party.demo {
        println!("  Demo: using seeded parameter files");
    }
    if config.proxy.enabled {
        println!("  Proxy: 127.0.0.1:{} via {}", config.proxy.port, config.proxy.wrapper);
    }
}

/// Print the parameters and commands a run would use
fn print_plan(sequencer: &PhaseSequencer) -> Result<()> {
    println!();
    if sequencer.is_demo() {
        println!("Parameters: seeded file {}", sequencer.local_par_file().display());
    } else {
        let preview = sequencer.preview_parameters()?;
        let parameters = &preview.parameters;
        println!("Parameters ({} -> {}):", parameters.len(), sequencer.local_par_file().display());
        for (key, value) in parameters.iter() {
            println!("  {} {}", key, value);
        }
        for (participant, key) in &preview.missing {
            println!("  (not yet published: {} of {})", key, participant);
        }
    }

    println!("Commands (from {}):", sequencer.orchestrator().work_dir().display());
    let data_sharing = sequencer.data_sharing_invocation();
    let computation = sequencer.computation_invocation();
    for invocation in std::iter::once(&data_sharing).chain(computation.as_ref()) {
        let line = sequencer.orchestrator().command_line(invocation);
        println!(
            "  {}: {}",
            invocation.phase,
            line.iter().map(|a| a.to_string_lossy()).collect::<Vec<_>>().join(" ")
        );
    }
    if computation.is_none() {
        println!("  {}: skipped for this role", phasesync::Phase::Computation);
    }

    Ok(())
}

/// Host the study document for all parties
fn run_store(config: Config) -> Result<()> {
    let study_file = config.store.study_file.clone()
        .ok_or_else(|| anyhow::anyhow!("No study file configured"))?;
    let service = StoreService::from_study_file(&study_file, config.store.persist)?;

    println!("Configuration:");
    println!("  Study file: {}", study_file.display());
    println!("  Listen port: {}", config.store.listen_port);
    println!("  Persist: {}", config.store.persist);
    println!();

    // Store mode uses tokio runtime
    let runtime = tokio::runtime::Runtime::new()
        .context("Failed to create tokio runtime")?;

    runtime.block_on(service.run(config.store.listen_port))
}

/// Print the status table of the study
fn run_status(config: Config) -> Result<()> {
    let store = connect_store(&config)?;
    let study = store.get_state()
        .with_context(|| format!("Failed to read study from {}", store.addr()))?;

    println!("Study: {}", study.title);
    if let Some(ref stamp) = study.last_update {
        println!("Last update: {}", stamp);
    }
    println!();
    println!("{:<6} {:<32} {:<24} {}", "ROLE", "PARTICIPANT", "STATUS", "TASK");
    for (index, participant) in study.participants.iter().enumerate() {
        println!(
            "{:<6} {:<32} {:<24} {}",
            index,
            participant,
            study.status.get(participant).map(String::as_str).unwrap_or("-"),
            study.tasks.get(participant).map(String::as_str).unwrap_or("-"),
        );
    }

    Ok(())
}

use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::{Local, Utc};
use clap::Parser;
use gossip_lab::collector::{Manifest, RunDir, run_id};
use gossip_lab::{
    CancelToken, Cli, LabConfig, LabError, NetnsLauncher, NetnsTestbed, Orchestrator,
    exit_code_of,
};
use network_sim::{BridgeTopology, NetworkScenario, check_lab_deps, check_netem, resolve_program};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

// Use mimalloc as the global allocator for the binary (non-Windows only)
#[cfg(not(windows))]
#[global_allocator]
static ALLOC: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    if cli.print_version {
        println!(
            "{} ({}@{}{}) [{}]",
            env!("CARGO_PKG_VERSION"),
            env!("GIT_BRANCH"),
            env!("GIT_HASH"),
            env!("GIT_DIRTY"),
            env!("CARGO_PKG_NAME")
        );
        return ExitCode::SUCCESS;
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("ERROR: {err:#}");
            ExitCode::from(exit_code_of(&err))
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = LabConfig::from_cli(&cli)?;
    let seed = config.seed.unwrap_or_else(rand::random);
    let topology = BridgeTopology::new(config.topology.clone())?;

    if config.dry_run {
        return print_plan(&config, &topology, seed);
    }

    preflight(&mut config)?;

    let params = config.parameters();
    let started = Local::now();
    let run_dir = RunDir::create(&config.log_dir, &run_id(&params, started))?;
    info!(run = run_dir.id(), seed, "starting run");

    let cancel = CancelToken::new();
    let launcher = NetnsLauncher::new(config.topology.clone(), config.peer.clone(), run_dir.clone());
    let mut testbed = NetnsTestbed::new(topology, config.egress.clone(), config.clean_peer);
    let mut orchestrator = Orchestrator::new(launcher, config.run.clone(), cancel.clone(), seed);

    let mut task = tokio::task::spawn_blocking(move || {
        let result = orchestrator.run(&mut testbed);
        (result, orchestrator.into_report())
    });

    let joined = tokio::select! {
        joined = &mut task => joined,
        Ok(()) = tokio::signal::ctrl_c() => {
            warn!("interrupt received; stopping peers and tearing down");
            cancel.cancel();
            task.await
        }
    };
    let (result, report) = joined.context("orchestrator task failed")?;

    let manifest = Manifest::new(
        run_dir.id(),
        started.with_timezone(&Utc),
        &params,
        &report,
        &result,
    );
    match run_dir.write_manifest(&manifest) {
        Ok(path) => info!(path = %path.display(), "manifest written"),
        Err(err) => warn!("failed to write manifest: {err:#}"),
    }

    result?;
    info!(dir = %run_dir.path().display(), "results collected");
    Ok(())
}

/// Refuse to start on a host that cannot run the testbed.
fn preflight(config: &mut LabConfig) -> Result<()> {
    let tools = config.required_tools();
    check_lab_deps(&config.peer.binary, &tools)
        .map_err(|reason| LabError::Setup(reason.to_string()))?;
    if !matches!(config.run.network, NetworkScenario::Clean) {
        check_netem().map_err(|reason| LabError::Setup(reason.to_string()))?;
    }

    // sudo resets PATH, so the namespace needs an absolute path
    if let Some(path) = resolve_program(&config.peer.binary) {
        let path = path.canonicalize().unwrap_or(path);
        config.peer.binary = path.display().to_string();
    }
    Ok(())
}

fn print_plan(config: &LabConfig, topology: &BridgeTopology, seed: u64) -> Result<()> {
    let run = &config.run;
    let subnet = config.topology.subnet;
    println!("dry run: nothing will be created");
    println!(
        "bridge {} {} ({} peers)",
        topology.bridge_name(),
        subnet.cidr_of(subnet.gateway()),
        run.peer_count
    );
    for peer in topology.peers() {
        println!(
            "  peer{:<4} ns {:<10} {:<15} host veth {}",
            peer.index, peer.namespace.name, peer.address, peer.host_iface
        );
    }

    // Same draw order as the orchestrator, so the seed reproduces both sets
    let mut rng = StdRng::seed_from_u64(seed);
    let bootstrap = run.bootstrap.select(run.peer_count, &mut rng);
    println!("bootstrap: {} -> {:?}", run.bootstrap, bootstrap.peers());
    println!("sender: peer {}", run.sender_peer);
    match &run.churn {
        Some(churn) => {
            let chosen = churn.selection.select(run.peer_count, &bootstrap, &mut rng)?;
            println!(
                "churn: {} -> {chosen:?}, offline at +{}s for {}s",
                churn.selection,
                churn.start.as_secs(),
                churn.down.as_secs()
            );
        }
        None => println!("churn: none"),
    }

    let plan = run.network.plan(run.peer_count, config.clean_peer);
    println!("network: {}", run.network);
    for (target, profile) in &plan {
        println!("  {target}: {profile}");
    }
    if let Some(egress) = &config.egress {
        match egress.dns {
            Some(dns) => println!("egress: NAT via host, nameserver {dns}"),
            None => println!("egress: NAT via host"),
        }
    }
    println!(
        "peer: {} --discovery {} --topic-name {}",
        config.peer.binary, config.peer.discovery, config.peer.topic
    );
    println!("logs: {}", config.log_dir.display());
    println!("seed: {seed}");
    Ok(())
}

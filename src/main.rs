use anyhow::{Context, Result, bail};
use clap::Parser;
use std::io::{self, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use doubletree::cli::{Args, Command, TraceArgs};
use doubletree::config::{Config, StopSetKind};
use doubletree::export::{export_csv, export_json, generate_report};
use doubletree::lease::{LeaseManager, expand_targets, partition};
use doubletree::lookup::{DnsLookup, ReverseLookup};
use doubletree::monitor::Monitor;
use doubletree::probe::{InterfaceInfo, UdpProbe, check_permissions, resolve_source, validate_interface};
use doubletree::rpc::{LeaderServer, RpcLeaseClient};
use doubletree::stopset::{BloomSet, ExactSet, SafeSet, StopSet};
use doubletree::trace::{ProbeContext, probe_range};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let mut config = Config::load(args.config.as_deref())?;
    if let Err(e) = args.apply(&mut config) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
    config.validate().context("Invalid configuration")?;

    // Cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    // Setup Ctrl+C handler
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("interrupt received, shutting down");
        cancel_clone.cancel();
    });

    match config.stop_set.kind {
        StopSetKind::Exact => run::<ExactSet>(args.command, config, cancel).await,
        StopSetKind::Bloom => run::<BloomSet>(args.command, config, cancel).await,
    }
}

async fn run<S: StopSet>(command: Command, config: Config, cancel: CancellationToken) -> Result<()> {
    match command {
        Command::Leader(_) => run_leader::<S>(config, cancel).await,
        Command::Monitor(_) => run_monitor::<S>(config, cancel).await,
        Command::Trace(trace) => run_trace::<S>(trace, config, cancel).await,
    }
}

async fn run_leader<S: StopSet>(config: Config, cancel: CancellationToken) -> Result<()> {
    let addresses = expand_targets(&config.leader.targets)?;
    if addresses.is_empty() {
        bail!("No targets specified. Pass addresses or CIDR blocks, or set leader.targets in the config file");
    }

    let chunks = partition(&addresses, config.leader.ranges);
    tracing::info!(
        addresses = addresses.len(),
        ranges = chunks.len(),
        stop_set = ?config.stop_set.kind,
        "target list partitioned"
    );
    let manager = Arc::new(LeaseManager::<S>::new(
        chunks,
        config.leader.lease_timeout,
        &config.stop_set.params(),
    ));

    let listener = LeaderServer::<S>::bind(config.leader.listen).await?;
    LeaderServer::new(manager).serve(listener, cancel).await
}

/// Validate the interface and pick the probe source address
fn probe_setup(config: &Config, sample_target: Option<Ipv4Addr>) -> Result<(Option<InterfaceInfo>, Ipv4Addr)> {
    check_permissions()?;

    let interface = match config.probe.interface {
        Some(ref name) => Some(validate_interface(name)?),
        None => None,
    };
    let source = resolve_source(&config.probe, interface.as_ref(), sample_target)?;
    Ok((interface, source))
}

fn resolver(config: &Config) -> Result<Option<Arc<dyn ReverseLookup>>> {
    if !config.probe.dns_enabled {
        return Ok(None);
    }
    let dns = DnsLookup::new().context("Failed to create DNS resolver")?;
    Ok(Some(Arc::new(dns)))
}

async fn run_monitor<S: StopSet>(config: Config, cancel: CancellationToken) -> Result<()> {
    // Route toward the leader picks the outbound interface when nothing else does
    let leader_ip = config
        .monitor
        .leader
        .parse::<SocketAddr>()
        .ok()
        .and_then(|addr| match addr.ip() {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        });
    let (interface, source) = probe_setup(&config, leader_ip)?;

    let transport = Arc::new(UdpProbe::new(config.probe.port, interface));
    let client = Arc::new(RpcLeaseClient::new(
        config.monitor.leader.clone(),
        config.monitor.connect_timeout,
    ));

    let mut monitor = Monitor::<S>::new(
        config.monitor.resolved_agent_id(),
        client,
        transport,
        config.probe.clone(),
        config.monitor.clone(),
        config.stop_set.params(),
        source,
        cancel,
    );
    if let Some(resolver) = resolver(&config)? {
        monitor = monitor.with_resolver(resolver);
    }

    let summary = monitor.run().await?;
    eprintln!(
        "{} sessions accepted, {} rejected, {} skipped, {} destinations traced ({} failed), {} probes sent",
        summary.sessions,
        summary.rejected,
        summary.failed,
        summary.destinations,
        summary.failed_destinations,
        summary.probes_sent
    );
    Ok(())
}

async fn run_trace<S: StopSet>(trace: TraceArgs, config: Config, cancel: CancellationToken) -> Result<()> {
    let targets = expand_targets(&trace.targets)?;
    if targets.is_empty() {
        bail!("No valid targets specified");
    }
    let (interface, source) = probe_setup(&config, targets.first().copied())?;

    let params = config.stop_set.params();
    let transport = Arc::new(UdpProbe::new(config.probe.port, interface));
    let mut ctx = ProbeContext::new(
        config.probe.clone(),
        source,
        Arc::new(SafeSet::<S>::with_params(&params)),
        Arc::new(SafeSet::<S>::with_params(&params)),
        transport,
    )
    .with_cancel(cancel);
    if let Some(resolver) = resolver(&config)? {
        ctx = ctx.with_resolver(resolver);
    }

    let new_nodes = Arc::new(SafeSet::<S>::with_params(&params));
    let report = probe_range(Arc::new(ctx), &targets, new_nodes).await;
    for failure in &report.failures {
        eprintln!("Warning: {}: {}", failure.destination, failure.error);
    }

    let stdout = io::stdout();
    let mut out = stdout.lock();
    if trace.json {
        export_json(&report.outcomes, &mut out)?;
        writeln!(out)?;
    } else if trace.csv {
        export_csv(&report.outcomes, &mut out)?;
    } else {
        generate_report(&report.outcomes, &mut out)?;
    }
    Ok(())
}

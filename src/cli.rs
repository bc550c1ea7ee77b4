use clap::{Parser, Subcommand};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{Config, StopSetKind};

/// Distributed DoubleTree topology discovery: a lease-based leader and
/// dual-direction probing monitors
#[derive(Parser, Debug, Clone)]
#[command(name = "doubletree")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Config file (default: ~/.config/doubletree/config.toml if present)
    #[arg(short = 'C', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Stop set representation (exact, bloom)
    #[arg(long = "stop-set", global = true)]
    pub stop_set: Option<StopSetKind>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Partition targets into ranges and lease them to monitors
    Leader(LeaderArgs),
    /// Lease ranges from a leader and probe them until done
    Monitor(MonitorArgs),
    /// Run DoubleTree locally against the given targets and print a report
    Trace(TraceArgs),
}

#[derive(clap::Args, Debug, Clone)]
pub struct LeaderArgs {
    /// Target addresses or CIDR blocks (added to any from the config file)
    pub targets: Vec<String>,

    /// Address to accept monitor connections on
    #[arg(short = 'l', long = "listen")]
    pub listen: Option<SocketAddr>,

    /// Number of ranges to split the targets into
    #[arg(short = 'r', long = "ranges")]
    pub ranges: Option<usize>,

    /// Seconds a range stays leased without a submission
    #[arg(long = "lease-timeout")]
    pub lease_timeout: Option<f64>,
}

#[derive(clap::Args, Debug, Clone)]
pub struct MonitorArgs {
    /// Leader address (host:port)
    #[arg(short = 'L', long = "leader")]
    pub leader: Option<String>,

    /// Agent identifier (default: hostname-pid)
    #[arg(long = "agent-id")]
    pub agent_id: Option<String>,

    /// Stop after this many sessions (0 = until every range is probed)
    #[arg(short = 'n', long = "max-sessions")]
    pub max_sessions: Option<u64>,

    #[command(flatten)]
    pub probe: ProbeArgs,
}

#[derive(clap::Args, Debug, Clone)]
pub struct TraceArgs {
    /// Target addresses or CIDR blocks
    #[arg(required = true)]
    pub targets: Vec<String>,

    /// Output JSON instead of the text report
    #[arg(long = "json")]
    pub json: bool,

    /// Output CSV instead of the text report
    #[arg(long = "csv")]
    pub csv: bool,

    #[command(flatten)]
    pub probe: ProbeArgs,
}

/// Probe settings shared by `monitor` and `trace`
#[derive(clap::Args, Debug, Clone, Default)]
pub struct ProbeArgs {
    /// Bind probes to specific network interface (e.g., eth0, wlan0)
    #[arg(long = "interface")]
    pub interface: Option<String>,

    /// Send probes from this IPv4 address
    #[arg(long = "source-ip")]
    pub source_ip: Option<Ipv4Addr>,

    /// Skip reverse DNS lookups
    #[arg(long = "no-dns")]
    pub no_dns: bool,

    /// TTL of the first forward probe
    #[arg(long = "first-hop")]
    pub first_hop: Option<u8>,

    /// Lower bound of the random per-destination hop limit
    #[arg(long = "floor")]
    pub floor: Option<u8>,

    /// Upper bound of the random per-destination hop limit
    #[arg(long = "ceiling")]
    pub ceiling: Option<u8>,

    /// Timeouts tolerated at one TTL before moving on
    #[arg(long = "retries")]
    pub retries: Option<u32>,

    /// Per-probe timeout in seconds
    #[arg(long = "timeout")]
    pub timeout: Option<f64>,

    /// UDP destination port
    #[arg(long = "port")]
    pub port: Option<u16>,
}

fn positive_secs(name: &str, secs: f64) -> Result<Duration, String> {
    if !secs.is_finite() || secs <= 0.0 {
        return Err(format!("{} must be positive", name));
    }
    Duration::try_from_secs_f64(secs).map_err(|e| format!("{} is out of range: {}", name, e))
}

impl ProbeArgs {
    fn apply(&self, config: &mut Config) -> Result<(), String> {
        let probe = &mut config.probe;
        if let Some(ref iface) = self.interface {
            probe.interface = Some(iface.clone());
        }
        if let Some(ip) = self.source_ip {
            probe.source_ip = Some(ip);
        }
        if self.no_dns {
            probe.dns_enabled = false;
        }
        if let Some(first_hop) = self.first_hop {
            probe.first_hop = first_hop;
        }
        if let Some(floor) = self.floor {
            probe.hop_floor = floor;
        }
        if let Some(ceiling) = self.ceiling {
            probe.hop_ceiling = ceiling;
        }
        if let Some(retries) = self.retries {
            probe.retries = retries;
        }
        if let Some(timeout) = self.timeout {
            probe.timeout = positive_secs("Timeout", timeout)?;
        }
        if let Some(port) = self.port {
            probe.port = port;
        }
        Ok(())
    }
}

impl Args {
    /// Validate flag combinations that clap cannot express
    pub fn validate(&self) -> Result<(), String> {
        match self.command {
            Command::Trace(ref trace) if trace.json && trace.csv => {
                Err("Cannot specify both --json and --csv".into())
            }
            Command::Leader(ref leader) => match leader.lease_timeout {
                Some(secs) => positive_secs("Lease timeout", secs).map(|_| ()),
                None => Ok(()),
            },
            _ => Ok(()),
        }
    }

    /// Layer command-line overrides on top of a loaded config
    pub fn apply(&self, config: &mut Config) -> Result<(), String> {
        if let Some(kind) = self.stop_set {
            config.stop_set.kind = kind;
        }

        match self.command {
            Command::Leader(ref leader) => {
                config.leader.targets.extend(leader.targets.iter().cloned());
                if let Some(listen) = leader.listen {
                    config.leader.listen = listen;
                }
                if let Some(ranges) = leader.ranges {
                    config.leader.ranges = ranges;
                }
                if let Some(secs) = leader.lease_timeout {
                    config.leader.lease_timeout = positive_secs("Lease timeout", secs)?;
                }
            }
            Command::Monitor(ref monitor) => {
                if let Some(ref leader) = monitor.leader {
                    config.monitor.leader = leader.clone();
                }
                if let Some(ref id) = monitor.agent_id {
                    config.monitor.agent_id = Some(id.clone());
                }
                if let Some(max) = monitor.max_sessions {
                    config.monitor.max_sessions = max;
                }
                monitor.probe.apply(config)?;
            }
            Command::Trace(ref trace) => trace.probe.apply(config)?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Args {
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_leader_overrides() {
        let args = parse(&[
            "doubletree",
            "--stop-set",
            "bloom",
            "leader",
            "10.0.0.0/24",
            "--ranges",
            "4",
            "--lease-timeout",
            "2.5",
        ]);
        let mut config = Config::default();
        config.leader.targets.push("8.8.8.8".into());
        args.apply(&mut config).unwrap();

        assert_eq!(config.leader.ranges, 4);
        assert_eq!(config.leader.lease_timeout, Duration::from_millis(2500));
        assert_eq!(config.leader.targets, vec!["8.8.8.8", "10.0.0.0/24"]);
        assert_eq!(config.stop_set.kind, StopSetKind::Bloom);
    }

    #[test]
    fn test_monitor_probe_overrides() {
        let args = parse(&[
            "doubletree",
            "monitor",
            "--leader",
            "leader.example.net:4000",
            "--agent-id",
            "vp-1",
            "--no-dns",
            "--floor",
            "3",
            "--ceiling",
            "5",
            "--timeout",
            "0.25",
        ]);
        let mut config = Config::default();
        args.apply(&mut config).unwrap();

        assert_eq!(config.monitor.leader, "leader.example.net:4000");
        assert_eq!(config.monitor.agent_id.as_deref(), Some("vp-1"));
        assert!(!config.probe.dns_enabled);
        assert_eq!(config.probe.hop_floor, 3);
        assert_eq!(config.probe.hop_ceiling, 5);
        assert_eq!(config.probe.timeout, Duration::from_millis(250));
        // Untouched flags keep config values
        assert_eq!(config.probe.retries, 3);
    }

    #[test]
    fn test_trace_requires_targets() {
        assert!(Args::try_parse_from(["doubletree", "trace"]).is_err());
    }

    #[test]
    fn test_json_and_csv_conflict() {
        let args = parse(&["doubletree", "trace", "8.8.8.8", "--json", "--csv"]);
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_huge_timeout_rejected() {
        let args = parse(&["doubletree", "trace", "8.8.8.8", "--timeout", "1e30"]);
        assert!(args.apply(&mut Config::default()).is_err());
        let args = parse(&["doubletree", "leader", "--lease-timeout", "1e30"]);
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let args = parse(&["doubletree", "trace", "8.8.8.8", "--timeout", "0"]);
        assert!(args.apply(&mut Config::default()).is_err());
        let args = parse(&["doubletree", "leader", "--lease-timeout", "0"]);
        assert!(args.validate().is_err());
    }
}

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::stopset::StopSetParams;

/// Highest hop limit accepted for the DoubleTree ceiling
pub const MAX_SAFE_TTL: u8 = 64;

/// Leader (lease manager) settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaderConfig {
    /// Address the RPC server listens on
    pub listen: SocketAddr,
    /// Number of ranges the target list is partitioned into
    pub ranges: usize,
    /// How long a range stays leased without a submission
    #[serde(with = "duration_serde")]
    pub lease_timeout: Duration,
    /// Target addresses or CIDR blocks
    pub targets: Vec<String>,
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 4000)),
            ranges: 10,
            lease_timeout: Duration::from_secs(90),
            targets: Vec::new(),
        }
    }
}

/// Per-probe settings used by the DoubleTree engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// TTL of the first forward probe
    pub first_hop: u8,
    /// Timeouts tolerated at one TTL before recording a failed hop
    pub retries: u32,
    /// Per-attempt reply timeout
    #[serde(with = "duration_serde")]
    pub timeout: Duration,
    /// Lower bound of the random per-destination hop limit
    pub hop_floor: u8,
    /// Upper bound of the random per-destination hop limit
    pub hop_ceiling: u8,
    /// UDP destination port for probes
    pub port: u16,
    /// Bind probes to this interface
    pub interface: Option<String>,
    /// Send probes from this address
    pub source_ip: Option<Ipv4Addr>,
    /// Resolve hostnames for responders
    pub dns_enabled: bool,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            first_hop: 1,
            retries: 3,
            timeout: Duration::from_millis(500),
            hop_floor: 6,
            hop_ceiling: 12,
            port: 33434,
            interface: None,
            source_ip: None,
            dns_enabled: true,
        }
    }
}

/// Monitor (probing agent) settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Leader RPC address
    pub leader: String,
    /// Agent identifier; defaults to hostname-pid
    pub agent_id: Option<String>,
    /// Wait before asking again when every unseen range is leased
    #[serde(with = "duration_serde")]
    pub retry_interval: Duration,
    /// Stop after this many sessions (0 = until exhausted)
    pub max_sessions: u64,
    /// Give up dialing the leader after this long
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            leader: "127.0.0.1:4000".to_string(),
            agent_id: None,
            retry_interval: Duration::from_secs(5),
            max_sessions: 0,
            connect_timeout: Duration::from_millis(800),
        }
    }
}

impl MonitorConfig {
    /// Configured agent id, or hostname-pid
    pub fn resolved_agent_id(&self) -> String {
        self.agent_id.clone().unwrap_or_else(|| {
            let host = std::env::var("HOSTNAME")
                .ok()
                .filter(|h| !h.is_empty())
                .unwrap_or_else(|| "monitor".to_string());
            format!("{}-{}", host, std::process::id())
        })
    }
}

/// Stop set representation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopSetKind {
    #[default]
    Exact,
    Bloom,
}

impl std::str::FromStr for StopSetKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "exact" => Ok(Self::Exact),
            "bloom" => Ok(Self::Bloom),
            other => Err(format!("Unknown stop set kind: {}. Use exact or bloom", other)),
        }
    }
}

/// Stop set settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StopSetConfig {
    pub kind: StopSetKind,
    /// Bloom sizing: expected number of keys
    pub expected_items: u64,
    /// Bloom sizing: target false positive rate
    pub false_positive_rate: f64,
}

impl Default for StopSetConfig {
    fn default() -> Self {
        let params = StopSetParams::default();
        Self {
            kind: StopSetKind::Exact,
            expected_items: params.expected_items,
            false_positive_rate: params.false_positive_rate,
        }
    }
}

impl StopSetConfig {
    pub fn params(&self) -> StopSetParams {
        StopSetParams {
            expected_items: self.expected_items,
            false_positive_rate: self.false_positive_rate,
        }
    }
}

/// Full runtime configuration: defaults, then TOML file, then CLI overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub leader: LeaderConfig,
    pub probe: ProbeConfig,
    pub monitor: MonitorConfig,
    pub stop_set: StopSetConfig,
}

impl Config {
    /// Default config file path: ~/.config/doubletree/config.toml
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("doubletree").join("config.toml"))
    }

    /// Load from an explicit path, or the default path if it exists, or defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => match Self::default_path().filter(|p| p.exists()) {
                Some(path) => Self::from_file(&path),
                None => Ok(Self::default()),
            },
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&text)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Validate settings that would otherwise fail deep inside a run
    pub fn validate(&self) -> Result<()> {
        let probe = &self.probe;
        if probe.hop_floor == 0 {
            bail!("Hop floor must be at least 1");
        }
        if probe.hop_floor > probe.hop_ceiling {
            bail!(
                "Hop floor ({}) cannot exceed hop ceiling ({})",
                probe.hop_floor,
                probe.hop_ceiling
            );
        }
        if probe.hop_ceiling > MAX_SAFE_TTL {
            bail!("Hop ceiling cannot exceed {}", MAX_SAFE_TTL);
        }
        if probe.first_hop == 0 {
            bail!("First hop must be at least 1");
        }
        if probe.first_hop > probe.hop_ceiling {
            bail!(
                "First hop ({}) cannot exceed hop ceiling ({})",
                probe.first_hop,
                probe.hop_ceiling
            );
        }
        if probe.timeout.is_zero() {
            bail!("Probe timeout must be positive");
        }
        if let Some(ref iface) = probe.interface {
            if iface.is_empty() {
                bail!("Interface name cannot be empty");
            }
            // IFNAMSIZ on Linux is 16 including null terminator
            if iface.len() > 15 {
                bail!("Interface name too long: {} (max 15 chars)", iface);
            }
        }

        if self.leader.ranges == 0 {
            bail!("Range count must be at least 1");
        }
        if self.leader.lease_timeout.is_zero() {
            bail!("Lease timeout must be positive");
        }

        if self.monitor.connect_timeout.is_zero() {
            bail!("Connect timeout must be positive");
        }

        let stop_set = &self.stop_set;
        if stop_set.expected_items == 0 {
            bail!("Bloom expected item count must be at least 1");
        }
        if !(stop_set.false_positive_rate > 0.0 && stop_set.false_positive_rate < 1.0) {
            bail!(
                "Bloom false positive rate must be between 0 and 1 (got {})",
                stop_set.false_positive_rate
            );
        }

        Ok(())
    }
}

/// Serde helper for Duration
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom("duration must be a non-negative number of seconds"));
        }
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

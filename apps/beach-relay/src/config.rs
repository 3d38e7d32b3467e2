use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Args;

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_ECHO_PATH: &str = "/echo";
pub const DEFAULT_SIGNAL_PATH: &str = "/rtc";
pub const DEFAULT_PEER_BUFFER: usize = 64;

const RESERVED_PATHS: [&str; 2] = ["/health", "/metrics"];

/// Server flags, each with an environment fallback.
#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    /// Address to bind the HTTP/WebSocket listener to.
    #[arg(long, env = "BEACH_RELAY_LISTEN_ADDR", default_value = DEFAULT_LISTEN_ADDR)]
    pub listen_addr: String,

    /// Path of the echo diagnostic endpoint.
    #[arg(long, env = "BEACH_RELAY_ECHO_PATH", default_value = DEFAULT_ECHO_PATH)]
    pub echo_path: String,

    /// Path of the signaling endpoint.
    #[arg(long, env = "BEACH_RELAY_SIGNAL_PATH", default_value = DEFAULT_SIGNAL_PATH)]
    pub signal_path: String,

    /// Maximum time a new connection has to identify itself.
    #[arg(long, env = "BEACH_RELAY_JOIN_TIMEOUT_SECS", default_value_t = 10)]
    pub join_timeout_secs: u64,

    /// Close peers that send nothing for this long. Off when unset.
    #[arg(long, env = "BEACH_RELAY_IDLE_TIMEOUT_SECS")]
    pub idle_timeout_secs: Option<u64>,

    /// Frames queued per peer before further forwards to it are dropped.
    #[arg(long, env = "BEACH_RELAY_PEER_BUFFER", default_value_t = DEFAULT_PEER_BUFFER)]
    pub peer_buffer: usize,

    /// Tell connected peers when someone joins or leaves.
    #[arg(long, env = "BEACH_RELAY_ANNOUNCE_PRESENCE", default_value_t = false)]
    pub announce_presence: bool,

    /// Grace period applied during shutdown.
    #[arg(long, env = "BEACH_RELAY_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,
}

impl Default for ServeArgs {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            echo_path: DEFAULT_ECHO_PATH.to_string(),
            signal_path: DEFAULT_SIGNAL_PATH.to_string(),
            join_timeout_secs: 10,
            idle_timeout_secs: None,
            peer_buffer: DEFAULT_PEER_BUFFER,
            announce_presence: false,
            shutdown_grace_secs: 2,
        }
    }
}

/// Knobs consumed by each relay session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub join_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    pub peer_buffer: usize,
    pub announce_presence: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            join_timeout: Duration::from_secs(10),
            idle_timeout: None,
            peer_buffer: DEFAULT_PEER_BUFFER,
            announce_presence: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    pub echo_path: String,
    pub signal_path: String,
    pub session: SessionSettings,
    pub shutdown_grace: Duration,
}

impl TryFrom<ServeArgs> for RelayConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServeArgs) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = args
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", args.listen_addr))?;

        validate_path("echo", &args.echo_path)?;
        validate_path("signal", &args.signal_path)?;
        if args.echo_path == args.signal_path {
            bail!(
                "echo and signal endpoints must differ (both are {})",
                args.signal_path
            );
        }
        if args.peer_buffer == 0 {
            bail!("peer buffer must be greater than zero");
        }
        if args.join_timeout_secs == 0 {
            bail!("join timeout must be greater than zero");
        }
        if args.idle_timeout_secs == Some(0) {
            bail!("idle timeout must be greater than zero when set");
        }

        Ok(Self {
            listen_addr,
            echo_path: args.echo_path,
            signal_path: args.signal_path,
            session: SessionSettings {
                join_timeout: Duration::from_secs(args.join_timeout_secs),
                idle_timeout: args.idle_timeout_secs.map(Duration::from_secs),
                peer_buffer: args.peer_buffer,
                announce_presence: args.announce_presence,
            },
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
        })
    }
}

fn validate_path(name: &str, path: &str) -> Result<()> {
    if !path.starts_with('/') {
        bail!("{name} path must start with '/': {path}");
    }
    if path.contains(':') || path.contains('*') {
        bail!("{name} path must be a literal route: {path}");
    }
    if RESERVED_PATHS.contains(&path) {
        bail!("{name} path {path} is reserved");
    }
    Ok(())
}

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{ensure, Context};
use clap::Parser;

use crate::ticket::TicketConfig;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub tickets: TicketConfig,
    pub shutdown_grace: Duration,
    pub fifo_root: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 10010)),
            tickets: TicketConfig::default(),
            shutdown_grace: Duration::from_secs(5),
            fifo_root: None,
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "shellstream-server",
    author,
    version,
    about = "Ticketed remote exec server speaking the channel.k8s.io stream protocols"
)]
pub struct Cli {
    /// Address to bind the HTTP listener to.
    #[arg(long, env = "SHELLSTREAM_LISTEN_ADDR", default_value = "127.0.0.1:10010")]
    pub listen_addr: String,

    /// How long an issued exec URL stays valid.
    #[arg(long, env = "SHELLSTREAM_TICKET_TTL_SECS", default_value_t = 60)]
    pub ticket_ttl_secs: u64,

    /// Maximum number of outstanding exec URLs.
    #[arg(long, env = "SHELLSTREAM_MAX_TICKETS", default_value_t = 1000)]
    pub max_tickets: usize,

    /// How often expired exec URLs are purged.
    #[arg(long, env = "SHELLSTREAM_SWEEP_INTERVAL_SECS", default_value_t = 30)]
    pub sweep_interval_secs: u64,

    /// Grace period applied during shutdown.
    #[arg(long, env = "SHELLSTREAM_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,

    /// Attach to task FIFOs under this directory instead of spawning processes.
    #[arg(long, env = "SHELLSTREAM_FIFO_ROOT")]
    pub fifo_root: Option<PathBuf>,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        ensure!(cli.ticket_ttl_secs > 0, "ticket TTL must be at least one second");
        ensure!(cli.sweep_interval_secs > 0, "sweep interval must be at least one second");
        Ok(ServerConfig {
            listen_addr,
            tickets: TicketConfig {
                ttl: Duration::from_secs(cli.ticket_ttl_secs),
                capacity: cli.max_tickets,
                sweep_interval: Duration::from_secs(cli.sweep_interval_secs),
            },
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
            fifo_root: cli.fifo_root,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn flags_convert_into_config() {
        let cli = Cli::parse_from([
            "shellstream-server",
            "--listen-addr",
            "0.0.0.0:8080",
            "--ticket-ttl-secs",
            "5",
            "--max-tickets",
            "2",
            "--fifo-root",
            "/run/shellstream",
        ]);
        let config = ServerConfig::try_from(cli).expect("valid config");
        assert_eq!(config.listen_addr, "0.0.0.0:8080".parse().expect("addr"));
        assert_eq!(config.tickets.ttl, Duration::from_secs(5));
        assert_eq!(config.tickets.capacity, 2);
        assert_eq!(config.fifo_root, Some(PathBuf::from("/run/shellstream")));
    }

    #[test_timeout::timeout]
    fn bad_listen_addr_is_rejected() {
        let cli = Cli::parse_from(["shellstream-server", "--listen-addr", "nowhere"]);
        assert!(ServerConfig::try_from(cli).is_err());
        let cli = Cli::parse_from(["shellstream-server", "--ticket-ttl-secs", "0"]);
        assert!(ServerConfig::try_from(cli).is_err());
    }
}

use std::{
    net::{Ipv4Addr, SocketAddrV4},
    time::Duration,
};

use clap::{Args, Parser, Subcommand};

use crate::{
    config::{ClientConfig, ServerConfig},
    error::Result,
    stress::StressPlan,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay server on 0.0.0.0.
    Server(ServerArgs),
    /// Connect to a server and chat from the terminal.
    Client(ClientArgs),
    /// Load a server with many scripted clients.
    Stress(StressArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Port to listen on. Use 0 for an ephemeral port.
    #[arg(long, default_value_t = 2000)]
    pub port: u16,

    /// Evict sessions that send nothing for this long.
    #[arg(long, default_value_t = 10_000)]
    pub idle_timeout_ms: u64,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Name to register under. The server stores it lowercased.
    #[arg(long)]
    pub name: String,

    #[arg(long, default_value_t = Ipv4Addr::LOCALHOST)]
    pub address: Ipv4Addr,

    #[arg(long, default_value_t = 2000)]
    pub port: u16,

    #[arg(long, default_value_t = 3_000)]
    pub connect_timeout_ms: u64,

    /// Delay before reconnecting after a failed or lost connection.
    #[arg(long, default_value_t = 5_000)]
    pub reconnect_ms: u64,
}

#[derive(Args, Debug, Clone)]
pub struct StressArgs {
    #[arg(long, default_value_t = Ipv4Addr::LOCALHOST)]
    pub address: Ipv4Addr,

    #[arg(long, default_value_t = 2000)]
    pub port: u16,

    /// Number of concurrent clients.
    #[arg(long, default_value_t = 100)]
    pub clients: usize,

    /// Pause between two lines from the same client.
    #[arg(long, default_value_t = 100)]
    pub interval_ms: u64,

    /// How long every client keeps sending.
    #[arg(long, default_value_t = 10_000)]
    pub duration_ms: u64,
}

impl ServerArgs {
    pub fn config(&self) -> ServerConfig {
        ServerConfig::new(self.port).with_idle_timeout(Duration::from_millis(self.idle_timeout_ms))
    }
}

impl ClientArgs {
    pub fn config(&self) -> Result<ClientConfig> {
        let config = ClientConfig::new(SocketAddrV4::new(self.address, self.port), &*self.name)?;
        Ok(config.with_timings(
            Duration::from_millis(self.connect_timeout_ms),
            Duration::from_millis(self.reconnect_ms),
        ))
    }
}

impl StressArgs {
    pub fn plan(&self) -> StressPlan {
        StressPlan {
            server: SocketAddrV4::new(self.address, self.port),
            clients: self.clients,
            interval: Duration::from_millis(self.interval_ms),
            duration: Duration::from_millis(self.duration_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_defaults_match_the_protocol_timings() {
        let cli = Cli::parse_from(["relay_chat", "client", "--name", "Alice"]);
        let Command::Client(args) = cli.command else {
            panic!("expected client subcommand");
        };

        let config = args.config().expect("valid config");
        assert_eq!(config.server.to_string(), "127.0.0.1:2000");
        assert_eq!(config.name, "Alice");
        assert_eq!(config.connect_timeout, Duration::from_secs(3));
        assert_eq!(config.reconnect_backoff, Duration::from_secs(5));
    }

    #[test]
    fn server_timeout_can_be_shortened() {
        let cli = Cli::parse_from([
            "relay_chat",
            "server",
            "--port",
            "0",
            "--idle-timeout-ms",
            "250",
        ]);
        let Command::Server(args) = cli.command else {
            panic!("expected server subcommand");
        };

        let config = args.config();
        assert_eq!(config.port, 0);
        assert_eq!(config.idle_timeout, Duration::from_millis(250));
        assert_eq!(config.backlog, 100);
    }

    #[test]
    fn empty_client_name_is_refused() {
        let cli = Cli::parse_from(["relay_chat", "client", "--name", ""]);
        let Command::Client(args) = cli.command else {
            panic!("expected client subcommand");
        };
        assert!(args.config().is_err());
    }
}

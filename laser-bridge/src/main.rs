//! Entry point for `laser-bridge`.
//!
//! Parses CLI arguments into a [`BridgeConfig`] and runs the bridge until
//! ctrl-c.  All protocol work is delegated to the library; `main.rs` owns only
//! process setup (logging, signal handling, argument parsing).

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use laser_bridge::config::{DEFAULT_CONTROLLER_PORT, DEFAULT_INBOUND_PORT, DEFAULT_TCP_PORT};
use laser_bridge::{Bridge, BridgeConfig, LogStatus};

/// Bridge a CAD/CAM TCP client to an ACK-gated UDP laser controller.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Address CAD/CAM clients connect to.
    #[arg(short, long, default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_TCP_PORT)))]
    listen: SocketAddr,

    /// Controller address: IP, or IP:PORT.
    #[arg(short, long, value_parser = parse_controller)]
    controller: SocketAddr,

    /// Local UDP port the controller replies to.
    #[arg(long, default_value_t = DEFAULT_INBOUND_PORT)]
    inbound_port: u16,

    /// Serve `/health` on this address.
    #[arg(long)]
    health: Option<SocketAddr>,

    /// Scramble key, decimal or 0x-prefixed hex.
    #[arg(long, value_parser = parse_byte)]
    magic: Option<u8>,

    /// Send payloads unscrambled.
    #[arg(long)]
    no_scramble: bool,

    /// Skip the CONNECT handshake and start degraded.
    #[arg(long)]
    no_handshake: bool,

    /// Never send idle keepalives.
    #[arg(long)]
    no_keepalive: bool,

    /// Controller responses carry no checksum prefix.
    #[arg(long)]
    raw_responses: bool,

    /// Resends of a rejected first fragment (0 disables retry).
    #[arg(long)]
    max_retries: Option<u32>,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn into_config(self) -> BridgeConfig {
        let mut config = BridgeConfig {
            tcp_listen: self.listen,
            controller: self.controller,
            udp_inbound_port: self.inbound_port,
            health_listen: self.health,
            ..BridgeConfig::default()
        };
        let link = &mut config.link;
        if let Some(magic) = self.magic {
            link.magic = magic;
        }
        if let Some(retries) = self.max_retries {
            link.max_fragment_retries = retries;
        }
        link.scramble_outbound = !self.no_scramble;
        link.handshake = !self.no_handshake;
        link.keepalive = !self.no_keepalive;
        link.verify_inbound_checksum = !self.raw_responses;
        config
    }
}

fn parse_controller(s: &str) -> Result<SocketAddr, String> {
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Ok(addr);
    }
    s.parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, DEFAULT_CONTROLLER_PORT))
        .map_err(|_| format!("`{s}` is neither IP nor IP:PORT"))
}

fn parse_byte(s: &str) -> Result<u8, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("`{s}`: {e}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose.
    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    let config = cli.into_config();
    log::info!(
        "Starting bridge: tcp {} → controller {}",
        config.tcp_listen,
        config.controller
    );

    let bridge = Bridge::bind(config, Arc::new(LogStatus))
        .await
        .context("starting bridge")?;

    let shutdown = bridge.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("ctrl-c received; shutting down");
            shutdown.cancel();
        }
    });

    bridge.run().await.context("bridge stopped with an error")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn controller_accepts_bare_ip() {
        assert_eq!(
            parse_controller("10.0.0.9").unwrap(),
            SocketAddr::from(([10, 0, 0, 9], DEFAULT_CONTROLLER_PORT))
        );
        assert_eq!(
            parse_controller("10.0.0.9:1234").unwrap(),
            SocketAddr::from(([10, 0, 0, 9], 1234))
        );
        assert!(parse_controller("laser").is_err());
    }

    #[test]
    fn magic_accepts_hex_and_decimal() {
        assert_eq!(parse_byte("0x88"), Ok(0x88));
        assert_eq!(parse_byte("136"), Ok(0x88));
        assert!(parse_byte("0x188").is_err());
    }

    #[test]
    fn flags_map_onto_link_config() {
        let cli = Cli::parse_from([
            "laser-bridge",
            "--controller",
            "192.168.1.50",
            "--no-scramble",
            "--no-keepalive",
            "--raw-responses",
            "--max-retries",
            "0",
            "--magic",
            "0x10",
        ]);
        let config = cli.into_config();
        assert_eq!(config.controller.port(), DEFAULT_CONTROLLER_PORT);
        assert!(!config.link.scramble_outbound);
        assert!(config.link.handshake);
        assert!(!config.link.keepalive);
        assert!(!config.link.verify_inbound_checksum);
        assert_eq!(config.link.max_fragment_retries, 0);
        assert_eq!(config.link.magic, 0x10);
        assert_eq!(config.tcp_listen.port(), DEFAULT_TCP_PORT);
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}

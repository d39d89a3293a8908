//! A client for the Tor control port that tracks the consensus, builds
//! circuits under a configurable path policy, and attaches streams to them.
//!
//! # Command-line interface
//!
//! `torctl` takes a single optional `--config FILE` argument pointing at a
//! TOML configuration file (see [`config::Config`]); without one, it runs
//! with hardwired defaults against `127.0.0.1:9051`.
//!
//! # Configuration
//!
//! The configuration file is TOML; see [`config::Config`] for its fields.
//!
//! # Limitations
//!
//! This binary wires the library crates together for a single long-running
//! process; it has no daemonization, no SOCKS proxy of its own (streams are
//! expected to arrive via the control port from some other client of Tor),
//! and no onion-service support.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod config;
mod trace;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::net::{lookup_host, TcpStream};

use torctl_circmgr::{PathBuilder, SelectionManager};
use torctl_netdir::NullGeoIp;
use torctl_proto::Connection;

use config::{Auth, Config};

/// A client of the Tor control port that builds paths and attaches streams.
#[derive(Parser, Debug)]
#[command(name = "torctl", version, about = "A Tor control-port path-construction and stream-attachment controller")]
struct Cli {
    /// Path to a TOML configuration file; defaults are used if omitted.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Override the control port address from the config file (`host:port`).
    #[arg(short = 'a', long, value_name = "ADDR")]
    control_addr: Option<String>,
    /// Override `RUST_LOG`-style filtering (e.g. `debug`, `torctl=trace`).
    #[arg(short, long, value_name = "FILTER")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(filter) = &cli.log_level {
        std::env::set_var("RUST_LOG", filter);
    }
    trace::init();

    let mut config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(addr) = cli.control_addr {
        config.control_addr = addr;
    }

    run(config).await
}

/// Connect, authenticate, subscribe to events, and run the path builder's
/// event loop until the control connection closes.
async fn run(config: Config) -> Result<()> {
    let addr = lookup_host(&config.control_addr)
        .await
        .with_context(|| format!("resolving control address {}", config.control_addr))?
        .next()
        .with_context(|| format!("no address for {}", config.control_addr))?;

    tracing::info!(%addr, "connecting to control port");
    let stream = TcpStream::connect(addr).await.context("connecting to control port")?;
    let (read_half, write_half) = tokio::io::split(stream);
    let (conn, events) = Connection::new(read_half, write_half);

    authenticate(&conn, &config.auth).await.context("authenticating to control port")?;

    conn.setevents(
        &[
            "CIRC".into(),
            "STREAM".into(),
            "NS".into(),
            "NEWDESC".into(),
            "STREAM_BW".into(),
            "ORCONN".into(),
            "DEBUG".into(),
            "INFO".into(),
            "NOTICE".into(),
            "WARN".into(),
            "ERR".into(),
        ],
        false,
    )
    .await
    .context("SETEVENTS")?;
    tracing::info!(
        "subscribed to CIRC, STREAM, NS, NEWDESC, STREAM_BW, ORCONN, and Tor's log event classes"
    );

    let geoip = Arc::new(NullGeoIp);
    let selmgr = SelectionManager::new(config.selection, geoip.clone());
    let (builder, handle) = PathBuilder::new(conn, events, geoip, selmgr);

    let ctrlc_handle = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received ctrl-c; signaling a NEWNYM reclaim before shutdown");
            ctrlc_handle.schedule_immediate(|builder| builder.new_nym());
        }
    });

    builder.run().await;
    Ok(())
}

/// Authenticate to the control port per the configured [`Auth`] method.
async fn authenticate(conn: &Connection, auth: &Auth) -> Result<()> {
    match auth {
        Auth::Null => conn.authenticate("").await.map_err(Into::into),
        Auth::Password(password) => conn.authenticate(password).await.map_err(Into::into),
        Auth::CookieFile(path) => {
            let bytes = std::fs::read(path).with_context(|| format!("reading cookie file {path}"))?;
            if bytes.is_empty() {
                bail!("cookie file {path} is empty");
            }
            let hex = bytes.iter().map(|b| format!("{b:02x}")).collect::<String>();
            conn.authenticate(&hex).await.map_err(Into::into)
        }
    }
}

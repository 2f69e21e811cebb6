use std::fs;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Datelike, Utc};
use clap::Parser;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio::net::{TcpListener, UdpSocket};
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

use skywave_propagation::{IonosphericState, PropagationEngine};
use skywave_protocol::types::Season;
use skywave_store::memory::MemoryStore;

mod acl;
mod bus;
mod channels;
mod config;
mod crypt;
mod ionotask;
mod listeners;
mod router;
mod state;
mod stats;
mod tcp;
mod udp;

use config::ServerConfig;
use state::ServerState;

#[derive(Parser)]
#[command(name = "skywave-server", about = "HF-propagation voice conferencing server")]
struct Args {
    /// Path to configuration file (TOML)
    #[arg(short, long)]
    config: Option<String>,

    /// Path/URL of the persistent store, overrides config
    #[arg(short, long)]
    database: Option<String>,
}

fn main() -> ExitCode {
    // Install the ring crypto provider for rustls
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "skywave_server=info".into()),
        )
        .init();

    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("configuration error: {e:#}");
            return ExitCode::from(1);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to start runtime: {e}");
            return ExitCode::from(2);
        }
    };

    match runtime.block_on(run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(RunError::Bind(e)) => {
            error!("startup error: {e:#}");
            ExitCode::from(1)
        }
        Err(RunError::Runtime(e)) => {
            error!("fatal runtime error: {e:#}");
            ExitCode::from(2)
        }
    }
}

enum RunError {
    /// Configuration or bind failures (exit code 1).
    Bind(anyhow::Error),
    /// Failures after the server came up (exit code 2).
    Runtime(anyhow::Error),
}

fn load_config(args: &Args) -> Result<ServerConfig> {
    let mut config = if let Some(path) = &args.config {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {path}"))?;
        toml::from_str(&content).with_context(|| format!("failed to parse config file {path}"))?
    } else {
        ServerConfig::default()
    };
    if let Some(database) = &args.database {
        config.database = database.clone();
    }
    Ok(config)
}

async fn run(config: ServerConfig) -> std::result::Result<(), RunError> {
    // TLS material is mandatory; a missing certificate is a config error.
    let certs = load_certs(&config.cert_path).map_err(RunError::Bind)?;
    let key = load_key(&config.key_path).map_err(RunError::Bind)?;
    let tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("invalid TLS configuration")
        .map_err(RunError::Bind)?;
    let tls_acceptor = TlsAcceptor::from(Arc::new(tls_config));

    if !config.database.is_empty() {
        info!(
            database = %config.database,
            "external store configured; serving through the in-memory engine this run"
        );
    }
    let store = Arc::new(MemoryStore::new());

    let hf = &config.hf_propagation;
    let season = if hf.auto_season {
        Season::from_month(Utc::now().month())
    } else {
        Season::from_index(hf.season).unwrap_or(Season::Winter)
    };
    let engine = PropagationEngine::new(IonosphericState::new(
        hf.solar_flux_index,
        hf.k_index,
        season,
        hf.auto_season,
    ));

    let state = Arc::new(ServerState::new(config, store, engine));

    let metadata_fields = state.config.metadata_field_types();
    if !metadata_fields.is_empty() {
        info!(count = metadata_fields.len(), "custom metadata fields configured");
    }

    let bind_addr = format!("{}:{}", state.config.bind_host(), state.config.port);
    let tcp_listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind TCP on {bind_addr}"))
        .map_err(RunError::Bind)?;
    info!(addr = %bind_addr, "control listener bound");

    let udp_socket = bind_udp(&bind_addr).map_err(RunError::Bind)?;
    state.set_udp_socket(udp_socket.clone());
    info!(addr = %bind_addr, "voice socket bound");

    // Background tasks: voice loop, ionospheric refresh, stats ingestion,
    // ban expiry. All die with the process.
    {
        let state = state.clone();
        let socket = udp_socket.clone();
        tokio::spawn(async move {
            udp::run_udp_loop(socket, state).await;
        });
    }
    if state.config.hf_propagation.enabled {
        let updater = Arc::new(ionotask::IonosphericUpdater::new(
            state.clone(),
            external_sources(&state.config),
        ));
        tokio::spawn(updater.run());
    }
    {
        let state = state.clone();
        tokio::spawn(stats::run_ingest_loop(state));
    }
    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                interval.tick().await;
                match state.store.prune_expired(Utc::now()).await {
                    Ok(0) => {}
                    Ok(n) => info!(count = n, "pruned expired bans"),
                    Err(e) => warn!("ban pruning failed: {e}"),
                }
            }
        });
    }

    info!("server ready, accepting connections");
    loop {
        tokio::select! {
            accepted = tcp_listener.accept() => {
                let (tcp_stream, peer_addr) = match accepted {
                    Ok(result) => result,
                    Err(e) => {
                        warn!("TCP accept error: {e}");
                        continue;
                    }
                };
                let tls_acceptor = tls_acceptor.clone();
                let state = state.clone();
                tokio::spawn(async move {
                    match tls_acceptor.accept(tcp_stream).await {
                        Ok(tls_stream) => tcp::handle_connection(tls_stream, state).await,
                        Err(e) => warn!(peer = %peer_addr, "TLS handshake failed: {e}"),
                    }
                });
            }
            signal = tokio::signal::ctrl_c() => {
                return match signal {
                    Ok(()) => {
                        info!("shutdown signal received");
                        Ok(())
                    }
                    Err(e) => Err(RunError::Runtime(e.into())),
                };
            }
        }
    }
}

/// External solar-weather feeds named in the config. The fetchers live
/// outside the core; nothing is wired up by default.
fn external_sources(config: &ServerConfig) -> Vec<Arc<dyn ionotask::SolarDataSource>> {
    let hf = &config.hf_propagation;
    if hf.use_external_data && (hf.use_dxview_data || hf.use_swpc_data) {
        warn!("external solar-data fetchers are not bundled; static values remain in effect");
    }
    Vec::new()
}

/// Bind the UDP socket with enlarged buffers to absorb voice bursts.
fn bind_udp(addr: &str) -> Result<Arc<UdpSocket>> {
    let parsed: std::net::SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid UDP address {addr}"))?;
    let domain = if parsed.is_ipv4() {
        socket2::Domain::IPV4
    } else {
        socket2::Domain::IPV6
    };
    let sock = socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))
        .context("failed to create UDP socket")?;
    let _ = sock.set_recv_buffer_size(2 * 1024 * 1024);
    let _ = sock.set_send_buffer_size(2 * 1024 * 1024);
    sock.bind(&parsed.into())
        .with_context(|| format!("failed to bind UDP on {addr}"))?;
    sock.set_nonblocking(true)
        .context("failed to set non-blocking")?;
    let std_sock: std::net::UdpSocket = sock.into();
    Ok(Arc::new(
        UdpSocket::from_std(std_sock).context("failed to wrap UDP socket in tokio")?,
    ))
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let cert_data = fs::read(path).with_context(|| format!("failed to read cert: {path}"))?;
    let mut reader = std::io::BufReader::new(cert_data.as_slice());
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("failed to parse certificates")?;

    if certs.is_empty() {
        anyhow::bail!("no certificates found in {path}");
    }
    Ok(certs)
}

fn load_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let key_data = fs::read(path).with_context(|| format!("failed to read key: {path}"))?;
    let mut reader = std::io::BufReader::new(key_data.as_slice());

    loop {
        match rustls_pemfile::read_one(&mut reader)? {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(PrivateKeyDer::Pkcs1(key)),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(PrivateKeyDer::Pkcs8(key)),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(PrivateKeyDer::Sec1(key)),
            Some(_) => continue, // skip other items
            None => anyhow::bail!("no private key found in {path}"),
        }
    }
}

//! Binary entry point: parses configuration, installs logging, builds the
//! default cipher factory, and runs both acceptors until ctrl-c (§10.3/§10.7).

use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ss_relay::acceptor::{TcpAcceptor, UdpAcceptor};
use ss_relay::cipher::CipherFactory;
use ss_relay::config::{Cli, Config};
use ss_relay::crypto::Chacha20CipherFactory;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let file = Config::load_file(cli.config.as_ref())?;
    let config = Config::resolve(cli, file)?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!(bind = %config.bind, udp_idle_secs = config.udp_idle_timeout.as_secs(), "starting ss-relayd");

    let ciphers: Arc<dyn CipherFactory> = Arc::new(Chacha20CipherFactory::new(&config.password));

    let tcp = TcpAcceptor::bind(config.bind, ciphers.clone()).await?;
    let udp = UdpAcceptor::bind(config.bind, ciphers, config.udp_idle_timeout).await?;

    let tcp_task = tokio::spawn(tcp.serve());
    let udp_task = tokio::spawn(udp.serve());

    tokio::select! {
        res = tcp_task => {
            res??;
        }
        res = udp_task => {
            res??;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("ctrl-c received, shutting down listeners (in-flight sessions drain on their own)");
        }
    }

    Ok(())
}

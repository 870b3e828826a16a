//! capstan-server: startup wiring and the TCP transport for the release
//! service.

#![forbid(unsafe_code)]

use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

use capstan_engine::EngineYard;
use capstan_kube::KubeCluster;
use capstan_service::ReleaseService;
use capstan_store::{MemStore, SecretStore, Storage};

mod dispatch;

#[derive(Parser, Debug)]
#[command(name = "capstan-server", version, about = "Chart release server")]
struct Args {
    /// TCP listen address
    #[arg(long = "listen", default_value = "127.0.0.1:44134")]
    listen: String,

    /// Release record backend
    #[arg(long = "store", value_enum, default_value_t = StoreBackend::Mem)]
    store: StoreBackend,

    /// Namespace the secret backend keeps its records in
    #[arg(long = "store-namespace", default_value = "kube-system")]
    store_namespace: String,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum StoreBackend {
    Mem,
    Secret,
}

fn init_tracing() {
    let env = std::env::var("CAPSTAN_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("CAPSTAN_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid CAPSTAN_METRICS_ADDR; expected host:port");
        }
    }
}

async fn serve_conn(svc: Arc<ReleaseService>, sock: TcpStream) -> Result<()> {
    let (r, mut w) = sock.into_split();
    let mut lines = BufReader::new(r).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let reply = dispatch::dispatch(&svc, &line).await;
        w.write_all(reply.to_string().as_bytes()).await?;
        w.write_all(b"\n").await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let args = Args::parse();

    let client = kube::Client::try_default()
        .await
        .context("building the cluster client")?;
    let store: Arc<dyn Storage> = match args.store {
        StoreBackend::Mem => Arc::new(MemStore::new()),
        StoreBackend::Secret => Arc::new(SecretStore::new(client.clone(), &args.store_namespace)),
    };
    let cluster = Arc::new(KubeCluster::new(client));
    let svc = Arc::new(ReleaseService::new(store, cluster, EngineYard::default()));

    let listener = TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("binding {}", args.listen))?;
    info!(addr = %args.listen, store = ?args.store, "release server listening");

    loop {
        let (sock, peer) = listener.accept().await?;
        let svc = Arc::clone(&svc);
        tokio::spawn(async move {
            if let Err(e) = serve_conn(svc, sock).await {
                warn!(peer = %peer, error = %format!("{:#}", e), "connection ended with error");
            }
        });
    }
}

use gridtx::cache::MemoryBackend;
use gridtx::config::GridConfig;
use gridtx::membership::service::MembershipService;
use gridtx::net::{HttpTransport, MemberResolver};
use gridtx::topology::{RendezvousAffinity, TopologyService};
use gridtx::txn::handlers;
use gridtx::txn::manager::TransactionManager;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 3 {
        eprintln!(
            "Usage: {} --bind <addr:port> [--seed <addr:port>] [--partitions <n>] [--backups <n>] [--lock-timeout-ms <ms>]",
            args[0]
        );
        eprintln!("Example: {} --bind 127.0.0.1:5000", args[0]);
        eprintln!(
            "Example: {} --bind 127.0.0.1:5001 --seed 127.0.0.1:5000",
            args[0]
        );
        std::process::exit(1);
    }

    let mut bind_addr: Option<SocketAddr> = None;
    let mut seed_nodes: Vec<SocketAddr> = vec![];
    let mut cfg = GridConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" => {
                bind_addr = Some(args[i + 1].parse()?);
                i += 2;
            }
            "--seed" => {
                seed_nodes.push(args[i + 1].parse()?);
                i += 2;
            }
            "--partitions" => {
                cfg.partitions = args[i + 1].parse()?;
                i += 2;
            }
            "--backups" => {
                cfg.backups = args[i + 1].parse()?;
                i += 2;
            }
            "--lock-timeout-ms" => {
                cfg.lock_timeout = Duration::from_millis(args[i + 1].parse()?);
                i += 2;
            }
            _ => {
                i += 1;
            }
        }
    }

    let bind_addr = bind_addr.expect("--bind is required");
    let http_addr = SocketAddr::new(bind_addr.ip(), bind_addr.port() + 1000);

    tracing::info!("Starting node on {} (http {})", bind_addr, http_addr);
    if !seed_nodes.is_empty() {
        tracing::info!("Seed nodes: {:?}", seed_nodes);
    } else {
        tracing::info!("Starting as seed node (founder)");
    }

    // 1. Membership (UDP gossip) feeding topology events:
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let membership =
        MembershipService::new(bind_addr, http_addr, seed_nodes, events_tx).await?;
    tracing::info!("Node ID: {}", membership.local_node.id);

    // 2. Topology service bridged to membership:
    let topology = TopologyService::new(&cfg, Arc::new(RendezvousAffinity::new()));
    let _bridge = topology.bridge(events_rx);

    // 3. Transaction manager over the HTTP transport:
    let resolver = Arc::new(MemberResolver::new(membership.clone()));
    let transport = Arc::new(HttpTransport::new(resolver));
    let manager = TransactionManager::new(
        membership.local_node.id.clone(),
        cfg,
        topology.clone(),
        Arc::new(MemoryBackend::new()),
        transport,
    );
    manager.start();

    // 4. HTTP router (protocol + debug endpoints):
    let app = handlers::router(manager.clone());

    // 5. Spawn membership service:
    membership.clone().start().await;

    // 6. Spawn stats reporter:
    let stats_membership = membership.clone();
    let stats_topology = topology.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));
        loop {
            interval.tick().await;
            let alive = stats_membership.get_alive_members();
            tracing::info!(
                "Cluster stats: {} alive nodes, topology v{}",
                alive.len(),
                stats_topology.current_version()
            );
            for node in alive {
                tracing::info!(
                    "  - {} gossip={} http={} (inc={})",
                    node.id,
                    node.gossip_addr,
                    node.http_addr,
                    node.incarnation
                );
            }
        }
    });

    // 7. Start HTTP server:
    tracing::info!("HTTP server listening on {}", http_addr);
    tracing::info!("Press Ctrl+C to shutdown");

    let listener = tokio::net::TcpListener::bind(http_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

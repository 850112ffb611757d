//! fluxgate daemon
//!
//! One fluxgated runs next to each backend database instance. It keeps
//! the node's membership record, token ownership and partition keys in
//! sync with the coordination store, gossips liveness with its peers,
//! runs the join protocol when the node is new, and drains hint and
//! work queues in the background.

use fluxgate::api::{self, ApiState};
use fluxgate::cluster::{
    self, gossip::Gossip, identity, nodes, resolver, Node, NodeCollection, NodeMeta, NodeStatus,
    Partitioner, Resolver, TokenObserver, TokenRegistry,
};
use fluxgate::coordination::{
    CoordinationConfig, CoordinationStore, EtcdCoordinator, MemoryCoordinator, SettingsStore,
};
use fluxgate::hints::{
    self, HintConfig, HintStore, HttpHintReplayer, RecoveryDriver,
};
use fluxgate::rebalance::{
    HttpImporter, Importer, JoinProtocol, ReliableImportHandler, WorkHandler, WorkQueue,
    WorkQueueConfig, WorkQueueConsumer,
};
use fluxgate::{Error, Result};

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// fluxgate clustering daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// IP address for client HTTP requests
    #[arg(long, default_value = "0.0.0.0")]
    client_addr: String,

    /// Port for client HTTP requests
    #[arg(long, default_value = "8086")]
    client_port: u16,

    /// Backend database endpoint
    #[arg(long, default_value = "127.0.0.1:28086")]
    data: String,

    /// Comma-separated etcd endpoints; empty runs the in-memory store
    /// (single node, development only)
    #[arg(long, env = "FLUXGATE_ETCD", default_value = "")]
    etcd: String,

    /// Comma-separated peer gossip addresses to join
    #[arg(long, default_value = "")]
    join: String,

    /// Gossip bind port
    #[arg(long, default_value = "18086")]
    gossip_port: u16,

    /// Node name override; defaults to the persisted identity or the
    /// OS hostname
    #[arg(long)]
    node_name: Option<String>,

    /// Directory for local state (identity, hint log)
    #[arg(long, default_value = "/var/lib/fluxgate")]
    meta_dir: PathBuf,

    /// Tokens seeded when bootstrapping a new cluster
    #[arg(long, default_value = "16")]
    initial_tokens: usize,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(&args.log_level);

    match run(args).await {
        Ok(()) => info!("fluxgated shut down cleanly"),
        Err(err) => {
            error!(%err, "fatal error");
            std::process::exit(1);
        }
    }
}

fn init_logging(level: &str) {
    let log_level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .json()
        .init();
}

async fn run(args: Args) -> Result<()> {
    info!("starting fluxgated");
    let cancel = CancellationToken::new();

    // Coordination store: etcd in production, memory for development.
    let store: Arc<dyn CoordinationStore> = if args.etcd.is_empty() {
        warn!("no etcd endpoints configured, using in-memory store");
        Arc::new(MemoryCoordinator::new())
    } else {
        let config = CoordinationConfig {
            endpoints: args.etcd.split(',').map(str::to_string).collect(),
            dial_timeout: Duration::from_secs(5),
        };
        Arc::new(EtcdCoordinator::connect(&config).await?)
    };

    // Stable node identity, persisted on first launch.
    let node_name = identity::load_or_create(&args.meta_dir, args.node_name.as_deref())?;
    info!(node = %node_name, data = %args.data, "node identity");

    // Register or refresh our membership record.
    let existing = nodes::load_node(store.as_ref(), &node_name).await?;
    let is_new = existing.is_none();
    let mut local_node = existing.unwrap_or_else(|| Node::new(&node_name, &args.data));
    local_node.data_location = args.data.clone();
    nodes::save_node(store.as_ref(), &local_node).await?;

    let node_collection = NodeCollection::synced(Arc::clone(&store), cancel.clone()).await?;

    // A returning node may find hints addressed to it: stay in
    // Recovering until the other nodes have drained them.
    if !is_new {
        let markers = store
            .list(&format!("/hints/{node_name}/"))
            .await?;
        if !markers.kvs.is_empty() {
            info!(pending = markers.kvs.len(), "returning node has hinted data, recovering");
            local_node.status = NodeStatus::Recovering;
            nodes::save_node(store.as_ref(), &local_node).await?;
            hints::wait_until_recovered(store.as_ref(), &node_name).await?;
            local_node.status = NodeStatus::Up;
            nodes::save_node(store.as_ref(), &local_node).await?;
        }
    }

    // Resolver, kept live from the token registry and settings.
    let settings = SettingsStore::new(Arc::clone(&store));
    let replication_factor = settings.replication_factor().await?;
    let resolver = Resolver::new(Arc::clone(&node_collection), replication_factor);
    tokio::spawn(resolver::run_ring_sync(
        Arc::clone(&resolver),
        Arc::clone(&store),
        cancel.clone(),
    ));
    {
        let resolver = Arc::clone(&resolver);
        let mut factor_watch = settings.watch_replication_factor().await?;
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    factor = factor_watch.recv() => match factor {
                        Some(factor) => {
                            info!(factor, "replication factor changed");
                            resolver.set_replication_factor(factor);
                        }
                        None => return,
                    },
                }
            }
        });
    }

    let registry = Arc::new(TokenRegistry::new(
        Arc::clone(&store),
        cluster::ClusterConfig {
            initial_tokens: args.initial_tokens,
            ..Default::default()
        },
    ));

    // Partition keys, synced from the store.
    let partitioner = Partitioner::synced(Arc::clone(&store), cancel.clone()).await?;

    // Work queue consumer executing import/delete jobs for this node.
    let importer: Arc<dyn Importer> = Arc::new(HttpImporter::new(&args.data));
    let work_queue = Arc::new(WorkQueue::new(Arc::clone(&store)));
    let handler: Arc<dyn WorkHandler> = Arc::new(ReliableImportHandler::new(
        Arc::clone(&registry),
        Arc::clone(&resolver),
        Arc::clone(&node_collection),
        Arc::clone(&importer),
        &node_name,
        &args.data,
    ));
    {
        let consumer = WorkQueueConsumer::new(
            Arc::clone(&store),
            &node_name,
            handler,
            WorkQueueConfig::default(),
        );
        let cancel = cancel.clone();
        tokio::spawn(async move { consumer.run(cancel).await });
    }

    // Hinted handoff: local durable store plus the recovery driver.
    let hint_config = HintConfig {
        dir: args.meta_dir.join("hints"),
        ..Default::default()
    };
    let hint_store = Arc::new(Mutex::new(
        HintStore::open(&hint_config.dir, &node_name, Some(Arc::clone(&store))).await?,
    ));
    {
        let driver = RecoveryDriver::new(
            Arc::clone(&hint_store),
            Arc::clone(&node_collection),
            Arc::new(HttpHintReplayer::new()),
            hint_config,
        );
        let cancel = cancel.clone();
        tokio::spawn(async move { driver.run(cancel).await });
    }

    // Join/rebalance protocol, also handling node removals.
    let join_protocol = Arc::new(JoinProtocol::new(
        Arc::clone(&store),
        Arc::clone(&registry),
        Arc::clone(&resolver),
        Arc::clone(&node_collection),
        Arc::clone(&importer),
        Arc::clone(&work_queue),
        &node_name,
        &args.data,
        args.initial_tokens,
    ));
    {
        // Removed nodes get their tokens redistributed; every node
        // computes the same groups, push is idempotent enough for the
        // receivers to dedup by execution.
        let join_protocol = Arc::clone(&join_protocol);
        node_collection.on_remove(move |removed| {
            let join_protocol = Arc::clone(&join_protocol);
            let removed = removed.clone();
            tokio::spawn(async move {
                if let Err(err) = join_protocol.redistribute_removed(&removed).await {
                    error!(removed = %removed.name, %err, "token redistribution failed");
                }
            });
        });
    }

    // Gossip overlay for liveness between store updates. Its token
    // events feed the resolver; the registry watch corrects any
    // disagreement on the next tick.
    let gossip = Gossip::bind(
        cluster::GossipConfig {
            bind_port: args.gossip_port,
            ..Default::default()
        },
        NodeMeta {
            name: node_name.clone(),
            tokens: resolver.tokens_of(&node_name),
            status: local_node.status,
        },
    )
    .await?;
    gossip.register_observer(Arc::new(RingTokenObserver {
        resolver: Arc::clone(&resolver),
    }));
    tokio::spawn(Arc::clone(&gossip).run(cancel.clone()));
    let seeds: Vec<String> = args
        .join
        .split(',')
        .filter(|seed| !seed.is_empty())
        .map(str::to_string)
        .collect();
    if !seeds.is_empty() {
        info!(seeds = ?seeds, "joining gossip overlay");
        gossip.join(&seeds).await?;
    }

    // Status surface for the proxy layer. Started before the join so
    // peers can see our state while we import.
    let api_addr: SocketAddr = format!("{}:{}", args.client_addr, args.client_port)
        .parse()
        .map_err(|err| Error::Config(format!("invalid client address: {err}")))?;
    {
        let state = ApiState {
            node_name: node_name.clone(),
            nodes: Arc::clone(&node_collection),
            resolver: Arc::clone(&resolver),
            partitioner: Arc::clone(&partitioner),
        };
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = api::serve(api_addr, state, cancel).await {
                error!(%err, "status API failed");
            }
        });
    }

    // New nodes bootstrap or steal their share of the ring.
    if is_new {
        let outcome = join_protocol.run().await?;
        info!(?outcome, "join protocol finished");
        gossip.update_local(NodeMeta {
            name: node_name.clone(),
            tokens: resolver.tokens_of(&node_name),
            status: NodeStatus::Up,
        });
    }

    shutdown_signal().await;
    info!("shutting down, cancelling tasks");
    cancel.cancel();
    Ok(())
}

/// Applies advisory gossip token events to the resolver.
struct RingTokenObserver {
    resolver: Arc<Resolver>,
}

impl TokenObserver for RingTokenObserver {
    fn token_added(&self, token: u32, node: &str) {
        self.resolver.add_token(token, node);
    }

    fn token_removed(&self, token: u32, node: &str) {
        // Only drop the token if the departed node still owns it; a
        // registry reassignment may already have moved it.
        self.resolver.remove_token_owned_by(token, node);
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

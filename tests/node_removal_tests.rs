//! Node removal: tokens of the departed node are redistributed through
//! durable import jobs that the surviving nodes drain themselves.

use async_trait::async_trait;
use fluxgate::cluster::{
    nodes::tombstone_node, resolver::run_ring_sync, ClusterConfig, Node, NodeCollection,
    NodeStatus, Resolver, TokenRegistry, TOKEN_RANGE,
};
use fluxgate::coordination::{CoordinationStore, MemoryCoordinator};
use fluxgate::rebalance::{
    Importer, JoinProtocol, ReliableImportHandler, WorkHandler, WorkQueue, WorkQueueConfig,
    WorkQueueConsumer, WorkState,
};
use fluxgate::Result;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct MockImporter {
    imports: Mutex<Vec<(Vec<u32>, String)>>,
}

#[async_trait]
impl Importer for MockImporter {
    async fn import(&self, tokens: &[u32], source: &str) -> Result<u64> {
        self.imports.lock().push((tokens.to_vec(), source.to_string()));
        Ok(tokens.len() as u64 * 100)
    }

    async fn delete(&self, _token: u32) -> Result<()> {
        Ok(())
    }
}

struct Member {
    resolver: Arc<Resolver>,
    importer: Arc<MockImporter>,
    consumer: WorkQueueConsumer,
}

fn member(
    store: &Arc<MemoryCoordinator>,
    nodes: &Arc<NodeCollection>,
    cancel: &CancellationToken,
    name: &'static str,
) -> Member {
    let store: Arc<dyn CoordinationStore> = Arc::clone(store) as _;
    let resolver = Resolver::new(Arc::clone(nodes), 2);
    tokio::spawn(run_ring_sync(
        Arc::clone(&resolver),
        Arc::clone(&store),
        cancel.clone(),
    ));
    let registry = Arc::new(TokenRegistry::new(
        Arc::clone(&store),
        ClusterConfig::default(),
    ));
    let importer = Arc::new(MockImporter::default());
    let handler = Arc::new(ReliableImportHandler::new(
        registry,
        Arc::clone(&resolver),
        Arc::clone(nodes),
        Arc::clone(&importer) as Arc<dyn Importer>,
        name,
        format!("{name}:28086"),
    ));
    let consumer = WorkQueueConsumer::new(
        Arc::clone(&store),
        name,
        handler as Arc<dyn WorkHandler>,
        WorkQueueConfig {
            retry_backoff: Duration::from_millis(10),
            ..Default::default()
        },
    );
    Member {
        resolver,
        importer,
        consumer,
    }
}

async fn save_up_node(store: &MemoryCoordinator, name: &str) {
    let mut node = Node::new(name, format!("{name}:28086"));
    node.status = NodeStatus::Up;
    fluxgate::cluster::nodes::save_node(store, &node).await.unwrap();
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

/// Three nodes where a and b split 16 tokens evenly and c is an empty
/// member; then b is removed.
#[tokio::test]
async fn test_removed_nodes_tokens_are_redistributed() {
    let store = Arc::new(MemoryCoordinator::new());
    let cancel = CancellationToken::new();
    let nodes = NodeCollection::synced(Arc::clone(&store) as _, cancel.clone())
        .await
        .unwrap();

    save_up_node(&store, "a").await;
    save_up_node(&store, "b").await;
    save_up_node(&store, "c").await;

    let registry = TokenRegistry::new(Arc::clone(&store) as _, ClusterConfig::default());
    registry.init_many("a", 16).await.unwrap();
    // Give b every other token so both nodes appear all around the ring.
    let spacing = TOKEN_RANGE / 16;
    for i in (1..16u32).step_by(2) {
        registry.assign(i * spacing, "b").await.unwrap();
    }

    let member_a = member(&store, &nodes, &cancel, "a");
    let member_c = member(&store, &nodes, &cancel, "c");
    settle().await;

    // The removal handler runs on node a (in production every node
    // registers it; the jobs it pushes are the same either way).
    let join_a = JoinProtocol::new(
        Arc::clone(&store) as _,
        Arc::new(TokenRegistry::new(
            Arc::clone(&store) as _,
            ClusterConfig::default(),
        )),
        Arc::clone(&member_a.resolver),
        Arc::clone(&nodes),
        Arc::new(MockImporter::default()) as Arc<dyn Importer>,
        Arc::new(WorkQueue::new(Arc::clone(&store) as _)),
        "a",
        "a:28086",
        16,
    );

    tombstone_node(store.as_ref(), "b").await.unwrap();
    settle().await;
    let removed = nodes.get("b").unwrap();
    assert_eq!(removed.status, NodeStatus::Removed);
    join_a.redistribute_removed(&removed).await.unwrap();

    // B's 8 tokens divide 4/4 between the survivors.
    let queue = WorkQueue::new(Arc::clone(&store) as _);
    let jobs_a = queue.items("a").await.unwrap();
    let jobs_c = queue.items("c").await.unwrap();
    assert_eq!(jobs_a.len(), 1);
    assert_eq!(jobs_c.len(), 1);
    assert_eq!(jobs_a[0].payload.tokens.len(), 4);
    assert_eq!(jobs_c[0].payload.tokens.len(), 4);
    assert!(jobs_a[0].payload.assign);

    // Receivers drain their own queues.
    while member_a.consumer.run_once().await.unwrap() {}
    while member_c.consumer.run_once().await.unwrap() {}
    settle().await;

    // Token conservation: every token has exactly one owner and b owns
    // nothing.
    let assignments = registry.get().await.unwrap();
    assert_eq!(assignments.len(), 16);
    assert!(assignments.values().all(|owner| owner != "b"));
    assert_eq!(assignments.values().filter(|o| *o == "a").count(), 12);
    assert_eq!(assignments.values().filter(|o| *o == "c").count(), 4);

    // The takers imported the data before assigning, from a live
    // replica rather than from the dead node.
    let sources: HashSet<String> = member_a
        .importer
        .imports
        .lock()
        .iter()
        .chain(member_c.importer.imports.lock().iter())
        .map(|(_, source)| source.clone())
        .collect();
    assert!(!sources.contains("b:28086"), "imported from the removed node");
    assert!(!sources.is_empty());
    cancel.cancel();
}

/// A failing import does not lose the job: it retries and eventually
/// surfaces as Failed for operators.
#[tokio::test]
async fn test_failed_imports_surface_to_operators() {
    struct FailingImporter;

    #[async_trait]
    impl Importer for FailingImporter {
        async fn import(&self, _tokens: &[u32], _source: &str) -> Result<u64> {
            Err(fluxgate::Error::Import("backend down".to_string()))
        }
        async fn delete(&self, _token: u32) -> Result<()> {
            Ok(())
        }
    }

    let store = Arc::new(MemoryCoordinator::new());
    let cancel = CancellationToken::new();
    let nodes = NodeCollection::synced(Arc::clone(&store) as _, cancel.clone())
        .await
        .unwrap();
    save_up_node(&store, "a").await;
    save_up_node(&store, "c").await;

    let registry = TokenRegistry::new(Arc::clone(&store) as _, ClusterConfig::default());
    registry.init_many("a", 4).await.unwrap();

    let resolver = Resolver::new(Arc::clone(&nodes), 2);
    tokio::spawn(run_ring_sync(
        Arc::clone(&resolver),
        Arc::clone(&store) as _,
        cancel.clone(),
    ));
    settle().await;

    let handler = Arc::new(ReliableImportHandler::new(
        Arc::new(TokenRegistry::new(
            Arc::clone(&store) as _,
            ClusterConfig::default(),
        )),
        Arc::clone(&resolver),
        Arc::clone(&nodes),
        Arc::new(FailingImporter) as Arc<dyn Importer>,
        "c",
        "c:28086",
    ));
    let consumer = WorkQueueConsumer::new(
        Arc::clone(&store) as _,
        "c",
        handler as Arc<dyn WorkHandler>,
        WorkQueueConfig {
            max_attempts: 2,
            retry_backoff: Duration::from_millis(10),
            ..Default::default()
        },
    );

    let queue = WorkQueue::new(Arc::clone(&store) as _);
    queue
        .push(
            "c",
            fluxgate::rebalance::WorkKind::Import,
            fluxgate::rebalance::WorkPayload {
                tokens: vec![0],
                followers: vec![],
                source: Some("a:28086".to_string()),
                assign: true,
            },
        )
        .await
        .unwrap();

    while consumer.run_once().await.unwrap() {}
    let items = queue.items("c").await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].state, WorkState::Failed);
    assert_eq!(items[0].attempts, 2);

    // Ownership never moved.
    let assignments = registry.get().await.unwrap();
    assert!(assignments.values().all(|owner| owner == "a"));
    cancel.cancel();
}

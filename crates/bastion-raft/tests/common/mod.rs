//! Shared harness for backend integration tests: one process, several
//! nodes, each with its own data directory and cluster listener on a
//! loopback port, all sharing one transport keyring.

// Not every test binary uses every helper.
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bastion_cluster::ClusterListener;
use bastion_cluster::SharedKeyring;
use bastion_cluster::TlsKeyring;
use bastion_core::NoopEncryptor;
use bastion_raft::backend::SetupOptions;
use bastion_raft::RaftBackend;
use parking_lot::RwLock;
use tempfile::TempDir;

pub struct TestNode {
    pub name: String,
    pub addr: SocketAddr,
    pub backend: Arc<RaftBackend>,
    pub listener: Arc<ClusterListener>,
    // Held so the data directory outlives the node.
    pub dir: TempDir,
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

pub fn shared_keyring() -> SharedKeyring {
    Arc::new(RwLock::new(TlsKeyring::new().unwrap()))
}

/// Start a node: bind a listener, construct the backend, unseal.
pub async fn start_node(
    name: &str,
    keyring: &SharedKeyring,
    extra: &[(&str, &str)],
) -> TestNode {
    let dir = tempfile::tempdir().unwrap();
    start_node_in(name, keyring, extra, dir).await
}

/// Start a node over an existing data directory (restart scenarios).
pub async fn start_node_in(
    name: &str,
    keyring: &SharedKeyring,
    extra: &[(&str, &str)],
    dir: TempDir,
) -> TestNode {
    let listener = Arc::new(ClusterListener::new(vec!["127.0.0.1:0".parse().unwrap()]));
    listener.run().await.unwrap();
    let addr = listener.local_addrs()[0];

    let mut conf: HashMap<String, String> = HashMap::new();
    conf.insert("path".to_string(), dir.path().display().to_string());
    conf.insert("node_id".to_string(), name.to_string());
    for (key, value) in extra {
        conf.insert(key.to_string(), value.to_string());
    }

    let backend = RaftBackend::new(&conf).unwrap();
    backend
        .unseal(SetupOptions {
            sealer: Arc::new(NoopEncryptor),
            listener: Arc::clone(&listener),
            keyring: Arc::clone(keyring),
            cluster_addr: addr,
            metric_hooks: Default::default(),
        })
        .await
        .unwrap();

    TestNode {
        name: name.to_string(),
        addr,
        backend,
        listener,
        dir,
    }
}

impl TestNode {
    pub async fn shutdown(&self) {
        self.backend.seal().await.unwrap();
        self.listener.stop().await;
    }
}

/// Poll until this backend observes itself as leader.
pub async fn wait_for_leader(backend: &Arc<RaftBackend>, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !backend.is_leader().await {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for leadership");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Poll until the committed configuration has `voters` voting members.
pub async fn wait_for_voters(backend: &Arc<RaftBackend>, voters: usize, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let count = backend
            .peers()
            .await
            .map(|peers| peers.iter().filter(|p| p.suffrage == "voter").count())
            .unwrap_or(0);
        if count == voters {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {voters} voters; have {count}");
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

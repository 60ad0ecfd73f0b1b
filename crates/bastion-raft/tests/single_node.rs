//! Single-node lifecycle: bootstrap, physical operations, durability across
//! seal/unseal, the leadership lock, and snapshot administration.

mod common;

use std::time::Duration;

use bastion_core::Backend;
use bastion_core::BackendError;
use bastion_core::Entry;
use bastion_core::HaBackend;
use bastion_core::TxnEntry;
use bastion_raft::snapshot::FSM_SNAPSHOT_ID;
use common::init_tracing;
use common::shared_keyring;
use common::start_node;
use common::start_node_in;
use common::wait_for_leader;
use tokio_util::sync::CancellationToken;

const LEADER_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn put_get_delete_list_and_transaction() {
    init_tracing();
    let keyring = shared_keyring();
    let node = start_node("core-0", &keyring, &[]).await;
    let backend = &node.backend;
    wait_for_leader(backend, LEADER_TIMEOUT).await;

    // Leader-local read-after-write.
    backend
        .put(Entry::new("secret/foo", b"zork".to_vec()))
        .await
        .unwrap();
    assert_eq!(backend.get("secret/foo").await.unwrap().unwrap().value, b"zork");

    // Delete makes the key unobservable.
    backend.delete("secret/foo").await.unwrap();
    assert!(backend.get("secret/foo").await.unwrap().is_none());

    // A transaction applies in order, atomically.
    backend
        .transaction(vec![
            TxnEntry::put(Entry::new("a", b"1".to_vec())),
            TxnEntry::put(Entry::new("a", b"2".to_vec())),
            TxnEntry::delete("a"),
            TxnEntry::put(Entry::new("a", b"3".to_vec())),
        ])
        .await
        .unwrap();
    assert_eq!(backend.get("a").await.unwrap().unwrap().value, b"3");

    // Folder collapsing on list.
    for key in ["secret/a", "secret/sub/one", "secret/sub/two"] {
        backend.put(Entry::new(key, b"x".to_vec())).await.unwrap();
    }
    assert_eq!(backend.list("secret/").await.unwrap(), vec!["a", "sub/"]);

    node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn oversized_entry_is_rejected() {
    init_tracing();
    let keyring = shared_keyring();
    let node = start_node("core-0", &keyring, &[("max_entry_size", "4096")]).await;
    let backend = &node.backend;
    wait_for_leader(backend, LEADER_TIMEOUT).await;

    let err = backend
        .put(Entry::new("big", vec![0u8; 8192]))
        .await
        .unwrap_err();
    assert!(matches!(err, BackendError::ValueTooLarge { .. }));

    node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn data_survives_seal_and_restart() {
    init_tracing();
    let keyring = shared_keyring();
    let node = start_node("core-0", &keyring, &[]).await;
    wait_for_leader(&node.backend, LEADER_TIMEOUT).await;

    node.backend
        .put(Entry::new("durable/key", b"survives".to_vec()))
        .await
        .unwrap();
    let applied = node.backend.applied_index();
    node.shutdown().await;

    let common::TestNode { dir, .. } = node;
    let reopened = start_node_in("core-0", &keyring, &[], dir).await;

    // State machine content is there before any new leadership activity.
    assert_eq!(
        reopened.backend.get("durable/key").await.unwrap().unwrap().value,
        b"survives"
    );
    assert!(reopened.backend.applied_index() >= applied);

    let backend = &reopened.backend;
    wait_for_leader(backend, LEADER_TIMEOUT).await;
    backend.put(Entry::new("durable/second", b"y".to_vec())).await.unwrap();

    reopened.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lock_acquires_with_leadership() {
    init_tracing();
    let keyring = shared_keyring();
    let node = start_node("core-0", &keyring, &[]).await;
    let backend = &node.backend;
    wait_for_leader(backend, LEADER_TIMEOUT).await;

    let lock = backend
        .lock_with("core/lock".to_string(), b"core-0".to_vec())
        .unwrap();
    let leader_lost = lock
        .lock(CancellationToken::new())
        .await
        .unwrap()
        .expect("lock acquired");
    assert!(!leader_lost.is_cancelled());

    let (held, value) = lock.value().await.unwrap();
    assert!(held);
    assert_eq!(value, b"core-0");

    // Unlock is a storage-layer no-op.
    lock.unlock().await.unwrap();
    assert!(!leader_lost.is_cancelled());

    node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn snapshot_listing_and_admin_export() {
    init_tracing();
    let keyring = shared_keyring();
    let node = start_node("core-0", &keyring, &[]).await;
    let backend = &node.backend;
    wait_for_leader(backend, LEADER_TIMEOUT).await;

    for i in 0..100u32 {
        backend
            .put(Entry::new(format!("key-{i:03}"), format!("value-{i}").into_bytes()))
            .await
            .unwrap();
    }

    backend.trigger_snapshot().await.unwrap();

    // The store reports exactly one snapshot: the FSM itself.
    let listed = backend.list_snapshots().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].meta.snapshot_id, FSM_SNAPSHOT_ID);

    // The administrative export round-trips through its sealed envelope.
    let mut exported = Vec::new();
    backend.snapshot_to(&mut exported).await.unwrap();
    assert!(!exported.is_empty());

    node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn wal_log_store_serves_a_node() {
    init_tracing();
    let keyring = shared_keyring();
    let node = start_node("core-0", &keyring, &[("raft_wal", "true")]).await;
    let backend = &node.backend;
    wait_for_leader(backend, LEADER_TIMEOUT).await;

    for i in 0..50u32 {
        backend
            .put(Entry::new(format!("wal/key-{i}"), format!("{i}").into_bytes()))
            .await
            .unwrap();
    }
    assert_eq!(backend.get("wal/key-25").await.unwrap().unwrap().value, b"25");
    node.shutdown().await;

    // The write-ahead log replays across a restart.
    let common::TestNode { dir, .. } = node;
    assert!(dir.path().join("raft").join("wal").exists());
    let reopened = start_node_in("core-0", &keyring, &[("raft_wal", "true")], dir).await;
    assert_eq!(
        reopened.backend.get("wal/key-49").await.unwrap().unwrap().value,
        b"49"
    );
    reopened.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn keyring_rotation_commits_before_swap() {
    init_tracing();
    let keyring = shared_keyring();
    let node = start_node("core-0", &keyring, &[]).await;
    let backend = &node.backend;
    wait_for_leader(backend, LEADER_TIMEOUT).await;

    let before = keyring.read().active_key_id.clone();
    let rotated = backend.rotate_keyring().await.unwrap();
    assert_ne!(before, rotated);
    assert_eq!(keyring.read().active_key_id, rotated);

    // The superseded key stays acceptable for the grace window.
    let old_cert = keyring.read().keys.iter().find(|k| k.id == before).map(|k| k.cert_der.clone());
    assert!(old_cert.is_some());

    // The rotation is replicated: the keyring record reads back through the
    // physical interface.
    let stored = backend
        .get(bastion_raft::backend::TLS_KEYRING_PATH)
        .await
        .unwrap()
        .expect("keyring record replicated");
    let decoded: bastion_cluster::TlsKeyring = bincode::deserialize(&stored.value).unwrap();
    assert_eq!(decoded.active_key_id, rotated);

    node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sealed_backend_reports_sealed_errors() {
    init_tracing();
    let keyring = shared_keyring();
    let node = start_node("core-0", &keyring, &[]).await;
    let backend = &node.backend;
    wait_for_leader(backend, LEADER_TIMEOUT).await;

    backend.put(Entry::new("k", b"v".to_vec())).await.unwrap();
    node.shutdown().await;

    // Reads still serve from the local state machine; writes are rejected.
    assert_eq!(node.backend.get("k").await.unwrap().unwrap().value, b"v");
    let err = node.backend.put(Entry::new("k2", b"v".to_vec())).await.unwrap_err();
    assert!(matches!(err, BackendError::Sealed));
    assert!(matches!(node.backend.peers().await.unwrap_err(), BackendError::Sealed));
}

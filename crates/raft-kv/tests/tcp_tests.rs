//! # tcp cluster tests
//!
//! why: the same service must work over real sockets, not just the in-memory network
//! relations: raft-kv services wired with TcpTransport, file storage from raft-storage
//! what: single-node and three-node clusters on loopback

use std::sync::Arc;
use std::time::Duration;

use raft_kv::{KvClient, KvService, RaftSettings, TcpClientTransport, TcpTransport};
use raft_storage::FileStorage;
use tempfile::TempDir;
use tokio::net::TcpListener;

async fn start_cluster(n: u64, dirs: &[TempDir]) -> (Vec<Arc<KvService>>, Vec<String>) {
    let mut listeners = Vec::new();
    let mut addrs = Vec::new();
    for _ in 0..n {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        addrs.push(listener.local_addr().unwrap().to_string());
        listeners.push(listener);
    }

    let mut services = Vec::new();
    for (id, listener) in (0..n).zip(listeners) {
        let peers = (0..n).filter(|&p| p != id).collect();
        let service = KvService::start(
            id,
            peers,
            Box::new(FileStorage::new(dirs[id as usize].path()).unwrap()),
            Arc::new(TcpTransport::new(id)),
            RaftSettings::default(),
        )
        .unwrap();
        service.serve_tcp(listener);
        services.push(service);
    }
    for service in &services {
        for peer in 0..n {
            if peer != service.id() {
                service.connect_to_peer(peer, &addrs[peer as usize]).unwrap();
            }
        }
    }
    (services, addrs)
}

async fn stop(services: Vec<Arc<KvService>>) {
    // shutdown alone must close the pooled peer connections
    for service in services {
        service.shutdown().await;
        assert_eq!(service.active_tasks(), 0);
    }
}

fn client(addrs: &[String]) -> KvClient {
    KvClient::new(Arc::new(TcpClientTransport), addrs.to_vec())
        .with_deadline(Duration::from_secs(10))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_node_over_tcp() {
    let dirs = vec![TempDir::new().unwrap()];
    let (services, addrs) = start_cluster(1, &dirs).await;

    let client = client(&addrs);
    assert_eq!(client.put("k", "v").await.unwrap(), (String::new(), false));
    assert_eq!(client.get("k").await.unwrap(), ("v".to_string(), true));

    stop(services).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_nodes_over_tcp() {
    let dirs: Vec<TempDir> = (0..3).map(|_| TempDir::new().unwrap()).collect();
    let (services, addrs) = start_cluster(3, &dirs).await;

    let client = client(&addrs);
    client.put("llave", "cosa").await.unwrap();
    assert_eq!(
        client.put("llave", "frodo").await.unwrap(),
        ("cosa".to_string(), true)
    );
    assert_eq!(
        client.cas("llave", "frodo", "mafteah").await.unwrap(),
        ("frodo".to_string(), true)
    );
    assert_eq!(
        client.get("llave").await.unwrap(),
        ("mafteah".to_string(), true)
    );

    let leaders = services
        .iter()
        .filter(|s| s.report().unwrap().is_leader)
        .count();
    assert_eq!(leaders, 1);

    stop(services).await;

    // the log made it to disk on every node
    for dir in &dirs {
        assert!(dir.path().join("log.jsonl").exists());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_node_recovers_from_disk() {
    let dirs = vec![TempDir::new().unwrap()];
    {
        let (services, addrs) = start_cluster(1, &dirs).await;
        client(&addrs).put("durable", "yes").await.unwrap();
        stop(services).await;
    }

    let (services, addrs) = start_cluster(1, &dirs).await;
    assert_eq!(
        client(&addrs).get("durable").await.unwrap(),
        ("yes".to_string(), true)
    );
    stop(services).await;
}

//! shared harness for cluster tests: n services on one in-memory network,
//! with helpers to partition, crash and restart them

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use raft_kv::{KvClient, KvService, MemoryNetwork, NodeId, RaftSettings};
use raft_storage::InMemoryStorage;
use tokio::time::sleep;

pub fn addr(id: NodeId) -> String {
    format!("mem://node-{id}")
}

pub struct Harness {
    pub network: MemoryNetwork,
    services: Vec<Option<Arc<KvService>>>,
    storages: Vec<InMemoryStorage>,
    connected: Vec<bool>,
    settings: RaftSettings,
}

impl Harness {
    pub fn new(n: usize) -> Self {
        let network = MemoryNetwork::new()
            .with_latency(Duration::from_millis(1), Duration::from_millis(5));
        let mut harness = Self {
            network,
            services: Vec::new(),
            storages: (0..n).map(|_| InMemoryStorage::new()).collect(),
            connected: vec![true; n],
            settings: RaftSettings::default(),
        };

        for id in 0..n {
            let service = harness.start_service(id as NodeId);
            harness.services.push(Some(service));
        }
        for id in 0..n {
            harness.reconnect_service_to_peers(id as NodeId);
        }
        harness
    }

    pub fn len(&self) -> usize {
        self.storages.len()
    }

    fn start_service(&self, id: NodeId) -> Arc<KvService> {
        let peers = (0..self.len() as NodeId)
            .filter(|&p| p != id)
            .collect();
        let service = KvService::start(
            id,
            peers,
            Box::new(self.storages[id as usize].clone()),
            Arc::new(self.network.transport(id)),
            self.settings.clone(),
        )
        .expect("service starts");
        self.network.register(addr(id), service.clone());
        service
    }

    pub fn service(&self, id: NodeId) -> &Arc<KvService> {
        self.services[id as usize]
            .as_ref()
            .unwrap_or_else(|| panic!("service {id} is not running"))
    }

    fn alive(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.services
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_some())
            .map(|(id, _)| id as NodeId)
    }

    /// Cut `id` off from every peer in both directions
    pub fn disconnect_service_from_peers(&mut self, id: NodeId) {
        self.service(id).disconnect_all();
        for other in self.alive().filter(|&o| o != id).collect::<Vec<_>>() {
            self.service(other).disconnect_peer(id);
        }
        self.connected[id as usize] = false;
    }

    /// Link `id` with every running, connected peer in both directions
    pub fn reconnect_service_to_peers(&mut self, id: NodeId) {
        let others: Vec<NodeId> = self
            .alive()
            .filter(|&o| o != id && self.connected[o as usize])
            .collect();
        for other in others {
            self.service(id)
                .connect_to_peer(other, &addr(other))
                .expect("peer reachable");
            self.service(other)
                .connect_to_peer(id, &addr(id))
                .expect("peer reachable");
        }
        self.connected[id as usize] = true;
    }

    /// Stop `id` as if the process died; its storage survives
    pub async fn crash_service(&mut self, id: NodeId) {
        self.disconnect_service_from_peers(id);
        let service = self.services[id as usize]
            .take()
            .unwrap_or_else(|| panic!("service {id} already crashed"));
        service.shutdown().await;
        assert_eq!(service.active_tasks(), 0, "service {id} leaked tasks");
        self.network.unregister(&addr(id));
    }

    /// Bring `id` back from its persisted state and reconnect it
    pub fn restart_service(&mut self, id: NodeId) {
        assert!(
            self.services[id as usize].is_none(),
            "service {id} is still running"
        );
        let service = self.start_service(id);
        self.services[id as usize] = Some(service);
        self.reconnect_service_to_peers(id);
    }

    /// Exactly one connected node may lead any term; returns the leader of
    /// the newest term seen
    pub async fn check_single_leader(&self) -> (NodeId, u64) {
        for _ in 0..8 {
            let mut leader: Option<(NodeId, u64)> = None;
            for id in self.alive().filter(|&id| self.connected[id as usize]) {
                let report = self.service(id).report().expect("report");
                if !report.is_leader {
                    continue;
                }
                match leader {
                    Some((other, term)) if term == report.term => {
                        panic!("both {other} and {id} lead term {term}")
                    }
                    Some((_, term)) if term > report.term => {}
                    _ => leader = Some((id, report.term)),
                }
            }
            if let Some(found) = leader {
                return found;
            }
            sleep(Duration::from_millis(150)).await;
        }
        panic!("leader not found");
    }

    /// No connected node claims leadership
    pub async fn check_no_leader(&self) {
        for id in self.alive().filter(|&id| self.connected[id as usize]) {
            let report = self.service(id).report().expect("report");
            assert!(!report.is_leader, "node {id} unexpectedly leads");
        }
    }

    /// Client that knows every node by id, tried in order, following leader hints
    pub fn new_client(&self) -> KvClient {
        let ids = 0..self.len() as NodeId;
        KvClient::new(Arc::new(self.network.clone()), ids.clone().map(addr).collect())
            .with_node_ids(ids.map(|id| (id, addr(id))))
    }

    /// Client that knows every node, tried in a random order
    pub fn new_client_random_order(&self) -> KvClient {
        let addrs = (0..self.len() as NodeId).map(addr).collect();
        KvClient::with_random_order(Arc::new(self.network.clone()), addrs)
    }

    /// Client that only ever talks to `id`
    pub fn new_client_single_service(&self, id: NodeId) -> KvClient {
        KvClient::new(Arc::new(self.network.clone()), vec![addr(id)])
    }

    pub async fn check_put(&self, client: &KvClient, key: &str, value: &str) -> (String, bool) {
        client
            .put(key, value)
            .await
            .unwrap_or_else(|err| panic!("put {key}={value} failed: {err}"))
    }

    pub async fn check_get(&self, client: &KvClient, key: &str, want: &str) {
        let (value, found) = client
            .get(key)
            .await
            .unwrap_or_else(|err| panic!("get {key} failed: {err}"));
        assert!(found, "key {key} not found");
        assert_eq!(value, want, "key {key}");
    }

    pub async fn check_get_not_found(&self, client: &KvClient, key: &str) {
        let (_, found) = client
            .get(key)
            .await
            .unwrap_or_else(|err| panic!("get {key} failed: {err}"));
        assert!(!found, "key {key} unexpectedly found");
    }

    pub async fn check_cas(
        &self,
        client: &KvClient,
        key: &str,
        compare: &str,
        value: &str,
    ) -> (String, bool) {
        client
            .cas(key, compare, value)
            .await
            .unwrap_or_else(|err| panic!("cas {key} failed: {err}"))
    }

    /// Stop every running service and check none left tasks behind
    pub async fn shutdown(mut self) {
        for id in self.alive().collect::<Vec<_>>() {
            self.service(id).disconnect_all();
        }
        for slot in self.services.iter_mut() {
            if let Some(service) = slot.take() {
                service.shutdown().await;
                assert_eq!(service.active_tasks(), 0, "service {} leaked tasks", service.id());
            }
        }
    }
}

pub async fn sleep_ms(ms: u64) {
    sleep(Duration::from_millis(ms)).await;
}

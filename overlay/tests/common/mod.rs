use intersect_overlay::{
    client::Client,
    coordinator::deploy,
    mocks,
    node::{Config, Node},
    server,
    topology::{Peer, Planner, Topology},
    Address, CommitteeId,
};
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio::net::TcpListener;

/// Configuration with short retry and poll intervals.
pub fn config() -> Config {
    Config {
        notify_attempts: 2,
        notify_delay: Duration::from_millis(10),
        update_attempts: 2,
        update_timeout: Duration::from_millis(200),
        update_poll_interval: Duration::from_millis(5),
        request_timeout: Duration::from_secs(5),
        refresh_interval: None,
    }
}

/// Nodes served over HTTP on localhost, sharing one in-memory consensus network.
pub struct Cluster {
    pub runtime: mocks::Runtime,
    pub client: Client,
    pub hosts: Vec<Address>,
    pub nodes: Vec<Arc<Node<mocks::Runtime>>>,
}

impl Cluster {
    pub fn new() -> Self {
        Self {
            runtime: mocks::Runtime::default(),
            client: Client::new(&config()).unwrap(),
            hosts: Vec::new(),
            nodes: Vec::new(),
        }
    }

    /// Plan `(committees, intersections)` and deploy it onto fresh nodes.
    pub async fn deployed(committees: usize, intersections: usize) -> (Self, Topology) {
        let topology = Planner::new(committees, intersections).plan().unwrap();
        let mut cluster = Self::new();
        for _ in 0..topology.peers.len() {
            cluster.spawn().await;
        }
        deploy(&cluster.client, &topology, &cluster.hosts)
            .await
            .unwrap();
        (cluster, topology)
    }

    /// Deploy one peer per `(a, b)` pair onto fresh nodes, for layouts the planner never
    /// produces.
    pub async fn with_pairs(pairs: &[(u64, u64)]) -> (Self, Topology) {
        let mut peers = Vec::with_capacity(pairs.len());
        let mut members: BTreeMap<CommitteeId, Vec<usize>> = BTreeMap::new();
        for (index, &(a, b)) in pairs.iter().enumerate() {
            let (a, b) = (CommitteeId::from(a), CommitteeId::from(b));
            members.entry(a.clone()).or_default().push(index);
            members.entry(b.clone()).or_default().push(index);
            peers.push(Peer { index, a, b });
        }
        let topology = Topology {
            committees: members.len(),
            intersections: 1,
            peers,
            members,
        };
        let mut cluster = Self::new();
        for _ in 0..topology.peers.len() {
            cluster.spawn().await;
        }
        deploy(&cluster.client, &topology, &cluster.hosts)
            .await
            .unwrap();
        (cluster, topology)
    }

    /// Serve a new, unstarted node and return its index.
    pub async fn spawn(&mut self) -> usize {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let address = Address::new("127.0.0.1", port);
        let node = Arc::new(Node::new(config(), address.clone(), self.runtime.clone()).unwrap());
        tokio::spawn(server::serve(node.clone(), listener));
        self.hosts.push(address);
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    /// Number of validators applied by committee `id`.
    pub fn validators(&self, id: &str) -> usize {
        self.runtime
            .network()
            .members(&CommitteeId::from(id))
            .map(|m| m.validators.len())
            .unwrap_or_default()
    }

    /// Indices of the nodes currently holding committee `id`.
    pub async fn holders(&self, id: &str) -> Vec<usize> {
        let id = CommitteeId::from(id);
        let mut holders = Vec::new();
        for (i, node) in self.nodes.iter().enumerate() {
            if node.committees().await.contains(&id) {
                holders.push(i);
            }
        }
        holders
    }
}

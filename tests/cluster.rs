//! End-to-end tests running an in-process meta service cluster and remote
//! clients over loopback HTTP. The consensus group is the in-process engine;
//! the HTTP surface, command envelopes, long-poll snapshots, and redirect
//! handling are the real thing.

use tsmeta::client::{MetaClient, Remote};
use tsmeta::data::{NodeId, NodeInfo, RetentionPolicySpec, Timestamp};
use tsmeta::error::{Error, Result};
use tsmeta::raft::Cluster;
use tsmeta::server::Server;
use tsmeta::store::Store;

use std::time::Duration;

const HOUR: Timestamp = 3_600_000_000_000;

struct TestNode {
    store: Store,
    server: Option<Server>,
    addr: String,
}

/// An in-process meta service cluster. The first node holds leadership for
/// the lifetime of the cluster; later nodes join as followers.
struct TestCluster {
    consensus: Cluster,
    nodes: Vec<TestNode>,
}

impl TestCluster {
    /// Starts a cluster with the given number of nodes.
    fn run(nodes: usize) -> Result<TestCluster> {
        let mut tc = TestCluster { consensus: Cluster::new(), nodes: Vec::new() };
        for _ in 0..nodes {
            tc.add_node()?;
        }
        Ok(tc)
    }

    /// Starts another node, registering it with the leader first so it
    /// joins as a follower.
    fn add_node(&mut self) -> Result<()> {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?.to_string();
        let raft_addr = format!("raft-{addr}");
        if let Some(leader) = self.nodes.first() {
            leader
                .store
                .add_meta_node(&NodeInfo { id: 0, host: addr.clone(), tcp_host: raft_addr.clone() })?;
        }
        let store = Store::open(self.consensus.node(&raft_addr), &addr, &raft_addr)?;
        let server = Server::serve(store.clone(), listener)?;
        self.nodes.push(TestNode { store, server: Some(server), addr });
        Ok(())
    }

    /// The HTTP addresses of all nodes, leader first.
    fn servers(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.addr.clone()).collect()
    }

    /// Opens a remote client against the given servers.
    fn connect(&self, servers: Vec<String>) -> Result<Remote> {
        let client = Remote::new(servers, false)?;
        client.open()?;
        Ok(client)
    }

    fn close(mut self) -> Result<()> {
        for mut node in self.nodes.drain(..) {
            if let Some(server) = node.server.take() {
                server.close()?;
            }
        }
        Ok(())
    }
}

#[test]
fn create_and_read_database() -> Result<()> {
    let tc = TestCluster::run(1)?;
    let client = tc.connect(tc.servers())?;

    // The genesis snapshot has a cluster identity and the sole meta node.
    assert_ne!(client.cluster_id()?, 0);
    assert_eq!(client.meta_nodes()?.len(), 1);

    // Read-your-writes: the database is visible as soon as the call
    // returns.
    let db = client.create_database("db0")?;
    assert_eq!(db.name, "db0");
    assert_eq!(client.database("db0")?.unwrap().name, "db0");

    // Recreating is idempotent.
    let index = client.data()?.index;
    client.create_database("db0")?;
    assert_eq!(client.data()?.index, index);

    client.close()?;
    tc.close()
}

#[test]
fn command_errors_surface_verbatim() -> Result<()> {
    let tc = TestCluster::run(1)?;
    let client = tc.connect(tc.servers())?;

    assert_eq!(
        client.drop_database("nope"),
        Err(Error::NotFound("database nope".into()))
    );

    client.close()?;
    tc.close()
}

#[test]
fn follower_redirects_to_leader() -> Result<()> {
    let tc = TestCluster::run(2)?;

    // The client only knows about the follower: the write is redirected to
    // the leader, and the follower's long-polled snapshot still reflects it
    // before the call returns.
    let follower = tc.servers()[1].clone();
    let client = tc.connect(vec![follower])?;

    let db = client.create_database("db0")?;
    assert_eq!(db.name, "db0");
    assert_eq!(client.database("db0")?.unwrap().name, "db0");

    client.close()?;
    tc.close()
}

#[test]
fn join_meta_server_over_http() -> Result<()> {
    let mut tc = TestCluster::run(1)?;
    let client = tc.connect(tc.servers())?;

    // Prepare the joining node's listener, then join through /add-meta.
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?.to_string();
    let raft_addr = format!("raft-{addr}");
    let node = client.join_meta_server(&addr, &raft_addr)?;
    assert_ne!(node.id, 0);

    // The node can now open as a follower and serve.
    let store = Store::open(tc.consensus.node(&raft_addr), &addr, &raft_addr)?;
    assert!(!store.is_leader());
    assert_eq!(store.data()?.meta_nodes.len(), 2);
    let server = Server::serve(store.clone(), listener)?;
    tc.nodes.push(TestNode { store, server: Some(server), addr });

    client.close()?;
    tc.close()
}

#[test]
fn ping_and_quorum_ping() -> Result<()> {
    let tc = TestCluster::run(1)?;
    let client = tc.connect(tc.servers())?;

    client.ping(false)?;
    client.ping(true)?;

    client.close()?;
    tc.close()
}

#[test]
fn leases_are_exclusive_across_clients() -> Result<()> {
    let tc = TestCluster::run(1)?;
    let client1 = tc.connect(tc.servers())?;
    let client2 = tc.connect(tc.servers())?;

    // Register both clients as data nodes so they have distinct node IDs.
    let node1 = client1.create_data_node("data1:8086", "data1:8088")?;
    let node2 = client2.create_data_node("data2:8086", "data2:8088")?;
    assert_ne!(node1.id, node2.id);
    assert_eq!(client1.node_id(), node1.id);

    let lease = client1.acquire_lease("continuous-query")?;
    assert_eq!(lease.owner, node1.id);

    // The owner renews, the other node gets a conflict.
    client1.acquire_lease("continuous-query")?;
    assert_eq!(
        client2.acquire_lease("continuous-query"),
        Err(Error::InvalidInput("another node has the lease".into()))
    );

    client1.close()?;
    client2.close()?;
    tc.close()
}

#[test]
fn shard_groups_with_replication() -> Result<()> {
    let tc = TestCluster::run(1)?;
    let client = tc.connect(tc.servers())?;

    for i in 1..=3 {
        client.create_data_node(&format!("data{i}:8086"), &format!("data{i}:8088"))?;
    }
    client.create_database("db0")?;
    let spec = RetentionPolicySpec {
        name: "rp0".into(),
        replica_n: Some(2),
        shard_group_duration: Some(Duration::from_secs(3600)),
        ..Default::default()
    };
    client.create_retention_policy("db0", &spec, true)?;

    // 3 data nodes with 2 replicas: 2 shards, owners assigned round-robin.
    // Node IDs are shared with the meta node, so compare against the
    // actually assigned data node IDs.
    let ids: Vec<NodeId> = client.data_nodes()?.iter().map(|n| n.id).collect();
    let sg = client.create_shard_group("db0", "rp0", 0)?;
    assert_eq!(sg.shards.len(), 2);
    assert_eq!(sg.shards[0].owners, vec![ids[0], ids[1]]);
    assert_eq!(sg.shards[1].owners, vec![ids[2], ids[0]]);

    // The same bucket returns the existing group.
    let again = client.create_shard_group("db0", "rp0", HOUR / 2)?;
    assert_eq!(again.id, sg.id);

    // Precreation fills in the successor group for every database.
    client.precreate_shard_groups(HOUR / 2, 2 * HOUR)?;
    let groups = client.shard_groups_by_time_range("db0", "rp0", 0, 2 * HOUR)?;
    assert_eq!(groups.len(), 2);
    assert_eq!(groups[1].start_time, HOUR);

    // Truncation and pruning are real commands on the cluster path.
    client.truncate_shard_groups(HOUR / 4)?;
    let groups = client.shard_groups_by_time_range("db0", "rp0", 0, 2 * HOUR)?;
    assert_eq!(groups[0].truncated_at, HOUR / 4);
    let index = client.data()?.index;
    client.prune_shard_groups()?;
    assert_eq!(client.data()?.index, index + 1);

    client.close()?;
    tc.close()
}

#[test]
fn authentication_and_password_change() -> Result<()> {
    let tc = TestCluster::run(1)?;
    let client = tc.connect(tc.servers())?;

    client.create_user("ada", "hunter2", true)?;
    assert!(client.admin_user_exists()?);

    // Slow path populates the cache, fast path serves repeats.
    client.authenticate("ada", "hunter2")?;
    client.authenticate("ada", "hunter2")?;
    assert_eq!(client.authenticate("ada", "wrong"), Err(Error::Authenticate));

    // A password change through the cluster invalidates the cached entry.
    client.update_user("ada", "correcthorse")?;
    assert_eq!(client.authenticate("ada", "hunter2"), Err(Error::Authenticate));
    client.authenticate("ada", "correcthorse")?;

    client.close()?;
    tc.close()
}

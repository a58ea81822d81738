//! Client façades over the metadata plane.
//!
//! MetaClient is the read/write surface consumed by local subsystems (the
//! write path, the query engine, background services). Two engines
//! implement it: Local embeds the document in-process for non-clustered
//! deployments, Remote reflects a meta service cluster via long-polled
//! snapshots and command submission.

mod local;
mod remote;

pub use local::Local;
pub use remote::Remote;

use crate::data::{
    Data, DatabaseInfo, Lease, NodeId, NodeInfo, Privilege, RetentionPolicyInfo,
    RetentionPolicySpec, RetentionPolicyUpdate, ShardGroupId, ShardGroupInfo, ShardId, Timestamp,
    UserInfo,
};
use crate::error::Result;

use crossbeam::channel::Receiver;
use std::collections::BTreeMap;

/// The metadata client façade. All reads are served from a cached document
/// under a reader lock and return defensive copies; all writes are typed
/// commands. A successful write is visible to subsequent reads through the
/// same client (read-your-writes).
pub trait MetaClient: Send + Sync {
    /// The local node's ID, or zero if not registered.
    fn node_id(&self) -> NodeId;
    /// The cluster's random genesis identity.
    fn cluster_id(&self) -> Result<u64>;
    /// Checks meta service liveness. With all=true, checks the full quorum.
    fn ping(&self, all: bool) -> Result<()>;
    /// Acquires the named advisory lease for this node.
    fn acquire_lease(&self, name: &str) -> Result<Lease>;

    fn data_node(&self, id: NodeId) -> Result<NodeInfo>;
    fn data_nodes(&self) -> Result<Vec<NodeInfo>>;
    fn create_data_node(&self, http_addr: &str, tcp_addr: &str) -> Result<NodeInfo>;
    fn data_node_by_http_host(&self, http_addr: &str) -> Result<NodeInfo>;
    fn data_node_by_tcp_host(&self, tcp_addr: &str) -> Result<NodeInfo>;
    fn delete_data_node(&self, id: NodeId) -> Result<()>;

    fn meta_nodes(&self) -> Result<Vec<NodeInfo>>;
    fn meta_node_by_addr(&self, addr: &str) -> Result<Option<NodeInfo>>;
    fn create_meta_node(&self, http_addr: &str, tcp_addr: &str) -> Result<NodeInfo>;
    fn delete_meta_node(&self, id: NodeId) -> Result<()>;

    fn database(&self, name: &str) -> Result<Option<DatabaseInfo>>;
    fn databases(&self) -> Result<Vec<DatabaseInfo>>;
    /// Creates a database, or returns it if it already exists.
    fn create_database(&self, name: &str) -> Result<DatabaseInfo>;
    /// Creates a database with the given default retention policy. Only
    /// idempotent when the spec matches the existing default policy.
    fn create_database_with_retention_policy(
        &self,
        name: &str,
        spec: &RetentionPolicySpec,
    ) -> Result<DatabaseInfo>;
    fn drop_database(&self, name: &str) -> Result<()>;

    /// Creates a retention policy, or returns the existing one by name.
    fn create_retention_policy(
        &self,
        database: &str,
        spec: &RetentionPolicySpec,
        make_default: bool,
    ) -> Result<RetentionPolicyInfo>;
    fn retention_policy(&self, database: &str, name: &str)
        -> Result<Option<RetentionPolicyInfo>>;
    fn drop_retention_policy(&self, database: &str, name: &str) -> Result<()>;
    fn set_default_retention_policy(&self, database: &str, name: &str) -> Result<()>;
    fn update_retention_policy(
        &self,
        database: &str,
        name: &str,
        update: &RetentionPolicyUpdate,
        make_default: bool,
    ) -> Result<()>;

    fn users(&self) -> Result<Vec<UserInfo>>;
    fn user_count(&self) -> Result<usize>;
    fn user(&self, name: &str) -> Result<UserInfo>;
    /// Creates a user. Idempotent if the password and admin flag match the
    /// existing user.
    fn create_user(&self, name: &str, password: &str, admin: bool) -> Result<UserInfo>;
    fn update_user(&self, name: &str, password: &str) -> Result<()>;
    fn drop_user(&self, name: &str) -> Result<()>;
    fn set_privilege(&self, username: &str, database: &str, privilege: Privilege) -> Result<()>;
    fn set_admin_privilege(&self, username: &str, admin: bool) -> Result<()>;
    fn user_privileges(&self, username: &str) -> Result<BTreeMap<String, Privilege>>;
    fn user_privilege(&self, username: &str, database: &str) -> Result<Privilege>;
    fn admin_user_exists(&self) -> Result<bool>;
    /// Verifies a username and password, using the fast-hash cache where
    /// possible.
    fn authenticate(&self, username: &str, password: &str) -> Result<UserInfo>;

    fn shard_ids(&self) -> Result<Vec<ShardId>>;
    /// Live shard groups possibly containing data in [min, max], sorted by
    /// start time.
    fn shard_groups_by_time_range(
        &self,
        database: &str,
        policy: &str,
        min: Timestamp,
        max: Timestamp,
    ) -> Result<Vec<ShardGroupInfo>>;
    fn drop_shard(&self, id: ShardId) -> Result<()>;
    /// Truncates shard groups that could contain timestamps at or past the
    /// given time.
    fn truncate_shard_groups(&self, at: Timestamp) -> Result<()>;
    /// Physically removes shard groups that were deleted long enough ago.
    fn prune_shard_groups(&self) -> Result<()>;
    /// Creates the shard group covering the timestamp, or returns the
    /// existing one.
    fn create_shard_group(
        &self,
        database: &str,
        policy: &str,
        timestamp: Timestamp,
    ) -> Result<ShardGroupInfo>;
    fn delete_shard_group(&self, database: &str, policy: &str, id: ShardGroupId) -> Result<()>;
    /// Creates successor groups for every retention policy whose latest
    /// group ends within (from, to), amortizing consensus cost outside the
    /// write-hot path.
    fn precreate_shard_groups(&self, from: Timestamp, to: Timestamp) -> Result<()>;
    fn shard_owner(&self, shard_id: ShardId) -> Result<Option<(String, String, ShardGroupInfo)>>;

    fn create_continuous_query(&self, database: &str, name: &str, query: &str) -> Result<()>;
    fn drop_continuous_query(&self, database: &str, name: &str) -> Result<()>;
    /// Creates a subscription; mode is "ANY" or "ALL".
    fn create_subscription(
        &self,
        database: &str,
        policy: &str,
        name: &str,
        mode: &str,
        destinations: &[String],
    ) -> Result<()>;
    fn drop_subscription(&self, database: &str, policy: &str, name: &str) -> Result<()>;

    /// Wholesale document replacement, used for bootstrap only.
    fn set_data(&self, data: &Data) -> Result<()>;
    /// A snapshot of the full document.
    fn data(&self) -> Result<Data>;
    /// A channel whose receive completes when the document next changes.
    fn wait_for_data_changed(&self) -> Result<Receiver<()>>;
    /// Closes the client. Pending waits abort promptly.
    fn close(&self) -> Result<()>;
}

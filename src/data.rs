//! The in-memory metadata document and its state machine.
//!
//! Data is a pure value type: every operation is total and deterministic
//! given the current state, so that all replicas applying the same committed
//! command sequence converge to the same document. Owners (Store, the local
//! client) mutate a clone and swap it in, which keeps readers race-free
//! without per-field locks.

use crate::error::{Error, Result};
use crate::{encoding, errinput};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// A point in time, in nanoseconds since the Unix epoch.
pub type Timestamp = i64;

/// The monotonic logical clock of the replicated state machine.
pub type Index = u64;

/// A node ID. IDs are never reused, even after deletion.
pub type NodeId = u64;

/// A shard ID, unique across the cluster.
pub type ShardId = u64;

/// A shard group ID, unique across the cluster.
pub type ShardGroupId = u64;

/// The minimum duration of a non-infinite retention policy.
pub const MIN_RETENTION_POLICY_DURATION: Duration = Duration::from_secs(60 * 60);

/// The minimum shard group duration. Explicit shorter values are clamped.
pub const MIN_SHARD_GROUP_DURATION: Duration = MIN_RETENTION_POLICY_DURATION;

/// How long a deleted shard group is kept as a tombstone before pruning.
pub const SHARD_GROUP_DELETED_EXPIRATION: Duration = Duration::from_secs(2 * 7 * 24 * 60 * 60);

/// The name of the auto-created default retention policy.
pub const DEFAULT_RETENTION_POLICY_NAME: &str = "autogen";

/// How long an acquired lease remains valid.
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(60);

/// Returns the current wall-clock time as a Timestamp. Only callers at the
/// edge (clients, lease bookkeeping) read the clock; timestamps that affect
/// replicated state are carried inside commands so replicas stay
/// deterministic.
pub fn now() -> Timestamp {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos().min(i64::MAX as u128) as i64)
        .unwrap_or(0)
}

/// Converts a duration to nanoseconds, saturating at i64::MAX.
pub(crate) fn duration_nanos(duration: Duration) -> i64 {
    duration.as_nanos().min(i64::MAX as u128) as i64
}

/// The error for a retention policy duration below the minimum.
pub(crate) fn retention_policy_duration_too_low() -> Error {
    Error::InvalidInput("retention policy duration must be at least 1h".into())
}

/// The error for a retention policy that conflicts with an existing one.
pub(crate) fn retention_policy_conflict() -> Error {
    Error::InvalidInput("retention policy conflicts with an existing policy".into())
}

/// The error for a shard group that already covers the requested timestamp.
pub(crate) fn shard_group_exists() -> Error {
    Error::InvalidInput("shard group already exists".into())
}

/// Derives a shard group duration from a retention policy duration.
pub fn shard_group_duration_for(duration: Duration) -> Duration {
    const DAY: u64 = 24 * 60 * 60;
    if duration == Duration::ZERO {
        Duration::from_secs(7 * DAY)
    } else if duration <= Duration::from_secs(2 * DAY) {
        Duration::from_secs(60 * 60)
    } else if duration <= Duration::from_secs(180 * DAY) {
        Duration::from_secs(DAY)
    } else {
        Duration::from_secs(7 * DAY)
    }
}

/// Normalizes a requested shard group duration: zero derives it from the
/// retention duration, explicit sub-minimum values are clamped.
pub(crate) fn normalize_shard_group_duration(
    shard_group_duration: Duration,
    duration: Duration,
) -> Duration {
    if shard_group_duration == Duration::ZERO {
        shard_group_duration_for(duration)
    } else {
        shard_group_duration.max(MIN_SHARD_GROUP_DURATION)
    }
}

/// A database privilege.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Privilege {
    None,
    Read,
    Write,
    All,
}

/// A subscription fan-out mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionMode {
    Any,
    All,
}

impl std::str::FromStr for SubscriptionMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "ANY" => Ok(SubscriptionMode::Any),
            "ALL" => Ok(SubscriptionMode::All),
            mode => errinput!("invalid subscription mode {mode}"),
        }
    }
}

/// A data or meta node.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: NodeId,
    /// The node's HTTP API address.
    pub host: String,
    /// The node's consensus (TCP) address.
    pub tcp_host: String,
}

/// A database.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseInfo {
    pub name: String,
    /// The name of the default retention policy, or empty if none.
    pub default_retention_policy: String,
    pub retention_policies: Vec<RetentionPolicyInfo>,
    pub continuous_queries: Vec<ContinuousQueryInfo>,
}

impl DatabaseInfo {
    /// Returns the named retention policy, if it exists.
    pub fn retention_policy(&self, name: &str) -> Option<&RetentionPolicyInfo> {
        self.retention_policies.iter().find(|rp| rp.name == name)
    }

    fn retention_policy_mut(&mut self, name: &str) -> Option<&mut RetentionPolicyInfo> {
        self.retention_policies.iter_mut().find(|rp| rp.name == name)
    }
}

/// A retention policy.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RetentionPolicyInfo {
    pub name: String,
    /// The number of copies of each shard. At least 1.
    pub replica_n: usize,
    /// How long data is retained. Zero means forever.
    pub duration: Duration,
    /// The time span covered by each shard group. Fixed once the first shard
    /// group exists.
    pub shard_group_duration: Duration,
    /// Shard groups in creation order.
    pub shard_groups: Vec<ShardGroupInfo>,
    pub subscriptions: Vec<SubscriptionInfo>,
}

impl RetentionPolicyInfo {
    /// Creates a retention policy with the given name and defaults: infinite
    /// duration, a single replica, and a derived shard group duration.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            replica_n: 1,
            duration: Duration::ZERO,
            shard_group_duration: shard_group_duration_for(Duration::ZERO),
            shard_groups: Vec::new(),
            subscriptions: Vec::new(),
        }
    }

    /// Returns true if the settings (not the contents) match another policy.
    pub fn matches(&self, other: &RetentionPolicyInfo) -> bool {
        self.name == other.name
            && self.replica_n == other.replica_n
            && self.duration == other.duration
            && self.shard_group_duration == other.shard_group_duration
    }

    /// Returns the live shard group containing the given timestamp, if any.
    pub fn shard_group_by_timestamp(&self, timestamp: Timestamp) -> Option<&ShardGroupInfo> {
        self.shard_groups.iter().find(|sg| !sg.deleted() && sg.contains(timestamp))
    }

    /// Returns the temporally-latest shard group, deleted or not.
    pub fn latest_shard_group(&self) -> Option<&ShardGroupInfo> {
        self.shard_groups.iter().max_by_key(|sg| sg.start_time)
    }
}

/// A group of shards covering a half-open time range.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ShardGroupInfo {
    pub id: ShardGroupId,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    /// When the group was marked deleted, or zero if live.
    pub deleted_at: Timestamp,
    /// When the group was truncated, or zero. A truncated group covers
    /// [start_time, truncated_at) even though end_time is unchanged.
    pub truncated_at: Timestamp,
    pub shards: Vec<ShardInfo>,
}

impl ShardGroupInfo {
    /// Returns true if the group has been marked deleted.
    pub fn deleted(&self) -> bool {
        self.deleted_at != 0
    }

    /// Returns true if the group has been truncated.
    pub fn truncated(&self) -> bool {
        self.truncated_at != 0
    }

    /// The effective (exclusive) end of the group's time range.
    pub fn effective_end(&self) -> Timestamp {
        if self.truncated() {
            self.truncated_at
        } else {
            self.end_time
        }
    }

    /// Returns true if the group covers the given timestamp.
    pub fn contains(&self, timestamp: Timestamp) -> bool {
        self.start_time <= timestamp && timestamp < self.effective_end()
    }

    /// Returns true if the group may contain data for [min, max].
    pub fn overlaps(&self, min: Timestamp, max: Timestamp) -> bool {
        self.start_time <= max && min < self.effective_end()
    }
}

/// A shard, owned by a set of data nodes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ShardInfo {
    pub id: ShardId,
    /// The data nodes holding a copy of the shard.
    pub owners: Vec<NodeId>,
}

/// A continuous query. Only the textual definition is stored here.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ContinuousQueryInfo {
    pub name: String,
    pub query: String,
}

/// A subscription: a fan-out destination list for writes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    pub name: String,
    pub mode: SubscriptionMode,
    pub destinations: Vec<String>,
}

/// A user. The hash is the slow KDF (bcrypt) of the password, the only form
/// in which a secret is ever stored.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
    pub name: String,
    pub hash: String,
    pub admin: bool,
    /// Per-database privileges. A BTreeMap keeps the encoding deterministic
    /// across replicas.
    pub privileges: BTreeMap<String, Privilege>,
}

/// A non-replicated, time-bounded, advisory exclusive token for running
/// singleton tasks. Leases are granted by the leader only and are lost on
/// leader change, so any action taken under a lease must be idempotent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub name: String,
    pub owner: NodeId,
    pub expiration: Timestamp,
}

/// A retention policy specification, as provided by callers. Unset fields
/// take their defaults.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RetentionPolicySpec {
    pub name: String,
    pub duration: Option<Duration>,
    pub replica_n: Option<usize>,
    pub shard_group_duration: Option<Duration>,
}

impl RetentionPolicySpec {
    /// Materializes the spec into a retention policy, filling defaults and
    /// normalizing the shard group duration.
    pub fn new_retention_policy_info(&self) -> RetentionPolicyInfo {
        let duration = self.duration.unwrap_or(Duration::ZERO);
        RetentionPolicyInfo {
            name: self.name.clone(),
            replica_n: self.replica_n.unwrap_or(1),
            duration,
            shard_group_duration: normalize_shard_group_duration(
                self.shard_group_duration.unwrap_or(Duration::ZERO),
                duration,
            ),
            shard_groups: Vec::new(),
            subscriptions: Vec::new(),
        }
    }

    /// Returns true if the spec matches an existing policy, with unset
    /// fields matching the defaults they would produce.
    pub fn matches(&self, policy: Option<&RetentionPolicyInfo>) -> bool {
        match policy {
            Some(policy) => self.new_retention_policy_info().matches(policy),
            None => false,
        }
    }
}

/// A patch applied to a retention policy by UpdateRetentionPolicy.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RetentionPolicyUpdate {
    pub name: Option<String>,
    pub duration: Option<Duration>,
    pub replica_n: Option<usize>,
}

/// The root metadata document. Mutations produce a new version with
/// index = previous + 1; see Store and client::Local for the copy-on-write
/// discipline. Clone is a deep copy: callers can never mutate live state
/// through a returned value.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Data {
    /// A random, nonzero cluster identity chosen at genesis.
    pub cluster_id: u64,
    pub index: Index,
    pub max_node_id: u64,
    pub max_shard_group_id: u64,
    pub max_shard_id: u64,
    pub databases: Vec<DatabaseInfo>,
    pub data_nodes: Vec<NodeInfo>,
    pub meta_nodes: Vec<NodeInfo>,
    pub users: Vec<UserInfo>,
}

impl encoding::Value for Data {}

impl Data {
    /// Creates a fresh genesis document with a random cluster ID.
    pub fn new() -> Self {
        Self { cluster_id: rand::random(), index: 1, ..Default::default() }
    }

    /// Returns the named database, if it exists.
    pub fn database(&self, name: &str) -> Option<&DatabaseInfo> {
        self.databases.iter().find(|db| db.name == name)
    }

    fn database_mut(&mut self, name: &str) -> Option<&mut DatabaseInfo> {
        self.databases.iter_mut().find(|db| db.name == name)
    }

    /// Returns the named user, if it exists.
    pub fn user(&self, name: &str) -> Option<&UserInfo> {
        self.users.iter().find(|u| u.name == name)
    }

    fn user_mut(&mut self, name: &str) -> Result<&mut UserInfo> {
        self.users
            .iter_mut()
            .find(|u| u.name == name)
            .ok_or_else(|| Error::NotFound(format!("user {name}")))
    }

    /// Returns the named retention policy.
    pub fn retention_policy(&self, database: &str, name: &str) -> Result<&RetentionPolicyInfo> {
        let db = self
            .database(database)
            .ok_or_else(|| Error::NotFound(format!("database {database}")))?;
        db.retention_policy(name)
            .ok_or_else(|| Error::NotFound(format!("retention policy {name}")))
    }

    fn retention_policy_mut(
        &mut self,
        database: &str,
        name: &str,
    ) -> Result<&mut RetentionPolicyInfo> {
        let db = self
            .database_mut(database)
            .ok_or_else(|| Error::NotFound(format!("database {database}")))?;
        db.retention_policy_mut(name)
            .ok_or_else(|| Error::NotFound(format!("retention policy {name}")))
    }

    /// Creates a database. Idempotent if it already exists.
    pub fn create_database(&mut self, name: &str) -> Result<()> {
        if name.is_empty() {
            return errinput!("database name required");
        }
        if self.database(name).is_some() {
            return Ok(());
        }
        self.databases.push(DatabaseInfo { name: name.into(), ..Default::default() });
        Ok(())
    }

    /// Drops a database and everything in it.
    pub fn drop_database(&mut self, name: &str) -> Result<()> {
        if self.database(name).is_none() {
            return Err(Error::NotFound(format!("database {name}")));
        }
        self.databases.retain(|db| db.name != name);
        Ok(())
    }

    /// Creates a retention policy. Succeeds without change if an identical
    /// policy already exists, errors if the name is taken with different
    /// settings.
    pub fn create_retention_policy(
        &mut self,
        database: &str,
        mut policy: RetentionPolicyInfo,
        make_default: bool,
    ) -> Result<()> {
        if policy.name.is_empty() {
            return errinput!("retention policy name required");
        }
        if policy.replica_n < 1 {
            return errinput!("replication factor must be at least 1");
        }
        if policy.duration != Duration::ZERO && policy.duration < MIN_RETENTION_POLICY_DURATION {
            return Err(retention_policy_duration_too_low());
        }
        policy.shard_group_duration =
            normalize_shard_group_duration(policy.shard_group_duration, policy.duration);

        let db = self
            .database_mut(database)
            .ok_or_else(|| Error::NotFound(format!("database {database}")))?;
        if let Some(existing) = db.retention_policy(&policy.name) {
            if !existing.matches(&policy) {
                return errinput!("retention policy already exists");
            }
        } else {
            db.retention_policies.push(policy.clone());
        }
        if make_default {
            db.default_retention_policy = policy.name;
        }
        Ok(())
    }

    /// Drops a retention policy. Clears the database default if it pointed
    /// at the dropped policy.
    pub fn drop_retention_policy(&mut self, database: &str, name: &str) -> Result<()> {
        self.retention_policy(database, name)?;
        let db = self.database_mut(database).expect("database exists");
        db.retention_policies.retain(|rp| rp.name != name);
        if db.default_retention_policy == name {
            db.default_retention_policy = String::new();
        }
        Ok(())
    }

    /// Sets a database's default retention policy.
    pub fn set_default_retention_policy(&mut self, database: &str, name: &str) -> Result<()> {
        self.retention_policy(database, name)?;
        let db = self.database_mut(database).expect("database exists");
        db.default_retention_policy = name.into();
        Ok(())
    }

    /// Patches a retention policy.
    pub fn update_retention_policy(
        &mut self,
        database: &str,
        name: &str,
        update: &RetentionPolicyUpdate,
        make_default: bool,
    ) -> Result<()> {
        let db = self
            .database(database)
            .ok_or_else(|| Error::NotFound(format!("database {database}")))?;
        if let Some(new_name) = &update.name {
            if new_name != name && db.retention_policy(new_name).is_some() {
                return errinput!("retention policy already exists");
            }
        }
        let rp = self.retention_policy(database, name)?;
        if let Some(duration) = update.duration {
            if duration != Duration::ZERO && duration < MIN_RETENTION_POLICY_DURATION {
                return Err(retention_policy_duration_too_low());
            }
            // A shorter retention than the shard group span would expire
            // shards that are still being written to.
            if !rp.shard_groups.is_empty()
                && duration != Duration::ZERO
                && duration < rp.shard_group_duration
            {
                return errinput!(
                    "retention policy duration must not be shorter than the shard group duration"
                );
            }
        }

        let rp = self.retention_policy_mut(database, name).expect("policy exists");
        if let Some(duration) = update.duration {
            rp.duration = duration;
        }
        if let Some(replica_n) = update.replica_n {
            rp.replica_n = replica_n;
        }
        let new_name = update.name.clone().unwrap_or_else(|| name.into());
        rp.name = new_name.clone();

        let db = self.database_mut(database).expect("database exists");
        if make_default || db.default_retention_policy == name {
            db.default_retention_policy = new_name;
        }
        Ok(())
    }

    /// Returns the live shard group covering the timestamp, if any.
    pub fn shard_group_by_timestamp(
        &self,
        database: &str,
        policy: &str,
        timestamp: Timestamp,
    ) -> Result<Option<&ShardGroupInfo>> {
        Ok(self.retention_policy(database, policy)?.shard_group_by_timestamp(timestamp))
    }

    /// Creates a shard group covering the timestamp, allocating shards and
    /// assigning owners round-robin over the data nodes. Errors if a live
    /// group already covers the timestamp.
    ///
    /// The group start is the shard-group-duration-aligned bucket containing
    /// the timestamp, clamped forward past any existing live group (as
    /// produced by truncation or back-to-back precreation). A group filling
    /// a gap before an existing future group is created already truncated at
    /// that group's start. Live effective ranges therefore stay disjoint,
    /// and every group spans a full shard group duration.
    pub fn create_shard_group(
        &mut self,
        database: &str,
        policy: &str,
        timestamp: Timestamp,
    ) -> Result<()> {
        if self.shard_group_by_timestamp(database, policy, timestamp)?.is_some() {
            return Err(shard_group_exists());
        }

        let node_n = self.data_nodes.len();
        let rp = self.retention_policy(database, policy)?;
        let sgd = duration_nanos(rp.shard_group_duration);

        let mut start_time = timestamp - timestamp.rem_euclid(sgd);
        for sg in rp.shard_groups.iter().filter(|sg| !sg.deleted()) {
            if sg.start_time <= timestamp && sg.effective_end() > start_time {
                start_time = sg.effective_end();
            }
        }
        let end_time = start_time.saturating_add(sgd);

        // A group filling a gap before an existing future group is born
        // truncated at that group's start, so live ranges stay disjoint.
        let mut truncated_at = 0;
        for sg in rp.shard_groups.iter().filter(|sg| !sg.deleted()) {
            if sg.start_time > timestamp
                && sg.start_time < end_time
                && (truncated_at == 0 || sg.start_time < truncated_at)
            {
                truncated_at = sg.start_time;
            }
        }

        // Shard and replica counts. With no registered data nodes (embedded
        // deployments) a single, ownerless shard is allocated.
        let replica_n = rp.replica_n.clamp(1, node_n.max(1));
        let shard_n = if node_n == 0 { 1 } else { node_n.div_ceil(replica_n) };

        let mut group = ShardGroupInfo {
            id: self.max_shard_group_id + 1,
            start_time,
            end_time,
            truncated_at,
            ..Default::default()
        };
        for i in 0..shard_n {
            let mut shard = ShardInfo { id: self.max_shard_id + 1 + i as u64, owners: Vec::new() };
            for j in 0..replica_n {
                if node_n > 0 {
                    shard.owners.push(self.data_nodes[(i * replica_n + j) % node_n].id);
                }
            }
            group.shards.push(shard);
        }
        self.max_shard_group_id += 1;
        self.max_shard_id += shard_n as u64;

        self.retention_policy_mut(database, policy)?.shard_groups.push(group);
        Ok(())
    }

    /// Marks a shard group deleted at the given time. It is physically
    /// removed later by prune_shard_groups.
    pub fn delete_shard_group(
        &mut self,
        database: &str,
        policy: &str,
        id: ShardGroupId,
        at: Timestamp,
    ) -> Result<()> {
        let rp = self.retention_policy_mut(database, policy)?;
        let sg = rp
            .shard_groups
            .iter_mut()
            .find(|sg| sg.id == id)
            .ok_or_else(|| Error::NotFound(format!("shard group {id}")))?;
        sg.deleted_at = at;
        Ok(())
    }

    /// Physically removes shard groups deleted before the expiration cutoff.
    pub fn prune_shard_groups(&mut self, expiration: Timestamp) -> Result<()> {
        for db in &mut self.databases {
            for rp in &mut db.retention_policies {
                rp.shard_groups.retain(|sg| !sg.deleted() || sg.deleted_at >= expiration);
            }
        }
        Ok(())
    }

    /// Truncates every live shard group whose range spans the given time.
    /// Subsequent groups are created starting at the truncation point.
    pub fn truncate_shard_groups(&mut self, at: Timestamp) -> Result<()> {
        for db in &mut self.databases {
            for rp in &mut db.retention_policies {
                for sg in &mut rp.shard_groups {
                    if !sg.deleted() && !sg.truncated() && sg.start_time < at && at < sg.end_time {
                        sg.truncated_at = at;
                    }
                }
            }
        }
        Ok(())
    }

    /// Removes a shard from its group. The group is marked deleted when its
    /// last shard is dropped. A no-op if the shard does not exist.
    pub fn drop_shard(&mut self, id: ShardId, at: Timestamp) -> Result<()> {
        for db in &mut self.databases {
            for rp in &mut db.retention_policies {
                for sg in &mut rp.shard_groups {
                    if sg.shards.iter().any(|s| s.id == id) {
                        sg.shards.retain(|s| s.id != id);
                        if sg.shards.is_empty() {
                            sg.deleted_at = at;
                        }
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }

    /// Creates a data node. Idempotent on identical addresses.
    pub fn create_data_node(&mut self, http_addr: &str, tcp_addr: &str) -> Result<()> {
        for n in &self.data_nodes {
            if n.host == http_addr && n.tcp_host == tcp_addr {
                return Ok(());
            }
            if n.host == http_addr || n.tcp_host == tcp_addr {
                return errinput!("data node already exists");
            }
        }
        self.max_node_id += 1;
        self.data_nodes.push(NodeInfo {
            id: self.max_node_id,
            host: http_addr.into(),
            tcp_host: tcp_addr.into(),
        });
        Ok(())
    }

    /// Deletes a data node and removes it from all shard ownership lists.
    pub fn delete_data_node(&mut self, id: NodeId) -> Result<()> {
        if !self.data_nodes.iter().any(|n| n.id == id) {
            return Err(Error::NotFound(format!("data node {id}")));
        }
        self.data_nodes.retain(|n| n.id != id);
        for db in &mut self.databases {
            for rp in &mut db.retention_policies {
                for sg in &mut rp.shard_groups {
                    for shard in &mut sg.shards {
                        shard.owners.retain(|owner| *owner != id);
                    }
                }
            }
        }
        Ok(())
    }

    /// Creates a meta node. The nonce seeds the cluster ID at genesis.
    pub fn create_meta_node(&mut self, http_addr: &str, tcp_addr: &str, nonce: u64) -> Result<()> {
        for n in &self.meta_nodes {
            if n.host == http_addr && n.tcp_host == tcp_addr {
                return Ok(());
            }
            if n.host == http_addr || n.tcp_host == tcp_addr {
                return errinput!("meta node already exists");
            }
        }
        self.max_node_id += 1;
        self.meta_nodes.push(NodeInfo {
            id: self.max_node_id,
            host: http_addr.into(),
            tcp_host: tcp_addr.into(),
        });
        if self.cluster_id == 0 {
            self.cluster_id = nonce;
        }
        Ok(())
    }

    /// Creates the sole meta node, or rebinds its addresses. Used on
    /// single-peer startup, where the consensus identity follows the
    /// listener address and hostnames may have changed.
    pub fn set_meta_node(&mut self, http_addr: &str, tcp_addr: &str, nonce: u64) -> Result<()> {
        if self.meta_nodes.is_empty() {
            return self.create_meta_node(http_addr, tcp_addr, nonce);
        }
        self.meta_nodes[0].host = http_addr.into();
        self.meta_nodes[0].tcp_host = tcp_addr.into();
        Ok(())
    }

    /// Deletes a meta node.
    pub fn delete_meta_node(&mut self, id: NodeId) -> Result<()> {
        if !self.meta_nodes.iter().any(|n| n.id == id) {
            return Err(Error::NotFound(format!("meta node {id}")));
        }
        self.meta_nodes.retain(|n| n.id != id);
        Ok(())
    }

    /// Creates a user. The hash must be the slow KDF of the password.
    pub fn create_user(&mut self, name: &str, hash: &str, admin: bool) -> Result<()> {
        if name.is_empty() {
            return errinput!("username required");
        }
        if self.user(name).is_some() {
            return errinput!("user already exists");
        }
        self.users.push(UserInfo {
            name: name.into(),
            hash: hash.into(),
            admin,
            privileges: BTreeMap::new(),
        });
        Ok(())
    }

    /// Replaces a user's password hash.
    pub fn update_user(&mut self, name: &str, hash: &str) -> Result<()> {
        self.user_mut(name)?.hash = hash.into();
        Ok(())
    }

    /// Removes a user.
    pub fn drop_user(&mut self, name: &str) -> Result<()> {
        self.user_mut(name)?;
        self.users.retain(|u| u.name != name);
        Ok(())
    }

    /// Sets a user's privilege on a database.
    pub fn set_privilege(
        &mut self,
        username: &str,
        database: &str,
        privilege: Privilege,
    ) -> Result<()> {
        if self.database(database).is_none() {
            return Err(Error::NotFound(format!("database {database}")));
        }
        self.user_mut(username)?.privileges.insert(database.into(), privilege);
        Ok(())
    }

    /// Grants or revokes a user's admin flag.
    pub fn set_admin_privilege(&mut self, username: &str, admin: bool) -> Result<()> {
        self.user_mut(username)?.admin = admin;
        Ok(())
    }

    /// Returns a user's privilege on a database.
    pub fn user_privilege(&self, username: &str, database: &str) -> Result<Privilege> {
        let user =
            self.user(username).ok_or_else(|| Error::NotFound(format!("user {username}")))?;
        Ok(user.privileges.get(database).copied().unwrap_or(Privilege::None))
    }

    /// Returns all of a user's privileges, keyed by database.
    pub fn user_privileges(&self, username: &str) -> Result<BTreeMap<String, Privilege>> {
        let user =
            self.user(username).ok_or_else(|| Error::NotFound(format!("user {username}")))?;
        Ok(user.privileges.clone())
    }

    /// Returns true if any user has the admin flag.
    pub fn admin_user_exists(&self) -> bool {
        self.users.iter().any(|u| u.admin)
    }

    /// Saves a continuous query. Succeeds if one exists with the exact same
    /// query text.
    pub fn create_continuous_query(
        &mut self,
        database: &str,
        name: &str,
        query: &str,
    ) -> Result<()> {
        let db = self
            .database_mut(database)
            .ok_or_else(|| Error::NotFound(format!("database {database}")))?;
        if let Some(cq) = db.continuous_queries.iter().find(|cq| cq.name == name) {
            if cq.query == query {
                return Ok(());
            }
            return errinput!("continuous query already exists");
        }
        db.continuous_queries.push(ContinuousQueryInfo { name: name.into(), query: query.into() });
        Ok(())
    }

    /// Removes a continuous query.
    pub fn drop_continuous_query(&mut self, database: &str, name: &str) -> Result<()> {
        let db = self
            .database_mut(database)
            .ok_or_else(|| Error::NotFound(format!("database {database}")))?;
        if !db.continuous_queries.iter().any(|cq| cq.name == name) {
            return Err(Error::NotFound(format!("continuous query {name}")));
        }
        db.continuous_queries.retain(|cq| cq.name != name);
        Ok(())
    }

    /// Creates a subscription on a retention policy.
    pub fn create_subscription(
        &mut self,
        database: &str,
        policy: &str,
        name: &str,
        mode: SubscriptionMode,
        destinations: Vec<String>,
    ) -> Result<()> {
        let rp = self.retention_policy_mut(database, policy)?;
        if rp.subscriptions.iter().any(|s| s.name == name) {
            return errinput!("subscription already exists");
        }
        rp.subscriptions.push(SubscriptionInfo { name: name.into(), mode, destinations });
        Ok(())
    }

    /// Removes a subscription.
    pub fn drop_subscription(&mut self, database: &str, policy: &str, name: &str) -> Result<()> {
        let rp = self.retention_policy_mut(database, policy)?;
        if !rp.subscriptions.iter().any(|s| s.name == name) {
            return Err(Error::NotFound(format!("subscription {name}")));
        }
        rp.subscriptions.retain(|s| s.name != name);
        Ok(())
    }

    /// Returns all shard IDs, sorted.
    pub fn shard_ids(&self) -> Vec<ShardId> {
        let mut ids: Vec<ShardId> = self
            .databases
            .iter()
            .flat_map(|db| &db.retention_policies)
            .flat_map(|rp| &rp.shard_groups)
            .flat_map(|sg| &sg.shards)
            .map(|s| s.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Returns the live shard groups that may contain data for [min, max],
    /// sorted by start time.
    pub fn shard_groups_by_time_range(
        &self,
        database: &str,
        policy: &str,
        min: Timestamp,
        max: Timestamp,
    ) -> Result<Vec<ShardGroupInfo>> {
        let rp = self.retention_policy(database, policy)?;
        let mut groups: Vec<ShardGroupInfo> = rp
            .shard_groups
            .iter()
            .filter(|sg| !sg.deleted() && sg.overlaps(min, max))
            .cloned()
            .collect();
        groups.sort_by_key(|sg| sg.start_time);
        Ok(groups)
    }

    /// Returns the database, retention policy, and group owning a shard.
    pub fn shard_owner(&self, shard_id: ShardId) -> Option<(String, String, ShardGroupInfo)> {
        for db in &self.databases {
            for rp in &db.retention_policies {
                for sg in &rp.shard_groups {
                    if sg.deleted() {
                        continue;
                    }
                    if sg.shards.iter().any(|s| s.id == shard_id) {
                        return Some((db.name.clone(), rp.name.clone(), sg.clone()));
                    }
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::Value as _;
    use pretty_assertions::assert_eq;

    const HOUR: Duration = Duration::from_secs(60 * 60);
    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    fn hours(h: u64) -> Duration {
        Duration::from_secs(h * 60 * 60)
    }

    /// A policy with an hourly shard group duration for readable test times.
    fn hourly_policy(name: &str) -> RetentionPolicyInfo {
        RetentionPolicyInfo {
            shard_group_duration: HOUR,
            ..RetentionPolicyInfo::new(name)
        }
    }

    fn data_with_policy(policy: RetentionPolicyInfo) -> Data {
        let mut data = Data::new();
        data.create_database("db0").unwrap();
        data.create_retention_policy("db0", policy, true).unwrap();
        data
    }

    #[test]
    fn create_database_is_idempotent() {
        let mut data = Data::new();
        for _ in 0..3 {
            data.create_database("db0").unwrap();
        }
        assert_eq!(data.databases.len(), 1);
        assert_eq!(data.database("db0").unwrap().name, "db0");
    }

    #[test]
    fn drop_database_requires_existence() {
        let mut data = Data::new();
        assert_eq!(data.drop_database("nope"), Err(Error::NotFound("database nope".into())));
        data.create_database("db0").unwrap();
        data.drop_database("db0").unwrap();
        assert_eq!(data.database("db0"), None);
    }

    #[test]
    fn retention_policy_duration_floor() {
        let mut data = Data::new();
        data.create_database("db0").unwrap();

        let mut rp = RetentionPolicyInfo::new("rp1");
        rp.duration = Duration::from_secs(59 * 60);
        assert_eq!(
            data.create_retention_policy("db0", rp.clone(), false),
            Err(retention_policy_duration_too_low())
        );

        rp.duration = HOUR;
        data.create_retention_policy("db0", rp, false).unwrap();
        assert_eq!(data.retention_policy("db0", "rp1").unwrap().duration, HOUR);
    }

    #[test]
    fn retention_policy_create_conflicts_on_different_settings() {
        let mut data = Data::new();
        data.create_database("db0").unwrap();
        data.create_retention_policy("db0", RetentionPolicyInfo::new("rp0"), true).unwrap();

        // Identical settings: idempotent.
        data.create_retention_policy("db0", RetentionPolicyInfo::new("rp0"), false).unwrap();
        assert_eq!(data.database("db0").unwrap().retention_policies.len(), 1);

        // Different replica count: conflict.
        let mut other = RetentionPolicyInfo::new("rp0");
        other.replica_n = 2;
        assert_eq!(
            data.create_retention_policy("db0", other, false),
            Err(Error::InvalidInput("retention policy already exists".into()))
        );
    }

    #[test]
    fn shard_group_duration_derivation() {
        assert_eq!(shard_group_duration_for(Duration::ZERO), 7 * DAY);
        assert_eq!(shard_group_duration_for(DAY), HOUR);
        assert_eq!(shard_group_duration_for(2 * DAY), HOUR);
        assert_eq!(shard_group_duration_for(30 * DAY), DAY);
        assert_eq!(shard_group_duration_for(180 * DAY), DAY);
        assert_eq!(shard_group_duration_for(365 * DAY), 7 * DAY);
    }

    #[test]
    fn shard_group_duration_clamps_below_minimum() {
        assert_eq!(normalize_shard_group_duration(Duration::from_secs(60), HOUR), HOUR);
        assert_eq!(normalize_shard_group_duration(2 * HOUR, HOUR), 2 * HOUR);
    }

    #[test]
    fn shard_group_owner_assignment_round_robin() {
        let mut policy = hourly_policy("rp0");
        policy.replica_n = 2;
        let mut data = data_with_policy(policy);
        for i in 1..=3 {
            data.create_data_node(&format!("host{i}:8091"), &format!("host{i}:8089")).unwrap();
        }

        data.create_shard_group("db0", "rp0", 0).unwrap();
        let rp = data.retention_policy("db0", "rp0").unwrap();
        let sg = &rp.shard_groups[0];

        // 3 nodes, 2 replicas: ceil(3/2) = 2 shards, owners wrap around.
        assert_eq!(sg.shards.len(), 2);
        assert_eq!(sg.shards[0].owners, vec![1, 2]);
        assert_eq!(sg.shards[1].owners, vec![3, 1]);
    }

    #[test]
    fn shard_group_without_data_nodes_gets_single_ownerless_shard() {
        let mut data = data_with_policy(hourly_policy("rp0"));
        data.create_shard_group("db0", "rp0", 0).unwrap();
        let sg = &data.retention_policy("db0", "rp0").unwrap().shard_groups[0];
        assert_eq!(sg.shards.len(), 1);
        assert_eq!(sg.shards[0].owners, Vec::<NodeId>::new());
    }

    #[test]
    fn shard_group_exists_for_covered_timestamp() {
        let mut data = data_with_policy(hourly_policy("rp0"));
        let hour = duration_nanos(HOUR);
        data.create_shard_group("db0", "rp0", hour / 2).unwrap();
        assert_eq!(data.create_shard_group("db0", "rp0", hour / 3), Err(shard_group_exists()));

        // A different bucket is fine, and live ranges stay disjoint.
        data.create_shard_group("db0", "rp0", hour + 1).unwrap();
        let rp = data.retention_policy("db0", "rp0").unwrap();
        let groups = &rp.shard_groups;
        assert_eq!(groups.len(), 2);
        assert!(groups[0].end_time <= groups[1].start_time);
    }

    #[test]
    fn shard_group_ids_are_never_reused() {
        let mut data = data_with_policy(hourly_policy("rp0"));
        let hour = duration_nanos(HOUR);
        data.create_shard_group("db0", "rp0", 0).unwrap();
        let id0 = data.retention_policy("db0", "rp0").unwrap().shard_groups[0].id;
        data.delete_shard_group("db0", "rp0", id0, 1).unwrap();
        data.prune_shard_groups(2).unwrap();
        data.create_shard_group("db0", "rp0", hour).unwrap();
        let id1 = data.retention_policy("db0", "rp0").unwrap().shard_groups[0].id;
        assert!(id1 > id0);
    }

    #[test]
    fn successive_shard_group_starts_at_previous_end() {
        // A group not aligned to the epoch grid: successors must clamp to
        // its end rather than overlap it.
        let mut data = data_with_policy(hourly_policy("rp0"));
        let hour = duration_nanos(HOUR);

        data.create_shard_group("db0", "rp0", 0).unwrap();
        data.truncate_shard_groups(hour / 2).unwrap();
        data.create_shard_group("db0", "rp0", hour / 2).unwrap();

        let rp = data.retention_policy("db0", "rp0").unwrap();
        assert_eq!(rp.shard_groups.len(), 2);
        let second = &rp.shard_groups[1];
        assert_eq!(second.start_time, hour / 2);
        assert_eq!(second.end_time, hour / 2 + hour);

        // The successor of the unaligned group starts at its end.
        data.create_shard_group("db0", "rp0", second.end_time + 1).unwrap();
        let rp = data.retention_policy("db0", "rp0").unwrap();
        let third = &rp.shard_groups[2];
        assert_eq!(third.start_time, hour / 2 + hour);
        assert_eq!(third.end_time, third.start_time + hour);
    }

    #[test]
    fn gap_filling_shard_group_is_born_truncated() {
        let mut data = data_with_policy(hourly_policy("rp0"));
        let hour = duration_nanos(HOUR);

        // Groups at [0, 1h) and [1h, 2h), with [0, 1h) truncated at 30m.
        data.create_shard_group("db0", "rp0", 0).unwrap();
        data.create_shard_group("db0", "rp0", hour).unwrap();
        data.truncate_shard_groups(hour / 2).unwrap();

        // A write at 54m lands in the gap: the new group clamps forward to
        // the truncation point but must not swallow the group at 1h, so it
        // is created already truncated there.
        data.create_shard_group("db0", "rp0", hour * 9 / 10).unwrap();
        let rp = data.retention_policy("db0", "rp0").unwrap();
        let gap = &rp.shard_groups[2];
        assert_eq!(gap.start_time, hour / 2);
        assert_eq!(gap.end_time, hour / 2 + hour);
        assert_eq!(gap.truncated_at, hour);
        assert!(gap.contains(hour * 9 / 10));

        // No two live groups cover the same timestamp.
        for t in (0..2 * hour).step_by((hour / 10) as usize) {
            let covering =
                rp.shard_groups.iter().filter(|sg| !sg.deleted() && sg.contains(t)).count();
            assert!(covering <= 1, "timestamp {t} covered by {covering} groups");
        }
    }

    #[test]
    fn truncate_marks_spanning_groups() {
        let mut data = data_with_policy(hourly_policy("rp0"));
        let hour = duration_nanos(HOUR);
        data.create_shard_group("db0", "rp0", 0).unwrap();
        data.create_shard_group("db0", "rp0", hour).unwrap();

        data.truncate_shard_groups(hour / 2).unwrap();
        let rp = data.retention_policy("db0", "rp0").unwrap();
        assert_eq!(rp.shard_groups[0].truncated_at, hour / 2);
        // The later group does not span the truncation point.
        assert!(!rp.shard_groups[1].truncated());

        // A truncated group no longer covers times past the truncation.
        assert!(!rp.shard_groups[0].contains(hour / 2));
        assert!(rp.shard_groups[0].contains(hour / 2 - 1));
    }

    #[test]
    fn prune_removes_only_expired_tombstones() {
        let mut data = data_with_policy(hourly_policy("rp0"));
        let hour = duration_nanos(HOUR);
        data.create_shard_group("db0", "rp0", 0).unwrap();
        data.create_shard_group("db0", "rp0", hour).unwrap();
        let rp = data.retention_policy("db0", "rp0").unwrap();
        let (id0, id1) = (rp.shard_groups[0].id, rp.shard_groups[1].id);

        data.delete_shard_group("db0", "rp0", id0, 100).unwrap();
        data.delete_shard_group("db0", "rp0", id1, 200).unwrap();

        data.prune_shard_groups(150).unwrap();
        let rp = data.retention_policy("db0", "rp0").unwrap();
        assert_eq!(rp.shard_groups.len(), 1);
        assert_eq!(rp.shard_groups[0].id, id1);
    }

    #[test]
    fn drop_last_shard_deletes_group() {
        let mut data = data_with_policy(hourly_policy("rp0"));
        data.create_shard_group("db0", "rp0", 0).unwrap();
        let sg = data.retention_policy("db0", "rp0").unwrap().shard_groups[0].clone();
        assert_eq!(sg.shards.len(), 1);

        data.drop_shard(sg.shards[0].id, 42).unwrap();
        let sg = &data.retention_policy("db0", "rp0").unwrap().shard_groups[0];
        assert!(sg.shards.is_empty());
        assert_eq!(sg.deleted_at, 42);

        // Dropping an unknown shard is a no-op.
        data.drop_shard(12345, 43).unwrap();
    }

    #[test]
    fn update_retention_policy_rejects_short_duration_with_groups() {
        let mut policy = hourly_policy("rp0");
        policy.shard_group_duration = 2 * HOUR;
        let mut data = data_with_policy(policy);
        data.create_shard_group("db0", "rp0", 0).unwrap();

        let update = RetentionPolicyUpdate { duration: Some(HOUR), ..Default::default() };
        assert_eq!(
            data.update_retention_policy("db0", "rp0", &update, false),
            Err(Error::InvalidInput(
                "retention policy duration must not be shorter than the shard group duration"
                    .into()
            ))
        );

        let update = RetentionPolicyUpdate { duration: Some(hours(3)), ..Default::default() };
        data.update_retention_policy("db0", "rp0", &update, false).unwrap();
        assert_eq!(data.retention_policy("db0", "rp0").unwrap().duration, hours(3));
    }

    #[test]
    fn update_retention_policy_rename_follows_default() {
        let mut data = data_with_policy(hourly_policy("rp0"));
        let update =
            RetentionPolicyUpdate { name: Some("renamed".into()), ..Default::default() };
        data.update_retention_policy("db0", "rp0", &update, false).unwrap();
        assert_eq!(data.database("db0").unwrap().default_retention_policy, "renamed");
        assert!(data.retention_policy("db0", "renamed").is_ok());

        // Renaming onto an existing policy is rejected.
        data.create_retention_policy("db0", RetentionPolicyInfo::new("other"), false).unwrap();
        let update = RetentionPolicyUpdate { name: Some("other".into()), ..Default::default() };
        assert_eq!(
            data.update_retention_policy("db0", "renamed", &update, false),
            Err(Error::InvalidInput("retention policy already exists".into()))
        );
    }

    #[test]
    fn drop_retention_policy_clears_default() {
        let mut data = data_with_policy(hourly_policy("rp0"));
        data.drop_retention_policy("db0", "rp0").unwrap();
        assert_eq!(data.database("db0").unwrap().default_retention_policy, "");
    }

    #[test]
    fn users_and_privileges() {
        let mut data = Data::new();
        data.create_database("db0").unwrap();
        data.create_user("ada", "hash0", false).unwrap();

        assert_eq!(
            data.create_user("ada", "hash1", false),
            Err(Error::InvalidInput("user already exists".into()))
        );

        assert!(!data.admin_user_exists());
        data.set_admin_privilege("ada", true).unwrap();
        assert!(data.admin_user_exists());

        assert_eq!(data.user_privilege("ada", "db0").unwrap(), Privilege::None);
        data.set_privilege("ada", "db0", Privilege::Write).unwrap();
        assert_eq!(data.user_privilege("ada", "db0").unwrap(), Privilege::Write);
        assert_eq!(
            data.set_privilege("ada", "nope", Privilege::Read),
            Err(Error::NotFound("database nope".into()))
        );

        data.update_user("ada", "hash2").unwrap();
        assert_eq!(data.user("ada").unwrap().hash, "hash2");

        data.drop_user("ada").unwrap();
        assert_eq!(data.drop_user("ada"), Err(Error::NotFound("user ada".into())));
    }

    #[test]
    fn continuous_query_idempotent_on_same_text() {
        let mut data = Data::new();
        data.create_database("db0").unwrap();
        data.create_continuous_query("db0", "cq0", "SELECT mean(v) INTO x FROM y").unwrap();
        data.create_continuous_query("db0", "cq0", "SELECT mean(v) INTO x FROM y").unwrap();
        assert_eq!(data.database("db0").unwrap().continuous_queries.len(), 1);

        assert_eq!(
            data.create_continuous_query("db0", "cq0", "SELECT max(v) INTO x FROM y"),
            Err(Error::InvalidInput("continuous query already exists".into()))
        );

        data.drop_continuous_query("db0", "cq0").unwrap();
        assert_eq!(
            data.drop_continuous_query("db0", "cq0"),
            Err(Error::NotFound("continuous query cq0".into()))
        );
    }

    #[test]
    fn subscriptions_reject_duplicates() {
        let mut data = data_with_policy(hourly_policy("rp0"));
        data.create_subscription(
            "db0",
            "rp0",
            "sub0",
            SubscriptionMode::Any,
            vec!["http://remote:9092".into()],
        )
        .unwrap();
        assert_eq!(
            data.create_subscription("db0", "rp0", "sub0", SubscriptionMode::All, Vec::new()),
            Err(Error::InvalidInput("subscription already exists".into()))
        );
        data.drop_subscription("db0", "rp0", "sub0").unwrap();
        assert_eq!(
            data.drop_subscription("db0", "rp0", "sub0"),
            Err(Error::NotFound("subscription sub0".into()))
        );
    }

    #[test]
    fn data_nodes_create_and_delete() {
        let mut policy = hourly_policy("rp0");
        policy.replica_n = 2;
        let mut data = data_with_policy(policy);
        data.create_data_node("host1:8091", "host1:8089").unwrap();
        data.create_data_node("host2:8091", "host2:8089").unwrap();

        // Idempotent on identical addresses, conflict on partial match.
        data.create_data_node("host1:8091", "host1:8089").unwrap();
        assert_eq!(data.data_nodes.len(), 2);
        assert_eq!(
            data.create_data_node("host1:8091", "elsewhere:8089"),
            Err(Error::InvalidInput("data node already exists".into()))
        );

        data.create_shard_group("db0", "rp0", 0).unwrap();
        data.delete_data_node(1).unwrap();
        let sg = &data.retention_policy("db0", "rp0").unwrap().shard_groups[0];
        assert!(sg.shards.iter().all(|s| !s.owners.contains(&1)));

        assert_eq!(data.delete_data_node(1), Err(Error::NotFound("data node 1".into())));
    }

    #[test]
    fn set_meta_node_rebinds_sole_node() {
        let mut data = Data { cluster_id: 0, ..Default::default() };
        data.set_meta_node("host1:8091", "host1:8089", 42).unwrap();
        assert_eq!(data.cluster_id, 42);
        assert_eq!(data.meta_nodes[0].id, 1);

        // Rebinding keeps the ID.
        data.set_meta_node("newhost:8091", "newhost:8089", 7).unwrap();
        assert_eq!(data.meta_nodes.len(), 1);
        assert_eq!(data.meta_nodes[0].id, 1);
        assert_eq!(data.meta_nodes[0].host, "newhost:8091");
        assert_eq!(data.cluster_id, 42);
    }

    #[test]
    fn shard_groups_by_time_range_sorted_and_filtered() {
        let mut data = data_with_policy(hourly_policy("rp0"));
        let hour = duration_nanos(HOUR);
        data.create_shard_group("db0", "rp0", 2 * hour).unwrap();
        data.create_shard_group("db0", "rp0", 0).unwrap();
        data.create_shard_group("db0", "rp0", hour).unwrap();

        let rp = data.retention_policy("db0", "rp0").unwrap();
        let deleted = rp.shard_groups.iter().find(|sg| sg.start_time == hour).unwrap().id;
        data.delete_shard_group("db0", "rp0", deleted, 1).unwrap();

        let groups = data.shard_groups_by_time_range("db0", "rp0", 0, 3 * hour).unwrap();
        assert_eq!(groups.len(), 2);
        assert!(groups[0].start_time < groups[1].start_time);
        assert!(groups.iter().all(|sg| sg.id != deleted));
    }

    #[test]
    fn shard_owner_lookup() {
        let mut data = data_with_policy(hourly_policy("rp0"));
        data.create_shard_group("db0", "rp0", 0).unwrap();
        let shard_id = data.retention_policy("db0", "rp0").unwrap().shard_groups[0].shards[0].id;

        let (db, rp, sg) = data.shard_owner(shard_id).unwrap();
        assert_eq!(db, "db0");
        assert_eq!(rp, "rp0");
        assert!(sg.shards.iter().any(|s| s.id == shard_id));

        assert_eq!(data.shard_owner(12345), None);
    }

    #[test]
    fn clone_is_deep() {
        let mut data = data_with_policy(hourly_policy("rp0"));
        data.create_user("ada", "hash", true).unwrap();
        data.create_shard_group("db0", "rp0", 0).unwrap();

        let mut clone = data.clone();
        clone.databases[0].retention_policies[0].shard_groups[0].shards[0].owners.push(99);
        clone.users[0].privileges.insert("db0".into(), Privilege::All);
        clone.databases[0].name = "mutated".into();

        assert!(data.retention_policy("db0", "rp0").unwrap().shard_groups[0].shards[0]
            .owners
            .is_empty());
        assert!(data.users[0].privileges.is_empty());
        assert_eq!(data.databases[0].name, "db0");
    }

    #[test]
    fn encoding_round_trip() {
        let mut data = data_with_policy(hourly_policy("rp0"));
        data.create_user("ada", "hash", true).unwrap();
        data.create_shard_group("db0", "rp0", 0).unwrap();

        let decoded = Data::decode(&data.encode().unwrap()).unwrap();
        assert_eq!(decoded, data);
    }
}

//! The replicated command vocabulary.
//!
//! Every mutation of the metadata document travels as a Command: the local
//! client applies it directly to its own document, while the remote client
//! encodes it, POSTs it to a meta server, and the leader's store appends it
//! to the consensus log. Command is a single tagged union dispatched by
//! Data::apply, so all replicas interpret entries identically.

use crate::data::{
    Data, Index, NodeId, Privilege, RetentionPolicyInfo, RetentionPolicyUpdate, ShardGroupId,
    ShardId, SubscriptionMode, Timestamp,
};
use crate::encoding;
use crate::error::Error;

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A command applied to the metadata state machine. Timestamps that affect
/// replicated state (deletion markers, truncation points, prune cutoffs) are
/// chosen by the submitter and carried in the command, keeping the state
/// machine deterministic across replicas.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Command {
    CreateDataNode { http_addr: String, tcp_addr: String },
    DeleteDataNode { id: NodeId },
    CreateMetaNode { http_addr: String, tcp_addr: String, nonce: u64 },
    DeleteMetaNode { id: NodeId },
    /// Creates or rebinds the sole meta node (single-peer bootstrap).
    SetMetaNode { http_addr: String, tcp_addr: String, nonce: u64 },
    /// Creates a database, optionally with an initial default retention
    /// policy.
    CreateDatabase { name: String, retention_policy: Option<RetentionPolicyInfo> },
    DropDatabase { name: String },
    CreateRetentionPolicy { database: String, policy: RetentionPolicyInfo, default: bool },
    DropRetentionPolicy { database: String, name: String },
    SetDefaultRetentionPolicy { database: String, name: String },
    UpdateRetentionPolicy {
        database: String,
        name: String,
        update: RetentionPolicyUpdate,
        default: bool,
    },
    CreateShardGroup { database: String, policy: String, timestamp: Timestamp },
    DeleteShardGroup { database: String, policy: String, id: ShardGroupId, at: Timestamp },
    DropShard { id: ShardId, at: Timestamp },
    TruncateShardGroups { at: Timestamp },
    PruneShardGroups { expiration: Timestamp },
    CreateUser { name: String, hash: String, admin: bool },
    DropUser { name: String },
    UpdateUser { name: String, hash: String },
    SetPrivilege { username: String, database: String, privilege: Privilege },
    SetAdminPrivilege { username: String, admin: bool },
    CreateContinuousQuery { database: String, name: String, query: String },
    DropContinuousQuery { database: String, name: String },
    CreateSubscription {
        database: String,
        retention_policy: String,
        name: String,
        mode: SubscriptionMode,
        destinations: Vec<String>,
    },
    DropSubscription { database: String, retention_policy: String, name: String },
    /// Wholesale document replacement, used for bootstrap only.
    SetData { data: Data },
}

impl encoding::Value for Command {}

impl Data {
    /// Applies a command to the document. The caller is responsible for the
    /// copy-on-write discipline (apply to a clone, bump the index, swap) so
    /// that a failed command leaves the live document untouched.
    pub fn apply(&mut self, command: Command) -> crate::error::Result<()> {
        match command {
            Command::CreateDataNode { http_addr, tcp_addr } => {
                self.create_data_node(&http_addr, &tcp_addr)
            }
            Command::DeleteDataNode { id } => self.delete_data_node(id),
            Command::CreateMetaNode { http_addr, tcp_addr, nonce } => {
                self.create_meta_node(&http_addr, &tcp_addr, nonce)
            }
            Command::DeleteMetaNode { id } => self.delete_meta_node(id),
            Command::SetMetaNode { http_addr, tcp_addr, nonce } => {
                self.set_meta_node(&http_addr, &tcp_addr, nonce)
            }
            Command::CreateDatabase { name, retention_policy } => {
                self.create_database(&name)?;
                if let Some(policy) = retention_policy {
                    self.create_initial_retention_policy(&name, policy)?;
                }
                Ok(())
            }
            Command::DropDatabase { name } => self.drop_database(&name),
            Command::CreateRetentionPolicy { database, policy, default } => {
                self.create_retention_policy(&database, policy, default)
            }
            Command::DropRetentionPolicy { database, name } => {
                self.drop_retention_policy(&database, &name)
            }
            Command::SetDefaultRetentionPolicy { database, name } => {
                self.set_default_retention_policy(&database, &name)
            }
            Command::UpdateRetentionPolicy { database, name, update, default } => {
                self.update_retention_policy(&database, &name, &update, default)
            }
            Command::CreateShardGroup { database, policy, timestamp } => {
                self.create_shard_group(&database, &policy, timestamp)
            }
            Command::DeleteShardGroup { database, policy, id, at } => {
                self.delete_shard_group(&database, &policy, id, at)
            }
            Command::DropShard { id, at } => self.drop_shard(id, at),
            Command::TruncateShardGroups { at } => self.truncate_shard_groups(at),
            Command::PruneShardGroups { expiration } => self.prune_shard_groups(expiration),
            Command::CreateUser { name, hash, admin } => self.create_user(&name, &hash, admin),
            Command::DropUser { name } => self.drop_user(&name),
            Command::UpdateUser { name, hash } => self.update_user(&name, &hash),
            Command::SetPrivilege { username, database, privilege } => {
                self.set_privilege(&username, &database, privilege)
            }
            Command::SetAdminPrivilege { username, admin } => {
                self.set_admin_privilege(&username, admin)
            }
            Command::CreateContinuousQuery { database, name, query } => {
                self.create_continuous_query(&database, &name, &query)
            }
            Command::DropContinuousQuery { database, name } => {
                self.drop_continuous_query(&database, &name)
            }
            Command::CreateSubscription { database, retention_policy, name, mode, destinations } => {
                self.create_subscription(&database, &retention_policy, &name, mode, destinations)
            }
            Command::DropSubscription { database, retention_policy, name } => {
                self.drop_subscription(&database, &retention_policy, &name)
            }
            Command::SetData { data } => {
                *self = data;
                Ok(())
            }
        }
    }

    /// Installs an initial retention policy delivered with CreateDatabase.
    /// Only valid as the database's default policy: if policies already
    /// exist, the new policy must match the current default exactly.
    fn create_initial_retention_policy(
        &mut self,
        database: &str,
        policy: RetentionPolicyInfo,
    ) -> crate::error::Result<()> {
        if policy.duration != Duration::ZERO
            && policy.duration < crate::data::MIN_RETENTION_POLICY_DURATION
        {
            return Err(crate::data::retention_policy_duration_too_low());
        }
        let db = self.database(database).expect("database was just created");
        if db.retention_policies.is_empty() {
            return self.create_retention_policy(database, policy, true);
        }
        match db.retention_policy(&policy.name) {
            Some(existing)
                if existing.matches(&policy) && db.default_retention_policy == policy.name =>
            {
                Ok(())
            }
            _ => Err(crate::data::retention_policy_conflict()),
        }
    }
}

/// The response to an executed command, returned by POST /execute. A command
/// that fails validation is still committed and applied by every replica
/// (with no effect); the error only travels back to the submitter here.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// The document index the command produced, or the current index if the
    /// command had no effect.
    pub index: Index,
    /// The domain error produced by the command, if any.
    pub error: Option<Error>,
}

impl encoding::Value for Response {}

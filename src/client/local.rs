//! The single-process client, used when the database embeds its metadata
//! (non-clustered deployments). It owns the document outright: mutations
//! clone the cached document, apply a command to the clone, persist it to a
//! single meta.db snapshot file, and swap it in under the write lock, so
//! readers observe either the old or the new document in full.

use super::MetaClient;
use crate::auth::{AuthCache, BCRYPT_COST};
use crate::command::Command;
use crate::data::{
    self, Data, DatabaseInfo, Lease, NodeId, NodeInfo, Privilege, RetentionPolicyInfo,
    RetentionPolicySpec, RetentionPolicyUpdate, ShardGroupId, ShardGroupInfo, ShardId, Timestamp,
    UserInfo, DEFAULT_LEASE_DURATION, DEFAULT_RETENTION_POLICY_NAME,
    MIN_RETENTION_POLICY_DURATION, SHARD_GROUP_DELETED_EXPIRATION,
};
use crate::encoding::Value as _;
use crate::error::{Error, Result};
use crate::errinput;

use crossbeam::channel::{self, Receiver, Sender};
use log::{info, warn};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

/// The snapshot file name.
const META_FILE: &str = "meta.db";

struct LocalState {
    data: Data,
    auth: AuthCache,
    changed: Receiver<()>,
    changed_tx: Option<Sender<()>>,
    closed: bool,
}

impl LocalState {
    /// Installs a new document version and wakes every change waiter by
    /// dropping the previous broadcast sender.
    fn install(&mut self, data: Data) {
        self.data = data;
        let (tx, rx) = channel::unbounded();
        self.changed_tx = Some(tx);
        self.changed = rx;
    }
}

/// The embedded metadata client.
pub struct Local {
    path: PathBuf,
    retention_autocreate: bool,
    state: RwLock<LocalState>,
    close_tx: Mutex<Option<Sender<()>>>,
}

impl Local {
    /// Opens the client against a data directory, loading meta.db if
    /// present. A brand new instance persists its genesis snapshot
    /// immediately.
    pub fn open(dir: impl Into<PathBuf>, retention_autocreate: bool) -> Result<Local> {
        let path = dir.into();
        let data = Self::load(&path)?.unwrap_or_else(Data::new);
        if data.index == 1 {
            snapshot(&path, &data)?;
        }
        info!("Opened meta client at index {} in {}", data.index, path.display());

        let (changed_tx, changed) = channel::unbounded();
        let (close_tx, _closing) = channel::unbounded();
        Ok(Local {
            path,
            retention_autocreate,
            state: RwLock::new(LocalState {
                data,
                auth: AuthCache::new(),
                changed,
                changed_tx: Some(changed_tx),
                closed: false,
            }),
            close_tx: Mutex::new(Some(close_tx)),
        })
    }

    /// Loads the snapshot file, or returns None if it does not exist.
    fn load(dir: &Path) -> Result<Option<Data>> {
        let file = match std::fs::File::open(dir.join(META_FILE)) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(Some(Data::decode_from(std::io::BufReader::new(file))?))
    }

    /// Commits a mutated clone: bumps the index, persists it, and swaps it
    /// in. The write lock is held by the caller across the disk write.
    fn commit(&self, st: &mut LocalState, mut data: Data) -> Result<()> {
        data.index += 1;
        snapshot(&self.path, &data)?;
        st.install(data);
        Ok(())
    }

    /// Applies a single command via the copy-on-write path.
    fn mutate(&self, command: Command) -> Result<()> {
        let mut st = self.state.write()?;
        if st.closed {
            return Err(Error::Abort);
        }
        let mut data = st.data.clone();
        data.apply(command)?;
        self.commit(&mut st, data)
    }
}

/// Writes the snapshot atomically via a temp file and rename.
fn snapshot(dir: &Path, data: &Data) -> Result<()> {
    let filename = dir.join(META_FILE);
    let tmp = dir.join(format!("{META_FILE}tmp"));
    let mut file = std::fs::File::create(&tmp)?;
    data.encode_into(&mut file)?;
    file.sync_all()?;
    drop(file);
    std::fs::rename(tmp, filename)?;
    Ok(())
}

impl MetaClient for Local {
    fn node_id(&self) -> NodeId {
        0
    }

    fn cluster_id(&self) -> Result<u64> {
        Ok(self.state.read()?.data.cluster_id)
    }

    fn ping(&self, _all: bool) -> Result<()> {
        Ok(())
    }

    /// Single node: the lease is always granted.
    fn acquire_lease(&self, name: &str) -> Result<Lease> {
        Ok(Lease {
            name: name.into(),
            owner: self.node_id(),
            expiration: data::now() + data::duration_nanos(DEFAULT_LEASE_DURATION),
        })
    }

    fn data_node(&self, id: NodeId) -> Result<NodeInfo> {
        let st = self.state.read()?;
        st.data
            .data_nodes
            .iter()
            .find(|n| n.id == id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("data node {id}")))
    }

    fn data_nodes(&self) -> Result<Vec<NodeInfo>> {
        Ok(self.state.read()?.data.data_nodes.clone())
    }

    fn create_data_node(&self, _http_addr: &str, _tcp_addr: &str) -> Result<NodeInfo> {
        errinput!("cluster membership requires a meta service")
    }

    fn data_node_by_http_host(&self, http_addr: &str) -> Result<NodeInfo> {
        let st = self.state.read()?;
        st.data
            .data_nodes
            .iter()
            .find(|n| n.host == http_addr)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("data node {http_addr}")))
    }

    fn data_node_by_tcp_host(&self, tcp_addr: &str) -> Result<NodeInfo> {
        let st = self.state.read()?;
        st.data
            .data_nodes
            .iter()
            .find(|n| n.tcp_host == tcp_addr)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("data node {tcp_addr}")))
    }

    fn delete_data_node(&self, _id: NodeId) -> Result<()> {
        errinput!("cluster membership requires a meta service")
    }

    fn meta_nodes(&self) -> Result<Vec<NodeInfo>> {
        Ok(self.state.read()?.data.meta_nodes.clone())
    }

    fn meta_node_by_addr(&self, addr: &str) -> Result<Option<NodeInfo>> {
        Ok(self.state.read()?.data.meta_nodes.iter().find(|n| n.host == addr).cloned())
    }

    fn create_meta_node(&self, _http_addr: &str, _tcp_addr: &str) -> Result<NodeInfo> {
        errinput!("cluster membership requires a meta service")
    }

    fn delete_meta_node(&self, _id: NodeId) -> Result<()> {
        errinput!("cluster membership requires a meta service")
    }

    fn database(&self, name: &str) -> Result<Option<DatabaseInfo>> {
        Ok(self.state.read()?.data.database(name).cloned())
    }

    fn databases(&self) -> Result<Vec<DatabaseInfo>> {
        Ok(self.state.read()?.data.databases.clone())
    }

    fn create_database(&self, name: &str) -> Result<DatabaseInfo> {
        let mut st = self.state.write()?;
        if st.closed {
            return Err(Error::Abort);
        }
        if let Some(db) = st.data.database(name) {
            return Ok(db.clone());
        }

        let retention_policy = self
            .retention_autocreate
            .then(|| RetentionPolicyInfo::new(DEFAULT_RETENTION_POLICY_NAME));
        let mut data = st.data.clone();
        data.apply(Command::CreateDatabase { name: name.into(), retention_policy })?;
        let db = data.database(name).cloned().expect("database was just created");
        self.commit(&mut st, data)?;
        Ok(db)
    }

    fn create_database_with_retention_policy(
        &self,
        name: &str,
        spec: &RetentionPolicySpec,
    ) -> Result<DatabaseInfo> {
        if let Some(duration) = spec.duration {
            if duration != Duration::ZERO && duration < MIN_RETENTION_POLICY_DURATION {
                return Err(data::retention_policy_duration_too_low());
            }
        }
        let mut st = self.state.write()?;
        if st.closed {
            return Err(Error::Abort);
        }
        let mut data = st.data.clone();
        data.apply(Command::CreateDatabase {
            name: name.into(),
            retention_policy: Some(spec.new_retention_policy_info()),
        })?;
        let db = data.database(name).cloned().expect("database was just created");
        self.commit(&mut st, data)?;
        Ok(db)
    }

    fn drop_database(&self, name: &str) -> Result<()> {
        self.mutate(Command::DropDatabase { name: name.into() })
    }

    fn create_retention_policy(
        &self,
        database: &str,
        spec: &RetentionPolicySpec,
        make_default: bool,
    ) -> Result<RetentionPolicyInfo> {
        if let Some(duration) = spec.duration {
            if duration != Duration::ZERO && duration < MIN_RETENTION_POLICY_DURATION {
                return Err(data::retention_policy_duration_too_low());
            }
        }
        let policy = spec.new_retention_policy_info();
        let name = policy.name.clone();
        self.mutate(Command::CreateRetentionPolicy {
            database: database.into(),
            policy,
            default: make_default,
        })?;
        let st = self.state.read()?;
        Ok(st.data.retention_policy(database, &name)?.clone())
    }

    fn retention_policy(
        &self,
        database: &str,
        name: &str,
    ) -> Result<Option<RetentionPolicyInfo>> {
        let st = self.state.read()?;
        let db = st
            .data
            .database(database)
            .ok_or_else(|| Error::NotFound(format!("database {database}")))?;
        Ok(db.retention_policy(name).cloned())
    }

    fn drop_retention_policy(&self, database: &str, name: &str) -> Result<()> {
        self.mutate(Command::DropRetentionPolicy { database: database.into(), name: name.into() })
    }

    fn set_default_retention_policy(&self, database: &str, name: &str) -> Result<()> {
        self.mutate(Command::SetDefaultRetentionPolicy {
            database: database.into(),
            name: name.into(),
        })
    }

    fn update_retention_policy(
        &self,
        database: &str,
        name: &str,
        update: &RetentionPolicyUpdate,
        make_default: bool,
    ) -> Result<()> {
        self.mutate(Command::UpdateRetentionPolicy {
            database: database.into(),
            name: name.into(),
            update: update.clone(),
            default: make_default,
        })
    }

    fn users(&self) -> Result<Vec<UserInfo>> {
        Ok(self.state.read()?.data.users.clone())
    }

    fn user_count(&self) -> Result<usize> {
        Ok(self.state.read()?.data.users.len())
    }

    fn user(&self, name: &str) -> Result<UserInfo> {
        let st = self.state.read()?;
        st.data.user(name).cloned().ok_or_else(|| Error::NotFound(format!("user {name}")))
    }

    fn create_user(&self, name: &str, password: &str, admin: bool) -> Result<UserInfo> {
        let mut st = self.state.write()?;
        if st.closed {
            return Err(Error::Abort);
        }
        // Idempotent when the password and admin flag match.
        if let Some(user) = st.data.user(name) {
            if !bcrypt::verify(password, &user.hash)? || user.admin != admin {
                return errinput!("user already exists");
            }
            return Ok(user.clone());
        }

        // Hash the password before it is ever stored.
        let hash = bcrypt::hash(password, BCRYPT_COST)?;
        let mut data = st.data.clone();
        data.apply(Command::CreateUser { name: name.into(), hash, admin })?;
        let user = data.user(name).cloned().expect("user was just created");
        self.commit(&mut st, data)?;
        Ok(user)
    }

    fn update_user(&self, name: &str, password: &str) -> Result<()> {
        let mut st = self.state.write()?;
        if st.closed {
            return Err(Error::Abort);
        }
        let hash = bcrypt::hash(password, BCRYPT_COST)?;
        let mut data = st.data.clone();
        data.apply(Command::UpdateUser { name: name.into(), hash })?;
        st.auth.evict(name);
        self.commit(&mut st, data)
    }

    fn drop_user(&self, name: &str) -> Result<()> {
        let mut st = self.state.write()?;
        if st.closed {
            return Err(Error::Abort);
        }
        let mut data = st.data.clone();
        data.apply(Command::DropUser { name: name.into() })?;
        st.auth.evict(name);
        self.commit(&mut st, data)
    }

    fn set_privilege(&self, username: &str, database: &str, privilege: Privilege) -> Result<()> {
        self.mutate(Command::SetPrivilege {
            username: username.into(),
            database: database.into(),
            privilege,
        })
    }

    fn set_admin_privilege(&self, username: &str, admin: bool) -> Result<()> {
        self.mutate(Command::SetAdminPrivilege { username: username.into(), admin })
    }

    fn user_privileges(&self, username: &str) -> Result<BTreeMap<String, Privilege>> {
        self.state.read()?.data.user_privileges(username)
    }

    fn user_privilege(&self, username: &str, database: &str) -> Result<Privilege> {
        self.state.read()?.data.user_privilege(username, database)
    }

    fn admin_user_exists(&self) -> Result<bool> {
        Ok(self.state.read()?.data.admin_user_exists())
    }

    fn authenticate(&self, username: &str, password: &str) -> Result<UserInfo> {
        // Fast path: the cached salt and hash, under the read lock.
        let user = {
            let st = self.state.read()?;
            let user = st
                .data
                .user(username)
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("user {username}")))?;
            if st.auth.verify(username, password) {
                return Ok(user);
            }
            user
        };

        // Slow path: the full KDF, outside any lock.
        if !bcrypt::verify(password, &user.hash)? {
            return Err(Error::Authenticate);
        }
        self.state.write()?.auth.store(username, password, &user.hash);
        Ok(user)
    }

    fn shard_ids(&self) -> Result<Vec<ShardId>> {
        Ok(self.state.read()?.data.shard_ids())
    }

    fn shard_groups_by_time_range(
        &self,
        database: &str,
        policy: &str,
        min: Timestamp,
        max: Timestamp,
    ) -> Result<Vec<ShardGroupInfo>> {
        self.state.read()?.data.shard_groups_by_time_range(database, policy, min, max)
    }

    fn drop_shard(&self, id: ShardId) -> Result<()> {
        self.mutate(Command::DropShard { id, at: data::now() })
    }

    fn truncate_shard_groups(&self, at: Timestamp) -> Result<()> {
        self.mutate(Command::TruncateShardGroups { at })
    }

    fn prune_shard_groups(&self) -> Result<()> {
        let expiration = data::now() - data::duration_nanos(SHARD_GROUP_DELETED_EXPIRATION);
        let mut st = self.state.write()?;
        if st.closed {
            return Err(Error::Abort);
        }
        let mut data = st.data.clone();
        data.apply(Command::PruneShardGroups { expiration })?;
        // Skip the commit (and index bump) when nothing was pruned.
        if data == st.data {
            return Ok(());
        }
        self.commit(&mut st, data)
    }

    fn create_shard_group(
        &self,
        database: &str,
        policy: &str,
        timestamp: Timestamp,
    ) -> Result<ShardGroupInfo> {
        // Check under the read lock first.
        {
            let st = self.state.read()?;
            if let Some(sg) = st.data.shard_group_by_timestamp(database, policy, timestamp)? {
                return Ok(sg.clone());
            }
        }

        let mut st = self.state.write()?;
        if st.closed {
            return Err(Error::Abort);
        }
        // Check again under the write lock.
        if let Some(sg) = st.data.shard_group_by_timestamp(database, policy, timestamp)? {
            return Ok(sg.clone());
        }
        let mut data = st.data.clone();
        data.apply(Command::CreateShardGroup {
            database: database.into(),
            policy: policy.into(),
            timestamp,
        })?;
        let sg = data
            .shard_group_by_timestamp(database, policy, timestamp)?
            .cloned()
            .expect("shard group was just created");
        self.commit(&mut st, data)?;
        Ok(sg)
    }

    fn delete_shard_group(&self, database: &str, policy: &str, id: ShardGroupId) -> Result<()> {
        self.mutate(Command::DeleteShardGroup {
            database: database.into(),
            policy: policy.into(),
            id,
            at: data::now(),
        })
    }

    fn precreate_shard_groups(&self, from: Timestamp, to: Timestamp) -> Result<()> {
        let mut st = self.state.write()?;
        if st.closed {
            return Err(Error::Abort);
        }
        let mut data = st.data.clone();
        let mut changed = false;

        // Collect the candidate successors first, then create them on the
        // clone. Every retention policy in every database is considered.
        let mut candidates = Vec::new();
        for db in &data.databases {
            for rp in &db.retention_policies {
                // Skip policies that never had data, or whose latest group
                // is deleted or does not end within (from, to). The lower
                // bound keeps us from creating groups wholly in the past.
                let Some(latest) = rp.latest_shard_group() else { continue };
                if !latest.deleted() && latest.end_time < to && latest.end_time > from {
                    candidates.push((db.name.clone(), rp.name.clone(), latest.end_time));
                }
            }
        }

        for (db, rp, end_time) in candidates {
            let next = end_time + 1;
            if data.shard_group_by_timestamp(&db, &rp, next)?.is_some() {
                continue;
            }
            match data.create_shard_group(&db, &rp, next) {
                Ok(()) => {
                    changed = true;
                    info!("Precreated shard group for {db}.{rp} at {next}");
                }
                Err(err) => warn!("Failed to precreate shard group for {db}.{rp}: {err}"),
            }
        }

        if changed {
            self.commit(&mut st, data)?;
        }
        Ok(())
    }

    fn shard_owner(&self, shard_id: ShardId) -> Result<Option<(String, String, ShardGroupInfo)>> {
        Ok(self.state.read()?.data.shard_owner(shard_id))
    }

    fn create_continuous_query(&self, database: &str, name: &str, query: &str) -> Result<()> {
        self.mutate(Command::CreateContinuousQuery {
            database: database.into(),
            name: name.into(),
            query: query.into(),
        })
    }

    fn drop_continuous_query(&self, database: &str, name: &str) -> Result<()> {
        self.mutate(Command::DropContinuousQuery { database: database.into(), name: name.into() })
    }

    fn create_subscription(
        &self,
        database: &str,
        policy: &str,
        name: &str,
        mode: &str,
        destinations: &[String],
    ) -> Result<()> {
        self.mutate(Command::CreateSubscription {
            database: database.into(),
            retention_policy: policy.into(),
            name: name.into(),
            mode: mode.parse()?,
            destinations: destinations.to_vec(),
        })
    }

    fn drop_subscription(&self, database: &str, policy: &str, name: &str) -> Result<()> {
        self.mutate(Command::DropSubscription {
            database: database.into(),
            retention_policy: policy.into(),
            name: name.into(),
        })
    }

    fn set_data(&self, data: &Data) -> Result<()> {
        let mut st = self.state.write()?;
        if st.closed {
            return Err(Error::Abort);
        }
        self.commit(&mut st, data.clone())
    }

    fn data(&self) -> Result<Data> {
        Ok(self.state.read()?.data.clone())
    }

    fn wait_for_data_changed(&self) -> Result<Receiver<()>> {
        Ok(self.state.read()?.changed.clone())
    }

    fn close(&self) -> Result<()> {
        let mut st = self.state.write()?;
        if st.closed {
            return Ok(());
        }
        st.closed = true;
        st.changed_tx.take();
        self.close_tx.lock()?.take();
        Ok(())
    }
}

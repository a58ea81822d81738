//! The cluster client, used by data nodes to reflect the meta service
//! cluster. It long-polls any meta server for snapshots strictly newer than
//! its cached document, submits commands by POST with redirect-to-leader
//! handling and backoff, and keeps the same authentication cache as the
//! local client. Each client owns its own HTTP connection pool.

use super::MetaClient;
use crate::auth::{AuthCache, BCRYPT_COST};
use crate::command::{Command, Response};
use crate::data::{
    self, Data, DatabaseInfo, Index, Lease, NodeId, NodeInfo, Privilege, RetentionPolicyInfo,
    RetentionPolicySpec, RetentionPolicyUpdate, ShardGroupId, ShardGroupInfo, ShardId, Timestamp,
    UserInfo, MIN_RETENTION_POLICY_DURATION, SHARD_GROUP_DELETED_EXPIRATION,
};
use crate::encoding::Value as _;
use crate::error::{Error, Result};
use crate::{errdata, errinput};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use log::{error, info, warn};
use reqwest::StatusCode;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

/// How long to sleep after a failed attempt before trying the next meta
/// server.
const ERR_SLEEP: Duration = Duration::from_secs(1);

/// The maximum number of attempts before surfacing a transport failure.
const MAX_RETRIES: usize = 10;

struct RemoteState {
    meta_servers: Vec<String>,
    data: Data,
    auth: AuthCache,
    changed: Receiver<()>,
    changed_tx: Option<Sender<()>>,
    closed: bool,
}

impl RemoteState {
    /// Installs a newer snapshot: drops stale auth entries, swaps the
    /// document, and wakes every change waiter by dropping the previous
    /// broadcast sender.
    fn install(&mut self, data: Data) {
        self.auth.retain_current(&data.users);
        self.data = data;
        let (tx, rx) = channel::unbounded();
        self.changed_tx = Some(tx);
        self.changed = rx;
    }
}

struct RemoteInner {
    tls: bool,
    node_id: AtomicU64,
    http: reqwest::blocking::Client,
    state: RwLock<RemoteState>,
    /// Blocks until close() drops the paired sender.
    closing: Receiver<()>,
    close_tx: Mutex<Option<Sender<()>>>,
}

impl RemoteInner {
    /// Returns true once close() has been called.
    fn closed(&self) -> bool {
        matches!(self.closing.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Sleeps for the duration, returning Abort if the client closes first.
    fn sleep(&self, duration: Duration) -> Result<()> {
        match self.closing.recv_timeout(duration) {
            Err(RecvTimeoutError::Timeout) => Ok(()),
            _ => Err(Error::Abort),
        }
    }

    /// Builds the base URL for a meta server.
    fn url(&self, server: &str) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{scheme}://{server}")
    }

    /// Fetches a snapshot with an index strictly greater than the given one,
    /// long-polling the server until it has one.
    fn get_snapshot(&self, server: &str, index: Index) -> Result<Data> {
        let resp = self.http.get(format!("{}/?index={index}", self.url(server))).send()?;
        if resp.status() != StatusCode::OK {
            return Err(Error::Unavailable(format!("meta server returned {}", resp.status())));
        }
        Data::decode(&resp.bytes()?)
    }

    /// Fetches a snapshot newer than the given index, cycling meta servers
    /// until one succeeds. Returns None once the client is closed.
    fn retry_until_snapshot(&self, index: Index) -> Option<Data> {
        let mut current_server = 0;
        loop {
            if self.closed() {
                return None;
            }
            let server = {
                let st = self.state.read().ok()?;
                if st.closed || st.meta_servers.is_empty() {
                    return None;
                }
                st.meta_servers[current_server % st.meta_servers.len()].clone()
            };
            match self.get_snapshot(&server, index) {
                Ok(data) => return Some(data),
                Err(err) => {
                    error!("Failure getting snapshot from {server}: {err}");
                    if self.sleep(ERR_SLEEP).is_err() {
                        return None;
                    }
                    current_server += 1;
                }
            }
        }
    }

    /// The long-poll loop: installs every newer snapshot and broadcasts the
    /// change. The cursor is the cached index and never regresses.
    fn poll_for_updates(&self) {
        loop {
            let index = match self.state.read() {
                Ok(st) if !st.closed => st.data.index,
                _ => return,
            };
            let Some(data) = self.retry_until_snapshot(index) else { return };
            let Ok(mut st) = self.state.write() else { return };
            if data.index > st.data.index {
                st.install(data);
            }
        }
    }
}

/// The cluster metadata client.
pub struct Remote {
    inner: Arc<RemoteInner>,
}

impl Remote {
    /// Creates a client for the given meta servers. Call open() to fetch
    /// the initial snapshot and start the update poller.
    pub fn new(meta_servers: Vec<String>, tls: bool) -> Result<Remote> {
        let (changed_tx, changed) = channel::unbounded();
        let (close_tx, closing) = channel::unbounded();
        // Redirects are disabled: 307 handling is part of the protocol.
        let http = reqwest::blocking::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(None::<Duration>)
            .build()?;
        Ok(Remote {
            inner: Arc::new(RemoteInner {
                tls,
                node_id: AtomicU64::new(0),
                http,
                state: RwLock::new(RemoteState {
                    meta_servers,
                    data: Data::default(),
                    auth: AuthCache::new(),
                    changed,
                    changed_tx: Some(changed_tx),
                    closed: false,
                }),
                closing,
                close_tx: Mutex::new(Some(close_tx)),
            }),
        })
    }

    /// Fetches the initial snapshot and starts the update poller.
    pub fn open(&self) -> Result<()> {
        let Some(data) = self.inner.retry_until_snapshot(0) else { return Err(Error::Abort) };
        info!("Opened remote meta client at index {}", data.index);
        self.inner.state.write()?.install(data);

        let inner = self.inner.clone();
        std::thread::spawn(move || inner.poll_for_updates());
        Ok(())
    }

    /// Replaces the set of meta servers.
    pub fn set_meta_servers(&self, servers: Vec<String>) -> Result<()> {
        self.inner.state.write()?.meta_servers = servers;
        Ok(())
    }

    /// Joins this node to the meta service: adds it to the consensus voters
    /// and records it in the document, following leader redirects. Returns
    /// the node with its assigned ID.
    pub fn join_meta_server(&self, http_addr: &str, tcp_addr: &str) -> Result<NodeInfo> {
        let node = NodeInfo { id: 0, host: http_addr.into(), tcp_host: tcp_addr.into() };
        let body = serde_json::to_vec(&node)?;

        let mut tries = 0;
        let mut current_server = 0;
        let mut redirect: Option<String> = None;
        loop {
            if self.inner.closed() {
                return Err(Error::Abort);
            }
            let url = match redirect.take() {
                Some(url) => url,
                None => {
                    let st = self.inner.state.read()?;
                    if st.meta_servers.is_empty() {
                        return Err(Error::Unavailable("no meta servers".into()));
                    }
                    let server = &st.meta_servers[current_server % st.meta_servers.len()];
                    format!("{}/add-meta", self.inner.url(server))
                }
            };

            match self.join_attempt(&url, &body) {
                Ok(node) => return Ok(node),
                Err(Error::Redirect(location)) => redirect = Some(location),
                Err(err) if err.is_retryable() => {
                    tries += 1;
                    current_server += 1;
                    if tries > MAX_RETRIES {
                        return Err(err);
                    }
                    self.inner.sleep(ERR_SLEEP)?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn join_attempt(&self, url: &str, body: &[u8]) -> Result<NodeInfo> {
        let resp = self
            .inner
            .http
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.to_vec())
            .send()?;
        match resp.status() {
            StatusCode::OK => Ok(serde_json::from_slice(&resp.bytes()?)?),
            StatusCode::TEMPORARY_REDIRECT => Err(Error::Redirect(location(&resp)?)),
            status => Err(Error::Unavailable(format!("meta service returned {status}"))),
        }
    }

    /// Reads a value off the cached document under the read lock.
    fn read<T>(&self, f: impl FnOnce(&Data) -> T) -> Result<T> {
        Ok(f(&self.inner.state.read()?.data))
    }

    /// Submits a command, cycling meta servers and following leader
    /// redirects, until it succeeds, fails with a command error, or exhausts
    /// the retry budget. On success, blocks until the cached document has
    /// caught up with the response index (read-your-writes).
    fn retry_until_exec(&self, command: Command) -> Result<Index> {
        let body = command.encode()?;
        let mut tries = 0;
        let mut current_server = 0;
        let mut redirect: Option<String> = None;

        loop {
            if self.inner.closed() {
                return Err(Error::Abort);
            }
            let url = match redirect.take() {
                Some(url) => url,
                None => {
                    let st = self.inner.state.read()?;
                    if st.meta_servers.is_empty() {
                        return Err(Error::Unavailable("no meta servers".into()));
                    }
                    let server = &st.meta_servers[current_server % st.meta_servers.len()];
                    format!("{}/execute", self.inner.url(server))
                }
            };

            match self.exec(&url, &body) {
                Ok(index) => {
                    self.wait_for_index(index)?;
                    return Ok(index);
                }
                // Redirects are followed without spending a retry.
                Err(Error::Redirect(location)) => redirect = Some(location),
                Err(err) if err.is_retryable() => {
                    tries += 1;
                    current_server += 1;
                    if tries > MAX_RETRIES {
                        return Err(err);
                    }
                    self.inner.sleep(ERR_SLEEP)?;
                }
                // Command errors are final; surface them verbatim.
                Err(err) => return Err(err),
            }
        }
    }

    /// One execute attempt against one URL.
    fn exec(&self, url: &str, body: &[u8]) -> Result<Index> {
        let resp = self
            .inner
            .http
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(body.to_vec())
            .send()?;
        match resp.status() {
            StatusCode::OK => {
                let response = Response::decode(&resp.bytes()?)?;
                match response.error {
                    Some(err) => Err(err),
                    None => Ok(response.index),
                }
            }
            StatusCode::TEMPORARY_REDIRECT => Err(Error::Redirect(location(&resp)?)),
            status => Err(Error::Unavailable(format!("meta service returned {status}"))),
        }
    }

    /// Blocks until the cached document index reaches the given index.
    fn wait_for_index(&self, index: Index) -> Result<()> {
        loop {
            let changed = {
                let st = self.inner.state.read()?;
                if st.data.index >= index {
                    return Ok(());
                }
                if st.closed {
                    return Err(Error::Abort);
                }
                st.changed.clone()
            };
            crossbeam::select! {
                recv(changed) -> _ => {},
                recv(self.inner.closing) -> _ => return Err(Error::Abort),
            }
        }
    }

    fn acquire_lease_once(&self, name: &str) -> Result<Lease> {
        let server = {
            let st = self.inner.state.read()?;
            if st.meta_servers.is_empty() {
                return Err(Error::Unavailable("no meta servers".into()));
            }
            st.meta_servers[0].clone()
        };
        let url = format!(
            "{}/lease?name={name}&nodeid={}",
            self.inner.url(&server),
            self.node_id()
        );
        let resp = self.inner.http.get(url).send()?;
        match resp.status() {
            StatusCode::OK => Ok(serde_json::from_slice(&resp.bytes()?)?),
            StatusCode::CONFLICT => errinput!("another node has the lease"),
            StatusCode::SERVICE_UNAVAILABLE => {
                Err(Error::Unavailable("meta service unavailable".into()))
            }
            StatusCode::BAD_REQUEST => {
                let body = resp.text()?;
                errinput!("meta service: {body}")
            }
            status => Err(Error::IO(format!("meta service returned {status}"))),
        }
    }
}

/// Extracts the Location header from a redirect response.
fn location(resp: &reqwest::blocking::Response) -> Result<String> {
    resp.headers()
        .get(reqwest::header::LOCATION)
        .and_then(|l| l.to_str().ok())
        .map(String::from)
        .ok_or_else(|| errdata!("redirect without a location"))
}

impl MetaClient for Remote {
    fn node_id(&self) -> NodeId {
        self.inner.node_id.load(Ordering::Relaxed)
    }

    fn cluster_id(&self) -> Result<u64> {
        self.read(|data| data.cluster_id)
    }

    fn ping(&self, all: bool) -> Result<()> {
        let server = {
            let st = self.inner.state.read()?;
            if st.meta_servers.is_empty() {
                return Err(Error::Unavailable("no meta servers".into()));
            }
            st.meta_servers[0].clone()
        };
        let mut url = format!("{}/ping", self.inner.url(&server));
        if all {
            url.push_str("?all=true");
        }
        let resp = self.inner.http.get(url).send()?;
        if resp.status() == StatusCode::OK {
            return Ok(());
        }
        Err(Error::Unavailable(resp.text()?))
    }

    /// Acquires a lease, retrying unavailability with exponential backoff.
    fn acquire_lease(&self, name: &str) -> Result<Lease> {
        let mut result = self.acquire_lease_once(name);
        for n in 1..MAX_RETRIES {
            match &result {
                Err(err) if err.is_retryable() => {
                    self.inner.sleep(Duration::from_millis(10u64.pow(n as u32)))?;
                    result = self.acquire_lease_once(name);
                }
                _ => break,
            }
        }
        result
    }

    fn data_node(&self, id: NodeId) -> Result<NodeInfo> {
        self.read(|data| data.data_nodes.iter().find(|n| n.id == id).cloned())?
            .ok_or_else(|| Error::NotFound(format!("data node {id}")))
    }

    fn data_nodes(&self) -> Result<Vec<NodeInfo>> {
        self.read(|data| data.data_nodes.clone())
    }

    /// Registers this data node, remembering the assigned node ID.
    fn create_data_node(&self, http_addr: &str, tcp_addr: &str) -> Result<NodeInfo> {
        self.retry_until_exec(Command::CreateDataNode {
            http_addr: http_addr.into(),
            tcp_addr: tcp_addr.into(),
        })?;
        let node = self.data_node_by_tcp_host(tcp_addr)?;
        self.inner.node_id.store(node.id, Ordering::Relaxed);
        Ok(node)
    }

    fn data_node_by_http_host(&self, http_addr: &str) -> Result<NodeInfo> {
        self.read(|data| data.data_nodes.iter().find(|n| n.host == http_addr).cloned())?
            .ok_or_else(|| Error::NotFound(format!("data node {http_addr}")))
    }

    fn data_node_by_tcp_host(&self, tcp_addr: &str) -> Result<NodeInfo> {
        self.read(|data| data.data_nodes.iter().find(|n| n.tcp_host == tcp_addr).cloned())?
            .ok_or_else(|| Error::NotFound(format!("data node {tcp_addr}")))
    }

    fn delete_data_node(&self, id: NodeId) -> Result<()> {
        self.retry_until_exec(Command::DeleteDataNode { id })?;
        Ok(())
    }

    fn meta_nodes(&self) -> Result<Vec<NodeInfo>> {
        self.read(|data| data.meta_nodes.clone())
    }

    fn meta_node_by_addr(&self, addr: &str) -> Result<Option<NodeInfo>> {
        self.read(|data| data.meta_nodes.iter().find(|n| n.host == addr).cloned())
    }

    fn create_meta_node(&self, http_addr: &str, tcp_addr: &str) -> Result<NodeInfo> {
        self.retry_until_exec(Command::CreateMetaNode {
            http_addr: http_addr.into(),
            tcp_addr: tcp_addr.into(),
            nonce: rand::random(),
        })?;
        let node = self
            .meta_node_by_addr(http_addr)?
            .ok_or_else(|| Error::NotFound(format!("meta node {http_addr}")))?;
        self.inner.node_id.store(node.id, Ordering::Relaxed);
        Ok(node)
    }

    fn delete_meta_node(&self, id: NodeId) -> Result<()> {
        self.retry_until_exec(Command::DeleteMetaNode { id })?;
        Ok(())
    }

    fn database(&self, name: &str) -> Result<Option<DatabaseInfo>> {
        self.read(|data| data.database(name).cloned())
    }

    fn databases(&self) -> Result<Vec<DatabaseInfo>> {
        self.read(|data| data.databases.clone())
    }

    fn create_database(&self, name: &str) -> Result<DatabaseInfo> {
        if let Some(db) = self.database(name)? {
            return Ok(db);
        }
        self.retry_until_exec(Command::CreateDatabase {
            name: name.into(),
            retention_policy: None,
        })?;
        self.database(name)?.ok_or_else(|| Error::NotFound(format!("database {name}")))
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
        // Idempotent only when the spec matches the existing policy.
        if let Some(db) = self.database(name)? {
            if let Some(rp) = db.retention_policy(&spec.name) {
                if !spec.matches(Some(rp)) {
                    return Err(data::retention_policy_conflict());
                }
                return Ok(db);
            }
        }
        self.retry_until_exec(Command::CreateDatabase {
            name: name.into(),
            retention_policy: Some(spec.new_retention_policy_info()),
        })?;
        self.database(name)?.ok_or_else(|| Error::NotFound(format!("database {name}")))
    }

    fn drop_database(&self, name: &str) -> Result<()> {
        self.retry_until_exec(Command::DropDatabase { name: name.into() })?;
        Ok(())
    }

    fn create_retention_policy(
        &self,
        database: &str,
        spec: &RetentionPolicySpec,
        make_default: bool,
    ) -> Result<RetentionPolicyInfo> {
        if let Some(rp) = self.retention_policy(database, &spec.name)? {
            return Ok(rp);
        }
        if let Some(duration) = spec.duration {
            if duration != Duration::ZERO && duration < MIN_RETENTION_POLICY_DURATION {
                return Err(data::retention_policy_duration_too_low());
            }
        }
        self.retry_until_exec(Command::CreateRetentionPolicy {
            database: database.into(),
            policy: spec.new_retention_policy_info(),
            default: make_default,
        })?;
        self.retention_policy(database, &spec.name)?
            .ok_or_else(|| Error::NotFound(format!("retention policy {}", spec.name)))
    }

    fn retention_policy(
        &self,
        database: &str,
        name: &str,
    ) -> Result<Option<RetentionPolicyInfo>> {
        self.read(|data| {
            data.database(database)
                .ok_or_else(|| Error::NotFound(format!("database {database}")))
                .map(|db| db.retention_policy(name).cloned())
        })?
    }

    fn drop_retention_policy(&self, database: &str, name: &str) -> Result<()> {
        self.retry_until_exec(Command::DropRetentionPolicy {
            database: database.into(),
            name: name.into(),
        })?;
        Ok(())
    }

    fn set_default_retention_policy(&self, database: &str, name: &str) -> Result<()> {
        self.retry_until_exec(Command::SetDefaultRetentionPolicy {
            database: database.into(),
            name: name.into(),
        })?;
        Ok(())
    }

    fn update_retention_policy(
        &self,
        database: &str,
        name: &str,
        update: &RetentionPolicyUpdate,
        make_default: bool,
    ) -> Result<()> {
        self.retry_until_exec(Command::UpdateRetentionPolicy {
            database: database.into(),
            name: name.into(),
            update: update.clone(),
            default: make_default,
        })?;
        Ok(())
    }

    fn users(&self) -> Result<Vec<UserInfo>> {
        self.read(|data| data.users.clone())
    }

    fn user_count(&self) -> Result<usize> {
        self.read(|data| data.users.len())
    }

    fn user(&self, name: &str) -> Result<UserInfo> {
        self.read(|data| data.user(name).cloned())?
            .ok_or_else(|| Error::NotFound(format!("user {name}")))
    }

    fn create_user(&self, name: &str, password: &str, admin: bool) -> Result<UserInfo> {
        // Idempotent when the password and admin flag match.
        if let Some(user) = self.read(|data| data.user(name).cloned())? {
            if !bcrypt::verify(password, &user.hash)? || user.admin != admin {
                return errinput!("user already exists");
            }
            return Ok(user);
        }
        // Hash the password before it is ever sent or stored.
        let hash = bcrypt::hash(password, BCRYPT_COST)?;
        self.retry_until_exec(Command::CreateUser { name: name.into(), hash, admin })?;
        self.user(name)
    }

    fn update_user(&self, name: &str, password: &str) -> Result<()> {
        let hash = bcrypt::hash(password, BCRYPT_COST)?;
        self.retry_until_exec(Command::UpdateUser { name: name.into(), hash })?;
        self.inner.state.write()?.auth.evict(name);
        Ok(())
    }

    fn drop_user(&self, name: &str) -> Result<()> {
        self.retry_until_exec(Command::DropUser { name: name.into() })?;
        self.inner.state.write()?.auth.evict(name);
        Ok(())
    }

    fn set_privilege(&self, username: &str, database: &str, privilege: Privilege) -> Result<()> {
        self.retry_until_exec(Command::SetPrivilege {
            username: username.into(),
            database: database.into(),
            privilege,
        })?;
        Ok(())
    }

    fn set_admin_privilege(&self, username: &str, admin: bool) -> Result<()> {
        self.retry_until_exec(Command::SetAdminPrivilege { username: username.into(), admin })?;
        Ok(())
    }

    fn user_privileges(&self, username: &str) -> Result<BTreeMap<String, Privilege>> {
        self.read(|data| data.user_privileges(username))?
    }

    fn user_privilege(&self, username: &str, database: &str) -> Result<Privilege> {
        self.read(|data| data.user_privilege(username, database))?
    }

    fn admin_user_exists(&self) -> Result<bool> {
        self.read(|data| data.admin_user_exists())
    }

    fn authenticate(&self, username: &str, password: &str) -> Result<UserInfo> {
        // Fast path: the cached salt and hash, under the read lock.
        let user = {
            let st = self.inner.state.read()?;
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
        self.inner.state.write()?.auth.store(username, password, &user.hash);
        Ok(user)
    }

    fn shard_ids(&self) -> Result<Vec<ShardId>> {
        self.read(|data| data.shard_ids())
    }

    fn shard_groups_by_time_range(
        &self,
        database: &str,
        policy: &str,
        min: Timestamp,
        max: Timestamp,
    ) -> Result<Vec<ShardGroupInfo>> {
        self.read(|data| data.shard_groups_by_time_range(database, policy, min, max))?
    }

    fn drop_shard(&self, id: ShardId) -> Result<()> {
        self.retry_until_exec(Command::DropShard { id, at: data::now() })?;
        Ok(())
    }

    /// Truncation is routed through consensus rather than silently
    /// succeeding; every meta node observes the same truncation point.
    fn truncate_shard_groups(&self, at: Timestamp) -> Result<()> {
        self.retry_until_exec(Command::TruncateShardGroups { at })?;
        Ok(())
    }

    /// Pruning likewise goes through consensus. The expiration cutoff is
    /// computed here and carried in the command so replicas stay
    /// deterministic.
    fn prune_shard_groups(&self) -> Result<()> {
        let expiration = data::now() - data::duration_nanos(SHARD_GROUP_DELETED_EXPIRATION);
        self.retry_until_exec(Command::PruneShardGroups { expiration })?;
        Ok(())
    }

    fn create_shard_group(
        &self,
        database: &str,
        policy: &str,
        timestamp: Timestamp,
    ) -> Result<ShardGroupInfo> {
        if let Some(sg) =
            self.read(|data| data.shard_group_by_timestamp(database, policy, timestamp).map(|sg| sg.cloned()))??
        {
            return Ok(sg);
        }
        self.retry_until_exec(Command::CreateShardGroup {
            database: database.into(),
            policy: policy.into(),
            timestamp,
        })?;
        // The cache has caught up with the write; the group must be there.
        self.read(|data| data.shard_group_by_timestamp(database, policy, timestamp).map(|sg| sg.cloned()))??
            .ok_or_else(|| Error::NotFound("shard group was not created".into()))
    }

    fn delete_shard_group(&self, database: &str, policy: &str, id: ShardGroupId) -> Result<()> {
        self.retry_until_exec(Command::DeleteShardGroup {
            database: database.into(),
            policy: policy.into(),
            id,
            at: data::now(),
        })?;
        Ok(())
    }

    /// Considers every database and retention policy, not just the first
    /// database.
    fn precreate_shard_groups(&self, from: Timestamp, to: Timestamp) -> Result<()> {
        let mut candidates = Vec::new();
        self.read(|data| {
            for db in &data.databases {
                for rp in &db.retention_policies {
                    let Some(latest) = rp.latest_shard_group() else { continue };
                    if !latest.deleted() && latest.end_time < to && latest.end_time > from {
                        candidates.push((db.name.clone(), rp.name.clone(), latest.end_time));
                    }
                }
            }
        })?;

        for (db, rp, end_time) in candidates {
            match self.create_shard_group(&db, &rp, end_time + 1) {
                Ok(sg) => info!("Precreated shard group {} for {db}.{rp}", sg.id),
                Err(err) => warn!("Failed to precreate shard group for {db}.{rp}: {err}"),
            }
        }
        Ok(())
    }

    fn shard_owner(&self, shard_id: ShardId) -> Result<Option<(String, String, ShardGroupInfo)>> {
        self.read(|data| data.shard_owner(shard_id))
    }

    fn create_continuous_query(&self, database: &str, name: &str, query: &str) -> Result<()> {
        self.retry_until_exec(Command::CreateContinuousQuery {
            database: database.into(),
            name: name.into(),
            query: query.into(),
        })?;
        Ok(())
    }

    fn drop_continuous_query(&self, database: &str, name: &str) -> Result<()> {
        self.retry_until_exec(Command::DropContinuousQuery {
            database: database.into(),
            name: name.into(),
        })?;
        Ok(())
    }

    fn create_subscription(
        &self,
        database: &str,
        policy: &str,
        name: &str,
        mode: &str,
        destinations: &[String],
    ) -> Result<()> {
        self.retry_until_exec(Command::CreateSubscription {
            database: database.into(),
            retention_policy: policy.into(),
            name: name.into(),
            mode: mode.parse()?,
            destinations: destinations.to_vec(),
        })?;
        Ok(())
    }

    fn drop_subscription(&self, database: &str, policy: &str, name: &str) -> Result<()> {
        self.retry_until_exec(Command::DropSubscription {
            database: database.into(),
            retention_policy: policy.into(),
            name: name.into(),
        })?;
        Ok(())
    }

    fn set_data(&self, data: &Data) -> Result<()> {
        self.retry_until_exec(Command::SetData { data: data.clone() })?;
        Ok(())
    }

    fn data(&self) -> Result<Data> {
        self.read(|data| data.clone())
    }

    fn wait_for_data_changed(&self) -> Result<Receiver<()>> {
        Ok(self.inner.state.read()?.changed.clone())
    }

    /// Closes the client: the poller and any blocked waits exit promptly.
    /// In-flight HTTP requests are not aborted; the connection pool is
    /// dropped with the client.
    fn close(&self) -> Result<()> {
        let mut st = self.inner.state.write()?;
        if st.closed {
            return Ok(());
        }
        st.closed = true;
        st.changed_tx.take();
        self.inner.close_tx.lock()?.take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_scheme_follows_tls() {
        let plain = Remote::new(vec!["host:8091".into()], false).unwrap();
        assert_eq!(plain.inner.url("host:8091"), "http://host:8091");
        let tls = Remote::new(vec!["host:8091".into()], true).unwrap();
        assert_eq!(tls.inner.url("host:8091"), "https://host:8091");
    }

    #[test]
    fn closed_client_aborts_exec() {
        let client = Remote::new(vec!["localhost:1".into()], false).unwrap();
        client.close().unwrap();
        assert_eq!(
            client.retry_until_exec(Command::DropDatabase { name: "db0".into() }),
            Err(Error::Abort)
        );
    }
}

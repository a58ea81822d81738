//! The replicated owner of the metadata document.
//!
//! The store wraps the consensus engine: it implements the FSM callback
//! that applies committed commands to its Data, broadcasts index advances to
//! long-pollers, answers leadership queries (translating the leader's
//! consensus address to its HTTP address through the meta-node table), and
//! manages voter membership. Only the leader accepts writes; followers
//! surface a redirect that the HTTP layer turns into a 307.

use crate::command::{Command, Response};
use crate::data::{
    self, Data, Index, Lease, NodeId, NodeInfo, DEFAULT_LEASE_DURATION,
};
use crate::encoding::Value as _;
use crate::error::{Error, Result};
use crate::{errinput, raft};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

/// How often to re-check for an elected leader during startup.
const LEADER_WAIT_INTERVAL: Duration = Duration::from_millis(100);

/// Shared store internals. The Fsm and every Store clone hold an Arc.
struct Inner {
    http_addr: String,
    raft_addr: String,
    state: RwLock<StoreState>,
    /// Blocks until close() drops the paired sender.
    closing: Receiver<()>,
    close_tx: Mutex<Option<Sender<()>>>,
}

struct StoreState {
    data: Data,
    /// The broadcast receiver for the current document version. Waiters
    /// block on it; install() drops the paired sender, waking all of them.
    changed: Receiver<()>,
    changed_tx: Option<Sender<()>>,
    /// Advisory leases, leader-local and not replicated.
    leases: HashMap<String, Lease>,
    closed: bool,
}

impl StoreState {
    /// Installs a new document version and wakes every waiter by dropping
    /// the previous broadcast sender.
    fn install(&mut self, data: Data) {
        self.data = data;
        let (tx, rx) = channel::unbounded();
        self.changed_tx = Some(tx);
        self.changed = rx;
    }
}

/// The FSM callback handed to the consensus engine. The applier is the sole
/// mutator of the store's document.
struct Fsm(Arc<Inner>);

impl raft::State for Fsm {
    fn apply(&mut self, entry: &[u8]) -> Result<Vec<u8>> {
        // A corrupt entry is a programmer error and halts the applier.
        let command = Command::decode(entry)?;
        let mut st = self.0.state.write()?;
        let mut data = st.data.clone();
        let response = match data.apply(command) {
            Ok(()) => {
                data.index = st.data.index + 1;
                let index = data.index;
                st.install(data);
                Response { index, error: None }
            }
            // The entry is committed but has no effect; the error travels
            // back to the submitter in the response.
            Err(error) => Response { index: st.data.index, error: Some(error) },
        };
        response.encode()
    }

    fn snapshot(&self) -> Result<Vec<u8>> {
        self.0.state.read()?.data.encode()
    }

    fn restore(&mut self, snapshot: &[u8]) -> Result<()> {
        let data = Data::decode(snapshot)?;
        info!("Restoring metadata snapshot at index {}", data.index);
        self.0.state.write()?.install(data);
        Ok(())
    }
}

/// The replicated metadata store. Clones share the same store.
#[derive(Clone)]
pub struct Store {
    inner: Arc<Inner>,
    engine: Arc<dyn raft::Engine>,
}

impl Store {
    /// Opens the store on the given consensus engine: attaches the FSM,
    /// waits for a leader so the log is known to be loaded, and on a
    /// single-peer group binds the current addresses via SetMetaNode. The
    /// latter loops because consensus identity follows the listener
    /// address, which takes a moment to normalize after a hostname change.
    pub fn open(
        engine: impl raft::Engine + 'static,
        http_addr: &str,
        raft_addr: &str,
    ) -> Result<Store> {
        let (close_tx, closing) = channel::unbounded();
        let (changed_tx, changed) = channel::unbounded();
        let inner = Arc::new(Inner {
            http_addr: http_addr.into(),
            raft_addr: raft_addr.into(),
            state: RwLock::new(StoreState {
                data: Data { index: 1, ..Default::default() },
                changed,
                changed_tx: Some(changed_tx),
                leases: HashMap::new(),
                closed: false,
            }),
            closing,
            close_tx: Mutex::new(Some(close_tx)),
        });

        let engine: Arc<dyn raft::Engine> = Arc::new(engine);
        engine.attach(Box::new(Fsm(inner.clone())))?;
        let store = Store { inner, engine };

        info!("Opening meta store at {http_addr}");
        store.wait_for_leader()?;

        if store.engine.peers()?.len() <= 1 {
            loop {
                match store.set_meta_node() {
                    Ok(()) => break,
                    Err(Error::Abort) => return Err(Error::Abort),
                    Err(err) => debug!("Retrying meta node registration: {err}"),
                }
                store.sleep(LEADER_WAIT_INTERVAL)?;
            }
        }

        Ok(store)
    }

    /// Sleeps for the duration, returning Abort if the store closes first.
    fn sleep(&self, duration: Duration) -> Result<()> {
        match self.inner.closing.recv_timeout(duration) {
            Err(RecvTimeoutError::Timeout) => Ok(()),
            _ => Err(Error::Abort),
        }
    }

    /// Blocks until a leader is elected.
    fn wait_for_leader(&self) -> Result<()> {
        while self.engine.leader().is_none() {
            self.sleep(LEADER_WAIT_INTERVAL)?;
        }
        Ok(())
    }

    /// Registers or rebinds this store as the sole meta node.
    fn set_meta_node(&self) -> Result<()> {
        self.exec(Command::SetMetaNode {
            http_addr: self.inner.http_addr.clone(),
            tcp_addr: self.inner.raft_addr.clone(),
            nonce: rand::random(),
        })?;
        Ok(())
    }

    /// Proposes a command through consensus and unwraps the response.
    fn exec(&self, command: Command) -> Result<Index> {
        let response = Response::decode(&self.engine.propose(command.encode()?)?)?;
        match response.error {
            Some(error) => Err(error),
            None => Ok(response.index),
        }
    }

    /// Returns true if this store is currently the leader.
    pub fn is_leader(&self) -> bool {
        self.engine.is_leader()
    }

    /// Returns the consensus address of the leader, if any.
    pub fn leader(&self) -> Option<String> {
        self.engine.leader()
    }

    /// Returns the HTTP address of the leader, translated through the
    /// meta-node table, if both are known.
    pub fn leader_http(&self) -> Result<Option<String>> {
        let Some(leader) = self.engine.leader() else { return Ok(None) };
        let st = self.inner.state.read()?;
        Ok(st.data.meta_nodes.iter().find(|n| n.tcp_host == leader).map(|n| n.host.clone()))
    }

    /// Returns the current document index.
    pub fn index(&self) -> Result<Index> {
        Ok(self.inner.state.read()?.data.index)
    }

    /// Returns a snapshot of the document.
    pub fn data(&self) -> Result<Data> {
        Ok(self.inner.state.read()?.data.clone())
    }

    /// Returns a single-fire readiness handle: a channel whose receive
    /// completes once the document index exceeds the given index. Already
    /// satisfied indexes return a pre-fired channel.
    pub fn after_index(&self, index: Index) -> Result<Receiver<()>> {
        let st = self.inner.state.read()?;
        if st.data.index > index {
            let (tx, rx) = channel::unbounded();
            drop(tx);
            return Ok(rx);
        }
        Ok(st.changed.clone())
    }

    /// Long-polls: blocks until the document index exceeds the given index,
    /// then returns the encoded document. Aborts when the store closes.
    pub fn snapshot_after(&self, index: Index) -> Result<Vec<u8>> {
        loop {
            let changed = {
                let st = self.inner.state.read()?;
                if st.closed {
                    return Err(Error::Abort);
                }
                if st.data.index > index {
                    return st.data.encode();
                }
                st.changed.clone()
            };
            crossbeam::select! {
                recv(changed) -> _ => {},
                recv(self.inner.closing) -> _ => return Err(Error::Abort),
            }
        }
    }

    /// Executes an encoded command envelope: proposes it through consensus
    /// on the leader, or redirects to the leader's HTTP address elsewhere.
    pub fn execute(&self, entry: Vec<u8>) -> Result<Vec<u8>> {
        if !self.engine.is_leader() {
            return match self.leader_http()? {
                Some(host) => Err(Error::Redirect(host)),
                None => Err(Error::Unavailable("no leader".into())),
            };
        }
        self.engine.propose(entry)
    }

    /// Pings the store. With all=true, also requires an elected leader.
    pub fn ping(&self, all: bool) -> Result<()> {
        if all && self.engine.leader().is_none() {
            return Err(Error::Unavailable("no leader".into()));
        }
        Ok(())
    }

    /// Grants, renews, or refuses an advisory lease. Leader-only: leases
    /// are not replicated, so a leader change silently forfeits them and
    /// lease holders must act idempotently.
    pub fn acquire_lease(&self, name: &str, node_id: NodeId) -> Result<Lease> {
        if !self.engine.is_leader() {
            return Err(Error::Unavailable("not the leader".into()));
        }
        let mut st = self.inner.state.write()?;
        let now = data::now();
        let expiration = now + data::duration_nanos(DEFAULT_LEASE_DURATION);
        if let Some(lease) = st.leases.get(name) {
            if lease.expiration > now && lease.owner != node_id {
                return errinput!("another node has the lease");
            }
        }
        let lease = Lease { name: name.into(), owner: node_id, expiration };
        st.leases.insert(name.into(), lease.clone());
        Ok(lease)
    }

    /// Adds a meta node: appends it as a voter, then records it in the
    /// document, returning the node with its assigned ID.
    pub fn add_meta_node(&self, node: &NodeInfo) -> Result<NodeInfo> {
        if !self.engine.is_leader() {
            return match self.leader_http()? {
                Some(host) => Err(Error::Redirect(host)),
                None => Err(Error::Unavailable("no leader".into())),
            };
        }
        self.engine.add_voter(&node.tcp_host)?;
        self.exec(Command::CreateMetaNode {
            http_addr: node.host.clone(),
            tcp_addr: node.tcp_host.clone(),
            nonce: rand::random(),
        })?;

        let st = self.inner.state.read()?;
        st.data
            .meta_nodes
            .iter()
            .find(|n| n.host == node.host && n.tcp_host == node.tcp_host)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("meta node {}", node.host)))
    }

    /// Removes a meta node from the voters and the document. The current
    /// leader cannot be removed.
    pub fn remove_meta_node(&self, node: &NodeInfo) -> Result<()> {
        if self.engine.leader().as_deref() == Some(node.tcp_host.as_str()) {
            return errinput!("cannot remove the leader");
        }
        if let Err(err) = self.engine.remove_voter(&node.tcp_host) {
            warn!("Removing voter {} failed: {err}", node.tcp_host);
            return Err(err);
        }
        self.exec(Command::DeleteMetaNode { id: node.id })?;
        Ok(())
    }

    /// Closes the store, waking all long-pollers and waiters.
    pub fn close(&self) -> Result<()> {
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

//! An in-process consensus engine.
//!
//! Cluster is the shared group; Memory is one member's handle to it.
//! Entries are committed under a single lock in a total order and applied to
//! every attached state machine before propose returns, giving the same
//! observable contract as a real consensus engine in the single-process
//! case: identical apply order on every member, and snapshot install for
//! late joiners. Leadership is held by the first member to attach and is
//! stable thereafter, which is all the metadata plane requires of it.

use super::{Engine, State};
use crate::error::{Error, Result};
use crate::errinput;

use std::sync::{Arc, Mutex};

struct Member {
    addr: String,
    state: Box<dyn State>,
}

#[derive(Default)]
struct Group {
    log: Vec<Vec<u8>>,
    members: Vec<Member>,
    voters: Vec<String>,
    leader: Option<String>,
}

/// A shared in-process consensus group.
#[derive(Clone, Default)]
pub struct Cluster {
    group: Arc<Mutex<Group>>,
}

impl Cluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a member handle bound to the given consensus address.
    pub fn node(&self, addr: &str) -> Memory {
        Memory { group: self.group.clone(), addr: addr.into() }
    }
}

/// One member's handle to an in-process consensus group.
pub struct Memory {
    group: Arc<Mutex<Group>>,
    addr: String,
}

impl Engine for Memory {
    fn attach(&self, mut state: Box<dyn State>) -> Result<()> {
        let mut group = self.group.lock()?;
        if group.members.iter().any(|m| m.addr == self.addr) {
            return errinput!("member {} already attached", self.addr);
        }
        // Late joiners catch up from an existing member's snapshot.
        if let Some(member) = group.members.first() {
            let snapshot = member.state.snapshot()?;
            state.restore(&snapshot)?;
        }
        if group.leader.is_none() {
            group.leader = Some(self.addr.clone());
        }
        if !group.voters.contains(&self.addr) {
            group.voters.push(self.addr.clone());
        }
        group.members.push(Member { addr: self.addr.clone(), state });
        Ok(())
    }

    fn propose(&self, entry: Vec<u8>) -> Result<Vec<u8>> {
        let mut group = self.group.lock()?;
        if group.leader.as_deref() != Some(&self.addr) {
            return Err(Error::Unavailable("not the leader".into()));
        }
        group.log.push(entry.clone());

        // Apply to every member in commit order; the proposer's own
        // response is returned to the caller.
        let mut response = None;
        for member in &mut group.members {
            let r = member.state.apply(&entry)?;
            if member.addr == self.addr {
                response = Some(r);
            }
        }
        response.ok_or_else(|| Error::IO("proposer has no attached state".into()))
    }

    fn is_leader(&self) -> bool {
        self.group.lock().map(|g| g.leader.as_deref() == Some(&self.addr)).unwrap_or(false)
    }

    fn leader(&self) -> Option<String> {
        self.group.lock().ok().and_then(|g| g.leader.clone())
    }

    fn peers(&self) -> Result<Vec<String>> {
        Ok(self.group.lock()?.voters.clone())
    }

    fn add_voter(&self, addr: &str) -> Result<()> {
        let mut group = self.group.lock()?;
        if !group.voters.iter().any(|v| v == addr) {
            group.voters.push(addr.into());
        }
        Ok(())
    }

    fn remove_voter(&self, addr: &str) -> Result<()> {
        let mut group = self.group.lock()?;
        if group.leader.as_deref() == Some(addr) {
            return errinput!("cannot remove the leader");
        }
        group.voters.retain(|v| v != addr);
        Ok(())
    }
}

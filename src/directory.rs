use std::net::SocketAddr;

use anyhow::bail;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;

use crate::config::AutoMode;
use crate::crypto::{PubKey, VerKey};
use crate::estate::{RemoteEstate, Uid};

/// The stack's table of remote estates, indexed by uid and by name
#[derive(Debug)]
pub struct Directory {
    remotes: FxHashMap<Uid, RemoteEstate>,
    names: FxHashMap<String, Uid>,
    last_uid: u32,
}
impl Default for Directory {
    fn default() -> Self {
        Directory::new()
    }
}

impl Directory {
    /// uid 1 is reserved for the local estate, remotes are numbered from 2
    const FIRST_REMOTE_UID: u32 = 2;

    pub fn new() -> Directory {
        Directory {
            remotes: FxHashMap::default(),
            names: FxHashMap::default(),
            last_uid: Self::FIRST_REMOTE_UID - 1,
        }
    }

    pub fn next_uid(&mut self) -> Uid {
        loop {
            self.last_uid = self.last_uid.wrapping_add(1).max(Self::FIRST_REMOTE_UID);
            if !self.remotes.contains_key(&Uid(self.last_uid)) {
                return Uid(self.last_uid);
            }
        }
    }

    pub fn add(&mut self, remote: RemoteEstate) -> anyhow::Result<Uid> {
        let uid = remote.uid;
        if uid.0 < Self::FIRST_REMOTE_UID {
            bail!("uid {:?} is reserved", uid);
        }
        if self.remotes.contains_key(&uid) {
            bail!("duplicate remote uid {:?}", uid);
        }
        if self.names.contains_key(&remote.name) {
            bail!("duplicate remote name {}", remote.name);
        }

        self.names.insert(remote.name.clone(), uid);
        self.remotes.insert(uid, remote);
        Ok(uid)
    }

    pub fn remove(&mut self, uid: Uid) -> Option<RemoteEstate> {
        let removed = self.remotes.remove(&uid)?;
        self.names.remove(&removed.name);
        Some(removed)
    }

    pub fn rename(&mut self, uid: Uid, name: &str) -> anyhow::Result<()> {
        match self.names.get(name) {
            Some(&other) if other == uid => return Ok(()),
            Some(&other) => bail!("name {} is already used by remote {:?}", name, other),
            None => {}
        }
        let Some(remote) = self.remotes.get_mut(&uid) else {
            bail!("no remote {:?}", uid);
        };

        self.names.remove(&remote.name);
        remote.name = name.to_string();
        self.names.insert(remote.name.clone(), uid);
        Ok(())
    }

    pub fn get(&self, uid: Uid) -> Option<&RemoteEstate> {
        self.remotes.get(&uid)
    }

    pub fn get_mut(&mut self, uid: Uid) -> Option<&mut RemoteEstate> {
        self.remotes.get_mut(&uid)
    }

    pub fn uid_by_name(&self, name: &str) -> Option<Uid> {
        self.names.get(name).copied()
    }

    pub fn by_name(&self, name: &str) -> Option<&RemoteEstate> {
        self.uid_by_name(name)
            .and_then(|uid| self.remotes.get(&uid))
    }

    pub fn uid_by_ha(&self, ha: SocketAddr) -> Option<Uid> {
        self.uids().into_iter()
            .find(|uid| self.remotes.get(uid).map(|r| r.ha) == Some(ha))
    }

    /// all uids in ascending order
    pub fn uids(&self) -> Vec<Uid> {
        let mut result = self.remotes.keys().copied().collect::<Vec<_>>();
        result.sort();
        result
    }

    /// the remote with the lowest uid, i.e. the oldest one; the default destination
    pub fn first_uid(&self) -> Option<Uid> {
        self.remotes.keys().min().copied()
    }

    pub fn values(&self) -> impl Iterator<Item = &RemoteEstate> {
        self.remotes.values()
    }

    pub fn len(&self) -> usize {
        self.remotes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.remotes.is_empty()
    }

    pub fn name_count(&self) -> usize {
        self.names.len()
    }
}


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acceptance {
    Pending,
    Accepted,
    Rejected,
}

/// What persistence knows about a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub name: String,
    pub role: String,
    pub ha: SocketAddr,
    pub verkey: VerKey,
    pub pubkey: PubKey,
    pub acceptance: Acceptance,
}

impl PeerRecord {
    /// Decides whether a peer presenting the given keys may join under the given policy, based on
    ///  the previously persisted record for that peer (if any).
    pub fn is_acceptable(auto: AutoMode, known: Option<&PeerRecord>, verkey: &VerKey, pubkey: &PubKey) -> bool {
        let keys_match = |r: &PeerRecord| r.verkey == *verkey && r.pubkey == *pubkey;

        match (auto, known) {
            (_, Some(r)) if r.acceptance == Acceptance::Rejected => false,
            (AutoMode::Always, _) => true,
            (AutoMode::Once, None) => true,
            (AutoMode::Once, Some(r)) => keys_match(r),
            (AutoMode::Never, Some(r)) => r.acceptance == Acceptance::Accepted && keys_match(r),
            (AutoMode::Never, None) => false,
        }
    }
}

/// Persistence boundary for peer identities ('keeping')
#[cfg_attr(test, automock)]
pub trait Keeper: Send {
    fn lookup_known_peer(&self, name: &str) -> Option<PeerRecord>;

    fn persist_peer(&mut self, record: &PeerRecord) -> anyhow::Result<()>;
}

/// In-memory [Keeper]; peers registered with [MemoryKeeper::register] before they join are
///  the 'manually accepted' peers for [AutoMode::Never].
#[derive(Debug, Default)]
pub struct MemoryKeeper {
    records: FxHashMap<String, PeerRecord>,
}
impl MemoryKeeper {
    pub fn new() -> MemoryKeeper {
        Default::default()
    }

    pub fn register(&mut self, record: PeerRecord) {
        self.records.insert(record.name.clone(), record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
impl Keeper for MemoryKeeper {
    fn lookup_known_peer(&self, name: &str) -> Option<PeerRecord> {
        self.records.get(name).cloned()
    }

    fn persist_peer(&mut self, record: &PeerRecord) -> anyhow::Result<()> {
        self.register(record.clone());
        Ok(())
    }
}

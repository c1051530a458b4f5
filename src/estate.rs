use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use rustc_hash::FxHashMap;

use crate::crypto::{PubKey, Session, VerKey};
use crate::packet::TxKind;

/// A stack's numeric id for a remote estate. Each stack assigns its own ids, so the same peer has
///  different uids in different stacks.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uid(pub u32);
impl Debug for Uid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}
impl Uid {
    /// placeholder for 'the other side's id for us is not known yet'
    pub const VACUOUS: Uid = Uid(0);

    pub fn is_vacuous(&self) -> bool {
        *self == Self::VACUOUS
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Tristate {
    #[default]
    Unknown,
    Confirmed,
    Denied,
}
impl Tristate {
    pub fn is_confirmed(&self) -> bool {
        *self == Tristate::Confirmed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Role {
    Initiator,
    Correspondent,
}

#[derive(Debug, Clone)]
pub struct LocalEstate {
    pub name: String,
    pub role: String,
    pub ha: SocketAddr,
    pub main: bool,
    pub verkey: VerKey,
    pub pubkey: PubKey,
}

/// The last completed transaction of a kind and role, with the final packet that completed it
///  (if this side sent it) so it can be repeated when the other side did not receive it.
#[derive(Debug, Clone)]
pub(crate) struct Finished {
    pub index: u32,
    pub reply: Option<Bytes>,
}

pub struct RemoteEstate {
    pub uid: Uid,
    /// the remote's id for this stack, [Uid::VACUOUS] until learned during Join
    pub fuid: Uid,
    pub name: String,
    pub role: String,
    pub ha: SocketAddr,
    pub verkey: Option<VerKey>,
    pub pubkey: Option<PubKey>,

    pub joined: Tristate,
    pub allowed: Tristate,
    pub alived: Tristate,

    /// time of the last successful liveness proof
    pub last_alive: Option<Duration>,
    pub(crate) last_probe: Option<Duration>,

    next_tx_index: u32,
    finished: FxHashMap<(TxKind, Role), Finished>,
    session: Option<Session>,
}
impl Debug for RemoteEstate {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "REMOTE{{{:?}/{:?}:{}@{} J{:?} A{:?} L{:?}}}", self.uid, self.fuid, self.name, self.ha, self.joined, self.allowed, self.alived)
    }
}

impl RemoteEstate {
    pub fn new(uid: Uid, name: &str, ha: SocketAddr) -> RemoteEstate {
        RemoteEstate {
            uid,
            fuid: Uid::VACUOUS,
            name: name.to_string(),
            role: name.to_string(),
            ha,
            verkey: None,
            pubkey: None,
            joined: Tristate::Unknown,
            allowed: Tristate::Unknown,
            alived: Tristate::Unknown,
            last_alive: None,
            last_probe: None,
            next_tx_index: 0,
            finished: FxHashMap::default(),
            session: None,
        }
    }

    /// a remote this stack never completed a Join with, known only by its address
    pub fn is_vacuous(&self) -> bool {
        self.fuid.is_vacuous()
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub(crate) fn next_tx_index(&mut self) -> u32 {
        self.next_tx_index = self.next_tx_index.wrapping_add(1);
        if self.next_tx_index == 0 {
            self.next_tx_index = 1;
        }
        self.next_tx_index
    }

    pub(crate) fn install_session(&mut self, session: Session) {
        self.session = Some(session);
    }

    pub(crate) fn clear_session(&mut self) {
        self.session = None;
    }

    pub(crate) fn finished(&self, kind: TxKind, role: Role) -> Option<&Finished> {
        self.finished.get(&(kind, role))
    }

    pub(crate) fn record_finished(&mut self, kind: TxKind, role: Role, index: u32, reply: Option<Bytes>) {
        self.finished.insert((kind, role), Finished { index, reply });
    }

    /// A completed Join starts a new relationship: previously established sessions and
    ///  transaction history no longer apply.
    pub(crate) fn reset_for_join(&mut self) {
        self.joined = Tristate::Confirmed;
        self.allowed = Tristate::Unknown;
        self.alived = Tristate::Unknown;
        self.session = None;
        self.finished.clear();
    }

    /// Allow completion proves the remote is alive, so it implies `alived`
    pub(crate) fn confirm_allowed(&mut self, session: Session, now: Duration) {
        self.install_session(session);
        self.allowed = Tristate::Confirmed;
        self.alived = Tristate::Confirmed;
        self.last_alive = Some(now);
    }
}

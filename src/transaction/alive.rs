//! Alive: a session-encrypted probe and its encrypted acknowledgement. Only a peer holding the
//!  session keys can answer, so a successful probe proves both reachability and the session.

use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use crate::config::RetryPolicy;
use crate::estate::{Role, Tristate, Uid};
use crate::packet::{Packet, PacketKind, TxKind};
use crate::stack::{RoadStack, StackEvent};
use crate::transaction::{RedoAction, Redo, Transaction, TxKey, TxStatus};

pub(crate) struct Aliver {
    key: TxKey,
    cascade: bool,
    policy: RetryPolicy,
    redo: Redo,
    request: Bytes,
}

impl Aliver {
    pub fn start(stack: &mut RoadStack, uid: Uid, cascade: bool) -> anyhow::Result<Aliver> {
        let remote = stack.remote(uid)
            .ok_or_else(|| anyhow::anyhow!("no remote {:?}", uid))?;
        let session = match remote.session() {
            Some(session) if remote.allowed.is_confirmed() => session,
            _ => anyhow::bail!("cannot alive {}: not allowed", remote.name),
        };
        let body = Bytes::from(session.tx.encrypt(&[])?);

        let now = stack.now();
        let remote = stack.directory_mut().get_mut(uid)
            .ok_or_else(|| anyhow::anyhow!("no remote {:?}", uid))?;
        remote.last_probe = Some(now);
        let key = TxKey { uid, kind: TxKind::Alive, index: remote.next_tx_index(), role: Role::Initiator };

        let request = stack.send(&key, PacketKind::Request, body)
            .ok_or_else(|| anyhow::anyhow!("no remote {:?}", uid))?;

        let policy = stack.config().alive_policy.clone();
        Ok(Aliver {
            key,
            cascade,
            redo: Redo::new(now, &policy),
            policy,
            request,
        })
    }

    fn on_ack(&mut self, stack: &mut RoadStack, packet: Packet) -> TxStatus {
        let uid = self.key.uid;
        let verified = stack.remote(uid)
            .and_then(|r| r.session())
            .map(|s| s.rx.decrypt(&packet.body));
        match verified {
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!("{:?}: dropping undecryptable ack: {}", self.key, e);
                return TxStatus::Pending;
            }
            None => {
                debug!("{:?}: session went away - ignoring ack", self.key);
                return TxStatus::Done;
            }
        }

        let now = stack.now();
        if let Some(remote) = stack.directory_mut().get_mut(uid) {
            remote.alived = Tristate::Confirmed;
            remote.last_alive = Some(now);
        }
        debug!("{:?}: alive", self.key);
        stack.emit(StackEvent::Alived { uid, cascade: self.cascade });
        TxStatus::Done
    }
}

impl Transaction for Aliver {
    fn key(&self) -> TxKey {
        self.key
    }

    fn receive(&mut self, stack: &mut RoadStack, packet: Packet) -> TxStatus {
        match packet.header.packet_kind {
            PacketKind::Ack => self.on_ack(stack, packet),
            PacketKind::Unallowed => {
                info!("{:?}: correspondent has no session with us", self.key);
                if let Some(remote) = stack.directory_mut().get_mut(self.key.uid) {
                    remote.allowed = Tristate::Unknown;
                    remote.alived = Tristate::Denied;
                    remote.clear_session();
                }
                stack.emit(StackEvent::Unresponsive { uid: self.key.uid });
                TxStatus::Done
            }
            _ => {
                debug!("{:?}: unexpected {:?} - ignoring", self.key, packet.header);
                TxStatus::Pending
            }
        }
    }

    fn process(&mut self, stack: &mut RoadStack) -> TxStatus {
        match self.redo.poll(stack.now(), &self.policy) {
            RedoAction::Wait => TxStatus::Pending,
            RedoAction::Redo => {
                debug!("{:?}: re-sending probe", self.key);
                stack.resend(self.key.uid, self.request.clone());
                TxStatus::Pending
            }
            RedoAction::GiveUp => {
                info!("{:?}: remote is unresponsive", self.key);
                if let Some(remote) = stack.directory_mut().get_mut(self.key.uid) {
                    remote.alived = Tristate::Denied;
                }
                stack.emit(StackEvent::Unresponsive { uid: self.key.uid });
                TxStatus::Done
            }
        }
    }
}

/// Answers an Alive request right away; the correspondent side keeps no transaction state.
pub(crate) fn answer_alive(stack: &mut RoadStack, key: TxKey, packet: &Packet) {
    let Some(remote) = stack.remote(key.uid) else {
        return;
    };
    let Some(session) = remote.session().filter(|_| remote.allowed.is_confirmed()) else {
        info!("{:?}: alive request from {}, which is not allowed", key, remote.name);
        stack.send(&key, PacketKind::Unallowed, Bytes::new());
        return;
    };

    if let Err(e) = session.rx.decrypt(&packet.body) {
        warn!("{:?}: dropping undecryptable alive request: {}", key, e);
        return;
    }
    let reply = match session.tx.encrypt(&[]) {
        Ok(reply) => Bytes::from(reply),
        Err(e) => {
            warn!("{:?}: encrypting alive ack failed: {}", key, e);
            return;
        }
    };

    let now = stack.now();
    if let Some(remote) = stack.directory_mut().get_mut(key.uid) {
        remote.alived = Tristate::Confirmed;
        remote.last_alive = Some(now);
    }
    trace!("{:?}: answering alive request", key);
    stack.send(&key, PacketKind::Ack, reply);
}

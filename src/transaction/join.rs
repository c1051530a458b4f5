//! Join: the two sides exchange self-signed identities (name, role and long-term keys). The
//!  initiator ('joiner') sends a Request, the correspondent ('joinent') answers with a Response
//!  carrying its own identity, and the joiner confirms with an Ack.

use std::net::SocketAddr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{debug, info, warn};

use crate::config::RetryPolicy;
use crate::crypto::{Crypto, PubKey, VerKey};
use crate::directory::PeerRecord;
use crate::estate::{LocalEstate, RemoteEstate, Role, Tristate, Uid};
use crate::packet::{Packet, PacketFlags, PacketHeader, PacketKind, TxKind};
use crate::stack::{RoadStack, StackEvent};
use crate::transaction::{sign_body, split_signed, verify_signed, RedoAction, Redo, Transaction, TxKey, TxStatus};
use crate::util::buf::{put_string, try_get_array, try_get_string};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct JoinIdentity {
    pub name: String,
    pub role: String,
    pub verkey: VerKey,
    pub pubkey: PubKey,
}
impl JoinIdentity {
    pub fn of_local(local: &LocalEstate) -> JoinIdentity {
        JoinIdentity {
            name: local.name.clone(),
            role: local.role.clone(),
            verkey: local.verkey,
            pubkey: local.pubkey,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        put_string(buf, &self.name);
        put_string(buf, &self.role);
        buf.put_slice(&self.verkey.0);
        buf.put_slice(&self.pubkey.0);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<JoinIdentity> {
        let name = try_get_string(buf)?;
        let role = try_get_string(buf)?;
        let verkey = VerKey(try_get_array(buf)?);
        let pubkey = PubKey(try_get_array(buf)?);
        Ok(JoinIdentity { name, role, verkey, pubkey })
    }

    /// The identity in a Request or Response body. The body is signed with the key it contains,
    ///  proving possession of the signing key.
    pub fn from_signed(crypto: &dyn Crypto, packet: &Packet) -> anyhow::Result<JoinIdentity> {
        let (mut payload, _) = split_signed(&packet.body)?;
        let identity = JoinIdentity::deser(&mut payload)?;
        if identity.name.is_empty() {
            anyhow::bail!("empty name");
        }
        verify_signed(crypto, &identity.verkey, &packet.header, &packet.body)?;
        Ok(identity)
    }

    fn signed_body(stack: &RoadStack, key: &TxKey, packet_kind: PacketKind) -> Bytes {
        let mut payload = BytesMut::new();
        JoinIdentity::of_local(stack.local()).ser(&mut payload);
        sign_body(stack.crypto().as_ref(), key, packet_kind, &payload)
    }

    fn is_acceptable(&self, stack: &RoadStack) -> bool {
        let known = stack.keeper().lookup_known_peer(&self.name);
        PeerRecord::is_acceptable(stack.config().auto, known.as_ref(), &self.verkey, &self.pubkey)
    }

    fn apply(&self, remote: &mut RemoteEstate) {
        remote.role = self.role.clone();
        remote.verkey = Some(self.verkey);
        remote.pubkey = Some(self.pubkey);
    }
}

pub(crate) struct Joiner {
    key: TxKey,
    cascade: bool,
    policy: RetryPolicy,
    redo: Redo,
    request: Bytes,
}

impl Joiner {
    pub fn start(stack: &mut RoadStack, uid: Uid, cascade: bool) -> anyhow::Result<Joiner> {
        let policy = stack.config().join_policy.clone();
        let remote = stack.directory_mut().get_mut(uid)
            .ok_or_else(|| anyhow::anyhow!("no remote {:?}", uid))?;
        let key = TxKey { uid, kind: TxKind::Join, index: remote.next_tx_index(), role: Role::Initiator };

        let body = JoinIdentity::signed_body(stack, &key, PacketKind::Request);
        let request = stack.send(&key, PacketKind::Request, body)
            .ok_or_else(|| anyhow::anyhow!("no remote {:?}", uid))?;

        Ok(Joiner {
            key,
            cascade,
            redo: Redo::new(stack.now(), &policy),
            policy,
            request,
        })
    }

    fn on_response(&mut self, stack: &mut RoadStack, packet: Packet) -> TxStatus {
        let crypto = stack.crypto();
        let identity = match JoinIdentity::from_signed(crypto.as_ref(), &packet) {
            Ok(identity) => identity,
            Err(e) => {
                warn!("{:?}: dropping invalid join response: {}", self.key, e);
                return TxStatus::Pending;
            }
        };
        let uid = self.key.uid;

        if !identity.is_acceptable(stack) {
            info!("{:?}: rejecting identity of {}", self.key, identity.name);
            let body = sign_body(crypto.as_ref(), &self.key, PacketKind::Reject, &[]);
            stack.send(&self.key, PacketKind::Reject, body);
            self.deny(stack);
            return TxStatus::Done;
        }

        if let Err(e) = stack.directory_mut().rename(uid, &identity.name) {
            warn!("{:?}: joined peer's name is not usable: {}", self.key, e);
            self.deny(stack);
            return TxStatus::Done;
        }
        if let Some(remote) = stack.directory_mut().get_mut(uid) {
            remote.fuid = packet.header.se;
            identity.apply(remote);
            remote.reset_for_join();
        }

        let body = sign_body(crypto.as_ref(), &self.key, PacketKind::Ack, &[]);
        let ack = stack.send(&self.key, PacketKind::Ack, body);
        if let Some(remote) = stack.directory_mut().get_mut(uid) {
            remote.record_finished(TxKind::Join, Role::Initiator, self.key.index, ack);
        }
        stack.persist_remote(uid);
        info!("{:?}: joined {}", self.key, identity.name);
        stack.emit(StackEvent::Joined { uid, name: identity.name });

        if self.cascade {
            if let Err(e) = stack.allow(Some(uid), true) {
                warn!("{:?}: cascading allow failed: {}", self.key, e);
            }
        }
        TxStatus::Done
    }

    fn deny(&self, stack: &mut RoadStack) {
        if let Some(remote) = stack.directory_mut().get_mut(self.key.uid) {
            remote.joined = Tristate::Denied;
            let name = remote.name.clone();
            stack.emit(StackEvent::JoinRejected { name });
        }
    }
}

impl Transaction for Joiner {
    fn key(&self) -> TxKey {
        self.key
    }

    fn receive(&mut self, stack: &mut RoadStack, packet: Packet) -> TxStatus {
        match packet.header.packet_kind {
            PacketKind::Response => self.on_response(stack, packet),
            PacketKind::Refuse => {
                let vacuous = stack.remote(self.key.uid)
                    .map(|r| r.is_vacuous())
                    .unwrap_or(false);
                if vacuous {
                    if let Some(remote) = stack.remove_remote(self.key.uid) {
                        info!("{:?}: join refused by {}, removed vacuous remote", self.key, remote.ha);
                        stack.emit(StackEvent::JoinRefused { name: remote.name });
                    }
                }
                TxStatus::Done
            }
            PacketKind::Reject => {
                info!("{:?}: join rejected", self.key);
                self.deny(stack);
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
                debug!("{:?}: re-sending request", self.key);
                stack.resend(self.key.uid, self.request.clone());
                TxStatus::Pending
            }
            RedoAction::GiveUp => {
                info!("{:?}: join timed out", self.key);
                TxStatus::Done
            }
        }
    }
}

pub(crate) struct Joinent {
    key: TxKey,
    identity: JoinIdentity,
    /// the remote was created for this join, and goes away if the join fails
    created: bool,
    policy: RetryPolicy,
    redo: Redo,
    response: Bytes,
}

impl Joinent {
    /// Handles a join request without a matching transaction, answering it with a Response if
    ///  the joining peer is acceptable
    pub fn correspond(stack: &mut RoadStack, addr: SocketAddr, packet: Packet) {
        let crypto = stack.crypto();
        let identity = match JoinIdentity::from_signed(crypto.as_ref(), &packet) {
            Ok(identity) => identity,
            Err(e) => {
                warn!("dropping invalid join request from {}: {}", addr, e);
                return;
            }
        };
        let header = packet.header;

        let existing = if header.de.is_vacuous() {
            stack.remotes().uid_by_name(&identity.name)
                .or_else(|| stack.remotes().uid_by_ha(addr).filter(|&uid| stack.remote(uid).map(|r| r.is_vacuous()).unwrap_or(false)))
        }
        else {
            match stack.remote(header.de) {
                Some(remote) => Some(remote.uid),
                None => {
                    debug!("dropping join request from {} for unknown remote {:?}", addr, header.de);
                    return;
                }
            }
        };

        if let Some(uid) = existing {
            let key = TxKey { uid, kind: TxKind::Join, index: header.tx_index, role: Role::Correspondent };
            if stack.has_transaction(&key) {
                stack.forward(key, packet);
                return;
            }
            let finished = stack.remote(uid)
                .and_then(|r| r.finished(TxKind::Join, Role::Correspondent))
                .map(|f| f.index);
            if finished == Some(header.tx_index) {
                debug!("{:?}: dropping stale join request", key);
                return;
            }

            if let Some(own) = stack.live_key(uid, TxKind::Join, Some(Role::Initiator)) {
                if stack.local().name < identity.name {
                    debug!("{:?}: crossing join request from {} - keeping own join", own, identity.name);
                    return;
                }
                debug!("{:?}: crossing join request from {} - yielding", own, identity.name);
                stack.abandon(own);
            }
            if let Some(previous) = stack.live_key(uid, TxKind::Join, Some(Role::Correspondent)) {
                stack.abandon(previous);
            }
        }
        else if !stack.local().main {
            info!("refusing vacuous join from {} at {}: not a main stack", identity.name, addr);
            let refuse = PacketHeader::new(TxKind::Join, PacketKind::Refuse, Uid::VACUOUS, header.se, header.tx_index)
                .with_flags(PacketFlags::CORRESPONDENT);
            stack.send_raw(addr, Packet::new(refuse, Bytes::new()));
            return;
        }

        if !identity.is_acceptable(stack) {
            info!("rejecting join from {} at {}", identity.name, addr);
            let se = existing.unwrap_or(Uid::VACUOUS);
            let reject = PacketHeader::new(TxKind::Join, PacketKind::Reject, se, header.se, header.tx_index)
                .with_flags(PacketFlags::CORRESPONDENT);
            stack.send_raw(addr, Packet::new(reject, Bytes::new()));
            if let Some(uid) = existing {
                if let Some(remote) = stack.directory_mut().get_mut(uid) {
                    remote.joined = Tristate::Denied;
                }
            }
            stack.emit(StackEvent::JoinRejected { name: identity.name });
            return;
        }

        let (uid, created) = match existing {
            Some(uid) => (uid, false),
            None => {
                let uid = stack.directory_mut().next_uid();
                let mut remote = RemoteEstate::new(uid, &identity.name, addr);
                identity.apply(&mut remote);
                if let Err(e) = stack.directory_mut().add(remote) {
                    warn!("cannot add remote for join from {}: {}", identity.name, e);
                    return;
                }
                (uid, true)
            }
        };
        if let Some(remote) = stack.directory_mut().get_mut(uid) {
            remote.fuid = header.se;
            remote.ha = addr;
        }

        let key = TxKey { uid, kind: TxKind::Join, index: header.tx_index, role: Role::Correspondent };
        let body = JoinIdentity::signed_body(stack, &key, PacketKind::Response);
        let Some(response) = stack.send(&key, PacketKind::Response, body) else {
            return;
        };

        let policy = stack.config().join_policy.clone();
        let joinent = Joinent {
            key,
            identity,
            created,
            redo: Redo::new(stack.now(), &policy),
            policy,
            response,
        };
        stack.insert_transaction(Box::new(joinent));
    }

    fn on_ack(&mut self, stack: &mut RoadStack, packet: Packet) -> TxStatus {
        let crypto = stack.crypto();
        if let Err(e) = verify_signed(crypto.as_ref(), &self.identity.verkey, &packet.header, &packet.body) {
            warn!("{:?}: dropping invalid join ack: {}", self.key, e);
            return TxStatus::Pending;
        }

        let uid = self.key.uid;
        if let Err(e) = stack.directory_mut().rename(uid, &self.identity.name) {
            warn!("{:?}: joined peer's name is not usable: {}", self.key, e);
            return TxStatus::Done;
        }
        let Some(remote) = stack.directory_mut().get_mut(uid) else {
            return TxStatus::Done;
        };
        self.identity.apply(remote);
        remote.reset_for_join();
        remote.record_finished(TxKind::Join, Role::Correspondent, self.key.index, None);

        stack.persist_remote(uid);
        info!("{:?}: joined {}", self.key, self.identity.name);
        stack.emit(StackEvent::Joined { uid, name: self.identity.name.clone() });
        TxStatus::Done
    }

    fn discard(&self, stack: &mut RoadStack) {
        let joined = stack.remote(self.key.uid)
            .map(|r| r.joined.is_confirmed())
            .unwrap_or(true);
        if self.created && !joined {
            stack.remove_remote(self.key.uid);
        }
    }
}

impl Transaction for Joinent {
    fn key(&self) -> TxKey {
        self.key
    }

    fn receive(&mut self, stack: &mut RoadStack, packet: Packet) -> TxStatus {
        match packet.header.packet_kind {
            PacketKind::Request => {
                debug!("{:?}: duplicate request - re-sending response", self.key);
                stack.resend(self.key.uid, self.response.clone());
                TxStatus::Pending
            }
            PacketKind::Ack => self.on_ack(stack, packet),
            PacketKind::Reject => {
                info!("{:?}: {} rejected our identity", self.key, self.identity.name);
                if let Some(remote) = stack.directory_mut().get_mut(self.key.uid) {
                    remote.joined = Tristate::Denied;
                }
                self.discard(stack);
                stack.emit(StackEvent::JoinRejected { name: self.identity.name.clone() });
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
                debug!("{:?}: re-sending response", self.key);
                stack.resend(self.key.uid, self.response.clone());
                TxStatus::Pending
            }
            RedoAction::GiveUp => {
                info!("{:?}: join timed out waiting for ack", self.key);
                self.discard(stack);
                TxStatus::Done
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use crate::config::AutoMode;
    use crate::crypto::DalekCrypto;
    use crate::directory::{Acceptance, MemoryKeeper, MockKeeper};
    use crate::test_util::{drop_mask, TestNet};
    use rstest::rstest;

    fn identity(crypto: &DalekCrypto) -> JoinIdentity {
        JoinIdentity {
            name: "beta".to_string(),
            role: "worker".to_string(),
            verkey: crypto.verkey(),
            pubkey: crypto.pubkey(),
        }
    }

    fn signed_request(crypto: &DalekCrypto, identity: &JoinIdentity) -> Packet {
        let key = TxKey { uid: Uid(2), kind: TxKind::Join, index: 1, role: Role::Initiator };
        let mut payload = BytesMut::new();
        identity.ser(&mut payload);
        let body = sign_body(crypto, &key, PacketKind::Request, &payload);
        Packet::new(PacketHeader::new(TxKind::Join, PacketKind::Request, Uid(2), Uid::VACUOUS, 1), body)
    }

    #[test]
    fn test_identity_ser() {
        let crypto = DalekCrypto::generate();
        let identity = identity(&crypto);
        let mut buf = BytesMut::new();
        identity.ser(&mut buf);

        let mut b: &[u8] = &buf;
        assert_eq!(JoinIdentity::deser(&mut b).unwrap(), identity);
        assert!(b.is_empty());
    }

    #[test]
    fn test_identity_from_signed() {
        let crypto = DalekCrypto::generate();
        let identity = identity(&crypto);
        let packet = signed_request(&crypto, &identity);
        assert_eq!(JoinIdentity::from_signed(&crypto, &packet).unwrap(), identity);
    }

    #[test]
    fn test_identity_from_signed_with_foreign_key() {
        let crypto = DalekCrypto::generate();
        let impostor = DalekCrypto::generate();
        let packet = signed_request(&impostor, &identity(&crypto));
        assert!(JoinIdentity::from_signed(&crypto, &packet).is_err());
    }

    #[test]
    fn test_identity_truncated() {
        let crypto = DalekCrypto::generate();
        let packet = signed_request(&crypto, &identity(&crypto));
        let truncated = Packet::new(packet.header, packet.body.slice(10..));
        assert!(JoinIdentity::from_signed(&crypto, &truncated).is_err());
    }

    fn assert_joined(stack: &RoadStack, remote_name: &str) {
        assert_eq!(stack.remotes().len(), 1);
        assert_eq!(stack.remotes().name_count(), 1);
        let remote = stack.remote_by_name(remote_name).unwrap();
        assert_eq!(remote.joined, Tristate::Confirmed);
        assert!(!remote.is_vacuous());
        assert!(remote.verkey.is_some());
        assert_eq!(stack.transaction_count(), 0);
    }

    #[rstest]
    #[case::plain(false, false)]
    #[case::duplicates(true, false)]
    #[case::lost_packets(false, true)]
    fn test_join_vacuous_to_main(#[case] duplicates: bool, #[case] lossy_start: bool) {
        let net = TestNet::new();
        let mut alpha = net.stack("alpha", true, AutoMode::Once);
        let mut beta = net.stack("beta", false, AutoMode::Once);

        let uid = beta.add_remote(None, alpha.local().ha).unwrap();
        beta.join(Some(uid), false).unwrap();
        if lossy_start {
            net.service_stacks_with_drops(&mut [&mut beta, &mut alpha], &drop_mask(&[1]), Duration::from_millis(1500));
            assert_eq!(beta.remote(uid).unwrap().joined, Tristate::Unknown);
        }
        if duplicates {
            net.service_stacks_with_duplicates(&mut [&mut beta, &mut alpha], Duration::from_secs(5));
        }
        else {
            net.service_stacks(&mut [&mut beta, &mut alpha], Duration::from_secs(10));
        }

        assert_joined(&alpha, "beta");
        assert_joined(&beta, "alpha");
        assert_eq!(beta.remote(uid).unwrap().name, "alpha");
        assert!(beta.take_events().contains(&StackEvent::Joined { uid, name: "alpha".to_string() }));
        assert!(alpha.keeper().lookup_known_peer("beta").is_some());
        assert!(beta.keeper().lookup_known_peer("alpha").is_some());
    }

    #[test]
    fn test_vacuous_join_to_non_main_is_refused() {
        let net = TestNet::new();
        let mut alpha = net.stack("alpha", false, AutoMode::Once);
        let mut beta = net.stack("beta", false, AutoMode::Once);

        let uid = beta.add_remote(None, alpha.local().ha).unwrap();
        beta.join(Some(uid), false).unwrap();
        net.service_stacks(&mut [&mut beta, &mut alpha], Duration::from_secs(2));

        assert!(alpha.remotes().is_empty());
        assert!(beta.remotes().is_empty());
        assert_eq!(alpha.transaction_count(), 0);
        assert_eq!(beta.transaction_count(), 0);
        assert!(matches!(beta.take_events().as_slice(), [StackEvent::JoinRefused { .. }]));
    }

    #[test]
    fn test_join_to_non_main_that_knows_the_joiner() {
        let net = TestNet::new();
        let mut alpha = net.stack("alpha", false, AutoMode::Once);
        let mut beta = net.stack("beta", false, AutoMode::Once);

        alpha.add_remote(Some("beta"), beta.local().ha).unwrap();
        let uid = beta.add_remote(None, alpha.local().ha).unwrap();
        beta.join(Some(uid), false).unwrap();
        net.service_stacks(&mut [&mut beta, &mut alpha], Duration::from_secs(2));

        assert_joined(&alpha, "beta");
        assert_joined(&beta, "alpha");
    }

    #[test]
    fn test_crossing_joins() {
        let net = TestNet::new();
        let mut alpha = net.stack("alpha", true, AutoMode::Once);
        let mut beta = net.stack("beta", true, AutoMode::Once);

        alpha.add_remote(None, beta.local().ha).unwrap();
        beta.add_remote(None, alpha.local().ha).unwrap();
        alpha.join(None, false).unwrap();
        beta.join(None, false).unwrap();
        net.service_stacks(&mut [&mut alpha, &mut beta], Duration::from_secs(5));

        assert_joined(&alpha, "beta");
        assert_joined(&beta, "alpha");
    }

    #[test]
    fn test_rejoin_keeps_single_remote() {
        let net = TestNet::new();
        let mut alpha = net.stack("alpha", true, AutoMode::Once);
        let mut beta = net.stack("beta", false, AutoMode::Once);

        let uid = beta.add_remote(None, alpha.local().ha).unwrap();
        beta.join(Some(uid), false).unwrap();
        net.service_stacks(&mut [&mut beta, &mut alpha], Duration::from_secs(2));
        beta.join(Some(uid), false).unwrap();
        net.service_stacks(&mut [&mut beta, &mut alpha], Duration::from_secs(2));

        assert_joined(&alpha, "beta");
        assert_joined(&beta, "alpha");
    }

    #[rstest]
    #[case::unregistered(false, true)]
    #[case::registered(true, false)]
    fn test_auto_never(#[case] register: bool, #[case] expect_rejected: bool) {
        let net = TestNet::new();
        let beta_crypto = Arc::new(DalekCrypto::from_seeds([1; 32], [2; 32]));

        let mut keeper = MemoryKeeper::new();
        if register {
            keeper.register(PeerRecord {
                name: "beta".to_string(),
                role: "beta".to_string(),
                ha: SocketAddr::from(([127, 0, 0, 1], 7531)),
                verkey: beta_crypto.verkey(),
                pubkey: beta_crypto.pubkey(),
                acceptance: Acceptance::Accepted,
            });
        }
        let mut alpha = net.stack_with_parts(TestNet::config("alpha", true, AutoMode::Never), Arc::new(DalekCrypto::generate()), Box::new(keeper));
        let mut beta = net.stack_with_parts(TestNet::config("beta", false, AutoMode::Once), beta_crypto, Box::new(MemoryKeeper::new()));

        let uid = beta.add_remote(None, alpha.local().ha).unwrap();
        beta.join(Some(uid), false).unwrap();
        net.service_stacks(&mut [&mut beta, &mut alpha], Duration::from_secs(2));

        if expect_rejected {
            assert!(alpha.remotes().is_empty());
            assert_eq!(beta.remote(uid).unwrap().joined, Tristate::Denied);
            assert!(alpha.take_events().contains(&StackEvent::JoinRejected { name: "beta".to_string() }));
        }
        else {
            assert_joined(&alpha, "beta");
            assert_joined(&beta, "alpha");
        }
        assert_eq!(alpha.transaction_count(), 0);
        assert_eq!(beta.transaction_count(), 0);
    }

    #[test]
    fn test_changed_keys_are_rejected_with_auto_once() {
        let net = TestNet::new();
        let mut keeper = MemoryKeeper::new();
        keeper.register(PeerRecord {
            name: "beta".to_string(),
            role: "beta".to_string(),
            ha: SocketAddr::from(([127, 0, 0, 1], 7531)),
            verkey: VerKey([9; 32]),
            pubkey: PubKey([9; 32]),
            acceptance: Acceptance::Accepted,
        });
        let mut alpha = net.stack_with_parts(TestNet::config("alpha", true, AutoMode::Once), Arc::new(DalekCrypto::generate()), Box::new(keeper));
        let mut beta = net.stack("beta", false, AutoMode::Once);

        let uid = beta.add_remote(None, alpha.local().ha).unwrap();
        beta.join(Some(uid), false).unwrap();
        net.service_stacks(&mut [&mut beta, &mut alpha], Duration::from_secs(2));

        assert!(alpha.remotes().is_empty());
        assert_eq!(beta.remote(uid).unwrap().joined, Tristate::Denied);
    }

    #[test]
    fn test_keeper_failure_does_not_fail_join() {
        let net = TestNet::new();
        let mut keeper = MockKeeper::new();
        keeper.expect_lookup_known_peer()
            .returning(|_| None);
        keeper.expect_persist_peer()
            .times(1)
            .returning(|_| Err(anyhow::anyhow!("disk full")));

        let mut alpha = net.stack_with_parts(TestNet::config("alpha", true, AutoMode::Once), Arc::new(DalekCrypto::generate()), Box::new(keeper));
        let mut beta = net.stack("beta", false, AutoMode::Once);

        let uid = beta.add_remote(None, alpha.local().ha).unwrap();
        beta.join(Some(uid), false).unwrap();
        net.service_stacks(&mut [&mut beta, &mut alpha], Duration::from_secs(2));

        assert_joined(&alpha, "beta");
        assert_joined(&beta, "alpha");
    }

    #[test]
    fn test_join_timeout_keeps_remote() {
        let net = TestNet::new();
        let mut beta = net.stack("beta", false, AutoMode::Once);

        let uid = beta.add_remote(None, SocketAddr::from(([127, 0, 0, 1], 9999))).unwrap();
        beta.join(Some(uid), false).unwrap();
        net.service_stacks(&mut [&mut beta], Duration::from_secs(60));

        assert_eq!(beta.transaction_count(), 0);
        assert_eq!(beta.remote(uid).unwrap().joined, Tristate::Unknown);
    }
}

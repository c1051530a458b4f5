//! Allow: a signed handshake between joined peers that establishes a session. Each side
//!  contributes an ephemeral key pair and a challenge nonce sealed to the other side's long-term
//!  public key; the session keys are derived from the ephemeral key agreement and both nonces.
//!
//! ```ascii
//!  initiator                                   correspondent
//!     | -- Hello(eph_a, seal(nonce_a)) ---------> |
//!     | <-- Cookie(eph_c, nonce_a, seal(nonce_c)) |
//!     | -- Initiate(nonce_c) -------------------> |
//!     | <------------------------- Ack(nonce_a) - |
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, info, warn};

use crate::config::RetryPolicy;
use crate::crypto::{EphemeralKeyPair, PubKey, Session};
use crate::estate::{Role, Tristate, Uid};
use crate::packet::{Packet, PacketKind, TxKind};
use crate::stack::{RoadStack, StackEvent};
use crate::transaction::{sign_body, verify_signed, RedoAction, Redo, Transaction, TxKey, TxStatus};
use crate::util::buf::{put_bytes, try_get_array, try_get_bytes};

type Nonce = [u8; 32];

fn open_nonce(stack: &RoadStack, sealed: &[u8]) -> anyhow::Result<Nonce> {
    let opened = stack.crypto().open(sealed)?;
    opened.as_slice().try_into()
        .map_err(|_| anyhow::anyhow!("sealed nonce has {} bytes", opened.len()))
}

fn verified_payload(stack: &RoadStack, uid: Uid, packet: &Packet) -> anyhow::Result<Vec<u8>> {
    let verkey = stack.remote(uid)
        .and_then(|r| r.verkey)
        .ok_or_else(|| anyhow::anyhow!("no verification key for {:?}", uid))?;
    let payload = verify_signed(stack.crypto().as_ref(), &verkey, &packet.header, &packet.body)?;
    Ok(payload.to_vec())
}

struct CookieExchange {
    their_ephemeral: PubKey,
    nonce_c: Nonce,
}

pub(crate) struct Allower {
    key: TxKey,
    cascade: bool,
    policy: RetryPolicy,
    redo: Redo,
    ephemeral: EphemeralKeyPair,
    nonce_a: Nonce,
    exchange: Option<CookieExchange>,
    /// the last packet sent, Hello or Initiate
    last: Bytes,
}

impl Allower {
    pub fn start(stack: &mut RoadStack, uid: Uid, cascade: bool) -> anyhow::Result<Allower> {
        let remote = stack.remote(uid)
            .ok_or_else(|| anyhow::anyhow!("no remote {:?}", uid))?;
        if !remote.joined.is_confirmed() {
            anyhow::bail!("cannot allow {}: not joined", remote.name);
        }
        let their_pubkey = remote.pubkey
            .ok_or_else(|| anyhow::anyhow!("no public key for {}", remote.name))?;

        let crypto = stack.crypto();
        let ephemeral = crypto.generate_ephemeral_keypair();
        let nonce_a: Nonce = rand::random();
        let sealed = crypto.seal(&their_pubkey, &nonce_a)?;

        let index = stack.directory_mut().get_mut(uid)
            .map(|r| r.next_tx_index())
            .ok_or_else(|| anyhow::anyhow!("no remote {:?}", uid))?;
        let key = TxKey { uid, kind: TxKind::Allow, index, role: Role::Initiator };

        let mut payload = BytesMut::new();
        payload.put_slice(&ephemeral.public.0);
        put_bytes(&mut payload, &sealed);
        let body = sign_body(crypto.as_ref(), &key, PacketKind::Hello, &payload);
        let last = stack.send(&key, PacketKind::Hello, body)
            .ok_or_else(|| anyhow::anyhow!("no remote {:?}", uid))?;

        let policy = stack.config().allow_policy.clone();
        Ok(Allower {
            key,
            cascade,
            redo: Redo::new(stack.now(), &policy),
            policy,
            ephemeral,
            nonce_a,
            exchange: None,
            last,
        })
    }

    fn on_cookie(&mut self, stack: &mut RoadStack, packet: Packet) -> TxStatus {
        if self.exchange.is_some() {
            debug!("{:?}: duplicate cookie - re-sending initiate", self.key);
            stack.resend(self.key.uid, self.last.clone());
            return TxStatus::Pending;
        }

        let payload = match verified_payload(stack, self.key.uid, &packet) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("{:?}: dropping invalid cookie: {}", self.key, e);
                return TxStatus::Pending;
            }
        };
        let exchange = match self.parse_cookie(stack, &payload) {
            Ok(exchange) => exchange,
            Err(e) => {
                warn!("{:?}: cookie failed the challenge: {}", self.key, e);
                self.reject(stack);
                return TxStatus::Done;
            }
        };

        let body = sign_body(stack.crypto().as_ref(), &self.key, PacketKind::Initiate, &exchange.nonce_c);
        if let Some(initiate) = stack.send(&self.key, PacketKind::Initiate, body) {
            self.last = initiate;
        }
        self.exchange = Some(exchange);
        self.redo.reset(stack.now(), &self.policy);
        TxStatus::Pending
    }

    fn parse_cookie(&self, stack: &RoadStack, mut payload: &[u8]) -> anyhow::Result<CookieExchange> {
        let their_ephemeral = PubKey(try_get_array(&mut payload)?);
        let echoed: Nonce = try_get_array(&mut payload)?;
        let sealed = try_get_bytes(&mut payload)?;
        if echoed != self.nonce_a {
            anyhow::bail!("challenge nonce does not match");
        }
        let nonce_c = open_nonce(stack, &sealed)?;
        Ok(CookieExchange { their_ephemeral, nonce_c })
    }

    fn on_ack(&mut self, stack: &mut RoadStack, packet: Packet) -> TxStatus {
        let Some(exchange) = &self.exchange else {
            debug!("{:?}: ack before cookie - ignoring", self.key);
            return TxStatus::Pending;
        };
        match verified_payload(stack, self.key.uid, &packet) {
            Ok(payload) if payload == self.nonce_a => {}
            Ok(_) => {
                warn!("{:?}: dropping ack with wrong nonce", self.key);
                return TxStatus::Pending;
            }
            Err(e) => {
                warn!("{:?}: dropping invalid ack: {}", self.key, e);
                return TxStatus::Pending;
            }
        }

        let shared = stack.crypto().agree(&self.ephemeral.secret, &exchange.their_ephemeral);
        let session = match Session::derive(&shared, &self.nonce_a, &exchange.nonce_c, true) {
            Ok(session) => session,
            Err(e) => {
                warn!("{:?}: session setup failed: {}", self.key, e);
                return TxStatus::Done;
            }
        };

        let uid = self.key.uid;
        let now = stack.now();
        if let Some(remote) = stack.directory_mut().get_mut(uid) {
            remote.confirm_allowed(session, now);
        }
        stack.persist_remote(uid);
        info!("{:?}: allowed", self.key);
        stack.emit(StackEvent::Allowed { uid });

        if self.cascade {
            if let Err(e) = stack.alive(Some(uid), true) {
                warn!("{:?}: cascading alive failed: {}", self.key, e);
            }
        }
        TxStatus::Done
    }

    fn reject(&self, stack: &mut RoadStack) {
        let body = sign_body(stack.crypto().as_ref(), &self.key, PacketKind::Reject, &[]);
        stack.send(&self.key, PacketKind::Reject, body);
        deny(stack, self.key.uid);
    }
}

fn deny(stack: &mut RoadStack, uid: Uid) {
    if let Some(remote) = stack.directory_mut().get_mut(uid) {
        remote.allowed = Tristate::Denied;
        remote.clear_session();
    }
    stack.emit(StackEvent::AllowRejected { uid });
}

impl Transaction for Allower {
    fn key(&self) -> TxKey {
        self.key
    }

    fn receive(&mut self, stack: &mut RoadStack, packet: Packet) -> TxStatus {
        match packet.header.packet_kind {
            PacketKind::Cookie => self.on_cookie(stack, packet),
            PacketKind::Ack => self.on_ack(stack, packet),
            PacketKind::Reject => {
                info!("{:?}: allow rejected", self.key);
                deny(stack, self.key.uid);
                TxStatus::Done
            }
            PacketKind::Unjoined => {
                info!("{:?}: correspondent does not consider us joined", self.key);
                if let Some(remote) = stack.directory_mut().get_mut(self.key.uid) {
                    remote.joined = Tristate::Unknown;
                    remote.allowed = Tristate::Unknown;
                }
                stack.emit(StackEvent::AllowRejected { uid: self.key.uid });
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
                debug!("{:?}: re-sending", self.key);
                stack.resend(self.key.uid, self.last.clone());
                TxStatus::Pending
            }
            RedoAction::GiveUp => {
                info!("{:?}: allow timed out", self.key);
                TxStatus::Done
            }
        }
    }
}

pub(crate) struct Allowent {
    key: TxKey,
    policy: RetryPolicy,
    redo: Redo,
    ephemeral: EphemeralKeyPair,
    their_ephemeral: PubKey,
    nonce_a: Nonce,
    nonce_c: Nonce,
    cookie: Bytes,
}

impl Allowent {
    /// Answers a Hello with a Cookie. Returns `None` if the Hello was answered otherwise (or not
    ///  at all), i.e. there is no transaction to keep.
    pub fn correspond(stack: &mut RoadStack, key: TxKey, packet: &Packet) -> Option<Allowent> {
        let remote = stack.remote(key.uid)?;
        let their_pubkey = match (remote.joined, remote.pubkey) {
            (Tristate::Confirmed, Some(pubkey)) => pubkey,
            _ => {
                info!("{:?}: hello from {}, which is not joined", key, remote.name);
                stack.send(&key, PacketKind::Unjoined, Bytes::new());
                return None;
            }
        };

        let payload = match verified_payload(stack, key.uid, packet) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("{:?}: dropping invalid hello: {}", key, e);
                return None;
            }
        };
        let (their_ephemeral, nonce_a) = match Self::parse_hello(stack, &payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("{:?}: hello failed the challenge: {}", key, e);
                let body = sign_body(stack.crypto().as_ref(), &key, PacketKind::Reject, &[]);
                stack.send(&key, PacketKind::Reject, body);
                return None;
            }
        };

        let crypto = stack.crypto();
        let ephemeral = crypto.generate_ephemeral_keypair();
        let nonce_c: Nonce = rand::random();
        let sealed = match crypto.seal(&their_pubkey, &nonce_c) {
            Ok(sealed) => sealed,
            Err(e) => {
                warn!("{:?}: sealing nonce failed: {}", key, e);
                return None;
            }
        };

        let mut payload = BytesMut::new();
        payload.put_slice(&ephemeral.public.0);
        payload.put_slice(&nonce_a);
        put_bytes(&mut payload, &sealed);
        let body = sign_body(crypto.as_ref(), &key, PacketKind::Cookie, &payload);
        let cookie = stack.send(&key, PacketKind::Cookie, body)?;

        let policy = stack.config().allow_policy.clone();
        Some(Allowent {
            key,
            redo: Redo::new(stack.now(), &policy),
            policy,
            ephemeral,
            their_ephemeral,
            nonce_a,
            nonce_c,
            cookie,
        })
    }

    fn parse_hello(stack: &RoadStack, mut payload: &[u8]) -> anyhow::Result<(PubKey, Nonce)> {
        let their_ephemeral = PubKey(try_get_array(&mut payload)?);
        let sealed = try_get_bytes(&mut payload)?;
        let nonce_a = open_nonce(stack, &sealed)?;
        Ok((their_ephemeral, nonce_a))
    }

    fn on_initiate(&mut self, stack: &mut RoadStack, packet: Packet) -> TxStatus {
        let payload = match verified_payload(stack, self.key.uid, &packet) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("{:?}: dropping invalid initiate: {}", self.key, e);
                return TxStatus::Pending;
            }
        };
        if payload != self.nonce_c {
            warn!("{:?}: initiate failed the challenge", self.key);
            let body = sign_body(stack.crypto().as_ref(), &self.key, PacketKind::Reject, &[]);
            stack.send(&self.key, PacketKind::Reject, body);
            deny(stack, self.key.uid);
            return TxStatus::Done;
        }

        let shared = stack.crypto().agree(&self.ephemeral.secret, &self.their_ephemeral);
        let session = match Session::derive(&shared, &self.nonce_a, &self.nonce_c, false) {
            Ok(session) => session,
            Err(e) => {
                warn!("{:?}: session setup failed: {}", self.key, e);
                return TxStatus::Done;
            }
        };

        let uid = self.key.uid;
        let now = stack.now();
        if let Some(remote) = stack.directory_mut().get_mut(uid) {
            remote.confirm_allowed(session, now);
        }

        let body = sign_body(stack.crypto().as_ref(), &self.key, PacketKind::Ack, &self.nonce_a);
        let ack = stack.send(&self.key, PacketKind::Ack, body);
        if let Some(remote) = stack.directory_mut().get_mut(uid) {
            remote.record_finished(TxKind::Allow, Role::Correspondent, self.key.index, ack);
        }
        stack.persist_remote(uid);
        info!("{:?}: allowed", self.key);
        stack.emit(StackEvent::Allowed { uid });
        TxStatus::Done
    }
}

impl Transaction for Allowent {
    fn key(&self) -> TxKey {
        self.key
    }

    fn receive(&mut self, stack: &mut RoadStack, packet: Packet) -> TxStatus {
        match packet.header.packet_kind {
            PacketKind::Hello => {
                debug!("{:?}: duplicate hello - re-sending cookie", self.key);
                stack.resend(self.key.uid, self.cookie.clone());
                TxStatus::Pending
            }
            PacketKind::Initiate => self.on_initiate(stack, packet),
            PacketKind::Reject => {
                info!("{:?}: allow rejected", self.key);
                deny(stack, self.key.uid);
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
                debug!("{:?}: re-sending cookie", self.key);
                stack.resend(self.key.uid, self.cookie.clone());
                TxStatus::Pending
            }
            RedoAction::GiveUp => {
                info!("{:?}: allow timed out waiting for initiate", self.key);
                TxStatus::Done
            }
        }
    }
}

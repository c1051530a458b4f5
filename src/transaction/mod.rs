//! The protocol's state machines. Every exchange with a remote is a transaction with an
//!  initiator and a correspondent, identified by the remote, the transaction kind, an index
//!  chosen by the initiator, and the local role.
//!
//! Transactions are owned by the [RoadStack]'s transaction table. The stack takes a transaction
//!  out of the table while it processes a packet or a timer tick, so transactions get mutable
//!  access to the stack (e.g. to send packets or update the remote) and report back whether
//!  they are still pending.

use std::fmt::{Debug, Formatter};
use std::time::Duration;

use anyhow::bail;
use bytes::{BufMut, Bytes, BytesMut};

use crate::clock::RedoTimer;
use crate::config::RetryPolicy;
use crate::crypto::{Crypto, Signature, VerKey};
use crate::estate::{Role, Uid};
use crate::packet::{Packet, PacketHeader, PacketKind, TxKind};
use crate::stack::RoadStack;

pub(crate) mod allow;
pub(crate) mod alive;
pub(crate) mod join;
pub(crate) mod message;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxKey {
    pub uid: Uid,
    pub kind: TxKind,
    pub index: u32,
    pub role: Role,
}
impl Debug for TxKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let role = match self.role {
            Role::Initiator => "I",
            Role::Correspondent => "C",
        };
        write!(f, "TX{{{:?}{}@{:?}/{}}}", self.kind, self.index, self.uid, role)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TxStatus {
    Pending,
    Done,
}

pub(crate) trait Transaction: Send {
    fn key(&self) -> TxKey;

    fn receive(&mut self, stack: &mut RoadStack, packet: Packet) -> TxStatus;

    /// called on every service tick for timer handling
    fn process(&mut self, stack: &mut RoadStack) -> TxStatus;

    /// number of unacknowledged segments in flight, for message transactions
    fn outstanding(&self) -> Option<usize> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RedoAction {
    Wait,
    Redo,
    GiveUp,
}

/// Redo timer and counter of a transaction that waits for a reply
#[derive(Debug)]
pub(crate) struct Redo {
    timer: RedoTimer,
    redos: u32,
}
impl Redo {
    pub fn new(now: Duration, policy: &RetryPolicy) -> Redo {
        Redo {
            timer: RedoTimer::new(now, policy.redo_timeout_min),
            redos: 0,
        }
    }

    /// progress was made: start over with the shortest timeout and the full redo budget
    pub fn reset(&mut self, now: Duration, policy: &RetryPolicy) {
        self.timer.restart(now, policy.redo_timeout_min);
        self.redos = 0;
    }

    /// something was sent without evidence of progress: restart the timer, but keep counting redos
    pub fn rearm(&mut self, now: Duration, policy: &RetryPolicy) {
        self.timer.restart(now, policy.redo_timeout_min);
    }

    pub fn poll(&mut self, now: Duration, policy: &RetryPolicy) -> RedoAction {
        if !self.timer.expired(now) {
            return RedoAction::Wait;
        }
        if self.redos >= policy.max_redos {
            return RedoAction::GiveUp;
        }
        self.redos += 1;
        self.timer.restart(now, policy.backoff(self.timer.duration()));
        RedoAction::Redo
    }
}

fn signing_input(tx_kind: TxKind, packet_kind: PacketKind, tx_index: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(6 + payload.len());
    buf.put_u8(tx_kind.into());
    buf.put_u8(packet_kind.into());
    buf.put_u32(tx_index);
    buf.put_slice(payload);
    buf
}

/// The payload followed by a signature over the payload and the packet's transaction context,
///  so a signed body can not be replayed in a different transaction or as a different packet
pub(crate) fn sign_body(crypto: &dyn Crypto, key: &TxKey, packet_kind: PacketKind, payload: &[u8]) -> Bytes {
    let signature = crypto.sign(&signing_input(key.kind, packet_kind, key.index, payload));

    let mut body = BytesMut::with_capacity(payload.len() + Signature::LEN);
    body.put_slice(payload);
    body.put_slice(&signature.0);
    body.freeze()
}

pub(crate) fn split_signed(body: &[u8]) -> anyhow::Result<(&[u8], Signature)> {
    if body.len() < Signature::LEN {
        bail!("body of {} bytes is too short for a signature", body.len());
    }
    let (payload, raw_signature) = body.split_at(body.len() - Signature::LEN);
    let mut signature = [0u8; Signature::LEN];
    signature.copy_from_slice(raw_signature);
    Ok((payload, Signature(signature)))
}

pub(crate) fn verify_signed<'a>(crypto: &dyn Crypto, verkey: &VerKey, header: &PacketHeader, body: &'a [u8]) -> anyhow::Result<&'a [u8]> {
    let (payload, signature) = split_signed(body)?;
    if !crypto.verify(verkey, &signing_input(header.tx_kind, header.packet_kind, header.tx_index, payload), &signature) {
        bail!("invalid signature");
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::DalekCrypto;
    use rstest::rstest;

    fn key() -> TxKey {
        TxKey { uid: Uid(2), kind: TxKind::Join, index: 5, role: Role::Initiator }
    }

    #[rstest]
    #[case::same(TxKind::Join, PacketKind::Request, 5, true)]
    #[case::other_index(TxKind::Join, PacketKind::Request, 6, false)]
    #[case::other_packet_kind(TxKind::Join, PacketKind::Ack, 5, false)]
    #[case::other_tx_kind(TxKind::Allow, PacketKind::Request, 5, false)]
    fn test_signed_body(#[case] tx_kind: TxKind, #[case] packet_kind: PacketKind, #[case] index: u32, #[case] expected: bool) {
        let crypto = DalekCrypto::generate();
        let body = sign_body(&crypto, &key(), PacketKind::Request, b"identity");

        let header = PacketHeader::new(tx_kind, packet_kind, Uid(2), Uid(3), index);
        let verified = verify_signed(&crypto, &crypto.verkey(), &header, &body);
        assert_eq!(verified.is_ok(), expected);
        if expected {
            assert_eq!(verified.unwrap(), b"identity");
        }
    }

    #[test]
    fn test_signed_body_other_key() {
        let crypto = DalekCrypto::generate();
        let other = DalekCrypto::generate();
        let body = sign_body(&crypto, &key(), PacketKind::Request, b"");
        let header = PacketHeader::new(TxKind::Join, PacketKind::Request, Uid(2), Uid(3), 5);
        assert!(verify_signed(&crypto, &other.verkey(), &header, &body).is_err());
        assert!(verify_signed(&crypto, &crypto.verkey(), &header, &body[1..]).is_err());
        assert!(split_signed(&[0u8; 10]).is_err());
    }

    #[test]
    fn test_redo() {
        let policy = RetryPolicy::new(Duration::from_millis(250), Duration::from_millis(1000), 2);
        let mut redo = Redo::new(Duration::ZERO, &policy);

        assert_eq!(redo.poll(Duration::from_millis(200), &policy), RedoAction::Wait);
        assert_eq!(redo.poll(Duration::from_millis(300), &policy), RedoAction::Redo);
        assert_eq!(redo.poll(Duration::from_millis(700), &policy), RedoAction::Wait);
        assert_eq!(redo.poll(Duration::from_millis(800), &policy), RedoAction::Redo);
        assert_eq!(redo.poll(Duration::from_millis(1700), &policy), RedoAction::Wait);
        assert_eq!(redo.poll(Duration::from_millis(1800), &policy), RedoAction::GiveUp);

        redo.reset(Duration::from_millis(2000), &policy);
        assert_eq!(redo.poll(Duration::from_millis(2250), &policy), RedoAction::Redo);
    }

    #[test]
    fn test_redo_rearm_keeps_count() {
        let policy = RetryPolicy::new(Duration::from_millis(250), Duration::from_millis(1000), 1);
        let mut redo = Redo::new(Duration::ZERO, &policy);

        assert_eq!(redo.poll(Duration::from_millis(250), &policy), RedoAction::Redo);
        redo.rearm(Duration::from_millis(300), &policy);
        assert_eq!(redo.poll(Duration::from_millis(500), &policy), RedoAction::Wait);
        assert_eq!(redo.poll(Duration::from_millis(550), &policy), RedoAction::GiveUp);
    }

    #[test]
    fn test_key_debug() {
        assert_eq!(format!("{:?}", key()), "TX{Join5@#2/I}");
    }
}

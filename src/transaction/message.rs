//! Message: reliable transfer of one application message, serialized as JSON, encrypted with the
//!  session, and split into segments that fit a packet.
//!
//! The messenger sends segments in bursts of at most `burst_size` segments (all of them if
//!  `burst_size` is 0). The last packet of a burst carries the WAIT flag, asking the correspondent
//!  for feedback: an Ack if everything up to that segment arrived, or a Resend listing the
//!  missing segments below it. Only then is the next burst sent, so at most `burst_size` segments
//!  are ever in flight. Once the messengent has all segments, it delivers the message and
//!  replies Done.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use serde_json::Value;
use tracing::{debug, info, trace, warn};

use crate::clock::RedoTimer;
use crate::config::RetryPolicy;
use crate::estate::{Role, Tristate, Uid};
use crate::packet::{Packet, PacketFlags, PacketKind, TxKind};
use crate::segment::{Reassembler, Segmenter};
use crate::stack::{RoadStack, StackEvent};
use crate::transaction::{RedoAction, Redo, Transaction, TxKey, TxStatus};

pub(crate) struct Messenger {
    key: TxKey,
    policy: RetryPolicy,
    redo: Redo,
    segments: Segmenter,
    /// the first segment that was never sent
    next: u32,
    /// segments the correspondent reported missing, to be sent before new ones
    misseds: VecDeque<u32>,
    /// the WAIT segment of the current burst, whose feedback the messenger waits for
    last_wait: u32,
    outstanding: usize,
}

impl Messenger {
    pub fn start(stack: &mut RoadStack, uid: Uid, msg: &Value) -> anyhow::Result<Messenger> {
        let segment_len = stack.config().segment_len();
        let max_message_size = stack.config().max_message_size;

        let remote = stack.remote(uid)
            .ok_or_else(|| anyhow::anyhow!("no remote {:?}", uid))?;
        let session = match remote.session() {
            Some(session) if remote.allowed.is_confirmed() => session,
            _ => anyhow::bail!("cannot send message to {}: not allowed", remote.name),
        };

        let serialized = serde_json::to_vec(msg)?;
        if serialized.len() > max_message_size {
            anyhow::bail!("message of {} bytes exceeds the maximum of {}", serialized.len(), max_message_size);
        }
        let encrypted = session.tx.encrypt(&serialized)?;
        let segments = Segmenter::new(encrypted.into(), segment_len)?;

        let index = stack.directory_mut().get_mut(uid)
            .map(|r| r.next_tx_index())
            .ok_or_else(|| anyhow::anyhow!("no remote {:?}", uid))?;
        let key = TxKey { uid, kind: TxKind::Message, index, role: Role::Initiator };
        debug!("{:?}: sending message of {} bytes in {} segments", key, serialized.len(), segments.count());

        let policy = stack.config().message_policy.clone();
        let mut messenger = Messenger {
            key,
            redo: Redo::new(stack.now(), &policy),
            policy,
            segments,
            next: 0,
            misseds: VecDeque::new(),
            last_wait: 0,
            outstanding: 0,
        };
        messenger.send_burst(stack);
        Ok(messenger)
    }

    fn burst_limit(stack: &RoadStack, available: usize) -> usize {
        match stack.config().burst_size {
            0 => available,
            burst_size => available.min(burst_size),
        }
    }

    fn send_segment(&mut self, stack: &mut RoadStack, index: u32, wait: bool) {
        let Some(body) = self.segments.get(index).cloned() else {
            return;
        };
        let flags = if wait {
            self.last_wait = index;
            PacketFlags::WAIT
        }
        else {
            PacketFlags::empty()
        };
        trace!("{:?}: sending segment {}/{}", self.key, index, self.segments.count());
        stack.send_with(&self.key, PacketKind::Segment, flags, index, self.segments.count(), body);
    }

    /// Sends the next burst of segments that were never sent. Once there are none left, it asks
    ///  for the remaining gaps instead.
    fn send_burst(&mut self, stack: &mut RoadStack) {
        let remaining = (self.segments.count() - self.next) as usize;
        if remaining == 0 {
            // Every segment was sent at least once, but Done is missing. Waiting on the last
            //  segment makes the feedback cover every segment that is still missing.
            self.send_segment(stack, self.segments.count() - 1, true);
            self.outstanding = 1;
            self.redo.rearm(stack.now(), &self.policy);
            return;
        }

        let burst = Self::burst_limit(stack, remaining);
        for i in 0..burst {
            let index = self.next;
            self.next += 1;
            self.send_segment(stack, index, i + 1 == burst);
        }
        self.outstanding = burst;
        self.redo.reset(stack.now(), &self.policy);
    }

    /// sends (some of) the segments the correspondent reported missing
    fn send_misseds(&mut self, stack: &mut RoadStack) {
        let burst = Self::burst_limit(stack, self.misseds.len());
        let batch = self.misseds.drain(..burst).collect::<Vec<_>>();
        for (i, &index) in batch.iter().enumerate() {
            self.send_segment(stack, index, i + 1 == burst);
        }
        self.outstanding = burst;
        self.redo.reset(stack.now(), &self.policy);
    }

    fn continue_transfer(&mut self, stack: &mut RoadStack) {
        if self.misseds.is_empty() {
            self.send_burst(stack);
        }
        else {
            self.send_misseds(stack);
        }
    }

    fn parse_resend(mut body: &[u8]) -> anyhow::Result<Vec<u32>> {
        let count = body.try_get_usize_varint()
            .map_err(|e| anyhow::anyhow!("invalid resend count: {:?}", e))?;
        if body.remaining() != count * 4 {
            anyhow::bail!("resend list of {} entries has {} bytes", count, body.remaining());
        }
        Ok((0..count).map(|_| body.get_u32()).collect())
    }

    fn fail(&self, stack: &mut RoadStack) -> TxStatus {
        stack.emit(StackEvent::MessageFailed { uid: self.key.uid });
        TxStatus::Done
    }
}

impl Transaction for Messenger {
    fn key(&self) -> TxKey {
        self.key
    }

    fn receive(&mut self, stack: &mut RoadStack, packet: Packet) -> TxStatus {
        let header = packet.header;
        match header.packet_kind {
            PacketKind::Ack | PacketKind::Resend if header.segment != self.last_wait => {
                trace!("{:?}: dropping feedback for earlier burst {:?}", self.key, header);
                TxStatus::Pending
            }
            PacketKind::Ack => {
                trace!("{:?}: burst acknowledged", self.key);
                self.continue_transfer(stack);
                TxStatus::Pending
            }
            PacketKind::Resend => {
                let missing = match Self::parse_resend(&packet.body) {
                    Ok(missing) => missing,
                    Err(e) => {
                        warn!("{:?}: dropping invalid resend: {}", self.key, e);
                        return TxStatus::Pending;
                    }
                };
                debug!("{:?}: correspondent misses segments {:?}", self.key, missing);
                for index in missing {
                    if index < self.next && !self.misseds.contains(&index) {
                        self.misseds.push_back(index);
                    }
                }
                self.continue_transfer(stack);
                TxStatus::Pending
            }
            PacketKind::Done => {
                debug!("{:?}: message delivered", self.key);
                self.outstanding = 0;
                TxStatus::Done
            }
            PacketKind::Nack => {
                warn!("{:?}: correspondent could not process the message", self.key);
                self.fail(stack)
            }
            PacketKind::Unallowed => {
                info!("{:?}: correspondent has no session with us", self.key);
                if let Some(remote) = stack.directory_mut().get_mut(self.key.uid) {
                    remote.allowed = Tristate::Unknown;
                    remote.clear_session();
                }
                self.fail(stack)
            }
            _ => {
                debug!("{:?}: unexpected {:?} - ignoring", self.key, header);
                TxStatus::Pending
            }
        }
    }

    fn process(&mut self, stack: &mut RoadStack) -> TxStatus {
        match self.redo.poll(stack.now(), &self.policy) {
            RedoAction::Wait => TxStatus::Pending,
            RedoAction::Redo => {
                debug!("{:?}: no feedback - re-sending segment {}", self.key, self.last_wait);
                self.send_segment(stack, self.last_wait, true);
                TxStatus::Pending
            }
            RedoAction::GiveUp => {
                info!("{:?}: message transfer timed out", self.key);
                self.fail(stack)
            }
        }
    }

    fn outstanding(&self) -> Option<usize> {
        Some(self.outstanding)
    }
}

pub(crate) struct Messengent {
    key: TxKey,
    reassembler: Reassembler,
    idle_timeout: Duration,
    idle: RedoTimer,
}

impl Messengent {
    /// Starts receiving a message. Returns `None` if the segment was answered with a refusal
    ///  instead.
    pub fn correspond(stack: &mut RoadStack, key: TxKey, packet: &Packet) -> Option<Messengent> {
        let remote = stack.remote(key.uid)?;
        if remote.session().is_none() || !remote.allowed.is_confirmed() {
            info!("{:?}: message from {}, which is not allowed", key, remote.name);
            stack.send(&key, PacketKind::Unallowed, Bytes::new());
            return None;
        }

        let reassembler = match Reassembler::new(packet.header.segment_count, stack.config().max_segments()) {
            Ok(reassembler) => reassembler,
            Err(e) => {
                warn!("{:?}: refusing message: {}", key, e);
                stack.send(&key, PacketKind::Nack, Bytes::new());
                return None;
            }
        };

        let idle_timeout = stack.config().message_idle_timeout;
        Some(Messengent {
            key,
            reassembler,
            idle_timeout,
            idle: RedoTimer::new(stack.now(), idle_timeout),
        })
    }

    /// the number of entries that fit into a single Resend packet
    fn max_resend_entries(stack: &RoadStack) -> usize {
        (stack.config().segment_len() - 5) / 4
    }

    fn feedback(&self, stack: &mut RoadStack, segment: u32, segment_count: u32) {
        let mut missing = self.reassembler.missing_below(segment);
        if missing.is_empty() {
            trace!("{:?}: acknowledging up to segment {}", self.key, segment);
            stack.send_with(&self.key, PacketKind::Ack, PacketFlags::empty(), segment, segment_count, Bytes::new());
            return;
        }

        missing.truncate(Self::max_resend_entries(stack));
        debug!("{:?}: requesting {} missing segments", self.key, missing.len());
        let mut body = BytesMut::with_capacity(5 + missing.len() * 4);
        body.put_usize_varint(missing.len());
        for index in &missing {
            body.put_u32(*index);
        }
        stack.send_with(&self.key, PacketKind::Resend, PacketFlags::empty(), segment, segment_count, body.freeze());
    }

    fn complete(&mut self, stack: &mut RoadStack) -> TxStatus {
        let Some(assembled) = self.reassembler.assemble() else {
            return TxStatus::Pending;
        };
        let uid = self.key.uid;

        let decrypted = stack.remote(uid)
            .and_then(|r| r.session())
            .map(|s| s.rx.decrypt(&assembled));
        let msg = match decrypted {
            Some(Ok(plain)) => serde_json::from_slice::<Value>(&plain)
                .map_err(|e| anyhow::anyhow!("invalid message: {}", e)),
            Some(Err(e)) => Err(e),
            None => Err(anyhow::anyhow!("session went away")),
        };
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                warn!("{:?}: discarding message: {}", self.key, e);
                stack.send(&self.key, PacketKind::Nack, Bytes::new());
                return TxStatus::Done;
            }
        };

        let Some(source) = stack.remote(uid).map(|r| r.name.clone()) else {
            return TxStatus::Done;
        };
        debug!("{:?}: received message of {} bytes from {}", self.key, assembled.len(), source);
        stack.deliver(msg, source);

        let done = stack.send(&self.key, PacketKind::Done, Bytes::new());
        if let Some(remote) = stack.directory_mut().get_mut(uid) {
            remote.record_finished(TxKind::Message, Role::Correspondent, self.key.index, done);
        }
        TxStatus::Done
    }
}

impl Transaction for Messengent {
    fn key(&self) -> TxKey {
        self.key
    }

    fn receive(&mut self, stack: &mut RoadStack, packet: Packet) -> TxStatus {
        let header = packet.header;
        if header.packet_kind != PacketKind::Segment {
            debug!("{:?}: unexpected {:?} - ignoring", self.key, header);
            return TxStatus::Pending;
        }
        self.idle.restart(stack.now(), self.idle_timeout);

        if let Err(e) = self.reassembler.insert(header.segment, header.segment_count, packet.body) {
            warn!("{:?}: dropping segment: {}", self.key, e);
            return TxStatus::Pending;
        }
        if self.reassembler.is_complete() {
            return self.complete(stack);
        }
        if header.is_wait() {
            self.feedback(stack, header.segment, header.segment_count);
        }
        TxStatus::Pending
    }

    fn process(&mut self, stack: &mut RoadStack) -> TxStatus {
        if self.idle.expired(stack.now()) {
            info!("{:?}: discarding partial message, {} of {} segments received", self.key, self.reassembler.received_count(), self.reassembler.count());
            return TxStatus::Done;
        }
        TxStatus::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use crate::config::AutoMode;
    use crate::test_util::{bloated_message, bloated_message_of, drop_mask, join_and_allow, TestNet};
    use rstest::rstest;

    fn allowed_pair(net: &TestNet, burst_size: usize) -> (RoadStack, RoadStack, Uid) {
        let mut alpha = net.stack("alpha", true, AutoMode::Once);
        let mut beta = net.stack("beta", true, AutoMode::Once);
        alpha.set_burst_size(burst_size);
        beta.set_burst_size(burst_size);
        let uid = join_and_allow(net, &mut beta, &mut alpha);
        beta.take_events();
        alpha.take_events();
        (alpha, beta, uid)
    }

    /// the uid `sender` has for `receiver`
    fn uid_of(sender: &RoadStack, receiver: &RoadStack) -> Uid {
        sender.remote_by_name(&receiver.local().name).unwrap().uid
    }

    fn assert_delivered_once(receiver: &mut RoadStack, sender: &RoadStack, msg: &Value) {
        assert_eq!(receiver.take_rx_msgs(), vec![(msg.clone(), sender.local().name.clone())]);
        assert_eq!(receiver.transaction_count(), 0);
        assert_eq!(sender.transaction_count(), 0);
        assert!(sender.tx_msgs().is_empty());
        assert!(sender.txes().is_empty());
    }

    #[rstest]
    #[case::unlimited_burst(0, 5)]
    #[case::burst_1(1, 10)]
    #[case::burst_4(4, 10)]
    fn test_transmit(#[case] burst_size: usize, #[case] seconds: u64, #[values(false, true)] from_alpha: bool) {
        let net = TestNet::new();
        let (mut alpha, mut beta, _) = allowed_pair(&net, burst_size);
        let (sender, receiver) = if from_alpha { (&mut alpha, &mut beta) } else { (&mut beta, &mut alpha) };

        let msg = bloated_message();
        let uid = uid_of(sender, receiver);
        sender.transmit(msg.clone(), Some(uid)).unwrap();
        net.service_stacks(&mut [&mut *sender, &mut *receiver], Duration::from_secs(seconds));

        assert_delivered_once(receiver, sender, &msg);
        assert!(sender.take_events().is_empty());
    }

    #[test]
    fn test_transmit_both_directions() {
        let net = TestNet::new();
        let (mut alpha, mut beta, uid) = allowed_pair(&net, 0);
        let alpha_uid = uid_of(&alpha, &beta);

        beta.transmit(json!({"from": "beta"}), Some(uid)).unwrap();
        alpha.transmit(json!({"from": "alpha"}), Some(alpha_uid)).unwrap();
        net.service_stacks(&mut [&mut beta, &mut alpha], Duration::from_secs(2));

        assert_eq!(alpha.take_rx_msgs(), vec![(json!({"from": "beta"}), "beta".to_string())]);
        assert_eq!(beta.take_rx_msgs(), vec![(json!({"from": "alpha"}), "alpha".to_string())]);
    }

    #[test]
    fn test_messages_keep_order() {
        let net = TestNet::new();
        let (mut alpha, mut beta, uid) = allowed_pair(&net, 2);

        let msgs = vec![json!({"n": 1}), bloated_message(), json!("three"), json!(null)];
        for msg in &msgs {
            beta.transmit(msg.clone(), Some(uid)).unwrap();
        }
        net.service_stacks(&mut [&mut beta, &mut alpha], Duration::from_secs(20));

        let received = alpha.take_rx_msgs().into_iter()
            .map(|(msg, _)| msg)
            .collect::<Vec<_>>();
        assert_eq!(received, msgs);
    }

    #[rstest]
    #[case::unlimited_burst_1(0, vec![0, 1, 1, 0, 0, 0, 0, 0, 1])]
    #[case::unlimited_burst_2(0, vec![0, 1, 0, 0, 1, 0, 0, 0, 1])]
    #[case::burst_4_a(4, vec![0, 1, 0, 1, 0, 0, 1, 0, 1, 0, 0, 1, 0, 0, 1, 1])]
    #[case::burst_4_b(4, vec![0, 1, 1, 0, 0, 1, 0, 0, 1, 0, 1, 0, 1, 0, 0, 1])]
    fn test_transmit_with_drops(#[case] burst_size: usize, #[case] mask: Vec<u8>, #[values(false, true)] from_alpha: bool) {
        let net = TestNet::new();
        let (mut alpha, mut beta, _) = allowed_pair(&net, burst_size);
        let (sender, receiver) = if from_alpha { (&mut alpha, &mut beta) } else { (&mut beta, &mut alpha) };

        let msg = bloated_message();
        let uid = uid_of(sender, receiver);
        sender.transmit(msg.clone(), Some(uid)).unwrap();
        net.service_stacks_with_drops(&mut [&mut *sender, &mut *receiver], &drop_mask(&mask), Duration::from_secs(10));

        assert_delivered_once(receiver, sender, &msg);
    }

    #[test]
    fn test_transmit_beyond_resend_capacity() {
        let net = TestNet::new();
        let (mut alpha, mut beta, uid) = allowed_pair(&net, 0);
        let capacity = Messengent::max_resend_entries(&alpha);

        let msg = bloated_message_of(3000);
        beta.transmit(msg.clone(), Some(uid)).unwrap();
        beta.service_all_rx();
        beta.service_tx_msgs();

        // the first round loses more segments than a single Resend can list
        let lost = capacity + 15;
        assert!(beta.txes().len() > lost);
        for _ in 0..lost {
            beta.drop_tx_once();
        }
        beta.service_txes();
        net.service_stacks(&mut [&mut alpha, &mut beta], Duration::from_secs(30));

        assert_delivered_once(&mut alpha, &beta, &msg);
        assert!(beta.take_events().is_empty());
    }

    #[test]
    fn test_transmit_after_receiver_discarded_partial_message() {
        let net = TestNet::new();
        let (mut alpha, mut beta, uid) = allowed_pair(&net, 0);
        let capacity = Messengent::max_resend_entries(&alpha);

        let msg = bloated_message_of(3000);
        beta.transmit(msg.clone(), Some(uid)).unwrap();
        beta.service_all_rx();
        beta.service_tx_msgs();
        assert!(beta.txes().len() > capacity);

        // alpha gets the first few segments only, then loses everything until it discards them
        for _ in 0..3 {
            beta.service_tx_once();
        }
        while beta.drop_tx_once() {}
        alpha.service_all();
        assert_eq!(alpha.transaction_count(), 1);

        let idle = alpha.config().message_idle_timeout;
        net.service_stacks_with_drops(&mut [&mut beta, &mut alpha], &[true; 4], idle + TestNet::ROUND);
        assert_eq!(alpha.transaction_count(), 0);
        assert_eq!(beta.transaction_count(), 1);

        // the next redo starts a new partial message at the last segment
        net.service_stacks(&mut [&mut beta, &mut alpha], Duration::from_secs(30));
        assert_delivered_once(&mut alpha, &beta, &msg);
    }

    #[rstest]
    #[case::unlimited_burst(0)]
    #[case::burst_4(4)]
    fn test_transmit_with_duplicates(#[case] burst_size: usize) {
        let net = TestNet::new();
        let (mut alpha, mut beta, uid) = allowed_pair(&net, burst_size);

        let msg = bloated_message();
        beta.transmit(msg.clone(), Some(uid)).unwrap();
        net.service_stacks_with_duplicates(&mut [&mut beta, &mut alpha], Duration::from_secs(10));

        assert_delivered_once(&mut alpha, &beta, &msg);
    }

    /// hands a stack's queued datagrams to the transport, losing the n-th one if `drops[n]` is set
    fn send_with_drops(stack: &mut RoadStack, drops: &[bool]) {
        let mut n = 0;
        while !stack.txes().is_empty() {
            if drops.get(n).copied().unwrap_or(false) {
                stack.drop_tx_once();
            }
            else {
                stack.service_tx_once();
            }
            n += 1;
        }
    }

    #[test]
    fn test_burst_size_bounds_segments_in_flight() {
        let net = TestNet::new();
        let (mut alpha, mut beta, uid) = allowed_pair(&net, 4);

        beta.transmit(bloated_message(), Some(uid)).unwrap();
        let mask = drop_mask(&[0, 1, 0, 1, 0, 0, 1, 0, 1, 0, 0, 1, 0, 0, 1, 1]);
        let mut max_outstanding = 0;
        for _ in 0..100 {
            // feedback and redo timers are handled in the same tick
            beta.service_all_rx();
            beta.service_tx_msgs();
            let sent_this_round = beta.txes().len();
            assert!(sent_this_round <= 4, "{} segments sent in one round", sent_this_round);
            send_with_drops(&mut beta, &mask);

            alpha.service_all_rx();
            alpha.service_tx_msgs();
            send_with_drops(&mut alpha, &mask);
            net.clock().advance(TestNet::ROUND);

            let outstanding = beta.message_outstanding(uid).unwrap_or(0);
            assert!(outstanding <= 4, "{} segments outstanding", outstanding);
            max_outstanding = max_outstanding.max(outstanding);
        }
        assert_eq!(max_outstanding, 4);
        assert_eq!(alpha.take_rx_msgs().len(), 1);
    }

    #[test]
    fn test_transmit_fails_when_everything_is_lost() {
        let net = TestNet::new();
        let mut alpha = net.stack("alpha", true, AutoMode::Once);
        let mut config = TestNet::config("beta", false, AutoMode::Once);
        config.message_policy = RetryPolicy::new(Duration::from_millis(250), Duration::from_secs(1), 3);
        let mut beta = net.stack_with(config);
        let uid = join_and_allow(&net, &mut beta, &mut alpha);
        beta.take_events();

        beta.transmit(bloated_message(), Some(uid)).unwrap();
        net.service_stacks_with_drops(&mut [&mut beta, &mut alpha], &[true; 64], Duration::from_secs(10));

        assert!(alpha.rx_msgs().is_empty());
        assert_eq!(alpha.transaction_count(), 0);
        assert_eq!(beta.transaction_count(), 0);
        assert_eq!(beta.take_events(), vec![StackEvent::MessageFailed { uid }]);
    }

    #[test]
    fn test_partial_message_is_discarded() {
        let net = TestNet::new();
        let (mut alpha, mut beta, uid) = allowed_pair(&net, 4);

        beta.transmit(bloated_message(), Some(uid)).unwrap();
        beta.service_all();
        assert_eq!(beta.message_outstanding(uid), Some(4));
        alpha.service_all();
        assert_eq!(alpha.transaction_count(), 1);

        beta.remove_remote(uid);
        net.service_stacks(&mut [&mut alpha], Duration::from_secs(15));
        assert_eq!(alpha.transaction_count(), 0);
        assert!(alpha.rx_msgs().is_empty());
    }

    #[test]
    fn test_transmit_requires_allow() {
        let net = TestNet::new();
        let mut alpha = net.stack("alpha", true, AutoMode::Once);
        let mut beta = net.stack("beta", false, AutoMode::Once);

        let uid = beta.add_remote(None, alpha.local().ha).unwrap();
        beta.join(Some(uid), false).unwrap();
        net.service_stacks(&mut [&mut beta, &mut alpha], Duration::from_secs(2));

        assert!(beta.transmit(json!("hello"), Some(uid)).is_err());
        assert!(beta.tx_msgs().is_empty());
    }

    #[test]
    fn test_oversized_message_fails() {
        let net = TestNet::new();
        let mut alpha = net.stack("alpha", true, AutoMode::Once);
        let mut config = TestNet::config("beta", false, AutoMode::Once);
        config.max_message_size = 1000;
        let mut beta = net.stack_with(config);
        let uid = join_and_allow(&net, &mut beta, &mut alpha);
        beta.take_events();

        beta.transmit(bloated_message(), Some(uid)).unwrap();
        net.service_stacks(&mut [&mut beta, &mut alpha], Duration::from_secs(2));

        assert_eq!(beta.take_events(), vec![StackEvent::MessageFailed { uid }]);
        assert!(alpha.rx_msgs().is_empty());
        assert_eq!(beta.transaction_count(), 0);
    }

    #[test]
    fn test_message_to_remote_without_session() {
        let net = TestNet::new();
        let (mut alpha, mut beta, uid) = allowed_pair(&net, 0);
        let alpha_uid = alpha.remote_by_name("beta").unwrap().uid;
        alpha.directory_mut().get_mut(alpha_uid).unwrap().clear_session();

        beta.transmit(json!("hello"), Some(uid)).unwrap();
        net.service_stacks(&mut [&mut beta, &mut alpha], Duration::from_secs(2));

        assert!(alpha.rx_msgs().is_empty());
        assert_eq!(beta.take_events(), vec![StackEvent::MessageFailed { uid }]);
        assert_eq!(beta.remote(uid).unwrap().allowed, Tristate::Unknown);
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::single(vec![3])]
    #[case::several(vec![1, 2, 5, 1000])]
    fn test_parse_resend(#[case] missing: Vec<u32>) {
        let mut body = BytesMut::new();
        body.put_usize_varint(missing.len());
        for index in &missing {
            body.put_u32(*index);
        }
        assert_eq!(Messenger::parse_resend(&body).unwrap(), missing);
    }

    #[rstest]
    #[case::truncated(vec![2, 0, 0, 0, 1])]
    #[case::trailing(vec![0, 1])]
    #[case::no_count(vec![])]
    fn test_parse_resend_invalid(#[case] body: Vec<u8>) {
        assert!(Messenger::parse_resend(&body).is_err());
    }
}

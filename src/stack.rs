use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail};
use bytes::Bytes;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tracing::{debug, info, trace, warn};

use crate::clock::Clock;
use crate::config::StackConfig;
use crate::crypto::Crypto;
use crate::directory::{Acceptance, Directory, Keeper, PeerRecord};
use crate::estate::{LocalEstate, RemoteEstate, Role, Uid};
use crate::packet::{Packet, PacketFlags, PacketHeader, PacketKind, TxKind};
use crate::transaction::allow::{Allowent, Allower};
use crate::transaction::alive::{answer_alive, Aliver};
use crate::transaction::join::{Joinent, Joiner};
use crate::transaction::message::{Messengent, Messenger};
use crate::transaction::{Transaction, TxKey, TxStatus};
use crate::transport::{Datagram, Transport};

/// Things that happened in the stack that an application may want to react to. Events are
///  queued until the application takes them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackEvent {
    Joined { uid: Uid, name: String },
    /// a non-main correspondent refused a join for a remote it does not know; the vacuous
    ///  remote was removed
    JoinRefused { name: String },
    JoinRejected { name: String },
    Allowed { uid: Uid },
    AllowRejected { uid: Uid },
    Alived { uid: Uid, cascade: bool },
    Unresponsive { uid: Uid },
    MessageFailed { uid: Uid },
}

/// The protocol engine for one local estate. A stack is a passive state machine: the application
///  (or [crate::driver::run_service_loop]) drives it by calling the `service_*` operations, which
///  move datagrams between the transport and the stack's queues and advance transactions.
///
/// Datagrams flow through two queues: `txes` holds encoded outbound datagrams until they are
///  handed to the transport, `rxes` holds inbound datagrams until they are dispatched. Tests
///  manipulate these queues directly to simulate packet loss and duplication.
pub struct RoadStack {
    config: StackConfig,
    local: LocalEstate,
    crypto: Arc<dyn Crypto>,
    keeper: Box<dyn Keeper>,
    transport: Box<dyn Transport>,
    clock: Arc<dyn Clock>,

    directory: Directory,
    transactions: FxHashMap<TxKey, Box<dyn Transaction>>,

    txes: VecDeque<Datagram>,
    rxes: VecDeque<Datagram>,
    tx_msgs: VecDeque<(Value, Uid)>,
    rx_msgs: VecDeque<(Value, String)>,
    events: VecDeque<StackEvent>,
}

impl RoadStack {
    pub fn new(config: StackConfig, crypto: Arc<dyn Crypto>, keeper: Box<dyn Keeper>, transport: Box<dyn Transport>, clock: Arc<dyn Clock>) -> anyhow::Result<RoadStack> {
        config.validate()?;

        let local = LocalEstate {
            name: config.name.clone(),
            role: config.role.clone(),
            ha: transport.local_addr(),
            main: config.main,
            verkey: crypto.verkey(),
            pubkey: crypto.pubkey(),
        };
        info!("stack {} listening on {} (main: {}, auto: {:?}, burst size: {})", local.name, local.ha, local.main, config.auto, config.burst_size);

        Ok(RoadStack {
            config,
            local,
            crypto,
            keeper,
            transport,
            clock,
            directory: Directory::new(),
            transactions: FxHashMap::default(),
            txes: VecDeque::new(),
            rxes: VecDeque::new(),
            tx_msgs: VecDeque::new(),
            rx_msgs: VecDeque::new(),
            events: VecDeque::new(),
        })
    }

    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    pub fn local(&self) -> &LocalEstate {
        &self.local
    }

    pub fn set_burst_size(&mut self, burst_size: usize) {
        self.config.burst_size = burst_size;
    }

    pub fn remotes(&self) -> &Directory {
        &self.directory
    }

    pub fn remote(&self, uid: Uid) -> Option<&RemoteEstate> {
        self.directory.get(uid)
    }

    pub fn remote_by_name(&self, name: &str) -> Option<&RemoteEstate> {
        self.directory.by_name(name)
    }

    pub fn keeper(&self) -> &dyn Keeper {
        self.keeper.as_ref()
    }

    pub fn keeper_mut(&mut self) -> &mut dyn Keeper {
        self.keeper.as_mut()
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }

    pub fn transaction_keys(&self) -> Vec<TxKey> {
        let mut result = self.transactions.keys().copied().collect::<Vec<_>>();
        result.sort();
        result
    }

    /// unacknowledged segments of the live outbound message transaction to a remote
    pub fn message_outstanding(&self, uid: Uid) -> Option<usize> {
        self.transactions.iter()
            .filter(|(k, _)| k.uid == uid && k.kind == TxKind::Message && k.role == Role::Initiator)
            .find_map(|(_, tx)| tx.outstanding())
    }

    pub fn txes(&self) -> &VecDeque<Datagram> {
        &self.txes
    }

    pub fn txes_mut(&mut self) -> &mut VecDeque<Datagram> {
        &mut self.txes
    }

    pub fn rxes(&self) -> &VecDeque<Datagram> {
        &self.rxes
    }

    pub fn rxes_mut(&mut self) -> &mut VecDeque<Datagram> {
        &mut self.rxes
    }

    pub fn tx_msgs(&self) -> &VecDeque<(Value, Uid)> {
        &self.tx_msgs
    }

    pub fn rx_msgs(&self) -> &VecDeque<(Value, String)> {
        &self.rx_msgs
    }

    pub fn take_rx_msgs(&mut self) -> Vec<(Value, String)> {
        self.rx_msgs.drain(..).collect()
    }

    pub fn events(&self) -> &VecDeque<StackEvent> {
        &self.events
    }

    pub fn take_events(&mut self) -> Vec<StackEvent> {
        self.events.drain(..).collect()
    }

    /// Registers a remote this stack wants to talk to. Without a name, the remote is named after
    ///  its address until a Join reveals its real name.
    pub fn add_remote(&mut self, name: Option<&str>, ha: SocketAddr) -> anyhow::Result<Uid> {
        let name = name
            .map(|n| n.to_string())
            .unwrap_or_else(|| ha.to_string());
        if name == self.local.name {
            bail!("remote name {} is the local estate's name", name);
        }

        let uid = self.directory.next_uid();
        self.directory.add(RemoteEstate::new(uid, &name, ha))?;
        debug!("added remote {:?}: {} at {}", uid, name, ha);
        Ok(uid)
    }

    /// Removes a remote together with all its transactions
    pub fn remove_remote(&mut self, uid: Uid) -> Option<RemoteEstate> {
        self.transactions.retain(|k, _| k.uid != uid);
        let removed = self.directory.remove(uid);
        if let Some(remote) = &removed {
            debug!("removed remote {:?}", remote);
        }
        removed
    }

    /// Starts a Join transaction with a remote, or with the oldest remote if no uid is given.
    ///  With `cascade`, a successful Join is followed by Allow and Alive.
    pub fn join(&mut self, uid: Option<Uid>, cascade: bool) -> anyhow::Result<()> {
        let uid = self.resolve(uid)?;
        if let Some(key) = self.live_key(uid, TxKind::Join, None) {
            bail!("join with {:?} is already in progress: {:?}", uid, key);
        }
        let joiner = Joiner::start(self, uid, cascade)?;
        self.insert_transaction(Box::new(joiner));
        Ok(())
    }

    /// Starts an Allow transaction, establishing a session with a joined remote
    pub fn allow(&mut self, uid: Option<Uid>, cascade: bool) -> anyhow::Result<()> {
        let uid = self.resolve(uid)?;
        if let Some(key) = self.live_key(uid, TxKind::Allow, None) {
            bail!("allow with {:?} is already in progress: {:?}", uid, key);
        }
        let allower = Allower::start(self, uid, cascade)?;
        self.insert_transaction(Box::new(allower));
        Ok(())
    }

    /// Starts an Alive transaction, probing an allowed remote
    pub fn alive(&mut self, uid: Option<Uid>, cascade: bool) -> anyhow::Result<()> {
        let uid = self.resolve(uid)?;
        if let Some(key) = self.live_key(uid, TxKind::Alive, Some(Role::Initiator)) {
            bail!("alive with {:?} is already in progress: {:?}", uid, key);
        }
        let aliver = Aliver::start(self, uid, cascade)?;
        self.insert_transaction(Box::new(aliver));
        Ok(())
    }

    /// Queues an application message for an allowed remote (the oldest remote if no uid is
    ///  given). Messages to the same remote are delivered in the order they are queued.
    pub fn transmit(&mut self, msg: Value, uid: Option<Uid>) -> anyhow::Result<()> {
        let uid = self.resolve(uid)?;
        let remote = self.directory.get(uid)
            .ok_or_else(|| anyhow!("no remote {:?}", uid))?;
        if !remote.allowed.is_confirmed() {
            bail!("cannot transmit to {}: not allowed", remote.name);
        }
        self.tx_msgs.push_back((msg, uid));
        Ok(())
    }

    pub fn service_all(&mut self) {
        self.service_all_rx();
        self.service_all_tx();
    }

    pub fn service_all_rx(&mut self) {
        self.service_receives();
        self.service_rxes();
        self.process();
    }

    pub fn service_all_tx(&mut self) {
        self.service_tx_msgs();
        self.service_txes();
    }

    /// moves everything the transport received into `rxes`
    pub fn service_receives(&mut self) {
        for (addr, bytes) in self.transport.poll_inbound() {
            trace!("received {} bytes from {}", bytes.len(), addr);
            self.rxes.push_back(Datagram { addr, bytes });
        }
    }

    /// dispatches all queued inbound datagrams
    pub fn service_rxes(&mut self) {
        while let Some(datagram) = self.rxes.pop_front() {
            self.dispatch(datagram);
        }
    }

    /// timer handling for all transactions, plus periodic liveness probes
    pub fn process(&mut self) {
        for key in self.transaction_keys() {
            if let Some(mut tx) = self.transactions.remove(&key) {
                let status = tx.process(self);
                self.settle(key, tx, status);
            }
        }
        self.probe_alive();
    }

    /// Starts message transactions for queued messages. A message waits in `tx_msgs` while
    ///  an earlier message to the same remote is still in flight.
    pub fn service_tx_msgs(&mut self) {
        let mut deferred = VecDeque::new();
        while let Some((msg, uid)) = self.tx_msgs.pop_front() {
            let busy = deferred.iter().any(|(_, u)| *u == uid)
                || self.live_key(uid, TxKind::Message, Some(Role::Initiator)).is_some();
            if busy {
                deferred.push_back((msg, uid));
                continue;
            }

            match Messenger::start(self, uid, &msg) {
                Ok(messenger) => self.insert_transaction(Box::new(messenger)),
                Err(e) => {
                    warn!("dropping message to {:?}: {}", uid, e);
                    self.emit(StackEvent::MessageFailed { uid });
                }
            }
        }
        self.tx_msgs = deferred;
    }

    /// hands all queued outbound datagrams to the transport
    pub fn service_txes(&mut self) {
        while self.service_tx_once() {}
    }

    /// hands the oldest queued outbound datagram to the transport, returning `false` if there
    ///  was none
    pub fn service_tx_once(&mut self) -> bool {
        match self.txes.pop_front() {
            Some(datagram) => {
                trace!("sending {:?}", datagram);
                self.transport.enqueue_outbound(datagram.addr, &datagram.bytes);
                true
            }
            None => false,
        }
    }

    /// discards the oldest queued outbound datagram, for simulating packet loss
    pub fn drop_tx_once(&mut self) -> bool {
        self.txes.pop_front().is_some()
    }

    fn dispatch(&mut self, datagram: Datagram) {
        let packet = match Packet::decode(&datagram.bytes, &self.config.network_secret) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("dropping datagram from {}: {}", datagram.addr, e);
                return;
            }
        };
        trace!("dispatching {:?} from {}", packet.header, datagram.addr);

        let header = packet.header;
        if header.de.is_vacuous() {
            if header.tx_kind == TxKind::Join && header.packet_kind == PacketKind::Request {
                Joinent::correspond(self, datagram.addr, packet);
            }
            else {
                debug!("dropping {:?} from {}: vacuous destination", header, datagram.addr);
            }
            return;
        }

        let Some(remote) = self.directory.get(header.de) else {
            debug!("dropping {:?} from {}: unknown remote", header, datagram.addr);
            return;
        };

        let role = if header.is_from_correspondent() { Role::Initiator } else { Role::Correspondent };
        let key = TxKey { uid: remote.uid, kind: header.tx_kind, index: header.tx_index, role };

        if self.transactions.contains_key(&key) {
            self.forward(key, packet);
            return;
        }

        if let Some(finished) = remote.finished(key.kind, role) {
            if header.tx_index == finished.index {
                let replay = key.kind != TxKind::Message || header.is_wait();
                if let (true, Some(reply)) = (replay, finished.reply.clone()) {
                    debug!("{:?}: repeating final reply for stale {:?}", key, header);
                    let ha = remote.ha;
                    self.txes.push_back(Datagram { addr: ha, bytes: reply });
                }
                else {
                    trace!("{:?}: dropping stale {:?}", key, header);
                }
                return;
            }
            if key.kind == TxKind::Message && header.tx_index < finished.index {
                trace!("{:?}: dropping stale {:?}", key, header);
                return;
            }
        }

        match (role, key.kind, header.packet_kind) {
            (Role::Correspondent, TxKind::Join, PacketKind::Request) => {
                Joinent::correspond(self, datagram.addr, packet);
            }
            (Role::Correspondent, TxKind::Allow, PacketKind::Hello) => {
                if let Some(old) = self.live_key(key.uid, TxKind::Allow, Some(Role::Correspondent)) {
                    debug!("{:?}: superseded by {:?}", old, key);
                    self.transactions.remove(&old);
                }
                if let Some(allowent) = Allowent::correspond(self, key, &packet) {
                    self.insert_transaction(Box::new(allowent));
                }
            }
            (Role::Correspondent, TxKind::Alive, PacketKind::Request) => {
                answer_alive(self, key, &packet);
            }
            (Role::Correspondent, TxKind::Message, PacketKind::Segment) => {
                if let Some(mut messengent) = Messengent::correspond(self, key, &packet) {
                    let status = messengent.receive(self, packet);
                    self.settle(key, Box::new(messengent), status);
                }
            }
            _ => debug!("{:?}: no transaction for {:?} - dropping", key, header),
        }
    }

    pub(crate) fn forward(&mut self, key: TxKey, packet: Packet) {
        if let Some(mut tx) = self.transactions.remove(&key) {
            let status = tx.receive(self, packet);
            self.settle(key, tx, status);
        }
    }

    fn settle(&mut self, key: TxKey, tx: Box<dyn Transaction>, status: TxStatus) {
        match status {
            TxStatus::Pending => {
                self.transactions.insert(key, tx);
            }
            TxStatus::Done => debug!("{:?}: done", key),
        }
    }

    fn probe_alive(&mut self) {
        let Some(period) = self.config.alive_period else {
            return;
        };
        let now = self.now();

        let due = self.directory.values()
            .filter(|r| r.allowed.is_confirmed())
            .filter(|r| r.last_probe.map(|t| now >= t + period).unwrap_or(true))
            .map(|r| r.uid)
            .collect::<Vec<_>>();
        for uid in due {
            if self.live_key(uid, TxKind::Alive, Some(Role::Initiator)).is_some() {
                continue;
            }
            if let Err(e) = self.alive(Some(uid), false) {
                debug!("periodic alive for {:?} not started: {}", uid, e);
            }
        }
    }

    fn resolve(&self, uid: Option<Uid>) -> anyhow::Result<Uid> {
        let uid = uid
            .or_else(|| self.directory.first_uid())
            .ok_or_else(|| anyhow!("no remotes"))?;
        if self.directory.get(uid).is_none() {
            bail!("no remote {:?}", uid);
        }
        Ok(uid)
    }

    /// the key of a live transaction with a remote of a given kind, optionally restricted to a role
    pub(crate) fn live_key(&self, uid: Uid, kind: TxKind, role: Option<Role>) -> Option<TxKey> {
        self.transactions.keys()
            .find(|k| k.uid == uid && k.kind == kind && role.map(|r| r == k.role).unwrap_or(true))
            .copied()
    }

    pub(crate) fn has_transaction(&self, key: &TxKey) -> bool {
        self.transactions.contains_key(key)
    }

    pub(crate) fn insert_transaction(&mut self, tx: Box<dyn Transaction>) {
        let key = tx.key();
        debug!("{:?}: started", key);
        self.transactions.insert(key, tx);
    }

    pub(crate) fn abandon(&mut self, key: TxKey) {
        if self.transactions.remove(&key).is_some() {
            debug!("{:?}: abandoned", key);
        }
    }

    pub(crate) fn now(&self) -> Duration {
        self.clock.now()
    }

    pub(crate) fn crypto(&self) -> Arc<dyn Crypto> {
        self.crypto.clone()
    }

    pub(crate) fn directory_mut(&mut self) -> &mut Directory {
        &mut self.directory
    }

    /// Encodes a packet of a transaction and queues it for the remote's address. Returns the
    ///  encoded datagram for re-sending, or `None` if the remote no longer exists.
    pub(crate) fn send(&mut self, key: &TxKey, packet_kind: PacketKind, body: Bytes) -> Option<Bytes> {
        self.send_with(key, packet_kind, PacketFlags::empty(), 0, 1, body)
    }

    pub(crate) fn send_with(&mut self, key: &TxKey, packet_kind: PacketKind, flags: PacketFlags, segment: u32, segment_count: u32, body: Bytes) -> Option<Bytes> {
        let remote = self.directory.get(key.uid)?;
        let flags = match key.role {
            Role::Initiator => flags,
            Role::Correspondent => flags | PacketFlags::CORRESPONDENT,
        };
        let header = PacketHeader::new(key.kind, packet_kind, remote.uid, remote.fuid, key.index)
            .with_flags(flags)
            .with_segment(segment, segment_count);
        let addr = remote.ha;
        Some(self.send_raw(addr, Packet::new(header, body)))
    }

    /// queues a packet for an address regardless of whether it belongs to a known remote
    pub(crate) fn send_raw(&mut self, addr: SocketAddr, packet: Packet) -> Bytes {
        trace!("queueing {:?} for {}", packet.header, addr);
        let bytes = packet.encode(&self.config.network_secret);
        self.txes.push_back(Datagram { addr, bytes: bytes.clone() });
        bytes
    }

    /// queues a previously encoded datagram for a remote again
    pub(crate) fn resend(&mut self, uid: Uid, bytes: Bytes) {
        if let Some(remote) = self.directory.get(uid) {
            let addr = remote.ha;
            self.txes.push_back(Datagram { addr, bytes });
        }
    }

    pub(crate) fn emit(&mut self, event: StackEvent) {
        debug!("event: {:?}", event);
        self.events.push_back(event);
    }

    pub(crate) fn deliver(&mut self, msg: Value, source: String) {
        self.rx_msgs.push_back((msg, source));
    }

    /// Records a remote's identity with the keeper. Keeping is best effort: a failure is
    ///  logged, the protocol state stays as it is.
    pub(crate) fn persist_remote(&mut self, uid: Uid) {
        let Some(remote) = self.directory.get(uid) else {
            return;
        };
        let (Some(verkey), Some(pubkey)) = (remote.verkey, remote.pubkey) else {
            return;
        };
        let record = PeerRecord {
            name: remote.name.clone(),
            role: remote.role.clone(),
            ha: remote.ha,
            verkey,
            pubkey,
            acceptance: Acceptance::Accepted,
        };
        if let Err(e) = self.keeper.persist_peer(&record) {
            warn!("failed to persist remote {}: {}", record.name, e);
        }
    }
}

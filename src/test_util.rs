//! Utilities for testing stacks in-process: an in-memory network with a shared manual clock,
//!  and helpers that service several stacks round by round, optionally losing or duplicating
//!  datagrams. They are used by the crate's own tests, and exported for application testing.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use crate::clock::{Clock, ManualClock};
use crate::config::{AutoMode, StackConfig};
use crate::crypto::{Crypto, DalekCrypto};
use crate::directory::{Keeper, MemoryKeeper};
use crate::estate::Uid;
use crate::stack::RoadStack;
use crate::transport::memory::MemoryNetwork;

pub struct TestNet {
    clock: Arc<ManualClock>,
    network: MemoryNetwork,
    next_port: AtomicU16,
}
impl Default for TestNet {
    fn default() -> Self {
        TestNet::new()
    }
}

impl TestNet {
    /// time that passes per servicing round
    pub const ROUND: Duration = Duration::from_millis(100);

    pub fn new() -> TestNet {
        TestNet {
            clock: Arc::new(ManualClock::new()),
            network: MemoryNetwork::new(),
            next_port: AtomicU16::new(7530),
        }
    }

    pub fn clock(&self) -> &Arc<ManualClock> {
        &self.clock
    }

    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }

    pub fn config(name: &str, main: bool, auto: AutoMode) -> StackConfig {
        let mut config = StackConfig::new(name);
        config.main = main;
        config.auto = auto;
        config
    }

    pub fn stack(&self, name: &str, main: bool, auto: AutoMode) -> RoadStack {
        self.stack_with(Self::config(name, main, auto))
    }

    pub fn stack_with(&self, config: StackConfig) -> RoadStack {
        self.stack_with_parts(config, Arc::new(DalekCrypto::generate()), Box::new(MemoryKeeper::new()))
    }

    pub fn stack_with_parts(&self, config: StackConfig, crypto: Arc<dyn Crypto>, keeper: Box<dyn Keeper>) -> RoadStack {
        let port = self.next_port.fetch_add(1, Ordering::AcqRel);
        let transport = self.network.bind(SocketAddr::from(([127, 0, 0, 1], port)))
            .expect("ports are assigned uniquely");
        RoadStack::new(config, crypto, keeper, Box::new(transport), self.clock.clone())
            .expect("test configuration should be valid")
    }

    fn is_idle(&self, stacks: &[&mut RoadStack]) -> bool {
        stacks.iter().all(|s|
            s.transaction_count() == 0
                && s.txes().is_empty()
                && s.tx_msgs().is_empty()
                && self.network.pending(s.local().ha) == 0
        )
    }

    fn run_rounds(&self, stacks: &mut [&mut RoadStack], duration: Duration, mut round: impl FnMut(&mut RoadStack)) {
        let deadline = self.clock.now() + duration;
        while self.clock.now() < deadline {
            for stack in stacks.iter_mut() {
                round(&mut **stack);
            }
            if self.is_idle(stacks) {
                break;
            }
            self.clock.advance(Self::ROUND);
        }
    }

    /// Services all stacks round by round until no stack has anything left to do, or until
    ///  `duration` of (manual) time has passed
    pub fn service_stacks(&self, stacks: &mut [&mut RoadStack], duration: Duration) {
        self.run_rounds(stacks, duration, |stack| stack.service_all());
    }

    /// Like [TestNet::service_stacks], but in every round each stack's outbound datagrams are
    ///  dropped according to `drops`: the n-th datagram a stack sends in a round is lost if
    ///  `drops[n]` is `true`. Datagrams beyond the mask's length are sent.
    pub fn service_stacks_with_drops(&self, stacks: &mut [&mut RoadStack], drops: &[bool], duration: Duration) {
        self.run_rounds(stacks, duration, |stack| {
            stack.service_all_rx();
            stack.service_tx_msgs();
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
        });
    }

    /// Like [TestNet::service_stacks], but every received datagram is dispatched twice
    pub fn service_stacks_with_duplicates(&self, stacks: &mut [&mut RoadStack], duration: Duration) {
        self.run_rounds(stacks, duration, |stack| {
            stack.service_receives();
            dup_receives(stack);
            stack.service_rxes();
            stack.process();
            stack.service_all_tx();
        });
    }

    /// Lets a stack discard everything it received but did not dispatch yet
    pub fn flush_receives(stack: &mut RoadStack) {
        stack.service_receives();
        stack.rxes_mut().clear();
    }
}

/// duplicates every datagram in a stack's receive queue, keeping their order
pub fn dup_receives(stack: &mut RoadStack) {
    let rxes = stack.rxes_mut();
    let duplicated = rxes.drain(..)
        .flat_map(|d| [d.clone(), d])
        .collect::<Vec<_>>();
    rxes.extend(duplicated);
}

/// Drop masks from 0/1 notation, for readability in tests
pub fn drop_mask(mask: &[u8]) -> Vec<bool> {
    mask.iter()
        .map(|&b| b != 0)
        .collect()
}

/// A message of about 30,000 bytes, requiring a few dozen segments with default packet sizes
pub fn bloated_message() -> Value {
    bloated_message_of(300)
}

/// A message carrying `lines` right-aligned numbers of 100 characters each as a single string
pub fn bloated_message_of(lines: usize) -> Value {
    let data = (0..lines)
        .map(|i| format!("{:>100}", i))
        .collect::<String>();
    json!({ "who": "Green", "data": data })
}

/// Registers `initiator`'s correspondent as a remote and joins it with cascade, i.e. including
///  Allow and Alive, returning the initiator's uid for the correspondent
pub fn join_and_allow(net: &TestNet, initiator: &mut RoadStack, correspondent: &mut RoadStack) -> Uid {
    let uid = initiator.add_remote(None, correspondent.local().ha)
        .expect("remote should be new");
    initiator.join(Some(uid), true)
        .expect("join should start");
    net.service_stacks(&mut [initiator, correspondent], Duration::from_secs(5));
    uid
}

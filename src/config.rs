use std::time::Duration;

use anyhow::bail;

use crate::packet::PacketHeader;
use crate::crypto::SessionCipher;

/// Acceptance policy for peer identities learned during Join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoMode {
    /// Only peers that were registered manually (and marked as accepted) with the keeper may join
    Never,
    /// A peer's identity is accepted the first time it is seen; afterwards, its keys must match
    Once,
    /// Any identity is accepted, replacing previously known keys
    Always,
}

/// Timing for one transaction kind: the initiator (and correspondents waiting for a reply)
///  re-send their last packet when the redo timer expires, doubling the redo timeout from
///  `redo_timeout_min` up to `redo_timeout_max`. After `max_redos` unanswered re-sends, the
///  transaction fails.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub redo_timeout_min: Duration,
    pub redo_timeout_max: Duration,
    pub max_redos: u32,
}
impl RetryPolicy {
    pub fn new(redo_timeout_min: Duration, redo_timeout_max: Duration, max_redos: u32) -> RetryPolicy {
        RetryPolicy {
            redo_timeout_min,
            redo_timeout_max,
            max_redos,
        }
    }

    pub fn backoff(&self, previous: Duration) -> Duration {
        (previous * 2).clamp(self.redo_timeout_min, self.redo_timeout_max)
    }

    fn validate(&self, what: &str) -> anyhow::Result<()> {
        if self.redo_timeout_min.is_zero() {
            bail!("{}: redo timeout must be positive", what);
        }
        if self.redo_timeout_min > self.redo_timeout_max {
            bail!("{}: minimum redo timeout exceeds maximum", what);
        }
        Ok(())
    }
}

pub struct StackConfig {
    /// The local estate's name, unique among the peers this stack talks to
    pub name: String,
    pub role: String,

    /// A `main` stack accepts joins from peers it has no record of ('vacuous' joins). Other
    ///  stacks only accept joins from peers they already know.
    pub main: bool,
    pub auto: AutoMode,

    /// Maximum number of unacknowledged message segments in flight per message transaction.
    ///  0 means unlimited, i.e. all segments of a message are sent at once.
    pub burst_size: usize,

    /// Maximum size of a single datagram including the packet header. This must be supported
    ///  end-to-end without IP fragmentation.
    pub max_packet_size: usize,
    pub max_message_size: usize,

    /// Shared between all peers of a network, keys the integrity checksum of every packet.
    ///  This is not a security measure (that is what signatures and session encryption are for),
    ///  it keeps datagrams of unrelated networks on the same port apart.
    pub network_secret: Vec<u8>,

    pub join_policy: RetryPolicy,
    pub allow_policy: RetryPolicy,
    pub alive_policy: RetryPolicy,
    pub message_policy: RetryPolicy,

    /// A partially received message is discarded if no segment arrives for this long
    pub message_idle_timeout: Duration,

    /// If set, every allowed remote is probed with an Alive transaction at this interval
    pub alive_period: Option<Duration>,
}

impl StackConfig {
    pub const MIN_PACKET_SIZE: usize = 128;
    pub const MAX_PACKET_SIZE: usize = 65507;

    pub fn new(name: &str) -> StackConfig {
        StackConfig {
            name: name.to_string(),
            role: name.to_string(),
            main: false,
            auto: AutoMode::Once,
            burst_size: 0,
            max_packet_size: 1024,
            max_message_size: 16 * 1024 * 1024,
            network_secret: b"roadstack".to_vec(),
            join_policy: RetryPolicy::new(Duration::from_millis(1000), Duration::from_secs(4), 6),
            allow_policy: RetryPolicy::new(Duration::from_millis(500), Duration::from_secs(2), 6),
            alive_policy: RetryPolicy::new(Duration::from_millis(500), Duration::from_secs(2), 4),
            message_policy: RetryPolicy::new(Duration::from_millis(250), Duration::from_secs(1), 12),
            message_idle_timeout: Duration::from_secs(10),
            alive_period: None,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.name.is_empty() {
            bail!("stack name must not be empty");
        }
        if self.max_packet_size < Self::MIN_PACKET_SIZE {
            bail!("max packet size {} is too small, minimum is {}", self.max_packet_size, Self::MIN_PACKET_SIZE);
        }
        if self.max_packet_size > Self::MAX_PACKET_SIZE {
            bail!("max packet size {} exceeds UDP payload limit {}", self.max_packet_size, Self::MAX_PACKET_SIZE);
        }
        if self.max_message_size == 0 {
            bail!("max message size must be positive");
        }
        if self.max_message_size + SessionCipher::OVERHEAD > u32::MAX as usize {
            bail!("max message size {} too big", self.max_message_size);
        }
        if self.message_idle_timeout.is_zero() {
            bail!("message idle timeout must be positive");
        }
        if let Some(period) = self.alive_period {
            if period.is_zero() {
                bail!("alive period must be positive");
            }
        }

        self.join_policy.validate("join")?;
        self.allow_policy.validate("allow")?;
        self.alive_policy.validate("alive")?;
        self.message_policy.validate("message")?;
        Ok(())
    }

    /// number of message bytes that fit into a single segment packet
    pub fn segment_len(&self) -> usize {
        self.max_packet_size - PacketHeader::SERIALIZED_LEN
    }

    /// upper bound for the number of segments of a valid message, used to reject absurd segment
    ///  counts before allocating reassembly buffers
    pub fn max_segments(&self) -> usize {
        (self.max_message_size + SessionCipher::OVERHEAD).div_ceil(self.segment_len())
    }
}

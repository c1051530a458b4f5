//! A reliable, encrypted transaction protocol between peers ('estates') over UDP.
//!
//! Peers first *join* (exchanging signed identities), then *allow* (a handshake that establishes
//!  a session), after which they can prove liveness (*alive*) and exchange application messages
//!  of arbitrary size that are segmented, encrypted and delivered exactly once.
//!
//! Every datagram is a single packet with a fixed size header:
//!
//! ```ascii
//! 0:  magic "RD" (2 bytes)
//! 2:  protocol version (u8)
//! 3:  checksum (u64, keyed with the network secret, covering everything after it)
//! 11: flags (u8): correspondent, wait
//! 12: transaction kind (u8)
//! 13: packet kind (u8)
//! 14: se (u32): the sender's id for the receiver
//! 18: de (u32): the receiver's id for the sender, 0 if not known yet
//! 22: transaction index (u32)
//! 26: segment (u32)
//! 30: segment count (u32)
//! 34: body length (u16)
//! 36: body
//! ```
//!
//! The [stack::RoadStack] is the protocol engine. It does no I/O on its own, but is serviced
//!  periodically (see [driver::run_service_loop]) and exchanges datagrams through a
//!  [transport::Transport].

pub mod clock;
pub mod config;
pub mod crypto;
pub mod directory;
pub mod driver;
pub mod estate;
pub mod packet;
pub mod segment;
pub mod stack;
pub mod transaction;
pub mod transport;
pub mod util;
pub mod test_util;

pub use config::{AutoMode, RetryPolicy, StackConfig};
pub use estate::{Role, Tristate, Uid};
pub use stack::{RoadStack, StackEvent};

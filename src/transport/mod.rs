//! The network boundary: stacks hand finished datagrams to a [Transport] and poll it for
//!  received ones, never touching sockets themselves.

use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;

use bytes::Bytes;
#[cfg(test)] use mockall::automock;

pub mod memory;
pub mod udp;

/// A raw datagram with its peer address (the destination for outbound datagrams, the source
///  for inbound ones)
#[derive(Clone, PartialEq, Eq)]
pub struct Datagram {
    pub addr: SocketAddr,
    pub bytes: Bytes,
}
impl Debug for Datagram {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "DGRAM{{{}:{}}}", self.addr, self.bytes.len())
    }
}

/// This is an abstraction for sending and receiving datagrams without blocking, introduced to
///  decouple the protocol from actual sockets and to facilitate testing
#[cfg_attr(test, automock)]
pub trait Transport: Send {
    fn local_addr(&self) -> SocketAddr;

    /// Hands a datagram over for sending. Failures are logged rather than reported: datagram
    ///  delivery is unreliable anyway, and the transactions' retries cover lost datagrams.
    fn enqueue_outbound(&mut self, to: SocketAddr, datagram: &[u8]);

    /// all datagrams received since the previous call, in order of arrival
    fn poll_inbound(&mut self) -> Vec<(SocketAddr, Bytes)>;
}

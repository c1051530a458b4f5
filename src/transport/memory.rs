use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tracing::{trace, warn};

use crate::transport::Transport;

type Mailboxes = FxHashMap<SocketAddr, VecDeque<(SocketAddr, Bytes)>>;

/// An in-process datagram network: every bound [MemoryTransport] has a mailbox, and datagrams
///  sent to an address without a mailbox vanish like they would on a real network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    mailboxes: Arc<Mutex<Mailboxes>>,
}
impl MemoryNetwork {
    pub fn new() -> MemoryNetwork {
        Default::default()
    }

    pub fn bind(&self, addr: SocketAddr) -> anyhow::Result<MemoryTransport> {
        let mut mailboxes = self.lock();
        if mailboxes.contains_key(&addr) {
            anyhow::bail!("address {} is already bound", addr);
        }
        mailboxes.insert(addr, VecDeque::new());
        Ok(MemoryTransport {
            addr,
            network: self.clone(),
        })
    }

    /// number of datagrams that were delivered to `addr` but not polled yet
    pub fn pending(&self, addr: SocketAddr) -> usize {
        self.lock().get(&addr)
            .map(|mailbox| mailbox.len())
            .unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Mailboxes> {
        // a panic while holding the lock cannot leave the mailboxes inconsistent
        self.mailboxes.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct MemoryTransport {
    addr: SocketAddr,
    network: MemoryNetwork,
}
impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.network.lock().remove(&self.addr);
    }
}

impl Transport for MemoryTransport {
    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    fn enqueue_outbound(&mut self, to: SocketAddr, datagram: &[u8]) {
        match self.network.lock().get_mut(&to) {
            Some(mailbox) => {
                trace!("{} -> {}: {} bytes", self.addr, to, datagram.len());
                mailbox.push_back((self.addr, Bytes::copy_from_slice(datagram)));
            }
            None => warn!("no endpoint at {} - dropping datagram", to),
        }
    }

    fn poll_inbound(&mut self) -> Vec<(SocketAddr, Bytes)> {
        self.network.lock().get_mut(&self.addr)
            .map(|mailbox| mailbox.drain(..).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_send_receive() {
        let network = MemoryNetwork::new();
        let mut alpha = network.bind(addr(7530)).unwrap();
        let mut beta = network.bind(addr(7531)).unwrap();

        alpha.enqueue_outbound(addr(7531), b"one");
        alpha.enqueue_outbound(addr(7531), b"two");
        alpha.enqueue_outbound(addr(9999), b"lost");
        assert_eq!(network.pending(addr(7531)), 2);

        assert_eq!(beta.poll_inbound(), vec![
            (addr(7530), Bytes::from_static(b"one")),
            (addr(7530), Bytes::from_static(b"two")),
        ]);
        assert!(beta.poll_inbound().is_empty());
        assert!(alpha.poll_inbound().is_empty());
    }

    #[test]
    fn test_bind_twice() {
        let network = MemoryNetwork::new();
        let alpha = network.bind(addr(7530)).unwrap();
        assert!(network.bind(addr(7530)).is_err());
        drop(alpha);
        assert!(network.bind(addr(7530)).is_ok());
    }
}

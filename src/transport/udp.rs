use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::transport::Transport;

/// [Transport] over a tokio UDP socket. Sending and receiving happen in spawned tasks that are
///  connected to the (synchronous) stack through unbounded channels, so the stack's service
///  tick never waits for I/O.
///
/// NB: This must be created inside a tokio runtime.
pub struct UdpTransport {
    local_addr: SocketAddr,
    outbound: mpsc::UnboundedSender<(SocketAddr, Bytes)>,
    inbound: mpsc::UnboundedReceiver<(SocketAddr, Bytes)>,
    tasks: Vec<JoinHandle<()>>,
}
impl Drop for UdpTransport {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl UdpTransport {
    const MAX_DATAGRAM_SIZE: usize = 65536;

    pub async fn bind(addr: SocketAddr) -> anyhow::Result<UdpTransport> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;
        info!("bound UDP socket to {}", local_addr);

        let (outbound, outbound_recv) = mpsc::unbounded_channel();
        let (inbound_send, inbound) = mpsc::unbounded_channel();

        let send_task = tokio::spawn(Self::send_loop(socket.clone(), outbound_recv));
        let recv_task = tokio::spawn(Self::recv_loop(socket, inbound_send));

        Ok(UdpTransport {
            local_addr,
            outbound,
            inbound,
            tasks: vec![send_task, recv_task],
        })
    }

    async fn send_loop(socket: Arc<UdpSocket>, mut outbound: mpsc::UnboundedReceiver<(SocketAddr, Bytes)>) {
        while let Some((to, datagram)) = outbound.recv().await {
            trace!("UDP socket: sending {} bytes to {:?}", datagram.len(), to);
            if let Err(e) = socket.send_to(&datagram, to).await {
                error!("error sending UDP packet to {:?}: {}", to, e);
            }
        }
        debug!("send loop for {:?} terminated", socket.local_addr());
    }

    async fn recv_loop(socket: Arc<UdpSocket>, inbound: mpsc::UnboundedSender<(SocketAddr, Bytes)>) {
        let mut buf = vec![0u8; Self::MAX_DATAGRAM_SIZE];
        loop {
            let (num_read, from) = match socket.recv_from(&mut buf).await {
                Ok(x) => x,
                Err(e) => {
                    error!("socket error: {}", e);
                    continue;
                }
            };
            trace!("UDP socket: received {} bytes from {:?}", num_read, from);

            if inbound.send((from, Bytes::copy_from_slice(&buf[..num_read]))).is_err() {
                debug!("transport was dropped - terminating receive loop");
                break;
            }
        }
    }
}

impl Transport for UdpTransport {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn enqueue_outbound(&mut self, to: SocketAddr, datagram: &[u8]) {
        if self.outbound.send((to, Bytes::copy_from_slice(datagram))).is_err() {
            warn!("send loop terminated - dropping datagram to {}", to);
        }
    }

    fn poll_inbound(&mut self) -> Vec<(SocketAddr, Bytes)> {
        let mut result = Vec::new();
        while let Ok(received) = self.inbound.try_recv() {
            result.push(received);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn poll_until_received(transport: &mut UdpTransport) -> Vec<(SocketAddr, Bytes)> {
        for _ in 0..100 {
            let received = transport.poll_inbound();
            if !received.is_empty() {
                return received;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        vec![]
    }

    #[tokio::test]
    async fn test_loopback() {
        let mut alpha = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let mut beta = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        assert_ne!(alpha.local_addr().port(), 0);

        alpha.enqueue_outbound(beta.local_addr(), b"hello beta");
        let received = poll_until_received(&mut beta).await;
        assert_eq!(received, vec![(alpha.local_addr(), Bytes::from_static(b"hello beta"))]);
        assert!(alpha.poll_inbound().is_empty());
    }
}

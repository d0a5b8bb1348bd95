use std::net::SocketAddr;
use std::sync::Arc;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tracing::{error, info, trace, warn};
use crate::runner::EngineHandle;

/// The datagram channel to the remote engine, introduced to keep the engine independent of
///  the actual I/O and to facilitate mocking it away for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LtpTransport: Send + Sync + 'static {
    /// Sends a single datagram that consists of `parts` in this order
    async fn send_packet(&self, parts: &[Bytes]) -> anyhow::Result<()>;

    /// Sends the packets of one batch. Sending stops at the first failure.
    async fn send_packets(&self, packets: &[Vec<Bytes>]) -> anyhow::Result<()> {
        for packet in packets {
            self.send_packet(packet).await?;
        }
        Ok(())
    }
}

/// Maximum size of a UDP datagram's payload
const MAX_DATAGRAM_SIZE: usize = 65_536;

pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

impl UdpTransport {
    pub async fn bind(local_addr: SocketAddr, peer: SocketAddr) -> anyhow::Result<UdpTransport> {
        let socket = UdpSocket::bind(local_addr).await?;
        info!("bound LTP UDP socket to {:?}, peer is {:?}", socket.local_addr()?, peer);
        Ok(UdpTransport::new(Arc::new(socket), peer))
    }

    pub fn new(socket: Arc<UdpSocket>, peer: SocketAddr) -> UdpTransport {
        UdpTransport { socket, peer }
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Feeds datagrams from the peer into the engine until the engine's event loop terminates
    pub async fn recv_loop(&self, engine: EngineHandle) {
        info!("starting LTP receive loop on {:?}", self.socket.local_addr().ok());

        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (num_read, from) = match self.socket.recv_from(&mut buf).await {
                Ok(x) => x,
                Err(e) => {
                    error!("socket error: {}", e);
                    continue;
                }
            };
            if from != self.peer {
                warn!("received datagram from {:?}, expected only {:?} - dropping", from, self.peer);
                continue;
            }

            trace!("received datagram of {} bytes from {:?}", num_read, from);
            if engine.packet_in(Bytes::copy_from_slice(&buf[..num_read])).is_err() {
                info!("engine has terminated - stopping receive loop");
                return;
            }
        }
    }
}

#[async_trait]
impl LtpTransport for UdpTransport {
    async fn send_packet(&self, parts: &[Bytes]) -> anyhow::Result<()> {
        trace!("UDP socket: sending packet to {:?}", self.peer);

        match parts {
            [single] => {
                self.socket.send_to(single, self.peer).await?;
            }
            _ => {
                let mut buf = BytesMut::with_capacity(parts.iter().map(Bytes::len).sum());
                for part in parts {
                    buf.extend_from_slice(part);
                }
                self.socket.send_to(&buf, self.peer).await?;
            }
        }
        Ok(())
    }
}

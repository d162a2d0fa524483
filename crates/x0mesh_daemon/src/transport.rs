//! UDP datagram transport, one frame per datagram.

use std::net::SocketAddr;

use tokio::net::UdpSocket;
use tracing::{debug, warn};
use x0mesh_core::wire::{Frame, MAX_FRAME_LEN};
use x0mesh_core::MeshError;

pub struct UdpTransport {
    socket: UdpSocket,
    buf: Vec<u8>,
}

impl UdpTransport {
    pub async fn bind(addr: SocketAddr) -> Result<Self, MeshError> {
        let socket = UdpSocket::bind(addr).await?;
        debug!(local = %socket.local_addr()?, "transport bound");
        Ok(Self {
            socket,
            buf: vec![0u8; MAX_FRAME_LEN],
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, MeshError> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn send_frame(&self, frame: &Frame, to: SocketAddr) {
        let bytes = frame.encode();
        if let Err(e) = self.socket.send_to(&bytes, to).await {
            warn!(to = %to, error = %e, "failed to send frame");
        }
    }

    /// Receive and decode the next frame. Malformed datagrams are dropped
    /// with a log line; the loop never stalls on them.
    pub async fn recv_frame(&mut self) -> Result<(Frame, SocketAddr), MeshError> {
        loop {
            let (len, from) = self.socket.recv_from(&mut self.buf).await?;
            match Frame::decode(&self.buf[..len]) {
                Ok(frame) => return Ok((frame, from)),
                Err(e) => {
                    debug!(from = %from, error = %e, "dropping malformed datagram");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use x0mesh_core::pqc::SignatureScheme;
    use x0mesh_core::wire::FrameKind;
    use x0mesh_core::NodeId;

    fn frame() -> Frame {
        Frame {
            kind: FrameKind::Beacon,
            sender: NodeId([5u8; 32]),
            epoch: 1,
            nonce: 9,
            payload: vec![1, 2, 3],
            scheme: SignatureScheme::Mock,
            signature: vec![0u8; SignatureScheme::Mock.signature_len()],
        }
    }

    #[tokio::test]
    async fn test_send_and_receive_frame() {
        let a = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let mut b = UdpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let b_addr = b.local_addr().unwrap();

        a.send_frame(&frame(), b_addr).await;
        let (received, from) = b.recv_frame().await.unwrap();
        assert_eq!(received.nonce, 9);
        assert_eq!(received.payload, vec![1, 2, 3]);
        assert_eq!(from, a.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_malformed_datagram_skipped() {
        let a = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let mut b = UdpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let b_addr = b.local_addr().unwrap();

        // Garbage first, then a valid frame; recv skips the garbage.
        a.socket.send_to(&[0xFF; 10], b_addr).await.unwrap();
        a.send_frame(&frame(), b_addr).await;
        let (received, _) = b.recv_frame().await.unwrap();
        assert_eq!(received.nonce, 9);
    }
}

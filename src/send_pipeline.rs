use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tracing::{error, trace};

use crate::wire::Datagram;

/// This is an abstraction for sending a buffer on a UDP socket, introduced to facilitate mocking
///  the I/O part away for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn do_send_datagram(&self, to: SocketAddr, datagram_buf: &[u8]);

    fn local_addr(&self) -> SocketAddr;
}

#[async_trait]
impl SendSocket for Arc<UdpSocket> {
    async fn do_send_datagram(&self, to: SocketAddr, datagram_buf: &[u8]) {
        trace!("UDP socket: sending datagram to {:?}", to);

        if let Err(e) = self.send_to(datagram_buf, to).await {
            error!("error sending UDP datagram to {:?}: {}", to, e);
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.as_ref().local_addr()
            .expect("UdpSocket should have an initialized local addr")
    }
}


#[derive(Clone)]
pub struct SendPipeline {
    socket: Arc<dyn SendSocket>,
}

impl SendPipeline {
    pub fn new(socket: Arc<dyn SendSocket>) -> SendPipeline {
        SendPipeline { socket }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    pub async fn send_datagram(&self, to: SocketAddr, datagram: &Datagram) {
        let mut buf = BytesMut::with_capacity(datagram.serialized_len());
        datagram.ser(&mut buf);
        self.socket.do_send_datagram(to, &buf).await;
    }

    pub async fn send_raw(&self, to: SocketAddr, datagram_buf: &[u8]) {
        self.socket.do_send_datagram(to, datagram_buf).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seq::SequenceNumber;
    use crate::wire::AckRanges;

    fn addr() -> SocketAddr {
        "127.0.0.1:4711".parse().unwrap()
    }

    #[tokio::test]
    async fn test_send_datagram_serializes_onto_the_socket() {
        let datagram = Datagram::Ack(AckRanges(vec![(SequenceNumber::ZERO, SequenceNumber::ZERO)]));
        let mut expected = BytesMut::new();
        datagram.ser(&mut expected);
        let expected = expected.freeze();

        let mut socket = MockSendSocket::new();
        socket.expect_do_send_datagram()
            .withf(move |to, buf| *to == addr() && buf == &expected[..])
            .times(1)
            .returning(|_, _| ());

        SendPipeline::new(Arc::new(socket)).send_datagram(addr(), &datagram).await;
    }

    #[tokio::test]
    async fn test_send_raw_passes_bytes_through() {
        let mut socket = MockSendSocket::new();
        socket.expect_do_send_datagram()
            .withf(|_, buf| buf == &[1u8, 2, 3][..])
            .times(1)
            .returning(|_, _| ());

        SendPipeline::new(Arc::new(socket)).send_raw(addr(), &[1, 2, 3]).await;
    }
}

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use tokio::sync::mpsc;

use crate::disconnect::DisconnectReason;

/// Consumer-side callbacks of the transport: fully reassembled, order-corrected
///  messages plus session lifecycle events. All callbacks for one peer are invoked
///  sequentially from that peer's session context.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageDispatcher: Send + Sync + 'static {
    async fn on_message(&self, sender_addr: SocketAddr, channel: u8, msg: Bytes);

    /// confirmation that a message sent with an ack receipt request was acknowledged
    async fn on_ack_receipt(&self, peer_addr: SocketAddr, receipt_id: u64);

    async fn on_disconnect(&self, peer_addr: SocketAddr, reason: DisconnectReason);
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum TransportEvent {
    Message {
        sender_addr: SocketAddr,
        channel: u8,
        msg: Bytes,
    },
    AckReceipt {
        peer_addr: SocketAddr,
        receipt_id: u64,
    },
    Disconnect {
        peer_addr: SocketAddr,
        reason: DisconnectReason,
    },
}

/// Dispatcher implementation backed by an mpsc queue, for callers that want to pull
///  events from a stream rather than implement callbacks - the relay consumes its
///  legs this way.
pub struct QueueDispatcher {
    sender: mpsc::Sender<TransportEvent>,
}

impl QueueDispatcher {
    pub fn new(queue_size: usize) -> (QueueDispatcher, mpsc::Receiver<TransportEvent>) {
        let (sender, receiver) = mpsc::channel(queue_size);
        (QueueDispatcher { sender }, receiver)
    }
}

#[async_trait]
impl MessageDispatcher for QueueDispatcher {
    async fn on_message(&self, sender_addr: SocketAddr, channel: u8, msg: Bytes) {
        let _ = self.sender.send(TransportEvent::Message { sender_addr, channel, msg }).await;
    }

    async fn on_ack_receipt(&self, peer_addr: SocketAddr, receipt_id: u64) {
        let _ = self.sender.send(TransportEvent::AckReceipt { peer_addr, receipt_id }).await;
    }

    async fn on_disconnect(&self, peer_addr: SocketAddr, reason: DisconnectReason) {
        let _ = self.sender.send(TransportEvent::Disconnect { peer_addr, reason }).await;
    }
}

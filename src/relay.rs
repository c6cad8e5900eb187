use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::select;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, trace, warn};

use crate::disconnect::{ConnectionState, DisconnectReason};
use crate::message_dispatcher::TransportEvent;
use crate::session::Session;
use crate::wire::Reliability;

/// how often a leg's queued messages are re-checked against the destination's
///  connection state
const FLUSH_INTERVAL: std::time::Duration = std::time::Duration::from_millis(20);

/// Transparent two-leg relay: forwards fully reassembled messages between a front and
///  a back session without inspecting them, and propagates close signals between the
///  legs.
///
/// Each leg is consumed through its queue-backed dispatcher, so all forwarding for
///  one direction runs on one task - messages cross between the legs' contexts only
///  through the destination session's API, never by direct state sharing.
///
/// Messages arriving while the destination leg is still handshaking are buffered up
///  to a bound; exceeding it closes both legs with `QueueTooLong`. Closing either leg
///  closes the other exactly once, with the reason mapped so the surviving side sees
///  why its counterpart went away.
pub struct RelayChannel {
    front: Arc<Session>,
    back: Arc<Session>,
    closed: Arc<AtomicBool>,
    forward_handles: Vec<JoinHandle<()>>,
}

impl Drop for RelayChannel {
    fn drop(&mut self) {
        for handle in &self.forward_handles {
            handle.abort();
        }
    }
}

impl RelayChannel {
    pub fn new(
        front: Arc<Session>,
        front_events: mpsc::Receiver<TransportEvent>,
        back: Arc<Session>,
        back_events: mpsc::Receiver<TransportEvent>,
        max_pending_messages: usize,
    ) -> RelayChannel {
        let closed = Arc::new(AtomicBool::new(false));

        let forward_handles = vec![
            tokio::spawn(Self::forward_loop(
                front_events,
                front.clone(),
                back.clone(),
                closed.clone(),
                max_pending_messages,
            )),
            tokio::spawn(Self::forward_loop(
                back_events,
                back.clone(),
                front.clone(),
                closed.clone(),
                max_pending_messages,
            )),
        ];

        RelayChannel {
            front,
            back,
            closed,
            forward_handles,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// closes both legs; idempotent, later calls are no-ops
    pub async fn close(&self, reason: DisconnectReason) {
        Self::close_both(&self.front, &self.back, &self.closed, reason).await;
    }

    async fn forward_loop(
        mut events: mpsc::Receiver<TransportEvent>,
        source: Arc<Session>,
        dest: Arc<Session>,
        closed: Arc<AtomicBool>,
        max_pending_messages: usize,
    ) {
        let mut pending: Vec<(u8, Bytes)> = Vec::new();
        let mut flush_interval = interval(FLUSH_INTERVAL);

        loop {
            select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        // the source session is gone, its dispatcher with it
                        Self::close_both(&source, &dest, &closed, DisconnectReason::ClosedByRemotePeer).await;
                        return;
                    };
                    match event {
                        TransportEvent::Message { channel, msg, .. } => {
                            if dest.connection_state().await == ConnectionState::Handshaking {
                                if pending.len() >= max_pending_messages {
                                    warn!("relay leg buffered {} messages while its counterpart is handshaking, giving up", pending.len());
                                    Self::close_both(&source, &dest, &closed, DisconnectReason::QueueTooLong).await;
                                    return;
                                }
                                pending.push((channel, msg));
                                continue;
                            }
                            if !Self::flush(&dest, &mut pending).await
                                || !Self::forward(&dest, channel, msg).await
                            {
                                Self::close_both(&source, &dest, &closed, DisconnectReason::ClosedByRemotePeer).await;
                                return;
                            }
                        }
                        TransportEvent::AckReceipt { receipt_id, .. } => {
                            trace!("relay: ignoring ack receipt {}", receipt_id);
                        }
                        TransportEvent::Disconnect { reason, .. } => {
                            debug!("relay leg disconnected: {}", reason);
                            Self::close_both(&source, &dest, &closed, Self::map_reason(reason)).await;
                            return;
                        }
                    }
                }
                _ = flush_interval.tick() => {
                    if !pending.is_empty()
                        && dest.connection_state().await == ConnectionState::Connected
                        && !Self::flush(&dest, &mut pending).await
                    {
                        Self::close_both(&source, &dest, &closed, DisconnectReason::ClosedByRemotePeer).await;
                        return;
                    }
                }
            }
        }
    }

    async fn flush(dest: &Arc<Session>, pending: &mut Vec<(u8, Bytes)>) -> bool {
        for (channel, msg) in pending.drain(..) {
            if !Self::forward(dest, channel, msg).await {
                return false;
            }
        }
        true
    }

    async fn forward(dest: &Arc<Session>, channel: u8, msg: Bytes) -> bool {
        match dest.send(msg, Reliability::ReliableOrdered, channel).await {
            Ok(()) => true,
            Err(e) => {
                debug!("relay could not forward to {:?}: {}", dest.peer_addr().await, e);
                false
            }
        }
    }

    /// the reason the surviving leg's peer is given when its counterpart goes away
    fn map_reason(reason: DisconnectReason) -> DisconnectReason {
        match reason {
            DisconnectReason::ShuttingDown => DisconnectReason::ShuttingDown,
            DisconnectReason::QueueTooLong => DisconnectReason::QueueTooLong,
            _ => DisconnectReason::ClosedByRemotePeer,
        }
    }

    async fn close_both(
        a: &Arc<Session>,
        b: &Arc<Session>,
        closed: &Arc<AtomicBool>,
        reason: DisconnectReason,
    ) {
        if closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("closing relay: {}", reason);
        a.disconnect(reason).await;
        b.disconnect(reason).await;
    }
}

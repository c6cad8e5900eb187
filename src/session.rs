use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use bytes::Bytes;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};
use tracing::{debug, trace, warn};

use crate::config::{RakUdpConfig, NUM_ORDERING_CHANNELS};
use crate::disconnect::{ConnectionState, DisconnectReason};
use crate::message_dispatcher::MessageDispatcher;
use crate::ordering::{OrderingChannelIn, OrderingChannelOut};
use crate::reliability::ReliabilityStateMachine;
use crate::send_pipeline::SendPipeline;
use crate::split::{Reassembler, Splitter};
use crate::wire::{Datagram, Frame, FrameOrdering, Reliability};

struct SessionInner {
    config: Arc<RakUdpConfig>,
    peer_addr: SocketAddr,
    send_pipeline: Arc<SendPipeline>,
    message_dispatcher: Arc<dyn MessageDispatcher>,

    reliability: ReliabilityStateMachine,
    splitter: Splitter,
    reassembler: Reassembler,
    ordering_in: Vec<OrderingChannelIn>,
    ordering_out: Vec<OrderingChannelOut>,

    next_receipt_id: u64,
}

impl SessionInner {
    fn new(
        config: Arc<RakUdpConfig>,
        peer_addr: SocketAddr,
        send_pipeline: Arc<SendPipeline>,
        message_dispatcher: Arc<dyn MessageDispatcher>,
    ) -> SessionInner {
        SessionInner {
            peer_addr,
            send_pipeline,
            message_dispatcher,
            reliability: ReliabilityStateMachine::new(&config, Instant::now()),
            splitter: Splitter::new(),
            reassembler: Reassembler::new(config.max_outstanding_splits, config.max_fragment_count),
            ordering_in: (0..NUM_ORDERING_CHANNELS)
                .map(|_| OrderingChannelIn::new(config.ordering_window_size))
                .collect(),
            ordering_out: (0..NUM_ORDERING_CHANNELS).map(|_| OrderingChannelOut::new()).collect(),
            next_receipt_id: 0,
            config,
        }
    }

    /// biggest payload that still fits a single frame into a datagram
    fn fragment_capacity(&self) -> usize {
        self.config.payload_size_inside_udp - Datagram::HEADER_LEN - Frame::MAX_HEADER_LEN
    }

    async fn do_send_message(
        &mut self,
        payload: Bytes,
        reliability: Reliability,
        channel: u8,
        with_receipt: bool,
    ) -> anyhow::Result<Option<u64>> {
        if !self.reliability.state().is_active() {
            bail!("session with {} is {:?}, not sending", self.peer_addr, self.reliability.state());
        }

        let fragment_capacity = self.fragment_capacity();
        let reliability = if payload.len() > fragment_capacity {
            let fragment_count = payload.len().div_ceil(fragment_capacity);
            if fragment_count > self.config.max_fragment_count {
                bail!("payload of {} bytes would need {} fragments, the configured limit is {}",
                    payload.len(), fragment_count, self.config.max_fragment_count);
            }
            // a split message is only useful complete, so its fragments travel
            //  reliably even when the caller asked for an unreliable mode
            match reliability {
                Reliability::Unreliable => Reliability::Reliable,
                Reliability::UnreliableSequenced => Reliability::ReliableSequenced,
                other => other,
            }
        } else {
            reliability
        };

        // channel ids are taken modulo the channel count on the send side
        let channel = channel % NUM_ORDERING_CHANNELS;
        let ordering = if reliability.is_ordered_or_sequenced() {
            let out = &mut self.ordering_out[channel as usize];
            let (sequenced_index, ordered_index) = if reliability.is_sequenced() {
                out.next_sequenced()
            } else {
                out.next_ordered()
            };
            Some(FrameOrdering { sequenced_index, ordered_index, channel })
        } else {
            None
        };

        let receipt_id = if with_receipt {
            let id = self.next_receipt_id;
            self.next_receipt_id += 1;
            Some(id)
        } else {
            None
        };

        // all fragments of one message share the ordering indices, each fragment gets
        //  its own reliable index
        let frames = if payload.len() > fragment_capacity {
            self.splitter.split(payload, fragment_capacity)
                .into_iter()
                .map(|(meta, fragment)| Frame {
                    reliability,
                    ack_receipt: receipt_id.is_some(),
                    reliable_index: reliability.is_reliable()
                        .then(|| self.reliability.next_reliable_index()),
                    ordering: ordering.clone(),
                    split: Some(meta),
                    payload: fragment,
                })
                .collect()
        } else {
            vec![Frame {
                reliability,
                ack_receipt: receipt_id.is_some(),
                reliable_index: reliability.is_reliable()
                    .then(|| self.reliability.next_reliable_index()),
                ordering,
                split: None,
                payload,
            }]
        };

        match self.reliability.send_frames(frames, receipt_id.into_iter().collect(), Instant::now()) {
            Ok(datagrams) => {
                for datagram in &datagrams {
                    self.send_pipeline.send_datagram(self.peer_addr, datagram).await;
                }
                Ok(receipt_id)
            }
            Err(reason) => {
                self.do_close(reason).await;
                bail!("session with {} closed: {}", self.peer_addr, reason);
            }
        }
    }

    async fn on_datagram(&mut self, datagram: Datagram) {
        if self.reliability.state() == ConnectionState::Closed {
            trace!("datagram from {} for a closed session, dropping", self.peer_addr);
            return;
        }

        let outcome = match self.reliability.on_datagram(datagram, Instant::now()) {
            Ok(outcome) => outcome,
            Err(reason) => {
                self.do_close(reason).await;
                return;
            }
        };

        for resend in &outcome.resend_datagrams {
            self.send_pipeline.send_raw(self.peer_addr, resend).await;
        }
        for receipt_id in outcome.ack_receipts {
            self.message_dispatcher.on_ack_receipt(self.peer_addr, receipt_id).await;
        }

        for frame in outcome.frames {
            if let Err(e) = self.on_frame(frame).await {
                warn!("protocol violation from {}: {}", self.peer_addr, e);
                self.do_close(DisconnectReason::BadPacket).await;
                return;
            }
        }
    }

    /// Reassembles and order-corrects one frame, dispatching whatever becomes
    ///  deliverable. Any violation of the frame's declared metadata is an error, the
    ///  caller closes the session.
    async fn on_frame(&mut self, frame: Frame) -> anyhow::Result<()> {
        let reliability = frame.reliability;
        let ordering = frame.ordering.clone();

        let payload = match &frame.split {
            Some(meta) => match self.reassembler.on_fragment(meta, frame.payload)? {
                Some(reassembled) => reassembled,
                None => return Ok(()),
            },
            None => frame.payload,
        };

        match ordering {
            None => {
                if reliability.is_ordered_or_sequenced() {
                    bail!("{:?} frame without ordering metadata", reliability);
                }
                self.dispatch(0, payload).await;
            }
            Some(ordering) => {
                if !reliability.is_ordered_or_sequenced() {
                    bail!("{:?} frame with ordering metadata", reliability);
                }
                if ordering.channel >= NUM_ORDERING_CHANNELS {
                    bail!("ordering channel {} out of range", ordering.channel);
                }
                let channel_state = &mut self.ordering_in[ordering.channel as usize];
                if reliability.is_sequenced() {
                    if let Some(fresh) = channel_state.on_sequenced(ordering.sequenced_index, ordering.ordered_index, payload) {
                        self.dispatch(ordering.channel, fresh).await;
                    }
                } else {
                    let mut deliverable = Vec::new();
                    channel_state.on_ordered(ordering.ordered_index, payload, &mut deliverable)?;
                    for msg in deliverable {
                        self.dispatch(ordering.channel, msg).await;
                    }
                }
            }
        }
        Ok(())
    }

    async fn dispatch(&self, channel: u8, msg: Bytes) {
        self.message_dispatcher.on_message(self.peer_addr, channel, msg).await;
    }

    async fn on_tick(&mut self) {
        if self.reliability.state() == ConnectionState::Closed {
            return;
        }

        match self.reliability.on_tick(Instant::now()) {
            Ok(out) => {
                for resend in &out.resend_datagrams {
                    self.send_pipeline.send_raw(self.peer_addr, resend).await;
                }
                if let Some(nack) = &out.nack {
                    self.send_pipeline.send_datagram(self.peer_addr, nack).await;
                }
                if let Some(ack) = &out.ack {
                    self.send_pipeline.send_datagram(self.peer_addr, ack).await;
                }
            }
            Err(reason) => self.do_close(reason).await,
        }
    }

    /// Terminal state transition, idempotent: the dispatcher sees exactly one
    ///  disconnect notification however often this is reached.
    async fn do_close(&mut self, reason: DisconnectReason) {
        if self.reliability.state() == ConnectionState::Closed {
            return;
        }
        debug!("closing session with {}: {}", self.peer_addr, reason);
        self.reliability.set_state(ConnectionState::Closed);
        self.reliability.clear();
        self.message_dispatcher.on_disconnect(self.peer_addr, reason).await;
    }
}

/// One peer's connection: owns the ARQ state machine, congestion controller, ordering
///  channels and reassembly state, and exposes the send / disconnect / state API to
///  upper layers.
///
/// All per-peer state lives behind one lock, so every mutation is effectively
///  serialized onto one logical context: the endpoint's receive loop, the session's
///  own housekeeping loop and API callers take turns.
pub struct Session {
    config: Arc<RakUdpConfig>,
    inner: Arc<RwLock<SessionInner>>,
    active_handle: Option<JoinHandle<()>>,
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(handle) = self.active_handle.take() {
            handle.abort();
        }
    }
}

impl Session {
    pub fn new(
        config: Arc<RakUdpConfig>,
        peer_addr: SocketAddr,
        send_pipeline: Arc<SendPipeline>,
        message_dispatcher: Arc<dyn MessageDispatcher>,
    ) -> Session {
        let inner = Arc::new(RwLock::new(SessionInner::new(
            config.clone(),
            peer_addr,
            send_pipeline,
            message_dispatcher,
        )));

        Session {
            config,
            inner,
            active_handle: None,
        }
    }

    /// starts the housekeeping loop driving retransmission, NACKs and ACK flushes
    pub fn spawn_active_loop(&mut self) {
        if self.active_handle.is_some() {
            warn!("active loop already spawned");
            return;
        }
        self.active_handle = Some(tokio::spawn(Self::do_loop(self.config.clone(), self.inner.clone())));
    }

    async fn do_loop(config: Arc<RakUdpConfig>, inner: Arc<RwLock<SessionInner>>) {
        let mut tick_interval = interval(config.tick_interval);
        loop {
            tick_interval.tick().await;
            let mut locked = inner.write().await;
            locked.on_tick().await;
            if locked.reliability.state() == ConnectionState::Closed {
                // nothing left to drive for a closed session
                break;
            }
        }
    }

    pub async fn peer_addr(&self) -> SocketAddr {
        self.inner.read().await.peer_addr
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.inner.read().await.reliability.state()
    }

    pub async fn round_trip_time(&self) -> Duration {
        self.inner.read().await.reliability.round_trip_time()
    }

    /// Sends a message with the given delivery guarantee on the given channel
    ///  (taken modulo the channel count). Oversized payloads are fragmented
    ///  transparently.
    pub async fn send(&self, payload: Bytes, reliability: Reliability, channel: u8) -> anyhow::Result<()> {
        self.inner.write().await
            .do_send_message(payload, reliability, channel, false).await?;
        Ok(())
    }

    /// Like [`Session::send`], additionally returning a receipt id that is confirmed
    ///  through the dispatcher once the peer acknowledges the message.
    pub async fn send_with_receipt(&self, payload: Bytes, reliability: Reliability, channel: u8) -> anyhow::Result<u64> {
        let receipt = self.inner.write().await
            .do_send_message(payload, reliability, channel, true).await?;
        Ok(receipt.expect("receipt requested but none assigned"))
    }

    /// called by the endpoint's receive loop with every parsed datagram from this peer
    pub async fn on_datagram(&self, datagram: Datagram) {
        self.inner.write().await
            .on_datagram(datagram).await;
    }

    pub async fn disconnect(&self, reason: DisconnectReason) {
        self.inner.write().await
            .do_close(reason).await;
    }
}

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::bail;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::RwLock;
use tokio::time::interval;
use tracing::{debug, error, info, trace, warn};

use crate::config::RakUdpConfig;
use crate::disconnect::{ConnectionState, DisconnectReason};
use crate::message_dispatcher::MessageDispatcher;
use crate::send_pipeline::SendPipeline;
use crate::session::Session;
use crate::wire::Datagram;

/// how often the session map is swept for sessions that closed themselves, e.g. on
///  idle timeout in their own housekeeping loop
const SESSION_SWEEP_INTERVAL: Duration = Duration::from_millis(250);

/// EndPoint is the place where all other parts of the protocol come together: It listens on a
///  UdpSocket, dispatching incoming datagrams to their peers' sessions, and has an API for
///  application code to open connections.
pub struct EndPoint {
    receive_socket: Arc<UdpSocket>,
    send_pipeline: Arc<SendPipeline>,
    sessions: RwLock<FxHashMap<SocketAddr, Arc<Session>>>,
    /// most recent connection attempt per remote IP, for the reconnect cooldown
    recent_attempts: RwLock<FxHashMap<IpAddr, Instant>>,
    message_dispatcher: Arc<dyn MessageDispatcher>,
    config: Arc<RakUdpConfig>,
    /// whether unknown peers may open sessions by sending traffic
    accept_incoming: bool,
}

impl EndPoint {
    pub async fn new(
        bind_addr: SocketAddr,
        accept_incoming: bool,
        message_dispatcher: Arc<dyn MessageDispatcher>,
        config: Arc<RakUdpConfig>,
    ) -> anyhow::Result<EndPoint> {
        config.validate()?;

        let receive_socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        info!("bound receive socket to {:?}", receive_socket.local_addr()?);

        Ok(EndPoint {
            send_pipeline: Arc::new(SendPipeline::new(Arc::new(receive_socket.clone()))),
            receive_socket,
            sessions: RwLock::new(FxHashMap::default()),
            recent_attempts: RwLock::new(FxHashMap::default()),
            message_dispatcher,
            config,
            accept_incoming,
        })
    }

    pub fn self_addr(&self) -> SocketAddr {
        self.receive_socket.local_addr()
            .expect("UdpSocket should have an initialized local addr")
    }

    /// Opens a session to a peer. The connection is established lazily: it completes
    ///  with the first inbound traffic from the peer.
    pub async fn connect(&self, peer_addr: SocketAddr) -> anyhow::Result<Arc<Session>> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&peer_addr) {
            bail!("already connected to {:?}", peer_addr);
        }

        debug!("initializing session for {:?}", peer_addr);
        let session = self.new_session(peer_addr);
        sessions.insert(peer_addr, session.clone());
        Ok(session)
    }

    pub async fn get_session(&self, peer_addr: SocketAddr) -> Option<Arc<Session>> {
        self.sessions.read().await.get(&peer_addr).cloned()
    }

    /// closes all sessions, notifying each peer's dispatcher
    pub async fn shut_down(&self) {
        let sessions = std::mem::take(&mut *self.sessions.write().await);
        for session in sessions.values() {
            session.disconnect(DisconnectReason::ShuttingDown).await;
        }
    }

    fn new_session(&self, peer_addr: SocketAddr) -> Arc<Session> {
        let mut session = Session::new(
            self.config.clone(),
            peer_addr,
            self.send_pipeline.clone(),
            self.message_dispatcher.clone(),
        );
        session.spawn_active_loop();
        Arc::new(session)
    }

    pub async fn recv_loop(&self) {
        info!("starting receive loop");

        let mut buf = vec![0u8; 64 * 1024];
        let mut sweep_interval = interval(SESSION_SWEEP_INTERVAL);
        loop {
            select! {
                received = self.receive_socket.recv_from(&mut buf) => {
                    match received {
                        Ok((num_read, from)) => self.on_received(&buf[..num_read], from).await,
                        Err(e) => error!("socket error: {}", e),
                    }
                }
                _ = sweep_interval.tick() => {
                    self.remove_closed_sessions().await;
                }
            }
        }
    }

    async fn on_received(&self, raw: &[u8], from: SocketAddr) {
        trace!("received datagram from {:?}: {} bytes", from, raw.len());

        let datagram = match Datagram::deser(Bytes::copy_from_slice(raw)) {
            Ok(datagram) => datagram,
            Err(e) => {
                // a malformed datagram from a connected peer voids trust in the
                //  rest of its stream
                warn!("received unparseable datagram from {:?}: {}", from, e);
                if let Some(session) = self.sessions.write().await.remove(&from) {
                    session.disconnect(DisconnectReason::BadPacket).await;
                }
                return;
            }
        };

        let session = match self.get_session(from).await {
            Some(session) => session,
            None => match self.accept_session(from).await {
                Some(session) => session,
                None => return,
            },
        };

        session.on_datagram(datagram).await;

        if session.connection_state().await == ConnectionState::Closed {
            self.sessions.write().await.remove(&from);
        }
    }

    /// Sessions close themselves on idle timeout without any further datagram
    ///  arriving, so the map is swept periodically - otherwise a dead session would
    ///  count against the connection limit indefinitely.
    async fn remove_closed_sessions(&self) {
        let mut closed = Vec::new();
        for (addr, session) in self.sessions.read().await.iter() {
            if session.connection_state().await == ConnectionState::Closed {
                closed.push(*addr);
            }
        }

        if !closed.is_empty() {
            let mut sessions = self.sessions.write().await;
            for addr in &closed {
                debug!("removing closed session with {:?}", addr);
                sessions.remove(addr);
            }
        }
    }

    /// Applies the incoming-connection policies to an unknown sender, creating a
    ///  session if it is admitted. Rejections are reported through the dispatcher
    ///  with the policy's reason.
    async fn accept_session(&self, from: SocketAddr) -> Option<Arc<Session>> {
        if !self.accept_incoming {
            debug!("datagram from unknown peer {:?}, not accepting incoming connections - dropping", from);
            return None;
        }

        if self.sessions.read().await.len() >= self.config.max_incoming_connections {
            debug!("rejecting connection from {:?}: connection limit reached", from);
            self.message_dispatcher
                .on_disconnect(from, DisconnectReason::NoFreeIncomingConnections).await;
            return None;
        }

        if let Some(cooldown) = self.config.incoming_connection_cooldown {
            let mut recent_attempts = self.recent_attempts.write().await;
            let now = Instant::now();
            recent_attempts.retain(|_, at| now.saturating_duration_since(*at) < cooldown);

            if recent_attempts.insert(from.ip(), now).is_some() {
                debug!("rejecting connection from {:?}: same IP connected {:?} ago", from, cooldown);
                self.message_dispatcher
                    .on_disconnect(from, DisconnectReason::IpRecentlyConnected).await;
                return None;
            }
        }

        debug!("initializing session for incoming connection from {:?}", from);
        let session = self.new_session(from);
        self.sessions.write().await.insert(from, session.clone());
        Some(session)
    }
}

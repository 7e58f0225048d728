use std::{net::SocketAddr, sync::Arc};

use fixwire_timing::{Nanos, Repeater};
use fixwire_utils::safe_panic;
use mio::{Events, Interest, Poll, Token, event::Event, net::TcpListener};
use tracing::{debug, error, info, warn};

use crate::{
    ConnectionId, ENGINE_LIBRARY_ID, LibraryId, SessionId,
    bus::{InboundPublisher, MessageTimingSink},
    channel::{SocketChannel, set_socket_buf_size},
    config::EngineConfig,
    counters::SenderCounters,
    error::{ConnState, DisconnectReason, ErrorSink, log_error_sink},
    receiver::ReceiverEndpoint,
    sender::{FixSenderEndpoint, FixpSenderEndpoint, SenderEndpoint},
    throttle::SessionKey,
};

/// Session-layer protocol spoken on a listener or initiated connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionProtocol {
    Fix,
    Fixp,
}

/// Builds the optional per-connection timing sink at accept/connect time.
pub type TimingFactory = Box<dyn Fn(ConnectionId) -> Box<dyn MessageTimingSink>>;

struct SessionPair {
    connection_id: ConnectionId,
    counters: Arc<SenderCounters>,
    sender: SenderEndpoint<SocketChannel>,
    receiver: ReceiverEndpoint,
}

enum Connection {
    /// Accepts new sessions; each accepted socket becomes a `Session`.
    Listener { listener: TcpListener, protocol: SessionProtocol },
    Session(Box<SessionPair>),
}

struct FramerCore<P: InboundPublisher> {
    poll: Poll,
    conns: Vec<(Token, Connection)>,
    next_token: usize,
    next_connection_id: ConnectionId,
    config: EngineConfig,
    errors: Arc<dyn ErrorSink>,
    publisher: P,
    timing_factory: Option<TimingFactory>,
    stats: Repeater,
}

impl<P: InboundPublisher> FramerCore<P> {
    fn find_session(&self, connection_id: ConnectionId) -> Option<usize> {
        self.conns.iter().position(
            |(_, c)| matches!(c, Connection::Session(pair) if pair.connection_id == connection_id),
        )
    }

    fn new_session(
        &mut self,
        mut stream: mio::net::TcpStream,
        peer_addr: SocketAddr,
        protocol: SessionProtocol,
        library_id: LibraryId,
    ) -> std::io::Result<(Token, ConnectionId)> {
        if let Some(size) = self.config.socket_buf_size {
            set_socket_buf_size(&stream, size);
        }
        let token = Token(self.next_token);
        self.poll.registry().register(&mut stream, token, Interest::READABLE)?;
        let channel = SocketChannel::new(stream, peer_addr)?;

        let connection_id = self.next_connection_id;
        let counters = SenderCounters::new_shared();
        let now = Nanos::now();
        let sender = match protocol {
            SessionProtocol::Fix => SenderEndpoint::Fix(FixSenderEndpoint::new(
                connection_id,
                library_id,
                channel,
                &self.config,
                counters.clone(),
                self.errors.clone(),
                self.timing_factory.as_ref().map(|f| f(connection_id)),
                now,
            )),
            SessionProtocol::Fixp => SenderEndpoint::Fixp(FixpSenderEndpoint::new(
                connection_id,
                library_id,
                channel,
                &self.config,
                counters.clone(),
                self.errors.clone(),
                now,
            )),
        };
        let receiver =
            ReceiverEndpoint::new(connection_id, self.config.max_inbound_frame, self.errors.clone());

        self.conns.push((
            token,
            Connection::Session(Box::new(SessionPair { connection_id, counters, sender, receiver })),
        ));
        self.next_token += 1;
        self.next_connection_id += 1;
        Ok((token, connection_id))
    }

    fn listen_at(&mut self, addr: SocketAddr, protocol: SessionProtocol) -> Option<Token> {
        let mut listener = TcpListener::bind(addr)
            .inspect_err(|e| warn!("couldn't start listening at {addr:?}: {e}"))
            .ok()?;
        let token = Token(self.next_token);
        self.poll
            .registry()
            .register(&mut listener, token, Interest::READABLE)
            .inspect_err(|err| warn!("couldn't register listening addr {addr:?}: {err}"))
            .ok()?;
        self.conns.push((token, Connection::Listener { listener, protocol }));
        self.next_token += 1;
        Some(token)
    }

    fn connect(
        &mut self,
        addr: SocketAddr,
        library_id: LibraryId,
        protocol: SessionProtocol,
    ) -> Option<ConnectionId> {
        let stream = mio::net::TcpStream::connect(addr)
            .inspect_err(|e| warn!("couldn't connect to {addr}: {e}"))
            .ok()?;
        match self.new_session(stream, addr, protocol, library_id) {
            Ok((_, connection_id)) => {
                debug!(?addr, connection_id, "connection initiated");
                Some(connection_id)
            }
            Err(e) => {
                error!("couldn't set up connection to {addr}: {e}");
                None
            }
        }
    }

    fn disconnect_at_index(&mut self, index: usize, reason: DisconnectReason) {
        let (token, conn) = self.conns.swap_remove(index);
        match conn {
            Connection::Listener { mut listener, .. } => {
                let _ = self.poll.registry().deregister(&mut listener);
            }
            Connection::Session(mut pair) => {
                let _ = self.poll.registry().deregister(pair.sender.channel_mut().stream_mut());
                pair.sender.close();
                self.publisher.on_disconnect(pair.sender.library_id(), pair.connection_id, reason);
                info!(?token, connection_id = pair.connection_id, ?reason, "connection closed");
            }
        }
    }

    fn handle_event(&mut self, e: &Event) {
        let event_token = e.token();
        let Some(index) = self.conns.iter().position(|(t, _)| t == &event_token) else {
            safe_panic!("got event for unknown token");
            return;
        };

        loop {
            match &mut self.conns[index].1 {
                Connection::Session(pair) => {
                    if !e.is_readable() {
                        return;
                    }
                    let state = pair
                        .receiver
                        .poll_read(pair.sender.channel_mut().stream_mut(), &mut self.publisher);
                    if let ConnState::Disconnected(reason) = state {
                        self.disconnect_at_index(index, reason);
                    }
                    return;
                }
                Connection::Listener { listener, protocol } => {
                    let protocol = *protocol;
                    if let Ok((stream, addr)) = listener.accept() {
                        info!(?addr, "client connected");
                        match self.new_session(stream, addr, protocol, ENGINE_LIBRARY_ID) {
                            Ok((_, connection_id)) => {
                                debug!(connection_id, ?addr, "session accepted");
                            }
                            Err(e) => error!("couldn't register accepted client: {e}"),
                        }
                    } else {
                        return;
                    }
                }
            }
        }
    }

    fn poll_senders(&mut self, now: Nanos) {
        let mut i = self.conns.len();
        while i != 0 {
            i -= 1;
            let state = match &mut self.conns[i].1 {
                Connection::Session(pair) => pair.sender.poll(now, &mut self.publisher),
                Connection::Listener { .. } => continue,
            };
            if let ConnState::Disconnected(reason) = state {
                self.disconnect_at_index(i, reason);
            }
        }
    }

    /// Runs `f` on the session's sender, then routes any disconnect it asked
    /// for.
    fn with_session(
        &mut self,
        connection_id: ConnectionId,
        f: impl FnOnce(&mut SessionPair, &mut dyn InboundPublisher, Nanos) -> ConnState,
    ) {
        let now = Nanos::now();
        let Some(index) = self.find_session(connection_id) else {
            error!(connection_id, "no such connection");
            return;
        };
        let state = match &mut self.conns[index].1 {
            Connection::Session(pair) => f(pair, &mut self.publisher, now),
            Connection::Listener { .. } => unreachable!("find_session only returns sessions"),
        };
        if let ConnState::Disconnected(reason) = state {
            self.disconnect_at_index(index, reason);
        }
    }

    fn with_fix(
        &mut self,
        connection_id: ConnectionId,
        f: impl FnOnce(&mut FixSenderEndpoint<SocketChannel>, &mut dyn InboundPublisher, Nanos) -> ConnState,
    ) {
        self.with_session(connection_id, |pair, bus, now| match pair.sender.as_fix_mut() {
            Some(fix) => f(fix, bus, now),
            None => {
                error!(connection_id = pair.connection_id, "not a FIX session");
                ConnState::Alive
            }
        });
    }
}

/// The engine's single-threaded event loop: owns every endpoint, drives mio,
/// dispatches inbound frames, retries outbound backlogs, and routes
/// disconnects. Drive it by calling [`poll_once`] from the host loop.
///
/// [`poll_once`]: Framer::poll_once
pub struct Framer<P: InboundPublisher> {
    events: Events,
    core: FramerCore<P>,
}

impl<P: InboundPublisher> Framer<P> {
    pub fn new(config: EngineConfig, publisher: P) -> Self {
        Self {
            events: Events::with_capacity(128),
            core: FramerCore {
                poll: Poll::new().expect("couldn't set up a poll for the framer"),
                conns: Vec::with_capacity(8),
                next_token: 0,
                next_connection_id: 1,
                config,
                errors: log_error_sink(),
                publisher,
                timing_factory: None,
                stats: Repeater::every(Nanos::from_secs(10)),
            },
        }
    }

    pub fn with_error_sink(mut self, errors: Arc<dyn ErrorSink>) -> Self {
        self.core.errors = errors;
        self
    }

    /// Per-connection timing sink, invoked once per fully flushed live
    /// message.
    pub fn with_timing_factory(mut self, factory: TimingFactory) -> Self {
        self.core.timing_factory = Some(factory);
        self
    }

    /// Starts accepting `protocol` sessions on `addr`.
    pub fn listen_at(&mut self, addr: SocketAddr, protocol: SessionProtocol) -> Option<Token> {
        self.core.listen_at(addr, protocol)
    }

    /// Initiates an outbound session. The socket connects in the background;
    /// writes queue until it is usable.
    pub fn connect(
        &mut self,
        addr: SocketAddr,
        library_id: LibraryId,
        protocol: SessionProtocol,
    ) -> Option<ConnectionId> {
        self.core.connect(addr, library_id, protocol)
    }

    /// One cooperative tick: polls sockets with zero timeout, dispatches
    /// inbound bytes, then gives every sender a retry/watchdog round.
    /// Returns whether any IO events were processed.
    pub fn poll_once(&mut self) -> bool {
        let now = Nanos::now();
        if let Err(e) = self.core.poll.poll(&mut self.events, Some(std::time::Duration::ZERO)) {
            safe_panic!("got error polling {e}");
            return false;
        }

        let mut did_work = false;
        for e in self.events.iter() {
            did_work = true;
            self.core.handle_event(e);
        }
        self.core.poll_senders(now);

        if self.core.stats.fired_at(now) {
            let sessions = self
                .core
                .conns
                .iter()
                .filter(|(_, c)| matches!(c, Connection::Session(_)))
                .count();
            let slow = self
                .core
                .conns
                .iter()
                .filter(|(_, c)| {
                    matches!(c, Connection::Session(pair) if pair.sender.is_slow_consumer())
                })
                .count();
            debug!(sessions, slow, "framer heartbeat");
        }
        did_work
    }

    /// Coordinated teardown of both endpoints of a connection.
    pub fn complete_disconnect(&mut self, connection_id: ConnectionId, reason: DisconnectReason) {
        if let Some(index) = self.core.find_session(connection_id) {
            self.core.disconnect_at_index(index, reason);
        }
    }

    /// Host-requested close.
    pub fn admin_close(&mut self, connection_id: ConnectionId) {
        self.complete_disconnect(connection_id, DisconnectReason::AdminClose);
    }

    /// Hands ownership of the connection to a library; submissions carrying
    /// any other library id are dropped and counted.
    pub fn bind_library(&mut self, connection_id: ConnectionId, library_id: LibraryId) {
        self.core.with_session(connection_id, |pair, _, _| {
            pair.sender.bind_library(library_id);
            ConnState::Alive
        });
    }

    /// Session identity for a FIX connection, set once at logon.
    pub fn on_logon(&mut self, connection_id: ConnectionId, session_id: SessionId, key: SessionKey) {
        self.core.with_fix(connection_id, |fix, _, _| {
            fix.on_logon(session_id, key);
            ConnState::Alive
        });
    }

    pub fn on_outbound_message(
        &mut self,
        connection_id: ConnectionId,
        library_id: LibraryId,
        seq: u32,
        body: &[u8],
        meta: &[u8],
    ) {
        self.core.with_fix(connection_id, |fix, bus, now| {
            fix.on_outbound_message(library_id, seq, body, meta, now, bus)
        });
    }

    pub fn on_replay_message(&mut self, connection_id: ConnectionId, seq: u32, body: &[u8]) {
        self.core
            .with_fix(connection_id, |fix, bus, now| fix.on_replay_message(seq, body, now, bus));
    }

    pub fn on_start_replay(&mut self, connection_id: ConnectionId, correlation_id: u64) {
        self.core.with_fix(connection_id, |fix, bus, _| fix.on_start_replay(correlation_id, bus));
    }

    pub fn on_replay_complete(&mut self, connection_id: ConnectionId, correlation_id: u64) {
        self.core.with_fix(connection_id, |fix, bus, now| {
            fix.on_replay_complete(correlation_id, now, bus)
        });
    }

    #[allow(clippy::too_many_arguments)]
    pub fn on_throttle_reject(
        &mut self,
        connection_id: ConnectionId,
        library_id: LibraryId,
        ref_msg_type: &[u8],
        ref_seq_num: u32,
        seq: u32,
        reject_ref_id: &[u8],
    ) {
        self.core.with_fix(connection_id, |fix, bus, now| {
            fix.on_throttle_reject(library_id, ref_msg_type, ref_seq_num, seq, reject_ref_id, now, bus)
        });
    }

    pub fn on_valid_resend_request(&mut self, connection_id: ConnectionId, correlation_id: u64) {
        self.core.with_fix(connection_id, |fix, _, _| {
            fix.on_valid_resend_request(correlation_id);
            ConnState::Alive
        });
    }

    pub fn configure_throttle(
        &mut self,
        connection_id: ConnectionId,
        window: Nanos,
        limit: usize,
    ) {
        self.core.with_fix(connection_id, |fix, _, _| {
            fix.configure_throttle(window, limit);
            ConnState::Alive
        });
    }

    /// Sends a FIXP frame on a binary session.
    pub fn on_fixp_message(
        &mut self,
        connection_id: ConnectionId,
        library_id: LibraryId,
        body: &[u8],
    ) {
        self.core.with_session(connection_id, |pair, bus, now| match &mut pair.sender {
            SenderEndpoint::Fixp(fixp) => fixp.on_message(library_id, body, now, bus),
            SenderEndpoint::Fix(_) => {
                error!(connection_id = pair.connection_id, "not a FIXP session");
                ConnState::Alive
            }
        });
    }

    /// Exported counters of a live connection.
    pub fn counters(&self, connection_id: ConnectionId) -> Option<Arc<SenderCounters>> {
        let index = self.core.find_session(connection_id)?;
        match &self.core.conns[index].1 {
            Connection::Session(pair) => Some(pair.counters.clone()),
            Connection::Listener { .. } => None,
        }
    }

    pub fn is_slow_consumer(&self, connection_id: ConnectionId) -> bool {
        self.core
            .find_session(connection_id)
            .is_some_and(|index| match &self.core.conns[index].1 {
                Connection::Session(pair) => pair.sender.is_slow_consumer(),
                Connection::Listener { .. } => false,
            })
    }

    /// Connection ids of all live sessions, accept order not guaranteed.
    pub fn connection_ids(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.core.conns.iter().filter_map(|(_, c)| match c {
            Connection::Session(pair) => Some(pair.connection_id),
            Connection::Listener { .. } => None,
        })
    }

    pub fn publisher_mut(&mut self) -> &mut P {
        &mut self.core.publisher
    }
}

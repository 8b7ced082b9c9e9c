// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! The connection actor: owns the session state and drives the protocol.
//!
//! Three tasks cooperate per connection. The reader pulls bytes from the
//! transport, frames and decodes them and pushes the result onto the inbound
//! queue. The writer drains the outbound queue onto the transport. The
//! dispatcher, running in [`Connection::run`], consumes the inbound queue
//! and the command channel, drives the acknowledgement flows and the timers,
//! and is the only task that touches session state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use codec::topic::SubTopic;
use codec::{
    AuthPacket, BinaryData, ControlPacket, DisconnectPacket, EncodePacket, Packet, PacketId,
    PacketType, PingRequestPacket, Property, PublishAckPacket, PublishCompletePacket,
    PublishPacket, PublishReceivedPacket, PublishReleasePacket, QoS, ReasonCode, StringData,
    SubscribePacket, SubscribeTopic, UnsubscribePacket, VarInt, MAX_PACKET_LEN,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::client::DisconnectOptions;
use crate::connect_options::ConnectOptions;
use crate::error::{Error, ErrorKind};
use crate::event::{ClientEvent, EventBus};
use crate::framer::{Frame, Framer};
use crate::queue::{CancelToken, InFlightWindow, PacketQueue};
use crate::session::{AckState, BrokerCapabilities, OutgoingPublish, SessionState};
use crate::stream::Stream;
use crate::subscription::{MessageHandler, ReceivedMessage, SubscriptionRegistry};

/// Connection life cycle, observable through [`crate::AsyncClient::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
    Disconnecting,

    /// The reconnect budget is exhausted; the client will not try again.
    FailedForever,
}

/// Result of a completed connect exchange.
#[derive(Debug, Clone)]
pub struct ConnectResult {
    pub reason_code: ReasonCode,
    pub session_present: bool,
    pub broker: BrokerCapabilities,
}

/// Terminal outcome of one publish flow.
#[derive(Debug, Clone, Default)]
pub struct PublishResult {
    /// Reason code of the terminal acknowledgement; `None` for `QoS` 0.
    ///
    /// An error code still terminates the flow; it is surfaced here rather
    /// than through `Err` so the caller can tell a refused publish from a
    /// failed one.
    pub reason_code: Option<ReasonCode>,
    pub reason_string: Option<String>,
}

/// Requests sent from the client facade to the dispatcher.
pub(crate) enum Command {
    PublishQos0 {
        packet: PublishPacket,
        tx: oneshot::Sender<Result<PublishResult, Error>>,
    },
    /// The record was already placed in the in-flight window by the caller;
    /// the dispatcher serializes and sends it.
    PublishQos {
        packet_id: PacketId,
        tx: oneshot::Sender<Result<PublishResult, Error>>,
    },
    Subscribe {
        topics: Vec<SubscribeTopic>,
        handler: Option<MessageHandler>,
        tx: oneshot::Sender<Result<Vec<ReasonCode>, Error>>,
    },
    Unsubscribe {
        filters: Vec<String>,
        tx: oneshot::Sender<Result<Vec<ReasonCode>, Error>>,
    },
    Disconnect {
        options: DisconnectOptions,
        tx: oneshot::Sender<Result<(), Error>>,
    },
}

/// What the reader hands to the dispatcher.
enum InboundEvent {
    Frame(Frame),
    /// Transport EOF or error; the connection is gone.
    Closed(Option<Error>),
}

/// Why a connected session ended.
enum SessionEnd {
    UserDisconnect,
    ConnectionLost(Error),
}

enum Wake {
    Inbound(Result<InboundEvent, Error>),
    Cmd(Option<Command>),
    Tick,
}

struct PendingSubscribe {
    topics: Vec<SubscribeTopic>,
    handler: Option<MessageHandler>,
    subscription_id: Option<usize>,
    tx: oneshot::Sender<Result<Vec<ReasonCode>, Error>>,
}

struct PendingUnsubscribe {
    filters: Vec<String>,
    tx: oneshot::Sender<Result<Vec<ReasonCode>, Error>>,
}

/// Handles of one live transport connection.
struct Link {
    inbound: PacketQueue<InboundEvent>,
    outbound: PacketQueue<Vec<u8>>,
    cancel: CancelToken,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,

    /// Instant of the last successful write, updated by the writer task.
    last_write: Arc<Mutex<Instant>>,

    /// Effective keep alive: the ServerKeepAlive override when present,
    /// the configured value otherwise. Zero disables the mechanism.
    keep_alive: Duration,
    ping_sent_at: Option<Instant>,
}

impl Link {
    /// How long the dispatcher may sleep before the next keep-alive action.
    fn next_keep_alive_delay(&self) -> Duration {
        if self.keep_alive.is_zero() {
            return Duration::from_secs(3600);
        }
        let deadline = match self.ping_sent_at {
            Some(sent_at) => sent_at + self.keep_alive * 3 / 2,
            None => *self.last_write.lock().unwrap() + self.keep_alive,
        };
        deadline.saturating_duration_since(Instant::now())
    }

    /// Let the writer drain, then stop both tasks.
    async fn shutdown(&mut self) {
        for _ in 0..50 {
            if self.outbound.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.cancel.cancel();
        let _ = tokio::time::timeout(Duration::from_millis(500), &mut self.reader).await;
        let _ = tokio::time::timeout(Duration::from_millis(500), &mut self.writer).await;
        self.reader.abort();
        self.writer.abort();
    }
}

pub(crate) struct Connection {
    options: ConnectOptions,
    window: InFlightWindow<OutgoingPublish>,
    registry: Arc<Mutex<SubscriptionRegistry>>,
    events: EventBus,
    cmd_rx: mpsc::Receiver<Command>,
    state_tx: watch::Sender<ConnectionState>,
    stop: CancelToken,

    session: SessionState,
    publish_waiters: HashMap<u16, oneshot::Sender<Result<PublishResult, Error>>>,
    pending_subscribes: HashMap<u16, PendingSubscribe>,
    pending_unsubscribes: HashMap<u16, PendingUnsubscribe>,

    /// Set when the server sent a DISCONNECT packet.
    remote_disconnect_reason: Option<ReasonCode>,

    /// True once a session was established; a later CONNACK without
    /// SessionPresent then means the session was lost.
    had_session: bool,
}

impl Connection {
    pub(crate) fn new(
        options: ConnectOptions,
        window: InFlightWindow<OutgoingPublish>,
        registry: Arc<Mutex<SubscriptionRegistry>>,
        events: EventBus,
        cmd_rx: mpsc::Receiver<Command>,
        state_tx: watch::Sender<ConnectionState>,
        stop: CancelToken,
    ) -> Self {
        Self {
            options,
            window,
            registry,
            events,
            cmd_rx,
            state_tx,
            stop,
            session: SessionState::new(),
            publish_waiters: HashMap::new(),
            pending_subscribes: HashMap::new(),
            pending_unsubscribes: HashMap::new(),
            remote_disconnect_reason: None,
            had_session: false,
        }
    }

    /// Drive the connection until the user disconnects or the reconnect
    /// budget is exhausted. The first connect result is reported through
    /// `connect_tx`.
    pub(crate) async fn run(mut self, connect_tx: oneshot::Sender<Result<ConnectResult, Error>>) {
        let mut link = match self.establish().await {
            Ok((link, result)) => {
                let _ = connect_tx.send(Ok(result));
                link
            }
            Err(err) => {
                let _ = self.state_tx.send(ConnectionState::Disconnected);
                let _ = connect_tx.send(Err(err));
                return;
            }
        };

        loop {
            let end = self.run_connected(&mut link).await;
            link.shutdown().await;
            self.fail_pending_exchanges();
            let reason_code = self.remote_disconnect_reason.take();
            self.events.emit(ClientEvent::AfterDisconnect { reason_code });

            match end {
                SessionEnd::UserDisconnect => {
                    let _ = self.state_tx.send(ConnectionState::Disconnected);
                    self.fail_all_publishes(&Error::new(
                        ErrorKind::Canceled,
                        "client disconnected",
                    ));
                    return;
                }
                SessionEnd::ConnectionLost(err) => {
                    log::warn!("connection: lost: {err}");
                    if !self.options.auto_reconnect() {
                        let _ = self.state_tx.send(ConnectionState::Disconnected);
                        self.fail_all_publishes(&err);
                        return;
                    }
                    match self.reconnect().await {
                        Ok(new_link) => link = new_link,
                        Err(err) => {
                            log::error!("connection: giving up reconnecting: {err}");
                            let _ = self.state_tx.send(ConnectionState::FailedForever);
                            self.fail_all_publishes(&err);
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Open the transport, run the CONNECT/CONNACK exchange and start the
    /// reader and writer tasks.
    async fn establish(&mut self) -> Result<(Link, ConnectResult), Error> {
        self.events.emit(ClientEvent::BeforeConnect);
        let _ = self.state_tx.send(ConnectionState::Connecting);

        let stream = tokio::time::timeout(
            self.options.connect_timeout(),
            Stream::connect(&self.options),
        )
        .await??;

        let (read_half, write_half) = tokio::io::split(stream);
        let cancel = CancelToken::new();
        let inbound = PacketQueue::new();
        let outbound = PacketQueue::new();
        let last_write = Arc::new(Mutex::new(Instant::now()));
        let max_packet_size = self
            .options
            .maximum_packet_size()
            .map_or(MAX_PACKET_LEN, |bytes| bytes as usize);

        let reader = tokio::spawn(reader_loop(
            read_half,
            Framer::new(max_packet_size),
            inbound.clone(),
            cancel.clone(),
        ));
        let writer = tokio::spawn(writer_loop(
            write_half,
            outbound.clone(),
            inbound.clone(),
            cancel.clone(),
            Arc::clone(&last_write),
        ));

        let mut link = Link {
            inbound,
            outbound,
            cancel,
            reader,
            writer,
            last_write,
            keep_alive: Duration::from_secs(u64::from(self.options.keep_alive())),
            ping_sent_at: None,
        };

        let connect_packet = self.options.to_connect_packet()?;
        if let Err(err) = self.push_packet(&link, &connect_packet) {
            link.shutdown().await;
            return Err(err);
        }
        let _ = self.state_tx.send(ConnectionState::Authenticating);

        match tokio::time::timeout(
            self.options.connect_timeout(),
            self.wait_connect_ack(&mut link),
        )
        .await
        {
            Ok(Ok(result)) => Ok((link, result)),
            Ok(Err(err)) => {
                link.shutdown().await;
                Err(err)
            }
            Err(_elapsed) => {
                link.shutdown().await;
                Err(Error::new(
                    ErrorKind::Timeout,
                    "timed out waiting for CONNACK",
                ))
            }
        }
    }

    async fn wait_connect_ack(&mut self, link: &mut Link) -> Result<ConnectResult, Error> {
        let inbound = link.inbound.clone();
        let cancel = link.cancel.clone();
        loop {
            match inbound.pop(&cancel).await? {
                InboundEvent::Closed(err) => {
                    return Err(err.unwrap_or_else(|| {
                        Error::new(ErrorKind::Transport, "connection closed before CONNACK")
                    }));
                }
                InboundEvent::Frame(Frame::Malformed(_bytes)) => {
                    let _ = self.push_packet(
                        link,
                        &DisconnectPacket::with_reason(ReasonCode::MalformedPacket),
                    );
                    return Err(Error::new(
                        ErrorKind::Protocol,
                        "malformed packet before CONNACK",
                    ));
                }
                InboundEvent::Frame(Frame::Packet(ControlPacket::Auth(auth))) => {
                    self.events.emit(ClientEvent::PacketReceived {
                        packet_type: PacketType::Auth,
                    });
                    if auth.reason_code() != ReasonCode::ContinueAuthentication {
                        return Err(Error::new(
                            ErrorKind::Protocol,
                            "unexpected AUTH reason during connect",
                        ));
                    }
                    let reply = self.auth_reply()?;
                    self.push_packet(link, &reply)?;
                }
                InboundEvent::Frame(Frame::Packet(ControlPacket::ConnectAck(ack))) => {
                    self.events.emit(ClientEvent::PacketReceived {
                        packet_type: PacketType::ConnectAck,
                    });
                    return self.apply_connect_ack(link, &ack);
                }
                InboundEvent::Frame(Frame::Packet(other)) => {
                    return Err(Error::from_string(
                        ErrorKind::Protocol,
                        format!(
                            "unexpected {:?} before CONNACK",
                            other.packet_type()
                        ),
                    ));
                }
            }
        }
    }

    fn apply_connect_ack(
        &mut self,
        link: &mut Link,
        ack: &codec::ConnectAckPacket,
    ) -> Result<ConnectResult, Error> {
        if ack.reason_code().is_error() {
            return Err(Error::refused(
                ack.reason_code(),
                "server refused the connection",
            ));
        }

        let caps = BrokerCapabilities::from_connect_ack(ack);
        self.window.set_capacity(usize::from(caps.receive_maximum));
        let keep_alive = caps.server_keep_alive.unwrap_or(self.options.keep_alive());
        link.keep_alive = Duration::from_secs(u64::from(keep_alive));
        link.ping_sent_at = None;
        self.session.broker_caps = caps.clone();
        self.session.reset_connection_state();

        if ack.session_present() {
            if self.options.clean_start() && !self.had_session {
                log::warn!("connection: server kept a session despite clean start");
            }
            self.resume_in_flight(link);
        } else {
            if self.had_session && !self.options.clean_start() {
                self.fail_in_flight_session_lost();
            }
            self.session.reset_session();
            self.registry.lock().unwrap().reset_identifiers();
        }
        self.had_session = true;

        let _ = self.state_tx.send(ConnectionState::Connected);
        self.events.emit(ClientEvent::AfterConnect {
            reason_code: ack.reason_code(),
            session_present: ack.session_present(),
        });
        Ok(ConnectResult {
            reason_code: ack.reason_code(),
            session_present: ack.session_present(),
            broker: caps,
        })
    }

    async fn run_connected(&mut self, link: &mut Link) -> SessionEnd {
        loop {
            let inbound = link.inbound.clone();
            let cancel = link.cancel.clone();
            let delay = link.next_keep_alive_delay();

            let wake = tokio::select! {
                event = inbound.pop(&cancel) => Wake::Inbound(event),
                cmd = self.cmd_rx.recv() => Wake::Cmd(cmd),
                () = tokio::time::sleep(delay) => Wake::Tick,
            };

            match wake {
                Wake::Inbound(Ok(InboundEvent::Frame(frame))) => {
                    if let Some(end) = self.handle_frame(link, frame) {
                        return end;
                    }
                }
                Wake::Inbound(Ok(InboundEvent::Closed(err))) => {
                    return SessionEnd::ConnectionLost(err.unwrap_or_else(|| {
                        Error::new(ErrorKind::Transport, "connection closed by peer")
                    }));
                }
                Wake::Inbound(Err(err)) => return SessionEnd::ConnectionLost(err),
                Wake::Cmd(Some(cmd)) => {
                    if let Some(end) = self.handle_command(link, cmd) {
                        return end;
                    }
                }
                Wake::Cmd(None) => {
                    // Client handle dropped; leave cleanly.
                    let _ = self.push_packet(link, &DisconnectPacket::new());
                    return SessionEnd::UserDisconnect;
                }
                Wake::Tick => {
                    if let Some(end) = self.handle_keep_alive(link) {
                        return end;
                    }
                }
            }
        }
    }

    fn handle_frame(&mut self, link: &mut Link, frame: Frame) -> Option<SessionEnd> {
        let packet = match frame {
            Frame::Malformed(bytes) => {
                log::error!("connection: malformed packet of {} bytes", bytes.len());
                return Some(self.close_with(link, ReasonCode::MalformedPacket));
            }
            Frame::Packet(packet) => packet,
        };
        self.events.emit(ClientEvent::PacketReceived {
            packet_type: packet.packet_type(),
        });

        match packet {
            ControlPacket::Publish(publish) => self.handle_publish(link, &publish),
            ControlPacket::PublishAck(ack) => {
                self.handle_publish_ack(&ack);
                None
            }
            ControlPacket::PublishReceived(received) => {
                self.handle_publish_received(link, &received);
                None
            }
            ControlPacket::PublishRelease(release) => {
                self.handle_publish_release(link, &release);
                None
            }
            ControlPacket::PublishComplete(complete) => {
                self.handle_publish_complete(&complete);
                None
            }
            ControlPacket::SubscribeAck(ack) => {
                self.handle_subscribe_ack(&ack);
                None
            }
            ControlPacket::UnsubscribeAck(ack) => {
                self.handle_unsubscribe_ack(&ack);
                None
            }
            ControlPacket::PingResponse(_) => {
                link.ping_sent_at = None;
                None
            }
            ControlPacket::Disconnect(disconnect) => {
                log::warn!(
                    "connection: server disconnect, reason {:?}",
                    disconnect.reason_code()
                );
                self.remote_disconnect_reason = Some(disconnect.reason_code());
                Some(SessionEnd::ConnectionLost(Error::from_string(
                    ErrorKind::Transport,
                    format!(
                        "server closed the connection: {:?}",
                        disconnect.reason_code()
                    ),
                )))
            }
            ControlPacket::Auth(auth) => {
                if auth.reason_code() == ReasonCode::ContinueAuthentication {
                    match self.auth_reply() {
                        Ok(reply) => {
                            let _ = self.push_packet(link, &reply);
                            None
                        }
                        Err(_err) => Some(self.close_with(link, ReasonCode::ProtocolError)),
                    }
                } else {
                    Some(self.close_with(link, ReasonCode::ProtocolError))
                }
            }
            ControlPacket::Connect(_)
            | ControlPacket::ConnectAck(_)
            | ControlPacket::Subscribe(_)
            | ControlPacket::Unsubscribe(_)
            | ControlPacket::PingRequest(_) => {
                log::error!(
                    "connection: unexpected {:?} from server",
                    packet.packet_type()
                );
                Some(self.close_with(link, ReasonCode::ProtocolError))
            }
        }
    }

    /// Inbound publish pipeline: resolve the topic alias, dispatch to
    /// matching handlers and send the acknowledgement the `QoS` asks for.
    fn handle_publish(&mut self, link: &Link, packet: &PublishPacket) -> Option<SessionEnd> {
        let topic = match self.resolve_topic(packet) {
            Ok(topic) => topic,
            Err(reason_code) => return Some(self.close_with(link, reason_code)),
        };

        match packet.qos() {
            QoS::AtMostOnce => {
                self.dispatch_message(packet, &topic);
                None
            }
            QoS::AtLeastOnce => {
                let matched = self.dispatch_message(packet, &topic);
                let mut ack = PublishAckPacket::new(packet.packet_id());
                if matched == 0 {
                    ack.set_reason_code(ReasonCode::NoMatchingSubscribers);
                }
                if let Err(err) = self.push_packet(link, &ack) {
                    log::error!("connection: failed to queue PUBACK: {err}");
                }
                None
            }
            QoS::ExactOnce => {
                let packet_id = packet.packet_id().value();
                let mut reason_code = ReasonCode::Success;
                if self.session.incoming_contains(packet_id) {
                    // The first PUBREC was lost; answer again but do not
                    // dispatch a second time.
                    log::info!("dispatch: duplicate QoS 2 publish, id {packet_id}");
                } else {
                    if self.session.incoming_len() >= usize::from(self.options.receive_maximum()) {
                        log::error!("dispatch: server exceeded our receive maximum");
                        return Some(self.close_with(link, ReasonCode::ReceiveMaximumExceeded));
                    }
                    self.session.incoming_insert(packet_id);
                    if self.dispatch_message(packet, &topic) == 0 {
                        reason_code = ReasonCode::NoMatchingSubscribers;
                    }
                }
                let mut received = PublishReceivedPacket::new(packet.packet_id());
                received.set_reason_code(reason_code);
                if let Err(err) = self.push_packet(link, &received) {
                    log::error!("connection: failed to queue PUBREC: {err}");
                }
                None
            }
        }
    }

    /// Map a publish packet to its topic name, maintaining the inbound
    /// topic alias table.
    fn resolve_topic(&mut self, packet: &PublishPacket) -> Result<String, ReasonCode> {
        let alias = packet.properties().topic_alias();
        if packet.topic().is_empty() {
            // A zero length topic is only valid with an established alias.
            let Some(alias) = alias else {
                return Err(ReasonCode::ProtocolError);
            };
            match self.session.alias_lookup(alias) {
                Some(topic) => Ok(topic.to_string()),
                None => Err(ReasonCode::TopicAliasInvalid),
            }
        } else {
            if let Some(alias) = alias {
                if alias == 0 || alias > self.options.topic_alias_maximum() {
                    return Err(ReasonCode::TopicAliasInvalid);
                }
                self.session.alias_insert(alias, packet.topic().to_string());
            }
            Ok(packet.topic().to_string())
        }
    }

    /// Invoke matching handlers and emit the message event.
    ///
    /// Returns the number of matching subscriptions.
    fn dispatch_message(&mut self, packet: &PublishPacket, topic: &str) -> usize {
        let (matched, handlers) = self.registry.lock().unwrap().find_matches(topic);
        let message = ReceivedMessage::from_packet(packet, topic);
        for handler in &handlers {
            handler(&message);
        }
        self.events.emit(ClientEvent::MessageReceived(message));
        matched
    }

    fn handle_publish_ack(&mut self, ack: &PublishAckPacket) {
        let packet_id = ack.packet_id();
        if self.window.remove(packet_id).is_none() {
            log::warn!("connection: PUBACK for unknown id {packet_id}");
            return;
        }
        self.resolve_publish(
            packet_id.value(),
            Ok(PublishResult {
                reason_code: Some(ack.reason_code()),
                reason_string: ack.properties().reason_string().map(ToString::to_string),
            }),
        );
    }

    fn handle_publish_received(&mut self, link: &Link, received: &PublishReceivedPacket) {
        let packet_id = received.packet_id();
        if received.reason_code().is_error() {
            // The flow dies here; no PUBREL is sent and the id is released.
            if self.window.remove(packet_id).is_none() {
                log::warn!("connection: PUBREC for unknown id {packet_id}");
                return;
            }
            self.resolve_publish(
                packet_id.value(),
                Ok(PublishResult {
                    reason_code: Some(received.reason_code()),
                    reason_string: received
                        .properties()
                        .reason_string()
                        .map(ToString::to_string),
                }),
            );
            return;
        }

        let advanced = self.window.update(packet_id, |record| {
            if record.qos == QoS::ExactOnce {
                record.state = AckState::PendingComp;
                true
            } else {
                false
            }
        });
        match advanced {
            Some(true) => {
                let release = PublishReleasePacket::new(packet_id);
                if let Err(err) = self.push_packet(link, &release) {
                    log::error!("connection: failed to queue PUBREL: {err}");
                }
            }
            Some(false) => {
                log::warn!("connection: PUBREC for a QoS 1 flow, id {packet_id}");
            }
            None => {
                log::warn!("connection: PUBREC for unknown id {packet_id}");
            }
        }
    }

    fn handle_publish_release(&mut self, link: &Link, release: &PublishReleasePacket) {
        let packet_id = release.packet_id();
        let mut complete = PublishCompletePacket::new(packet_id);
        if !self.session.incoming_remove(packet_id.value()) {
            complete.set_reason_code(ReasonCode::PacketIdentifierNotFound);
        }
        if let Err(err) = self.push_packet(link, &complete) {
            log::error!("connection: failed to queue PUBCOMP: {err}");
        }
    }

    fn handle_publish_complete(&mut self, complete: &PublishCompletePacket) {
        let packet_id = complete.packet_id();
        if self.window.remove(packet_id).is_none() {
            log::warn!("connection: PUBCOMP for unknown id {packet_id}");
            return;
        }
        self.resolve_publish(
            packet_id.value(),
            Ok(PublishResult {
                reason_code: Some(complete.reason_code()),
                reason_string: complete
                    .properties()
                    .reason_string()
                    .map(ToString::to_string),
            }),
        );
    }

    fn handle_subscribe_ack(&mut self, ack: &codec::SubscribeAckPacket) {
        let packet_id = ack.packet_id();
        let Some(pending) = self.pending_subscribes.remove(&packet_id.value()) else {
            log::warn!("connection: SUBACK for unknown id {packet_id}");
            return;
        };
        self.window.release_id(packet_id);

        let reason_codes = ack.reason_codes().to_vec();
        if reason_codes.len() != pending.topics.len() {
            log::warn!(
                "connection: SUBACK carries {} codes for {} filters",
                reason_codes.len(),
                pending.topics.len()
            );
        }

        let mut registry = self.registry.lock().unwrap();
        for (topic, reason_code) in pending.topics.iter().zip(reason_codes.iter()) {
            if reason_code.is_error() {
                continue;
            }
            match SubTopic::parse(topic.filter()) {
                Ok(filter) => registry.add(
                    filter,
                    topic.qos(),
                    pending.subscription_id,
                    pending.handler.clone(),
                ),
                Err(err) => log::error!("connection: bad filter in SUBACK path: {err:?}"),
            }
        }
        drop(registry);

        let filters: Vec<String> = pending
            .topics
            .iter()
            .map(|topic| topic.filter().to_string())
            .collect();
        self.events.emit(ClientEvent::AfterSubscribe {
            filters,
            reason_codes: reason_codes.clone(),
        });
        let _ = pending.tx.send(Ok(reason_codes));
    }

    fn handle_unsubscribe_ack(&mut self, ack: &codec::UnsubscribeAckPacket) {
        let packet_id = ack.packet_id();
        let Some(pending) = self.pending_unsubscribes.remove(&packet_id.value()) else {
            log::warn!("connection: UNSUBACK for unknown id {packet_id}");
            return;
        };
        self.window.release_id(packet_id);

        let reason_codes = ack.reason_codes().to_vec();
        self.registry.lock().unwrap().remove(&pending.filters);
        self.events.emit(ClientEvent::AfterUnsubscribe {
            filters: pending.filters,
            reason_codes: reason_codes.clone(),
        });
        let _ = pending.tx.send(Ok(reason_codes));
    }

    fn handle_command(&mut self, link: &Link, cmd: Command) -> Option<SessionEnd> {
        match cmd {
            Command::PublishQos0 { packet, tx } => {
                let result = self
                    .push_packet(link, &packet)
                    .map(|()| PublishResult::default());
                let _ = tx.send(result);
                None
            }
            Command::PublishQos { packet_id, tx } => {
                self.publish_waiters.insert(packet_id.value(), tx);
                let encoded = self.window.update(packet_id, |record| {
                    record.packet.set_packet_id(packet_id);
                    if record.send_count > 0 {
                        let _ = record.packet.set_dup(true);
                    }
                    record.send_count += 1;
                    record.last_sent_at = Instant::now();
                    encode_packet(&record.packet)
                        .map(|bytes| (bytes, record.packet.packet_type()))
                });
                match encoded {
                    Some(Ok((bytes, packet_type))) => {
                        link.outbound.push(bytes);
                        self.events.emit(ClientEvent::PacketSent { packet_type });
                    }
                    Some(Err(err)) => {
                        self.window.remove(packet_id);
                        self.resolve_publish(packet_id.value(), Err(err));
                    }
                    None => {
                        self.resolve_publish(
                            packet_id.value(),
                            Err(Error::new(ErrorKind::Canceled, "publish record is gone")),
                        );
                    }
                }
                None
            }
            Command::Subscribe {
                topics,
                handler,
                tx,
            } => {
                self.handle_subscribe_command(link, topics, handler, tx);
                None
            }
            Command::Unsubscribe { filters, tx } => {
                self.handle_unsubscribe_command(link, filters, tx);
                None
            }
            Command::Disconnect { options, tx } => {
                let _ = self.state_tx.send(ConnectionState::Disconnecting);
                let result = options
                    .to_packet()
                    .and_then(|packet| self.push_packet(link, &packet));
                let _ = tx.send(result);
                Some(SessionEnd::UserDisconnect)
            }
        }
    }

    fn handle_subscribe_command(
        &mut self,
        link: &Link,
        topics: Vec<SubscribeTopic>,
        handler: Option<MessageHandler>,
        tx: oneshot::Sender<Result<Vec<ReasonCode>, Error>>,
    ) {
        let caps = &self.session.broker_caps;
        for topic in &topics {
            let Ok(filter) = SubTopic::parse(topic.filter()) else {
                let _ = tx.send(Err(Error::from_string(
                    ErrorKind::Validation,
                    format!("invalid topic filter: {}", topic.filter()),
                )));
                return;
            };
            if filter.has_wildcard() && !caps.wildcard_subscription_available {
                let _ = tx.send(Err(Error::new(
                    ErrorKind::Validation,
                    "server does not support wildcard subscriptions",
                )));
                return;
            }
            if filter.is_shared() && !caps.shared_subscription_available {
                let _ = tx.send(Err(Error::new(
                    ErrorKind::Validation,
                    "server does not support shared subscriptions",
                )));
                return;
            }
        }

        let packet_id = match self.window.reserve_id() {
            Ok(packet_id) => packet_id,
            Err(err) => {
                let _ = tx.send(Err(err));
                return;
            }
        };
        let subscription_id = if self.session.broker_caps.subscription_identifier_available {
            Some(self.registry.lock().unwrap().next_subscription_id())
        } else {
            None
        };

        let mut packet = SubscribePacket::with_topics(packet_id, topics.clone());
        if let Some(subscription_id) = subscription_id {
            match VarInt::from(subscription_id) {
                Ok(value) => {
                    packet
                        .properties_mut()
                        .push(Property::SubscriptionIdentifier(value));
                }
                Err(_err) => {
                    self.window.release_id(packet_id);
                    let _ = tx.send(Err(Error::new(
                        ErrorKind::Validation,
                        "subscription identifier space exhausted",
                    )));
                    return;
                }
            }
        }

        let filters: Vec<String> = topics
            .iter()
            .map(|topic| topic.filter().to_string())
            .collect();
        self.events
            .emit(ClientEvent::BeforeSubscribe { filters });

        if let Err(err) = self.push_packet(link, &packet) {
            self.window.release_id(packet_id);
            let _ = tx.send(Err(err));
            return;
        }
        self.pending_subscribes.insert(
            packet_id.value(),
            PendingSubscribe {
                topics,
                handler,
                subscription_id,
                tx,
            },
        );
    }

    fn handle_unsubscribe_command(
        &mut self,
        link: &Link,
        filters: Vec<String>,
        tx: oneshot::Sender<Result<Vec<ReasonCode>, Error>>,
    ) {
        let packet_id = match self.window.reserve_id() {
            Ok(packet_id) => packet_id,
            Err(err) => {
                let _ = tx.send(Err(err));
                return;
            }
        };
        let refs: Vec<&str> = filters.iter().map(String::as_str).collect();
        let packet = match UnsubscribePacket::with_topics(packet_id, &refs) {
            Ok(packet) => packet,
            Err(err) => {
                self.window.release_id(packet_id);
                let _ = tx.send(Err(err.into()));
                return;
            }
        };

        self.events.emit(ClientEvent::BeforeUnsubscribe {
            filters: filters.clone(),
        });
        if let Err(err) = self.push_packet(link, &packet) {
            self.window.release_id(packet_id);
            let _ = tx.send(Err(err));
            return;
        }
        self.pending_unsubscribes
            .insert(packet_id.value(), PendingUnsubscribe { filters, tx });
    }

    fn handle_keep_alive(&mut self, link: &mut Link) -> Option<SessionEnd> {
        if link.keep_alive.is_zero() {
            return None;
        }
        let now = Instant::now();
        if let Some(sent_at) = link.ping_sent_at {
            if now >= sent_at + link.keep_alive * 3 / 2 {
                return Some(SessionEnd::ConnectionLost(Error::new(
                    ErrorKind::Timeout,
                    "no PINGRESP within 1.5 keep-alive intervals",
                )));
            }
            return None;
        }
        let last_write = *link.last_write.lock().unwrap();
        if now >= last_write + link.keep_alive {
            if let Err(err) = self.push_packet(link, &PingRequestPacket::new()) {
                return Some(SessionEnd::ConnectionLost(err));
            }
            link.ping_sent_at = Some(now);
        }
        None
    }

    /// Re-send unacknowledged flows after the server resumed the session,
    /// in original publish order.
    fn resume_in_flight(&mut self, link: &Link) {
        let mut records = self.window.snapshot();
        records.sort_by_key(|(_, record)| record.seq);
        for (packet_id, record) in records {
            // A record never sent is still queued as a command; it goes out
            // through the normal path without DUP.
            if record.send_count == 0 {
                continue;
            }
            match record.state {
                AckState::PendingAck | AckState::PendingRec => {
                    let encoded = self.window.update(packet_id, |rec| {
                        let _ = rec.packet.set_dup(true);
                        rec.send_count += 1;
                        rec.last_sent_at = Instant::now();
                        encode_packet(&rec.packet).map(|bytes| (bytes, rec.packet.packet_type()))
                    });
                    match encoded {
                        Some(Ok((bytes, packet_type))) => {
                            link.outbound.push(bytes);
                            self.events.emit(ClientEvent::PacketSent { packet_type });
                        }
                        Some(Err(err)) => {
                            log::error!("connection: failed to re-encode publish {packet_id}: {err}");
                        }
                        None => {}
                    }
                }
                AckState::PendingComp => {
                    let release = PublishReleasePacket::new(packet_id);
                    if let Err(err) = self.push_packet(link, &release) {
                        log::error!("connection: failed to queue PUBREL {packet_id}: {err}");
                    }
                }
            }
        }
    }

    fn auth_reply(&self) -> Result<AuthPacket, Error> {
        let Some(method) = self.options.authentication_method() else {
            return Err(Error::new(
                ErrorKind::Protocol,
                "server started an AUTH exchange without an agreed method",
            ));
        };
        let mut reply = AuthPacket::with_reason(ReasonCode::ContinueAuthentication);
        reply.properties_mut().push(Property::AuthenticationMethod(
            StringData::from(method).map_err(codec::EncodeError::from)?,
        ));
        if let Some(data) = self.options.authentication_data() {
            reply
                .properties_mut()
                .push(Property::AuthenticationData(BinaryData::from_slice(data)?));
        }
        Ok(reply)
    }

    /// Queue an outbound packet and emit the sent hook.
    fn push_packet<P: EncodePacket + Packet>(&self, link: &Link, packet: &P) -> Result<(), Error> {
        let bytes = encode_packet(packet)?;
        link.outbound.push(bytes);
        self.events.emit(ClientEvent::PacketSent {
            packet_type: packet.packet_type(),
        });
        Ok(())
    }

    fn close_with(&mut self, link: &Link, reason_code: ReasonCode) -> SessionEnd {
        let packet = DisconnectPacket::with_reason(reason_code);
        let _ = self.push_packet(link, &packet);
        SessionEnd::ConnectionLost(Error::from_string(
            ErrorKind::Protocol,
            format!("connection closed with {reason_code:?}"),
        ))
    }

    fn resolve_publish(&mut self, packet_id: u16, result: Result<PublishResult, Error>) {
        if let Some(tx) = self.publish_waiters.remove(&packet_id) {
            // The caller may have detached; the flow finished either way.
            let _ = tx.send(result);
        }
    }

    /// Subscribe and unsubscribe exchanges do not survive a reconnect.
    fn fail_pending_exchanges(&mut self) {
        for (packet_id, pending) in self.pending_subscribes.drain() {
            self.window.release_id(PacketId::new(packet_id));
            let _ = pending.tx.send(Err(Error::new(
                ErrorKind::Transport,
                "connection lost before SUBACK",
            )));
        }
        for (packet_id, pending) in self.pending_unsubscribes.drain() {
            self.window.release_id(PacketId::new(packet_id));
            let _ = pending.tx.send(Err(Error::new(
                ErrorKind::Transport,
                "connection lost before UNSUBACK",
            )));
        }
    }

    fn fail_in_flight_session_lost(&mut self) {
        let drained = self.window.drain();
        for (packet_id, _record) in drained {
            self.resolve_publish(
                packet_id.value(),
                Err(Error::new(
                    ErrorKind::SessionLost,
                    "session was not resumed by the server",
                )),
            );
        }
    }

    fn fail_all_publishes(&mut self, err: &Error) {
        let _ = self.window.drain();
        let waiters: Vec<u16> = self.publish_waiters.keys().copied().collect();
        for packet_id in waiters {
            self.resolve_publish(packet_id, Err(err.clone()));
        }
    }

    async fn reconnect(&mut self) -> Result<Link, Error> {
        let mut delay = self.options.reconnect_initial_delay();
        let mut attempts: u32 = 0;
        loop {
            let _ = self.state_tx.send(ConnectionState::Disconnected);
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = self.stop.cancelled() => {
                    return Err(Error::new(
                        ErrorKind::Canceled,
                        "client shut down while reconnecting",
                    ));
                }
            }
            attempts += 1;
            log::info!("connection: reconnect attempt {attempts}");
            match self.establish().await {
                Ok((link, _result)) => return Ok(link),
                Err(err) => {
                    // An authentication refusal will not get better by
                    // retrying.
                    if err.kind() == ErrorKind::BrokerRefusal {
                        return Err(err);
                    }
                    if let Some(ceiling) = self.options.reconnect_attempt_ceiling() {
                        if attempts >= ceiling {
                            return Err(err);
                        }
                    }
                    log::warn!("connection: reconnect failed: {err}");
                    delay = (delay * 2).min(self.options.reconnect_max_delay());
                }
            }
        }
    }
}

fn encode_packet<P: EncodePacket>(packet: &P) -> Result<Vec<u8>, Error> {
    let mut buf = Vec::new();
    packet.encode(&mut buf)?;
    Ok(buf)
}

async fn reader_loop(
    mut read_half: ReadHalf<Stream>,
    mut framer: Framer,
    inbound: PacketQueue<InboundEvent>,
    cancel: CancelToken,
) {
    let mut buf = [0_u8; 4096];
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            ret = read_half.read(&mut buf) => match ret {
                Ok(0) => {
                    inbound.push(InboundEvent::Closed(None));
                    break;
                }
                Ok(n_recv) => {
                    framer.feed(&buf[..n_recv]);
                    while let Some(frame) = framer.next_frame() {
                        inbound.push(InboundEvent::Frame(frame));
                    }
                }
                Err(err) => {
                    log::warn!("reader: read failed: {err}");
                    inbound.push(InboundEvent::Closed(Some(err.into())));
                    break;
                }
            }
        }
    }
}

async fn writer_loop(
    mut write_half: WriteHalf<Stream>,
    outbound: PacketQueue<Vec<u8>>,
    inbound: PacketQueue<InboundEvent>,
    cancel: CancelToken,
    last_write: Arc<Mutex<Instant>>,
) {
    loop {
        let bytes = match outbound.pop(&cancel).await {
            Ok(bytes) => bytes,
            Err(_canceled) => break,
        };
        if let Err(err) = write_half.write_all(&bytes).await {
            log::warn!("writer: write failed: {err}");
            inbound.push(InboundEvent::Closed(Some(err.into())));
            return;
        }
        if let Err(err) = write_half.flush().await {
            log::warn!("writer: flush failed: {err}");
            inbound.push(InboundEvent::Closed(Some(err.into())));
            return;
        }
        *last_write.lock().unwrap() = Instant::now();
    }
    let _ = write_half.shutdown().await;
}

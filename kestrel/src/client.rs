// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! The user facing asynchronous client.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use codec::{
    BinaryData, BoolData, DisconnectPacket, Property, PublishPacket, QoS, ReasonCode,
    RetainHandling, StringData, SubscribeTopic, U32Data,
};
use tokio::sync::{mpsc, oneshot, watch};

use crate::connect_options::ConnectOptions;
use crate::connection::{Command, ConnectResult, Connection, ConnectionState, PublishResult};
use crate::error::{Error, ErrorKind};
use crate::event::{ClientEvent, EventBus, EventPump};
use crate::queue::{CancelToken, InFlightWindow};
use crate::session::OutgoingPublish;
use crate::subscription::{MessageHandler, ReceivedMessage, SubscriptionRegistry};

/// Options of one publish operation.
#[derive(Clone)]
pub struct PublishOptions {
    topic: String,
    payload: Bytes,
    qos: QoS,
    retain: bool,
    payload_format_utf8: bool,
    message_expiry_interval: Option<u32>,
    content_type: Option<String>,
    response_topic: Option<String>,
    correlation_data: Option<Vec<u8>>,
    user_properties: Vec<(String, String)>,
    timeout: Option<Duration>,
    cancel: Option<CancelToken>,
}

impl PublishOptions {
    #[must_use]
    pub fn new(topic: &str, payload: &[u8]) -> Self {
        Self {
            topic: topic.to_string(),
            payload: Bytes::copy_from_slice(payload),
            qos: QoS::AtMostOnce,
            retain: false,
            payload_format_utf8: false,
            message_expiry_interval: None,
            content_type: None,
            response_topic: None,
            correlation_data: None,
            user_properties: Vec::new(),
            timeout: None,
            cancel: None,
        }
    }

    pub fn set_qos(&mut self, qos: QoS) -> &mut Self {
        self.qos = qos;
        self
    }

    pub fn set_retain(&mut self, retain: bool) -> &mut Self {
        self.retain = retain;
        self
    }

    pub fn set_payload_format_utf8(&mut self, utf8: bool) -> &mut Self {
        self.payload_format_utf8 = utf8;
        self
    }

    pub fn set_message_expiry_interval(&mut self, seconds: Option<u32>) -> &mut Self {
        self.message_expiry_interval = seconds;
        self
    }

    pub fn set_content_type(&mut self, content_type: Option<&str>) -> &mut Self {
        self.content_type = content_type.map(ToString::to_string);
        self
    }

    pub fn set_response_topic(&mut self, response_topic: Option<&str>) -> &mut Self {
        self.response_topic = response_topic.map(ToString::to_string);
        self
    }

    pub fn set_correlation_data(&mut self, data: Option<&[u8]>) -> &mut Self {
        self.correlation_data = data.map(<[u8]>::to_vec);
        self
    }

    pub fn add_user_property(&mut self, key: &str, value: &str) -> &mut Self {
        self.user_properties
            .push((key.to_string(), value.to_string()));
        self
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) -> &mut Self {
        self.timeout = timeout;
        self
    }

    pub fn set_cancel_token(&mut self, cancel: Option<CancelToken>) -> &mut Self {
        self.cancel = cancel;
        self
    }

    fn to_packet(&self) -> Result<PublishPacket, Error> {
        let mut packet = PublishPacket::new(&self.topic, self.qos, &self.payload)?;
        packet.set_retain(self.retain);
        let properties = packet.properties_mut();
        if self.payload_format_utf8 {
            properties.push(Property::PayloadFormatIndicator(BoolData::new(true)));
        }
        if let Some(seconds) = self.message_expiry_interval {
            properties.push(Property::MessageExpiryInterval(U32Data::new(seconds)));
        }
        if let Some(content_type) = &self.content_type {
            properties.push(Property::ContentType(
                StringData::from(content_type).map_err(codec::EncodeError::from)?,
            ));
        }
        if let Some(response_topic) = &self.response_topic {
            properties.push(Property::ResponseTopic(
                StringData::from(response_topic).map_err(codec::EncodeError::from)?,
            ));
        }
        if let Some(data) = &self.correlation_data {
            properties.push(Property::CorrelationData(BinaryData::from_slice(data)?));
        }
        for (key, value) in &self.user_properties {
            properties.add_user_property(key, value)?;
        }
        Ok(packet)
    }
}

/// Options of one subscribe operation, covering one or more topic filters.
pub struct SubscribeOptions {
    topics: Vec<SubscribeTopic>,
    handler: Option<MessageHandler>,
    timeout: Option<Duration>,
    cancel: Option<CancelToken>,
    error: Option<Error>,
}

impl SubscribeOptions {
    #[must_use]
    pub fn new(filter: &str, qos: QoS) -> Self {
        let mut options = Self {
            topics: Vec::new(),
            handler: None,
            timeout: None,
            cancel: None,
            error: None,
        };
        options.add_filter(filter, qos);
        options
    }

    /// Add another topic filter to the same subscribe packet.
    pub fn add_filter(&mut self, filter: &str, qos: QoS) -> &mut Self {
        match SubscribeTopic::new(filter, qos) {
            Ok(topic) => self.topics.push(topic),
            Err(err) => {
                self.error = Some(Error::from_string(
                    ErrorKind::Validation,
                    format!("invalid topic filter {filter}: {err:?}"),
                ));
            }
        }
        self
    }

    /// Update subscription options of the most recently added filter.
    pub fn set_no_local(&mut self, no_local: bool) -> &mut Self {
        if let Some(topic) = self.topics.last_mut() {
            topic.set_no_local(no_local);
        }
        self
    }

    pub fn set_retain_as_published(&mut self, retain_as_published: bool) -> &mut Self {
        if let Some(topic) = self.topics.last_mut() {
            topic.set_retain_as_published(retain_as_published);
        }
        self
    }

    pub fn set_retain_handling(&mut self, retain_handling: RetainHandling) -> &mut Self {
        if let Some(topic) = self.topics.last_mut() {
            topic.set_retain_handling(retain_handling);
        }
        self
    }

    /// Set the callback invoked for messages matching any of the filters.
    pub fn set_handler<F>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(&ReceivedMessage) + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) -> &mut Self {
        self.timeout = timeout;
        self
    }

    pub fn set_cancel_token(&mut self, cancel: Option<CancelToken>) -> &mut Self {
        self.cancel = cancel;
        self
    }
}

/// Options of one unsubscribe operation.
pub struct UnsubscribeOptions {
    filters: Vec<String>,
    timeout: Option<Duration>,
    cancel: Option<CancelToken>,
}

impl UnsubscribeOptions {
    #[must_use]
    pub fn new(filters: &[&str]) -> Self {
        Self {
            filters: filters.iter().map(ToString::to_string).collect(),
            timeout: None,
            cancel: None,
        }
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) -> &mut Self {
        self.timeout = timeout;
        self
    }

    pub fn set_cancel_token(&mut self, cancel: Option<CancelToken>) -> &mut Self {
        self.cancel = cancel;
        self
    }
}

/// Options of the final DISCONNECT packet.
#[derive(Clone, Default)]
pub struct DisconnectOptions {
    reason_code: ReasonCode,
    session_expiry_interval: Option<u32>,
    reason_string: Option<String>,
    user_properties: Vec<(String, String)>,
}

impl DisconnectOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_reason_code(&mut self, reason_code: ReasonCode) -> &mut Self {
        self.reason_code = reason_code;
        self
    }

    /// Override the session expiry interval agreed at connect time.
    pub fn set_session_expiry_interval(&mut self, seconds: Option<u32>) -> &mut Self {
        self.session_expiry_interval = seconds;
        self
    }

    pub fn set_reason_string(&mut self, reason_string: Option<&str>) -> &mut Self {
        self.reason_string = reason_string.map(ToString::to_string);
        self
    }

    pub fn add_user_property(&mut self, key: &str, value: &str) -> &mut Self {
        self.user_properties
            .push((key.to_string(), value.to_string()));
        self
    }

    pub(crate) fn to_packet(&self) -> Result<DisconnectPacket, Error> {
        let mut packet = DisconnectPacket::with_reason(self.reason_code);
        let properties = packet.properties_mut();
        if let Some(seconds) = self.session_expiry_interval {
            properties.push(Property::SessionExpiryInterval(U32Data::new(seconds)));
        }
        if let Some(reason_string) = &self.reason_string {
            properties.push(Property::ReasonString(
                StringData::from(reason_string).map_err(codec::EncodeError::from)?,
            ));
        }
        for (key, value) in &self.user_properties {
            properties.add_user_property(key, value)?;
        }
        Ok(packet)
    }
}

/// Asynchronous MQTT v5.0 client.
///
/// Create it from [`ConnectOptions`], call [`AsyncClient::connect`], then
/// publish and subscribe. The protocol runs on a background task; dropping
/// the client or calling [`AsyncClient::disconnect`] shuts it down.
pub struct AsyncClient {
    options: ConnectOptions,
    window: InFlightWindow<OutgoingPublish>,
    registry: Arc<Mutex<SubscriptionRegistry>>,
    events: EventBus,
    event_pump: Option<EventPump>,
    cmd_tx: Option<mpsc::Sender<Command>>,
    state_rx: Option<watch::Receiver<ConnectionState>>,
    stop: CancelToken,
    publish_seq: Arc<AtomicU64>,
}

impl AsyncClient {
    /// Create a client; no network activity happens until
    /// [`AsyncClient::connect`].
    ///
    /// # Errors
    ///
    /// Returns error if `options` fail validation.
    pub fn new(options: ConnectOptions) -> Result<Self, Error> {
        options.validate()?;
        let (events, event_pump) = EventBus::new(64);
        Ok(Self {
            options,
            window: InFlightWindow::new(usize::from(u16::MAX)),
            registry: Arc::new(Mutex::new(SubscriptionRegistry::new())),
            events,
            event_pump: Some(event_pump),
            cmd_tx: None,
            state_rx: None,
            stop: CancelToken::new(),
            publish_seq: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Register a lifecycle event handler; may be called before or after
    /// connect.
    pub fn on_event<F>(&self, handler: F)
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        self.events.add_handler(Arc::new(handler));
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state_rx
            .as_ref()
            .map_or(ConnectionState::Disconnected, |rx| *rx.borrow())
    }

    /// Connect to the server and wait for its CONNACK.
    ///
    /// Spawns the connection task which keeps running, and reconnecting,
    /// until `disconnect` is called or the reconnect budget is exhausted.
    ///
    /// # Errors
    ///
    /// Returns error if the transport cannot be opened, the server refuses
    /// the connection, or no CONNACK arrives within the connect timeout.
    pub async fn connect(&mut self) -> Result<ConnectResult, Error> {
        if self.cmd_tx.is_some() {
            return Err(Error::new(ErrorKind::Validation, "already connected"));
        }
        if let Some(event_pump) = self.event_pump.take() {
            tokio::spawn(event_pump.run());
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let connection = Connection::new(
            self.options.clone(),
            self.window.clone(),
            Arc::clone(&self.registry),
            self.events.clone(),
            cmd_rx,
            state_tx,
            self.stop.clone(),
        );

        let (connect_tx, connect_rx) = oneshot::channel();
        tokio::spawn(connection.run(connect_tx));

        let result = connect_rx
            .await
            .map_err(|_recv| Error::new(ErrorKind::Channel, "connection task exited"))??;
        self.cmd_tx = Some(cmd_tx);
        self.state_rx = Some(state_rx);
        Ok(result)
    }

    /// Publish a message.
    ///
    /// `QoS` 0 resolves once the packet is queued for the transport. `QoS` 1
    /// and 2 resolve on the terminal acknowledgement; while the in-flight
    /// window is at the server's Receive Maximum, the call waits for a free
    /// slot. Canceling after the packet hit the wire detaches the caller,
    /// the protocol flow still runs to completion.
    ///
    /// # Errors
    ///
    /// Returns error if the publish could not be completed.
    pub async fn publish(&self, options: PublishOptions) -> Result<PublishResult, Error> {
        let cmd_tx = self
            .cmd_tx
            .as_ref()
            .ok_or_else(|| Error::new(ErrorKind::NotConnected, "call connect() first"))?;
        let packet = options.to_packet()?;
        let cancel = options.cancel.clone().unwrap_or_default();
        let timeout = options.timeout;

        let flow = async {
            if packet.qos() == QoS::AtMostOnce {
                let (tx, rx) = oneshot::channel();
                cmd_tx
                    .send(Command::PublishQos0 { packet, tx })
                    .await
                    .map_err(|_send| Error::new(ErrorKind::Channel, "connection task gone"))?;
                rx.await
                    .map_err(|_recv| Error::new(ErrorKind::Channel, "connection task gone"))?
            } else {
                let record =
                    OutgoingPublish::new(packet, self.publish_seq.fetch_add(1, Ordering::Relaxed));
                let packet_id = self.window.acquire(record, &cancel).await?;

                let (tx, rx) = oneshot::channel();
                if cmd_tx
                    .send(Command::PublishQos { packet_id, tx })
                    .await
                    .is_err()
                {
                    self.window.remove(packet_id);
                    return Err(Error::new(ErrorKind::Channel, "connection task gone"));
                }
                tokio::select! {
                    result = rx => result
                        .map_err(|_recv| Error::new(ErrorKind::Channel, "connection task gone"))?,
                    () = cancel.cancelled() => {
                        // Detach; the flow continues to its terminal ack.
                        Err(Error::new(ErrorKind::Canceled, "publish wait canceled"))
                    }
                }
            }
        };

        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, flow).await?,
            None => flow.await,
        }
    }

    /// Subscribe to one or more topic filters.
    ///
    /// Returns the per-filter reason codes from the SUBACK, in request
    /// order. The handler, if any, is registered for every granted filter.
    ///
    /// # Errors
    ///
    /// Returns error if some filter is invalid or the exchange fails.
    pub async fn subscribe(&self, options: SubscribeOptions) -> Result<Vec<ReasonCode>, Error> {
        if let Some(err) = options.error {
            return Err(err);
        }
        if options.topics.is_empty() {
            return Err(Error::new(
                ErrorKind::Validation,
                "at least one topic filter is required",
            ));
        }
        let cmd_tx = self
            .cmd_tx
            .as_ref()
            .ok_or_else(|| Error::new(ErrorKind::NotConnected, "call connect() first"))?;

        let (tx, rx) = oneshot::channel();
        let cmd = Command::Subscribe {
            topics: options.topics,
            handler: options.handler,
            tx,
        };
        Self::exchange(cmd_tx, cmd, rx, options.timeout, options.cancel).await
    }

    /// Remove subscriptions by their filter strings.
    ///
    /// Returns the per-filter reason codes from the UNSUBACK. `QoS` 1/2
    /// deliveries already in flight still complete.
    ///
    /// # Errors
    ///
    /// Returns error if the exchange fails.
    pub async fn unsubscribe(&self, options: UnsubscribeOptions) -> Result<Vec<ReasonCode>, Error> {
        if options.filters.is_empty() {
            return Err(Error::new(
                ErrorKind::Validation,
                "at least one topic filter is required",
            ));
        }
        let cmd_tx = self
            .cmd_tx
            .as_ref()
            .ok_or_else(|| Error::new(ErrorKind::NotConnected, "call connect() first"))?;

        let (tx, rx) = oneshot::channel();
        let cmd = Command::Unsubscribe {
            filters: options.filters,
            tx,
        };
        Self::exchange(cmd_tx, cmd, rx, options.timeout, options.cancel).await
    }

    /// Send DISCONNECT and shut the connection task down.
    ///
    /// # Errors
    ///
    /// Returns error if the client is not connected.
    pub async fn disconnect(&mut self) -> Result<(), Error> {
        self.disconnect_with(DisconnectOptions::default()).await
    }

    /// Send DISCONNECT with explicit options and shut the connection task
    /// down.
    ///
    /// # Errors
    ///
    /// Returns error if the client is not connected.
    pub async fn disconnect_with(&mut self, options: DisconnectOptions) -> Result<(), Error> {
        let cmd_tx = self
            .cmd_tx
            .take()
            .ok_or_else(|| Error::new(ErrorKind::NotConnected, "not connected"))?;
        let (tx, rx) = oneshot::channel();
        let sent = cmd_tx.send(Command::Disconnect { options, tx }).await;
        self.stop.cancel();
        if sent.is_err() {
            // The connection task is already gone; nothing left to close.
            return Ok(());
        }
        rx.await.unwrap_or(Ok(()))
    }

    async fn exchange(
        cmd_tx: &mpsc::Sender<Command>,
        cmd: Command,
        rx: oneshot::Receiver<Result<Vec<ReasonCode>, Error>>,
        timeout: Option<Duration>,
        cancel: Option<CancelToken>,
    ) -> Result<Vec<ReasonCode>, Error> {
        let cancel = cancel.unwrap_or_default();
        let flow = async {
            cmd_tx
                .send(cmd)
                .await
                .map_err(|_send| Error::new(ErrorKind::Channel, "connection task gone"))?;
            tokio::select! {
                result = rx => result
                    .map_err(|_recv| Error::new(ErrorKind::Channel, "connection task gone"))?,
                () = cancel.cancelled() => Err(Error::new(ErrorKind::Canceled, "operation canceled")),
            }
        };
        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, flow).await?,
            None => flow.await,
        }
    }

    /// Number of `QoS` 1/2 publishes currently in flight.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.window.len()
    }

    #[must_use]
    pub const fn options(&self) -> &ConnectOptions {
        &self.options
    }
}

impl Drop for AsyncClient {
    fn drop(&mut self) {
        // Stops reconnect attempts; an open connection notices the closed
        // command channel and sends DISCONNECT.
        self.stop.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_options_to_packet() {
        let mut options = PublishOptions::new("sensor/temp", b"21.5");
        options
            .set_qos(QoS::AtLeastOnce)
            .set_retain(true)
            .set_content_type(Some("text/plain"))
            .add_user_property("origin", "kestrel");
        let packet = options.to_packet().unwrap();
        assert_eq!(packet.topic(), "sensor/temp");
        assert_eq!(packet.qos(), QoS::AtLeastOnce);
        assert!(packet.retain());
        assert_eq!(packet.properties().content_type(), Some("text/plain"));
    }

    #[test]
    fn test_subscribe_options_collects_filters() {
        let mut options = SubscribeOptions::new("sensor/+/temp", QoS::AtLeastOnce);
        options
            .add_filter("state/#", QoS::AtMostOnce)
            .set_retain_handling(RetainHandling::DoNotSend);
        assert!(options.error.is_none());
        assert_eq!(options.topics.len(), 2);
        assert_eq!(
            options.topics[1].retain_handling(),
            RetainHandling::DoNotSend
        );
    }

    #[test]
    fn test_subscribe_options_invalid_filter() {
        let options = SubscribeOptions::new("a/#/b", QoS::AtMostOnce);
        assert!(options.error.is_some());
    }

    #[test]
    fn test_disconnect_options_to_packet() {
        let mut options = DisconnectOptions::new();
        options
            .set_reason_code(ReasonCode::DisconnectWithWillMessage)
            .set_session_expiry_interval(Some(30))
            .set_reason_string(Some("maintenance"));
        let packet = options.to_packet().unwrap();
        assert_eq!(
            packet.reason_code(),
            ReasonCode::DisconnectWithWillMessage
        );
        assert_eq!(packet.properties().session_expiry_interval(), Some(30));
        assert_eq!(packet.properties().reason_string(), Some("maintenance"));
    }

    #[tokio::test]
    async fn test_operations_require_connect() {
        let client = AsyncClient::new(ConnectOptions::default()).unwrap();
        let err = client
            .publish(PublishOptions::new("a/b", b"x"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotConnected);

        let err = client
            .subscribe(SubscribeOptions::new("a/b", QoS::AtMostOnce))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotConnected);
    }

    #[test]
    fn test_new_rejects_invalid_options() {
        let mut options = ConnectOptions::default();
        options.set_receive_maximum(0);
        assert!(AsyncClient::new(options).is_err());
    }
}

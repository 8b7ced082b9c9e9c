// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Asynchronous MQTT v5.0 client library.
//!
//! The client is split into a pure wire codec (the `kestrel_codec` crate) and
//! a tokio based protocol engine (this crate). Three cooperative tasks share
//! one connection: a reader that frames and decodes the byte stream, a writer
//! that drains the outbound packet queue, and a dispatcher that owns the
//! session state and drives the `QoS` handshakes.

mod client;
mod connect_options;
mod connection;
mod error;
mod event;
pub mod framer;
mod queue;
mod session;
mod stream;
mod subscription;

pub use client::{
    AsyncClient, DisconnectOptions, PublishOptions, SubscribeOptions, UnsubscribeOptions,
};
pub use connect_options::{ConnectOptions, ConnectType, LastWill, MqttsConnect, TlsType};
pub use connection::{ConnectResult, ConnectionState, PublishResult};
pub use error::{Error, ErrorKind};
pub use event::{ClientEvent, EventHandler};
pub use queue::CancelToken;
pub use session::BrokerCapabilities;
pub use subscription::{MessageHandler, ReceivedMessage};

// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! User visible lifecycle events, fanned out off the protocol path.

use std::sync::{Arc, RwLock};

use codec::{PacketType, ReasonCode};
use tokio::sync::mpsc;

use crate::subscription::ReceivedMessage;

/// Events emitted at defined points of the client lifecycle.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    BeforeConnect,
    AfterConnect {
        reason_code: ReasonCode,
        session_present: bool,
    },
    BeforeSubscribe {
        filters: Vec<String>,
    },
    AfterSubscribe {
        filters: Vec<String>,
        reason_codes: Vec<ReasonCode>,
    },
    BeforeUnsubscribe {
        filters: Vec<String>,
    },
    AfterUnsubscribe {
        filters: Vec<String>,
        reason_codes: Vec<ReasonCode>,
    },
    MessageReceived(ReceivedMessage),
    AfterDisconnect {
        reason_code: Option<ReasonCode>,
    },
    PacketSent {
        packet_type: PacketType,
    },
    PacketReceived {
        packet_type: PacketType,
    },
}

/// Callback registered for client events.
pub type EventHandler = Arc<dyn Fn(&ClientEvent) + Send + Sync>;

/// Event fan-out with a bounded notification queue.
///
/// Handlers run on a dedicated pump task, never on the protocol tasks.
/// When the queue is saturated, event notifications are dropped; protocol
/// packets are never affected.
#[derive(Clone)]
pub struct EventBus {
    handlers: Arc<RwLock<Vec<EventHandler>>>,
    tx: mpsc::Sender<ClientEvent>,
}

impl EventBus {
    /// Create a bus with room for `queue_size` undelivered notifications,
    /// plus the pump which drains it.
    #[must_use]
    pub fn new(queue_size: usize) -> (Self, EventPump) {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        let handlers = Arc::new(RwLock::new(Vec::new()));
        let bus = Self {
            handlers: Arc::clone(&handlers),
            tx,
        };
        (bus, EventPump { rx, handlers })
    }

    /// Register a handler; it observes every event emitted afterwards.
    pub fn add_handler(&self, handler: EventHandler) {
        self.handlers.write().unwrap().push(handler);
    }

    /// Queue an event for delivery; drops it with a warning when the
    /// queue is full.
    pub fn emit(&self, event: ClientEvent) {
        if self.handlers.read().unwrap().is_empty() {
            return;
        }
        if let Err(mpsc::error::TrySendError::Full(event)) = self.tx.try_send(event) {
            log::warn!("event: notification queue full, dropping {event:?}");
        }
    }
}

/// Drains the event queue and invokes handlers, in emission order.
pub struct EventPump {
    rx: mpsc::Receiver<ClientEvent>,
    handlers: Arc<RwLock<Vec<EventHandler>>>,
}

impl EventPump {
    pub async fn run(mut self) {
        while let Some(event) = self.rx.recv().await {
            let handlers = self.handlers.read().unwrap().clone();
            for handler in handlers {
                handler(&event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_event_bus_delivers_to_handlers() {
        let (bus, pump) = EventBus::new(16);
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let counter = Arc::clone(&counter);
            bus.add_handler(Arc::new(move |_event| {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        tokio::spawn(pump.run());

        bus.emit(ClientEvent::BeforeConnect);
        bus.emit(ClientEvent::AfterConnect {
            reason_code: ReasonCode::Success,
            session_present: false,
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_event_bus_drops_when_saturated() {
        let (bus, _pump) = EventBus::new(1);
        bus.add_handler(Arc::new(|_event| {}));

        // The pump is not running; the queue holds one event and the rest
        // are dropped without blocking.
        for _ in 0..10 {
            bus.emit(ClientEvent::BeforeConnect);
        }
    }

    #[tokio::test]
    async fn test_event_bus_no_handlers_no_queueing() {
        let (bus, _pump) = EventBus::new(1);
        for _ in 0..10 {
            bus.emit(ClientEvent::BeforeConnect);
        }
    }
}

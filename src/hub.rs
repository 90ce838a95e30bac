/*!
 * Lossy fan-out of bus activity.
 *
 * Engine callbacks arrive on the engine's receiver thread and must never wait for
 * a consumer. Each [Subscription] owns a bounded queue; when that queue is full an
 * event is dropped for that subscriber alone and counted in [Subscription::dropped].
 */
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Serialize, Serializer};
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tracing::{debug, trace};

use crate::{
    address::LogicalAddress,
    command::Command,
    engine::EngineCallbacks,
    protocol::{Alert, Opcode, PowerStatus},
};

/// Queue length of every subscription created by [EventHub::subscribe].
pub const SUBSCRIBER_CAPACITY: usize = 64;

/// Something that happened on the bus, as handed to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CecEvent {
    #[serde(flatten)]
    pub payload: EventPayload,
    /// set by [EventHub::publish]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    KeyPress {
        keycode: u8,
        /// hold time in milliseconds, 0 on press
        duration: u64,
    },
    Command {
        initiator: LogicalAddress,
        destination: LogicalAddress,
        #[serde(serialize_with = "hex_opcode")]
        opcode: u8,
        parameters: Vec<u8>,
    },
    SourceActivated {
        address: LogicalAddress,
        activated: bool,
    },
    PowerChange {
        address: LogicalAddress,
        status: PowerStatus,
    },
    Alert {
        alert: u8,
        param: u32,
    },
}

fn hex_opcode<S: Serializer>(opcode: &u8, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(&format_args!("0x{opcode:02X}"))
}

impl EventPayload {
    /// The `type` tag, also used as MQTT topic suffix.
    pub fn type_name(&self) -> &'static str {
        match self {
            EventPayload::KeyPress { .. } => "key_press",
            EventPayload::Command { .. } => "command",
            EventPayload::SourceActivated { .. } => "source_activated",
            EventPayload::PowerChange { .. } => "power_change",
            EventPayload::Alert { .. } => "alert",
        }
    }

    /// Just the `data` object.
    pub fn data(&self) -> serde_json::Value {
        serde_json::to_value(self)
            .ok()
            .and_then(|mut v| v.get_mut("data").map(serde_json::Value::take))
            .unwrap_or_default()
    }
}

struct Subscriber {
    tx: mpsc::Sender<CecEvent>,
    dropped: Arc<AtomicU64>,
}

struct Inner {
    subscribers: RwLock<HashMap<u64, Subscriber>>,
    publishing: Mutex<()>,
    next_id: AtomicU64,
}

/// Cheap to clone. All clones share one subscriber set.
#[derive(Clone)]
pub struct EventHub {
    inner: Arc<Inner>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                subscribers: RwLock::new(HashMap::new()),
                publishing: Mutex::new(()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        self.subscribe_with_capacity(SUBSCRIBER_CAPACITY)
    }

    pub fn subscribe_with_capacity(&self, capacity: usize) -> Subscription {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let dropped = Arc::new(AtomicU64::new(0));
        self.inner.subscribers.write().insert(
            id,
            Subscriber {
                tx,
                dropped: dropped.clone(),
            },
        );
        debug!(id, capacity, "event subscriber added");
        Subscription {
            id,
            rx,
            dropped,
            hub: self.clone(),
        }
    }

    /// Deregister `sub`. Its queue is closed once drained. Calling this again is a no-op.
    pub fn unsubscribe(&self, sub: &Subscription) {
        self.remove(sub.id);
    }

    fn remove(&self, id: u64) {
        if self.inner.subscribers.write().remove(&id).is_some() {
            debug!(id, "event subscriber removed");
        }
    }

    /// Deregister every subscriber, ending their streams once drained.
    pub fn close_all(&self) {
        let closed = std::mem::take(&mut *self.inner.subscribers.write());
        debug!(count = closed.len(), "event subscribers closed");
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }

    /// Stamp `payload` and offer it to every subscriber without waiting.
    pub fn publish(&self, payload: EventPayload) {
        let _order = self.inner.publishing.lock();
        let event = CecEvent {
            payload,
            timestamp: Utc::now(),
        };
        trace!(kind = event.payload.type_name(), "publish");
        for (id, sub) in self.inner.subscribers.read().iter() {
            match sub.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    sub.dropped.fetch_add(1, Ordering::Relaxed);
                    trace!(id, "subscriber full, event dropped");
                }
                // receiver went away, the subscription removes itself on drop
                Err(TrySendError::Closed(_)) => {}
            }
        }
    }

    /// Engine callbacks that publish into this hub.
    pub fn callbacks(&self) -> Arc<dyn EngineCallbacks> {
        Arc::new(HubCallbacks { hub: self.clone() })
    }
}

/// Receiving end of [EventHub::subscribe]. Deregisters itself when dropped.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<CecEvent>,
    dropped: Arc<AtomicU64>,
    hub: EventHub,
}

impl Subscription {
    /// Next event. `None` once unsubscribed and drained.
    pub async fn recv(&mut self) -> Option<CecEvent> {
        self.rx.recv().await
    }

    /// Next queued event, if any.
    pub fn try_recv(&mut self) -> Option<CecEvent> {
        match self.rx.try_recv() {
            Ok(ev) => Some(ev),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Events that were discarded because this queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn unsubscribe(&self) {
        self.hub.remove(self.id);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.remove(self.id);
    }
}

struct HubCallbacks {
    hub: EventHub,
}

impl EngineCallbacks for HubCallbacks {
    fn on_key_press(&self, keycode: u8, duration: Duration) {
        debug!(keycode, duration_ms = duration.as_millis() as u64, "key press");
        self.hub.publish(EventPayload::KeyPress {
            keycode,
            duration: duration.as_millis() as u64,
        });
    }

    fn on_command(&self, command: &Command) {
        debug!(%command, "command received");
        let initiator = command.initiator;
        match command.known_opcode() {
            Some(Opcode::ReportPowerStatus) => {
                if let Some(&status) = command.parameters().first() {
                    self.hub.publish(EventPayload::PowerChange {
                        address: initiator,
                        status: PowerStatus::from_operand(status),
                    });
                }
            }
            Some(Opcode::Standby) => self.hub.publish(EventPayload::PowerChange {
                address: initiator,
                status: PowerStatus::Standby,
            }),
            _ => {}
        }
        self.hub.publish(EventPayload::Command {
            initiator,
            destination: command.destination,
            opcode: command.opcode,
            parameters: command.parameters().to_vec(),
        });
    }

    fn on_source_activated(&self, address: LogicalAddress, activated: bool) {
        debug!(%address, activated, "source activation changed");
        self.hub
            .publish(EventPayload::SourceActivated { address, activated });
    }

    fn on_alert(&self, alert: Alert, param: u32) {
        debug!(?alert, param, "alert");
        self.hub.publish(EventPayload::Alert {
            alert: alert.into(),
            param,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn la(raw: u8) -> LogicalAddress {
        LogicalAddress::new(raw).unwrap()
    }

    fn key(code: u8) -> EventPayload {
        EventPayload::KeyPress {
            keycode: code,
            duration: 0,
        }
    }

    fn drain(sub: &mut Subscription) -> Vec<EventPayload> {
        std::iter::from_fn(|| sub.try_recv()).map(|e| e.payload).collect()
    }

    #[test]
    fn full_queue_keeps_the_first_k() {
        let hub = EventHub::new();
        let mut sub = hub.subscribe_with_capacity(4);
        for code in 0..10 {
            hub.publish(key(code));
        }
        let got = drain(&mut sub);
        assert_eq!(got, (0..4).map(key).collect::<Vec<_>>());
        assert_eq!(sub.dropped(), 6);
    }

    #[test]
    fn subscribers_are_independent() {
        let hub = EventHub::new();
        let mut small = hub.subscribe_with_capacity(2);
        let mut big = hub.subscribe_with_capacity(8);
        for code in 0..5 {
            hub.publish(key(code));
        }
        assert_eq!(drain(&mut small).len(), 2);
        assert_eq!(drain(&mut big), (0..5).map(key).collect::<Vec<_>>());
        assert_eq!(small.dropped(), 3);
        assert_eq!(big.dropped(), 0);
    }

    #[test]
    fn report_power_status_fans_out_in_order() {
        let hub = EventHub::new();
        let mut sub = hub.subscribe();
        let cb = hub.callbacks();
        cb.on_command(&Command::new(la(0), la(1), Opcode::ReportPowerStatus, vec![0x01u8]).unwrap());
        assert_eq!(
            drain(&mut sub),
            vec![
                EventPayload::PowerChange {
                    address: la(0),
                    status: PowerStatus::Standby
                },
                EventPayload::Command {
                    initiator: la(0),
                    destination: la(1),
                    opcode: 0x90,
                    parameters: vec![0x01],
                },
            ]
        );

        cb.on_command(&Command::new(la(4), LogicalAddress::BROADCAST, Opcode::Standby, Vec::<u8>::new()).unwrap());
        let got = drain(&mut sub);
        assert_eq!(got.len(), 2);
        assert_eq!(
            got[0],
            EventPayload::PowerChange {
                address: la(4),
                status: PowerStatus::Standby
            }
        );

        cb.on_command(&Command::new(la(4), la(0), Opcode::ActiveSource, vec![0x10u8, 0x00]).unwrap());
        assert_eq!(drain(&mut sub).len(), 1);
    }

    #[test]
    fn unsubscribe_twice_is_harmless() {
        let hub = EventHub::new();
        let mut sub = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 1);
        hub.unsubscribe(&sub);
        hub.unsubscribe(&sub);
        sub.unsubscribe();
        assert_eq!(hub.subscriber_count(), 0);
        hub.publish(key(1));
        assert!(sub.try_recv().is_none());
        drop(sub);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn unsubscribing_while_publishing() {
        use std::sync::atomic::AtomicBool;

        let hub = EventHub::new();
        let stop = Arc::new(AtomicBool::new(false));
        let published = Arc::new(AtomicU64::new(0));
        let publisher = {
            let hub = hub.clone();
            let stop = stop.clone();
            let published = published.clone();
            std::thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    let n = published.fetch_add(1, Ordering::Relaxed);
                    hub.publish(key(n as u8));
                }
            })
        };
        while published.load(Ordering::Relaxed) == 0 {
            std::thread::yield_now();
        }
        for i in 0..2000 {
            let mut sub = hub.subscribe_with_capacity(1 + i % 4);
            let _ = sub.try_recv();
            hub.unsubscribe(&sub);
            sub.unsubscribe();
            drop(sub);
        }
        stop.store(true, Ordering::Relaxed);
        publisher.join().expect("publisher panicked");
        assert_eq!(hub.subscriber_count(), 0);
        assert!(published.load(Ordering::Relaxed) > 0);
    }

    #[test]
    fn dropping_a_subscription_deregisters_it() {
        let hub = EventHub::new();
        let sub = hub.subscribe();
        let _other = hub.subscribe();
        drop(sub);
        assert_eq!(hub.subscriber_count(), 1);
    }

    #[test]
    fn json_shape() {
        let ev = CecEvent {
            payload: EventPayload::Command {
                initiator: la(4),
                destination: la(0),
                opcode: 0x8f,
                parameters: vec![],
            },
            timestamp: Utc::now(),
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "command");
        assert_eq!(v["data"]["opcode"], "0x8F");
        assert_eq!(v["data"]["initiator"], 4);
        assert!(v["timestamp"].is_string());

        let alert = EventPayload::Alert { alert: 2, param: 0 };
        assert_eq!(alert.type_name(), "alert");
        assert_eq!(alert.data(), serde_json::json!({"alert": 2, "param": 0}));
        let pc = EventPayload::PowerChange {
            address: la(0),
            status: PowerStatus::TransitioningToOn,
        };
        assert_eq!(pc.data()["status"], "transitioning_to_on");
    }

    #[tokio::test]
    async fn close_all_ends_every_stream() {
        let hub = EventHub::new();
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();
        hub.close_all();
        assert_eq!(hub.subscriber_count(), 0);
        assert!(a.recv().await.is_none());
        assert!(b.recv().await.is_none());
    }

    #[tokio::test]
    async fn recv_ends_after_unsubscribe() {
        let hub = EventHub::new();
        let mut sub = hub.subscribe();
        hub.publish(key(7));
        sub.unsubscribe();
        assert_eq!(sub.recv().await.map(|e| e.payload), Some(key(7)));
        assert!(sub.recv().await.is_none());
    }
}

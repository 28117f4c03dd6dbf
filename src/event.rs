//! Outbound events and the queue that carries them to the host.
//!
//! Producers (host commands and adapter callback threads) push onto a
//! single FIFO; one consumer drains it on its own cadence and hands each
//! message to the sink registered for its kind. Events are typed until
//! they are enqueued, at which point they become the `~`-joined wire
//! string the host expects.

use std::{fmt, mem, sync::Arc};

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use log::{debug, error, warn};
use parking_lot::Mutex;
use smol_str::SmolStr;

use crate::{
   error::BridgeError,
   gatt::ids::{AttrUuid, ContainerId},
};

/// Field delimiter of the wire format. Values are assumed not to contain it.
pub const DELIMITER: char = '~';

/// Events the core reports to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BleEvent {
   Initialized,
   DeInitialized,
   DiscoveredPeripheral {
      device: ContainerId,
      name: SmolStr,
   },
   RetrievedConnectedPeripheral {
      device: ContainerId,
      name: SmolStr,
   },
   ConnectedPeripheral(ContainerId),
   DiscoveredService {
      device: ContainerId,
      service: AttrUuid,
   },
   DiscoveredCharacteristic {
      device: ContainerId,
      service: AttrUuid,
      characteristic: AttrUuid,
   },
   DidUpdateValueForCharacteristic {
      device: ContainerId,
      characteristic: AttrUuid,
      value: Vec<u8>,
   },
   /// `service` is only set when the change comes from a disconnect sweep.
   DidUpdateNotificationStateForCharacteristic {
      device: ContainerId,
      service: Option<AttrUuid>,
      characteristic: AttrUuid,
   },
   DisconnectedPeripheral(ContainerId),
   Error(String),
}

impl BleEvent {
   pub fn tag(&self) -> &'static str {
      match self {
         Self::Initialized => "Initialized",
         Self::DeInitialized => "DeInitialized",
         Self::DiscoveredPeripheral { .. } => "DiscoveredPeripheral",
         Self::RetrievedConnectedPeripheral { .. } => "RetrievedConnectedPeripheral",
         Self::ConnectedPeripheral(_) => "ConnectedPeripheral",
         Self::DiscoveredService { .. } => "DiscoveredService",
         Self::DiscoveredCharacteristic { .. } => "DiscoveredCharacteristic",
         Self::DidUpdateValueForCharacteristic { .. } => "DidUpdateValueForCharacteristic",
         Self::DidUpdateNotificationStateForCharacteristic { .. } => {
            "DidUpdateNotificationStateForCharacteristic"
         },
         Self::DisconnectedPeripheral(_) => "DisconnectedPeripheral",
         Self::Error(_) => "Error",
      }
   }
}

/// The `~`-joined wire string the host receives.
impl fmt::Display for BleEvent {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      const D: char = DELIMITER;
      f.write_str(self.tag())?;
      match self {
         Self::Initialized | Self::DeInitialized => Ok(()),
         Self::DiscoveredPeripheral { device, name }
         | Self::RetrievedConnectedPeripheral { device, name } => write!(f, "{D}{device}{D}{name}"),
         Self::ConnectedPeripheral(device) | Self::DisconnectedPeripheral(device) => {
            write!(f, "{D}{device}")
         },
         Self::DiscoveredService { device, service } => write!(f, "{D}{device}{D}{service}"),
         Self::DiscoveredCharacteristic {
            device,
            service,
            characteristic,
         } => write!(f, "{D}{device}{D}{service}{D}{characteristic}"),
         Self::DidUpdateValueForCharacteristic {
            device,
            characteristic,
            value,
         } => write!(f, "{D}{device}{D}{characteristic}{D}{}", BASE64.encode(value)),
         Self::DidUpdateNotificationStateForCharacteristic {
            device,
            service,
            characteristic,
         } => {
            write!(f, "{D}{device}")?;
            if let Some(service) = service {
               write!(f, "{D}{service}")?;
            }
            write!(f, "{D}{characteristic}")
         },
         Self::Error(message) => write!(f, "{D}{message}"),
      }
   }
}

/// Host callback slot a queued message is delivered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum MessageKind {
   Message,
   Log,
   Warning,
   Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
   pub kind: MessageKind,
   pub payload: String,
}

impl QueuedMessage {
   pub fn new(kind: MessageKind, payload: impl Into<String>) -> Self {
      Self {
         kind,
         payload: payload.into(),
      }
   }
}

/// Thread-safe FIFO between producers and the single pumping consumer.
///
/// The lock guards the vector only and is held for a push or a swap, never
/// while messages are dispatched.
#[derive(Debug, Default)]
pub struct EventQueue {
   pending: Mutex<Vec<QueuedMessage>>,
}

/// Type alias for a shared handle to the queue.
pub type EventSender = Arc<EventQueue>;

impl EventQueue {
   /// Creates an empty queue behind a shared handle.
   pub fn shared() -> EventSender {
      Arc::new(Self::default())
   }

   pub fn enqueue(&self, message: QueuedMessage) {
      self.pending.lock().push(message);
   }

   /// Queues a host-visible event.
   pub fn send(&self, event: BleEvent) {
      let wire = event.to_string();
      debug!("event> {wire}");
      self.enqueue(QueuedMessage::new(MessageKind::Message, wire));
   }

   pub fn log(&self, message: impl Into<String>) {
      self.enqueue(QueuedMessage::new(MessageKind::Log, message));
   }

   pub fn warn(&self, message: impl Into<String>) {
      let message = message.into();
      warn!("{message}");
      self.enqueue(QueuedMessage::new(MessageKind::Warning, message));
   }

   /// Reports a failure: an `Error~` message on the message channel, paired
   /// with the bare text on the error channel.
   pub fn report(&self, err: &BridgeError) {
      let text = err.to_string();
      error!("{text}");
      let mut pending = self.pending.lock();
      pending.push(QueuedMessage::new(
         MessageKind::Message,
         BleEvent::Error(text.clone()).to_string(),
      ));
      pending.push(QueuedMessage::new(MessageKind::Error, text));
   }

   /// Swaps the queue for an empty one and returns everything it held, in
   /// enqueue order.
   pub fn drain(&self) -> Vec<QueuedMessage> {
      mem::take(&mut *self.pending.lock())
   }

   pub fn clear(&self) {
      self.pending.lock().clear();
   }

   pub fn len(&self) -> usize {
      self.pending.lock().len()
   }

   pub fn is_empty(&self) -> bool {
      self.len() == 0
   }
}

/// Generic message callback: `(receiver object, receiver method, message)`.
pub type MessageSink = Box<dyn Fn(&str, &str, &str) + Send + Sync>;
/// Log, warning and error callbacks.
pub type TextSink = Box<dyn Fn(&str) + Send + Sync>;

/// Host callback slots. Any slot may be empty.
#[derive(Default)]
pub struct HostSinks {
   pub message: Option<MessageSink>,
   pub log: Option<TextSink>,
   pub warning: Option<TextSink>,
   pub error: Option<TextSink>,
}

impl fmt::Debug for HostSinks {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("HostSinks")
         .field("message", &self.message.is_some())
         .field("log", &self.log.is_some())
         .field("warning", &self.warning.is_some())
         .field("error", &self.error.is_some())
         .finish()
   }
}

/// Name of the host object and method generic messages are addressed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageTarget {
   pub object: SmolStr,
   pub method: SmolStr,
}

impl HostSinks {
   /// Hands one message to its slot. An empty slot drops it silently.
   pub fn deliver(&self, target: &MessageTarget, message: &QueuedMessage) {
      let text = message.payload.as_str();
      match message.kind {
         MessageKind::Message => {
            if let Some(sink) = &self.message {
               sink(&target.object, &target.method, text);
            }
         },
         MessageKind::Log => {
            if let Some(sink) = &self.log {
               sink(text);
            }
         },
         MessageKind::Warning => {
            if let Some(sink) = &self.warning {
               sink(text);
            }
         },
         MessageKind::Error => {
            if let Some(sink) = &self.error {
               sink(text);
            }
         },
      }
   }

   /// Delivers a batch in order.
   pub fn dispatch(&self, target: &MessageTarget, messages: &[QueuedMessage]) {
      for message in messages {
         debug!("{}> {}", message.kind, message.payload);
         self.deliver(target, message);
      }
   }
}

#[cfg(test)]
mod tests {
   use std::thread;

   use super::*;

   fn device() -> ContainerId {
      "{A1B2C3D4-0000-1111-2222-333344445555}".parse().unwrap()
   }

   fn target() -> MessageTarget {
      MessageTarget {
         object: SmolStr::new_static("BluetoothLEReceiver"),
         method: SmolStr::new_static("OnBluetoothMessage"),
      }
   }

   #[test]
   fn test_wire_format() {
      let dev = device();
      let svc = AttrUuid::from_short(0x180F);
      let chr = AttrUuid::from_short(0x2A19);

      assert_eq!(
         BleEvent::DiscoveredPeripheral {
            device: dev,
            name: "Sensor".into()
         }
         .to_string(),
         "DiscoveredPeripheral~{A1B2C3D4-0000-1111-2222-333344445555}~Sensor"
      );
      assert_eq!(
         BleEvent::DiscoveredCharacteristic {
            device: dev,
            service: svc,
            characteristic: chr,
         }
         .to_string(),
         format!("DiscoveredCharacteristic~{dev}~{svc}~{chr}")
      );
      assert_eq!(
         BleEvent::DidUpdateValueForCharacteristic {
            device: dev,
            characteristic: chr,
            value: vec![0x01, 0x02, 0x03],
         }
         .to_string(),
         format!("DidUpdateValueForCharacteristic~{dev}~{chr}~AQID")
      );
      assert_eq!(
         BleEvent::DidUpdateNotificationStateForCharacteristic {
            device: dev,
            service: None,
            characteristic: chr,
         }
         .to_string(),
         format!("DidUpdateNotificationStateForCharacteristic~{dev}~{chr}")
      );
      assert_eq!(
         BleEvent::DidUpdateNotificationStateForCharacteristic {
            device: dev,
            service: Some(svc),
            characteristic: chr,
         }
         .to_string(),
         format!("DidUpdateNotificationStateForCharacteristic~{dev}~{svc}~{chr}")
      );
      assert_eq!(BleEvent::Initialized.to_string(), "Initialized");
      assert_eq!(BleEvent::Error("boom".into()).to_string(), "Error~boom");
   }

   #[test]
   fn test_report_pairs_message_with_error_channel() {
      let queue = EventQueue::shared();
      queue.report(&BridgeError::not_found("device X to read from."));

      let drained = queue.drain();
      assert_eq!(
         drained,
         vec![
            QueuedMessage::new(MessageKind::Message, "Error~Could not find device X to read from."),
            QueuedMessage::new(MessageKind::Error, "Could not find device X to read from."),
         ]
      );
      assert!(queue.is_empty());
   }

   #[test]
   fn test_dispatch_routes_by_kind_and_skips_empty_slots() {
      let seen = Arc::new(Mutex::new(Vec::<String>::new()));
      let sinks = HostSinks {
         message: Some(Box::new({
            let seen = seen.clone();
            move |obj: &str, method: &str, msg: &str| seen.lock().push(format!("{obj}.{method}:{msg}"))
         })),
         error: Some(Box::new({
            let seen = seen.clone();
            move |msg: &str| seen.lock().push(format!("error:{msg}"))
         })),
         ..Default::default()
      };

      let queue = EventQueue::shared();
      queue.send(BleEvent::Initialized);
      queue.log("hello");
      queue.warn("careful");
      queue.report(&BridgeError::missing("address"));
      sinks.dispatch(&target(), &queue.drain());

      assert_eq!(
         *seen.lock(),
         vec![
            "BluetoothLEReceiver.OnBluetoothMessage:Initialized".to_owned(),
            "BluetoothLEReceiver.OnBluetoothMessage:Error~Invalid address: empty".to_owned(),
            "error:Invalid address: empty".to_owned(),
         ]
      );
   }

   #[test]
   fn test_concurrent_producers_keep_their_own_order() {
      const PRODUCERS: usize = 4;
      const PER_PRODUCER: usize = 500;

      let queue = EventQueue::shared();
      let mut received = Vec::new();

      thread::scope(|s| {
         for p in 0..PRODUCERS {
            let queue = &queue;
            s.spawn(move || {
               for i in 0..PER_PRODUCER {
                  queue.log(format!("{p}:{i}"));
               }
            });
         }
         // Drain while the producers are still running.
         for _ in 0..50 {
            received.extend(queue.drain());
            thread::yield_now();
         }
      });
      received.extend(queue.drain());

      assert_eq!(received.len(), PRODUCERS * PER_PRODUCER);
      let mut next = [0usize; PRODUCERS];
      for message in &received {
         let (p, i) = message.payload.split_once(':').unwrap();
         let (p, i): (usize, usize) = (p.parse().unwrap(), i.parse().unwrap());
         assert_eq!(i, next[p], "producer {p} reordered");
         next[p] += 1;
      }
   }
}

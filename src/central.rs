//! Session context and the host command surface.
//!
//! A [`Central`] is what the host holds between `initialize` and
//! `deinitialize`. Commands take string identifiers the way the host sends
//! them, never return errors, and report everything through the event
//! queue; the host sees results only when it pumps.

use std::{
   collections::HashSet,
   sync::{
      Arc,
      atomic::{AtomicBool, Ordering},
   },
};

use log::{debug, info};
use parking_lot::{Mutex, RwLock};

use crate::{
   bluetooth::{
      Adapter,
      manager::{ConnectionManager, ConnectionState},
   },
   error::Result,
   event::{BleEvent, EventQueue, EventSender, HostSinks, MessageKind, MessageTarget, QueuedMessage},
   gatt::{
      directory::{CharacteristicKey, Directory, ServiceKey},
      ids::{AttrUuid, ContainerId, UuidList, parse_uuid_list},
      subscription::SubscriptionRegistry,
   },
};

/// Everything host commands mutate, guarded by one lock.
#[derive(Debug)]
struct Registry {
   directory: Directory,
   connections: ConnectionManager,
   subscriptions: SubscriptionRegistry,
}

/// A Bluetooth LE central session.
///
/// Identifiers in outgoing events are canonical, not echoed: devices as
/// braced upper-case GUIDs, services and characteristics as upper-case
/// hyphenated UUIDs. A host that sent `a1b2...` or `180f` gets
/// `{A1B2...}` or `0000180F-0000-1000-8000-00805F9B34FB` back and should
/// compare ids in that form.
pub struct Central {
   adapter: Arc<dyn Adapter>,
   events: EventSender,
   registry: Mutex<Registry>,
   sinks: RwLock<Arc<HostSinks>>,
   target: MessageTarget,
   initialized: AtomicBool,
   paused: AtomicBool,
}

impl Central {
   pub fn new(adapter: Arc<dyn Adapter>, target: MessageTarget) -> Self {
      let events = EventQueue::shared();
      Self {
         registry: Mutex::new(Registry {
            directory: Directory::new(),
            connections: ConnectionManager::new(),
            subscriptions: SubscriptionRegistry::new(&events),
         }),
         adapter,
         events,
         sinks: RwLock::new(Arc::new(HostSinks::default())),
         target,
         initialized: AtomicBool::new(false),
         paused: AtomicBool::new(false),
      }
   }

   pub fn events(&self) -> &EventSender {
      &self.events
   }

   pub fn is_initialized(&self) -> bool {
      self.initialized.load(Ordering::Acquire)
   }

   /// Runs a command under the registry lock and reports its failure.
   fn run<F>(&self, command: &str, op: F)
   where
      F: FnOnce(&mut Registry, &dyn Adapter, &EventQueue) -> Result<()>,
   {
      debug!("command: {command}");
      let mut registry = self.registry.lock();
      if let Err(e) = op(&mut registry, self.adapter.as_ref(), &self.events) {
         self.events.report(&e);
      }
   }

   // === Lifecycle ===

   pub fn initialize(&self) {
      self.initialized.store(true, Ordering::Release);
      info!("Central initialized");
      self.events.send(BleEvent::Initialized);
   }

   /// Disconnects everything, tells the host directly, then drops all
   /// state including whatever is still queued.
   pub fn deinitialize(&self) {
      self.disconnect_all();

      let sinks = self.sinks.read().clone();
      sinks.deliver(
         &self.target,
         &QueuedMessage::new(MessageKind::Message, BleEvent::DeInitialized.to_string()),
      );

      {
         let mut registry = self.registry.lock();
         registry.subscriptions.clear();
         registry.connections.clear();
         registry.directory.clear();
      }
      self.events.clear();
      self.initialized.store(false, Ordering::Release);
      info!("Central deinitialized");
   }

   pub fn set_sinks(&self, sinks: HostSinks) {
      debug!("Installing host sinks {sinks:?}");
      *self.sinks.write() = Arc::new(sinks);
   }

   pub fn clear_sinks(&self) {
      *self.sinks.write() = Arc::new(HostSinks::default());
   }

   /// Queues a host-originated line for the log sink.
   pub fn log(&self, message: &str) {
      self.events.log(message);
   }

   pub fn pause_messages(&self, paused: bool) {
      debug!("Messages {}", if paused { "paused" } else { "resumed" });
      self.paused.store(paused, Ordering::Release);
   }

   /// Drains the queue and hands every message to its sink, in order.
   /// Returns how many were delivered; nothing is drained while paused.
   pub fn pump(&self) -> usize {
      if self.paused.load(Ordering::Acquire) {
         return 0;
      }
      let messages = self.events.drain();
      if messages.is_empty() {
         return 0;
      }
      let sinks = self.sinks.read().clone();
      sinks.dispatch(&self.target, &messages);
      messages.len()
   }

   // === Discovery ===

   /// Refreshes the directory and announces peripherals. With a filter,
   /// only devices owning an unconnected service in the filter are
   /// announced; each device at most once per call.
   pub fn scan_for_peripherals(&self, filter: Option<&str>) {
      self.run("scan_for_peripherals", |registry, adapter, events| {
         let filter = parse_filter(filter)?;
         registry.directory.scan(adapter, events);
         registry.directory.link_services_to_devices(events);

         let Registry {
            directory,
            connections,
            ..
         } = registry;
         let mut announced = HashSet::new();
         match filter {
            Some(uuids) => {
               for service in directory.find_services_matching(&uuids) {
                  if connections.find(service.key()).is_some() {
                     continue;
                  }
                  if let Some(device) = service.device.and_then(|id| directory.device(id))
                     && announced.insert(device.id)
                  {
                     events.send(BleEvent::DiscoveredPeripheral {
                        device: device.id,
                        name: device.name.clone(),
                     });
                  }
               }
            },
            None => {
               for device in directory.devices() {
                  events.send(BleEvent::DiscoveredPeripheral {
                     device: device.id,
                     name: device.name.clone(),
                  });
               }
            },
         }
         Ok(())
      });
   }

   /// Announces devices that already own a connected service, optionally
   /// restricted to services in the filter.
   pub fn retrieve_connected_peripherals(&self, filter: Option<&str>) {
      self.run("retrieve_connected_peripherals", |registry, _, events| {
         let filter = parse_filter(filter)?;
         let mut announced = HashSet::new();
         for connected in registry.connections.iter() {
            let key = connected.key;
            if let Some(uuids) = &filter
               && !uuids.contains(&key.service)
            {
               continue;
            }
            if !announced.insert(key.device) {
               continue;
            }
            let name = registry
               .directory
               .device(key.device)
               .map(|d| d.name.clone())
               .unwrap_or_default();
            events.send(BleEvent::RetrievedConnectedPeripheral {
               device: key.device,
               name,
            });
         }
         Ok(())
      });
   }

   pub fn stop_scan(&self) {
      debug!("stop_scan: scanning is owned by the platform");
   }

   // === Connections ===

   pub fn connect_to_peripheral(&self, address: &str) {
      self.run("connect_to_peripheral", |registry, adapter, events| {
         let device: ContainerId = address.parse()?;
         registry
            .connections
            .connect(&registry.directory, adapter, events, device)
      });
   }

   pub fn disconnect_peripheral(&self, address: &str) {
      self.run("disconnect_peripheral", |registry, adapter, events| {
         let device: ContainerId = address.parse()?;
         registry
            .connections
            .disconnect(device, &mut registry.subscriptions, adapter, events);
         Ok(())
      });
   }

   pub fn disconnect_all(&self) {
      self.run("disconnect_all", |registry, adapter, events| {
         registry.connections.disconnect_all(
            &mut registry.directory,
            &mut registry.subscriptions,
            adapter,
            events,
         );
         Ok(())
      });
   }

   // === Attributes ===

   pub fn read_characteristic(&self, address: &str, service: &str, characteristic: &str) {
      self.run("read_characteristic", |registry, adapter, events| {
         let key = characteristic_key(address, service, characteristic)?;
         let value = registry.connections.read(adapter, key)?;
         events.send(BleEvent::DidUpdateValueForCharacteristic {
            device: key.device,
            characteristic: key.characteristic,
            value,
         });
         Ok(())
      });
   }

   pub fn write_characteristic(
      &self,
      address: &str,
      service: &str,
      characteristic: &str,
      data: &[u8],
      with_response: bool,
   ) {
      self.run("write_characteristic", |registry, adapter, _| {
         let key = characteristic_key(address, service, characteristic)?;
         registry.connections.write(adapter, key, data, with_response)
      });
   }

   pub fn subscribe_characteristic(&self, address: &str, service: &str, characteristic: &str) {
      self.run("subscribe_characteristic", |registry, adapter, events| {
         let key = characteristic_key(address, service, characteristic)?;
         registry
            .subscriptions
            .subscribe(&registry.connections, adapter, events, key)
      });
   }

   pub fn unsubscribe_characteristic(&self, address: &str, service: &str, characteristic: &str) {
      self.run("unsubscribe_characteristic", |registry, adapter, events| {
         let key = characteristic_key(address, service, characteristic)?;
         registry.subscriptions.unsubscribe(adapter, events, key)
      });
   }

   // === Introspection ===

   pub fn connection_state(&self, device: ContainerId, service: AttrUuid) -> ConnectionState {
      self.registry.lock().connections.state(ServiceKey { device, service })
   }

   pub fn device_count(&self) -> usize {
      self.registry.lock().directory.devices().len()
   }

   pub fn subscription_count(&self) -> usize {
      self.registry.lock().subscriptions.len()
   }
}

fn parse_filter(filter: Option<&str>) -> Result<Option<UuidList>> {
   match filter {
      Some(list) => {
         let uuids = parse_uuid_list(list)?;
         Ok((!uuids.is_empty()).then_some(uuids))
      },
      None => Ok(None),
   }
}

fn characteristic_key(address: &str, service: &str, characteristic: &str) -> Result<CharacteristicKey> {
   Ok(CharacteristicKey {
      device: address.parse()?,
      service: AttrUuid::parse_arg(service, "service uuid")?,
      characteristic: AttrUuid::parse_arg(characteristic, "characteristic uuid")?,
   })
}

#[cfg(test)]
mod tests {
   use std::thread;

   use smol_str::SmolStr;

   use super::*;
   use crate::bluetooth::sim::{SimAdapter, SimCharacteristic};

   const G1: &str = "{11111111-2222-3333-4444-555555555555}";
   const G2: &str = "{22222222-2222-3333-4444-555555555555}";
   const BATTERY: &str = "{0000180F-0000-1000-8000-00805F9B34FB}";
   const LEVEL: &str = "00002A19-0000-1000-8000-00805F9B34FB";

   /// Captures everything the sinks receive as `(kind, text)`.
   type Captured = Arc<Mutex<Vec<(MessageKind, String)>>>;

   fn target() -> MessageTarget {
      MessageTarget {
         object: SmolStr::new_static("BluetoothLEReceiver"),
         method: SmolStr::new_static("OnBluetoothMessage"),
      }
   }

   fn capture(central: &Central) -> Captured {
      let captured: Captured = Arc::default();
      let sink = |kind: MessageKind| {
         let captured = captured.clone();
         Box::new(move |text: &str| captured.lock().push((kind, text.to_owned())))
            as Box<dyn Fn(&str) + Send + Sync>
      };
      let messages = captured.clone();
      central.set_sinks(HostSinks {
         message: Some(Box::new(move |object: &str, method: &str, text: &str| {
            assert_eq!((object, method), ("BluetoothLEReceiver", "OnBluetoothMessage"));
            messages.lock().push((MessageKind::Message, text.to_owned()));
         })),
         log: Some(sink(MessageKind::Log)),
         warning: Some(sink(MessageKind::Warning)),
         error: Some(sink(MessageKind::Error)),
      });
      captured
   }

   fn messages(central: &Central, captured: &Captured) -> Vec<String> {
      central.pump();
      captured
         .lock()
         .drain(..)
         .filter(|(kind, _)| *kind == MessageKind::Message)
         .map(|(_, text)| text)
         .collect()
   }

   /// G1 "Sensor" with a battery service whose level is readable and
   /// notifiable, plus a write-only control point.
   fn sensor() -> (Arc<SimAdapter>, Central, Captured) {
      let adapter = Arc::new(SimAdapter::new());
      adapter.add_device_entry(G1, "Sensor");
      let path = adapter.add_service_entry(G1, BATTERY, r"BTHLEDEVICE\{0000180F}_Dev\7&1");
      adapter.add_characteristic(
         &path,
         SimCharacteristic::new(AttrUuid::from_short(0x2A19))
            .readable(&[0x64])
            .notifiable(),
      );
      adapter.add_characteristic(&path, SimCharacteristic::new(AttrUuid::from_short(0x2A1A)).writable());

      let central = Central::new(adapter.clone(), target());
      let captured = capture(&central);
      (adapter, central, captured)
   }

   fn g1() -> ContainerId {
      G1.parse().unwrap()
   }

   #[test]
   fn test_scan_connect_read() {
      let (_adapter, central, captured) = sensor();
      central.initialize();
      central.scan_for_peripherals(None);
      central.connect_to_peripheral(G1);
      central.read_characteristic(G1, "180F", "2A19");

      assert_eq!(messages(&central, &captured), vec![
         "Initialized".to_owned(),
         format!("DiscoveredPeripheral~{G1}~Sensor"),
         format!("ConnectedPeripheral~{G1}"),
         format!("DiscoveredService~{G1}~{}", &BATTERY[1..37]),
         format!("DiscoveredCharacteristic~{G1}~{}~{LEVEL}", &BATTERY[1..37]),
         format!(
            "DiscoveredCharacteristic~{G1}~{}~00002A1A-0000-1000-8000-00805F9B34FB",
            &BATTERY[1..37]
         ),
         format!("DidUpdateValueForCharacteristic~{G1}~{LEVEL}~ZA=="),
      ]);
      assert_eq!(
         central.connection_state(g1(), AttrUuid::from_short(0x180F)),
         ConnectionState::Ready
      );
   }

   #[test]
   fn test_events_echo_canonical_ids() {
      let (_adapter, central, captured) = sensor();
      central.scan_for_peripherals(None);
      central.connect_to_peripheral(&G1[1..37].to_lowercase());
      central.read_characteristic(&G1.to_lowercase(), "180f", "0x2a19");

      let messages = messages(&central, &captured);
      assert!(messages.contains(&format!("ConnectedPeripheral~{G1}")));
      assert_eq!(
         messages.last(),
         Some(&format!("DidUpdateValueForCharacteristic~{G1}~{LEVEL}~ZA=="))
      );
   }

   #[test]
   fn test_connect_with_no_openable_service_reports_not_found() {
      let (adapter, central, captured) = sensor();
      central.scan_for_peripherals(None);
      central.pump();
      captured.lock().clear();
      adapter.faults().fail_open = Some("Access is denied.".into());

      central.connect_to_peripheral(G1);
      central.pump();
      let kinds: Vec<_> = captured.lock().iter().map(|(kind, _)| *kind).collect();
      assert_eq!(kinds, vec![
         MessageKind::Message,
         MessageKind::Error,
         MessageKind::Message,
         MessageKind::Error,
      ]);
      assert_eq!(
         captured.lock()[3].1,
         format!("Could not find any service for device {G1}")
      );
      assert_eq!(
         central.connection_state(g1(), AttrUuid::from_short(0x180F)),
         ConnectionState::Disconnected
      );
   }

   #[test]
   fn test_scan_filter() {
      let (adapter, central, captured) = sensor();
      adapter.add_device_entry(G2, "Other");
      adapter.add_service_entry(G2, "{0000180A-0000-1000-8000-00805F9B34FB}", r"X\2");

      central.scan_for_peripherals(Some("180F"));
      assert_eq!(messages(&central, &captured), vec![format!(
         "DiscoveredPeripheral~{G1}~Sensor"
      )]);

      central.scan_for_peripherals(Some("180F|180A"));
      assert_eq!(messages(&central, &captured).len(), 2);

      central.connect_to_peripheral(G1);
      messages(&central, &captured);
      central.scan_for_peripherals(Some("180F"));
      assert!(messages(&central, &captured).is_empty());

      central.scan_for_peripherals(Some(""));
      assert_eq!(messages(&central, &captured).len(), 2);
   }

   #[test]
   fn test_retrieve_connected_peripherals() {
      let (_adapter, central, captured) = sensor();
      central.scan_for_peripherals(None);
      central.retrieve_connected_peripherals(None);
      messages(&central, &captured);

      central.connect_to_peripheral(G1);
      messages(&central, &captured);

      central.retrieve_connected_peripherals(Some("180A"));
      assert!(messages(&central, &captured).is_empty());
      central.retrieve_connected_peripherals(Some("180F"));
      assert_eq!(messages(&central, &captured), vec![format!(
         "RetrievedConnectedPeripheral~{G1}~Sensor"
      )]);
   }

   #[test]
   fn test_read_not_readable_emits_exactly_one_error() {
      let (adapter, central, captured) = sensor();
      central.scan_for_peripherals(None);
      central.connect_to_peripheral(G1);
      messages(&central, &captured);

      central.read_characteristic(G1, "180F", "2A1A");
      central.pump();
      let captured: Vec<_> = captured.lock().drain(..).collect();
      assert_eq!(captured, vec![
         (
            MessageKind::Message,
            "Error~Characteristic 00002A1A-0000-1000-8000-00805F9B34FB is not readable.".to_owned()
         ),
         (
            MessageKind::Error,
            "Characteristic 00002A1A-0000-1000-8000-00805F9B34FB is not readable.".to_owned()
         ),
      ]);
      assert_eq!(adapter.open_handles(), 1);
   }

   #[test]
   fn test_write_honours_with_response() {
      let (adapter, central, captured) = sensor();
      central.scan_for_peripherals(None);
      central.connect_to_peripheral(G1);
      central.write_characteristic(G1, "180F", "2A1A", &[1], true);
      central.write_characteristic(G1, "180F", "2A1A", &[2], false);

      let writes = adapter.writes();
      assert_eq!(writes.len(), 2);
      assert!(writes[0].with_response);
      assert!(!writes[1].with_response);
      assert!(
         !messages(&central, &captured)
            .iter()
            .any(|m| m.starts_with("Error~"))
      );
   }

   #[test]
   fn test_invalid_identifiers_are_reported() {
      let (_adapter, central, captured) = sensor();
      central.connect_to_peripheral("");
      central.read_characteristic(G1, "not-a-uuid", "2A19");

      let messages = messages(&central, &captured);
      assert_eq!(messages.len(), 2);
      assert_eq!(messages[0], "Error~Invalid address: empty");
      assert!(messages[1].starts_with("Error~Invalid service uuid: 'not-a-uuid'"));
   }

   #[test]
   fn test_read_on_unconnected_device_is_not_found() {
      let (_adapter, central, captured) = sensor();
      central.scan_for_peripherals(None);
      messages(&central, &captured);

      central.read_characteristic(G1, "180F", "2A19");
      assert_eq!(messages(&central, &captured), vec![format!(
         "Error~Could not find device {G1} to read from."
      )]);
   }

   #[test]
   fn test_subscribe_notify_unsubscribe() {
      let (adapter, central, captured) = sensor();
      central.scan_for_peripherals(None);
      central.connect_to_peripheral(G1);
      messages(&central, &captured);

      central.subscribe_characteristic(G1, "180F", "2A19");
      assert_eq!(central.subscription_count(), 1);

      // Value changes arrive on a driver thread while the host keeps
      // issuing commands.
      thread::scope(|s| {
         s.spawn(|| {
            for i in 0..10u8 {
               adapter.notify(AttrUuid::from_short(0x2A19), &[i]);
            }
         });
         for _ in 0..10 {
            central.read_characteristic(G1, "180F", "2A19");
         }
      });

      central.unsubscribe_characteristic(G1, "180F", "2A19");
      let messages = messages(&central, &captured);
      assert_eq!(
         messages.first(),
         Some(&format!("DidUpdateNotificationStateForCharacteristic~{G1}~{LEVEL}"))
      );
      assert_eq!(
         messages.last(),
         Some(&format!("DidUpdateNotificationStateForCharacteristic~{G1}~{LEVEL}"))
      );
      assert_eq!(
         messages
            .iter()
            .filter(|m| m.starts_with("DidUpdateValueForCharacteristic"))
            .count(),
         20
      );
      assert_eq!(central.subscription_count(), 0);
   }

   #[test]
   fn test_disconnect_cascades_subscriptions() {
      let (adapter, central, captured) = sensor();
      central.scan_for_peripherals(None);
      central.connect_to_peripheral(G1);
      central.subscribe_characteristic(G1, "180F", "2A19");
      messages(&central, &captured);

      central.disconnect_peripheral(G1);
      central.disconnect_peripheral(G1);
      assert_eq!(messages(&central, &captured), vec![
         format!(
            "DidUpdateNotificationStateForCharacteristic~{G1}~{}~{LEVEL}",
            &BATTERY[1..37]
         ),
         format!("DisconnectedPeripheral~{G1}"),
      ]);
      assert_eq!(adapter.registrations(), 0);
      assert_eq!(adapter.open_handles(), 0);
   }

   #[test]
   fn test_pause_keeps_messages_queued() {
      let (_adapter, central, captured) = sensor();
      central.pause_messages(true);
      central.initialize();
      central.log("hello");

      assert_eq!(central.pump(), 0);
      assert!(captured.lock().is_empty());
      assert_eq!(central.events().len(), 2);

      central.pause_messages(false);
      assert_eq!(central.pump(), 2);
      assert_eq!(captured.lock().clone(), vec![
         (MessageKind::Message, "Initialized".to_owned()),
         (MessageKind::Log, "hello".to_owned()),
      ]);
   }

   #[test]
   fn test_missing_sinks_drop_silently() {
      let (_adapter, central, _captured) = sensor();
      central.clear_sinks();
      central.initialize();
      assert_eq!(central.pump(), 1);
      assert!(central.events().is_empty());
   }

   #[test]
   fn test_deinitialize_delivers_directly_and_clears() {
      let (adapter, central, captured) = sensor();
      central.initialize();
      central.scan_for_peripherals(None);
      central.connect_to_peripheral(G1);
      central.subscribe_characteristic(G1, "180F", "2A19");
      messages(&central, &captured);

      central.log("pending");
      central.deinitialize();

      assert_eq!(captured.lock().clone(), vec![(MessageKind::Message, "DeInitialized".to_owned())]);
      assert!(central.events().is_empty());
      assert!(!central.is_initialized());
      assert_eq!(central.device_count(), 0);
      assert_eq!(central.subscription_count(), 0);
      assert_eq!(adapter.open_handles(), 0);
      assert_eq!(adapter.registrations(), 0);
   }
}

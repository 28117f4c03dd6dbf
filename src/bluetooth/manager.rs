//! Connection manager for GATT service endpoints.
//!
//! This module opens and closes service endpoint handles, drives service and
//! characteristic discovery, and owns the connected-service records that
//! reads, writes and subscriptions resolve against.

use log::{debug, info, warn};

use crate::{
   bluetooth::{Adapter, Characteristic, GattService, OsHandle, fetch::fetch},
   error::{BridgeError, Result},
   event::{BleEvent, EventQueue},
   gatt::{
      directory::{CharacteristicKey, Directory, ServiceKey},
      ids::{AttrUuid, ContainerId},
      subscription::SubscriptionRegistry,
   },
};

// === Connection state ===

/// Lifecycle of one service connection.
///
/// `Disconnected -> Connecting -> Discovering -> Ready`, and
/// `Ready -> Disconnecting -> Disconnected` on teardown. A service without a
/// record is `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ConnectionState {
   Disconnected,
   Connecting,
   Discovering,
   Ready,
   Disconnecting,
}

/// An opened service endpoint and what discovery found behind it.
#[derive(Debug)]
pub struct ConnectedService {
   pub key: ServiceKey,
   handle: OsHandle,
   pub gatt_service: Option<GattService>,
   pub characteristics: Vec<Characteristic>,
   pub state: ConnectionState,
}

impl ConnectedService {
   pub const fn handle(&self) -> &OsHandle {
      &self.handle
   }

   pub fn characteristic(&self, uuid: AttrUuid) -> Option<&Characteristic> {
      self.characteristics.iter().find(|c| c.uuid == uuid)
   }
}

// === Manager ===

/// Sole owner of the connected-service records.
#[derive(Debug, Default)]
pub struct ConnectionManager {
   connected: Vec<ConnectedService>,
}

impl ConnectionManager {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn find(&self, key: ServiceKey) -> Option<&ConnectedService> {
      self.connected.iter().find(|c| c.key == key)
   }

   fn find_mut(&mut self, key: ServiceKey) -> Option<&mut ConnectedService> {
      self.connected.iter_mut().find(|c| c.key == key)
   }

   pub fn iter(&self) -> impl Iterator<Item = &ConnectedService> {
      self.connected.iter()
   }

   pub fn len(&self) -> usize {
      self.connected.len()
   }

   pub fn is_empty(&self) -> bool {
      self.connected.is_empty()
   }

   pub fn state(&self, key: ServiceKey) -> ConnectionState {
      self
         .find(key)
         .map_or(ConnectionState::Disconnected, |c| c.state)
   }

   /// Resolves a connected characteristic for a read, write or subscribe.
   /// `purpose` completes the not-found messages, e.g. `"to read from."`.
   pub fn resolve(
      &self,
      key: CharacteristicKey,
      purpose: &str,
   ) -> Result<(&ConnectedService, &Characteristic)> {
      let connected = self.find(key.service_key()).ok_or_else(|| {
         BridgeError::not_found(format!("device {} {purpose}", key.device))
      })?;
      let characteristic = connected.characteristic(key.characteristic).ok_or_else(|| {
         BridgeError::not_found(format!("characteristic {} {purpose}", key.characteristic))
      })?;
      Ok((connected, characteristic))
   }

   /// Connects to the first service of `device` that opens, then discovers
   /// its GATT service and characteristics.
   ///
   /// Other services of the same device are left alone. Open and discovery
   /// failures are reported here. `NotFound` is returned when no service
   /// could be opened and none was already connected.
   pub fn connect(
      &mut self,
      directory: &Directory,
      adapter: &dyn Adapter,
      events: &EventQueue,
      device: ContainerId,
   ) -> Result<()> {
      let mut already_connected = false;

      for service in directory.services_for(device) {
         let key = service.key();
         if self.find(key).is_some() {
            already_connected = true;
            debug!("Service {} of {device} is already connected", service.uuid);
            continue;
         }

         debug!("{key:?}: {} -> {}", ConnectionState::Disconnected, ConnectionState::Connecting);
         let handle = match adapter.open_endpoint(&service.path) {
            Ok(handle) => handle,
            Err(e) => {
               events.report(&BridgeError::os_api(
                  format!("Could not open service {} of device {device}", service.uuid),
                  e,
               ));
               continue;
            },
         };

         info!("Opened service {} of {device}", service.uuid);
         self.connected.push(ConnectedService {
            key,
            handle,
            gatt_service: None,
            characteristics: Vec::new(),
            state: ConnectionState::Connecting,
         });
         events.send(BleEvent::ConnectedPeripheral(device));

         match self.discover(key, adapter, events) {
            Ok(()) => {},
            Err(e @ (BridgeError::ProtocolMismatch { .. } | BridgeError::NoCharacteristics(_))) => {
               events.report(&e);
            },
            Err(e) => {
               events.report(&e);
               if self.close(key, adapter, events) {
                  events.send(BleEvent::DisconnectedPeripheral(device));
               }
            },
         }
         return Ok(());
      }

      if already_connected {
         events.warn(format!("Peripheral {device} is already connected"));
         Ok(())
      } else {
         Err(BridgeError::not_found(format!("any service for device {device}")))
      }
   }

   fn discover(&mut self, key: ServiceKey, adapter: &dyn Adapter, events: &EventQueue) -> Result<()> {
      let Some(connected) = self.find_mut(key) else {
         return Ok(());
      };
      connected.state = ConnectionState::Discovering;
      let handle = &connected.handle;

      let what = "Could not retrieve service GATT info";
      let services = fetch(what, |buf| adapter.fetch_services(handle, buf))?;
      // Each endpoint exposes exactly one service; the first entry is it.
      let gatt = *services
         .first()
         .ok_or_else(|| BridgeError::os_api(what, "no service reported"))?;
      connected.gatt_service = Some(gatt);

      if gatt.uuid != key.service {
         return Err(BridgeError::ProtocolMismatch {
            expected: key.service,
            found: gatt.uuid,
         });
      }
      events.send(BleEvent::DiscoveredService {
         device: key.device,
         service: gatt.uuid,
      });

      let characteristics = fetch("Could not retrieve service characteristics", |buf| {
         adapter.fetch_characteristics(handle, &gatt, buf)
      })?;
      for characteristic in &characteristics {
         events.send(BleEvent::DiscoveredCharacteristic {
            device: key.device,
            service: gatt.uuid,
            characteristic: characteristic.uuid,
         });
      }

      connected.characteristics = characteristics;
      connected.state = ConnectionState::Ready;
      debug!("{key:?}: {}", connected.state);

      if connected.characteristics.is_empty() {
         return Err(BridgeError::NoCharacteristics(key.device));
      }
      Ok(())
   }

   /// Reads a characteristic value.
   pub fn read(&self, adapter: &dyn Adapter, key: CharacteristicKey) -> Result<Vec<u8>> {
      let (connected, characteristic) = self.resolve(key, "to read from.")?;
      if !characteristic.is_readable {
         return Err(BridgeError::NotReadable(key.characteristic));
      }

      let value = fetch(
         &format!("Could not get characteristic {} value", key.characteristic),
         |buf| adapter.fetch_characteristic_value(connected.handle(), characteristic, buf),
      )?;
      debug!("← {} {}: {}", key.device, key.characteristic, hex::encode(&value));
      Ok(value)
   }

   /// Writes a characteristic value.
   pub fn write(
      &self,
      adapter: &dyn Adapter,
      key: CharacteristicKey,
      value: &[u8],
      with_response: bool,
   ) -> Result<()> {
      let (connected, characteristic) = self.resolve(key, "to write to.")?;
      debug!("→ {} {}: {}", key.device, key.characteristic, hex::encode(value));
      adapter
         .set_characteristic_value(connected.handle(), characteristic, value, with_response)
         .map_err(|e| {
            BridgeError::os_api(
               format!("Could not write characteristic value for {}", key.characteristic),
               e,
            )
         })
   }

   /// Closes the handle of one record. The record is dropped only if the
   /// close succeeds; otherwise it stays for a later retry.
   fn close(&mut self, key: ServiceKey, adapter: &dyn Adapter, events: &EventQueue) -> bool {
      let Some(idx) = self.connected.iter().position(|c| c.key == key) else {
         return false;
      };
      self.connected[idx].state = ConnectionState::Disconnecting;
      match adapter.close_endpoint(&self.connected[idx].handle) {
         Ok(()) => {
            self.connected.remove(idx);
            info!("Closed service {} of {}", key.service, key.device);
            true
         },
         Err(e) => {
            events.report(&BridgeError::os_api(
               format!("Could not close handle to device {}", key.device),
               e,
            ));
            false
         },
      }
   }

   /// Tears down every connected service of `device`: subscriptions first,
   /// then the handle. Emits one `DisconnectedPeripheral` if at least one
   /// record was removed, and returns whether that happened.
   pub fn disconnect(
      &mut self,
      device: ContainerId,
      subscriptions: &mut SubscriptionRegistry,
      adapter: &dyn Adapter,
      events: &EventQueue,
   ) -> bool {
      let keys: Vec<ServiceKey> = self
         .connected
         .iter()
         .filter(|c| c.key.device == device)
         .map(|c| c.key)
         .collect();

      let mut removed = false;
      for key in keys {
         subscriptions.unregister_for_service(key, adapter, events);
         removed |= self.close(key, adapter, events);
      }

      if removed {
         events.send(BleEvent::DisconnectedPeripheral(device));
      } else {
         debug!("Nothing disconnected for {device}");
      }
      removed
   }

   /// Disconnects every known device, and any device still owning a
   /// connection, then forgets all devices.
   pub fn disconnect_all(
      &mut self,
      directory: &mut Directory,
      subscriptions: &mut SubscriptionRegistry,
      adapter: &dyn Adapter,
      events: &EventQueue,
   ) {
      let mut devices: Vec<ContainerId> = directory.devices().iter().map(|d| d.id).collect();
      for connected in &self.connected {
         if !devices.contains(&connected.key.device) {
            devices.push(connected.key.device);
         }
      }

      for device in devices {
         self.disconnect(device, subscriptions, adapter, events);
      }
      directory.clear_devices();
   }

   /// Forgets every record without closing anything. Used after a
   /// disconnect sweep, when whatever is left could not be closed.
   pub fn clear(&mut self) {
      if !self.connected.is_empty() {
         warn!(
            "Dropping {} connected services whose handles could not be closed",
            self.connected.len()
         );
      }
      self.connected.clear();
   }
}
